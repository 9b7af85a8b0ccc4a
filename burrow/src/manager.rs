//! Named connections shared by an application

use burrow_core::executor::sqlx_pool::SqlxPool;
use burrow_core::{Connection, ConnectionConfig, Error, Pool, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// Registry of connections keyed by name.
///
/// The first registration of a name wins; later ones are ignored.
pub struct Manager<P: Pool> {
    items: BTreeMap<String, Connection<P>>,
}

impl<P: Pool> Default for Manager<P> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<P: Pool> Manager<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` under `name` unless the name is taken
    pub fn add(&mut self, name: impl Into<String>, connection: Connection<P>) -> &mut Self {
        let name = name.into();
        if !self.items.contains_key(&name) {
            debug!(target: burrow_core::connection::LOG_TARGET, "Registered connection {}", name);
            self.items.insert(name, connection);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<Connection<P>> {
        self.items.get(name).cloned()
    }

    /// Like [`Manager::get`], failing when the name is unknown
    pub fn require(&self, name: &str) -> Result<Connection<P>> {
        self.get(name).ok_or_else(|| {
            Error::invalid_argument(format!("Connection '{}' is not registered.", name))
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.items.keys().map(String::as_str).collect()
    }
}

impl Manager<SqlxPool> {
    /// Open and register one sqlx-backed connection per config
    pub async fn connect_all<I>(&mut self, configs: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (String, ConnectionConfig)>,
    {
        for (name, config) in configs {
            if self.has(&name) {
                continue;
            }
            let connection = Connection::connect(config).await?;
            self.add(name, connection);
        }
        Ok(self)
    }
}
