// src/registry.rs

//! Connection registry.
//!
//! Holds every named connection, creates them from configuration, and is
//! the lookup and broadcast surface for the rest of the system. An explicit
//! object constructed once at startup and passed by reference — there is no
//! global state.

use std::sync::Mutex;

use crate::connection::lock_ignore_poison;
use crate::{
    //
    log_debug,
    log_error,
    AmqpConfig,
    Connection,
    ConnectionConfig,
    Error,
    Result,
    TransportPtr,
};

/// Registry of named connections.
pub struct Registry {
    transport: TransportPtr,
    auto_connect: bool,

    /// Connection definitions not yet instantiated.
    configs: Mutex<Vec<ConnectionConfig>>,

    /// Instantiated connections, in registration order; the first one is the
    /// default for unnamed lookups.
    connections: Mutex<Vec<Connection>>,
}

impl Registry {
    /// Create a registry over a transport.
    ///
    /// Connection definitions from `config` are instantiated lazily by
    /// [`connect`](Registry::connect), which is invoked immediately when the
    /// global auto-connect flag is set. Must be called within a Tokio
    /// runtime.
    pub fn new(config: AmqpConfig, transport: TransportPtr) -> Self {
        let registry = Self {
            transport,
            auto_connect: config.auto_connect,
            configs: Mutex::new(config.connections),
            connections: Mutex::new(Vec::new()),
        };

        if registry.auto_connect {
            registry.connect();
        }

        registry
    }

    /// Bring the registry's connections up.
    ///
    /// The first call instantiates connections from the configuration, each
    /// connecting according to the auto-connect flags. Later calls initiate
    /// a connect on every registered connection.
    pub fn connect(&self) {
        log_debug!("creating connections..");

        let instantiated = !lock_ignore_poison(&self.connections).is_empty();

        if !instantiated {
            let pending: Vec<ConnectionConfig> =
                lock_ignore_poison(&self.configs).drain(..).collect();

            for config in pending {
                if let Err(err) = self.add_connection(config) {
                    log_error!("skipping connection: {err}");
                }
            }
        } else {
            for connection in lock_ignore_poison(&self.connections).iter() {
                let connection = connection.clone();
                tokio::spawn(async move { connection.connect().await });
            }
        }
    }

    /// Construct a connection and register it by name.
    ///
    /// Connecting starts immediately when the global or per-connection
    /// auto-connect flag is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateConnection`] when the name is already
    /// registered; names must be unique so lookup stays deterministic.
    pub fn add_connection(&self, config: ConnectionConfig) -> Result<Connection> {
        if let Some(name) = &config.name {
            let connections = lock_ignore_poison(&self.connections);
            if connections.iter().any(|existing| existing.name() == name) {
                return Err(Error::DuplicateConnection(name.clone()));
            }
        }

        log_debug!(
            "creating connection to broker \"{}\"",
            config.name.as_deref().unwrap_or("#0")
        );

        // Per-connection auto-connect is honored by the constructor.
        let connection = Connection::new(config, self.transport.clone());

        if self.auto_connect && !connection.config().auto_connect {
            let auto = connection.clone();
            tokio::spawn(async move { auto.connect().await });
        }

        lock_ignore_poison(&self.connections).push(connection.clone());

        Ok(connection)
    }

    /// Look up a connection by name, or the first registered one when no
    /// name is given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] when the name is unknown or no
    /// connections exist.
    pub fn get(&self, name: Option<&str>) -> Result<Connection> {
        let connections = lock_ignore_poison(&self.connections);

        let found = match name {
            Some(name) => connections
                .iter()
                .find(|connection| connection.name() == name),
            None => connections.first(),
        };

        found
            .cloned()
            .ok_or_else(|| Error::ConnectionNotFound(name.unwrap_or("#0").to_string()))
    }

    /// All registered connections, in registration order.
    pub fn connections(&self) -> Vec<Connection> {
        lock_ignore_poison(&self.connections).clone()
    }

    /// Disconnect every registered connection, completing when all have
    /// fully disconnected.
    pub async fn disconnect_all(&self) {
        for connection in self.connections() {
            log_debug!("disconnecting from broker \"{}\"", connection.name());
            connection.disconnect().await;
        }

        log_debug!("all connections have been disconnected");
    }

    /// Tear down the declared resources of every registered connection.
    pub async fn tear_down_all(&self) -> Result<()> {
        for connection in self.connections() {
            connection.tear_down().await?;
        }
        Ok(())
    }
}
