use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::pool::{ConnectionPool, PoolError, PooledConnection};
use crate::session::{SessionFactory, TcpSessionFactory};

/// Application core: the loaded configuration and the pool built from it
///
/// Clones share the same pool.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub pool: ConnectionPool,
}

impl Core {
    /// Build a pool over plain TCP transports
    pub fn new(config: Config) -> Result<Self> {
        Self::with_factory(config, Arc::new(TcpSessionFactory::new()))
    }

    pub fn with_factory(config: Config, factory: Arc<dyn SessionFactory>) -> Result<Self> {
        config.validate()?;

        let pool = ConnectionPool::new(config.pool_config()?, config.breaker_config()?, factory)?;
        pool.register_endpoints(&config.endpoints);

        Ok(Self {
            config: Arc::new(config),
            pool,
        })
    }

    /// Open the configured minimum of connections and start health checks
    pub async fn warm(&self) -> Result<usize> {
        let created = self.pool.initialize(&self.config.endpoints).await?;
        if created < self.config.pool.min_connections.min(self.config.endpoints.len()) {
            tracing::warn!(
                created = created,
                min_connections = self.config.pool.min_connections,
                "Pool warmed below its minimum"
            );
        }
        Ok(created)
    }

    pub async fn connect(&self, endpoint: &str) -> Result<PooledConnection, PoolError> {
        self.pool.get_connection(endpoint).await
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Credentials, EndpointConfig, MockSessionFactory};

    fn config() -> Config {
        let mut config = Config::new();
        config.endpoints = vec![
            EndpointConfig::new("opc.tcp://plc-1:4840")
                .with_credentials(Credentials::user("operator", "secret")),
            EndpointConfig::new("opc.tcp://plc-2:4840"),
        ];
        config.pool.min_connections = 1;
        config
    }

    #[tokio::test]
    async fn test_core_warm_and_shutdown() {
        let factory = MockSessionFactory::new();
        let core = Core::with_factory(config(), Arc::new(factory.clone())).unwrap();

        assert_eq!(core.warm().await.unwrap(), 1);
        let conn = core.connect("opc.tcp://plc-2:4840").await.unwrap();
        assert_eq!(conn.endpoint(), "opc.tcp://plc-2:4840");
        assert_eq!(core.pool.size().await, 2);

        core.shutdown().await;
        assert_eq!(core.pool.size().await, 0);
        assert_eq!(factory.transports_closed(), 2);
    }

    #[test]
    fn test_core_rejects_invalid_config() {
        let factory = Arc::new(MockSessionFactory::new());
        assert!(Core::with_factory(Config::new(), factory).is_err());
    }
}
