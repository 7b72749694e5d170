//! opcpool - Connection pool for industrial protocol endpoints with
//! per-endpoint circuit breaking, health probing and idle eviction

pub mod cli;
pub mod config;
pub mod core;
pub mod pool;
pub mod session;

pub use config::Config;
pub use crate::core::Core;
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolEvent, PooledConnection};
pub use session::{Credentials, EndpointConfig, TcpSessionFactory};
