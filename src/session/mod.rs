//! Protocol session seam
//!
//! The pool never speaks the industrial protocol itself. It opens and
//! probes sessions through the [`SessionFactory`] / [`ProtocolSession`]
//! traits defined here, which lets the wire implementation be swapped:
//!
//! - [`tcp::TcpSessionFactory`]: transport-level sessions over TCP
//! - [`mock::MockSessionFactory`]: scriptable in-memory sessions for tests

pub mod mock;
pub mod tcp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use mock::MockSessionFactory;
pub use tcp::TcpSessionFactory;

/// Errors raised by a protocol session or its transport
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid endpoint URL {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Session is closed")]
    Closed,
}

/// Credentials presented when creating a logical session
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }
}

// Never print the password
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// One endpoint the pool may connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint URL (e.g. "opc.tcp://plc-1.local:4840")
    pub url: String,

    #[serde(flatten)]
    pub credentials: Credentials,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: Credentials::anonymous(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Options handed to the transport when it opens a connection.
///
/// `retry_attempts` and `retry_delay` drive the transport's own reconnect
/// strategy; the pool does not retry on top of it.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

/// A transport connection plus the logical session layered on top of it
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Create the logical session on an already connected transport
    async fn create_session(&self, credentials: &Credentials) -> Result<(), SessionError>;

    /// Lightweight liveness check
    async fn probe(&self) -> Result<(), SessionError>;

    /// Close the logical session
    async fn close_session(&self) -> Result<(), SessionError>;

    /// Close the underlying transport
    async fn close_transport(&self) -> Result<(), SessionError>;
}

/// Opens transport connections to endpoints
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn ProtocolSession>, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::user("operator", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("operator"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_endpoint_config_flattened_credentials() {
        let yaml = r#"
url: opc.tcp://plc-1:4840
username: operator
password: secret
"#;
        let endpoint: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(endpoint.url, "opc.tcp://plc-1:4840");
        assert_eq!(endpoint.credentials.username.as_deref(), Some("operator"));

        let anonymous: EndpointConfig = serde_yaml::from_str("url: opc.tcp://plc-2:4840").unwrap();
        assert!(anonymous.credentials.is_anonymous());
    }
}
