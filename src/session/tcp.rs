//! Transport-level sessions over plain TCP
//!
//! Opens a keep-alive TCP stream to `opc.tcp://host:port` endpoints and
//! tracks the logical session on top of it. Message encoding is left to
//! the protocol layer that sits above the pool.

use async_trait::async_trait;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ConnectOptions, Credentials, ProtocolSession, SessionError, SessionFactory};

/// Default port for `opc.tcp` endpoints
pub const DEFAULT_PORT: u16 = 4840;

/// Resolve an endpoint URL to a `host:port` socket address string
pub fn endpoint_address(endpoint: &str) -> Result<String, SessionError> {
    let invalid = |reason: &str| SessionError::InvalidEndpoint {
        url: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let url = url::Url::parse(endpoint).map_err(|e| invalid(&e.to_string()))?;
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = url.port().unwrap_or(DEFAULT_PORT);

    Ok(format!("{}:{}", host, port))
}

/// Factory for [`TcpSession`]s
#[derive(Debug, Clone, Default)]
pub struct TcpSessionFactory;

impl TcpSessionFactory {
    pub fn new() -> Self {
        Self
    }

    async fn connect_once(addr: &str, options: &ConnectOptions) -> Result<TcpStream, SessionError> {
        let stream = tokio::time::timeout(options.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::Timeout(options.timeout))??;

        // Configure TCP keep-alive
        let socket = socket2::Socket::from(stream.into_std()?);
        socket.set_keepalive(true)?;
        let stream = TcpStream::from_std(socket.into())?;
        stream.set_nodelay(true)?;

        Ok(stream)
    }
}

#[async_trait]
impl SessionFactory for TcpSessionFactory {
    async fn connect(
        &self,
        endpoint: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn ProtocolSession>, SessionError> {
        let addr = endpoint_address(endpoint)?;
        let mut attempt = 0;

        loop {
            match Self::connect_once(&addr, options).await {
                Ok(stream) => {
                    debug!(endpoint = %endpoint, attempt = attempt, "Transport connected");
                    return Ok(Box::new(TcpSession::new(endpoint.to_string(), stream)));
                }
                Err(e) if attempt < options.retry_attempts => {
                    attempt += 1;
                    debug!(
                        endpoint = %endpoint,
                        attempt = attempt,
                        error = %e,
                        "Transport connect failed, retrying"
                    );
                    tokio::time::sleep(options.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A TCP transport with a logical session flag on top
pub struct TcpSession {
    endpoint: String,
    stream: Mutex<Option<TcpStream>>,
    active: AtomicBool,
}

impl TcpSession {
    fn new(endpoint: String, stream: TcpStream) -> Self {
        Self {
            endpoint,
            stream: Mutex::new(Some(stream)),
            active: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProtocolSession for TcpSession {
    async fn create_session(&self, credentials: &Credentials) -> Result<(), SessionError> {
        if self.stream.lock().await.is_none() {
            return Err(SessionError::Closed);
        }

        self.active.store(true, Ordering::Release);

        info!(
            endpoint = %self.endpoint,
            user = credentials.username.as_deref().unwrap_or("anonymous"),
            "Session created"
        );
        Ok(())
    }

    async fn probe(&self) -> Result<(), SessionError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }

        let guard = self.stream.lock().await;
        let stream = guard.as_ref().ok_or(SessionError::Closed)?;
        stream.peer_addr()?;

        // Peek without waiting: pending means idle but alive, zero bytes means EOF
        let mut buf = [0u8; 1];
        match stream.peek(&mut buf).now_or_never() {
            None => Ok(()),
            Some(Ok(0)) => Err(SessionError::Closed),
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(SessionError::Io(e)),
        }
    }

    async fn close_session(&self) -> Result<(), SessionError> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Err(SessionError::Closed);
        }
        debug!(endpoint = %self.endpoint, "Session closed");
        Ok(())
    }

    async fn close_transport(&self) -> Result<(), SessionError> {
        let stream = self.stream.lock().await.take();
        match stream {
            Some(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    warn!(endpoint = %self.endpoint, error = %e, "Transport shutdown error");
                    return Err(SessionError::Io(e));
                }
                debug!(endpoint = %self.endpoint, "Transport closed");
                Ok(())
            }
            None => Err(SessionError::Closed),
        }
    }
}
