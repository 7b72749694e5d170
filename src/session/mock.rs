//! In-memory session factory
//!
//! Sessions never touch the network. Failures, probe results and connect
//! latency are scripted per endpoint, and every call is counted so tests
//! can assert on what actually reached the "transport".

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{ConnectOptions, Credentials, ProtocolSession, SessionError, SessionFactory};

#[derive(Debug, Default)]
struct MockState {
    connect_attempts: AtomicUsize,
    sessions_created: AtomicUsize,
    sessions_closed: AtomicUsize,
    transports_closed: AtomicUsize,
    probes: AtomicUsize,
    fail_session_close: AtomicBool,
    unreachable: Mutex<HashSet<String>>,
    rejecting: Mutex<HashSet<String>>,
    unhealthy: Mutex<HashSet<String>>,
    connect_delay: Mutex<Option<Duration>>,
    probe_delay: Mutex<HashMap<String, Duration>>,
}

fn contains(set: &Mutex<HashSet<String>>, endpoint: &str) -> bool {
    set.lock().unwrap_or_else(PoisonError::into_inner).contains(endpoint)
}

fn set_flag(set: &Mutex<HashSet<String>>, endpoint: &str, on: bool) {
    let mut set = set.lock().unwrap_or_else(PoisonError::into_inner);
    if on {
        set.insert(endpoint.to_string());
    } else {
        set.remove(endpoint);
    }
}

/// Scriptable [`SessionFactory`]; clones share the same script and counters
#[derive(Debug, Clone, Default)]
pub struct MockSessionFactory {
    state: Arc<MockState>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make transport connects to `endpoint` fail (or succeed again)
    pub fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        set_flag(&self.state.unreachable, endpoint, unreachable);
    }

    /// Make session creation on `endpoint` fail after the transport connects
    pub fn set_rejecting_sessions(&self, endpoint: &str, rejecting: bool) {
        set_flag(&self.state.rejecting, endpoint, rejecting);
    }

    /// Make probes of sessions on `endpoint` fail (or pass again)
    pub fn set_unhealthy(&self, endpoint: &str, unhealthy: bool) {
        set_flag(&self.state.unhealthy, endpoint, unhealthy);
    }

    /// Delay every transport connect by `delay`
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.state.connect_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Stall probes of sessions on `endpoint` for `delay` before they answer
    pub fn set_probe_delay(&self, endpoint: &str, delay: Option<Duration>) {
        let mut delays = self.state.probe_delay.lock().unwrap_or_else(PoisonError::into_inner);
        match delay {
            Some(delay) => delays.insert(endpoint.to_string(), delay),
            None => delays.remove(endpoint),
        };
    }

    /// Make `close_session` fail; `close_transport` is unaffected
    pub fn set_fail_session_close(&self, fail: bool) {
        self.state.fail_session_close.store(fail, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> usize {
        self.state.sessions_created.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn transports_closed(&self) -> usize {
        self.state.transports_closed.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn connect(
        &self,
        endpoint: &str,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn ProtocolSession>, SessionError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.connect_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if contains(&self.state.unreachable, endpoint) {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} refused the connection", endpoint),
            )));
        }

        Ok(Box::new(MockSession {
            endpoint: endpoint.to_string(),
            state: Arc::clone(&self.state),
            session_open: AtomicBool::new(false),
            transport_open: AtomicBool::new(true),
        }))
    }
}

struct MockSession {
    endpoint: String,
    state: Arc<MockState>,
    session_open: AtomicBool,
    transport_open: AtomicBool,
}

#[async_trait]
impl ProtocolSession for MockSession {
    async fn create_session(&self, _credentials: &Credentials) -> Result<(), SessionError> {
        if contains(&self.state.rejecting, &self.endpoint) {
            return Err(SessionError::Session(format!(
                "{} rejected the session",
                self.endpoint
            )));
        }
        self.session_open.store(true, Ordering::SeqCst);
        self.state.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> Result<(), SessionError> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .state
            .probe_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.endpoint)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.transport_open.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        if contains(&self.state.unhealthy, &self.endpoint) {
            return Err(SessionError::Session("probe failed".to_string()));
        }
        Ok(())
    }

    async fn close_session(&self) -> Result<(), SessionError> {
        if self.state.fail_session_close.load(Ordering::SeqCst) {
            return Err(SessionError::Session("close session failed".to_string()));
        }
        if self.session_open.swap(false, Ordering::SeqCst) {
            self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }

    async fn close_transport(&self) -> Result<(), SessionError> {
        if self.transport_open.swap(false, Ordering::SeqCst) {
            self.state.transports_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}
