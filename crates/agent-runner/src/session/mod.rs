//! Tool session management
//!
//! [`ToolSessionManager`] keeps at most one live [`ToolSession`] per provider.
//! Concurrent requests for the same provider coalesce into a single handshake,
//! failed handshakes are remembered for a cooldown window, and calls on one
//! session are serialized.

mod connection;
mod http;
mod jsonrpc;
mod stdio;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use runtime_core::{Error, Result};

use crate::config::{ProvidersConfig, RuntimeConfig};

pub use connection::{ToolConnection, ToolConnector, TransportConnector};
pub use http::HttpConnection;
pub use stdio::StdioConnection;

/// A live connection to one provider
pub struct ToolSession {
    id: Uuid,
    provider_id: String,
    established_at: DateTime<Utc>,
    alive: AtomicBool,
    connection: Mutex<Box<dyn ToolConnection>>,
}

impl ToolSession {
    fn new(provider_id: &str, connection: Box<dyn ToolConnection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_id: provider_id.to_string(),
            established_at: Utc::now(),
            alive: AtomicBool::new(true),
            connection: Mutex::new(connection),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// False once the transport failed or the manager closed the session
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ToolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSession")
            .field("id", &self.id)
            .field("provider_id", &self.provider_id)
            .field("established_at", &self.established_at)
            .field("alive", &self.is_alive())
            .finish()
    }
}

enum SlotState {
    Empty,
    Ready(Arc<ToolSession>),
    Failed { message: String, at: Instant },
    /// Removed from the manager by cleanup; callers must look up a fresh slot
    Retired,
}

/// Per-provider connection state.
///
/// `attempts` counts finished handshakes. A caller that observes the counter
/// change while waiting for the lock takes the outcome of that attempt as its
/// own instead of starting another.
struct ProviderSlot {
    attempts: AtomicU64,
    state: Mutex<SlotState>,
}

impl ProviderSlot {
    fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            state: Mutex::new(SlotState::Empty),
        }
    }
}

pub struct ToolSessionManager {
    providers: ProvidersConfig,
    connector: Arc<dyn ToolConnector>,
    slots: parking_lot::Mutex<HashMap<String, Arc<ProviderSlot>>>,
    /// Dead sessions displaced by a reconnect, closed on cleanup
    replaced: parking_lot::Mutex<Vec<Arc<ToolSession>>>,
    handshake_timeout: Duration,
    tool_timeout: Duration,
    failure_cooldown: Duration,
}

impl ToolSessionManager {
    /// Manager using the built-in stdio and HTTP transports
    pub fn new(providers: ProvidersConfig, config: &RuntimeConfig) -> Self {
        Self::with_connector(providers, Arc::new(TransportConnector), config)
    }

    pub fn with_connector(
        providers: ProvidersConfig,
        connector: Arc<dyn ToolConnector>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            providers,
            connector,
            slots: parking_lot::Mutex::new(HashMap::new()),
            replaced: parking_lot::Mutex::new(Vec::new()),
            handshake_timeout: config.handshake_timeout,
            tool_timeout: config.tool_timeout,
            failure_cooldown: config.failure_cooldown,
        }
    }

    pub fn providers(&self) -> &ProvidersConfig {
        &self.providers
    }

    pub fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }

    fn slot(&self, provider_id: &str) -> Arc<ProviderSlot> {
        let mut slots = self.slots.lock();
        Arc::clone(
            slots
                .entry(provider_id.to_string())
                .or_insert_with(|| Arc::new(ProviderSlot::new())),
        )
    }

    /// Return the live session for `provider_id`, connecting if needed.
    ///
    /// A failed handshake is reported as `ConnectionFailed` to every caller
    /// until the cooldown elapses.
    pub async fn ensure_session(&self, provider_id: &str) -> Result<Arc<ToolSession>> {
        let config = self.providers.get(provider_id).ok_or_else(|| {
            Error::connection_failed(provider_id, "No connection parameters configured")
        })?;

        loop {
            let slot = self.slot(provider_id);
            let observed = slot.attempts.load(Ordering::SeqCst);
            let mut state = slot.state.lock().await;
            let coalesced = slot.attempts.load(Ordering::SeqCst) != observed;

            match &*state {
                SlotState::Retired => continue,
                SlotState::Ready(session) if coalesced || session.is_alive() => {
                    debug!("Reusing session {} for provider {}", session.id(), provider_id);
                    return Ok(Arc::clone(session));
                }
                SlotState::Failed { message, at }
                    if coalesced || at.elapsed() < self.failure_cooldown =>
                {
                    debug!("Provider {} in failure cooldown", provider_id);
                    return Err(Error::connection_failed(provider_id, message.clone()));
                }
                SlotState::Ready(session) => {
                    info!(
                        "Session {} for provider {} is dead, reconnecting",
                        session.id(),
                        provider_id
                    );
                    // A cancelled reconnect leaves the dead session in place
                    let mut replaced = self.replaced.lock();
                    if !replaced.iter().any(|old| old.id == session.id) {
                        replaced.push(Arc::clone(session));
                    }
                }
                _ => {}
            }

            let timeout = config
                .handshake_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.handshake_timeout);

            info!("Connecting to provider {}", provider_id);
            let outcome =
                match tokio::time::timeout(timeout, self.connector.connect(provider_id, config))
                    .await
                {
                    Ok(Ok(connection)) => Ok(connection),
                    Ok(Err(Error::ConnectionFailed { message, .. })) => Err(message),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!(
                        "Handshake timed out after {}ms",
                        timeout.as_millis()
                    )),
                };

            let result = match outcome {
                Ok(connection) => {
                    let session = Arc::new(ToolSession::new(provider_id, connection));
                    info!("Session {} established for provider {}", session.id(), provider_id);
                    *state = SlotState::Ready(Arc::clone(&session));
                    Ok(session)
                }
                Err(message) => {
                    warn!("Failed to connect to provider {}: {}", provider_id, message);
                    *state = SlotState::Failed {
                        message: message.clone(),
                        at: Instant::now(),
                    };
                    Err(Error::connection_failed(provider_id, message))
                }
            };

            slot.attempts.fetch_add(1, Ordering::SeqCst);
            return result;
        }
    }

    /// Invoke a tool with the default tool timeout
    pub async fn invoke(&self, session: &ToolSession, tool: &str, input: Value) -> Result<Value> {
        self.invoke_with_timeout(session, tool, input, self.tool_timeout)
            .await
    }

    /// Invoke a tool on `session`.
    ///
    /// The timeout covers waiting for earlier calls on the same session.
    /// A transport failure marks the session dead so the next
    /// `ensure_session` reconnects.
    pub async fn invoke_with_timeout(
        &self,
        session: &ToolSession,
        tool: &str,
        input: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let call = async {
            let mut connection = session.connection.lock().await;
            if !session.is_alive() {
                return Err(Error::connection_failed(
                    &session.provider_id,
                    "Session is closed",
                ));
            }
            debug!("Calling {} on provider {}", tool, session.provider_id);
            connection.call_tool(tool, input).await
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                if matches!(e, Error::ConnectionFailed { .. }) {
                    warn!(
                        "Session {} for provider {} lost: {}",
                        session.id, session.provider_id, e
                    );
                    session.mark_dead();
                }
                Err(e)
            }
            Err(_) => Err(Error::Timeout {
                operation: format!("Tool {}", tool),
                millis: timeout.as_millis() as u64,
            }),
        }
    }

    /// The current session for `provider_id`, if one is established and idle
    /// enough to inspect
    pub fn session(&self, provider_id: &str) -> Option<Arc<ToolSession>> {
        let slot = self.slots.lock().get(provider_id).cloned()?;
        let state = slot.state.try_lock().ok()?;
        match &*state {
            SlotState::Ready(session) if session.is_alive() => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// Number of providers with a live session
    pub fn session_count(&self) -> usize {
        let slots: Vec<Arc<ProviderSlot>> = self.slots.lock().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| {
                slot.state.try_lock().map_or(false, |state| {
                    matches!(&*state, SlotState::Ready(session) if session.is_alive())
                })
            })
            .count()
    }

    /// Close every session and forget cached failures.
    ///
    /// Dead sessions that were replaced by a reconnect are closed here too.
    /// Safe to call repeatedly; with nothing open it does nothing.
    pub async fn cleanup(&self) -> Result<()> {
        let slots: Vec<(String, Arc<ProviderSlot>)> = self.slots.lock().drain().collect();
        let mut sessions: Vec<Arc<ToolSession>> = self.replaced.lock().drain(..).collect();

        for (_, slot) in slots {
            let previous = {
                let mut state = slot.state.lock().await;
                std::mem::replace(&mut *state, SlotState::Retired)
            };
            if let SlotState::Ready(session) = previous {
                sessions.push(session);
            }
        }

        let mut failures = Vec::new();
        for session in sessions {
            session.mark_dead();
            let mut connection = session.connection.lock().await;
            match connection.close().await {
                Ok(()) => info!(
                    "Closed session {} for provider {}",
                    session.id, session.provider_id
                ),
                Err(e) => {
                    warn!(
                        "Failed to close session for provider {}: {}",
                        session.provider_id, e
                    );
                    failures.push(format!("{}: {}", session.provider_id, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::CleanupFailed { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Barrier;

    #[derive(Default)]
    struct Probe {
        connects: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        closes: AtomicUsize,
    }

    struct FakeConnector {
        probe: Arc<Probe>,
        handshake_delay: Duration,
        fail: bool,
        call_delay: Duration,
        barrier: Option<Arc<Barrier>>,
    }

    impl FakeConnector {
        fn new(probe: Arc<Probe>) -> Self {
            Self {
                probe,
                handshake_delay: Duration::from_millis(0),
                fail: false,
                call_delay: Duration::from_millis(0),
                barrier: None,
            }
        }
    }

    struct FakeConnection {
        provider_id: String,
        probe: Arc<Probe>,
        call_delay: Duration,
        barrier: Option<Arc<Barrier>>,
    }

    #[async_trait]
    impl ToolConnector for FakeConnector {
        async fn connect(
            &self,
            provider_id: &str,
            _config: &ProviderConfig,
        ) -> Result<Box<dyn ToolConnection>> {
            self.probe.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.handshake_delay).await;
            if self.fail {
                return Err(Error::connection_failed(provider_id, "refused"));
            }
            Ok(Box::new(FakeConnection {
                provider_id: provider_id.to_string(),
                probe: Arc::clone(&self.probe),
                call_delay: self.call_delay,
                barrier: self.barrier.clone(),
            }))
        }
    }

    #[async_trait]
    impl ToolConnection for FakeConnection {
        async fn call_tool(&mut self, tool: &str, input: Value) -> Result<Value> {
            let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(barrier) = &self.barrier {
                let waited = tokio::time::timeout(Duration::from_secs(2), barrier.wait()).await;
                if waited.is_err() {
                    self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::tool_failed(tool, "peer call never arrived"));
                }
            }
            tokio::time::sleep(self.call_delay).await;

            self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
            match tool {
                "drop" => Err(Error::connection_failed(&self.provider_id, "pipe closed")),
                "reject" => Err(Error::tool_failed(tool, "bad arguments")),
                _ => Ok(json!({ "provider": self.provider_id, "tool": tool, "input": input })),
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn providers() -> ProvidersConfig {
        ProvidersConfig::new()
            .with_provider("files", ProviderConfig::stdio("fs-tools", vec![]))
            .with_provider("search", ProviderConfig::http("http://localhost:1/rpc"))
    }

    fn manager(connector: FakeConnector, cooldown: Duration) -> ToolSessionManager {
        let config = RuntimeConfig {
            failure_cooldown: cooldown,
            ..RuntimeConfig::default()
        };
        ToolSessionManager::with_connector(providers(), Arc::new(connector), &config)
    }

    #[tokio::test]
    async fn test_concurrent_ensure_session_coalesces() {
        let probe = Arc::new(Probe::default());
        let mut connector = FakeConnector::new(Arc::clone(&probe));
        connector.handshake_delay = Duration::from_millis(50);
        let manager = manager(connector, Duration::from_secs(5));

        let results =
            futures::future::join_all((0..10).map(|_| manager.ensure_session("files"))).await;

        assert_eq!(probe.connects.load(Ordering::SeqCst), 1);
        let ids: Vec<Uuid> = results.into_iter().map(|r| r.unwrap().id()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_failures_share_one_attempt() {
        let probe = Arc::new(Probe::default());
        let mut connector = FakeConnector::new(Arc::clone(&probe));
        connector.handshake_delay = Duration::from_millis(30);
        connector.fail = true;
        // No cooldown: waiters still take the in-flight attempt's outcome
        let manager = manager(connector, Duration::ZERO);

        let results =
            futures::future::join_all((0..5).map(|_| manager.ensure_session("files"))).await;

        assert_eq!(probe.connects.load(Ordering::SeqCst), 1);
        for result in results {
            assert!(matches!(result, Err(Error::ConnectionFailed { ref message, .. }) if message == "refused"));
        }

        // A later call outside the cooldown tries again
        assert!(manager.ensure_session("files").await.is_err());
        assert_eq!(probe.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_cooldown() {
        let probe = Arc::new(Probe::default());
        let mut connector = FakeConnector::new(Arc::clone(&probe));
        connector.fail = true;
        let manager = manager(connector, Duration::from_secs(60));

        assert!(manager.ensure_session("files").await.is_err());
        let err = manager.ensure_session("files").await.unwrap_err();

        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert_eq!(probe.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let probe = Arc::new(Probe::default());
        let manager = manager(FakeConnector::new(Arc::clone(&probe)), Duration::from_secs(5));

        let err = manager.ensure_session("nope").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { ref provider_id, .. } if provider_id == "nope"));
        assert_eq!(probe.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let probe = Arc::new(Probe::default());
        let mut connector = FakeConnector::new(Arc::clone(&probe));
        connector.handshake_delay = Duration::from_secs(5);
        let config = RuntimeConfig {
            handshake_timeout: Duration::from_millis(20),
            ..RuntimeConfig::default()
        };
        let manager = ToolSessionManager::with_connector(providers(), Arc::new(connector), &config);

        let err = manager.ensure_session("files").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_invoke_serialized_per_session() {
        let probe = Arc::new(Probe::default());
        let mut connector = FakeConnector::new(Arc::clone(&probe));
        connector.call_delay = Duration::from_millis(10);
        let manager = manager(connector, Duration::from_secs(5));

        let session = manager.ensure_session("files").await.unwrap();
        let calls = (0..5).map(|i| manager.invoke(&session, "read", json!({ "n": i })));
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invoke_parallel_across_sessions() {
        let probe = Arc::new(Probe::default());
        let mut connector = FakeConnector::new(Arc::clone(&probe));
        // Each call waits until the other provider's call is also in flight
        connector.barrier = Some(Arc::new(Barrier::new(2)));
        let manager = manager(connector, Duration::from_secs(5));

        let files = manager.ensure_session("files").await.unwrap();
        let search = manager.ensure_session("search").await.unwrap();

        let (a, b) = tokio::join!(
            manager.invoke(&files, "read", json!({})),
            manager.invoke(&search, "query", json!({}))
        );

        assert_eq!(a.unwrap()["provider"], "files");
        assert_eq!(b.unwrap()["provider"], "search");
        assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let probe = Arc::new(Probe::default());
        let mut connector = FakeConnector::new(Arc::clone(&probe));
        connector.call_delay = Duration::from_millis(500);
        let manager = manager(connector, Duration::from_secs(5));

        let session = manager.ensure_session("files").await.unwrap();
        let err = manager
            .invoke_with_timeout(&session, "slow", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { millis: 20, .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_tool_error_keeps_session() {
        let probe = Arc::new(Probe::default());
        let manager = manager(FakeConnector::new(Arc::clone(&probe)), Duration::from_secs(5));

        let session = manager.ensure_session("files").await.unwrap();
        let err = manager.invoke(&session, "reject", json!({})).await.unwrap_err();

        assert!(matches!(err, Error::ToolInvocationFailed { .. }));
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_dead_session_is_replaced() {
        let probe = Arc::new(Probe::default());
        let manager = manager(FakeConnector::new(Arc::clone(&probe)), Duration::from_secs(5));

        let first = manager.ensure_session("files").await.unwrap();
        let err = manager.invoke(&first, "drop", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert!(!first.is_alive());
        assert!(manager.session("files").is_none());

        let second = manager.ensure_session("files").await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(probe.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cleanup_closes_replaced_sessions() {
        let probe = Arc::new(Probe::default());
        let manager = manager(FakeConnector::new(Arc::clone(&probe)), Duration::from_secs(5));

        let first = manager.ensure_session("files").await.unwrap();
        assert!(manager.invoke(&first, "drop", json!({})).await.is_err());
        manager.ensure_session("files").await.unwrap();
        assert_eq!(probe.closes.load(Ordering::SeqCst), 0);

        manager.cleanup().await.unwrap();
        assert_eq!(probe.connects.load(Ordering::SeqCst), 2);
        assert_eq!(probe.closes.load(Ordering::SeqCst), 2);

        manager.cleanup().await.unwrap();
        assert_eq!(probe.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cleanup_closes_sessions_and_is_idempotent() {
        let probe = Arc::new(Probe::default());
        let manager = manager(FakeConnector::new(Arc::clone(&probe)), Duration::from_secs(5));

        let files = manager.ensure_session("files").await.unwrap();
        manager.ensure_session("search").await.unwrap();
        assert_eq!(manager.session_count(), 2);

        manager.cleanup().await.unwrap();
        assert_eq!(probe.closes.load(Ordering::SeqCst), 2);
        assert_eq!(manager.session_count(), 0);
        assert!(!files.is_alive());

        let err = manager.invoke(&files, "read", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { .. }));

        manager.cleanup().await.unwrap();
        assert_eq!(probe.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cleanup_with_nothing_open() {
        let probe = Arc::new(Probe::default());
        let manager = manager(FakeConnector::new(Arc::clone(&probe)), Duration::from_secs(5));

        manager.cleanup().await.unwrap();
        manager.cleanup().await.unwrap();
        assert_eq!(probe.connects.load(Ordering::SeqCst), 0);
        assert_eq!(probe.closes.load(Ordering::SeqCst), 0);
    }
}
