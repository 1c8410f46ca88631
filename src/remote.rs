//! Remote (Redis) store adapter
//!
//! [`RedisStore`] owns one multiplexed connection and a background supervisor
//! that (re)establishes it. The link is only reported ready after a handshake
//! *and* an immediate `PING` round trip both succeed. Any caller that sees a
//! command fail calls [`Liveness::mark_down`], which clears the flag and wakes
//! the supervisor.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use serde::Serialize;
use tokio::{
    sync::{Notify, RwLock, watch},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::{CacheConfig, CacheError};

/// Connection lifecycle as seen by health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Handshake in progress
    Connecting,
    /// Handshake done, probe pending
    Connected,
    /// Probe succeeded; commands are routed to the remote store
    Ready,
    /// Last operation or probe failed
    Error,
    /// Waiting out a backoff delay before the next attempt
    Reconnecting,
    Closing,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Snapshot published on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub last_error: Option<String>,
    /// Number of the reconnect attempt in progress; 0 once ready
    pub attempt: u32,
}

/// Readiness flag plus observable state of the remote link
pub struct Liveness {
    ready: AtomicBool,
    status: watch::Sender<LinkStatus>,
    wake: Notify,
}

impl fmt::Debug for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Liveness")
            .field("ready", &self.is_ready())
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        let (status, _) = watch::channel(LinkStatus {
            state: LinkState::Closed,
            last_error: None,
            attempt: 0,
        });
        Self {
            ready: AtomicBool::new(false),
            status,
            wake: Notify::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.borrow().last_error.clone()
    }

    /// Receiver that sees every state transition
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    /// Record a transition that does not change readiness
    pub fn transition(&self, state: LinkState, attempt: u32) {
        debug!("Remote link state -> {} (attempt {})", state, attempt);
        self.status.send_modify(|s| {
            s.state = state;
            s.attempt = attempt;
        });
    }

    /// Mark the link usable. Only called after a successful probe.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.status.send_modify(|s| {
            s.state = LinkState::Ready;
            s.attempt = 0;
        });
    }

    /// Mark the link unusable and ask the supervisor to reconnect
    pub fn mark_down(&self, reason: &str) {
        let was_ready = self.ready.swap(false, Ordering::SeqCst);
        if was_ready {
            warn!("Remote store marked not ready: {}", reason);
        }
        self.status.send_modify(|s| {
            if !matches!(s.state, LinkState::Closing | LinkState::Closed) {
                s.state = LinkState::Error;
            }
            s.last_error = Some(reason.to_owned());
        });
        self.wake.notify_one();
    }

    fn mark_closed(&self, state: LinkState) {
        self.ready.store(false, Ordering::SeqCst);
        self.status.send_modify(|s| s.state = state);
        self.wake.notify_one();
    }

    async fn wait_for_wake(&self) {
        self.wake.notified().await;
    }
}

/// Low-level remote key-value primitives
///
/// Implementations report failures as `Err`; deciding what a failure means for
/// callers is left to [`crate::CacheService`].
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value`; `ttl` of `None` or zero seconds means no expiry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Returns whether a key was removed
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Round-trip probe, returning its latency
    async fn ping(&self) -> Result<Duration, CacheError>;

    /// Server `INFO` output
    async fn info(&self) -> Result<String, CacheError>;

    /// Remove every key of the selected database
    async fn flush(&self) -> Result<(), CacheError>;

    fn liveness(&self) -> &Liveness;

    /// Stop reconnecting and drop the connection
    async fn shutdown(&self) {}
}

/// Opens and probes connections for a [`Link`]
#[async_trait]
pub(crate) trait Connector: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    /// Open a connection, handshake included
    async fn handshake(&self) -> Result<Self::Conn, CacheError>;

    /// One `PING` round trip on a freshly opened connection
    async fn probe(&self, conn: &mut Self::Conn) -> Result<(), CacheError>;
}

/// Redis [`Connector`]; both steps are bounded by the configured timeouts
pub(crate) struct RedisConnector {
    client: redis::Client,
    connect_timeout: Duration,
    command_timeout: Duration,
}

#[async_trait]
impl Connector for RedisConnector {
    type Conn = MultiplexedConnection;

    async fn handshake(&self) -> Result<MultiplexedConnection, CacheError> {
        bounded(
            "CONNECT",
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
    }

    async fn probe(&self, conn: &mut MultiplexedConnection) -> Result<(), CacheError> {
        let pong: String = bounded(
            "PING",
            self.command_timeout,
            redis::cmd("PING").query_async::<String>(conn),
        )
        .await?;
        debug!("Redis probe answered {}", pong);
        Ok(())
    }
}

/// A supervised connection: the current handle, its liveness and the
/// reconnect task
pub(crate) struct Link<C: Connector> {
    connector: C,
    conn: RwLock<Option<C::Conn>>,
    liveness: Liveness,
    config: CacheConfig,
    closing: AtomicBool,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Link<C> {
    pub(crate) fn new(connector: C, config: CacheConfig) -> Self {
        Self {
            connector,
            conn: RwLock::new(None),
            liveness: Liveness::new(),
            config,
            closing: AtomicBool::new(false),
            supervisor: std::sync::Mutex::new(None),
        }
    }

    async fn current(&self) -> Result<C::Conn, CacheError> {
        self.conn.read().await.clone().ok_or(CacheError::Unavailable)
    }

    /// Handshake, then probe. Ready only if both succeed.
    async fn establish(&self, attempt: u32) -> Result<(), CacheError> {
        self.liveness.transition(LinkState::Connecting, attempt);
        let mut conn = self.connector.handshake().await?;
        self.liveness.transition(LinkState::Connected, attempt);

        self.connector.probe(&mut conn).await?;

        *self.conn.write().await = Some(conn);
        if self.closing.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable);
        }
        self.liveness.mark_ready();
        debug!("Redis connection ready");
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.reconnect_base_delay;
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(self.config.reconnect_max_delay)
    }

    fn spawn_supervisor(self: &Arc<Self>) {
        let handle = tokio::spawn(supervise(Arc::clone(self)));
        if let Ok(mut slot) = self.supervisor.lock() {
            *slot = Some(handle);
        }
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.liveness.mark_closed(LinkState::Closing);
        *self.conn.write().await = None;

        let handle = self.supervisor.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        self.liveness.mark_closed(LinkState::Closed);
    }
}

/// Reconnect loop: sleeps until the link is marked down, then retries with a
/// capped doubling delay until a probe succeeds.
async fn supervise<C: Connector>(link: Arc<Link<C>>) {
    loop {
        if link.closing.load(Ordering::SeqCst) {
            break;
        }
        if link.liveness.is_ready() {
            link.liveness.wait_for_wake().await;
            continue;
        }

        *link.conn.write().await = None;

        let mut attempt = 1u32;
        while !link.closing.load(Ordering::SeqCst) {
            let delay = link.backoff(attempt);
            link.liveness.transition(LinkState::Reconnecting, attempt);
            warn!(
                "Redis reconnect attempt {} in {}ms",
                attempt,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;

            if link.closing.load(Ordering::SeqCst) {
                break;
            }
            match link.establish(attempt).await {
                Ok(()) => break,
                Err(e) => {
                    error!("Redis reconnect attempt {} failed: {}", attempt, e);
                    link.liveness.mark_down(&e.to_string());
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
    debug!("Redis supervisor stopped");
}

/// Redis-backed [`RemoteStore`] with a reconnect supervisor
#[derive(Clone)]
pub struct RedisStore {
    link: Arc<Link<RedisConnector>>,
}

impl RedisStore {
    /// Open the client and make one bounded connection attempt.
    ///
    /// Only an unparsable URL is an error. If the first attempt fails the store
    /// starts in degraded mode and the supervisor keeps retrying.
    pub async fn connect(config: CacheConfig) -> Result<Self, CacheError> {
        let connector = RedisConnector {
            client: redis::Client::open(config.redis_url.as_str())?,
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
        };
        let link = Arc::new(Link::new(connector, config));

        if let Err(e) = link.establish(1).await {
            warn!("Initial Redis connection failed ({}); starting degraded", e);
            link.liveness.mark_down(&e.to_string());
        }
        link.spawn_supervisor();

        Ok(Self { link })
    }

    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        bounded(op, self.link.config.command_timeout, fut).await
    }
}

async fn bounded<T, F>(op: &'static str, limit: Duration, fut: F) -> Result<T, CacheError>
where
    F: std::future::Future<Output = Result<T, redis::RedisError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(CacheError::from),
        Err(_) => Err(CacheError::Timeout {
            op,
            millis: limit.as_millis(),
        }),
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.link.current().await?;
        self.run("GET", conn.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.link.current().await?;
        match ttl.map(|t| t.as_secs()).filter(|secs| *secs > 0) {
            Some(secs) => {
                self.run("SETEX", conn.set_ex::<_, _, ()>(key, value, secs))
                    .await
            }
            None => self.run("SET", conn.set::<_, _, ()>(key, value)).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.link.current().await?;
        let removed: usize = self.run("DEL", conn.del::<_, usize>(key)).await?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<Duration, CacheError> {
        let mut conn = self.link.current().await?;
        let start = Instant::now();
        let _: String = self
            .run("PING", redis::cmd("PING").query_async::<String>(&mut conn))
            .await?;
        Ok(start.elapsed())
    }

    async fn info(&self) -> Result<String, CacheError> {
        let mut conn = self.link.current().await?;
        self.run("INFO", redis::cmd("INFO").query_async::<String>(&mut conn))
            .await
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let mut conn = self.link.current().await?;
        self.run("FLUSHDB", redis::cmd("FLUSHDB").query_async::<()>(&mut conn))
            .await
    }

    fn liveness(&self) -> &Liveness {
        &self.link.liveness
    }

    async fn shutdown(&self) {
        self.link.close().await;
        debug!("Redis store shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn liveness_transitions_are_observable() {
        let liveness = Liveness::new();
        let rx = liveness.subscribe();
        assert!(!liveness.is_ready());
        assert_eq!(rx.borrow().state, LinkState::Closed);

        liveness.transition(LinkState::Connecting, 1);
        assert_eq!(rx.borrow().state, LinkState::Connecting);
        assert!(!liveness.is_ready());

        liveness.transition(LinkState::Connected, 1);
        assert!(!liveness.is_ready(), "handshake alone must not mark ready");

        liveness.mark_ready();
        assert!(liveness.is_ready());
        assert_eq!(liveness.status().attempt, 0);

        liveness.mark_down("connection reset");
        assert!(!liveness.is_ready());
        let status = liveness.status();
        assert_eq!(status.state, LinkState::Error);
        assert_eq!(status.last_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn mark_down_keeps_closing_state() {
        let liveness = Liveness::new();
        liveness.mark_ready();
        liveness.mark_closed(LinkState::Closing);
        liveness.mark_down("late failure");
        assert_eq!(liveness.status().state, LinkState::Closing);
    }

    /// Connector whose handshake always succeeds and whose probe fails a
    /// set number of times first
    #[derive(Default)]
    struct ScriptedConnector {
        handshakes: AtomicUsize,
        failing_probes: AtomicUsize,
    }

    impl ScriptedConnector {
        fn failing(probes: usize) -> Self {
            Self {
                handshakes: AtomicUsize::new(0),
                failing_probes: AtomicUsize::new(probes),
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Conn = ();

        async fn handshake(&self) -> Result<(), CacheError> {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn probe(&self, _conn: &mut ()) -> Result<(), CacheError> {
            let left = self.failing_probes.load(Ordering::SeqCst);
            if left > 0 {
                self.failing_probes.store(left - 1, Ordering::SeqCst);
                return Err(CacheError::Timeout {
                    op: "PING",
                    millis: 5,
                });
            }
            Ok(())
        }
    }

    fn fast_config() -> CacheConfig {
        CacheConfig {
            reconnect_base_delay: Duration::from_millis(5),
            reconnect_max_delay: Duration::from_millis(20),
            ..CacheConfig::default()
        }
    }

    async fn wait_until_ready(rx: &mut watch::Receiver<LinkStatus>) {
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.state == LinkState::Ready),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let link = Link::new(ScriptedConnector::default(), CacheConfig::default());
        assert_eq!(link.backoff(1), Duration::from_millis(100));
        assert_eq!(link.backoff(2), Duration::from_millis(200));
        assert_eq!(link.backoff(4), Duration::from_millis(800));
        assert_eq!(link.backoff(7), Duration::from_secs(5));
        assert_eq!(link.backoff(60), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn handshake_with_failed_probe_is_not_ready() {
        let link = Link::new(ScriptedConnector::failing(1), fast_config());

        assert!(link.establish(1).await.is_err());
        assert!(!link.liveness.is_ready());
        assert_eq!(link.liveness.status().state, LinkState::Connected);
        assert!(matches!(link.current().await, Err(CacheError::Unavailable)));

        link.establish(2).await.unwrap();
        assert!(link.liveness.is_ready());
        assert!(link.current().await.is_ok());
    }

    #[tokio::test]
    async fn supervisor_retries_and_wakes_on_mark_down() {
        let link = Arc::new(Link::new(ScriptedConnector::failing(2), fast_config()));
        let mut rx = link.liveness.subscribe();
        link.liveness.mark_down("initial connect failed");
        link.spawn_supervisor();

        wait_until_ready(&mut rx).await;
        assert_eq!(link.connector.handshakes.load(Ordering::SeqCst), 3);
        assert_eq!(link.liveness.status().attempt, 0);

        link.liveness.mark_down("connection reset");
        wait_until_ready(&mut rx).await;
        assert!(link.liveness.is_ready());
        assert_eq!(link.connector.handshakes.load(Ordering::SeqCst), 4);

        link.close().await;
        assert!(!link.liveness.is_ready());
        assert_eq!(link.liveness.status().state, LinkState::Closed);
    }

    #[tokio::test]
    async fn unreachable_server_starts_degraded() {
        // Port 1 is never a Redis server; the attempt fails fast.
        let config = CacheConfig {
            redis_url: "redis://127.0.0.1:1/0".to_owned(),
            connect_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_millis(200),
            reconnect_base_delay: Duration::from_secs(60),
            ..CacheConfig::default()
        };
        let store = RedisStore::connect(config).await.unwrap();
        assert!(!store.liveness().is_ready());
        assert!(store.liveness().last_error().is_some());
        assert!(matches!(
            store.get("user:1").await,
            Err(CacheError::Unavailable)
        ));

        store.shutdown().await;
        assert_eq!(store.liveness().status().state, LinkState::Closed);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let config = CacheConfig {
            redis_url: "not a url".to_owned(),
            ..CacheConfig::default()
        };
        assert!(matches!(
            RedisStore::connect(config).await,
            Err(CacheError::Redis(_))
        ));
    }
}
