//! Active-side reconnection driver.
//!
//! One dialer owns one [`Session`] for the lifetime of the process and
//! re-establishes its transport whenever it drops. A compare-and-swap flag
//! prevents concurrent dial attempts; failed attempts reschedule themselves
//! after a fixed delay. A grace window suppresses redial after the peer
//! announced shutdown or rejected the handshake.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::{Duration, Instant},
};

use tokio::{net::TcpStream, time::timeout};
use tracing::{debug, warn};

use crate::{
    config::{NodeConfig, Remote},
    error::NetError,
    message,
    node::Node,
    session::{Session, SessionStatus},
};

/// Reconnection driver for one active session.
pub struct Dialer {
    session: Arc<Session>,
    remote: Remote,
    dialing: AtomicBool,
    dial_timeout: Duration,
    redial_delay: Duration,
    ping_interval: Duration,
    suppress_until: StdMutex<Option<Instant>>,
}

impl Dialer {
    /// Create a dialer for a configured remote.
    #[must_use]
    pub fn new(session: Arc<Session>, remote: Remote, cfg: &NodeConfig) -> Self {
        Self {
            session,
            remote,
            dialing: AtomicBool::new(false),
            dial_timeout: cfg.dial_timeout(),
            redial_delay: cfg.redial_delay(),
            ping_interval: cfg.ping_interval(),
            suppress_until: StdMutex::new(None),
        }
    }

    /// The session this dialer drives.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Suppress redial attempts for the given window.
    pub fn suppress(&self, window: Duration) {
        let mut guard = self
            .suppress_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Instant::now() + window);
    }

    fn suppressed_for(&self) -> Duration {
        self.suppress_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Cheap idempotent trigger: redial if disconnected and not already
    /// trying. Invoked on every teardown path of the session.
    pub fn check_and_redial(self: &Arc<Self>, node: &Arc<Node>) {
        if self.session.status() == SessionStatus::Disconnected {
            self.spawn_dial(Arc::clone(node), self.redial_delay);
        }
    }

    /// Schedule a dial attempt after `delay`, extended by any active grace
    /// window.
    pub fn spawn_dial(self: &Arc<Self>, node: Arc<Node>, delay: Duration) {
        let dialer = Arc::clone(self);
        tokio::spawn(async move {
            let wait = delay.max(dialer.suppressed_for());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            dialer.dial(&node).await;
        });
    }

    async fn dial(self: &Arc<Self>, node: &Arc<Node>) {
        if self
            .dialing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let result = self.try_dial(node).await;
        self.dialing.store(false, Ordering::Release);
        if let Err(e) = result {
            self.session.set_status(SessionStatus::Disconnected);
            warn!(addr = %self.remote.addr, error = %e, "dial failed");
            self.spawn_dial(Arc::clone(node), self.redial_delay);
        }
    }

    async fn try_dial(self: &Arc<Self>, node: &Arc<Node>) -> Result<(), NetError> {
        if self.session.is_established() {
            return Ok(());
        }
        self.session.set_status(SessionStatus::Dialing);
        let stream = timeout(self.dial_timeout, TcpStream::connect(&self.remote.addr))
            .await
            .map_err(|_| NetError::transport(format!("dial to {} timed out", self.remote.addr)))?
            .map_err(NetError::from)?;
        let read_half = self.session.attach(stream).await;
        debug!(addr = %self.remote.addr, spn = %self.remote.spn, "connected");

        let frame = message::build_connect(node.eid(), &node.topology())?;
        self.session.send(frame).await?;

        let reader_node = Arc::clone(node);
        let session = Arc::clone(&self.session);
        tokio::spawn(reader_node.read_loop(session, read_half));
        self.spawn_ping(Arc::clone(node));
        Ok(())
    }

    /// Keepalive ticker; exits when the session drops and hands control
    /// back to `check_and_redial`.
    fn spawn_ping(self: &Arc<Self>, node: Arc<Node>) {
        let dialer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dialer.ping_interval);
            // The first tick of an interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !dialer.session.is_established() {
                    dialer.check_and_redial(&node);
                    return;
                }
                let frame = match message::build_ping(node.eid()) {
                    Ok(frame) => frame,
                    Err(_) => return,
                };
                if dialer.session.send(frame).await.is_err() {
                    dialer.check_and_redial(&node);
                    return;
                }
            }
        });
    }
}
