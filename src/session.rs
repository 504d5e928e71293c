//! One TCP link between two mesh entities.
//!
//! A session is owned by a [`crate::dialer::Dialer`] on the active side or by
//! the accept loop on the passive side, and survives transport loss: the same
//! session object cycles through `Disconnected` and back as its owner
//! redials. Writes are serialised by an async mutex over the framed write
//! half; reads are single-threaded in the session's read loop.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Mutex as StdMutex,
    },
    time::{Duration, Instant},
};

use futures_util::SinkExt;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
};
use tokio_util::codec::FramedWrite;
use tracing::trace;

use crate::{
    codec::{Frame, FrameCodec},
    error::NetError,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No transport; the dialer may be scheduled to retry.
    Disconnected,
    /// A dial attempt is in flight.
    Dialing,
    /// Transport registered, handshake in flight.
    Connected,
    /// Handshake complete; the session is eligible for routing.
    Accepted,
}

impl SessionStatus {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Dialing => 1,
            Self::Connected => 2,
            Self::Accepted => 3,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Dialing,
            2 => Self::Connected,
            3 => Self::Accepted,
            _ => Self::Disconnected,
        }
    }
}

/// Which side of the TCP connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// This node initiated the dial.
    Active,
    /// This node accepted the connection.
    Passive,
}

/// One TCP link: status, identity of the peer as far as it is known, and the
/// mutex-serialised write half.
#[derive(Debug)]
pub struct Session {
    id: u64,
    role: SessionRole,
    status: AtomicU8,
    remote_eid: StdMutex<Option<String>>,
    remote_spn: StdMutex<Option<String>>,
    writer: Mutex<Option<FramedWrite<OwnedWriteHalf, FrameCodec>>>,
    last_rx: StdMutex<Instant>,
}

impl Session {
    fn new(role: SessionRole) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            status: AtomicU8::new(SessionStatus::Disconnected.as_u8()),
            remote_eid: StdMutex::new(None),
            remote_spn: StdMutex::new(None),
            writer: Mutex::new(None),
            last_rx: StdMutex::new(Instant::now()),
        }
    }

    /// Create the active-side session for a configured remote service.
    #[must_use]
    pub fn active(remote_spn: &str) -> Self {
        let session = Self::new(SessionRole::Active);
        session.set_remote_spn(remote_spn);
        session
    }

    /// Create a passive-side session for an accepted connection.
    #[must_use]
    pub fn passive() -> Self {
        Self::new(SessionRole::Passive)
    }

    /// Process-unique session id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Which side of the connection this session is.
    #[must_use]
    pub const fn role(&self) -> SessionRole {
        self.role
    }

    /// Current connection state.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// True when frames may be written.
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(
            self.status(),
            SessionStatus::Connected | SessionStatus::Accepted
        )
    }

    /// Entity id of the peer, once learned.
    #[must_use]
    pub fn remote_eid(&self) -> Option<String> {
        self.remote_eid.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub(crate) fn set_remote_eid(&self, eid: &str) {
        if let Ok(mut guard) = self.remote_eid.lock() {
            *guard = Some(eid.to_owned());
        }
    }

    /// Service provider name of the peer, once learned.
    #[must_use]
    pub fn remote_spn(&self) -> Option<String> {
        self.remote_spn.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub(crate) fn set_remote_spn(&self, spn: &str) {
        if let Ok(mut guard) = self.remote_spn.lock() {
            *guard = Some(spn.to_owned());
        }
    }

    /// Register a freshly connected transport and return its read half.
    pub(crate) async fn attach(&self, stream: TcpStream) -> OwnedReadHalf {
        let (read_half, write_half) = stream.into_split();
        let mut guard = self.writer.lock().await;
        *guard = Some(FramedWrite::new(write_half, FrameCodec::new()));
        self.set_status(SessionStatus::Connected);
        self.touch();
        read_half
    }

    /// Write one frame, serialised against concurrent senders.
    ///
    /// # Errors
    /// Returns a `Transport` error if the session has no live transport or
    /// the write fails; a failed write tears the transport down.
    pub async fn send(&self, frame: Frame) -> Result<(), NetError> {
        let mut guard = self.writer.lock().await;
        if !self.is_established() {
            return Err(NetError::transport("session not connected"));
        }
        let Some(writer) = guard.as_mut() else {
            return Err(NetError::transport("session has no transport"));
        };
        trace!(
            target: "lattice::wire",
            session = self.id,
            msg_type = %frame.msg_type,
            header_len = frame.header.len(),
            body_len = frame.body.len(),
            "frame out"
        );
        if let Err(e) = writer.send(frame).await {
            self.set_status(SessionStatus::Disconnected);
            *guard = None;
            return Err(NetError::transport(e.to_string()));
        }
        Ok(())
    }

    /// Tear down the transport and mark the session disconnected.
    pub async fn close(&self) {
        self.set_status(SessionStatus::Disconnected);
        let mut guard = self.writer.lock().await;
        *guard = None;
    }

    /// Record receipt of an inbound frame.
    pub(crate) fn touch(&self) {
        if let Ok(mut guard) = self.last_rx.lock() {
            *guard = Instant::now();
        }
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_rx
            .lock()
            .map(|g| g.elapsed())
            .unwrap_or_default()
    }
}
