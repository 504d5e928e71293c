//! Correlation table for outstanding requests.
//!
//! Every `SendReq` registers its transaction number here together with the
//! deadline and the session the request left on. Responses resolve entries,
//! the sweeper fails expired ones with `Timeout`, and session teardown fails
//! everything that left on the dead session with `Transport`. Sinks are
//! never delivered while the table lock is held.

use std::{
    collections::HashMap,
    sync::{Mutex as StdMutex, PoisonError},
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use crate::{
    error::{ErrCode, NetError},
    message::{ResHeader, ResponseMsg},
};

struct PendingEntry {
    deadline: Instant,
    session_id: u64,
    sink: oneshot::Sender<ResponseMsg>,
}

/// Map of outstanding transaction numbers to their response sinks.
#[derive(Default)]
pub struct PendingTable {
    entries: StdMutex<HashMap<u64, PendingEntry>>,
}

fn synthetic_failure(txn_no: u64, code: ErrCode, text: &str) -> ResponseMsg {
    let mut header = ResHeader {
        txn_no,
        ..ResHeader::default()
    };
    header.set_error(&NetError::new(code, text));
    ResponseMsg {
        header,
        body: Value::Object(serde_json::Map::new()),
    }
}

impl PendingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry and hand back the sink the caller will await.
    ///
    /// # Errors
    /// Returns an `Internal` error if the transaction number is already
    /// registered; transaction numbers come from a monotonic counter, so a
    /// duplicate is a programming error.
    pub fn register(
        &self,
        txn_no: u64,
        session_id: u64,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<ResponseMsg>, NetError> {
        let (sink, source) = oneshot::channel();
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&txn_no) {
            return Err(NetError::internal(format!(
                "duplicate pending registration for TxnNo {txn_no}"
            )));
        }
        entries.insert(
            txn_no,
            PendingEntry {
                deadline,
                session_id,
                sink,
            },
        );
        Ok(source)
    }

    /// Remove an entry without delivering anything.
    pub fn unregister(&self, txn_no: u64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&txn_no);
    }

    /// Deliver a response to its waiting caller.
    ///
    /// Returns false when no entry exists, which means the caller already
    /// timed out; the late response is dropped.
    pub fn resolve(&self, txn_no: u64, response: ResponseMsg) -> bool {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&txn_no);
        match entry {
            Some(entry) => {
                let _ = entry.sink.send(response);
                true
            }
            None => {
                debug!(txn_no, "dropping late response");
                false
            }
        }
    }

    /// Fail every entry whose deadline has passed with `Timeout`.
    pub fn sweep(&self, now: Instant) {
        let expired: Vec<(u64, PendingEntry)> = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let txns: Vec<u64> = entries
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(txn, _)| *txn)
                .collect();
            txns.into_iter()
                .filter_map(|txn| entries.remove(&txn).map(|e| (txn, e)))
                .collect()
        };
        for (txn_no, entry) in expired {
            let _ = entry
                .sink
                .send(synthetic_failure(txn_no, ErrCode::Timeout, "request timed out"));
        }
    }

    /// Fail every entry whose request left on the given session with
    /// `Transport`. Runs on session teardown.
    pub fn fail_session(&self, session_id: u64) {
        let dropped: Vec<(u64, PendingEntry)> = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let txns: Vec<u64> = entries
                .iter()
                .filter(|(_, e)| e.session_id == session_id)
                .map(|(txn, _)| *txn)
                .collect();
            txns.into_iter()
                .filter_map(|txn| entries.remove(&txn).map(|e| (txn, e)))
                .collect()
        };
        for (txn_no, entry) in dropped {
            let _ = entry.sink.send(synthetic_failure(
                txn_no,
                ErrCode::Transport,
                "session to target closed",
            ));
        }
    }

    /// Number of outstanding entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when no entries are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodic sweeper loop for a table; exits when the shutdown signal
/// fires.
pub(crate) async fn run_sweeper(
    table: std::sync::Arc<PendingTable>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => table.sweep(Instant::now()),
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(txn_no: u64) -> ResponseMsg {
        ResponseMsg {
            header: ResHeader {
                txn_no,
                ..ResHeader::default()
            },
            body: Value::Object(serde_json::Map::new()),
        }
    }

    #[tokio::test]
    async fn resolve_delivers_to_the_registered_sink() {
        let table = PendingTable::new();
        let source = table
            .register(1, 10, Instant::now() + Duration::from_secs(10))
            .expect("register");

        assert!(table.resolve(1, response(1)));
        let res = source.await.expect("delivered");
        assert_eq!(res.header.txn_no, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_registration_is_an_internal_error() {
        let table = PendingTable::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        let _source = table.register(7, 1, deadline).expect("first");
        let err = table.register(7, 1, deadline).expect_err("duplicate");
        assert_eq!(err.code, ErrCode::Internal);
    }

    #[test]
    fn late_responses_are_dropped() {
        let table = PendingTable::new();
        assert!(!table.resolve(99, response(99)));
    }

    #[tokio::test]
    async fn sweep_fails_expired_entries_with_timeout() {
        let table = PendingTable::new();
        let now = Instant::now();
        let expired = table.register(1, 10, now).expect("register");
        let live = table
            .register(2, 10, now + Duration::from_secs(60))
            .expect("register");

        table.sweep(now + Duration::from_millis(1));

        let res = expired.await.expect("timeout delivered");
        assert_eq!(res.header.to_net_error().code, ErrCode::Timeout);
        assert_eq!(table.len(), 1);
        drop(live);
    }

    #[tokio::test]
    async fn session_teardown_fails_only_its_own_entries() {
        let table = PendingTable::new();
        let deadline = Instant::now() + Duration::from_secs(60);
        let dead = table.register(1, 10, deadline).expect("register");
        let other = table.register(2, 11, deadline).expect("register");

        table.fail_session(10);

        let res = dead.await.expect("transport failure delivered");
        assert_eq!(res.header.to_net_error().code, ErrCode::Transport);
        assert_eq!(table.len(), 1);
        drop(other);
    }
}
