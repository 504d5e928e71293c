//! Process-wide routing tables.
//!
//! Two hot maps decide where frames go: `SpnSessions`, an ordered member
//! ring per service provider used for round-robin and federation hashing,
//! and `EidSession`, the exact-entity map used for forwarded requests and
//! return paths. A third map keeps the federation metadata each peer
//! declared at Connect time. Writers are rare (connect/disconnect); readers
//! run on every send, so everything sits behind read-write locks.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, PoisonError, RwLock as StdRwLock,
    },
};

use tracing::debug;

use crate::{
    error::NetError,
    session::{Session, SessionRole, SessionStatus},
};

/// Federation metadata a peer declares when it connects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpnMeta {
    /// Body field dispatchers hash to shard requests; empty when not
    /// federated.
    pub federated_key: String,
    /// Apis the peer serves through its grid registry.
    pub federated_apis: Vec<String>,
}

impl SpnMeta {
    /// True when requests to this service must be sharded by key.
    #[must_use]
    pub fn is_federated(&self) -> bool {
        !self.federated_key.is_empty()
    }
}

struct SpnMember {
    eid: String,
    session: Arc<Session>,
}

#[derive(Default)]
struct SpnRing {
    members: Vec<SpnMember>,
    cursor: AtomicUsize,
}

/// Routing tables shared by every send path in the node.
#[derive(Default)]
pub struct Router {
    spn_sessions: StdRwLock<HashMap<String, SpnRing>>,
    eid_sessions: StdRwLock<HashMap<String, Arc<Session>>>,
    spn_meta: StdRwLock<HashMap<String, SpnMeta>>,
}

impl Router {
    /// Create empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an accepted peer under its Eid and Spn.
    ///
    /// # Errors
    /// Returns an `Internal` error when the Eid is already registered to a
    /// live session; the caller rejects the handshake with it.
    pub fn register_peer(
        &self,
        eid: &str,
        spn: &str,
        meta: SpnMeta,
        session: &Arc<Session>,
    ) -> Result<(), NetError> {
        {
            let mut eids = self
                .eid_sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if eids.contains_key(eid) {
                return Err(NetError::internal(format!("Eid {eid} already registered")));
            }
            eids.insert(eid.to_owned(), Arc::clone(session));
        }
        self.add_member(spn, eid, session);
        self.merge_meta(spn, meta);
        debug!(eid, spn, session = session.id(), "peer registered");
        Ok(())
    }

    /// Register an active-side session under its configured remote Spn.
    ///
    /// The peer's Eid is learned later from inbound traffic.
    pub fn register_remote(&self, spn: &str, session: &Arc<Session>) {
        let eid = session.remote_eid().unwrap_or_default();
        if !eid.is_empty() {
            self.bind_eid(&eid, session);
        }
        self.add_member(spn, &eid, session);
        debug!(spn, session = session.id(), "remote registered");
    }

    /// Bind an Eid to the session it was observed on.
    ///
    /// Return paths are looked up by Eid; the active side learns peer Eids
    /// from the frames they send rather than from the handshake.
    pub fn bind_eid(&self, eid: &str, session: &Arc<Session>) {
        let mut eids = self
            .eid_sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        eids.insert(eid.to_owned(), Arc::clone(session));
    }

    fn add_member(&self, spn: &str, eid: &str, session: &Arc<Session>) {
        let mut rings = self
            .spn_sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let ring = rings.entry(spn.to_owned()).or_default();
        if ring
            .members
            .iter()
            .any(|m| m.session.id() == session.id())
        {
            return;
        }
        ring.members.push(SpnMember {
            eid: eid.to_owned(),
            session: Arc::clone(session),
        });
    }

    /// Merge federation metadata declared for a service provider.
    pub fn merge_meta(&self, spn: &str, meta: SpnMeta) {
        if meta == SpnMeta::default() {
            return;
        }
        let mut metas = self
            .spn_meta
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        metas.insert(spn.to_owned(), meta);
    }

    /// Federation metadata for a service provider, if any was declared.
    #[must_use]
    pub fn meta_of(&self, spn: &str) -> Option<SpnMeta> {
        self.spn_meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(spn)
            .cloned()
    }

    /// Drop every table entry referring to the given session.
    pub fn remove_session(&self, session_id: u64) {
        {
            let mut rings = self
                .spn_sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for ring in rings.values_mut() {
                ring.members.retain(|m| m.session.id() != session_id);
            }
        }
        let mut eids = self
            .eid_sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        eids.retain(|_, s| s.id() != session_id);
    }

    /// Pick the next routable session for a service provider, round-robin.
    #[must_use]
    pub fn pick(&self, spn: &str) -> Option<Arc<Session>> {
        let rings = self
            .spn_sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let ring = rings.get(spn)?;
        let n = ring.members.len();
        if n == 0 {
            return None;
        }
        let start = ring.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let member = &ring.members[(start + i) % n];
            if member.session.status() == SessionStatus::Accepted {
                return Some(Arc::clone(&member.session));
            }
        }
        None
    }

    /// Routable members of a service provider in registration order.
    ///
    /// The dispatcher hashes federation keys over this list, so its order
    /// must be stable between membership events.
    #[must_use]
    pub fn members_of(&self, spn: &str) -> Vec<(String, Arc<Session>)> {
        let rings = self
            .spn_sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        rings
            .get(spn)
            .map(|ring| {
                ring.members
                    .iter()
                    .filter(|m| m.session.status() == SessionStatus::Accepted)
                    .map(|m| (m.eid.clone(), Arc::clone(&m.session)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look up the live session bound to an exact entity.
    #[must_use]
    pub fn session_for_eid(&self, eid: &str) -> Option<Arc<Session>> {
        let eids = self
            .eid_sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        eids.get(eid)
            .filter(|s| s.is_established())
            .map(Arc::clone)
    }

    /// True when at least one routable session exists for the Spn.
    #[must_use]
    pub fn has_route(&self, spn: &str) -> bool {
        !self.members_of(spn).is_empty()
    }

    /// The default upstream for targets with no direct session.
    ///
    /// A leaf typically holds one active session, to its dispatcher, and
    /// routes every call through it regardless of the target Spn.
    #[must_use]
    pub fn default_session(&self) -> Option<Arc<Session>> {
        let rings = self
            .spn_sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for ring in rings.values() {
            for member in &ring.members {
                if member.session.role() == SessionRole::Active
                    && member.session.status() == SessionStatus::Accepted
                {
                    return Some(Arc::clone(&member.session));
                }
            }
        }
        None
    }

    /// Every distinct session known to the tables.
    #[must_use]
    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        let mut seen = std::collections::HashSet::new();
        let mut sessions = Vec::new();
        {
            let rings = self
                .spn_sessions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for ring in rings.values() {
                for member in &ring.members {
                    if seen.insert(member.session.id()) {
                        sessions.push(Arc::clone(&member.session));
                    }
                }
            }
        }
        let eids = self
            .eid_sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for session in eids.values() {
            if seen.insert(session.id()) {
                sessions.push(Arc::clone(session));
            }
        }
        sessions
    }
}
