//! The process-wide engine behind every mesh entity.
//!
//! A node owns the routing tables, the pending-call table, the grid
//! registry, the transaction counter, and the dialers for configured
//! remotes. Its frame dispatch braids the four concerns of the core:
//! framing, session state, correlation, and key-sharded delivery. Requests
//! whose target service is not local are forwarded dispatcher-style, with
//! federated services sharded by a stable hash of the declared key field.

use std::{
    collections::HashMap,
    future::Future,
    hash::Hasher,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, OnceLock, PoisonError,
    },
    time::Instant,
};

use fnv::FnvHasher;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::{
    net::{tcp::OwnedReadHalf, TcpListener},
    sync::watch,
    task::JoinSet,
};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, trace, warn};

use crate::{
    client::Client,
    codec::{Frame, FrameCodec},
    config::NodeConfig,
    dialer::Dialer,
    error::{ErrCode, NetError},
    grid::GridRegistry,
    message::{
        self, peek_eid, pop_eid, push_eid, AcceptHeader, ConnHeader, DieHeader, MsgType,
        PingHeader, ReqHeader, RequestMsg, ResponseMsg, Topology,
    },
    pending::{self, PendingTable},
    router::{Router, SpnMeta},
    session::{Session, SessionRole, SessionStatus},
};

/// What the read loop should do after a frame was handled.
enum FrameDisposition {
    Continue,
    Close,
}

/// Process-wide state of one mesh entity.
pub struct Node {
    cfg: NodeConfig,
    topology: OnceLock<Topology>,
    pub(crate) router: Router,
    pub(crate) pending: Arc<PendingTable>,
    pub(crate) grid: Arc<GridRegistry>,
    txn_counter: AtomicU64,
    dialers: StdMutex<HashMap<u64, Arc<Dialer>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: StdMutex<JoinSet<()>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl Node {
    /// Build a node from its configuration. Nothing runs until
    /// [`Node::dial`] is called.
    #[must_use]
    pub fn new(cfg: NodeConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            cfg,
            topology: OnceLock::new(),
            router: Router::new(),
            pending: Arc::new(PendingTable::new()),
            grid: Arc::new(GridRegistry::new()),
            txn_counter: AtomicU64::new(0),
            dialers: StdMutex::new(HashMap::new()),
            shutdown_tx,
            tasks: StdMutex::new(JoinSet::new()),
            local_addr: StdMutex::new(None),
        }
    }

    /// Entity id of this process.
    #[must_use]
    pub fn eid(&self) -> &str {
        &self.cfg.eid
    }

    /// Topology announced at dial time; default until then.
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.topology.get().cloned().unwrap_or_default()
    }

    /// Bound accept address, once the listener is up.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_txn_no(&self) -> u64 {
        self.txn_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn dialer_of(&self, session_id: u64) -> Option<Arc<Dialer>> {
        self.dialers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .cloned()
    }

    /// Supervise a background task; it must exit once the shutdown signal
    /// fires, so the drain in [`Node::shutdown`] completes.
    fn spawn_task(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(task);
    }

    /// Boot the node: start the pending sweeper, bind the accept side if
    /// configured, and begin dialing every configured remote.
    ///
    /// # Errors
    /// Returns a `Parsing` error for invalid configuration, a `Transport`
    /// error if the bind fails, or an `Internal` error on a second call.
    pub(crate) async fn dial(self: &Arc<Self>, topology: Topology) -> Result<(), NetError> {
        self.cfg.validate()?;
        if self.topology.set(topology).is_err() {
            return Err(NetError::internal("node already dialed"));
        }

        self.spawn_task(pending::run_sweeper(
            Arc::clone(&self.pending),
            self.cfg.sweep_interval(),
            self.shutdown_tx.subscribe(),
        ));

        if !self.cfg.bind.is_empty() {
            let listener = TcpListener::bind(&self.cfg.bind)
                .await
                .map_err(NetError::from)?;
            let addr = listener.local_addr().map_err(NetError::from)?;
            {
                let mut guard = self
                    .local_addr
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *guard = Some(addr);
            }
            info!(%addr, eid = %self.cfg.eid, "accepting peer sessions");
            let node = Arc::clone(self);
            self.spawn_task(node.accept_loop(listener, self.shutdown_tx.subscribe()));
        }

        for remote in self.cfg.parsed_remotes()? {
            let session = Arc::new(Session::active(&remote.spn));
            let dialer = Arc::new(Dialer::new(Arc::clone(&session), remote, &self.cfg));
            {
                let mut dialers = self
                    .dialers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                dialers.insert(session.id(), Arc::clone(&dialer));
            }
            dialer.spawn_dial(Arc::clone(self), std::time::Duration::ZERO);
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        debug!(%peer, "peer connected");
                        let session = Arc::new(Session::passive());
                        let read_half = session.attach(stream).await;
                        tokio::spawn(Arc::clone(&self).read_loop(session, read_half));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    /// Per-session read loop: decode frames in order and dispatch them.
    /// Any framing or protocol error tears the session down.
    pub(crate) async fn read_loop(
        self: Arc<Self>,
        session: Arc<Session>,
        read_half: OwnedReadHalf,
    ) {
        let mut frames = FramedRead::new(read_half, FrameCodec::new());
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => {
                    session.touch();
                    trace!(
                        target: "lattice::wire",
                        session = session.id(),
                        msg_type = %frame.msg_type,
                        header_len = frame.header.len(),
                        body_len = frame.body.len(),
                        "frame in"
                    );
                    match self.on_frame(&session, frame).await {
                        Ok(FrameDisposition::Continue) => {}
                        Ok(FrameDisposition::Close) => break,
                        Err(e) => {
                            warn!(session = session.id(), error = %e, "protocol error");
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!(session = session.id(), error = %e, "read failed");
                    break;
                }
            }
        }
        self.teardown_session(&session).await;
    }

    /// Close a session and cascade: deregister routes, fail its pending
    /// entries, and nudge its dialer if it has one.
    pub(crate) async fn teardown_session(self: &Arc<Self>, session: &Arc<Session>) {
        session.close().await;
        self.router.remove_session(session.id());
        self.pending.fail_session(session.id());
        if let Some(dialer) = self.dialer_of(session.id()) {
            dialer.check_and_redial(self);
        }
    }

    async fn on_frame(
        self: &Arc<Self>,
        session: &Arc<Session>,
        frame: Frame,
    ) -> Result<FrameDisposition, NetError> {
        // A passive session must introduce itself before anything else.
        if session.role() == SessionRole::Passive
            && session.remote_eid().is_none()
            && frame.msg_type != MsgType::Connect
        {
            return Err(NetError::parsing("first frame was not Connect"));
        }
        match frame.msg_type {
            MsgType::Connect => self.on_connect(session, &frame).await,
            MsgType::Accept => self.on_accept(session, &frame),
            MsgType::Ping => self.on_ping(session, &frame),
            MsgType::Die => self.on_die(session, &frame),
            MsgType::Request => self.on_request(session, &frame).await,
            MsgType::Response => self.on_response(&frame).await,
        }
    }

    async fn on_connect(
        self: &Arc<Self>,
        session: &Arc<Session>,
        frame: &Frame,
    ) -> Result<FrameDisposition, NetError> {
        if session.role() != SessionRole::Passive {
            return Err(NetError::parsing("Connect on an active session"));
        }
        let header: ConnHeader = serde_json::from_slice(&frame.header)?;
        header.validate()?;
        let body: Topology = serde_json::from_slice(&frame.body)?;
        let meta = SpnMeta {
            federated_key: body.federated_key.clone(),
            federated_apis: body.federated_apis.clone(),
        };
        match self.router.register_peer(&header.eid, &body.spn, meta, session) {
            Ok(()) => {
                session.set_remote_eid(&header.eid);
                session.set_remote_spn(&body.spn);
                session.set_status(SessionStatus::Accepted);
                session
                    .send(message::build_accept(&NetError::new(ErrCode::Success, ""))?)
                    .await?;
                info!(eid = %header.eid, spn = %body.spn, "peer accepted");
                Ok(FrameDisposition::Continue)
            }
            Err(err) => {
                warn!(eid = %header.eid, error = %err, "peer rejected");
                let _ = session.send(message::build_accept(&err)?).await;
                Ok(FrameDisposition::Close)
            }
        }
    }

    fn on_accept(
        self: &Arc<Self>,
        session: &Arc<Session>,
        frame: &Frame,
    ) -> Result<FrameDisposition, NetError> {
        if session.role() != SessionRole::Active {
            return Err(NetError::parsing("Accept on a passive session"));
        }
        let header: AcceptHeader = serde_json::from_slice(&frame.header)?;
        let verdict = header.to_net_error();
        if verdict.is_success() {
            session.set_status(SessionStatus::Accepted);
            let spn = session.remote_spn().unwrap_or_default();
            self.router.register_remote(&spn, session);
            info!(%spn, session = session.id(), "handshake accepted");
            return Ok(FrameDisposition::Continue);
        }
        warn!(
            code = verdict.code.as_u32(),
            text = %verdict.text,
            "handshake rejected"
        );
        if let Some(dialer) = self.dialer_of(session.id()) {
            dialer.suppress(self.cfg.grace());
        }
        Ok(FrameDisposition::Close)
    }

    fn on_ping(
        &self,
        session: &Arc<Session>,
        frame: &Frame,
    ) -> Result<FrameDisposition, NetError> {
        let header: PingHeader = serde_json::from_slice(&frame.header)?;
        header.validate()?;
        // Pings carry the peer's Eid; keep the return-path binding fresh.
        self.router.bind_eid(&header.eid, session);
        trace!(eid = %header.eid, session = session.id(), "ping");
        Ok(FrameDisposition::Continue)
    }

    fn on_die(
        &self,
        session: &Arc<Session>,
        frame: &Frame,
    ) -> Result<FrameDisposition, NetError> {
        let header: DieHeader = serde_json::from_slice(&frame.header)?;
        header.validate()?;
        info!(eid = %header.eid, "peer announced shutdown");
        if let Some(dialer) = self.dialer_of(session.id()) {
            dialer.suppress(self.cfg.grace());
        }
        Ok(FrameDisposition::Close)
    }

    async fn on_request(
        self: &Arc<Self>,
        session: &Arc<Session>,
        frame: &Frame,
    ) -> Result<FrameDisposition, NetError> {
        let req = RequestMsg::from_frame(frame)?;
        // The top of the path stack is the adjacent sender; learn its
        // binding so the reply can retrace this hop.
        if let Some(prev_hop) = peek_eid(&req.header.from_eids) {
            self.router.bind_eid(prev_hop, session);
        }
        if self.is_local_target(&req.header) {
            self.deliver_local(req).await;
        } else {
            self.forward(req).await;
        }
        Ok(FrameDisposition::Continue)
    }

    fn is_local_target(&self, header: &ReqHeader) -> bool {
        if header.to_eid == self.cfg.eid {
            return true;
        }
        let topology = self.topology();
        !topology.spn.is_empty() && header.spn == topology.spn && header.to_eid.is_empty()
    }

    async fn deliver_local(self: &Arc<Self>, req: RequestMsg) {
        let client = Client::from_node(Arc::clone(self));
        let api = req.header.api.clone();
        let result = if self.topology().is_federated() && self.grid.has_grid_handler(&api) {
            if req.header.key.is_empty() {
                Err(NetError::new(
                    ErrCode::NoKey,
                    "request missing federation key",
                ))
            } else {
                self.grid.dispatch_grid(&client, req.clone())
            }
        } else if self.grid.has_plain_handler(&api) {
            self.grid.dispatch_plain(&client, req.clone())
        } else {
            Err(NetError::new(
                ErrCode::UnknownApi,
                format!("no handler for {api}"),
            ))
        };
        if let Err(err) = result {
            warn!(%api, code = err.code.as_u32(), "local delivery failed");
            if let Err(e) = self.send_res_inner(&req, Some(&err), Value::Null).await {
                debug!(error = %e, "error response not delivered");
            }
        }
    }

    /// Dispatcher path: pick the outbound session for a request whose
    /// target service is not this node.
    async fn forward(self: &Arc<Self>, mut req: RequestMsg) {
        let spn = req.header.spn.clone();
        let chosen = if !req.header.to_eid.is_empty() {
            self.router
                .session_for_eid(&req.header.to_eid)
                .ok_or_else(|| {
                    NetError::new(
                        ErrCode::NoRoute,
                        format!("no session for Eid {}", req.header.to_eid),
                    )
                })
        } else if let Some(meta) = self.router.meta_of(&spn).filter(SpnMeta::is_federated) {
            self.shard_for_key(&spn, &meta, &mut req)
        } else {
            self.router.pick(&spn).ok_or_else(|| {
                NetError::new(ErrCode::NoRoute, format!("no session for Spn {spn}"))
            })
        };
        let target = match chosen {
            Ok(target) => target,
            Err(err) => {
                debug!(%spn, code = err.code.as_u32(), "cannot forward request");
                if let Err(e) = self.send_res_inner(&req, Some(&err), Value::Null).await {
                    debug!(error = %e, "error response not delivered");
                }
                return;
            }
        };
        push_eid(&mut req.header.from_eids, self.cfg.eid.clone());
        let outcome = match message::build_request(&req.header, &req.body) {
            Ok(frame) => target.send(frame).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            pop_eid(&mut req.header.from_eids);
            warn!(%spn, error = %err, "forward failed");
            let failure = NetError::new(ErrCode::Transport, "forwarding failed");
            if let Err(e) = self.send_res_inner(&req, Some(&failure), Value::Null).await {
                debug!(error = %e, "error response not delivered");
            }
        }
    }

    /// Hash the declared key field out of the body and pick the owner.
    fn shard_for_key(
        &self,
        spn: &str,
        meta: &SpnMeta,
        req: &mut RequestMsg,
    ) -> Result<Arc<Session>, NetError> {
        let key = match req.body.get(&meta.federated_key) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(NetError::new(
                    ErrCode::NoKey,
                    format!("request body missing {} for {spn}", meta.federated_key),
                ))
            }
        };
        let members = self.router.members_of(spn);
        if members.is_empty() {
            return Err(NetError::new(
                ErrCode::NoRoute,
                format!("no session for Spn {spn}"),
            ));
        }
        // Best-effort sharding: membership events move keys.
        let idx = usize::try_from(hash_key(&key) % members.len() as u64)
            .map_err(|_| NetError::internal("shard index overflow"))?;
        let (eid, session) = &members[idx];
        req.header.key = key;
        req.header.to_eid.clone_from(eid);
        Ok(Arc::clone(session))
    }

    async fn on_response(self: &Arc<Self>, frame: &Frame) -> Result<FrameDisposition, NetError> {
        let mut res = ResponseMsg::from_frame(frame)?;
        if res.header.to_eids.is_empty() {
            self.pending.resolve(res.header.txn_no, res);
            return Ok(FrameDisposition::Continue);
        }
        let Some(next_hop) = pop_eid(&mut res.header.to_eids) else {
            return Ok(FrameDisposition::Continue);
        };
        match self.router.session_for_eid(&next_hop) {
            Some(target) => {
                let frame = message::build_response(&res.header, &res.body)?;
                if let Err(err) = target.send(frame).await {
                    debug!(%next_hop, error = %err, "dropping response");
                }
            }
            None => {
                debug!(
                    %next_hop,
                    txn_no = res.header.txn_no,
                    "dropping response with no route"
                );
            }
        }
        Ok(FrameDisposition::Continue)
    }

    /// Issue a request and await its response, timeout, or transport
    /// failure. A non-zero response code is re-raised as the error.
    pub(crate) async fn send_req(
        self: &Arc<Self>,
        spn: &str,
        api: &str,
        to_eid: &str,
        body: Value,
    ) -> Result<ResponseMsg, NetError> {
        let txn_no = self.next_txn_no();
        let header = ReqHeader {
            spn: spn.to_owned(),
            api: api.to_owned(),
            txn_no,
            to_eid: to_eid.to_owned(),
            from_eids: vec![self.cfg.eid.clone()],
            ..ReqHeader::default()
        };
        let session = self.select_session(&header)?;
        let deadline = Instant::now() + self.cfg.request_timeout();
        let source = self.pending.register(txn_no, session.id(), deadline)?;
        let frame = message::build_request(&header, &body)?;
        if let Err(err) = session.send(frame).await {
            self.pending.unregister(txn_no);
            return Err(err);
        }
        let response = source
            .await
            .map_err(|_| NetError::internal("response sink dropped"))?;
        if response.header.is_success() {
            Ok(response)
        } else {
            Err(response.header.to_net_error())
        }
    }

    /// Issue a request whose response the caller does not await.
    pub(crate) async fn send_noti(
        self: &Arc<Self>,
        spn: &str,
        api: &str,
        body: Value,
    ) -> Result<(), NetError> {
        let txn_no = self.next_txn_no();
        let header = ReqHeader {
            spn: spn.to_owned(),
            api: api.to_owned(),
            txn_no,
            from_eids: vec![self.cfg.eid.clone()],
            ..ReqHeader::default()
        };
        let session = self.select_session(&header)?;
        // Throwaway sink with an already-expired deadline; the next sweep
        // clears the entry and the response, if any, is dropped as late.
        let _source = self
            .pending
            .register(txn_no, session.id(), Instant::now())?;
        let frame = message::build_request(&header, &body)?;
        session.send(frame).await
    }

    fn select_session(&self, header: &ReqHeader) -> Result<Arc<Session>, NetError> {
        if !header.to_eid.is_empty() {
            return self
                .router
                .session_for_eid(&header.to_eid)
                .ok_or_else(|| {
                    NetError::new(
                        ErrCode::NoRoute,
                        format!("no session for Eid {}", header.to_eid),
                    )
                });
        }
        // No direct session for the target: route through the default
        // upstream, usually the dispatcher this leaf dialed.
        self.router
            .pick(&header.spn)
            .or_else(|| self.router.default_session())
            .ok_or_else(|| {
                NetError::new(
                    ErrCode::NoRoute,
                    format!("no session for Spn {}", header.spn),
                )
            })
    }

    /// Send a response back along the inverse of the request path.
    ///
    /// A missing next hop is dropped with a log; the originator will time
    /// out.
    pub(crate) async fn send_res_inner(
        &self,
        req: &RequestMsg,
        verdict: Option<&NetError>,
        body: Value,
    ) -> Result<(), NetError> {
        let mut to_eids = req.header.from_eids.clone();
        let Some(next_hop) = pop_eid(&mut to_eids) else {
            debug!(txn_no = req.header.txn_no, "response has no return path");
            return Ok(());
        };
        let mut header = crate::message::ResHeader {
            txn_no: req.header.txn_no,
            ext_txn_no: req.header.ext_txn_no,
            to_eids,
            ..crate::message::ResHeader::default()
        };
        // Error responses carry an empty body.
        let body = match verdict {
            Some(err) => {
                header.set_error(err);
                Value::Null
            }
            None => body,
        };
        let Some(target) = self.router.session_for_eid(&next_hop) else {
            debug!(
                %next_hop,
                txn_no = req.header.txn_no,
                "dropping response with no route"
            );
            return Ok(());
        };
        let frame = message::build_response(&header, &body)?;
        target.send(frame).await
    }

    /// Broadcast `Die`, close every session, and drain background tasks.
    pub(crate) async fn shutdown(&self) {
        info!(eid = %self.cfg.eid, "shutting down");
        let dialers: Vec<Arc<Dialer>> = self
            .dialers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for dialer in &dialers {
            // Redial must not race the shutdown; park every dialer well
            // past the process lifetime.
            dialer.suppress(std::time::Duration::from_secs(86_400));
        }
        // Stop the accept loop and the sweeper, then say goodbye.
        let _ = self.shutdown_tx.send(true);
        match message::build_die(&self.cfg.eid) {
            Ok(die) => {
                for session in self.router.all_sessions() {
                    let _ = session.send(die.clone()).await;
                    session.close().await;
                }
            }
            Err(e) => error!(error = %e, "could not build Die frame"),
        }
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "background task failed");
            }
        }
    }
}

/// Stable 64-bit FNV-1a hash of a federation key.
fn hash_key(key: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_numbers_are_unique_and_increasing() {
        let node = Node::new(NodeConfig {
            eid: "n1".into(),
            ..NodeConfig::default()
        });
        let first = node.next_txn_no();
        let second = node.next_txn_no();
        let third = node.next_txn_no();
        assert!(first < second && second < third);
        assert_ne!(first, 0);
    }

    #[test]
    fn key_hash_is_stable() {
        assert_eq!(hash_key("42"), hash_key("42"));
        assert_ne!(hash_key("42"), hash_key("43"));
    }

    #[test]
    fn local_target_matches_eid_and_spn() {
        let node = Node::new(NodeConfig {
            eid: "rm1".into(),
            ..NodeConfig::default()
        });
        let node = Arc::new(node);
        node.topology
            .set(Topology {
                spn: "ChatRoom".into(),
                ..Topology::default()
            })
            .expect("set topology");

        let mut header = ReqHeader {
            spn: "ChatRoom".into(),
            api: "JoinRoom".into(),
            txn_no: 1,
            ..ReqHeader::default()
        };
        assert!(node.is_local_target(&header));

        header.to_eid = "rm2".into();
        assert!(!node.is_local_target(&header));

        header.to_eid = "rm1".into();
        header.spn = "Other".into();
        assert!(node.is_local_target(&header));
    }
}
