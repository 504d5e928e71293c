//! Public facade binding handler modules to the transport.
//!
//! A [`Client`] is a cheap clone over the process-wide [`Node`]. Business
//! handlers see only this surface: issue calls, answer requests, register
//! handlers, and boot the node. Sessions, the pending table, and framing
//! stay internal.

use std::{future::Future, net::SocketAddr, sync::Arc};

use serde::Serialize;
use serde_json::Value;

use crate::{
    config::NodeConfig,
    error::NetError,
    grid::GridState,
    message::{RequestMsg, ResponseMsg, Topology},
    node::Node,
};

/// Handle to one mesh entity, shared by every handler in the process.
#[derive(Clone)]
pub struct Client {
    node: Arc<Node>,
}

impl Client {
    /// Create the entity from its configuration. Nothing connects until
    /// [`Client::dial`] is called, so handlers can be registered first.
    #[must_use]
    pub fn new(cfg: NodeConfig) -> Self {
        Self {
            node: Arc::new(Node::new(cfg)),
        }
    }

    pub(crate) fn from_node(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// Entity id of this process.
    #[must_use]
    pub fn eid(&self) -> &str {
        self.node.eid()
    }

    /// Boot the node: announce `topology`, start accepting if configured,
    /// and begin dialing the configured remotes.
    ///
    /// # Errors
    /// Returns a `Parsing` error for invalid configuration, a `Transport`
    /// error if the bind fails, or an `Internal` error on a second call.
    pub async fn dial(&self, topology: Topology) -> Result<(), NetError> {
        self.node.dial(topology).await
    }

    /// Broadcast `Die` to all peers and stop the node.
    pub async fn shutdown(&self) {
        self.node.shutdown().await;
    }

    /// Issue a request to any entity of `spn` and await the response.
    ///
    /// # Errors
    /// Returns `NoRoute` when no session exists for the target, `Transport`
    /// or `Timeout` for delivery failures, and any non-zero error a remote
    /// handler put in the response header.
    pub async fn send_req<T: Serialize>(
        &self,
        spn: &str,
        api: &str,
        body: &T,
    ) -> Result<ResponseMsg, NetError> {
        let body = serde_json::to_value(body)?;
        self.node.send_req(spn, api, "", body).await
    }

    /// Issue a request to one exact entity and await the response.
    ///
    /// # Errors
    /// As [`Client::send_req`], with `NoRoute` when the entity is unknown.
    pub async fn send_req_to<T: Serialize>(
        &self,
        spn: &str,
        api: &str,
        to_eid: &str,
        body: &T,
    ) -> Result<ResponseMsg, NetError> {
        let body = serde_json::to_value(body)?;
        self.node.send_req(spn, api, to_eid, body).await
    }

    /// Issue a request whose response the caller does not await.
    ///
    /// # Errors
    /// Returns `NoRoute` or `Transport` when the notification cannot be
    /// written; a missing or failed remote handler is never reported.
    pub async fn send_noti<T: Serialize>(
        &self,
        spn: &str,
        api: &str,
        body: &T,
    ) -> Result<(), NetError> {
        let body = serde_json::to_value(body)?;
        self.node.send_noti(spn, api, body).await
    }

    /// Answer a request with a successful body.
    ///
    /// # Errors
    /// Returns `Transport` when the response cannot be written to the next
    /// hop. A missing return path is dropped silently; the originator will
    /// time out.
    pub async fn send_res<T: Serialize>(
        &self,
        req: &RequestMsg,
        body: &T,
    ) -> Result<(), NetError> {
        let body = serde_json::to_value(body)?;
        self.node.send_res_inner(req, None, body).await
    }

    /// Answer a request with an error verdict and an empty body.
    ///
    /// # Errors
    /// As [`Client::send_res`].
    pub async fn send_res_with_error(
        &self,
        req: &RequestMsg,
        err: &NetError,
    ) -> Result<(), NetError> {
        self.node.send_res_inner(req, Some(err), Value::Null).await
    }

    /// Register a keyed handler for a federated Api. Must run before
    /// [`Client::dial`].
    pub fn register_grid_handler<F, Fut>(&self, api: impl Into<String>, handler: F)
    where
        F: Fn(Client, RequestMsg, Option<GridState>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<GridState>> + Send + 'static,
    {
        self.node.grid.register_grid(
            api,
            Arc::new(move |client, req, state| Box::pin(handler(client, req, state))),
        );
    }

    /// Register a stateless handler for a non-keyed Api. Must run before
    /// [`Client::dial`].
    pub fn register_handler<F, Fut>(&self, api: impl Into<String>, handler: F)
    where
        F: Fn(Client, RequestMsg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.node
            .grid
            .register_plain(api, Arc::new(move |client, req| Box::pin(handler(client, req))));
    }

    /// Names of the registered keyed Apis, for the dial topology.
    #[must_use]
    pub fn list_grid_apis(&self) -> Vec<String> {
        self.node.grid.grid_apis()
    }

    /// True when at least one routable session exists for `spn`.
    #[must_use]
    pub fn has_route(&self, spn: &str) -> bool {
        self.node.router.has_route(spn)
    }

    /// Bound accept address, once the listener is up.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.node.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrCode;

    fn client() -> Client {
        Client::new(NodeConfig {
            eid: "n1".into(),
            ..NodeConfig::default()
        })
    }

    #[tokio::test]
    async fn send_req_without_routes_is_no_route() {
        let err = client()
            .send_req("Nowhere", "Echo", &serde_json::json!({}))
            .await
            .expect_err("must fail");
        assert_eq!(err.code, ErrCode::NoRoute);
    }

    #[tokio::test]
    async fn dial_rejects_missing_eid() {
        let client = Client::new(NodeConfig::default());
        let err = client
            .dial(Topology::default())
            .await
            .expect_err("must fail");
        assert_eq!(err.code, ErrCode::Parsing);
    }

    #[test]
    fn grid_apis_are_listed_sorted() {
        let client = client();
        client.register_grid_handler("JoinRoom", |_c, _req, state| async move { state });
        client.register_grid_handler("GetRoom", |_c, _req, state| async move { state });
        assert_eq!(
            client.list_grid_apis(),
            vec!["GetRoom".to_string(), "JoinRoom".to_string()]
        );
    }
}
