//! Per-key single-writer execution cells for federated services.
//!
//! On the owning shard of a federated service, inbound requests are
//! demultiplexed by the key the dispatcher stamped on the header. Each key
//! gets a cell: an unbounded FIFO and one consumer task that runs the
//! registered handler for the request's Api and threads the cell's opaque
//! state through handler returns. Handlers for different keys run freely in
//! parallel; handlers for the same key never overlap.
//!
//! Cells are created lazily on the first request for a key and live until
//! the process exits.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock},
};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    client::Client,
    error::{ErrCode, NetError},
    message::RequestMsg,
};

/// Opaque per-key state owned by a cell's consumer loop.
///
/// Handlers downcast at entry and return the replacement state.
pub type GridState = Box<dyn Any + Send>;

/// Handler for a keyed (federated) Api.
pub type GridHandler =
    Arc<dyn Fn(Client, RequestMsg, Option<GridState>) -> BoxFuture<'static, Option<GridState>> + Send + Sync>;

/// Handler for a stateless, non-keyed Api.
pub type PlainHandler = Arc<dyn Fn(Client, RequestMsg) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler vtable and the live cells of this shard.
#[derive(Default)]
pub struct GridRegistry {
    grid_handlers: StdRwLock<HashMap<String, GridHandler>>,
    plain_handlers: StdRwLock<HashMap<String, PlainHandler>>,
    cells: StdMutex<HashMap<String, mpsc::UnboundedSender<RequestMsg>>>,
}

impl GridRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a keyed handler. Registration is static at startup.
    pub fn register_grid(&self, api: impl Into<String>, handler: GridHandler) {
        self.grid_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(api.into(), handler);
    }

    /// Register a stateless handler.
    pub fn register_plain(&self, api: impl Into<String>, handler: PlainHandler) {
        self.plain_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(api.into(), handler);
    }

    /// Names of every keyed Api, announced in the Connect handshake.
    #[must_use]
    pub fn grid_apis(&self) -> Vec<String> {
        let mut apis: Vec<String> = self
            .grid_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        apis.sort();
        apis
    }

    /// True when a keyed handler exists for the Api.
    #[must_use]
    pub fn has_grid_handler(&self, api: &str) -> bool {
        self.grid_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(api)
    }

    /// True when a stateless handler exists for the Api.
    #[must_use]
    pub fn has_plain_handler(&self, api: &str) -> bool {
        self.plain_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(api)
    }

    fn grid_handler_of(&self, api: &str) -> Option<GridHandler> {
        self.grid_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(api)
            .cloned()
    }

    fn plain_handler_of(&self, api: &str) -> Option<PlainHandler> {
        self.plain_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(api)
            .cloned()
    }

    /// Enqueue a request on the cell for its key, creating the cell on
    /// first use.
    ///
    /// # Errors
    /// Returns an `Internal` error if the cell's consumer task is gone.
    pub(crate) fn dispatch_grid(
        self: &Arc<Self>,
        client: &Client,
        req: RequestMsg,
    ) -> Result<(), NetError> {
        let key = req.header.key.clone();
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = cells.entry(key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let registry = Arc::clone(self);
            let client = client.clone();
            tokio::spawn(cell_loop(registry, client, key, rx));
            tx
        });
        sender
            .send(req)
            .map_err(|_| NetError::internal("grid cell consumer gone"))
    }

    /// Run a stateless handler on its own task.
    pub(crate) fn dispatch_plain(&self, client: &Client, req: RequestMsg) -> Result<(), NetError> {
        let Some(handler) = self.plain_handler_of(&req.header.api) else {
            return Err(NetError::new(
                ErrCode::UnknownApi,
                format!("no handler for {}", req.header.api),
            ));
        };
        let client = client.clone();
        tokio::spawn(async move {
            handler(client, req).await;
        });
        Ok(())
    }

    /// Number of live cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Serial consumer for one key. Runs until the registry drops the sender,
/// which only happens at process exit.
async fn cell_loop(
    registry: Arc<GridRegistry>,
    client: Client,
    key: String,
    mut inbound: mpsc::UnboundedReceiver<RequestMsg>,
) {
    debug!(%key, "grid cell created");
    let mut state: Option<GridState> = None;
    while let Some(req) = inbound.recv().await {
        match registry.grid_handler_of(&req.header.api) {
            Some(handler) => {
                state = handler(client.clone(), req, state.take()).await;
            }
            None => {
                let err = NetError::new(
                    ErrCode::UnknownApi,
                    format!("no handler for {}", req.header.api),
                );
                let _ = client.send_res_with_error(&req, &err).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{config::NodeConfig, message::ReqHeader};

    fn test_client() -> Client {
        Client::new(NodeConfig {
            eid: "owner1".into(),
            ..NodeConfig::default()
        })
    }

    fn keyed_request(key: &str, counter: u64) -> RequestMsg {
        RequestMsg {
            header: ReqHeader {
                spn: "ChatRoom".into(),
                api: "Count".into(),
                key: key.into(),
                txn_no: counter,
                from_eids: vec!["cli1".into()],
                ..ReqHeader::default()
            },
            body: json!({ "Counter": counter }),
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn same_key_requests_run_in_arrival_order() {
        let registry = Arc::new(GridRegistry::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        registry.register_grid(
            "Count",
            Arc::new(move |_client, req, state| {
                let record = Arc::clone(&record);
                Box::pin(async move {
                    // Hold the cell long enough for later requests to queue.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if let Ok(mut seen) = record.lock() {
                        seen.push(req.header.txn_no);
                    }
                    state
                })
            }),
        );

        let client = test_client();
        for counter in 1..=3 {
            registry
                .dispatch_grid(&client, keyed_request("K", counter))
                .expect("dispatch");
        }

        wait_until(|| seen.lock().map(|s| s.len() == 3).unwrap_or(false)).await;
        assert_eq!(*seen.lock().expect("lock"), vec![1, 2, 3]);
        assert_eq!(registry.cell_count(), 1);
    }

    #[tokio::test]
    async fn state_threads_through_handler_returns() {
        let registry = Arc::new(GridRegistry::new());
        let observed = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&observed);
        registry.register_grid(
            "Count",
            Arc::new(move |_client, _req, state| {
                let record = Arc::clone(&record);
                Box::pin(async move {
                    let count = state
                        .and_then(|s| s.downcast::<u64>().ok())
                        .map_or(0, |boxed| *boxed);
                    if let Ok(mut observed) = record.lock() {
                        observed.push(count);
                    }
                    Some(Box::new(count + 1) as GridState)
                })
            }),
        );

        let client = test_client();
        for counter in 1..=3 {
            registry
                .dispatch_grid(&client, keyed_request("K", counter))
                .expect("dispatch");
        }

        wait_until(|| observed.lock().map(|s| s.len() == 3).unwrap_or(false)).await;
        assert_eq!(*observed.lock().expect("lock"), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn distinct_keys_use_distinct_cells() {
        let registry = Arc::new(GridRegistry::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        registry.register_grid(
            "Count",
            Arc::new(move |_client, req, state| {
                let record = Arc::clone(&record);
                Box::pin(async move {
                    if let Ok(mut seen) = record.lock() {
                        seen.push(req.header.key.clone());
                    }
                    state
                })
            }),
        );

        let client = test_client();
        registry
            .dispatch_grid(&client, keyed_request("a", 1))
            .expect("dispatch");
        registry
            .dispatch_grid(&client, keyed_request("b", 2))
            .expect("dispatch");

        wait_until(|| seen.lock().map(|s| s.len() == 2).unwrap_or(false)).await;
        assert_eq!(registry.cell_count(), 2);
    }

    #[tokio::test]
    async fn plain_dispatch_rejects_unknown_api() {
        let registry = GridRegistry::new();
        let client = test_client();
        let err = registry
            .dispatch_plain(&client, keyed_request("K", 1))
            .expect_err("must fail");
        assert_eq!(err.code, ErrCode::UnknownApi);
    }
}
