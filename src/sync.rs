//! Anti-entropy between peers.
//!
//! Every tick the engine asks the peer registry for the peers that are not
//! cooling down and runs one round per peer concurrently:
//!
//! ```text
//! Dialing -> Exchanging -> Merging -> Done
//!        \            \           \-> Failed
//! ```
//!
//! Rounds only do network I/O; their results come back over a channel and
//! are merged one at a time, so the store sees a single writer per tick.
//! A slow or dead peer costs at most one request timeout and never holds
//! up the others.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::StatusCode;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::error::SyncError;
use crate::node::Node;
use crate::types::{MergeReport, SyncRequest, SyncResponse};

/// Request/response exchange with a peer's endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn exchange(&self, peer: &str, request: &SyncRequest) -> Result<SyncResponse, SyncError>;
}

/// JSON over HTTP, `POST {peer}/sync`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SyncError::Protocol("client".into(), e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn exchange(&self, peer: &str, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        let url = format!("{}/sync", peer.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| classify(peer, e))?;

        match response.status() {
            StatusCode::CONFLICT => Err(SyncError::NamespaceMismatch {
                peer: peer.to_string(),
                namespace: request.namespace.clone(),
            }),
            StatusCode::LOOP_DETECTED => Err(SyncError::SelfPeer(peer.to_string())),
            status if !status.is_success() => Err(SyncError::Protocol(
                peer.to_string(),
                format!("unexpected status {}", status),
            )),
            _ => response
                .json::<SyncResponse>()
                .await
                .map_err(|e| classify(peer, e)),
        }
    }
}

fn classify(peer: &str, e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout(peer.to_string())
    } else if e.is_connect() || e.is_request() {
        SyncError::PeerUnreachable(peer.to_string(), e.to_string())
    } else {
        SyncError::Protocol(peer.to_string(), e.to_string())
    }
}

/// How a round with one peer ended.
#[derive(Debug)]
pub enum RoundState {
    Done(MergeReport),
    Failed(SyncError),
}

#[derive(Debug)]
pub struct PeerRound {
    pub peer: String,
    pub state: RoundState,
}

pub struct SyncEngine {
    node: Arc<Node>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    timeout: Duration,
}

impl SyncEngine {
    pub fn new(
        node: Arc<Node>,
        transport: Arc<dyn Transport>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            node,
            transport,
            interval,
            timeout,
        }
    }

    /// Tick until `shutdown` fires.  A round in flight at shutdown is
    /// dropped, which aborts its requests.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Sync engine started, interval {:?}", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        rounds = self.tick() => {
                            let failed = rounds
                                .iter()
                                .filter(|r| matches!(r.state, RoundState::Failed(_)))
                                .count();
                            debug!("Tick finished: {} rounds, {} failed", rounds.len(), failed);
                        }
                    }
                }
            }
        }
        info!("Sync engine stopped");
    }

    /// One sync round with every eligible peer.
    pub async fn tick(&self) -> Vec<PeerRound> {
        self.node.flush_if_dirty().await;

        let candidates = self.node.peers().lock().await.candidates(Instant::now());
        if candidates.is_empty() {
            debug!("No peers eligible for sync");
            return Vec::new();
        }

        let request = self.node.sync_request().await;
        let (tx, mut rx) = mpsc::channel(candidates.len());
        let mut tasks = JoinSet::new();
        for peer in candidates {
            let tx = tx.clone();
            let transport = Arc::clone(&self.transport);
            let request = request.addressed_to(&peer);
            let timeout = self.timeout;
            tasks.spawn(async move {
                debug!("[{}] dialing", peer);
                let result = match tokio::time::timeout(timeout, transport.exchange(&peer, &request)).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout(peer.clone())),
                };
                let _ = tx.send((peer, result)).await;
            });
        }
        drop(tx);

        let mut rounds = Vec::new();
        while let Some((peer, result)) = rx.recv().await {
            let state = self.merge(&peer, result).await;
            rounds.push(PeerRound { peer, state });
        }
        rounds
    }

    async fn merge(&self, peer: &str, result: Result<SyncResponse, SyncError>) -> RoundState {
        let outcome = match result {
            Ok(response) => {
                debug!("[{}] merging {} records", peer, response.records.len());
                self.node.apply_response(peer, response).await
            }
            Err(e) => Err(e),
        };
        {
            let mut peers = self.node.peers().lock().await;
            match &outcome {
                Err(SyncError::SelfPeer(_)) => {
                    peers.forget(peer);
                }
                _ => peers.record_result(peer, outcome.is_ok(), Instant::now()),
            }
        }

        match outcome {
            Ok(report) => {
                debug!("[{}] done: {:?}", peer, report);
                RoundState::Done(report)
            }
            Err(e) => {
                warn!("[{}] sync failed: {}", peer, e);
                RoundState::Failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::node::tests::test_node;
    use std::collections::HashMap;

    /// Routes requests straight into other nodes' inbound handler.
    #[derive(Default)]
    struct LocalTransport {
        nodes: HashMap<String, Arc<Node>>,
    }

    #[async_trait]
    impl Transport for LocalTransport {
        async fn exchange(&self, peer: &str, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
            let node = self
                .nodes
                .get(peer)
                .ok_or_else(|| SyncError::PeerUnreachable(peer.to_string(), "no route".into()))?;
            node.handle_sync(request.clone())
                .await
                .map_err(|e| match e {
                    StoreError::SelfSync => SyncError::SelfPeer(peer.to_string()),
                    _ => SyncError::NamespaceMismatch {
                        peer: peer.to_string(),
                        namespace: request.namespace.clone(),
                    },
                })
        }
    }

    struct Hang;

    #[async_trait]
    impl Transport for Hang {
        async fn exchange(&self, _: &str, _: &SyncRequest) -> Result<SyncResponse, SyncError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn two_nodes_converge() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(test_node(dir.path(), "alpha", "test", "fd00::1"));
        let b = Arc::new(test_node(dir.path(), "beta", "test", "fd00::2"));
        a.initialize().await.unwrap();
        b.advertise().await.unwrap();
        b.peers().lock().await.seed([a.url()]);

        let mut transport = LocalTransport::default();
        transport.nodes.insert(a.url().to_string(), Arc::clone(&a));
        transport.nodes.insert(b.url().to_string(), Arc::clone(&b));
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let engine_a = SyncEngine::new(Arc::clone(&a), Arc::clone(&transport), Duration::from_secs(1), Duration::from_secs(1));
        let engine_b = SyncEngine::new(Arc::clone(&b), transport, Duration::from_secs(1), Duration::from_secs(1));

        // A knows nobody until B dials it.
        assert!(engine_a.tick().await.is_empty());
        let rounds = engine_b.tick().await;
        assert!(matches!(rounds[0].state, RoundState::Done(r) if r.applied == 1));
        assert_eq!(a.peers().lock().await.addresses(), vec![b.url().to_string()]);

        let rounds = engine_a.tick().await;
        assert!(matches!(rounds[0].state, RoundState::Done(r) if r.applied == 0));

        assert_eq!(a.snapshot().await, b.snapshot().await);
        let names: Vec<_> = a.snapshot().await.into_iter().map(|r| r.hostname).collect();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[tokio::test]
    async fn aliased_address_never_becomes_a_peer() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(test_node(dir.path(), "alpha", "test", "fd00::1"));
        let b = Arc::new(test_node(dir.path(), "beta", "test", "fd00::2"));
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        // B reaches A under an address A does not know as its own.
        let alias = "http://alpha-alias.invalid";
        b.peers().lock().await.seed([alias]);

        let mut transport = LocalTransport::default();
        transport.nodes.insert(a.url().to_string(), Arc::clone(&a));
        transport.nodes.insert(alias.to_string(), Arc::clone(&a));
        transport.nodes.insert(b.url().to_string(), Arc::clone(&b));
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let engine_a = SyncEngine::new(Arc::clone(&a), Arc::clone(&transport), Duration::from_secs(1), Duration::from_secs(1));
        let engine_b = SyncEngine::new(Arc::clone(&b), transport, Duration::from_secs(1), Duration::from_secs(1));

        let rounds = engine_b.tick().await;
        assert!(matches!(rounds[0].state, RoundState::Done(_)));
        assert_eq!(a.peers().lock().await.addresses(), vec![b.url().to_string()]);

        // Even when a third party gossips the alias, A drops it after one
        // refused round and never dials it again.
        a.peers().lock().await.learn([alias]);
        let rounds = engine_a.tick().await;
        let own = rounds.iter().find(|r| r.peer == alias).unwrap();
        assert!(matches!(own.state, RoundState::Failed(SyncError::SelfPeer(_))));
        assert_eq!(a.peers().lock().await.addresses(), vec![b.url().to_string()]);
        assert_eq!(a.peers().lock().await.learn([alias]), 0);

        let rounds = engine_a.tick().await;
        assert!(rounds.iter().all(|r| r.peer != alias));
        assert_eq!(a.snapshot().await, b.snapshot().await);
    }

    #[tokio::test]
    async fn self_answering_peer_is_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(test_node(dir.path(), "alpha", "test", "fd00::1"));
        a.initialize().await.unwrap();

        // A transport that answers from A without going through A's
        // inbound refusal, as an older peer would.
        struct Echo(Arc<Node>);

        #[async_trait]
        impl Transport for Echo {
            async fn exchange(&self, _: &str, _: &SyncRequest) -> Result<SyncResponse, SyncError> {
                let view = self.0.state_view().await;
                Ok(SyncResponse {
                    namespace: view.namespace,
                    origin: view.origin,
                    digest: view.digest,
                    records: view.records,
                    peers: view.peers,
                })
            }
        }

        a.peers().lock().await.seed(["http://127.0.0.1:7331"]);
        let engine = SyncEngine::new(Arc::clone(&a), Arc::new(Echo(Arc::clone(&a))), Duration::from_secs(1), Duration::from_secs(1));
        let rounds = engine.tick().await;
        assert!(matches!(rounds[0].state, RoundState::Failed(SyncError::SelfPeer(_))));
        assert!(a.peers().lock().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_peer_backs_off_without_blocking_others() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(test_node(dir.path(), "alpha", "test", "fd00::1"));
        let b = Arc::new(test_node(dir.path(), "beta", "test", "fd00::2"));
        a.initialize().await.unwrap();
        b.peers().lock().await.seed([a.url(), "http://gone.invalid"]);

        let mut transport = LocalTransport::default();
        transport.nodes.insert(a.url().to_string(), Arc::clone(&a));
        let engine = SyncEngine::new(Arc::clone(&b), Arc::new(transport), Duration::from_secs(1), Duration::from_secs(1));

        let rounds = engine.tick().await;
        assert_eq!(rounds.len(), 2);
        assert_eq!(b.snapshot().await.len(), 1);

        let peers = b.peers().lock().await;
        assert_eq!(peers.get("http://gone.invalid").unwrap().failures, 1);
        assert_eq!(peers.candidates(Instant::now()), vec![a.url().to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_peer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let b = Arc::new(test_node(dir.path(), "beta", "test", "fd00::2"));
        b.peers().lock().await.seed(["http://slow.invalid"]);
        let engine = SyncEngine::new(Arc::clone(&b), Arc::new(Hang), Duration::from_secs(1), Duration::from_millis(200));

        let rounds = engine.tick().await;
        assert!(matches!(rounds[0].state, RoundState::Failed(SyncError::Timeout(_))));
    }

    #[tokio::test]
    async fn namespace_mismatch_fails_round() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(test_node(dir.path(), "alpha", "other", "fd00::1"));
        let b = Arc::new(test_node(dir.path(), "beta", "test", "fd00::2"));
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();
        b.peers().lock().await.seed([a.url()]);

        let mut transport = LocalTransport::default();
        transport.nodes.insert(a.url().to_string(), Arc::clone(&a));
        let engine = SyncEngine::new(Arc::clone(&b), Arc::new(transport), Duration::from_secs(1), Duration::from_secs(1));

        let rounds = engine.tick().await;
        assert!(matches!(rounds[0].state, RoundState::Failed(SyncError::NamespaceMismatch { .. })));
        assert_eq!(a.snapshot().await.len(), 1);
        assert_eq!(b.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let b = Arc::new(test_node(dir.path(), "beta", "test", "fd00::2"));
        b.peers().lock().await.seed(["http://slow.invalid"]);
        let engine = SyncEngine::new(b, Arc::new(Hang), Duration::from_millis(10), Duration::from_secs(3600));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
