//! The node context shared by the sync engine, the endpoint and the DNS
//! responder.
//!
//! All mutation of the record store goes through the store's write lock,
//! and every accepted change is persisted and exported while that lock is
//! held, so the state file and the exported directory always follow the
//! order in which changes were applied.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{ExportError, StoreError, SyncError};
use crate::export::DirectoryExporter;
use crate::identity::Identity;
use crate::peers::PeerRegistry;
use crate::store::RecordStore;
use crate::types::{MergeReport, Record, StateView, SyncRequest, SyncResponse};

pub struct Node {
    identity: Identity,
    address: IpAddr,
    hostnames: Vec<String>,
    url: String,
    store: RwLock<RecordStore>,
    peers: Mutex<PeerRegistry>,
    exporter: DirectoryExporter,
    /// Set when the state file or the export lags the in-memory store.
    dirty: AtomicBool,
}

impl Node {
    pub fn new(
        identity: Identity,
        address: IpAddr,
        hostnames: Vec<String>,
        url: impl Into<String>,
        store: RecordStore,
        peers: PeerRegistry,
        exporter: DirectoryExporter,
    ) -> Self {
        Self {
            identity,
            address,
            hostnames,
            url: url.into(),
            store: RwLock::new(store),
            peers: Mutex::new(peers),
            exporter,
            dirty: AtomicBool::new(false),
        }
    }

    /// Load identity and state from the paths in `config`.  Corrupt key or
    /// state files are fatal.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let identity = Identity::load_or_create(&config.key_file)?;
        let store = RecordStore::restore(&config.namespace, &config.state_file)?;
        let url = config.advertise_url();
        let mut peers = PeerRegistry::new(&url, config.backoff(), config.max_peers);
        peers.seed(&config.bootstrap_peers);
        let exporter = DirectoryExporter::new(&config.dns_file, &config.namespace);
        info!(
            "Node {} ({}) in namespace {} with {} records and {} bootstrap peers",
            identity.fingerprint(),
            url,
            config.namespace,
            store.len(),
            peers.len()
        );
        Ok(Self::new(
            identity,
            config.ip,
            config.hostnames.clone(),
            url,
            store,
            peers,
            exporter,
        ))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn peers(&self) -> &Mutex<PeerRegistry> {
        &self.peers
    }

    pub fn store(&self) -> &RwLock<RecordStore> {
        &self.store
    }

    pub async fn namespace(&self) -> String {
        self.store.read().await.namespace().to_string()
    }

    pub async fn snapshot(&self) -> Vec<Record> {
        self.store.read().await.snapshot()
    }

    /// Persist, then export.  Export only happens once the state is durable.
    ///
    /// The caller keeps holding the store lock while the files are written
    /// on the blocking pool, so writes land in the order changes were
    /// applied.
    async fn commit(&self, store: &RecordStore) -> Result<(), StoreError> {
        let store = store.clone();
        let exporter = self.exporter.clone();
        let written = tokio::task::spawn_blocking(
            move || -> Result<Result<(), ExportError>, StoreError> {
                store.persist()?;
                Ok(exporter.export(&store.snapshot()))
            },
        )
        .await;
        match written {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                warn!("{}; retrying next cycle", e);
                self.dirty.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(e)) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Retry a failed persist or export.
    pub async fn flush_if_dirty(&self) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let store = self.store.read().await;
        if let Err(e) = self.commit(&store).await {
            error!("Failed to persist state: {}", e);
        }
    }

    /// Write the current store to the directory file unconditionally.
    pub async fn export(&self) {
        let store = self.store.read().await;
        let records = store.snapshot();
        let exporter = self.exporter.clone();
        let exported = tokio::task::spawn_blocking(move || exporter.export(&records)).await;
        let failed = match exported {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                warn!("{}; retrying next cycle", e);
                true
            }
            Err(e) => {
                warn!("Export task failed: {}; retrying next cycle", e);
                true
            }
        };
        if failed {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Sign fresh records for all configured hostnames and commit them
    /// before any gossip happens.
    pub async fn initialize(&self) -> Result<MergeReport, StoreError> {
        self.publish(&self.hostnames).await
    }

    /// Publish the configured hostnames that the store does not already
    /// bind to this node's address.
    pub async fn advertise(&self) -> Result<MergeReport, StoreError> {
        let address = self.address.to_string();
        let missing: Vec<String> = {
            let store = self.store.read().await;
            self.hostnames
                .iter()
                .filter(|h| {
                    store.get(h).map_or(true, |r| {
                        r.origin != self.identity.fingerprint() || r.address != address
                    })
                })
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return Ok(MergeReport::default());
        }
        self.publish(&missing).await
    }

    async fn publish(&self, hostnames: &[String]) -> Result<MergeReport, StoreError> {
        let address = self.address.to_string();
        let now = Utc::now();
        let mut store = self.store.write().await;
        // Sign everything before applying anything, so a bad hostname
        // leaves the store untouched.
        let records = hostnames
            .iter()
            .map(|hostname| store.propose(&self.identity, hostname, &address, now))
            .collect::<Result<Vec<_>, _>>()?;
        let mut report = MergeReport::default();
        for record in records {
            info!("Publishing {}.{} -> {}", record.hostname, store.namespace(), address);
            report.record(store.apply(record));
        }
        self.commit(&store).await?;
        Ok(report)
    }

    /// Merge records received from a peer, committing if anything changed.
    pub async fn merge_remote(
        &self,
        namespace: &str,
        records: Vec<Record>,
    ) -> Result<MergeReport, StoreError> {
        let mut store = self.store.write().await;
        let report = store.apply_remote(namespace, records)?;
        if report.changed() {
            info!(
                "Merged {} new records ({} stale, {} invalid)",
                report.applied, report.stale, report.invalid
            );
            if let Err(e) = self.commit(&store).await {
                error!("Failed to persist state: {}", e);
            }
        }
        Ok(report)
    }

    /// The request this node sends to a peer: its full state and the peers
    /// it knows.
    pub async fn sync_request(&self) -> SyncRequest {
        let (namespace, digest, records) = {
            let store = self.store.read().await;
            (store.namespace().to_string(), store.digest(), store.snapshot())
        };
        SyncRequest {
            namespace,
            origin: self.identity.fingerprint().to_string(),
            sender: Some(self.url.clone()),
            digest,
            records,
            peers: self.peers.lock().await.addresses(),
        }
    }

    /// Inbound side of an exchange.  The request is merged first and the
    /// reply carries the post-merge state, or no records at all when the
    /// requester already holds exactly that state.
    ///
    /// A request carrying this node's own fingerprint is refused untouched:
    /// the caller reached itself through an alias.
    pub async fn handle_sync(&self, request: SyncRequest) -> Result<SyncResponse, StoreError> {
        if request.origin == self.identity.fingerprint() {
            return Err(StoreError::SelfSync);
        }
        let report = self
            .merge_remote(&request.namespace, request.records)
            .await?;
        debug!(
            "Inbound sync from {}: {:?}",
            request.sender.as_deref().unwrap_or("unknown peer"),
            report
        );

        {
            let mut peers = self.peers.lock().await;
            peers.learn(request.sender.iter().chain(request.peers.iter()));
        }

        let (namespace, digest, records) = {
            let store = self.store.read().await;
            let digest = store.digest();
            let records = if digest == request.digest {
                Vec::new()
            } else {
                store.snapshot()
            };
            (store.namespace().to_string(), digest, records)
        };
        Ok(SyncResponse {
            namespace,
            origin: self.identity.fingerprint().to_string(),
            digest,
            records,
            peers: self.peers.lock().await.addresses(),
        })
    }

    /// Outbound side: merge what `peer` answered.  An answer signed off with
    /// this node's own fingerprint means `peer` is an alias of this node.
    pub async fn apply_response(
        &self,
        peer: &str,
        response: SyncResponse,
    ) -> Result<MergeReport, SyncError> {
        if response.origin == self.identity.fingerprint() {
            return Err(SyncError::SelfPeer(peer.to_string()));
        }
        let namespace = self.namespace().await;
        if response.namespace != namespace {
            return Err(SyncError::NamespaceMismatch {
                peer: peer.to_string(),
                namespace: response.namespace,
            });
        }
        let report = self
            .merge_remote(&response.namespace, response.records)
            .await?;
        self.peers.lock().await.learn(&response.peers);
        Ok(report)
    }

    pub async fn state_view(&self) -> StateView {
        let (namespace, digest, records) = {
            let store = self.store.read().await;
            (store.namespace().to_string(), store.digest(), store.snapshot())
        };
        StateView {
            namespace,
            origin: self.identity.fingerprint().to_string(),
            digest,
            records,
            peers: self.peers.lock().await.addresses(),
        }
    }
}
