//! Replicated hostname directory.
//!
//! Every hostname maps to exactly one winning [`Record`], chosen by
//! last-writer-wins on `(timestamp, origin)`.  The merge is commutative,
//! associative and idempotent, so peers can deliver records in any order,
//! any number of times, and still converge.
//!
//! Clock skew is not corrected: a node whose clock runs ahead wins ties it
//! should not.  That is the accepted cost of needing no coordination.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::StoreError;
use crate::identity::{self, Identity};
use crate::types::{MergeOutcome, MergeReport, Record, RejectReason};

/// On-disk representation of the store.
#[derive(Serialize, Deserialize)]
struct StateFile {
    namespace: String,
    records: Vec<Record>,
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    namespace: String,
    records: BTreeMap<String, Record>,
    state_file: Option<PathBuf>,
}

/// A single DNS label: 1-63 ASCII alphanumerics or `-`, no leading or
/// trailing `-`.
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn check(record: &Record) -> Option<RejectReason> {
    if !is_valid_label(&record.hostname) || record.hostname.bytes().any(|b| b.is_ascii_uppercase())
    {
        return Some(RejectReason::InvalidHostname);
    }
    if record.address.parse::<IpAddr>().is_err() {
        return Some(RejectReason::InvalidAddress);
    }
    if !identity::verify_record(record) {
        return Some(RejectReason::InvalidSignature);
    }
    None
}

impl RecordStore {
    /// An empty, memory-only store.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            records: BTreeMap::new(),
            state_file: None,
        }
    }

    /// Load the store persisted at `path`.  A missing file yields an empty
    /// store bound to `path`; malformed content, a foreign namespace or an
    /// unverifiable record is [`StoreError::CorruptState`].
    pub fn restore(namespace: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut store = Self::new(namespace);
        store.state_file = Some(path.to_path_buf());

        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting empty", path.display());
                return Ok(store);
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let corrupt = |reason: String| StoreError::CorruptState {
            path: path.to_path_buf(),
            reason,
        };
        let state: StateFile = serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;
        if state.namespace != store.namespace {
            return Err(corrupt(format!(
                "state belongs to namespace {:?}, expected {:?}",
                state.namespace, store.namespace
            )));
        }
        for record in state.records {
            if let Some(reason) = check(&record) {
                return Err(corrupt(format!(
                    "record for {:?} rejected: {:?}",
                    record.hostname, reason
                )));
            }
            store.insert_if_newer(record);
        }
        info!(
            "Restored {} records for namespace {} from {}",
            store.records.len(),
            store.namespace,
            path.display()
        );
        Ok(store)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, hostname: &str) -> Option<&Record> {
        self.records.get(&hostname.to_ascii_lowercase())
    }

    /// Sign a new record for `hostname` with the local identity.  The record
    /// is not applied.
    pub fn propose(
        &self,
        identity: &Identity,
        hostname: &str,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Record, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidRecord {
            hostname: hostname.to_string(),
            reason: reason.to_string(),
        };
        if !is_valid_label(hostname) {
            return Err(invalid("not a valid DNS label"));
        }
        if address.parse::<IpAddr>().is_err() {
            return Err(invalid("address is not an IP address"));
        }
        Ok(identity.sign_record(hostname, address, now))
    }

    /// Merge one record.  Validation fails closed: an invalid record is
    /// dropped without touching the store.
    pub fn apply(&mut self, record: Record) -> MergeOutcome {
        if let Some(reason) = check(&record) {
            warn!(
                "Dropping record for {:?} from {}: {:?}",
                record.hostname, record.origin, reason
            );
            return MergeOutcome::Rejected(reason);
        }
        if self.insert_if_newer(record) {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Rejected(RejectReason::Stale)
        }
    }

    /// Merge a batch received from a peer in `namespace`.  A foreign
    /// namespace rejects the whole batch.
    pub fn apply_remote(
        &mut self,
        namespace: &str,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<MergeReport, StoreError> {
        if namespace != self.namespace {
            return Err(StoreError::NamespaceMismatch {
                expected: self.namespace.clone(),
                actual: namespace.to_string(),
            });
        }
        let mut report = MergeReport::default();
        for record in records {
            report.record(self.apply(record));
        }
        Ok(report)
    }

    fn insert_if_newer(&mut self, record: Record) -> bool {
        match self.records.get(&record.hostname) {
            Some(current) if !record.supersedes(current) => false,
            _ => {
                debug!(
                    "{} -> {} (origin {}, at {})",
                    record.hostname, record.address, record.origin, record.timestamp
                );
                self.records.insert(record.hostname.clone(), record);
                true
            }
        }
    }

    /// All winning records, ordered by hostname.
    pub fn snapshot(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    /// Hex SHA-256 over the full snapshot.  Two stores hold the same records
    /// iff their digests match.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for record in self.records.values() {
            let timestamp = record.timestamp.timestamp_millis().to_be_bytes();
            let fields: [&[u8]; 5] = [
                record.hostname.as_bytes(),
                record.origin.as_bytes(),
                &timestamp,
                record.address.as_bytes(),
                record.signature.as_bytes(),
            ];
            for field in fields {
                hasher.update((field.len() as u64).to_be_bytes());
                hasher.update(field);
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Atomically replace the state file with the current contents.  A
    /// memory-only store has nothing to do.
    pub fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let io_err = |source: io::Error| StoreError::Io {
            path: path.clone(),
            source,
        };
        let state = StateFile {
            namespace: self.namespace.clone(),
            records: self.snapshot(),
        };
        let bytes = serde_json::to_vec_pretty(&state).map_err(|e| io_err(e.into()))?;

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        debug!("Persisted {} records to {}", state.records.len(), path.display());
        Ok(())
    }
}
