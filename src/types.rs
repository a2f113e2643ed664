//! Data structures shared by the store, the sync engine and the endpoint.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and
//! exchanged between peers as JSON.  A [`Record`] is the unit of
//! replication: one hostname bound to one address, signed by the node
//! that published it.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A signed hostname → address binding.
///
/// The signature covers `hostname`, `address`, `timestamp` and `origin`
/// (see [`SignedFields`]).  Changing any of them invalidates the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub hostname: String,
    pub address: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Hex encoded ed25519 public key of the publishing node.
    pub origin: String,
    /// Hex encoded ed25519 signature.
    pub signature: String,
}

/// The exact byte payload a record's signature is computed over.
#[derive(Serialize)]
pub struct SignedFields<'a> {
    pub hostname: &'a str,
    pub address: &'a str,
    pub timestamp: i64,
    pub origin: &'a str,
}

impl Record {
    pub fn signed_fields(&self) -> SignedFields<'_> {
        SignedFields {
            hostname: &self.hostname,
            address: &self.address,
            timestamp: self.timestamp.timestamp_millis(),
            origin: &self.origin,
        }
    }

    /// Last-writer-wins ordering.
    ///
    /// Timestamp first, then origin fingerprint.  Address and signature only
    /// separate two different records one origin produced in the same
    /// millisecond, so that the order stays total.
    pub fn precedence(&self, other: &Record) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.origin.cmp(&other.origin))
            .then_with(|| self.address.cmp(&other.address))
            .then_with(|| self.signature.cmp(&other.signature))
    }

    pub fn supersedes(&self, other: &Record) -> bool {
        self.precedence(other) == Ordering::Greater
    }
}

/// Why a record was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Older than, or identical to, the stored record.
    Stale,
    InvalidSignature,
    InvalidHostname,
    InvalidAddress,
}

/// Result of merging one record into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    Rejected(RejectReason),
}

/// Tally of a batch merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: usize,
    pub stale: usize,
    pub invalid: usize,
}

impl MergeReport {
    pub fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Applied => self.applied += 1,
            MergeOutcome::Rejected(RejectReason::Stale) => self.stale += 1,
            MergeOutcome::Rejected(_) => self.invalid += 1,
        }
    }

    pub fn changed(&self) -> bool {
        self.applied > 0
    }
}

/// Body of `POST /sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub namespace: String,
    /// Fingerprint of the requesting node.  A node that receives its own
    /// fingerprint has dialed itself under another address.
    pub origin: String,
    /// URL under which the requesting node accepts sync requests itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub digest: String,
    pub records: Vec<Record>,
    #[serde(default)]
    pub peers: Vec<String>,
}

impl SyncRequest {
    /// A copy addressed to `peer`, which is left out of the gossiped peer
    /// list.  The receiver cannot tell that address apart from any other,
    /// and it may be one of its own aliases.
    pub fn addressed_to(&self, peer: &str) -> SyncRequest {
        let mut request = self.clone();
        request
            .peers
            .retain(|p| p.trim_end_matches('/') != peer.trim_end_matches('/'));
        request
    }
}

/// Reply to a [`SyncRequest`].
///
/// `records` is empty when the responder's state already matches the
/// request's digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub namespace: String,
    /// Fingerprint of the responding node.
    pub origin: String,
    pub digest: String,
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Full state served on `GET /`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateView {
    pub namespace: String,
    pub origin: String,
    pub digest: String,
    pub records: Vec<Record>,
    pub peers: Vec<String>,
}
