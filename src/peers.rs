//! Known peers and their retry bookkeeping.
//!
//! Peers are sync endpoint URLs.  A failed round pushes the peer into a
//! cooldown that doubles with every consecutive failure up to a ceiling;
//! one success clears it.  Cooldowns are jittered so that peers which lost
//! the same node at the same moment do not all come back in lockstep.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(5),
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered cooldown after `failures` consecutive failures.
    pub fn window(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.min.saturating_mul(factor).min(self.max)
    }

    /// Uniform in `[window / 2, window]`.
    fn jittered(&self, failures: u32) -> Duration {
        let window = self.window(failures).as_millis() as u64;
        if window == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(window / 2..=window))
    }
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub address: String,
    pub last_attempt: Option<Instant>,
    pub last_success: Option<Instant>,
    pub failures: u32,
    retry_at: Option<Instant>,
}

impl PeerEntry {
    fn new(address: String) -> Self {
        Self {
            address,
            last_attempt: None,
            last_success: None,
            failures: 0,
            retry_at: None,
        }
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }
}

#[derive(Debug)]
pub struct PeerRegistry {
    self_address: String,
    /// Other addresses that turned out to reach this node.
    self_aliases: BTreeSet<String>,
    peers: BTreeMap<String, PeerEntry>,
    policy: BackoffPolicy,
    max_peers: usize,
}

fn normalize(address: &str) -> String {
    address.trim().trim_end_matches('/').to_string()
}

impl PeerRegistry {
    pub fn new(self_address: &str, policy: BackoffPolicy, max_peers: usize) -> Self {
        Self {
            self_address: normalize(self_address),
            self_aliases: BTreeSet::new(),
            peers: BTreeMap::new(),
            policy,
            max_peers,
        }
    }

    /// Add the configured bootstrap peers.  These are not subject to the
    /// size cap.
    pub fn seed<I, S>(&mut self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for address in addresses {
            let address = normalize(address.as_ref());
            if address.is_empty() || self.is_self(&address) {
                continue;
            }
            self.peers
                .entry(address.clone())
                .or_insert_with(|| PeerEntry::new(address));
        }
    }

    /// Merge peers learned from another node.  Returns how many were new.
    pub fn learn<I, S>(&mut self, addresses: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for address in addresses {
            let address = normalize(address.as_ref());
            if address.is_empty()
                || self.is_self(&address)
                || self.peers.contains_key(&address)
            {
                continue;
            }
            if self.peers.len() >= self.max_peers {
                debug!("Peer set full, ignoring {}", address);
                continue;
            }
            info!("Learned peer {}", address);
            self.peers
                .insert(address.clone(), PeerEntry::new(address));
            added += 1;
        }
        added
    }

    fn is_self(&self, address: &str) -> bool {
        address == self.self_address || self.self_aliases.contains(address)
    }

    /// Drop `address`, which reached this node itself, and never add it
    /// again.  Returns whether it was in the peer set.
    pub fn forget(&mut self, address: &str) -> bool {
        let address = normalize(address);
        let known = self.peers.remove(&address).is_some();
        if self.self_aliases.insert(address.clone()) {
            info!("Forgetting peer {}: it is this node", address);
        }
        known
    }

    /// Peers that are not cooling down at `now`.
    pub fn candidates(&self, now: Instant) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.is_eligible(now))
            .map(|p| p.address.clone())
            .collect()
    }

    pub fn record_result(&mut self, address: &str, success: bool, now: Instant) {
        let policy = self.policy;
        let Some(peer) = self.peers.get_mut(&normalize(address)) else {
            return;
        };
        peer.last_attempt = Some(now);
        if success {
            peer.last_success = Some(now);
            peer.failures = 0;
            peer.retry_at = None;
        } else {
            peer.failures = peer.failures.saturating_add(1);
            let cooldown = policy.jittered(peer.failures);
            peer.retry_at = Some(now + cooldown);
            debug!(
                "Peer {} failed {} times in a row, next attempt in {:?}",
                peer.address, peer.failures, cooldown
            );
        }
    }

    pub fn get(&self, address: &str) -> Option<&PeerEntry> {
        self.peers.get(&normalize(address))
    }

    pub fn addresses(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
