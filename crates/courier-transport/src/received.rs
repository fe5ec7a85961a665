use courier_types::protocol::RequestEnvelope;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Above this many outstanding received commands, expired ones are pruned
/// on the next delivery as well.
pub(crate) const PRUNE_THRESHOLD: usize = 1024;

/// Period of the background sweep over received commands.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// A command handed to a listener and not completed yet.
pub(crate) struct Received<T> {
    pub envelope: RequestEnvelope,
    pub expires_at: Instant,
    /// Backend specific delivery data (reply route, delivery tag).
    pub delivery: T,
}

impl<T> Received<T> {
    pub fn new(envelope: RequestEnvelope, remaining: Duration, delivery: T) -> Self {
        Self {
            envelope,
            expires_at: Instant::now() + remaining,
            delivery,
        }
    }

    pub fn is_need_reply(&self) -> bool {
        self.envelope.is_need_reply
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Received commands keyed by id. Completion, deferral and expiry each
/// take an entry out exactly once.
pub(crate) struct ReceivedRequests<T> {
    entries: DashMap<String, Received<T>>,
}

impl<T> Default for ReceivedRequests<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> ReceivedRequests<T> {
    pub fn insert(&self, id: impl Into<String>, request: Received<T>) {
        self.entries.insert(id.into(), request);
    }

    pub fn remove(&self, id: &str) -> Option<Received<T>> {
        self.entries.remove(id).map(|(_, request)| request)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Takes every entry whose sender has stopped waiting.
    pub fn prune_expired(&self) -> Vec<(String, Received<T>)> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.entries.remove_if(id, |_, request| request.is_expired(now)))
            .collect()
    }

    pub fn prune_if_crowded(&self) -> Vec<(String, Received<T>)> {
        if self.len() < PRUNE_THRESHOLD {
            return Vec::new();
        }
        self.prune_expired()
    }
}
