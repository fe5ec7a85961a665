use courier_error::TransportError;
use courier_types::PendingReply;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;

type Resolver = oneshot::Sender<Result<Value, TransportError>>;

struct PendingEntry {
    name: String,
    resolver: Resolver,
    reply: PendingReply,
}

pub enum Registration {
    /// The id was free; the caller owns the entry and must settle or remove it.
    New(PendingReply),
    /// The id is already in flight; the caller shares the existing reply.
    Existing(PendingReply),
}

/// Commands awaiting a reply, keyed by id.
///
/// Removal from the map is the single point of settlement: whoever removes
/// an entry resolves it, everybody else gets `false`.
#[derive(Default)]
pub struct PendingRegistry {
    entries: DashMap<String, PendingEntry>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, name: &str) -> Registration {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(entry) => Registration::Existing(entry.get().reply.clone()),
            Entry::Vacant(slot) => {
                let (resolver, receiver) = oneshot::channel();
                let reply = async move {
                    receiver.await.unwrap_or_else(|_| {
                        Err(TransportError::Connection(
                            "pending command was abandoned".to_string(),
                        ))
                    })
                }
                .boxed()
                .shared();

                slot.insert(PendingEntry {
                    name: name.to_string(),
                    resolver,
                    reply: reply.clone(),
                });
                Registration::New(reply)
            }
        }
    }

    pub fn settle(&self, id: &str, result: Result<Value, TransportError>) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                // every waiter may already be gone; the entry is settled either way
                let _ = entry.resolver.send(result);
                true
            }
            None => false,
        }
    }

    pub fn resolve(&self, id: &str, value: Value) -> bool {
        self.settle(id, Ok(value))
    }

    pub fn reject(&self, id: &str, error: TransportError) -> bool {
        self.settle(id, Err(error))
    }

    /// Drops the entry without settling it. Remaining waiters observe a
    /// `Connection` error.
    pub fn remove(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Drops the entry unless a waiter besides its owner still holds the
    /// reply. The registry and the owner account for two handles.
    pub fn remove_unshared(&self, id: &str) -> bool {
        self.entries
            .remove_if(id, |_, entry| {
                entry.reply.strong_count().is_none_or(|count| count <= 2)
            })
            .is_some()
    }

    pub fn reject_all(&self, error: &TransportError) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.iter()
            .filter(|id| self.reject(id, error.clone()))
            .count()
    }

    pub fn wait(&self, id: &str) -> Option<PendingReply> {
        self.entries.get(id).map(|entry| entry.reply.clone())
    }

    pub fn name(&self, id: &str) -> Option<String> {
        self.entries.get(id).map(|entry| entry.name.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
