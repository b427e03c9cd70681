use crate::io::inbox::{Inbox, InboxTx, inbox};
use crate::utils::Name;
use ahash::AHashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

/// Process-global directory of named broadcast channels.
///
/// Channels are keyed by model name and created on first use; every pool in
/// the process shares the same hub, which is what makes a sibling pool
/// reachable by name.
pub struct BroadcastHub {
    channels: RwLock<AHashMap<Name, Arc<BroadcastChannel>>>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(AHashMap::new()),
        }
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Get or create the channel keyed by `name`.
    pub fn channel(&self, name: &Name) -> Arc<BroadcastChannel> {
        if let Some(existing) = self.channels.read().get(name.as_str()) {
            return existing.clone();
        }
        self.channels
            .write()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(BroadcastChannel::new(name.clone())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}

/// Named multi-writer/multi-reader bus.
///
/// Every subscriber owns its own FIFO inbox; `post` clones the frame to
/// each of them, so readers never share state. Dead subscribers are pruned
/// on the next post.
pub struct BroadcastChannel {
    name: Name,
    subs: RwLock<Vec<InboxTx<Value>>>,
}

impl BroadcastChannel {
    fn new(name: Name) -> Self {
        Self {
            name,
            subs: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Deliver `frame` to every current subscriber.
    pub fn post(&self, frame: Value) {
        let mut dead: Vec<usize> = Vec::new();
        {
            let subs = self.subs.read();
            for (idx, sub) in subs.iter().enumerate() {
                if sub.post(frame.clone()).is_err() {
                    dead.push(idx);
                }
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subs.write();
            let mut idx = 0usize;
            subs.retain(|_| {
                let keep = !dead.contains(&idx);
                idx += 1;
                keep
            });
        }
    }

    /// Attach a new subscriber inbox.
    pub fn subscribe(&self) -> Inbox<Value> {
        let (tx, rx) = inbox::<Value>();
        self.subs.write().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.read().len()
    }
}
