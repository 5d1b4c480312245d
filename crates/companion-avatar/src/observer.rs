//! Explicit subscribe/unsubscribe handles for per-character observers.
//!
//! Controllers never register callbacks on the scene. They take a
//! [`Subscription`] here, and the service only routes an event (clip end,
//! analyzer frame) to a controller whose subscription is still live. Tearing a
//! session down detaches its subscriptions, so a late clip-end for an old idle
//! session can't advance anything.

use crate::character::CharacterId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverKind {
    /// Natural end of a clip
    ClipEnd,
    /// Per-frame analyzer sampling for lip-sync
    AnalyzerFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    kind: ObserverKind,
}

impl Subscription {
    pub fn kind(&self) -> ObserverKind {
        self.kind
    }
}

#[derive(Debug, Default)]
pub struct ObserverRegistry {
    next_id: u64,
    by_owner: HashMap<CharacterId, Vec<Subscription>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, owner: CharacterId, kind: ObserverKind) -> Subscription {
        self.next_id += 1;
        let sub = Subscription {
            id: self.next_id,
            kind,
        };
        self.by_owner.entry(owner).or_default().push(sub);
        sub
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&mut self, owner: CharacterId, sub: Subscription) -> bool {
        let Some(subs) = self.by_owner.get_mut(&owner) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| *s != sub);
        let removed = subs.len() != before;
        if subs.is_empty() {
            self.by_owner.remove(&owner);
        }
        removed
    }

    pub fn is_live(&self, owner: CharacterId, sub: Subscription) -> bool {
        self.by_owner
            .get(&owner)
            .map(|subs| subs.contains(&sub))
            .unwrap_or(false)
    }

    pub fn detach_all(&mut self, owner: CharacterId) -> usize {
        self.by_owner.remove(&owner).map(|s| s.len()).unwrap_or(0)
    }

    pub fn count(&self, owner: CharacterId, kind: ObserverKind) -> usize {
        self.by_owner
            .get(&owner)
            .map(|subs| subs.iter().filter(|s| s.kind == kind).count())
            .unwrap_or(0)
    }
}
