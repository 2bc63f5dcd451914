//! Membership state: the record of which channels this node has joined.
//!
//! The record map lives behind a `std::sync::Mutex` that is only held for
//! map/set operations, never across an overlay call. Join and leave of the
//! same descriptor are serialized by a per-descriptor async transition lock
//! instead, so a slow overlay call on one channel never blocks another.

use crate::PeerId;
use crate::descriptor::Descriptor;
use crate::overlay::{Subscription, Topic};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything this node holds for one joined channel.
pub struct MembershipRecord {
    pub descriptor: Descriptor,
    pub topic: Arc<dyn Topic>,
    pub subscription: Arc<dyn Subscription>,
    /// Peers protected from eviction with this channel's tag
    pub protected: HashSet<PeerId>,
    /// Cancels this channel's message pump
    pub cancel: CancellationToken,
    pub pump: Option<JoinHandle<()>>,
}

impl MembershipRecord {
    pub fn new(
        descriptor: Descriptor,
        topic: Arc<dyn Topic>,
        subscription: Arc<dyn Subscription>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            descriptor,
            topic,
            subscription,
            protected: HashSet::new(),
            cancel,
            pump: None,
        }
    }
}

/// Result of [`MembershipState::protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectOutcome {
    /// Newly tagged; the caller must tag the connection in the overlay
    Added,
    AlreadyProtected,
    /// The channel already protects the maximum number of peers
    CapReached,
    NotJoined,
}

type TransitionLock = Arc<tokio::sync::Mutex<()>>;

/// Exclusive right to join or leave one descriptor.
///
/// Dropping the last guard of a descriptor forgets its lock, so the lock map
/// only holds descriptors with a transition in progress.
pub struct Transition<'a> {
    state: &'a MembershipState,
    descriptor: Descriptor,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        let mut transitions = self.state.transitions();
        drop(self.guard.take());
        // Waiters hold their own clone of the lock
        if transitions
            .get(&self.descriptor)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            transitions.remove(&self.descriptor);
        }
    }
}

#[derive(Default)]
pub struct MembershipState {
    records: Mutex<HashMap<Descriptor, MembershipRecord>>,
    /// Last observed member count per channel (log noise suppression only)
    member_counts: Mutex<HashMap<Descriptor, usize>>,
    transitions: Mutex<HashMap<Descriptor, TransitionLock>>,
}

impl MembershipState {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<Descriptor, MembershipRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transitions(&self) -> MutexGuard<'_, HashMap<Descriptor, TransitionLock>> {
        self.transitions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for exclusive right to join or leave `descriptor`.
    pub async fn transition(&self, descriptor: &Descriptor) -> Transition<'_> {
        let lock = Arc::clone(self.transitions().entry(descriptor.clone()).or_default());
        let guard = lock.lock_owned().await;
        Transition {
            state: self,
            descriptor: descriptor.clone(),
            guard: Some(guard),
        }
    }

    /// Descriptors with a join or leave in progress or waiting.
    pub fn pending_transitions(&self) -> usize {
        self.transitions().len()
    }

    pub fn is_joined(&self, descriptor: &Descriptor) -> bool {
        self.records().contains_key(descriptor)
    }

    pub fn insert(&self, record: MembershipRecord) {
        self.records().insert(record.descriptor.clone(), record);
    }

    /// Insert unless `shutdown` has fired, handing the record back if it has.
    ///
    /// The check happens under the record lock, so a record inserted here is
    /// always visible to a [`drain`](Self::drain) that runs after the token fires.
    pub fn insert_unless(
        &self,
        record: MembershipRecord,
        shutdown: &CancellationToken,
    ) -> Result<(), Box<MembershipRecord>> {
        let mut records = self.records();
        if shutdown.is_cancelled() {
            return Err(Box::new(record));
        }
        records.insert(record.descriptor.clone(), record);
        Ok(())
    }

    pub fn remove(&self, descriptor: &Descriptor) -> Option<MembershipRecord> {
        self.member_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(descriptor);
        self.records().remove(descriptor)
    }

    /// Remove every record (node shutdown).
    pub fn drain(&self) -> Vec<MembershipRecord> {
        self.member_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.records().drain().map(|(_, record)| record).collect()
    }

    pub fn topic(&self, descriptor: &Descriptor) -> Option<Arc<dyn Topic>> {
        self.records().get(descriptor).map(|r| Arc::clone(&r.topic))
    }

    /// Attach the pump task handle. Returns the handle back if the channel
    /// was left in the meantime.
    pub fn set_pump(
        &self,
        descriptor: &Descriptor,
        handle: JoinHandle<()>,
    ) -> Option<JoinHandle<()>> {
        match self.records().get_mut(descriptor) {
            Some(record) => {
                record.pump = Some(handle);
                None
            }
            None => Some(handle),
        }
    }

    /// Snapshot of joined descriptors, sorted for deterministic iteration.
    pub fn descriptors(&self) -> Vec<Descriptor> {
        let mut descriptors: Vec<Descriptor> = self.records().keys().cloned().collect();
        descriptors.sort();
        descriptors
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record that `peer` is protected for `descriptor`, up to `cap` peers.
    pub fn protect(&self, descriptor: &Descriptor, peer: PeerId, cap: usize) -> ProtectOutcome {
        let mut records = self.records();
        let Some(record) = records.get_mut(descriptor) else {
            return ProtectOutcome::NotJoined;
        };
        if record.protected.contains(&peer) {
            ProtectOutcome::AlreadyProtected
        } else if record.protected.len() >= cap {
            ProtectOutcome::CapReached
        } else {
            record.protected.insert(peer);
            ProtectOutcome::Added
        }
    }

    pub fn protected_peers(&self, descriptor: &Descriptor) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .records()
            .get(descriptor)
            .map(|r| r.protected.iter().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Store the latest member count. Returns true if it differs from the last one.
    pub fn update_member_count(&self, descriptor: &Descriptor, count: usize) -> bool {
        let mut counts = self.member_counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.insert(descriptor.clone(), count) != Some(count)
    }
}
