use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::model::container::ContainerId;
use crate::model::surface::{SurfaceTransaction, SurfaceTxStore};

/// Identifier for one sync set, unique for the engine's lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SyncId(u32);

/// One in-flight sync set: the containers whose surface updates are being
/// gathered into a single merged transaction.
#[derive(Debug)]
pub struct SyncGroup {
    id: SyncId,
    participants: Vec<ContainerId>,
    ready: bool,
}

impl SyncGroup {
    pub fn id(&self) -> SyncId { self.id }

    pub fn participants(&self) -> &[ContainerId] { &self.participants }
}

/// Serializes surface synchronization: at most one sync set is active at a
/// time, and work that needs its own set waits in a FIFO queue until the
/// active one completes.
///
/// `Q` is the caller's description of a deferred start; the engine only
/// stores and hands it back in order.
pub struct SyncEngine<Q> {
    active: Option<SyncGroup>,
    queued: VecDeque<Q>,
    next_id: u32,
}

impl<Q> Default for SyncEngine<Q> {
    fn default() -> Self { Self::new() }
}

impl<Q> SyncEngine<Q> {
    pub fn new() -> Self { SyncEngine { active: None, queued: VecDeque::new(), next_id: 1 } }

    pub fn has_active_sync(&self) -> bool { self.active.is_some() }

    pub fn active_id(&self) -> Option<SyncId> { self.active.as_ref().map(|g| g.id) }

    /// Allocates a sync group without starting it. The caller either starts
    /// it right away or stashes it in the queue.
    pub fn prepare_sync_set(&mut self) -> SyncGroup {
        let id = SyncId(self.next_id);
        self.next_id += 1;
        SyncGroup { id, participants: Vec::new(), ready: false }
    }

    /// Makes `group` the active sync set. Callers must check
    /// `has_active_sync` first; starting over a live set is a logic error.
    pub fn start_sync_set(&mut self, group: SyncGroup) {
        debug_assert!(self.active.is_none(), "sync set started while another is active");
        debug!(sync = ?group.id, "starting sync set");
        self.active = Some(group);
    }

    /// Adds `container` to the active set if `id` still names it. Stale ids
    /// are logged and ignored; the container simply won't be synced.
    pub fn add_to_sync_set(&mut self, id: SyncId, container: ContainerId) {
        match &mut self.active {
            Some(group) if group.id == id => {
                if !group.participants.contains(&container) {
                    group.participants.push(container);
                }
            }
            _ => warn!(sync = ?id, "add_to_sync_set for a sync that is not active"),
        }
    }

    pub fn set_ready(&mut self, id: SyncId) {
        match &mut self.active {
            Some(group) if group.id == id => group.ready = true,
            _ => warn!(sync = ?id, "set_ready for a sync that is not active"),
        }
    }

    pub fn is_ready(&self, id: SyncId) -> bool {
        self.active.as_ref().is_some_and(|g| g.id == id && g.ready)
    }

    /// Completes the active sync set: drains every participant's pending
    /// surface updates from `store` into one merged transaction and frees
    /// the engine for the next set.
    pub fn finish(&mut self, id: SyncId, store: &SurfaceTxStore) -> SurfaceTransaction {
        let mut merged = SurfaceTransaction::new();
        match self.active.take() {
            Some(group) if group.id == id => {
                for participant in &group.participants {
                    if let Some(tx) = store.take(*participant) {
                        merged.merge(tx);
                    }
                }
                debug!(sync = ?id, commands = merged.commands().len(), "sync set complete");
            }
            other => {
                warn!(sync = ?id, "finish for a sync that is not active");
                self.active = other;
            }
        }
        merged
    }

    /// Drops the active sync set, discarding participants' pending updates.
    pub fn abort(&mut self, id: SyncId, store: &SurfaceTxStore) {
        match self.active.take() {
            Some(group) if group.id == id => {
                for participant in &group.participants {
                    store.discard(*participant);
                }
                debug!(sync = ?id, "sync set aborted");
            }
            other => {
                warn!(sync = ?id, "abort for a sync that is not active");
                self.active = other;
            }
        }
    }

    pub fn queue(&mut self, deferred: Q) { self.queued.push_back(deferred); }

    pub fn pop_queued(&mut self) -> Option<Q> { self.queued.pop_front() }

    pub fn queued_len(&self) -> usize { self.queued.len() }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::container::{ContainerKind, ContainerTree};

    fn engine() -> SyncEngine<u32> { SyncEngine::new() }

    #[test]
    fn one_active_sync_at_a_time() {
        let mut sync = engine();
        assert!(!sync.has_active_sync());
        let group = sync.prepare_sync_set();
        let id = group.id();
        sync.start_sync_set(group);
        assert!(sync.has_active_sync());
        assert_eq!(sync.active_id(), Some(id));
    }

    #[test]
    fn finish_merges_participant_transactions_in_order() {
        let mut tree = ContainerTree::new();
        let a = tree.create(ContainerKind::Task);
        let b = tree.create(ContainerKind::Task);
        let store = SurfaceTxStore::new();
        let mut tx_a = SurfaceTransaction::new();
        tx_a.set_position(tree.token_of(a).unwrap(), 1, 1);
        store.push(a, tx_a);
        let mut tx_b = SurfaceTransaction::new();
        tx_b.set_position(tree.token_of(b).unwrap(), 2, 2);
        store.push(b, tx_b);

        let mut sync = engine();
        let group = sync.prepare_sync_set();
        let id = group.id();
        sync.start_sync_set(group);
        sync.add_to_sync_set(id, a);
        sync.add_to_sync_set(id, b);
        sync.set_ready(id);
        assert!(sync.is_ready(id));

        let merged = sync.finish(id, &store);
        assert_eq!(merged.commands().len(), 2);
        assert!(!sync.has_active_sync());
        assert!(store.is_empty());
    }

    #[test]
    fn duplicate_participants_collapse() {
        let mut tree = ContainerTree::new();
        let a = tree.create(ContainerKind::Task);
        let mut sync = engine();
        let group = sync.prepare_sync_set();
        let id = group.id();
        sync.start_sync_set(group);
        sync.add_to_sync_set(id, a);
        sync.add_to_sync_set(id, a);
        assert_eq!(sync.active.as_ref().unwrap().participants().len(), 1);
    }

    #[test]
    fn stale_ids_are_ignored() {
        let mut tree = ContainerTree::new();
        let a = tree.create(ContainerKind::Task);
        let store = SurfaceTxStore::new();
        let mut sync = engine();
        let stale = sync.prepare_sync_set();
        let stale_id = stale.id();
        let group = sync.prepare_sync_set();
        let live_id = group.id();
        sync.start_sync_set(group);

        sync.add_to_sync_set(stale_id, a);
        sync.set_ready(stale_id);
        assert!(!sync.is_ready(live_id));
        let merged = sync.finish(stale_id, &store);
        assert!(merged.is_empty());
        // The live sync is untouched.
        assert!(sync.has_active_sync());
    }

    #[test]
    fn queue_is_fifo() {
        let mut sync = engine();
        sync.queue(1);
        sync.queue(2);
        sync.queue(3);
        assert_eq!(sync.queued_len(), 3);
        assert_eq!(sync.pop_queued(), Some(1));
        assert_eq!(sync.pop_queued(), Some(2));
        assert_eq!(sync.pop_queued(), Some(3));
        assert_eq!(sync.pop_queued(), None);
    }

    #[test]
    fn abort_discards_pending_surface_updates() {
        let mut tree = ContainerTree::new();
        let a = tree.create(ContainerKind::Task);
        let store = SurfaceTxStore::new();
        let mut tx = SurfaceTransaction::new();
        tx.set_position(tree.token_of(a).unwrap(), 5, 5);
        store.push(a, tx);

        let mut sync = engine();
        let group = sync.prepare_sync_set();
        let id = group.id();
        sync.start_sync_set(group);
        sync.add_to_sync_set(id, a);
        sync.abort(id, &store);
        assert!(!sync.has_active_sync());
        assert!(store.is_empty());
    }
}
