mod applier;
pub mod error;
pub mod events;
pub mod launcher;
pub mod registry;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::common::collections::FxHashMap;
use crate::common::config::{Config, OrganizerSettings};
use crate::engine::sync::{SyncEngine, SyncGroup, SyncId};
use crate::engine::transition::{
    NoopTransitionPlayer, TransitionController, TransitionInfo, TransitionKind, TransitionPlayer,
    TransitionToken,
};
use crate::model::container::{
    ContainerId, ContainerKind, ContainerToken, ContainerTree, FragmentToken, Position,
};
use crate::model::surface::{SurfaceTransaction, SurfaceTxStore};
use crate::organizer::error::{DeliveryError, OrganizerError};
use crate::organizer::launcher::{ActivityLauncher, ActivityStarter, ImmediateLauncher};
use crate::organizer::registry::{
    OrganizerEndpoint, OrganizerId, OrganizerRegistry, RemoteAnimationDefinition,
};
use crate::organizer::transaction::WindowContainerTransaction;

/// Identity and privileges of the thread calling into the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerInfo {
    pub pid: u32,
    pub uid: u32,
    /// Holds the window-management permission; required for every entry
    /// point that mutates the hierarchy directly.
    pub can_manage_windows: bool,
    /// May launch tasks from recents.
    pub can_start_tasks: bool,
}

impl CallerInfo {
    pub fn privileged() -> Self {
        CallerInfo { pid: 0, uid: 1000, can_manage_windows: true, can_start_tasks: true }
    }

    pub fn app(pid: u32, uid: u32) -> Self {
        CallerInfo { pid, uid, can_manage_windows: false, can_start_tasks: false }
    }
}

/// Device policy hooks consulted while applying transactions.
pub trait WmPolicy: Send + Sync {
    fn is_in_lock_task_mode(&self) -> bool { false }

    /// Whether reordering a task owned by `uid` would break lock-task mode.
    fn is_lock_task_violation(&self, _uid: u32) -> bool { false }

    /// Whether an activity of `uid` may not be finished right now.
    fn is_activity_finish_blocked(&self, _uid: u32) -> bool { false }
}

/// Policy with nothing locked down.
pub struct DefaultPolicy;

impl WmPolicy for DefaultPolicy {}

/// Completion callback for a sync transaction: receives the merged surface
/// updates of every participant.
pub trait TransactionCallback: Send + Sync {
    fn on_transaction_ready(
        &self,
        sync: SyncId,
        merged: &SurfaceTransaction,
    ) -> Result<(), DeliveryError>;
}

/// Work parked behind the active sync set, started FIFO as syncs complete.
pub(crate) enum QueuedSync {
    Transaction {
        group: SyncGroup,
        transaction: WindowContainerTransaction,
        caller: CallerInfo,
        callback: Arc<dyn TransactionCallback>,
    },
    Transition {
        token: TransitionToken,
        transaction: WindowContainerTransaction,
        caller: CallerInfo,
        /// Seal the transition right after applying its transaction.
        seal: bool,
    },
}

/// All state guarded by the hierarchy lock.
pub struct WmCore {
    pub(crate) tree: ContainerTree,
    pub(crate) registry: OrganizerRegistry,
    pub(crate) sync: SyncEngine<QueuedSync>,
    pub(crate) transitions: TransitionController,
    pub(crate) surfaces: SurfaceTxStore,
    /// Client fragment token -> live container.
    pub(crate) fragments: FxHashMap<FragmentToken, ContainerId>,
    pub(crate) sync_callbacks: FxHashMap<SyncId, Arc<dyn TransactionCallback>>,
    /// Sealed transitions waiting for their sync to complete.
    pub(crate) sync_transitions: FxHashMap<SyncId, TransitionInfo>,
    pub(crate) focused_activity: Option<ContainerId>,
    /// While non-zero, pending events stay queued.
    pub(crate) layout_deferred: u32,
    pub(crate) settings: OrganizerSettings,
}

impl WmCore {
    fn new(settings: OrganizerSettings, player: Arc<dyn TransitionPlayer>) -> Self {
        WmCore {
            tree: ContainerTree::new(),
            registry: OrganizerRegistry::new(
                Duration::from_millis(settings.temporary_token_timeout_ms),
                settings.max_pending_events,
            ),
            sync: SyncEngine::new(),
            transitions: TransitionController::new(player),
            surfaces: SurfaceTxStore::new(),
            fragments: FxHashMap::default(),
            sync_callbacks: FxHashMap::default(),
            sync_transitions: FxHashMap::default(),
            focused_activity: None,
            layout_deferred: 0,
            settings,
        }
    }
}

/// The hierarchy lock plus the condvar activity starts park on.
pub struct WmLock {
    pub(crate) core: Mutex<WmCore>,
    pub(crate) starters: Condvar,
}

/// Entry point for window organizers: applies container transactions,
/// manages transitions, and runs the task fragment event pipeline.
pub struct WindowOrganizerService {
    lock: Arc<WmLock>,
    starter: ActivityStarter,
    launcher: Arc<dyn ActivityLauncher>,
    policy: Arc<dyn WmPolicy>,
}

impl WindowOrganizerService {
    pub fn new(
        config: &Config,
        launcher: Arc<dyn ActivityLauncher>,
        policy: Arc<dyn WmPolicy>,
        player: Arc<dyn TransitionPlayer>,
    ) -> Arc<Self> {
        let settings = config.organizer.clone();
        let lock = Arc::new(WmLock {
            core: Mutex::new(WmCore::new(settings, player)),
            starters: Condvar::new(),
        });
        let starter = ActivityStarter::new(Arc::clone(&lock));
        Arc::new(WindowOrganizerService { lock, starter, launcher, policy })
    }

    /// Service with stand-in collaborators, for demos and tests.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(
            &Config::default(),
            Arc::new(ImmediateLauncher),
            Arc::new(DefaultPolicy),
            Arc::new(NoopTransitionPlayer),
        )
    }

    fn enforce_manage_permission(&self, caller: &CallerInfo) -> Result<(), OrganizerError> {
        if caller.can_manage_windows { Ok(()) } else { Err(OrganizerError::PermissionDenied) }
    }

    /// Runs `f` with layout deferred, then resumes and dispatches whatever
    /// events the work produced.
    fn with_deferred_layout<R>(
        &self,
        guard: &mut MutexGuard<'_, WmCore>,
        f: impl FnOnce(&Self, &mut MutexGuard<'_, WmCore>) -> R,
    ) -> R {
        guard.layout_deferred += 1;
        let result = f(self, guard);
        guard.layout_deferred -= 1;
        self.dispatch_locked(guard);
        result
    }

    pub(crate) fn dispatch_locked(&self, guard: &mut MutexGuard<'_, WmCore>) {
        if guard.layout_deferred > 0 {
            return;
        }
        let core: &mut WmCore = &mut *guard;
        core.registry.dispatch_pending_events(&mut core.tree);
    }

    /// Applies a transaction immediately, without surface synchronization.
    pub fn apply_transaction(
        &self,
        transaction: &WindowContainerTransaction,
        caller: &CallerInfo,
    ) -> Result<(), OrganizerError> {
        self.enforce_manage_permission(caller)?;
        if transaction.is_empty() {
            return Ok(());
        }
        let mut guard = self.lock.core.lock();
        self.with_deferred_layout(&mut guard, |this, guard| {
            this.apply_transaction_locked(guard, transaction, None, None, caller, None)
        })
    }

    /// Applies a transaction inside a sync set; `callback` receives the
    /// merged surface updates when the set completes. Returns the sync id,
    /// which may correspond to a queued start if a sync is already active.
    pub fn apply_sync_transaction(
        &self,
        transaction: &WindowContainerTransaction,
        caller: &CallerInfo,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<SyncId, OrganizerError> {
        self.enforce_manage_permission(caller)?;
        let mut guard = self.lock.core.lock();
        let group = guard.sync.prepare_sync_set();
        let id = group.id();
        if guard.sync.has_active_sync() {
            if guard.sync.queued_len() >= guard.settings.max_queued_syncs {
                return Err(OrganizerError::SyncQueueFull);
            }
            debug!(sync = ?id, "sync engine busy; queueing sync transaction");
            guard.sync.queue(QueuedSync::Transaction {
                group,
                transaction: transaction.clone(),
                caller: caller.clone(),
                callback,
            });
            return Ok(id);
        }
        guard.sync.start_sync_set(group);
        guard.sync_callbacks.insert(id, callback);
        let result = self.with_deferred_layout(&mut guard, |this, guard| {
            this.apply_transaction_locked(guard, transaction, Some(id), None, caller, None)
        });
        guard.sync.set_ready(id);
        self.maybe_finish_sync(&mut guard);
        result.map(|()| id)
    }

    /// Creates a transition, collecting immediately when the sync engine is
    /// free so intervening changes cannot sneak in unobserved, or queueing
    /// the start otherwise. With a transaction the transition is applied
    /// and sealed in one go; without, it stays collecting until
    /// [`Self::start_transition`].
    pub fn start_new_transition(
        &self,
        kind: TransitionKind,
        transaction: Option<&WindowContainerTransaction>,
        caller: &CallerInfo,
    ) -> Result<TransitionToken, OrganizerError> {
        self.enforce_manage_permission(caller)?;
        let mut guard = self.lock.core.lock();
        if guard.sync.has_active_sync() {
            if guard.sync.queued_len() >= guard.settings.max_queued_syncs {
                return Err(OrganizerError::SyncQueueFull);
            }
            let token = guard.transitions.create_pending(kind);
            debug!(?token, "sync engine busy; queueing transition start");
            guard.sync.queue(QueuedSync::Transition {
                token,
                transaction: transaction.cloned().unwrap_or_default(),
                caller: caller.clone(),
                seal: transaction.is_some(),
            });
            return Ok(token);
        }
        let core: &mut WmCore = &mut *guard;
        let token = core.transitions.create(kind, &mut core.sync)?;
        if let Some(transaction) = transaction {
            let sync_id = guard.transitions.get(token).and_then(|t| t.sync_id());
            let applied = self.with_deferred_layout(&mut guard, |this, guard| {
                this.apply_transaction_locked(guard, transaction, sync_id, Some(token), caller, None)
            });
            if let Err(err) = applied {
                self.abort_transition_locked(&mut guard, token);
                self.start_next_queued(&mut guard);
                return Err(err);
            }
            self.seal_transition(&mut guard, token)?;
            self.maybe_finish_sync(&mut guard);
            self.dispatch_locked(&mut guard);
        }
        Ok(token)
    }

    /// Applies `transaction` into a collecting transition and seals it.
    pub fn start_transition(
        &self,
        token: TransitionToken,
        transaction: Option<&WindowContainerTransaction>,
        caller: &CallerInfo,
    ) -> Result<(), OrganizerError> {
        self.enforce_manage_permission(caller)?;
        let mut guard = self.lock.core.lock();
        let sync_id = guard
            .transitions
            .get(token)
            .ok_or(OrganizerError::Transition(
                crate::engine::transition::TransitionError::Unknown,
            ))?
            .sync_id();
        if let Some(transaction) = transaction {
            let applied = self.with_deferred_layout(&mut guard, |this, guard| {
                this.apply_transaction_locked(guard, transaction, sync_id, Some(token), caller, None)
            });
            if let Err(err) = applied {
                self.abort_transition_locked(&mut guard, token);
                self.start_next_queued(&mut guard);
                return Err(err);
            }
        }
        self.seal_transition(&mut guard, token)?;
        self.maybe_finish_sync(&mut guard);
        self.dispatch_locked(&mut guard);
        Ok(())
    }

    /// Marks a started transition finished, optionally applying a cleanup
    /// transaction first. Restore-transient-order operations in the
    /// transaction consult this transition's restore targets.
    pub fn finish_transition(
        &self,
        token: TransitionToken,
        transaction: Option<&WindowContainerTransaction>,
        callback: Option<Arc<dyn TransactionCallback>>,
        caller: &CallerInfo,
    ) -> Result<(), OrganizerError> {
        self.enforce_manage_permission(caller)?;
        let mut guard = self.lock.core.lock();
        let sync_id = match callback {
            Some(callback) => {
                if guard.sync.has_active_sync() {
                    return Err(OrganizerError::SyncBusy);
                }
                let group = guard.sync.prepare_sync_set();
                let id = group.id();
                guard.sync.start_sync_set(group);
                guard.sync_callbacks.insert(id, callback);
                Some(id)
            }
            None => None,
        };
        let result = match transaction {
            Some(transaction) => self.with_deferred_layout(&mut guard, |this, guard| {
                this.apply_transaction_locked(
                    guard,
                    transaction,
                    sync_id,
                    None,
                    caller,
                    Some(token),
                )
            }),
            None => Ok(()),
        };
        if let Err(err) = guard.transitions.finish(token) {
            if let Some(id) = sync_id {
                guard.sync_callbacks.remove(&id);
                {
                    let core: &mut WmCore = &mut *guard;
                    core.sync.abort(id, &core.surfaces);
                }
                self.start_next_queued(&mut guard);
            }
            return Err(err.into());
        }
        if let Some(id) = sync_id {
            guard.sync.set_ready(id);
            self.maybe_finish_sync(&mut guard);
        }
        self.dispatch_locked(&mut guard);
        result
    }

    /// Applies a transaction on behalf of a task fragment organizer,
    /// wrapping it in a transition. When a transition is already collecting
    /// and the organizer does not insist on its own, the changes join it.
    pub fn apply_fragment_transaction(
        &self,
        transaction: &WindowContainerTransaction,
        kind: TransitionKind,
        should_apply_independently: bool,
        caller: &CallerInfo,
    ) -> Result<(), OrganizerError> {
        let organizer = transaction.organizer().ok_or(OrganizerError::NotRegistered)?;
        let mut guard = self.lock.core.lock();
        let state = guard.registry.state(organizer).ok_or(OrganizerError::NotRegistered)?;
        if state.uid != caller.uid && !caller.can_manage_windows {
            return Err(OrganizerError::PermissionDenied);
        }
        if !guard.sync.has_active_sync() {
            let core: &mut WmCore = &mut *guard;
            let token = core.transitions.create(kind, &mut core.sync)?;
            let sync_id = guard.transitions.get(token).and_then(|t| t.sync_id());
            let applied = self.with_deferred_layout(&mut guard, |this, guard| {
                this.apply_transaction_locked(guard, transaction, sync_id, Some(token), caller, None)
            });
            if let Err(err) = applied {
                self.abort_transition_locked(&mut guard, token);
                self.start_next_queued(&mut guard);
                return Err(err);
            }
            self.seal_transition(&mut guard, token)?;
            self.maybe_finish_sync(&mut guard);
            self.dispatch_locked(&mut guard);
            return Ok(());
        }
        if !should_apply_independently {
            let collecting = guard.transitions.collecting();
            let sync_id = guard.sync.active_id();
            return self.with_deferred_layout(&mut guard, |this, guard| {
                this.apply_transaction_locked(guard, transaction, sync_id, collecting, caller, None)
            });
        }
        if guard.sync.queued_len() >= guard.settings.max_queued_syncs {
            return Err(OrganizerError::SyncQueueFull);
        }
        let token = guard.transitions.create_pending(kind);
        debug!(?token, ?organizer, "queueing independent fragment transaction");
        guard.sync.queue(QueuedSync::Transition {
            token,
            transaction: transaction.clone(),
            caller: caller.clone(),
            seal: true,
        });
        Ok(())
    }

    /// Seals a collecting transition: hands it to the player's queue by way
    /// of the sync pipeline and readies its sync set.
    fn seal_transition(
        &self,
        guard: &mut MutexGuard<'_, WmCore>,
        token: TransitionToken,
    ) -> Result<(), OrganizerError> {
        let core: &mut WmCore = &mut *guard;
        let (info, sync_id) = core.transitions.request_start(token, &core.tree)?;
        core.sync_transitions.insert(sync_id, info);
        core.sync.set_ready(sync_id);
        Ok(())
    }

    /// Unwinds a transition whose transaction failed before sealing: the
    /// transition aborts and the sync set it held is discarded so the
    /// engine is free for queued work.
    fn abort_transition_locked(&self, guard: &mut MutexGuard<'_, WmCore>, token: TransitionToken) {
        match guard.transitions.abort(token) {
            Ok(Some(sync_id)) => {
                let core: &mut WmCore = &mut *guard;
                core.sync.abort(sync_id, &core.surfaces);
            }
            Ok(None) => {}
            Err(err) => warn!(?token, %err, "abort of failed transition rejected"),
        }
    }

    /// Completes the active sync if it is ready, routes its merged surface
    /// transaction, and promotes queued work FIFO until something claims
    /// the engine again.
    pub(crate) fn maybe_finish_sync(&self, guard: &mut MutexGuard<'_, WmCore>) {
        loop {
            let Some(id) = guard.sync.active_id().filter(|id| guard.sync.is_ready(*id)) else {
                return;
            };
            let merged = {
                let core: &mut WmCore = &mut *guard;
                core.sync.finish(id, &core.surfaces)
            };
            if let Some(callback) = guard.sync_callbacks.remove(&id) {
                if let Err(err) = callback.on_transaction_ready(id, &merged) {
                    // The callback owner is gone; apply locally so the
                    // surface updates are not lost.
                    warn!(sync = ?id, %err, "sync callback unreachable; applying locally");
                    merged.apply();
                }
            } else if let Some(info) = guard.sync_transitions.remove(&id) {
                let player = guard.transitions.player();
                player.on_transition_ready(info, merged);
            } else {
                merged.apply();
            }
            self.start_next_queued(guard);
        }
    }

    /// Promotes queued syncs until one actually claims the engine.
    fn start_next_queued(&self, guard: &mut MutexGuard<'_, WmCore>) {
        while !guard.sync.has_active_sync() {
            let Some(queued) = guard.sync.pop_queued() else { return };
            match queued {
                QueuedSync::Transaction { group, transaction, caller, callback } => {
                    let id = group.id();
                    guard.sync.start_sync_set(group);
                    guard.sync_callbacks.insert(id, callback);
                    let result = self.with_deferred_layout(guard, |this, guard| {
                        this.apply_transaction_locked(
                            guard,
                            &transaction,
                            Some(id),
                            None,
                            &caller,
                            None,
                        )
                    });
                    if let Err(err) = result {
                        warn!(sync = ?id, %err, "queued sync transaction failed");
                    }
                    guard.sync.set_ready(id);
                    return;
                }
                QueuedSync::Transition { token, transaction, caller, seal } => {
                    // The organizer may have died while the start waited.
                    if let Some(organizer) = transaction.organizer() {
                        if !guard.registry.is_registered(organizer) {
                            warn!(?token, "organizer gone; aborting queued transition");
                            let _ = guard.transitions.abort(token);
                            continue;
                        }
                    }
                    let sync_id = {
                        let core: &mut WmCore = &mut *guard;
                        match core.transitions.move_to_collecting(token, &mut core.sync) {
                            Ok(id) => id,
                            Err(err) => {
                                warn!(?token, %err, "queued transition cannot collect");
                                continue;
                            }
                        }
                    };
                    let result = self.with_deferred_layout(guard, |this, guard| {
                        this.apply_transaction_locked(
                            guard,
                            &transaction,
                            Some(sync_id),
                            Some(token),
                            &caller,
                            None,
                        )
                    });
                    if let Err(err) = result {
                        warn!(?token, %err, "queued transition transaction failed");
                        if seal {
                            self.abort_transition_locked(guard, token);
                            continue;
                        }
                        return;
                    }
                    if seal {
                        if let Err(err) = self.seal_transition(guard, token) {
                            warn!(?token, %err, "queued transition could not seal");
                        }
                    }
                    return;
                }
            }
        }
    }

    // --- task fragment organizer registration ---

    pub fn register_organizer(
        &self,
        endpoint: Arc<dyn OrganizerEndpoint>,
        caller: &CallerInfo,
    ) -> Result<OrganizerId, OrganizerError> {
        let mut guard = self.lock.core.lock();
        guard.registry.register(endpoint, caller.pid, caller.uid)
    }

    /// Tears the organizer down: its queued events are dropped and every
    /// fragment it organized is removed from the hierarchy.
    pub fn unregister_organizer(&self, id: OrganizerId) -> Result<(), OrganizerError> {
        let mut guard = self.lock.core.lock();
        let organized = guard.registry.unregister(id)?;
        for fragment in organized {
            if !guard.tree.contains(fragment) {
                continue;
            }
            info!(?id, "removing organized fragment of unregistered organizer");
            self.remove_subtree_locked(&mut guard, fragment, None, None);
        }
        self.ensure_visibility_locked(&mut guard);
        self.dispatch_locked(&mut guard);
        Ok(())
    }

    /// Equivalent to unregistration, used when the remote side disappears.
    pub fn on_organizer_died(&self, id: OrganizerId) {
        if let Err(err) = self.unregister_organizer(id) {
            debug!(?id, %err, "death notification for unknown organizer");
        }
    }

    pub fn register_remote_animations(
        &self,
        id: OrganizerId,
        task: ContainerToken,
        definition: RemoteAnimationDefinition,
    ) -> Result<(), OrganizerError> {
        self.lock.core.lock().registry.register_remote_animations(id, task, definition)
    }

    pub fn unregister_remote_animations(
        &self,
        id: OrganizerId,
        task: ContainerToken,
    ) -> Result<(), OrganizerError> {
        self.lock.core.lock().registry.unregister_remote_animations(id, task)
    }

    pub fn remote_animations(
        &self,
        id: OrganizerId,
        task: ContainerToken,
    ) -> Option<RemoteAnimationDefinition> {
        self.lock.core.lock().registry.remote_animations(id, task).cloned()
    }

    pub fn is_organizer_registered(&self, id: OrganizerId) -> bool {
        self.lock.core.lock().registry.is_registered(id)
    }

    /// Delivers whatever queued events are dispatchable right now.
    pub fn dispatch_pending_events(&self) {
        let mut guard = self.lock.core.lock();
        self.dispatch_locked(&mut guard);
    }

    /// Flushes the queued info-changed event for one fragment, bypassing the
    /// host-task visibility defer. Used when a client blocks on fresh info.
    pub fn dispatch_pending_info_changed_event(&self, fragment: ContainerToken) -> bool {
        let mut guard = self.lock.core.lock();
        let core: &mut WmCore = &mut *guard;
        let Some(id) = core.tree.resolve(fragment) else { return false };
        core.registry.dispatch_pending_info_changed_event(&mut core.tree, id)
    }

    /// Whether the activity sits in an organized fragment smaller than its
    /// task.
    pub fn is_activity_embedded(&self, activity: ContainerToken) -> bool {
        let guard = self.lock.core.lock();
        let Some(id) = guard.tree.resolve(activity) else { return false };
        let Some(fragment) = guard
            .tree
            .ancestors(id)
            .find(|a| guard.tree.get(*a).is_some_and(|n| n.is_organized_fragment()))
        else {
            return false;
        };
        let Some(task) = guard.tree.task_of(fragment) else { return false };
        let fragment_bounds = guard.tree.effective_bounds(fragment);
        let task_bounds = guard.tree.effective_bounds(task);
        fragment_bounds != task_bounds && task_bounds.contains(&fragment_bounds)
    }

    // --- host-side hierarchy construction ---
    //
    // In production the window manager proper owns these; tests and the
    // demo binary drive them directly.

    pub fn create_display_area(&self) -> ContainerToken {
        let mut guard = self.lock.core.lock();
        let core: &mut WmCore = &mut *guard;
        let id = core.tree.create(ContainerKind::DisplayArea);
        let root = core.tree.root();
        core.tree.attach(id, root, Position::Top);
        let token = core.tree.token_of(id).expect("created container has a token");
        self.ensure_visibility_locked(&mut guard);
        token
    }

    pub fn create_task(
        &self,
        display_area: ContainerToken,
        uid: u32,
    ) -> Result<ContainerToken, OrganizerError> {
        let mut guard = self.lock.core.lock();
        let parent =
            guard.tree.resolve(display_area).ok_or(OrganizerError::UnknownContainer)?;
        let id = guard.tree.create(ContainerKind::Task);
        {
            let node = guard.tree.get_mut(id).expect("created container exists");
            node.uid = uid;
        }
        guard.tree.attach(id, parent, Position::Top);
        let token = guard.tree.token_of(id).expect("created container has a token");
        self.ensure_visibility_locked(&mut guard);
        self.dispatch_locked(&mut guard);
        Ok(token)
    }

    pub fn create_activity(
        &self,
        parent: ContainerToken,
        uid: u32,
        pid: u32,
    ) -> Result<ContainerToken, OrganizerError> {
        let mut guard = self.lock.core.lock();
        let parent_id = guard.tree.resolve(parent).ok_or(OrganizerError::UnknownContainer)?;
        let id = guard.tree.create(ContainerKind::Activity);
        {
            let node = guard.tree.get_mut(id).expect("created container exists");
            node.uid = uid;
            node.pid = pid;
        }
        guard.tree.attach(id, parent_id, Position::Top);
        let token = guard.tree.token_of(id).expect("created container has a token");
        self.note_fragment_subtree_changed(&mut guard, id);
        self.ensure_visibility_locked(&mut guard);
        self.dispatch_locked(&mut guard);
        Ok(token)
    }

    pub fn set_activity_min_dimensions(
        &self,
        activity: ContainerToken,
        min_width: i32,
        min_height: i32,
    ) -> Result<(), OrganizerError> {
        let mut guard = self.lock.core.lock();
        let id = guard.tree.resolve(activity).ok_or(OrganizerError::UnknownContainer)?;
        let node = guard.tree.get_mut(id).ok_or(OrganizerError::UnknownContainer)?;
        node.min_width = min_width;
        node.min_height = min_height;
        Ok(())
    }

    /// Marks a transient launch inside a collecting transition, recording
    /// where the moved task should be restored if the launch does not
    /// commit.
    pub fn set_transient_launch(
        &self,
        transition: TransitionToken,
        moved_task: ContainerToken,
        restore_below: ContainerToken,
    ) -> Result<(), OrganizerError> {
        let mut guard = self.lock.core.lock();
        let moved =
            guard.tree.resolve(moved_task).ok_or(OrganizerError::UnknownContainer)?;
        let below =
            guard.tree.resolve(restore_below).ok_or(OrganizerError::UnknownContainer)?;
        let transition_state = guard
            .transitions
            .get_mut(transition)
            .ok_or(OrganizerError::Transition(
                crate::engine::transition::TransitionError::Unknown,
            ))?;
        transition_state.set_transient_launch(moved, below);
        Ok(())
    }

    /// The live container behind a client fragment token, if any.
    pub fn fragment_container(&self, fragment: FragmentToken) -> Option<ContainerToken> {
        let guard = self.lock.core.lock();
        let id = guard.fragments.get(&fragment).copied()?;
        guard.tree.token_of(id)
    }

    pub fn focused_activity(&self) -> Option<ContainerToken> {
        let guard = self.lock.core.lock();
        guard.focused_activity.and_then(|id| guard.tree.token_of(id))
    }

    pub fn dump(&self) -> String { self.lock.core.lock().tree.dump() }

    #[cfg(test)]
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut WmCore) -> R) -> R {
        let mut guard = self.lock.core.lock();
        f(&mut guard)
    }
}
