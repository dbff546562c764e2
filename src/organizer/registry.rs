use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use tracing::{debug, trace, warn};

use crate::common::collections::FxHashMap;
use crate::model::configuration::{Configuration, configurations_equal_for_organizer};
use crate::model::container::{ContainerId, ContainerToken, ContainerTree, FragmentInfo};
use crate::organizer::error::{OpError, OrganizerError};
use crate::organizer::events::{
    ActivityRef, ClientChange, ErrorToken, OrganizerTransaction, ParentInfo, PendingEvent,
    PendingEventKind, TempToken,
};
use crate::organizer::transaction::OpKind;

slotmap::new_key_type! {
    /// Handle for a registered task fragment organizer.
    pub struct OrganizerId;
}

/// Receiving side of an organizer: event batches are pushed here.
pub trait OrganizerEndpoint: Send + Sync {
    fn on_transaction_ready(
        &self,
        transaction: OrganizerTransaction,
    ) -> Result<(), crate::organizer::error::DeliveryError>;
}

/// Animation overrides an organizer supplies for transitions over its
/// fragments. Opaque to the service; forwarded to whoever animates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAnimationDefinition {
    pub label: String,
    pub duration_ms: u64,
}

struct TempTokenEntry {
    activity: ContainerId,
    expires_at: Instant,
}

/// Per-organizer bookkeeping: which fragments it owns, what it was last
/// told about each, and its outstanding temporary activity tokens.
pub struct OrganizerState {
    endpoint: Arc<dyn OrganizerEndpoint>,
    pub pid: u32,
    pub uid: u32,
    organized: Vec<ContainerId>,
    last_sent_infos: FxHashMap<ContainerId, FragmentInfo>,
    last_sent_parent_configs: FxHashMap<ContainerId, Configuration>,
    temp_tokens: FxHashMap<TempToken, TempTokenEntry>,
    remote_animations: FxHashMap<ContainerToken, RemoteAnimationDefinition>,
}

impl OrganizerState {
    pub fn organized_fragments(&self) -> &[ContainerId] { &self.organized }

    pub fn last_sent_info(&self, fragment: ContainerId) -> Option<&FragmentInfo> {
        self.last_sent_infos.get(&fragment)
    }
}

/// Registration and event-pipeline state for all organizers.
pub struct OrganizerRegistry {
    organizers: SlotMap<OrganizerId, OrganizerState>,
    pending_events: Vec<PendingEvent>,
    token_timeout: Duration,
    max_pending_events: usize,
    next_temp_token: u64,
}

impl OrganizerRegistry {
    pub fn new(token_timeout: Duration, max_pending_events: usize) -> Self {
        OrganizerRegistry {
            organizers: SlotMap::with_key(),
            pending_events: Vec::new(),
            token_timeout,
            max_pending_events,
            next_temp_token: 1,
        }
    }

    pub fn register(
        &mut self,
        endpoint: Arc<dyn OrganizerEndpoint>,
        pid: u32,
        uid: u32,
    ) -> Result<OrganizerId, OrganizerError> {
        let duplicate = self
            .organizers
            .values()
            .any(|state| Arc::ptr_eq(&state.endpoint, &endpoint));
        if duplicate {
            return Err(OrganizerError::AlreadyRegistered);
        }
        let id = self.organizers.insert(OrganizerState {
            endpoint,
            pid,
            uid,
            organized: Vec::new(),
            last_sent_infos: FxHashMap::default(),
            last_sent_parent_configs: FxHashMap::default(),
            temp_tokens: FxHashMap::default(),
            remote_animations: FxHashMap::default(),
        });
        debug!(organizer = ?id, pid, uid, "task fragment organizer registered");
        Ok(id)
    }

    /// Removes the organizer and its queued events. The caller is
    /// responsible for tearing down its organized fragments; they are
    /// returned bottom of the list first.
    pub fn unregister(&mut self, id: OrganizerId) -> Result<Vec<ContainerId>, OrganizerError> {
        let state = self.organizers.remove(id).ok_or(OrganizerError::NotRegistered)?;
        self.pending_events.retain(|e| e.organizer != id);
        debug!(organizer = ?id, fragments = state.organized.len(), "organizer unregistered");
        Ok(state.organized)
    }

    pub fn is_registered(&self, id: OrganizerId) -> bool { self.organizers.contains_key(id) }

    pub fn state(&self, id: OrganizerId) -> Option<&OrganizerState> { self.organizers.get(id) }

    /// Registers animation overrides for transitions over `task`. One
    /// definition per task; later tasks register separately.
    pub fn register_remote_animations(
        &mut self,
        id: OrganizerId,
        task: ContainerToken,
        definition: RemoteAnimationDefinition,
    ) -> Result<(), OrganizerError> {
        let state = self.organizers.get_mut(id).ok_or(OrganizerError::NotRegistered)?;
        if state.remote_animations.contains_key(&task) {
            return Err(OrganizerError::AnimationsAlreadyRegistered);
        }
        state.remote_animations.insert(task, definition);
        Ok(())
    }

    pub fn unregister_remote_animations(
        &mut self,
        id: OrganizerId,
        task: ContainerToken,
    ) -> Result<(), OrganizerError> {
        let state = self.organizers.get_mut(id).ok_or(OrganizerError::NotRegistered)?;
        state.remote_animations.remove(&task);
        Ok(())
    }

    pub fn remote_animations(
        &self,
        id: OrganizerId,
        task: ContainerToken,
    ) -> Option<&RemoteAnimationDefinition> {
        self.organizers.get(id).and_then(|s| s.remote_animations.get(&task))
    }

    fn last_pending_lifecycle_event(
        &self,
        organizer: OrganizerId,
        container: ContainerId,
    ) -> Option<usize> {
        self.pending_events.iter().rposition(|e| {
            e.organizer == organizer && !e.is_error() && e.container() == Some(container)
        })
    }

    fn enqueue(&mut self, event: PendingEvent) {
        let organizer = event.organizer;
        let queued = self.pending_events.iter().filter(|e| e.organizer == organizer).count();
        if queued >= self.max_pending_events {
            warn!(?organizer, queued, "pending event overflow, dropping oldest");
            if let Some(oldest) =
                self.pending_events.iter().position(|e| e.organizer == organizer)
            {
                self.pending_events.remove(oldest);
            }
        }
        self.pending_events.push(event);
    }

    /// A fragment managed by `organizer` became live in the hierarchy.
    pub fn on_fragment_appeared(&mut self, organizer: OrganizerId, container: ContainerId) {
        let Some(state) = self.organizers.get_mut(organizer) else { return };
        if state.organized.contains(&container) {
            return;
        }
        state.organized.push(container);
        self.enqueue(PendingEvent::new(organizer, PendingEventKind::Appeared { container }));
    }

    /// A live organized fragment changed in a way its organizer may care
    /// about. Coalesces with any queued lifecycle event for the fragment.
    pub fn on_fragment_info_changed(
        &mut self,
        tree: &ContainerTree,
        organizer: OrganizerId,
        container: ContainerId,
    ) {
        if !self.organizers.contains_key(organizer) {
            return;
        }
        match self.last_pending_lifecycle_event(organizer, container) {
            None => {
                // Nothing sent yet means the appeared event will carry the
                // fresh info anyway.
                let appeared_sent = tree.get(container).is_some_and(|c| c.appeared_sent);
                if appeared_sent {
                    self.enqueue(PendingEvent::new(
                        organizer,
                        PendingEventKind::InfoChanged { container },
                    ));
                }
            }
            Some(at) => {
                if matches!(self.pending_events[at].kind, PendingEventKind::Vanished { .. }) {
                    // The organizer is about to learn the fragment is gone;
                    // stale info is pointless.
                    return;
                }
                // Move the queued event to the tail and clear its defer
                // stamp so the new info is delivered in arrival order.
                let mut event = self.pending_events.remove(at);
                event.defer_until = 0;
                self.pending_events.push(event);
            }
        }
    }

    /// A live organized fragment is being removed. Must run before the
    /// container leaves the tree; the final snapshot rides in the event.
    pub fn on_fragment_vanished(
        &mut self,
        tree: &ContainerTree,
        organizer: OrganizerId,
        container: ContainerId,
    ) {
        let appeared_sent = tree.get(container).is_some_and(|c| c.appeared_sent);
        self.pending_events
            .retain(|e| !(e.organizer == organizer && e.container() == Some(container)));
        let Some(state) = self.organizers.get_mut(organizer) else { return };
        state.organized.retain(|c| *c != container);
        state.last_sent_infos.remove(&container);
        state.last_sent_parent_configs.remove(&container);
        // A fragment that appeared and vanished between dispatches cancels
        // out entirely.
        if appeared_sent {
            let info = tree.fragment_info(container);
            self.enqueue(PendingEvent::new(
                organizer,
                PendingEventKind::Vanished { container, info },
            ));
        } else {
            trace!(?organizer, "fragment vanished before appearing; events cancelled");
        }
    }

    /// The host task of an organized fragment changed its configuration.
    pub fn on_fragment_parent_info_changed(
        &mut self,
        organizer: OrganizerId,
        container: ContainerId,
    ) {
        if !self.organizers.contains_key(organizer) {
            return;
        }
        // Any queued lifecycle event already carries fresh parent info.
        if self.last_pending_lifecycle_event(organizer, container).is_some() {
            return;
        }
        self.enqueue(PendingEvent::new(
            organizer,
            PendingEventKind::ParentInfoChanged { container },
        ));
    }

    /// Queues an error event. The caller dispatches immediately afterwards;
    /// errors never wait for the host task to become visible.
    pub fn on_fragment_error(
        &mut self,
        organizer: OrganizerId,
        error_token: Option<ErrorToken>,
        container: Option<ContainerId>,
        op: Option<OpKind>,
        error: OpError,
    ) {
        if !self.organizers.contains_key(organizer) {
            return;
        }
        warn!(?organizer, ?op, %error, "task fragment operation failed");
        self.enqueue(PendingEvent::new(
            organizer,
            PendingEventKind::Error { error_token, container, op, error },
        ));
    }

    /// An activity moved from an organized fragment into a plain task.
    pub fn on_activity_reparented(&mut self, organizer: OrganizerId, activity: ContainerId) {
        if !self.organizers.contains_key(organizer) {
            return;
        }
        self.enqueue(PendingEvent::new(
            organizer,
            PendingEventKind::ActivityReparented { activity },
        ));
    }

    pub fn has_pending_events(&self) -> bool { !self.pending_events.is_empty() }

    #[cfg(test)]
    pub(crate) fn pending_events(&self) -> &[PendingEvent] { &self.pending_events }

    /// Resolves a temporary activity token, consuming it. Expired tokens
    /// are swept on every lookup.
    pub fn take_temp_token(
        &mut self,
        organizer: OrganizerId,
        token: TempToken,
    ) -> Option<ContainerId> {
        let state = self.organizers.get_mut(organizer)?;
        let now = Instant::now();
        state.temp_tokens.retain(|_, entry| entry.expires_at > now);
        state.temp_tokens.remove(&token).map(|entry| entry.activity)
    }

    fn issue_temp_token(&mut self, organizer: OrganizerId, activity: ContainerId) -> TempToken {
        let token = TempToken(self.next_temp_token);
        self.next_temp_token += 1;
        let timeout = self.token_timeout;
        if let Some(state) = self.organizers.get_mut(organizer) {
            let now = Instant::now();
            state.temp_tokens.retain(|_, entry| entry.expires_at > now);
            state
                .temp_tokens
                .insert(token, TempTokenEntry { activity, expires_at: now + timeout });
        }
        token
    }

    /// Should an event be delivered even though the host task is invisible?
    /// Errors always; info-changed when the last running activity finished,
    /// so the organizer can clean the fragment up.
    fn should_send_when_invisible(&self, tree: &ContainerTree, event: &PendingEvent) -> bool {
        if event.is_error() {
            return true;
        }
        let PendingEventKind::InfoChanged { container } = &event.kind else {
            return false;
        };
        let Some(state) = self.organizers.get(event.organizer) else { return false };
        let had_running = state
            .last_sent_infos
            .get(container)
            .is_some_and(|info| !info.is_empty);
        had_running && !tree.has_running_activity(*container)
    }

    /// Splits the queue into dispatchable events (returned, in order) and
    /// deferred ones (kept, with refreshed defer stamps).
    fn collect_ready_events(&mut self, tree: &ContainerTree) -> Vec<PendingEvent> {
        let mut ready = Vec::new();
        let mut kept = Vec::new();
        let events = std::mem::take(&mut self.pending_events);
        for mut event in events {
            let task = event
                .container()
                .filter(|c| tree.contains(*c))
                .and_then(|c| tree.task_of(c));
            let candidate = match task.and_then(|t| tree.get(t)) {
                None => true,
                Some(task_node) => {
                    task_node.last_active_time > event.defer_until
                        && (task_node.visible || self.should_send_when_invisible(tree, &event))
                }
            };
            if candidate {
                ready.push(event);
            } else {
                if let Some(task_node) = task.and_then(|t| tree.get(t)) {
                    event.defer_until = task_node.last_active_time;
                }
                kept.push(event);
            }
        }
        self.pending_events = kept;
        ready
    }

    fn parent_info(&self, tree: &ContainerTree, fragment: ContainerId) -> Option<ParentInfo> {
        let task = tree.task_of(fragment).filter(|t| *t != fragment)?;
        let node = tree.get(task)?;
        Some(ParentInfo { task: node.token, configuration: node.config, visible: node.visible })
    }

    /// Turns a pending event into the change to put on the wire, or `None`
    /// when the event turned out to be a no-op for the organizer.
    fn prepare_change(
        &mut self,
        tree: &mut ContainerTree,
        event: &PendingEvent,
    ) -> Option<ClientChange> {
        match &event.kind {
            PendingEventKind::Appeared { container } => {
                let parent = self.parent_info(tree, *container)?;
                let info = tree.fragment_info(*container);
                tree.get_mut(*container)?.appeared_sent = true;
                let state = self.organizers.get_mut(event.organizer)?;
                state.last_sent_infos.insert(*container, info.clone());
                state.last_sent_parent_configs.insert(*container, parent.configuration);
                Some(ClientChange::Appeared { info, parent })
            }
            PendingEventKind::Vanished { info, .. } => {
                Some(ClientChange::Vanished { info: info.clone() })
            }
            PendingEventKind::InfoChanged { container } => {
                if !tree.contains(*container) {
                    return None;
                }
                let info = tree.fragment_info(*container);
                let state = self.organizers.get_mut(event.organizer)?;
                let unchanged = state.last_sent_infos.get(container).is_some_and(|last| {
                    last.equals_for_organizer(&info)
                        && configurations_equal_for_organizer(&info.config, Some(&last.config))
                });
                if unchanged {
                    return None;
                }
                state.last_sent_infos.insert(*container, info.clone());
                Some(ClientChange::InfoChanged { info })
            }
            PendingEventKind::ParentInfoChanged { container } => {
                let parent = self.parent_info(tree, *container)?;
                let fragment_token = tree.get(*container)?.client_token;
                let state = self.organizers.get_mut(event.organizer)?;
                let unchanged = configurations_equal_for_organizer(
                    &parent.configuration,
                    state.last_sent_parent_configs.get(container),
                );
                if unchanged {
                    return None;
                }
                state
                    .last_sent_parent_configs
                    .insert(*container, parent.configuration);
                Some(ClientChange::ParentInfoChanged { fragment_token, parent })
            }
            PendingEventKind::Error { error_token, op, error, .. } => Some(ClientChange::Error {
                error_token: *error_token,
                op: *op,
                message: error.to_string(),
            }),
            PendingEventKind::ActivityReparented { activity } => {
                let (activity_pid, activity_token) = {
                    let node = tree.get(*activity)?;
                    (node.pid, node.token)
                };
                let task = tree.task_of(*activity)?;
                let task_token = tree.token_of(task)?;
                let organizer_pid = self.organizers.get(event.organizer)?.pid;
                let activity_ref = if activity_pid == organizer_pid {
                    ActivityRef::Token(activity_token)
                } else {
                    ActivityRef::Temporary(self.issue_temp_token(event.organizer, *activity))
                };
                Some(ClientChange::ActivityReparentedToTask {
                    task: task_token,
                    activity: activity_ref,
                })
            }
        }
    }

    /// Immediately flushes the queued info-changed event for one fragment,
    /// skipping the visibility defer. No-op when nothing is queued for it.
    pub fn dispatch_pending_info_changed_event(
        &mut self,
        tree: &mut ContainerTree,
        container: ContainerId,
    ) -> bool {
        let Some(at) = self.pending_events.iter().position(|e| {
            matches!(e.kind, PendingEventKind::InfoChanged { container: c } if c == container)
        }) else {
            return false;
        };
        let event = self.pending_events.remove(at);
        let Some(change) = self.prepare_change(tree, &event) else { return false };
        let Some(state) = self.organizers.get(event.organizer) else { return false };
        let endpoint = Arc::clone(&state.endpoint);
        let batch = OrganizerTransaction { changes: vec![change] };
        match endpoint.on_transaction_ready(batch) {
            Ok(()) => true,
            Err(err) => {
                warn!(organizer = ?event.organizer, %err, "failed to deliver info-changed event");
                false
            }
        }
    }

    /// Delivers everything dispatchable, one batch per organizer, grouped in
    /// first-event order. Returns how many batches went out.
    pub fn dispatch_pending_events(&mut self, tree: &mut ContainerTree) -> usize {
        let ready = self.collect_ready_events(tree);
        if ready.is_empty() {
            return 0;
        }
        let mut order: Vec<OrganizerId> = Vec::new();
        let mut batches: FxHashMap<OrganizerId, OrganizerTransaction> = FxHashMap::default();
        for event in &ready {
            if let Some(change) = self.prepare_change(tree, event) {
                if !batches.contains_key(&event.organizer) {
                    order.push(event.organizer);
                }
                batches.entry(event.organizer).or_default().changes.push(change);
            }
        }
        let mut delivered = 0;
        for organizer in order {
            let Some(batch) = batches.remove(&organizer) else { continue };
            if batch.is_empty() {
                continue;
            }
            let Some(state) = self.organizers.get(organizer) else { continue };
            let endpoint = Arc::clone(&state.endpoint);
            trace!(?organizer, changes = batch.changes.len(), "dispatching organizer transaction");
            match endpoint.on_transaction_ready(batch) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(?organizer, %err, "failed to deliver organizer transaction"),
            }
        }
        delivered
    }
}
