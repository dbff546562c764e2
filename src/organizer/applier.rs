use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::MutexGuard;
use tracing::{debug, info, trace, warn};

use crate::engine::sync::SyncId;
use crate::engine::transition::TransitionToken;
use crate::model::configuration::{
    CONTROLLABLE_CONFIGS, CONTROLLABLE_WINDOW_CONFIGS, ConfigMask, Rect, WindowConfigMask,
};
use crate::model::container::{ContainerId, ContainerKind, Position};
use crate::model::surface::SurfaceTransaction;
use crate::organizer::error::{OpError, OrganizerError};
use crate::organizer::events::ErrorToken;
use crate::organizer::registry::OrganizerId;
use crate::organizer::transaction::{
    ActivityHandle, Change, FragmentCreationParams, FragmentOperation, HierarchyOp, OpKind,
    WindowContainerTransaction,
};
use crate::organizer::{CallerInfo, WindowOrganizerService, WmCore};

bitflags! {
    /// What follow-up work a transaction requires once its changes and
    /// operations have been applied.
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    pub(crate) struct TransactionEffects: u32 {
        /// Some container's configuration changed; its clients need to hear
        /// about it.
        const CLIENT_CONFIG = 1 << 0;
        /// Structure or visibility changed; run the visibility pass.
        const LIFECYCLE = 1 << 1;
    }
}

/// Organized fragments in the subtree under `id`, including `id` itself.
fn organized_fragments_under(
    core: &WmCore,
    id: ContainerId,
) -> Vec<(ContainerId, OrganizerId)> {
    let mut stack = vec![id];
    let mut out = Vec::new();
    while let Some(cur) = stack.pop() {
        if let Some(node) = core.tree.get(cur) {
            if let Some(org) = node.organizer.filter(|_| node.is_organized_fragment()) {
                out.push((cur, org));
            }
            stack.extend(node.children.iter().copied());
        }
    }
    out
}

impl WindowOrganizerService {
    /// Applies one transaction under the hierarchy lock: permission check,
    /// configuration changes, hierarchy operations, surface re-queues, then
    /// the accumulated effects.
    pub(crate) fn apply_transaction_locked(
        &self,
        guard: &mut MutexGuard<'_, WmCore>,
        transaction: &WindowContainerTransaction,
        sync_id: Option<SyncId>,
        transition: Option<TransitionToken>,
        caller: &CallerInfo,
        finish_transition: Option<TransitionToken>,
    ) -> Result<(), OrganizerError> {
        if let Some(organizer) = transaction.organizer() {
            self.enforce_fragment_permissions(guard, transaction, organizer)?;
        }
        trace!(
            changes = transaction.changes().len(),
            ops = transaction.hierarchy_ops().len(),
            "applying window container transaction"
        );

        let mut effects = TransactionEffects::empty();
        let mut config_changed = Vec::new();
        for (token, change) in transaction.changes() {
            let core: &mut WmCore = &mut *guard;
            let Some(id) = core.tree.resolve(*token) else {
                warn!(?token, "configuration change for unknown container");
                continue;
            };
            let (change_effects, changed) = self.apply_container_change(
                core,
                id,
                change,
                transaction.organizer(),
                transaction.error_token(),
            );
            effects |= change_effects;
            if changed {
                config_changed.push(id);
            }
        }

        for op in transaction.hierarchy_ops() {
            effects |= self.apply_hierarchy_op(
                guard,
                op,
                transaction,
                sync_id,
                transition,
                caller,
                finish_transition,
            )?;
        }

        // Surface geometry rides along with the sync set so it lands
        // atomically with everything else.
        for (token, change) in transaction.changes() {
            let Some(bounds) = change.bounds_change_surface else { continue };
            let core: &mut WmCore = &mut *guard;
            let Some(id) = core.tree.resolve(*token) else { continue };
            let Some(node) = core.tree.get(id) else { continue };
            if node.is_task() && !node.created_by_organizer && node.organizer.is_none() {
                return Err(OrganizerError::NotOrganized);
            }
            let container_token = node.token;
            let mut tx = SurfaceTransaction::new();
            tx.set_position(container_token, bounds.left, bounds.top);
            tx.set_crop(container_token, bounds.width(), bounds.height());
            core.surfaces.push(id, tx);
            if let Some(sync_id) = sync_id {
                core.sync.add_to_sync_set(sync_id, id);
            }
        }

        // Config changes fan out to organizers watching the containers.
        {
            let core: &mut WmCore = &mut *guard;
            for id in &config_changed {
                let Some(node) = core.tree.get(*id) else { continue };
                let is_task = node.is_task();
                let fragment_org = node.organizer.filter(|_| node.is_organized_fragment());
                if let Some(org) = fragment_org {
                    core.registry.on_fragment_info_changed(&core.tree, org, *id);
                }
                if is_task {
                    for (fragment, org) in organized_fragments_under(core, *id) {
                        core.registry.on_fragment_parent_info_changed(org, fragment);
                    }
                }
            }
        }

        if effects.contains(TransactionEffects::LIFECYCLE) {
            self.ensure_visibility_locked(guard);
        }
        Ok(())
    }

    /// Validates a transaction applied on behalf of a task fragment
    /// organizer: every touched container must be one of its fragments, and
    /// untrusted embeddings may not grow past the host task.
    fn enforce_fragment_permissions(
        &self,
        core: &WmCore,
        transaction: &WindowContainerTransaction,
        organizer: OrganizerId,
    ) -> Result<(), OrganizerError> {
        let denied = |reason: &str| {
            Err(OrganizerError::FragmentPermissionDenied(reason.to_string()))
        };
        let state = core.registry.state(organizer).ok_or(OrganizerError::NotRegistered)?;

        for (token, change) in transaction.changes() {
            let Some(id) = core.tree.resolve(*token) else {
                return denied("configuration change on an unknown container");
            };
            let Some(node) = core.tree.get(id) else {
                return denied("configuration change on an unknown container");
            };
            if !node.is_organized_fragment() || node.organizer != Some(organizer) {
                return denied("configuration change on a container organized by someone else");
            }
            if change.has_non_config_changes() {
                return denied("non-configuration change from a task fragment organizer");
            }
            let trusted = node.uid == state.uid;
            if trusted {
                continue;
            }
            if change.window_mask.contains(WindowConfigMask::BOUNDS) {
                let requested = change.configuration.window.bounds;
                if !requested.is_empty() {
                    let task_bounds = core
                        .tree
                        .task_of(id)
                        .map(|t| core.tree.effective_bounds(t))
                        .unwrap_or_default();
                    if !task_bounds.contains(&requested) {
                        return denied("untrusted embedding bounds exceed the host task");
                    }
                }
            }
            if change.config_mask.contains(ConfigMask::SCREEN_SIZE) {
                let task_config = core
                    .tree
                    .task_of(id)
                    .and_then(|t| core.tree.get(t))
                    .map(|t| t.config)
                    .unwrap_or_default();
                if change.configuration.screen_width_dp > task_config.screen_width_dp
                    || change.configuration.screen_height_dp > task_config.screen_height_dp
                {
                    return denied("untrusted embedding screen size exceeds the host task");
                }
            }
        }

        for op in transaction.hierarchy_ops() {
            let kind = op.kind();
            if !kind.allowed_for_fragment_organizer() {
                return Err(OrganizerError::FragmentPermissionDenied(format!(
                    "hierarchy operation {kind} not allowed from an organizer"
                )));
            }
            match op {
                HierarchyOp::CreateTaskFragment { params } => {
                    if params.organizer != organizer {
                        return denied("fragment creation for a different organizer");
                    }
                }
                HierarchyOp::DeleteTaskFragment { fragment }
                | HierarchyOp::StartActivityInFragment { fragment, .. }
                | HierarchyOp::ReparentActivityToFragment { fragment, .. }
                | HierarchyOp::RequestFocusOnFragment { fragment }
                | HierarchyOp::SetFragmentOperation { fragment, .. } => {
                    self.check_fragment_ownership(core, *fragment, organizer)?;
                }
                HierarchyOp::SetAdjacentFragments { fragment, adjacent, .. } => {
                    self.check_fragment_ownership(core, *fragment, organizer)?;
                    if let Some(adjacent) = adjacent {
                        self.check_fragment_ownership(core, *adjacent, organizer)?;
                    }
                }
                HierarchyOp::SetCompanionFragment { fragment, companion } => {
                    self.check_fragment_ownership(core, *fragment, organizer)?;
                    if let Some(companion) = companion {
                        self.check_fragment_ownership(core, *companion, organizer)?;
                    }
                }
                HierarchyOp::FinishActivity { activity } => {
                    let owned = core
                        .tree
                        .resolve(*activity)
                        .and_then(|id| core.tree.get(id))
                        .is_some_and(|node| node.uid == state.uid);
                    if !owned {
                        return denied("finish on an activity of a different app");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Live fragment tokens must belong to the calling organizer. Tokens
    /// with no live fragment pass; they may be created later in the same
    /// transaction and get validated then.
    fn check_fragment_ownership(
        &self,
        core: &WmCore,
        fragment: crate::model::container::FragmentToken,
        organizer: OrganizerId,
    ) -> Result<(), OrganizerError> {
        let Some(id) = core.fragments.get(&fragment) else { return Ok(()) };
        let owned = core.tree.get(*id).is_some_and(|node| node.organizer == Some(organizer));
        if owned {
            Ok(())
        } else {
            Err(OrganizerError::FragmentPermissionDenied(
                "fragment is organized by someone else".to_string(),
            ))
        }
    }

    /// Applies one configuration change. Returns the effects plus whether
    /// the resolved configuration actually changed.
    fn apply_container_change(
        &self,
        core: &mut WmCore,
        id: ContainerId,
        change: &Change,
        organizer: Option<OrganizerId>,
        error_token: Option<ErrorToken>,
    ) -> (TransactionEffects, bool) {
        let mut effects = TransactionEffects::empty();
        let mut config_mask = change.config_mask;
        let mut window_mask = change.window_mask;
        if organizer.is_some() {
            // Organizers only control a subset of the configuration.
            config_mask &= CONTROLLABLE_CONFIGS;
            window_mask &= CONTROLLABLE_WINDOW_CONFIGS;
        }

        let Some(node) = core.tree.get(id) else { return (effects, false) };
        let is_task = node.is_task();
        let is_organized_fragment = node.is_organized_fragment();
        let node_organizer = node.organizer;

        let mut adjusted = change.configuration;
        if window_mask.contains(WindowConfigMask::WINDOWING_MODE) {
            let requested = adjusted.window.windowing_mode;
            if requested.is_pinned() && is_task {
                // Entering picture-in-picture goes through its own pipeline.
                info!(?id, "ignoring pinned windowing mode request");
                window_mask -= WindowConfigMask::WINDOWING_MODE;
            } else if requested.in_multi_window() && is_task && self.policy.is_in_lock_task_mode()
            {
                warn!(?id, "ignoring multi-window request during lock task mode");
                window_mask -= WindowConfigMask::WINDOWING_MODE;
            }
        }

        if is_organized_fragment
            && window_mask.contains(WindowConfigMask::BOUNDS)
            && !adjusted.window.bounds.is_empty()
        {
            let (min_width, min_height) = core.tree.min_dimensions(id);
            let bounds = adjusted.window.bounds;
            if bounds.width() < min_width || bounds.height() < min_height {
                // Report and fall back to fill-parent rather than squeezing
                // activities below their minimums.
                self.report_op_error(
                    core,
                    organizer.or(node_organizer),
                    error_token,
                    Some(id),
                    None,
                    OpError::MinDimensionViolation {
                        width: bounds.width(),
                        height: bounds.height(),
                        min_width,
                        min_height,
                    },
                );
                adjusted.window.bounds = Rect::default();
            }
        }

        let Some(node) = core.tree.get_mut(id) else { return (effects, false) };
        let old = node.config;
        node.config.set_to(&adjusted, config_mask, window_mask);
        let changed = node.config != old;
        if changed {
            effects |= TransactionEffects::CLIENT_CONFIG;
            if old.window.windowing_mode != node.config.window.windowing_mode {
                effects |= TransactionEffects::LIFECYCLE;
            }
            if is_organized_fragment && old.window.bounds != node.config.window.bounds {
                effects |= TransactionEffects::LIFECYCLE;
            }
        }
        if let Some(focusable) = change.focusable {
            if node.focusable != focusable {
                node.focusable = focusable;
                effects |= TransactionEffects::LIFECYCLE;
            }
        }
        if let Some(hidden) = change.hidden {
            if node.force_hidden != hidden {
                node.force_hidden = hidden;
                effects |= TransactionEffects::LIFECYCLE;
            }
        }
        (effects, changed)
    }

    fn report_op_error(
        &self,
        core: &mut WmCore,
        organizer: Option<OrganizerId>,
        error_token: Option<ErrorToken>,
        container: Option<ContainerId>,
        op: Option<OpKind>,
        error: OpError,
    ) {
        match organizer {
            Some(organizer) => {
                core.registry.on_fragment_error(organizer, error_token, container, op, error)
            }
            None => warn!(?op, %error, "operation failed with no organizer to notify"),
        }
    }

    fn collect_locked(
        &self,
        core: &mut WmCore,
        transition: Option<TransitionToken>,
        sync_id: Option<SyncId>,
        id: ContainerId,
        existence_change: bool,
    ) {
        if let Some(token) = transition {
            let result = if existence_change {
                core.transitions.collect_existence_change(token, id, &mut core.sync)
            } else {
                core.transitions.collect(token, id, &mut core.sync)
            };
            if let Err(err) = result {
                trace!(?token, %err, "container not collected");
            }
        } else if let Some(sync_id) = sync_id {
            core.sync.add_to_sync_set(sync_id, id);
        }
    }

    /// Tears down a whole subtree: organized fragments beneath it vanish
    /// (events included), surface state is dropped, focus is cleared if it
    /// pointed inside.
    pub(crate) fn remove_subtree_locked(
        &self,
        guard: &mut MutexGuard<'_, WmCore>,
        id: ContainerId,
        transition: Option<TransitionToken>,
        sync_id: Option<SyncId>,
    ) {
        let core: &mut WmCore = &mut *guard;
        self.collect_locked(core, transition, sync_id, id, true);
        for (fragment, organizer) in organized_fragments_under(core, id) {
            core.registry.on_fragment_vanished(&core.tree, organizer, fragment);
            let client_token = core.tree.get(fragment).and_then(|n| n.client_token);
            if let Some(token) = client_token {
                core.fragments.remove(&token);
            }
        }
        if let Some(focused) = core.focused_activity {
            if focused == id || core.tree.is_descendant_of(focused, id) {
                core.focused_activity = None;
            }
        }
        for (removed, _) in core.tree.remove_subtree(id) {
            core.surfaces.discard(removed);
        }
    }

    /// Recomputes visibility, fans out info-changed for fragments whose
    /// visibility flipped, and resumes focus on the top running activity.
    pub(crate) fn ensure_visibility_locked(&self, guard: &mut MutexGuard<'_, WmCore>) {
        let core: &mut WmCore = &mut *guard;
        for id in core.tree.update_visibility() {
            let organizer = core
                .tree
                .get(id)
                .and_then(|node| node.organizer.filter(|_| node.is_organized_fragment()));
            if let Some(organizer) = organizer {
                core.registry.on_fragment_info_changed(&core.tree, organizer, id);
            }
        }
        let focus_valid = core.focused_activity.is_some_and(|focused| {
            core.tree
                .get(focused)
                .is_some_and(|node| node.visible && node.focusable && !node.finishing)
        });
        if !focus_valid {
            core.focused_activity = core
                .tree
                .top_running_activity(core.tree.root())
                .filter(|a| core.tree.get(*a).is_some_and(|n| n.visible && n.focusable));
        }
    }

    /// Notifies the nearest organized fragment enclosing `id`, if any.
    pub(crate) fn note_fragment_subtree_changed(
        &self,
        guard: &mut MutexGuard<'_, WmCore>,
        id: ContainerId,
    ) {
        let core: &mut WmCore = &mut *guard;
        let fragment = std::iter::once(id)
            .chain(core.tree.ancestors(id))
            .find_map(|c| {
                let node = core.tree.get(c)?;
                node.organizer.filter(|_| node.is_organized_fragment()).map(|org| (c, org))
            });
        if let Some((fragment, organizer)) = fragment {
            core.registry.on_fragment_info_changed(&core.tree, organizer, fragment);
        }
    }

    /// Applies one hierarchy operation. Only security violations and
    /// missing task permissions abort the transaction; everything else is
    /// either skipped with a warning or reported as an error event.
    fn apply_hierarchy_op(
        &self,
        guard: &mut MutexGuard<'_, WmCore>,
        op: &HierarchyOp,
        transaction: &WindowContainerTransaction,
        sync_id: Option<SyncId>,
        transition: Option<TransitionToken>,
        caller: &CallerInfo,
        finish_transition: Option<TransitionToken>,
    ) -> Result<TransactionEffects, OrganizerError> {
        let kind = op.kind();
        let in_lock_task = self.policy.is_in_lock_task_mode();
        if in_lock_task && kind.blocked_in_lock_task() {
            warn!(op = %kind, "skipping hierarchy operation during lock task mode");
            return Ok(TransactionEffects::empty());
        }
        let organizer = transaction.organizer();
        let error_token = transaction.error_token();
        let none = TransactionEffects::empty();
        let lifecycle = TransactionEffects::LIFECYCLE;

        match op {
            HierarchyOp::Reorder { container, to_top } => {
                let core: &mut WmCore = &mut *guard;
                let Some(id) = core.tree.resolve(*container) else {
                    warn!(op = %kind, "unknown container");
                    return Ok(none);
                };
                let Some(parent) = core.tree.parent_of(id) else {
                    warn!(op = %kind, "cannot reorder a container without a parent");
                    return Ok(none);
                };
                let uid = core.tree.get(id).map(|n| n.uid).unwrap_or_default();
                if in_lock_task && self.policy.is_lock_task_violation(uid) {
                    warn!(op = %kind, uid, "reorder would violate lock task mode");
                    return Ok(none);
                }
                self.collect_locked(core, transition, sync_id, id, false);
                let position = if *to_top { Position::Top } else { Position::Bottom };
                core.tree.position_child(parent, id, position);
                Ok(lifecycle)
            }

            HierarchyOp::Reparent { container, new_parent, to_top } => {
                let core: &mut WmCore = &mut *guard;
                let Some(id) = core.tree.resolve(*container) else {
                    warn!(op = %kind, "unknown container");
                    return Ok(none);
                };
                let parent = match new_parent {
                    Some(token) => core.tree.resolve(*token),
                    // Without an explicit parent the container goes back to
                    // its display area.
                    None => core.tree.display_area_of(id),
                };
                let Some(parent) = parent else {
                    warn!(op = %kind, "unknown reparent target");
                    return Ok(none);
                };
                if parent == id || core.tree.is_descendant_of(parent, id) {
                    warn!(op = %kind, "reparent would create a cycle");
                    return Ok(none);
                }
                if !core.tree.is_attached(parent) {
                    warn!(op = %kind, "reparent target is not attached");
                    return Ok(none);
                }
                let old_parent = core.tree.parent_of(id);
                if let Some(old_parent) = old_parent {
                    self.collect_locked(core, transition, sync_id, old_parent, false);
                }
                self.collect_locked(core, transition, sync_id, id, false);
                self.collect_locked(core, transition, sync_id, parent, false);
                let position = if *to_top { Position::Top } else { Position::Bottom };
                core.tree.reparent(id, parent, position);
                // An activity leaving an organized fragment for a plain task
                // is reported so the organizer can drop its embedding state.
                if core.tree.get(id).is_some_and(|n| n.is_activity()) {
                    let old_org = old_parent.and_then(|p| {
                        core.tree
                            .get(p)
                            .and_then(|n| n.organizer.filter(|_| n.is_organized_fragment()))
                    });
                    let still_embedded = std::iter::once(id)
                        .chain(core.tree.ancestors(id))
                        .any(|a| core.tree.get(a).is_some_and(|n| n.is_organized_fragment()));
                    if let (Some(old_org), false) = (old_org, still_embedded) {
                        core.registry.on_activity_reparented(old_org, id);
                        if let Some(old_parent) = old_parent {
                            core.registry.on_fragment_info_changed(&core.tree, old_org, old_parent);
                        }
                    }
                }
                Ok(lifecycle)
            }

            HierarchyOp::ChildrenTasksReparent {
                old_parent,
                new_parent,
                windowing_modes,
                to_top,
                top_only,
            } => {
                let core: &mut WmCore = &mut *guard;
                let source = match old_parent {
                    Some(token) => core.tree.resolve(*token),
                    None => Some(core.tree.root()),
                };
                let Some(source) = source else {
                    warn!(op = %kind, "unknown source container");
                    return Ok(none);
                };
                let target = match new_parent {
                    Some(token) => core.tree.resolve(*token),
                    None => core.tree.display_area_of(source),
                };
                let Some(target) = target else {
                    warn!(op = %kind, "unknown target container");
                    return Ok(none);
                };
                let mut candidates: Vec<ContainerId> = core
                    .tree
                    .children(source)
                    .iter()
                    .copied()
                    .filter(|child| *child != target)
                    .filter(|child| {
                        core.tree.get(*child).is_some_and(|node| {
                            node.is_task()
                                && windowing_modes
                                    .as_ref()
                                    .is_none_or(|modes| modes.contains(&node.windowing_mode()))
                        })
                    })
                    .collect();
                if *top_only {
                    candidates = candidates.split_off(candidates.len().saturating_sub(1));
                }
                let position = if *to_top { Position::Top } else { Position::Bottom };
                for task in candidates {
                    let uid = core.tree.get(task).map(|n| n.uid).unwrap_or_default();
                    if self.policy.is_lock_task_violation(uid) {
                        warn!(op = %kind, uid, "skipping task reparent during lock task mode");
                        continue;
                    }
                    self.collect_locked(core, transition, sync_id, task, false);
                    core.tree.reparent(task, target, position);
                }
                Ok(lifecycle)
            }

            HierarchyOp::SetLaunchRoot { container } => {
                let core: &mut WmCore = &mut *guard;
                let Some(id) = core.tree.resolve(*container) else {
                    warn!(op = %kind, "unknown container");
                    return Ok(none);
                };
                let eligible = core
                    .tree
                    .get(id)
                    .is_some_and(|n| n.is_task() && n.created_by_organizer);
                if !eligible {
                    warn!(op = %kind, "launch root must be an organizer-created task");
                    return Ok(none);
                }
                if let Some(area) = core.tree.display_area_of(id) {
                    if let Some(node) = core.tree.get_mut(area) {
                        node.launch_root = Some(id);
                    }
                }
                Ok(none)
            }

            HierarchyOp::SetLaunchAdjacentFlagRoot { container, clear } => {
                let core: &mut WmCore = &mut *guard;
                let Some(id) = core.tree.resolve(*container) else {
                    warn!(op = %kind, "unknown container");
                    return Ok(none);
                };
                let eligible = core.tree.get(id).is_some_and(|n| {
                    n.is_task() && n.created_by_organizer && n.adjacent.is_some()
                });
                if !eligible {
                    warn!(op = %kind, "adjacent-flag root must be an organizer task with an adjacent partner");
                    return Ok(none);
                }
                if let Some(area) = core.tree.display_area_of(id) {
                    if let Some(node) = core.tree.get_mut(area) {
                        node.launch_adjacent_root = if *clear { None } else { Some(id) };
                    }
                }
                Ok(none)
            }

            HierarchyOp::SetAdjacentRoots { root, adjacent_root } => {
                let core: &mut WmCore = &mut *guard;
                let (Some(a), Some(b)) =
                    (core.tree.resolve(*root), core.tree.resolve(*adjacent_root))
                else {
                    warn!(op = %kind, "unknown container");
                    return Ok(none);
                };
                let both_roots = [a, b].iter().all(|id| {
                    core.tree.get(*id).is_some_and(|n| n.is_task() && n.created_by_organizer)
                });
                if !both_roots {
                    warn!(op = %kind, "adjacent roots must be organizer-created tasks");
                    return Ok(none);
                }
                if let Some(node) = core.tree.get_mut(a) {
                    node.adjacent = Some(b);
                }
                if let Some(node) = core.tree.get_mut(b) {
                    node.adjacent = Some(a);
                }
                Ok(lifecycle)
            }

            HierarchyOp::LaunchTask { task, options } => {
                if !caller.can_start_tasks {
                    return Err(OrganizerError::PermissionDenied);
                }
                let Some(id) = guard.tree.resolve(*task) else {
                    warn!(op = %kind, "unknown task");
                    return Ok(none);
                };
                let launcher = Arc::clone(&self.launcher);
                let options = options.clone();
                let result = self
                    .starter
                    .post_and_wait(guard, Box::new(move || launcher.start_task(options.as_ref())));
                if !result.is_success() {
                    warn!(op = %kind, %result, "task launch failed");
                    return Ok(none);
                }
                // The lock was released while the start ran; revalidate.
                let core: &mut WmCore = &mut *guard;
                if !core.tree.contains(id) {
                    return Ok(none);
                }
                if let Some(parent) = core.tree.parent_of(id) {
                    self.collect_locked(core, transition, sync_id, id, false);
                    core.tree.position_child(parent, id, Position::Top);
                }
                Ok(lifecycle)
            }

            HierarchyOp::RemoveTask { task } => {
                let is_task = {
                    let core: &mut WmCore = &mut *guard;
                    core.tree
                        .resolve(*task)
                        .filter(|id| core.tree.get(*id).is_some_and(|n| n.is_task()))
                };
                let Some(id) = is_task else {
                    warn!(op = %kind, "unknown or non-task container");
                    return Ok(none);
                };
                self.remove_subtree_locked(guard, id, transition, sync_id);
                Ok(lifecycle)
            }

            HierarchyOp::SetAlwaysOnTop { container, always_on_top } => {
                let core: &mut WmCore = &mut *guard;
                let Some(id) = core.tree.resolve(*container) else {
                    warn!(op = %kind, "unknown container");
                    return Ok(none);
                };
                let eligible = core.tree.get(id).is_some_and(|n| {
                    n.is_task() || n.kind == ContainerKind::DisplayArea
                });
                if !eligible {
                    warn!(op = %kind, "always-on-top only applies to tasks and display areas");
                    return Ok(none);
                }
                if let Some(node) = core.tree.get_mut(id) {
                    node.config.window.always_on_top = *always_on_top;
                }
                Ok(lifecycle)
            }

            HierarchyOp::SetReparentLeafTaskIfRelaunch { container, reparent } => {
                let core: &mut WmCore = &mut *guard;
                let Some(id) = core.tree.resolve(*container) else {
                    warn!(op = %kind, "unknown container");
                    return Ok(none);
                };
                let eligible = core
                    .tree
                    .get(id)
                    .is_some_and(|n| n.is_task() && n.created_by_organizer);
                if !eligible {
                    warn!(op = %kind, "only organizer-created root tasks can set relaunch reparenting");
                    return Ok(none);
                }
                if let Some(node) = core.tree.get_mut(id) {
                    node.reparent_leaf_task_if_relaunch = *reparent;
                }
                Ok(none)
            }

            HierarchyOp::RestoreTransientOrder { container } => {
                let Some(finish) = finish_transition else {
                    warn!(op = %kind, "restore-transient-order outside finishTransition");
                    return Ok(none);
                };
                let core: &mut WmCore = &mut *guard;
                let Some(id) = core.tree.resolve(*container) else {
                    warn!(op = %kind, "unknown container");
                    return Ok(none);
                };
                let Some(task) = core.tree.task_of(id) else { return Ok(none) };
                let restore_below = core
                    .transitions
                    .get(finish)
                    .and_then(|t| t.transient_restore_target(task));
                let Some(below) = restore_below else { return Ok(none) };
                if core.tree.contains(below) {
                    debug!(op = %kind, "restoring transient task order");
                    core.tree.position_below(task, below);
                }
                Ok(lifecycle)
            }

            HierarchyOp::AddInsetsProvider { receiver, owner, types, frame } => {
                let core: &mut WmCore = &mut *guard;
                let (Some(receiver_id), Some(owner_id)) =
                    (core.tree.resolve(*receiver), core.tree.resolve(*owner))
                else {
                    warn!(op = %kind, "unknown container");
                    return Ok(none);
                };
                if let Some(node) = core.tree.get_mut(receiver_id) {
                    node.insets_providers
                        .retain(|p| !(p.owner == owner_id && p.types == *types));
                    node.insets_providers.push(crate::model::container::InsetsProvider {
                        owner: owner_id,
                        types: *types,
                        frame: *frame,
                    });
                }
                Ok(none)
            }

            HierarchyOp::RemoveInsetsProvider { receiver, owner, types } => {
                let core: &mut WmCore = &mut *guard;
                let (Some(receiver_id), Some(owner_id)) =
                    (core.tree.resolve(*receiver), core.tree.resolve(*owner))
                else {
                    warn!(op = %kind, "unknown container");
                    return Ok(none);
                };
                if let Some(node) = core.tree.get_mut(receiver_id) {
                    node.insets_providers
                        .retain(|p| !(p.owner == owner_id && p.types == *types));
                }
                Ok(none)
            }

            HierarchyOp::PendingIntent { intent, options: _ } => {
                let launcher = Arc::clone(&self.launcher);
                let intent = intent.clone();
                let result = self
                    .starter
                    .post_and_wait(guard, Box::new(move || launcher.send_intent(&intent)));
                if !result.is_success() {
                    warn!(op = %kind, %result, "pending intent failed");
                }
                Ok(none)
            }

            HierarchyOp::StartShortcut { shortcut } => {
                let launcher = Arc::clone(&self.launcher);
                let shortcut = shortcut.clone();
                let result = self
                    .starter
                    .post_and_wait(guard, Box::new(move || launcher.start_shortcut(&shortcut)));
                if result.is_success() { Ok(lifecycle) } else {
                    warn!(op = %kind, %result, "shortcut start failed");
                    Ok(none)
                }
            }

            HierarchyOp::CreateTaskFragment { params } => {
                let core: &mut WmCore = &mut *guard;
                Ok(self.create_task_fragment_locked(core, params, error_token, transition, sync_id))
            }

            HierarchyOp::DeleteTaskFragment { fragment } => {
                let resolved = {
                    let core: &mut WmCore = &mut *guard;
                    match core.fragments.get(fragment).copied() {
                        Some(id) if core.tree.contains(id) => Some(id),
                        _ => {
                            self.report_op_error(
                                core,
                                organizer,
                                error_token,
                                None,
                                Some(kind),
                                OpError::UnknownFragment,
                            );
                            None
                        }
                    }
                };
                let Some(id) = resolved else { return Ok(none) };
                {
                    let core: &mut WmCore = &mut *guard;
                    if !core.tree.is_attached(id) {
                        self.report_op_error(
                            core,
                            organizer,
                            error_token,
                            Some(id),
                            Some(kind),
                            OpError::Detached,
                        );
                        core.fragments.remove(fragment);
                        let _ = core.tree.remove_subtree(id);
                        return Ok(none);
                    }
                    if in_lock_task {
                        let blocked = core
                            .tree
                            .bottom_running_activity(id)
                            .and_then(|a| core.tree.get(a))
                            .is_some_and(|n| self.policy.is_activity_finish_blocked(n.uid));
                        if blocked {
                            self.report_op_error(
                                core,
                                organizer,
                                error_token,
                                Some(id),
                                Some(kind),
                                OpError::BlockedByLockTask,
                            );
                            return Ok(none);
                        }
                    }
                }
                self.remove_subtree_locked(guard, id, transition, sync_id);
                Ok(lifecycle)
            }

            HierarchyOp::StartActivityInFragment { fragment, caller_activity, intent } => {
                let prepared = {
                    let core: &mut WmCore = &mut *guard;
                    let Some(id) = core
                        .fragments
                        .get(fragment)
                        .copied()
                        .filter(|id| core.tree.contains(*id))
                    else {
                        self.report_op_error(
                            core,
                            organizer,
                            error_token,
                            None,
                            Some(kind),
                            OpError::UnknownFragment,
                        );
                        return Ok(none);
                    };
                    let pinned = core
                        .tree
                        .task_of(id)
                        .and_then(|t| core.tree.get(t))
                        .is_some_and(|n| n.windowing_mode().is_pinned());
                    if pinned {
                        self.report_op_error(
                            core,
                            organizer,
                            error_token,
                            Some(id),
                            Some(kind),
                            OpError::PinnedTask,
                        );
                        return Ok(none);
                    }
                    let owner_uid = core
                        .tree
                        .resolve(*caller_activity)
                        .and_then(|a| core.tree.get(a))
                        .map(|n| n.uid)
                        .unwrap_or(caller.uid);
                    (id, owner_uid)
                };
                let (id, owner_uid) = prepared;
                let launcher = Arc::clone(&self.launcher);
                let intent = intent.clone();
                let result = self
                    .starter
                    .post_and_wait(guard, Box::new(move || launcher.start_activity(&intent)));
                let core: &mut WmCore = &mut *guard;
                if !result.is_success() {
                    self.report_op_error(
                        core,
                        organizer,
                        error_token,
                        Some(id),
                        Some(kind),
                        OpError::StartFailed(result.to_string()),
                    );
                    return Ok(none);
                }
                // The fragment may have been deleted while the start ran.
                if !core.tree.contains(id) {
                    self.report_op_error(
                        core,
                        organizer,
                        error_token,
                        None,
                        Some(kind),
                        OpError::UnknownFragment,
                    );
                    return Ok(none);
                }
                let activity = core.tree.create(ContainerKind::Activity);
                if let Some(node) = core.tree.get_mut(activity) {
                    node.uid = owner_uid;
                    node.pid = caller.pid;
                }
                core.tree.attach(activity, id, Position::Top);
                self.collect_locked(core, transition, sync_id, activity, true);
                if let Some(org) = organizer {
                    core.registry.on_fragment_info_changed(&core.tree, org, id);
                }
                Ok(lifecycle)
            }

            HierarchyOp::ReparentActivityToFragment { fragment, activity } => {
                let core: &mut WmCore = &mut *guard;
                let Some(org) = organizer else {
                    warn!(op = %kind, "reparent to fragment requires an organizer");
                    return Ok(none);
                };
                let Some(target) = core
                    .fragments
                    .get(fragment)
                    .copied()
                    .filter(|id| core.tree.contains(*id))
                else {
                    self.report_op_error(
                        core,
                        organizer,
                        error_token,
                        None,
                        Some(kind),
                        OpError::UnknownFragment,
                    );
                    return Ok(none);
                };
                let resolved = match activity {
                    ActivityHandle::Token(token) => core.tree.resolve(*token),
                    ActivityHandle::Temporary(token) => {
                        core.registry.take_temp_token(org, *token)
                    }
                };
                let Some(moving) = resolved.filter(|id| core.tree.contains(*id)) else {
                    self.report_op_error(
                        core,
                        organizer,
                        error_token,
                        Some(target),
                        Some(kind),
                        OpError::InvalidActivityToken,
                    );
                    return Ok(none);
                };
                if core.tree.task_of(moving) != core.tree.task_of(target) {
                    self.report_op_error(
                        core,
                        organizer,
                        error_token,
                        Some(target),
                        Some(kind),
                        OpError::ActivityOutsideTask,
                    );
                    return Ok(none);
                }
                let activity_uid = core.tree.get(moving).map(|n| n.uid).unwrap_or_default();
                let fragment_uid = core.tree.get(target).map(|n| n.uid).unwrap_or_default();
                let organizer_uid =
                    core.registry.state(org).map(|s| s.uid).unwrap_or_default();
                if activity_uid != organizer_uid && activity_uid != fragment_uid {
                    self.report_op_error(
                        core,
                        organizer,
                        error_token,
                        Some(target),
                        Some(kind),
                        OpError::EmbeddingNotAllowed,
                    );
                    return Ok(none);
                }
                let old_parent = core.tree.parent_of(moving);
                self.collect_locked(core, transition, sync_id, moving, false);
                self.collect_locked(core, transition, sync_id, target, false);
                core.tree.reparent(moving, target, Position::Top);
                if let Some(old_parent) = old_parent {
                    let old_org = core.tree.get(old_parent).and_then(|n| {
                        n.organizer.filter(|_| n.is_organized_fragment())
                    });
                    if let Some(old_org) = old_org {
                        core.registry.on_fragment_info_changed(&core.tree, old_org, old_parent);
                    }
                }
                core.registry.on_fragment_info_changed(&core.tree, org, target);
                Ok(lifecycle)
            }

            HierarchyOp::SetAdjacentFragments { fragment, adjacent, params } => {
                let core: &mut WmCore = &mut *guard;
                let Some(primary) = core
                    .fragments
                    .get(fragment)
                    .copied()
                    .filter(|id| core.tree.contains(*id))
                else {
                    self.report_op_error(
                        core,
                        organizer,
                        error_token,
                        None,
                        Some(kind),
                        OpError::UnknownFragment,
                    );
                    return Ok(none);
                };
                let secondary = match adjacent {
                    Some(token) => {
                        let Some(id) = core
                            .fragments
                            .get(token)
                            .copied()
                            .filter(|id| core.tree.contains(*id))
                        else {
                            self.report_op_error(
                                core,
                                organizer,
                                error_token,
                                Some(primary),
                                Some(kind),
                                OpError::UnknownFragment,
                            );
                            return Ok(none);
                        };
                        Some(id)
                    }
                    None => None,
                };
                // Clear the previous pairing before linking the new one.
                let previous = core.tree.get(primary).and_then(|n| n.adjacent);
                if let Some(previous) = previous {
                    if let Some(node) = core.tree.get_mut(previous) {
                        node.adjacent = None;
                    }
                }
                if let Some(node) = core.tree.get_mut(primary) {
                    node.adjacent = secondary;
                    node.delay_last_activity_removal =
                        params.delay_primary_last_activity_removal;
                }
                if let Some(secondary) = secondary {
                    if let Some(node) = core.tree.get_mut(secondary) {
                        node.adjacent = Some(primary);
                        node.delay_last_activity_removal =
                            params.delay_secondary_last_activity_removal;
                    }
                }
                Ok(lifecycle)
            }

            HierarchyOp::RequestFocusOnFragment { fragment } => {
                let core: &mut WmCore = &mut *guard;
                let Some(id) = core
                    .fragments
                    .get(fragment)
                    .copied()
                    .filter(|id| core.tree.contains(*id))
                else {
                    self.report_op_error(
                        core,
                        organizer,
                        error_token,
                        None,
                        Some(kind),
                        OpError::UnknownFragment,
                    );
                    return Ok(none);
                };
                let Some(top) = core.tree.top_running_activity(id) else {
                    trace!(op = %kind, "fragment has no running activity to focus");
                    return Ok(none);
                };
                // Only steal focus within the same task.
                let same_task = core
                    .focused_activity
                    .is_none_or(|focused| core.tree.task_of(focused) == core.tree.task_of(id));
                if same_task {
                    core.focused_activity = Some(top);
                } else {
                    trace!(op = %kind, "focused task differs; leaving focus unchanged");
                }
                Ok(none)
            }

            HierarchyOp::FinishActivity { activity } => {
                let core: &mut WmCore = &mut *guard;
                let Some(id) = core.tree.resolve(*activity) else {
                    warn!(op = %kind, "unknown activity");
                    return Ok(none);
                };
                let already_finishing =
                    core.tree.get(id).is_none_or(|n| !n.is_activity() || n.finishing);
                if already_finishing {
                    return Ok(none);
                }
                if let Some(node) = core.tree.get_mut(id) {
                    node.finishing = true;
                }
                self.collect_locked(core, transition, sync_id, id, true);
                let fragment = core.tree.ancestors(id).find_map(|a| {
                    let node = core.tree.get(a)?;
                    node.organizer.filter(|_| node.is_organized_fragment()).map(|org| (a, org))
                });
                if let Some((fragment, org)) = fragment {
                    core.registry.on_fragment_info_changed(&core.tree, org, fragment);
                }
                Ok(lifecycle)
            }

            HierarchyOp::SetCompanionFragment { fragment, companion } => {
                let core: &mut WmCore = &mut *guard;
                let Some(id) = core
                    .fragments
                    .get(fragment)
                    .copied()
                    .filter(|id| core.tree.contains(*id))
                else {
                    self.report_op_error(
                        core,
                        organizer,
                        error_token,
                        None,
                        Some(kind),
                        OpError::UnknownFragment,
                    );
                    return Ok(none);
                };
                let companion_id = match companion {
                    Some(token) => {
                        let Some(cid) = core
                            .fragments
                            .get(token)
                            .copied()
                            .filter(|id| core.tree.contains(*id))
                        else {
                            self.report_op_error(
                                core,
                                organizer,
                                error_token,
                                Some(id),
                                Some(kind),
                                OpError::UnknownFragment,
                            );
                            return Ok(none);
                        };
                        Some(cid)
                    }
                    None => None,
                };
                if let Some(node) = core.tree.get_mut(id) {
                    node.companion = companion_id;
                }
                Ok(none)
            }

            HierarchyOp::SetFragmentOperation { fragment, operation } => {
                let core: &mut WmCore = &mut *guard;
                let Some(id) = core
                    .fragments
                    .get(fragment)
                    .copied()
                    .filter(|id| core.tree.contains(*id))
                else {
                    self.report_op_error(
                        core,
                        organizer,
                        error_token,
                        None,
                        Some(kind),
                        OpError::UnknownFragment,
                    );
                    return Ok(none);
                };
                match operation {
                    FragmentOperation::SetAnimationParams(params) => {
                        if let Some(node) = core.tree.get_mut(id) {
                            node.animation_params = *params;
                        }
                    }
                }
                Ok(none)
            }
        }
    }

    /// Creates an organized task fragment in the owner activity's task.
    fn create_task_fragment_locked(
        &self,
        core: &mut WmCore,
        params: &FragmentCreationParams,
        error_token: Option<ErrorToken>,
        transition: Option<TransitionToken>,
        sync_id: Option<SyncId>,
    ) -> TransactionEffects {
        let organizer = params.organizer;
        let kind = OpKind::CreateTaskFragment;
        if !core.registry.is_registered(organizer) {
            warn!("fragment creation for an unregistered organizer");
            return TransactionEffects::empty();
        }
        let report = |service: &Self, core: &mut WmCore, error: OpError| {
            service.report_op_error(core, Some(organizer), error_token, None, Some(kind), error);
            TransactionEffects::empty()
        };
        if core.fragments.contains_key(&params.fragment_token) {
            return report(self, core, OpError::DuplicateFragmentToken);
        }
        let owner = core.tree.resolve(params.owner_activity).filter(|id| {
            core.tree.is_attached(*id)
                && core.tree.get(*id).is_some_and(|n| n.is_activity() && !n.finishing)
        });
        let Some(owner) = owner else {
            return report(self, core, OpError::InvalidOwner);
        };
        let (owner_uid, owner_resizeable) = {
            let node = core.tree.get(owner).expect("owner resolved above");
            (node.uid, node.resizeable)
        };
        let organizer_uid = core.registry.state(organizer).map(|s| s.uid).unwrap_or_default();
        if owner_uid != organizer_uid {
            return report(self, core, OpError::OwnerUidMismatch);
        }
        if !owner_resizeable {
            return report(self, core, OpError::OwnerNotResizeable);
        }
        let Some(task) = core.tree.task_of(owner) else {
            return report(self, core, OpError::InvalidOwner);
        };

        let fragment = core.tree.create(ContainerKind::TaskFragment);
        if let Some(node) = core.tree.get_mut(fragment) {
            node.organizer = Some(organizer);
            node.client_token = Some(params.fragment_token);
            node.created_by_organizer = true;
            node.uid = owner_uid;
            node.config.window.bounds = params.initial_bounds;
            node.config.window.windowing_mode = params.windowing_mode;
        }

        // Paired placement: directly above the named fragment or activity,
        // otherwise on top of the task.
        let paired_index = params
            .paired_primary
            .and_then(|token| core.fragments.get(&token).copied())
            .or_else(|| params.paired_activity.and_then(|token| core.tree.resolve(token)))
            .filter(|paired| core.tree.parent_of(*paired) == Some(task))
            .and_then(|paired| core.tree.children(task).iter().position(|c| *c == paired))
            .map(|at| at + 1);
        match paired_index {
            Some(index) => core.tree.attach_at(fragment, task, index),
            None => core.tree.attach(fragment, task, Position::Top),
        }

        core.fragments.insert(params.fragment_token, fragment);
        self.collect_locked(core, transition, sync_id, fragment, true);
        core.registry.on_fragment_appeared(organizer, fragment);
        debug!(?fragment, token = ?params.fragment_token, "task fragment created");
        TransactionEffects::LIFECYCLE
    }
}
