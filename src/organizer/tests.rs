use std::sync::Arc;
use std::sync::atomic::Ordering;

use pretty_assertions::assert_eq;
use test_log::test;

use super::testing::{APP_PID, APP_UID, Harness, RecordingCallback};
use super::{CallerInfo, TransactionCallback};
use crate::engine::transition::TransitionKind;
use crate::model::configuration::Rect;
use crate::model::container::FragmentToken;
use crate::model::surface::SurfaceCommand;
use crate::organizer::error::OrganizerError;
use crate::organizer::events::{ActivityRef, ClientChange, ErrorToken};
use crate::organizer::launcher::StartResult;
use crate::organizer::registry::RemoteAnimationDefinition;
use crate::organizer::transaction::{
    ActivityHandle, FragmentCreationParams, HierarchyOp, Intent, OpKind,
    WindowContainerTransaction,
};

#[test]
fn apply_requires_manage_permission() {
    let h = Harness::new();
    let mut t = WindowContainerTransaction::new();
    t.set_bounds(h.task, Rect::new(0, 0, 100, 100));
    assert_eq!(
        h.service.apply_transaction(&t, &h.app_caller()),
        Err(OrganizerError::PermissionDenied)
    );
}

#[test]
fn fragment_appears_with_parent_info() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);

    let batches = endpoint.take();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].changes.len(), 1);
    match &batches[0].changes[0] {
        ClientChange::Appeared { info, parent } => {
            assert_eq!(info.fragment_token, Some(token));
            assert!(info.is_empty);
            assert_eq!(parent.task, h.task);
            assert!(parent.visible);
        }
        other => panic!("expected appeared, got {other:?}"),
    }
    assert!(h.service.fragment_container(token).is_some());
}

#[test]
fn appeared_then_vanished_before_dispatch_cancel_out() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    h.hide_task();
    let token = h.create_fragment(organizer, 1);
    assert!(endpoint.take().is_empty());

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer).add_op(HierarchyOp::DeleteTaskFragment { fragment: token });
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Close, false, &h.app_caller())
        .unwrap();

    h.show_task();
    h.service.dispatch_pending_events();
    assert!(endpoint.take().is_empty());
    assert!(h.service.fragment_container(token).is_none());
}

#[test]
fn info_changes_coalesce_while_task_is_hidden() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();
    endpoint.take();

    h.hide_task();
    h.service.create_activity(fragment, APP_UID, APP_PID).unwrap();
    h.service.create_activity(fragment, APP_UID, APP_PID).unwrap();
    h.service.with_core(|core| {
        assert_eq!(core.registry.pending_events().len(), 1);
    });
    assert!(endpoint.take().is_empty());

    h.show_task();
    let batches = endpoint.take();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].changes.len(), 1);
    match &batches[0].changes[0] {
        ClientChange::InfoChanged { info } => {
            assert_eq!(info.running_activity_count, 2);
            assert!(info.is_visible);
        }
        other => panic!("expected info changed, got {other:?}"),
    }
}

#[test]
fn targeted_flush_bypasses_the_visibility_defer() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();
    endpoint.take();

    h.hide_task();
    h.service.create_activity(fragment, APP_UID, APP_PID).unwrap();
    assert!(endpoint.take().is_empty());

    assert!(h.service.dispatch_pending_info_changed_event(fragment));
    let batches = endpoint.take();
    assert_eq!(batches.len(), 1);
    match &batches[0].changes[0] {
        ClientChange::InfoChanged { info } => assert_eq!(info.running_activity_count, 1),
        other => panic!("expected info changed, got {other:?}"),
    }

    // Nothing left queued for the fragment.
    assert!(!h.service.dispatch_pending_info_changed_event(fragment));
}

#[test]
fn vanished_drops_queued_info_changed_and_keeps_final_snapshot() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();
    h.service.create_activity(fragment, APP_UID, APP_PID).unwrap();
    endpoint.take();

    h.hide_task();
    h.service.create_activity(fragment, APP_UID, APP_PID).unwrap();

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer).add_op(HierarchyOp::DeleteTaskFragment { fragment: token });
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Close, false, &h.app_caller())
        .unwrap();

    // The fragment is gone from the tree, so the vanished event is not
    // gated on task visibility.
    let batches = endpoint.take();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].changes.len(), 1);
    match &batches[0].changes[0] {
        ClientChange::Vanished { info } => {
            assert_eq!(info.fragment_token, Some(token));
            assert_eq!(info.running_activity_count, 2);
        }
        other => panic!("expected vanished, got {other:?}"),
    }
    h.service.with_core(|core| assert!(!core.registry.has_pending_events()));
}

#[test]
fn errors_are_delivered_even_when_the_task_is_hidden() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    h.hide_task();

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer)
        .set_error_token(ErrorToken(9))
        .add_op(HierarchyOp::DeleteTaskFragment { fragment: FragmentToken(404) });
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Close, false, &h.app_caller())
        .unwrap();

    let batches = endpoint.take();
    assert_eq!(batches.len(), 1);
    match &batches[0].changes[0] {
        ClientChange::Error { error_token, op, .. } => {
            assert_eq!(*error_token, Some(ErrorToken(9)));
            assert_eq!(*op, Some(OpKind::DeleteTaskFragment));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn last_activity_finishing_is_reported_despite_hidden_task() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();
    let activity = h.service.create_activity(fragment, APP_UID, APP_PID).unwrap();
    endpoint.take();

    h.hide_task();
    assert!(endpoint.take().is_empty());

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer).add_op(HierarchyOp::FinishActivity { activity });
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Close, false, &h.app_caller())
        .unwrap();

    // The organizer needs to know its fragment emptied out so it can clean
    // up, visible or not.
    let batches = endpoint.take();
    assert_eq!(batches.len(), 1);
    match &batches[0].changes[0] {
        ClientChange::InfoChanged { info } => assert!(info.is_empty),
        other => panic!("expected info changed, got {other:?}"),
    }
}

#[test]
fn min_dimension_violation_reports_and_resets_bounds() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();
    let activity = h.service.create_activity(fragment, APP_UID, APP_PID).unwrap();
    h.service.set_activity_min_dimensions(activity, 200, 200).unwrap();
    endpoint.take();

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer)
        .set_error_token(ErrorToken(1))
        .set_bounds(fragment, Rect::new(0, 0, 100, 100));
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Change, false, &h.app_caller())
        .unwrap();

    let batches = endpoint.take();
    assert!(batches.iter().any(|b| {
        b.changes.iter().any(|c| matches!(
            c,
            ClientChange::Error { error_token: Some(ErrorToken(1)), .. }
        ))
    }));
    h.service.with_core(|core| {
        let id = core.tree.resolve(fragment).unwrap();
        assert_eq!(core.tree.get(id).unwrap().config.window.bounds, Rect::default());
    });
}

#[test]
fn untrusted_embedding_cannot_grow_past_the_task() {
    let h = Harness::new();
    let (organizer, _endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();
    h.service.with_core(|core| {
        let id = core.tree.resolve(fragment).unwrap();
        core.tree.get_mut(id).unwrap().uid = 99_999;
    });

    let mut bounds = WindowContainerTransaction::new();
    bounds.set_bounds(h.task, Rect::new(0, 0, 500, 500));
    h.service.apply_transaction(&bounds, &CallerInfo::privileged()).unwrap();

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer).set_bounds(fragment, Rect::new(0, 0, 600, 600));
    let err = h
        .service
        .apply_fragment_transaction(&t, TransitionKind::Change, false, &h.app_caller())
        .unwrap_err();
    assert!(matches!(err, OrganizerError::FragmentPermissionDenied(_)));
}

#[test]
fn organizer_is_held_to_the_operation_allow_list() {
    let h = Harness::new();
    let (organizer, _endpoint) = h.register_organizer();
    h.create_fragment(organizer, 1);

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer)
        .add_op(HierarchyOp::Reorder { container: h.task, to_top: true });
    let err = h
        .service
        .apply_fragment_transaction(&t, TransitionKind::Change, false, &h.app_caller())
        .unwrap_err();
    assert!(matches!(err, OrganizerError::FragmentPermissionDenied(_)));
}

#[test]
fn failed_fragment_transaction_releases_the_sync_engine() {
    let h = Harness::new();
    let (organizer, _endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();

    // A forbidden op fails the whole transaction; the transition it opened
    // must not keep the engine claimed.
    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer)
        .add_op(HierarchyOp::Reorder { container: h.task, to_top: true });
    let err = h
        .service
        .apply_fragment_transaction(&t, TransitionKind::Change, false, &h.app_caller())
        .unwrap_err();
    assert!(matches!(err, OrganizerError::FragmentPermissionDenied(_)));
    h.service.with_core(|core| assert!(!core.sync.has_active_sync()));

    // Follow-up sync work completes instead of queueing forever.
    let callback = RecordingCallback::new();
    let mut t = WindowContainerTransaction::new();
    t.set_bounds_change_surface(fragment, Rect::new(10, 20, 110, 220));
    let sync_id = h
        .service
        .apply_sync_transaction(
            &t,
            &CallerInfo::privileged(),
            Arc::clone(&callback) as Arc<dyn TransactionCallback>,
        )
        .unwrap();
    let completed = callback.completed.lock();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].0, sync_id);
}

#[test]
fn failed_transition_transaction_aborts_and_frees_the_engine() {
    let h = Harness::new();

    // Surface bounds on a plain task with no organizer are rejected.
    let mut t = WindowContainerTransaction::new();
    t.set_bounds_change_surface(h.task, Rect::new(0, 0, 50, 50));
    let err = h
        .service
        .start_new_transition(TransitionKind::Change, Some(&t), &CallerInfo::privileged())
        .unwrap_err();
    assert_eq!(err, OrganizerError::NotOrganized);
    h.service.with_core(|core| {
        assert!(!core.sync.has_active_sync());
        assert_eq!(core.transitions.collecting(), None);
    });

    // The next transition collects normally.
    let transition = h
        .service
        .start_new_transition(TransitionKind::Open, None, &CallerInfo::privileged())
        .unwrap();
    h.service.start_transition(transition, None, &CallerInfo::privileged()).unwrap();
    assert_eq!(h.player.ready.lock().len(), 1);
}

#[test]
fn rejected_finish_callback_does_not_hold_the_engine() {
    let h = Harness::new();
    let transition = h
        .service
        .start_new_transition(TransitionKind::Open, None, &CallerInfo::privileged())
        .unwrap();
    h.service.start_transition(transition, None, &CallerInfo::privileged()).unwrap();
    h.service
        .finish_transition(transition, None, None, &CallerInfo::privileged())
        .unwrap();

    // Finishing again opens a callback sync that has to be unwound when the
    // finish itself is rejected.
    let callback = RecordingCallback::new();
    let err = h
        .service
        .finish_transition(
            transition,
            None,
            Some(Arc::clone(&callback) as Arc<dyn TransactionCallback>),
            &CallerInfo::privileged(),
        )
        .unwrap_err();
    assert!(matches!(err, OrganizerError::Transition(_)));
    assert!(callback.completed.lock().is_empty());
    h.service.with_core(|core| assert!(!core.sync.has_active_sync()));
}

#[test]
fn organizer_cannot_make_non_config_changes() {
    let h = Harness::new();
    let (organizer, _endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer).set_hidden(fragment, true);
    let err = h
        .service
        .apply_fragment_transaction(&t, TransitionKind::Change, false, &h.app_caller())
        .unwrap_err();
    assert!(matches!(err, OrganizerError::FragmentPermissionDenied(_)));
}

#[test]
fn remote_animations_are_registered_per_task() {
    let h = Harness::new();
    let (organizer, _endpoint) = h.register_organizer();
    let other_task = h.service.create_task(h.display_area, APP_UID).unwrap();
    let definition = RemoteAnimationDefinition { label: "slide".into(), duration_ms: 300 };

    h.service.register_remote_animations(organizer, h.task, definition.clone()).unwrap();
    assert_eq!(
        h.service.register_remote_animations(organizer, h.task, definition.clone()),
        Err(OrganizerError::AnimationsAlreadyRegistered)
    );
    // A different task registers independently.
    h.service.register_remote_animations(organizer, other_task, definition.clone()).unwrap();

    h.service.unregister_remote_animations(organizer, h.task).unwrap();
    assert_eq!(h.service.remote_animations(organizer, h.task), None);
    assert_eq!(h.service.remote_animations(organizer, other_task), Some(definition));
}

#[test]
fn children_tasks_reparent_preserves_stacking_order() {
    let h = Harness::new();
    let source = h.service.create_display_area();
    let target = h.service.create_display_area();
    let c1 = h.service.create_task(source, APP_UID).unwrap();
    let c2 = h.service.create_task(source, APP_UID).unwrap();
    let c3 = h.service.create_task(source, APP_UID).unwrap();

    let mut t = WindowContainerTransaction::new();
    t.add_op(HierarchyOp::ChildrenTasksReparent {
        old_parent: Some(source),
        new_parent: Some(target),
        windowing_modes: None,
        to_top: true,
        top_only: false,
    });
    h.service.apply_transaction(&t, &CallerInfo::privileged()).unwrap();

    h.service.with_core(|core| {
        let target_id = core.tree.resolve(target).unwrap();
        let children: Vec<_> = core
            .tree
            .children(target_id)
            .iter()
            .filter_map(|c| core.tree.token_of(*c))
            .collect();
        // Bottom-to-top order is unchanged by the move: c3 stays topmost.
        assert_eq!(children, vec![c1, c2, c3]);
        let source_id = core.tree.resolve(source).unwrap();
        assert!(core.tree.children(source_id).is_empty());
    });
}

#[test]
fn queued_sync_runs_after_the_collecting_transition_seals() {
    let h = Harness::new();
    let (organizer, _endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();
    assert_eq!(h.player.ready.lock().len(), 1);

    let transition = h
        .service
        .start_new_transition(TransitionKind::Open, None, &CallerInfo::privileged())
        .unwrap();

    let callback = RecordingCallback::new();
    let mut t = WindowContainerTransaction::new();
    t.set_bounds_change_surface(fragment, Rect::new(10, 20, 110, 220));
    let sync_id = h
        .service
        .apply_sync_transaction(
            &t,
            &CallerInfo::privileged(),
            Arc::clone(&callback) as Arc<dyn TransactionCallback>,
        )
        .unwrap();
    assert!(callback.completed.lock().is_empty());

    h.service.start_transition(transition, None, &CallerInfo::privileged()).unwrap();

    assert_eq!(h.player.ready.lock().len(), 2);
    let completed = callback.completed.lock();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].0, sync_id);
    assert_eq!(
        completed[0].1.commands(),
        &[
            SurfaceCommand::SetPosition { container: fragment, x: 10, y: 20 },
            SurfaceCommand::SetCrop { container: fragment, width: 100, height: 200 },
        ]
    );
}

#[test]
fn queued_transition_is_aborted_when_its_organizer_dies() {
    let h = Harness::new();
    let (organizer, _endpoint) = h.register_organizer();
    let transition = h
        .service
        .start_new_transition(TransitionKind::Open, None, &CallerInfo::privileged())
        .unwrap();

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer).add_op(HierarchyOp::CreateTaskFragment {
        params: FragmentCreationParams {
            organizer,
            fragment_token: FragmentToken(7),
            owner_activity: h.activity,
            windowing_mode: Default::default(),
            initial_bounds: Rect::default(),
            paired_primary: None,
            paired_activity: None,
        },
    });
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Open, true, &h.app_caller())
        .unwrap();

    h.service.unregister_organizer(organizer).unwrap();
    h.service.start_transition(transition, None, &CallerInfo::privileged()).unwrap();

    assert!(h.service.fragment_container(FragmentToken(7)).is_none());
    h.service.with_core(|core| {
        assert!(!core.sync.has_active_sync());
        assert_eq!(core.sync.queued_len(), 0);
    });
}

#[test]
fn non_independent_fragment_changes_join_the_collecting_transition() {
    let h = Harness::new();
    let (organizer, _endpoint) = h.register_organizer();
    let transition = h
        .service
        .start_new_transition(TransitionKind::Open, None, &CallerInfo::privileged())
        .unwrap();

    // Applied immediately into the open collection rather than queued.
    let token = h.create_fragment(organizer, 1);
    assert!(h.service.fragment_container(token).is_some());

    h.service.start_transition(transition, None, &CallerInfo::privileged()).unwrap();
    let ready = h.player.ready.lock();
    assert_eq!(ready.len(), 1);
    assert!(ready[0].0.existence_changes.contains(&h.service.fragment_container(token).unwrap()));
}

#[test]
fn unreachable_sync_callback_falls_back_to_local_apply() {
    let h = Harness::new();
    let callback = RecordingCallback::new();
    callback.unreachable.store(true, Ordering::SeqCst);

    let mut t = WindowContainerTransaction::new();
    t.set_bounds(h.task, Rect::new(0, 0, 300, 300));
    h.service
        .apply_sync_transaction(
            &t,
            &CallerInfo::privileged(),
            Arc::clone(&callback) as Arc<dyn TransactionCallback>,
        )
        .unwrap();

    assert!(callback.completed.lock().is_empty());
    h.service.with_core(|core| assert!(!core.sync.has_active_sync()));
}

#[test]
fn lock_task_mode_blocks_reparents_and_protected_deletes() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();
    let activity = h.service.create_activity(fragment, APP_UID, APP_PID).unwrap();
    endpoint.take();

    h.policy.enter_lock_task(APP_UID);

    let mut t = WindowContainerTransaction::new();
    t.add_op(HierarchyOp::Reparent {
        container: activity,
        new_parent: Some(h.task),
        to_top: true,
    });
    h.service.apply_transaction(&t, &CallerInfo::privileged()).unwrap();
    h.service.with_core(|core| {
        let id = core.tree.resolve(activity).unwrap();
        assert_eq!(core.tree.parent_of(id), core.tree.resolve(fragment));
    });

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer)
        .set_error_token(ErrorToken(3))
        .add_op(HierarchyOp::DeleteTaskFragment { fragment: token });
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Close, false, &h.app_caller())
        .unwrap();

    let batches = endpoint.take();
    assert!(batches.iter().any(|b| {
        b.changes.iter().any(|c| matches!(
            c,
            ClientChange::Error { op: Some(OpKind::DeleteTaskFragment), .. }
        ))
    }));
    assert!(h.service.fragment_container(token).is_some());
}

#[test]
fn cross_process_reparent_round_trips_through_a_temporary_token() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();
    // Hosted by a process the organizer cannot address directly.
    let activity = h.service.create_activity(fragment, APP_UID, 777).unwrap();
    endpoint.take();

    let mut t = WindowContainerTransaction::new();
    t.add_op(HierarchyOp::Reparent {
        container: activity,
        new_parent: Some(h.task),
        to_top: true,
    });
    h.service.apply_transaction(&t, &CallerInfo::privileged()).unwrap();

    let batches = endpoint.take();
    let temp = batches
        .iter()
        .flat_map(|b| &b.changes)
        .find_map(|c| match c {
            ClientChange::ActivityReparentedToTask {
                task,
                activity: ActivityRef::Temporary(temp),
            } => {
                assert_eq!(*task, h.task);
                Some(*temp)
            }
            _ => None,
        })
        .expect("expected a temporary activity token");

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer).add_op(HierarchyOp::ReparentActivityToFragment {
        fragment: token,
        activity: ActivityHandle::Temporary(temp),
    });
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Change, false, &h.app_caller())
        .unwrap();

    h.service.with_core(|core| {
        let id = core.tree.resolve(activity).unwrap();
        assert_eq!(core.tree.parent_of(id), core.tree.resolve(fragment));
    });
}

#[test]
fn activity_is_embedded_when_its_fragment_is_smaller_than_the_task() {
    let h = Harness::new();
    let (organizer, _endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();
    let activity = h.service.create_activity(fragment, APP_UID, APP_PID).unwrap();

    let mut t = WindowContainerTransaction::new();
    t.set_bounds(h.task, Rect::new(0, 0, 1000, 1000));
    h.service.apply_transaction(&t, &CallerInfo::privileged()).unwrap();

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer).set_bounds(fragment, Rect::new(0, 0, 500, 1000));
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Change, false, &h.app_caller())
        .unwrap();
    assert!(h.service.is_activity_embedded(activity));
    assert!(!h.service.is_activity_embedded(h.activity));

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer).set_bounds(fragment, Rect::new(0, 0, 1000, 1000));
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Change, false, &h.app_caller())
        .unwrap();
    assert!(!h.service.is_activity_embedded(activity));
}

#[test]
fn failed_activity_start_becomes_an_error_event() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    endpoint.take();
    h.launcher.script(StartResult::IntentNotResolved);

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer)
        .set_error_token(ErrorToken(5))
        .add_op(HierarchyOp::StartActivityInFragment {
            fragment: token,
            caller_activity: h.activity,
            intent: Intent::new("android.intent.action.VIEW"),
        });
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Open, false, &h.app_caller())
        .unwrap();

    let batches = endpoint.take();
    assert!(batches.iter().any(|b| {
        b.changes.iter().any(|c| matches!(
            c,
            ClientChange::Error {
                error_token: Some(ErrorToken(5)),
                op: Some(OpKind::StartActivityInFragment),
                ..
            }
        ))
    }));
    let fragment = h.service.fragment_container(token).unwrap();
    h.service.with_core(|core| {
        let id = core.tree.resolve(fragment).unwrap();
        assert!(core.tree.fragment_info(id).is_empty);
    });
}

#[test]
fn successful_activity_start_lands_in_the_fragment() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    endpoint.take();

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer).add_op(HierarchyOp::StartActivityInFragment {
        fragment: token,
        caller_activity: h.activity,
        intent: Intent::new("android.intent.action.MAIN"),
    });
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Open, false, &h.app_caller())
        .unwrap();

    let batches = endpoint.take();
    assert!(batches.iter().any(|b| {
        b.changes.iter().any(|c| matches!(
            c,
            ClientChange::InfoChanged { info } if info.running_activity_count == 1
        ))
    }));
}

#[test]
fn duplicate_fragment_tokens_are_rejected_with_an_error_event() {
    let h = Harness::new();
    let (organizer, endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    endpoint.take();

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer)
        .set_error_token(ErrorToken(2))
        .add_op(HierarchyOp::CreateTaskFragment {
            params: FragmentCreationParams {
                organizer,
                fragment_token: token,
                owner_activity: h.activity,
                windowing_mode: Default::default(),
                initial_bounds: Rect::default(),
                paired_primary: None,
                paired_activity: None,
            },
        });
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Open, false, &h.app_caller())
        .unwrap();

    let batches = endpoint.take();
    assert!(batches.iter().any(|b| {
        b.changes.iter().any(|c| matches!(
            c,
            ClientChange::Error {
                error_token: Some(ErrorToken(2)),
                op: Some(OpKind::CreateTaskFragment),
                ..
            }
        ))
    }));
}

#[test]
fn unregistering_tears_down_organized_fragments() {
    let h = Harness::new();
    let (organizer, _endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    assert!(h.service.fragment_container(token).is_some());

    h.service.unregister_organizer(organizer).unwrap();
    assert!(h.service.fragment_container(token).is_none());
    assert_eq!(
        h.service.unregister_organizer(organizer),
        Err(OrganizerError::NotRegistered)
    );
}

#[test]
fn focus_request_promotes_the_fragment_top_activity() {
    let h = Harness::new();
    let (organizer, _endpoint) = h.register_organizer();
    let token = h.create_fragment(organizer, 1);
    let fragment = h.service.fragment_container(token).unwrap();
    let activity = h.service.create_activity(fragment, APP_UID, APP_PID).unwrap();

    let mut t = WindowContainerTransaction::new();
    t.set_organizer(organizer).add_op(HierarchyOp::RequestFocusOnFragment { fragment: token });
    h.service
        .apply_fragment_transaction(&t, TransitionKind::Change, false, &h.app_caller())
        .unwrap();

    assert_eq!(h.service.focused_activity(), Some(activity));
}
