//! Shared fixtures for service-level tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::common::config::Config;
use crate::engine::sync::SyncId;
use crate::engine::transition::{TransitionInfo, TransitionKind, TransitionPlayer, TransitionToken};
use crate::model::configuration::Rect;
use crate::model::container::{ContainerToken, FragmentToken};
use crate::model::surface::SurfaceTransaction;
use crate::organizer::error::DeliveryError;
use crate::organizer::events::OrganizerTransaction;
use crate::organizer::launcher::{ActivityLauncher, StartResult};
use crate::organizer::registry::{OrganizerEndpoint, OrganizerId};
use crate::organizer::transaction::{
    FragmentCreationParams, HierarchyOp, Intent, ShortcutInfo, WindowContainerTransaction,
};
use crate::organizer::{CallerInfo, TransactionCallback, WindowOrganizerService, WmPolicy};

/// Endpoint that records every delivered batch.
#[derive(Default)]
pub(crate) struct RecordingEndpoint {
    pub received: Mutex<Vec<OrganizerTransaction>>,
}

impl RecordingEndpoint {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn take(&self) -> Vec<OrganizerTransaction> {
        std::mem::take(&mut *self.received.lock())
    }
}

impl OrganizerEndpoint for RecordingEndpoint {
    fn on_transaction_ready(
        &self,
        transaction: OrganizerTransaction,
    ) -> Result<(), DeliveryError> {
        self.received.lock().push(transaction);
        Ok(())
    }
}

/// Callback recording sync completions; can be made unreachable.
#[derive(Default)]
pub(crate) struct RecordingCallback {
    pub completed: Mutex<Vec<(SyncId, SurfaceTransaction)>>,
    pub unreachable: AtomicBool,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }
}

impl TransactionCallback for RecordingCallback {
    fn on_transaction_ready(
        &self,
        sync: SyncId,
        merged: &SurfaceTransaction,
    ) -> Result<(), DeliveryError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DeliveryError("callback owner is gone".into()));
        }
        self.completed.lock().push((sync, merged.clone()));
        Ok(())
    }
}

/// Player recording every sealed transition.
#[derive(Default)]
pub(crate) struct RecordingPlayer {
    pub ready: Mutex<Vec<(TransitionInfo, SurfaceTransaction)>>,
    pub finished: Mutex<Vec<TransitionToken>>,
}

impl TransitionPlayer for RecordingPlayer {
    fn on_transition_ready(&self, info: TransitionInfo, merged: SurfaceTransaction) {
        self.ready.lock().push((info, merged));
    }

    fn on_transition_finished(&self, token: TransitionToken) {
        self.finished.lock().push(token);
    }
}

/// Launcher whose outcome is scripted per test.
pub(crate) struct ScriptedLauncher {
    pub result: Mutex<StartResult>,
}

impl ScriptedLauncher {
    pub fn new() -> Self { ScriptedLauncher { result: Mutex::new(StartResult::Success) } }

    pub fn script(&self, result: StartResult) { *self.result.lock() = result; }
}

impl ActivityLauncher for ScriptedLauncher {
    fn start_activity(&self, _intent: &Intent) -> StartResult { *self.result.lock() }

    fn start_task(&self, _options: Option<&serde_json::Value>) -> StartResult {
        *self.result.lock()
    }

    fn send_intent(&self, _intent: &Intent) -> StartResult { *self.result.lock() }

    fn start_shortcut(&self, _shortcut: &ShortcutInfo) -> StartResult { *self.result.lock() }
}

/// Policy with togglable lock-task state and a blocked-uid list.
#[derive(Default)]
pub(crate) struct TogglePolicy {
    pub lock_task: AtomicBool,
    pub blocked_uids: Mutex<Vec<u32>>,
}

impl TogglePolicy {
    pub fn enter_lock_task(&self, blocked_uid: u32) {
        self.lock_task.store(true, Ordering::SeqCst);
        self.blocked_uids.lock().push(blocked_uid);
    }
}

impl WmPolicy for TogglePolicy {
    fn is_in_lock_task_mode(&self) -> bool { self.lock_task.load(Ordering::SeqCst) }

    fn is_lock_task_violation(&self, uid: u32) -> bool {
        self.is_in_lock_task_mode() && !self.blocked_uids.lock().contains(&uid)
    }

    fn is_activity_finish_blocked(&self, uid: u32) -> bool {
        self.is_in_lock_task_mode() && self.blocked_uids.lock().contains(&uid)
    }
}

pub(crate) const APP_UID: u32 = 10_001;
pub(crate) const APP_PID: u32 = 42;

/// A service with one display area, one task, and one activity, plus handles
/// on every scripted collaborator.
pub(crate) struct Harness {
    pub service: Arc<WindowOrganizerService>,
    pub launcher: Arc<ScriptedLauncher>,
    pub policy: Arc<TogglePolicy>,
    pub player: Arc<RecordingPlayer>,
    pub display_area: ContainerToken,
    pub task: ContainerToken,
    pub activity: ContainerToken,
}

impl Harness {
    pub fn new() -> Self {
        let launcher = Arc::new(ScriptedLauncher::new());
        let policy = Arc::new(TogglePolicy::default());
        let player = Arc::new(RecordingPlayer::default());
        let service = WindowOrganizerService::new(
            &Config::default(),
            Arc::clone(&launcher) as Arc<dyn ActivityLauncher>,
            Arc::clone(&policy) as Arc<dyn WmPolicy>,
            Arc::clone(&player) as Arc<dyn TransitionPlayer>,
        );
        let display_area = service.create_display_area();
        let task = service.create_task(display_area, APP_UID).unwrap();
        let activity = service.create_activity(task, APP_UID, APP_PID).unwrap();
        Harness { service, launcher, policy, player, display_area, task, activity }
    }

    pub fn app_caller(&self) -> CallerInfo { CallerInfo::app(APP_PID, APP_UID) }

    pub fn register_organizer(&self) -> (OrganizerId, Arc<RecordingEndpoint>) {
        let endpoint = RecordingEndpoint::new();
        let id = self
            .service
            .register_organizer(
                Arc::clone(&endpoint) as Arc<dyn OrganizerEndpoint>,
                &self.app_caller(),
            )
            .unwrap();
        (id, endpoint)
    }

    /// Creates an organized fragment in the harness task via a fragment
    /// transaction, as an organizer client would.
    pub fn create_fragment(&self, organizer: OrganizerId, raw_token: u64) -> FragmentToken {
        let token = FragmentToken(raw_token);
        let mut t = WindowContainerTransaction::new();
        t.set_organizer(organizer).add_op(HierarchyOp::CreateTaskFragment {
            params: FragmentCreationParams {
                organizer,
                fragment_token: token,
                owner_activity: self.activity,
                windowing_mode: Default::default(),
                initial_bounds: Rect::default(),
                paired_primary: None,
                paired_activity: None,
            },
        });
        self.service
            .apply_fragment_transaction(&t, TransitionKind::Open, false, &self.app_caller())
            .unwrap();
        token
    }

    /// Force-hides the harness task so queued events stay deferred.
    pub fn hide_task(&self) {
        let mut t = WindowContainerTransaction::new();
        t.set_hidden(self.task, true);
        self.service.apply_transaction(&t, &CallerInfo::privileged()).unwrap();
    }

    pub fn show_task(&self) {
        let mut t = WindowContainerTransaction::new();
        t.set_hidden(self.task, false);
        self.service.apply_transaction(&t, &CallerInfo::privileged()).unwrap();
    }
}
