use serde::{Deserialize, Serialize};
use strum::Display;

use crate::model::configuration::{
    ConfigMask, Configuration, Rect, WindowConfigMask, WindowingMode,
};
use crate::model::container::{AnimationParams, ContainerToken, FragmentToken};
use crate::organizer::events::{ErrorToken, TempToken};
use crate::organizer::registry::OrganizerId;

/// An intent to start or deliver, reduced to what routing needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub action: String,
    pub component: Option<String>,
}

impl Intent {
    pub fn new(action: impl Into<String>) -> Self {
        Intent { action: action.into(), component: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutInfo {
    pub package: String,
    pub shortcut_id: String,
}

/// Reference to an activity from an organizer: either its real container
/// token (same-process) or a temporary token minted for a cross-process
/// reparent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ActivityHandle {
    Token(ContainerToken),
    Temporary(TempToken),
}

/// Parameters for creating an organized task fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentCreationParams {
    pub organizer: OrganizerId,
    /// Client-chosen token; must be unique among live fragments.
    pub fragment_token: FragmentToken,
    /// Activity whose task the fragment is created in.
    pub owner_activity: ContainerToken,
    pub windowing_mode: WindowingMode,
    pub initial_bounds: Rect,
    /// Place the new fragment directly above this fragment instead of on
    /// top of the task.
    pub paired_primary: Option<FragmentToken>,
    /// Place the new fragment directly above this activity.
    pub paired_activity: Option<ContainerToken>,
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct AdjacentFragmentParams {
    pub delay_primary_last_activity_removal: bool,
    pub delay_secondary_last_activity_removal: bool,
}

/// Extra per-fragment operations multiplexed through one op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOperation {
    SetAnimationParams(AnimationParams),
}

/// A structural mutation of the hierarchy. Each variant carries exactly the
/// references its operation needs; fragment-scoped variants use the client's
/// fragment token, everything else uses server container tokens.
#[derive(Debug, Clone, PartialEq)]
pub enum HierarchyOp {
    Reorder { container: ContainerToken, to_top: bool },
    Reparent { container: ContainerToken, new_parent: Option<ContainerToken>, to_top: bool },
    ChildrenTasksReparent {
        old_parent: Option<ContainerToken>,
        new_parent: Option<ContainerToken>,
        windowing_modes: Option<Vec<WindowingMode>>,
        to_top: bool,
        top_only: bool,
    },
    SetLaunchRoot { container: ContainerToken },
    SetLaunchAdjacentFlagRoot { container: ContainerToken, clear: bool },
    SetAdjacentRoots { root: ContainerToken, adjacent_root: ContainerToken },
    LaunchTask { task: ContainerToken, options: Option<serde_json::Value> },
    RemoveTask { task: ContainerToken },
    SetAlwaysOnTop { container: ContainerToken, always_on_top: bool },
    SetReparentLeafTaskIfRelaunch { container: ContainerToken, reparent: bool },
    RestoreTransientOrder { container: ContainerToken },
    AddInsetsProvider { receiver: ContainerToken, owner: ContainerToken, types: u32, frame: Rect },
    RemoveInsetsProvider { receiver: ContainerToken, owner: ContainerToken, types: u32 },
    PendingIntent { intent: Intent, options: Option<serde_json::Value> },
    StartShortcut { shortcut: ShortcutInfo },
    CreateTaskFragment { params: FragmentCreationParams },
    DeleteTaskFragment { fragment: FragmentToken },
    StartActivityInFragment {
        fragment: FragmentToken,
        caller_activity: ContainerToken,
        intent: Intent,
    },
    ReparentActivityToFragment { fragment: FragmentToken, activity: ActivityHandle },
    SetAdjacentFragments {
        fragment: FragmentToken,
        adjacent: Option<FragmentToken>,
        params: AdjacentFragmentParams,
    },
    RequestFocusOnFragment { fragment: FragmentToken },
    FinishActivity { activity: ContainerToken },
    SetCompanionFragment { fragment: FragmentToken, companion: Option<FragmentToken> },
    SetFragmentOperation { fragment: FragmentToken, operation: FragmentOperation },
}

/// Fieldless mirror of [`HierarchyOp`] used in logs, error events, and
/// policy tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum OpKind {
    Reorder,
    Reparent,
    ChildrenTasksReparent,
    SetLaunchRoot,
    SetLaunchAdjacentFlagRoot,
    SetAdjacentRoots,
    LaunchTask,
    RemoveTask,
    SetAlwaysOnTop,
    SetReparentLeafTaskIfRelaunch,
    RestoreTransientOrder,
    AddInsetsProvider,
    RemoveInsetsProvider,
    PendingIntent,
    StartShortcut,
    CreateTaskFragment,
    DeleteTaskFragment,
    StartActivityInFragment,
    ReparentActivityToFragment,
    SetAdjacentFragments,
    RequestFocusOnFragment,
    FinishActivity,
    SetCompanionFragment,
    SetFragmentOperation,
}

impl OpKind {
    /// Operations suppressed wholesale while the device is in lock-task
    /// mode. Reorder and children-reparent are checked per task instead.
    pub fn blocked_in_lock_task(self) -> bool {
        matches!(
            self,
            OpKind::Reparent
                | OpKind::LaunchTask
                | OpKind::PendingIntent
                | OpKind::StartShortcut
                | OpKind::RestoreTransientOrder
                | OpKind::AddInsetsProvider
                | OpKind::RemoveInsetsProvider
                | OpKind::SetAlwaysOnTop
                | OpKind::SetReparentLeafTaskIfRelaunch
        )
    }

    /// Allow-list for transactions applied on behalf of a task fragment
    /// organizer. Anything else is a security violation.
    pub fn allowed_for_fragment_organizer(self) -> bool {
        matches!(
            self,
            OpKind::CreateTaskFragment
                | OpKind::DeleteTaskFragment
                | OpKind::StartActivityInFragment
                | OpKind::ReparentActivityToFragment
                | OpKind::SetAdjacentFragments
                | OpKind::RequestFocusOnFragment
                | OpKind::FinishActivity
                | OpKind::SetCompanionFragment
                | OpKind::SetFragmentOperation
        )
    }
}

impl HierarchyOp {
    pub fn kind(&self) -> OpKind {
        match self {
            HierarchyOp::Reorder { .. } => OpKind::Reorder,
            HierarchyOp::Reparent { .. } => OpKind::Reparent,
            HierarchyOp::ChildrenTasksReparent { .. } => OpKind::ChildrenTasksReparent,
            HierarchyOp::SetLaunchRoot { .. } => OpKind::SetLaunchRoot,
            HierarchyOp::SetLaunchAdjacentFlagRoot { .. } => OpKind::SetLaunchAdjacentFlagRoot,
            HierarchyOp::SetAdjacentRoots { .. } => OpKind::SetAdjacentRoots,
            HierarchyOp::LaunchTask { .. } => OpKind::LaunchTask,
            HierarchyOp::RemoveTask { .. } => OpKind::RemoveTask,
            HierarchyOp::SetAlwaysOnTop { .. } => OpKind::SetAlwaysOnTop,
            HierarchyOp::SetReparentLeafTaskIfRelaunch { .. } => {
                OpKind::SetReparentLeafTaskIfRelaunch
            }
            HierarchyOp::RestoreTransientOrder { .. } => OpKind::RestoreTransientOrder,
            HierarchyOp::AddInsetsProvider { .. } => OpKind::AddInsetsProvider,
            HierarchyOp::RemoveInsetsProvider { .. } => OpKind::RemoveInsetsProvider,
            HierarchyOp::PendingIntent { .. } => OpKind::PendingIntent,
            HierarchyOp::StartShortcut { .. } => OpKind::StartShortcut,
            HierarchyOp::CreateTaskFragment { .. } => OpKind::CreateTaskFragment,
            HierarchyOp::DeleteTaskFragment { .. } => OpKind::DeleteTaskFragment,
            HierarchyOp::StartActivityInFragment { .. } => OpKind::StartActivityInFragment,
            HierarchyOp::ReparentActivityToFragment { .. } => OpKind::ReparentActivityToFragment,
            HierarchyOp::SetAdjacentFragments { .. } => OpKind::SetAdjacentFragments,
            HierarchyOp::RequestFocusOnFragment { .. } => OpKind::RequestFocusOnFragment,
            HierarchyOp::FinishActivity { .. } => OpKind::FinishActivity,
            HierarchyOp::SetCompanionFragment { .. } => OpKind::SetCompanionFragment,
            HierarchyOp::SetFragmentOperation { .. } => OpKind::SetFragmentOperation,
        }
    }
}

/// A configuration change requested for one container. Repeated setters for
/// the same container merge into a single change.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Change {
    pub configuration: Configuration,
    pub config_mask: ConfigMask,
    pub window_mask: WindowConfigMask,
    pub focusable: Option<bool>,
    pub hidden: Option<bool>,
    /// Pending surface geometry to take effect with the next sync.
    pub bounds_change_surface: Option<Rect>,
}

impl Change {
    /// Changes beyond plain configuration. Fragment organizers may not make
    /// these.
    pub fn has_non_config_changes(&self) -> bool {
        self.focusable.is_some() || self.hidden.is_some()
    }
}

/// A batch of configuration changes and hierarchy operations that applies
/// atomically.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct WindowContainerTransaction {
    changes: Vec<(ContainerToken, Change)>,
    hierarchy_ops: Vec<HierarchyOp>,
    error_token: Option<ErrorToken>,
    organizer: Option<OrganizerId>,
}

impl WindowContainerTransaction {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.changes.is_empty() && self.hierarchy_ops.is_empty() }

    pub fn changes(&self) -> &[(ContainerToken, Change)] { &self.changes }

    pub fn hierarchy_ops(&self) -> &[HierarchyOp] { &self.hierarchy_ops }

    pub fn error_token(&self) -> Option<ErrorToken> { self.error_token }

    /// The task fragment organizer this transaction acts for, if any.
    /// Transactions carrying an organizer are held to the fragment
    /// permission policy.
    pub fn organizer(&self) -> Option<OrganizerId> { self.organizer }

    fn change_mut(&mut self, container: ContainerToken) -> &mut Change {
        if let Some(at) = self.changes.iter().position(|(t, _)| *t == container) {
            return &mut self.changes[at].1;
        }
        self.changes.push((container, Change::default()));
        &mut self.changes.last_mut().expect("just pushed").1
    }

    pub fn set_bounds(&mut self, container: ContainerToken, bounds: Rect) -> &mut Self {
        let change = self.change_mut(container);
        change.configuration.window.bounds = bounds;
        change.config_mask |= ConfigMask::WINDOW_CONFIGURATION;
        change.window_mask |= WindowConfigMask::BOUNDS;
        self
    }

    pub fn set_app_bounds(&mut self, container: ContainerToken, bounds: Option<Rect>) -> &mut Self {
        let change = self.change_mut(container);
        change.configuration.window.app_bounds = bounds;
        change.config_mask |= ConfigMask::WINDOW_CONFIGURATION;
        change.window_mask |= WindowConfigMask::APP_BOUNDS;
        self
    }

    pub fn set_windowing_mode(
        &mut self,
        container: ContainerToken,
        mode: WindowingMode,
    ) -> &mut Self {
        let change = self.change_mut(container);
        change.configuration.window.windowing_mode = mode;
        change.config_mask |= ConfigMask::WINDOW_CONFIGURATION;
        change.window_mask |= WindowConfigMask::WINDOWING_MODE;
        self
    }

    pub fn set_screen_size(&mut self, container: ContainerToken, width: i32, height: i32) -> &mut Self {
        let change = self.change_mut(container);
        change.configuration.screen_width_dp = width;
        change.configuration.screen_height_dp = height;
        change.config_mask |= ConfigMask::SCREEN_SIZE;
        self
    }

    pub fn set_smallest_screen_width(&mut self, container: ContainerToken, width: i32) -> &mut Self {
        let change = self.change_mut(container);
        change.configuration.smallest_screen_width_dp = width;
        change.config_mask |= ConfigMask::SMALLEST_SCREEN_SIZE;
        self
    }

    pub fn set_focusable(&mut self, container: ContainerToken, focusable: bool) -> &mut Self {
        self.change_mut(container).focusable = Some(focusable);
        self
    }

    pub fn set_hidden(&mut self, container: ContainerToken, hidden: bool) -> &mut Self {
        self.change_mut(container).hidden = Some(hidden);
        self
    }

    pub fn set_bounds_change_surface(
        &mut self,
        container: ContainerToken,
        bounds: Rect,
    ) -> &mut Self {
        self.change_mut(container).bounds_change_surface = Some(bounds);
        self
    }

    pub fn add_op(&mut self, op: HierarchyOp) -> &mut Self {
        self.hierarchy_ops.push(op);
        self
    }

    pub fn set_error_token(&mut self, token: ErrorToken) -> &mut Self {
        self.error_token = Some(token);
        self
    }

    pub fn set_organizer(&mut self, organizer: OrganizerId) -> &mut Self {
        self.organizer = Some(organizer);
        self
    }
}
