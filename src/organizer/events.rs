use crate::model::configuration::Configuration;
use crate::model::container::{ContainerId, ContainerToken, FragmentInfo, FragmentToken};
use crate::organizer::error::OpError;
use crate::organizer::registry::OrganizerId;
use crate::organizer::transaction::OpKind;

/// Client-minted token correlating an error event with the transaction that
/// caused it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ErrorToken(pub u64);

/// Server-minted short-lived token standing in for an activity that lives in
/// another process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TempToken(pub u64);

/// What a pending event will tell the organizer once dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingEventKind {
    Appeared { container: ContainerId },
    /// Carries the final snapshot because the container is gone from the
    /// tree by dispatch time.
    Vanished { container: ContainerId, info: FragmentInfo },
    InfoChanged { container: ContainerId },
    ParentInfoChanged { container: ContainerId },
    Error {
        error_token: Option<ErrorToken>,
        container: Option<ContainerId>,
        op: Option<OpKind>,
        error: OpError,
    },
    ActivityReparented { activity: ContainerId },
}

/// An undelivered organizer notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub organizer: OrganizerId,
    pub kind: PendingEventKind,
    /// Host-task activity tick at the time the event was deferred; the event
    /// stays parked until the task is used again.
    pub defer_until: u64,
}

impl PendingEvent {
    pub fn new(organizer: OrganizerId, kind: PendingEventKind) -> Self {
        PendingEvent { organizer, kind, defer_until: 0 }
    }

    /// The fragment the event is about, when it is about one.
    pub fn container(&self) -> Option<ContainerId> {
        match &self.kind {
            PendingEventKind::Appeared { container }
            | PendingEventKind::Vanished { container, .. }
            | PendingEventKind::InfoChanged { container }
            | PendingEventKind::ParentInfoChanged { container } => Some(*container),
            PendingEventKind::Error { container, .. } => *container,
            PendingEventKind::ActivityReparented { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool { matches!(self.kind, PendingEventKind::Error { .. }) }
}

/// Parent task state attached to appeared/info-changed notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentInfo {
    pub task: ContainerToken,
    pub configuration: Configuration,
    pub visible: bool,
}

/// One change inside a delivered organizer transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientChange {
    Appeared { info: FragmentInfo, parent: ParentInfo },
    Vanished { info: FragmentInfo },
    InfoChanged { info: FragmentInfo },
    ParentInfoChanged { fragment_token: Option<FragmentToken>, parent: ParentInfo },
    Error {
        error_token: Option<ErrorToken>,
        op: Option<OpKind>,
        message: String,
    },
    ActivityReparentedToTask { task: ContainerToken, activity: ActivityRef },
}

/// How a reparented activity is referenced in the event: directly when the
/// organizer's process hosts it, through a temporary token otherwise.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ActivityRef {
    Token(ContainerToken),
    Temporary(TempToken),
}

/// The batch delivered to one organizer in a single call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrganizerTransaction {
    pub changes: Vec<ClientChange>,
}

impl OrganizerTransaction {
    pub fn is_empty(&self) -> bool { self.changes.is_empty() }
}
