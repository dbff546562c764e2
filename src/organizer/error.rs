use thiserror::Error;

use crate::engine::transition::TransitionError;

/// Failure delivering a batch to a remote endpoint. Treated like a binder
/// death: logged, and the work falls back to local handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote endpoint unreachable: {0}")]
pub struct DeliveryError(pub String);

/// Errors surfaced synchronously to callers of the organizer service.
///
/// Per-operation problems inside an otherwise valid transaction do not show
/// up here; those become error events on the owning organizer's channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrganizerError {
    #[error("caller lacks window management permission")]
    PermissionDenied,
    #[error("operation not allowed for a task fragment organizer: {0}")]
    FragmentPermissionDenied(String),
    #[error("organizer is already registered")]
    AlreadyRegistered,
    #[error("organizer is not registered")]
    NotRegistered,
    #[error("remote animations already registered for this task")]
    AnimationsAlreadyRegistered,
    #[error("unknown container token")]
    UnknownContainer,
    #[error("surface bounds change on a container without an organized parent")]
    NotOrganized,
    #[error("sync queue is full")]
    SyncQueueFull,
    #[error("a sync is already in flight")]
    SyncBusy,
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Problems detected while applying a single operation, reported back to the
/// owning organizer as an error event rather than thrown at the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    #[error("fragment token is already in use")]
    DuplicateFragmentToken,
    #[error("owner activity is unknown or detached")]
    InvalidOwner,
    #[error("owner activity belongs to a different app")]
    OwnerUidMismatch,
    #[error("owner activity is not resizeable")]
    OwnerNotResizeable,
    #[error("container is not attached")]
    Detached,
    #[error("unknown fragment token")]
    UnknownFragment,
    #[error("operation not allowed on a pinned task")]
    PinnedTask,
    #[error("activity cannot be finished while locked")]
    BlockedByLockTask,
    #[error("bounds {width}x{height} below minimum dimensions {min_width}x{min_height}")]
    MinDimensionViolation { width: i32, height: i32, min_width: i32, min_height: i32 },
    #[error("activity is not allowed to be embedded")]
    EmbeddingNotAllowed,
    #[error("activity and fragment are in different tasks")]
    ActivityOutsideTask,
    #[error("temporary activity token is invalid or expired")]
    InvalidActivityToken,
    #[error("activity start failed: {0}")]
    StartFailed(String),
}
