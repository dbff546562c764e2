use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use strum::Display;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::common::collections::{FxHashMap, FxHashSet};
use crate::engine::sync::{SyncEngine, SyncId};
use crate::model::container::{ContainerId, ContainerToken, ContainerTree};
use crate::model::surface::SurfaceTransaction;

slotmap::new_key_type! {
    struct TransitionId;
}

/// Opaque handle to a transition, handed across the service boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransitionToken(TransitionId);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Open,
    Close,
    ToFront,
    ToBack,
    Change,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TransitionState {
    /// Allocated but waiting in the sync queue for its turn to collect.
    Created,
    Collecting,
    /// Sealed; no further participants may be collected.
    Started,
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("unknown transition")]
    Unknown,
    #[error("another transition is already collecting")]
    AlreadyCollecting,
    #[error("transition in state {state} cannot {action}")]
    InvalidState { state: TransitionState, action: &'static str },
}

/// Everything a player needs to run an animation for one transition.
#[derive(Debug, Clone)]
pub struct TransitionInfo {
    pub token: TransitionToken,
    pub kind: TransitionKind,
    /// Containers touched by the transition, in collection order.
    pub participants: Vec<ContainerToken>,
    /// Subset of participants that appeared or disappeared.
    pub existence_changes: Vec<ContainerToken>,
}

/// Receives sealed transitions along with their merged surface updates.
pub trait TransitionPlayer: Send + Sync {
    fn on_transition_ready(&self, info: TransitionInfo, merged: SurfaceTransaction);
    fn on_transition_finished(&self, _token: TransitionToken) {}
}

/// Player that acknowledges transitions without animating. Used when no
/// real player has been attached.
pub struct NoopTransitionPlayer;

impl TransitionPlayer for NoopTransitionPlayer {
    fn on_transition_ready(&self, info: TransitionInfo, _merged: SurfaceTransaction) {
        trace!(token = ?info.token, kind = %info.kind, "transition ready (no player attached)");
    }
}

pub struct Transition {
    kind: TransitionKind,
    state: TransitionState,
    sync: Option<SyncId>,
    participants: Vec<ContainerId>,
    participant_set: FxHashSet<ContainerId>,
    existence_changes: FxHashSet<ContainerId>,
    /// For transient launches: task moved to front -> sibling to restore it
    /// below when the transition finishes without committing.
    transient_restore: FxHashMap<ContainerId, ContainerId>,
}

impl Transition {
    fn new(kind: TransitionKind) -> Self {
        Transition {
            kind,
            state: TransitionState::Created,
            sync: None,
            participants: Vec::new(),
            participant_set: FxHashSet::default(),
            existence_changes: FxHashSet::default(),
            transient_restore: FxHashMap::default(),
        }
    }

    pub fn kind(&self) -> TransitionKind { self.kind }

    pub fn state(&self) -> TransitionState { self.state }

    pub fn sync_id(&self) -> Option<SyncId> { self.sync }

    pub fn is_collecting(&self) -> bool { self.state == TransitionState::Collecting }

    pub fn participants(&self) -> &[ContainerId] { &self.participants }

    pub fn set_transient_launch(&mut self, moved: ContainerId, restore_below: ContainerId) {
        self.transient_restore.insert(moved, restore_below);
    }

    pub fn transient_restore_target(&self, moved: ContainerId) -> Option<ContainerId> {
        self.transient_restore.get(&moved).copied()
    }
}

/// Owns transition lifecycles and enforces the one-collecting rule.
///
/// A transition starts collecting the moment it is created (unless the sync
/// engine is busy, in which case it waits in the engine's queue as
/// `Created`), so hierarchy changes happening in the meantime cannot sneak
/// in unobserved.
pub struct TransitionController {
    transitions: SlotMap<TransitionId, Transition>,
    collecting: Option<TransitionId>,
    player: Arc<dyn TransitionPlayer>,
}

impl TransitionController {
    pub fn new(player: Arc<dyn TransitionPlayer>) -> Self {
        TransitionController { transitions: SlotMap::with_key(), collecting: None, player }
    }

    pub fn player(&self) -> Arc<dyn TransitionPlayer> { Arc::clone(&self.player) }

    pub fn collecting(&self) -> Option<TransitionToken> { self.collecting.map(TransitionToken) }

    pub fn get(&self, token: TransitionToken) -> Option<&Transition> {
        self.transitions.get(token.0)
    }

    pub fn get_mut(&mut self, token: TransitionToken) -> Option<&mut Transition> {
        self.transitions.get_mut(token.0)
    }

    /// Allocates a transition that will start collecting later, once the
    /// sync engine frees up.
    pub fn create_pending(&mut self, kind: TransitionKind) -> TransitionToken {
        let token = TransitionToken(self.transitions.insert(Transition::new(kind)));
        debug!(?token, %kind, "transition created (pending)");
        token
    }

    /// Moves a pending transition into the collecting phase, claiming the
    /// sync engine.
    pub fn move_to_collecting<Q>(
        &mut self,
        token: TransitionToken,
        sync: &mut SyncEngine<Q>,
    ) -> Result<SyncId, TransitionError> {
        if self.collecting.is_some() {
            return Err(TransitionError::AlreadyCollecting);
        }
        let transition = self.transitions.get_mut(token.0).ok_or(TransitionError::Unknown)?;
        if transition.state != TransitionState::Created {
            return Err(TransitionError::InvalidState {
                state: transition.state,
                action: "start collecting",
            });
        }
        let group = sync.prepare_sync_set();
        let sync_id = group.id();
        sync.start_sync_set(group);
        transition.state = TransitionState::Collecting;
        transition.sync = Some(sync_id);
        self.collecting = Some(token.0);
        info!(?token, kind = %transition.kind, "transition collecting");
        Ok(sync_id)
    }

    /// Creates a transition and starts collecting immediately. Fails when
    /// the sync engine is busy; the caller queues a pending one instead.
    pub fn create<Q>(
        &mut self,
        kind: TransitionKind,
        sync: &mut SyncEngine<Q>,
    ) -> Result<TransitionToken, TransitionError> {
        if sync.has_active_sync() {
            return Err(TransitionError::AlreadyCollecting);
        }
        let token = self.create_pending(kind);
        self.move_to_collecting(token, sync)?;
        Ok(token)
    }

    /// Records that `container` is part of the transition and of its sync
    /// set.
    pub fn collect<Q>(
        &mut self,
        token: TransitionToken,
        container: ContainerId,
        sync: &mut SyncEngine<Q>,
    ) -> Result<(), TransitionError> {
        let transition = self.transitions.get_mut(token.0).ok_or(TransitionError::Unknown)?;
        if transition.state != TransitionState::Collecting {
            return Err(TransitionError::InvalidState {
                state: transition.state,
                action: "collect",
            });
        }
        if transition.participant_set.insert(container) {
            transition.participants.push(container);
            if let Some(sync_id) = transition.sync {
                sync.add_to_sync_set(sync_id, container);
            }
        }
        Ok(())
    }

    /// Collects a container that is appearing or disappearing.
    pub fn collect_existence_change<Q>(
        &mut self,
        token: TransitionToken,
        container: ContainerId,
        sync: &mut SyncEngine<Q>,
    ) -> Result<(), TransitionError> {
        self.collect(token, container, sync)?;
        // Unwrap-free: collect just validated the token.
        if let Some(transition) = self.transitions.get_mut(token.0) {
            transition.existence_changes.insert(container);
        }
        Ok(())
    }

    /// Seals the transition: no further collection, the player may start
    /// animating. Returns the info snapshot and the sync id to complete.
    pub fn request_start(
        &mut self,
        token: TransitionToken,
        tree: &ContainerTree,
    ) -> Result<(TransitionInfo, SyncId), TransitionError> {
        let transition = self.transitions.get_mut(token.0).ok_or(TransitionError::Unknown)?;
        if transition.state != TransitionState::Collecting {
            return Err(TransitionError::InvalidState {
                state: transition.state,
                action: "start",
            });
        }
        transition.state = TransitionState::Started;
        let sync_id = transition.sync.ok_or(TransitionError::Unknown)?;
        let info = TransitionInfo {
            token,
            kind: transition.kind,
            participants: transition
                .participants
                .iter()
                .filter_map(|id| tree.token_of(*id))
                .collect(),
            existence_changes: transition
                .participants
                .iter()
                .filter(|id| transition.existence_changes.contains(*id))
                .filter_map(|id| tree.token_of(*id))
                .collect(),
        };
        if self.collecting == Some(token.0) {
            self.collecting = None;
        }
        info!(?token, kind = %info.kind, participants = info.participants.len(), "transition started");
        Ok((info, sync_id))
    }

    pub fn finish(&mut self, token: TransitionToken) -> Result<(), TransitionError> {
        let transition = self.transitions.get_mut(token.0).ok_or(TransitionError::Unknown)?;
        if transition.state != TransitionState::Started {
            return Err(TransitionError::InvalidState {
                state: transition.state,
                action: "finish",
            });
        }
        transition.state = TransitionState::Finished;
        info!(?token, "transition finished");
        self.player.on_transition_finished(token);
        Ok(())
    }

    /// Aborts a created or collecting transition, releasing the sync engine
    /// if the transition held it.
    pub fn abort(&mut self, token: TransitionToken) -> Result<Option<SyncId>, TransitionError> {
        let transition = self.transitions.get_mut(token.0).ok_or(TransitionError::Unknown)?;
        match transition.state {
            TransitionState::Created | TransitionState::Collecting => {
                transition.state = TransitionState::Aborted;
                if self.collecting == Some(token.0) {
                    self.collecting = None;
                }
                info!(?token, "transition aborted");
                Ok(transition.sync)
            }
            state => Err(TransitionError::InvalidState { state, action: "abort" }),
        }
    }
}
