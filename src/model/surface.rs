use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::model::container::{ContainerId, ContainerToken};

/// A single buffered surface mutation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurfaceCommand {
    SetPosition { container: ContainerToken, x: i32, y: i32 },
    SetCrop { container: ContainerToken, width: i32, height: i32 },
}

/// An ordered batch of surface mutations that applies atomically.
///
/// Stands in for a compositor transaction: commands accumulate here and are
/// merged across participants before a sync set completes.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceTransaction {
    commands: Vec<SurfaceCommand>,
}

impl SurfaceTransaction {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.commands.is_empty() }

    pub fn commands(&self) -> &[SurfaceCommand] { &self.commands }

    pub fn set_position(&mut self, container: ContainerToken, x: i32, y: i32) {
        self.commands.push(SurfaceCommand::SetPosition { container, x, y });
    }

    pub fn set_crop(&mut self, container: ContainerToken, width: i32, height: i32) {
        self.commands.push(SurfaceCommand::SetCrop { container, width, height });
    }

    /// Appends all of `other`'s commands, consuming it. Later commands win
    /// when they touch the same surface, so merge order is apply order.
    pub fn merge(&mut self, other: SurfaceTransaction) {
        self.commands.extend(other.commands);
    }

    /// Applies the batch locally. Used as the fallback when the callback
    /// that was supposed to take ownership is unreachable.
    pub fn apply(&self) {
        trace!(commands = self.commands.len(), "applying surface transaction locally");
    }
}

/// Pending per-container surface updates awaiting the next sync completion.
///
/// Shared between the transaction applier (writer) and the sync engine
/// (drainer), hence the concurrent map.
#[derive(Default, Clone)]
pub struct SurfaceTxStore {
    pending: Arc<DashMap<ContainerId, SurfaceTransaction>>,
}

impl SurfaceTxStore {
    pub fn new() -> Self { Self::default() }

    /// Buffers `tx` for `container`, merging with anything already pending.
    pub fn push(&self, container: ContainerId, tx: SurfaceTransaction) {
        self.pending.entry(container).or_default().merge(tx);
    }

    pub fn take(&self, container: ContainerId) -> Option<SurfaceTransaction> {
        self.pending.remove(&container).map(|(_, tx)| tx)
    }

    pub fn discard(&self, container: ContainerId) { self.pending.remove(&container); }

    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
}
