// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canonical replica of the tuplespace, rebuilt by replaying the sequencer's
//! ordered transaction stream.
//!
//! [`Tuplespace`] is the multiset itself; [`Archiver`] adds the replay
//! discipline on top (strictly increasing ticks, gap reporting).
//!
//! # Absence vs. violation
//!
//! Not finding a tuple is a normal answer (`false` / `None`). An
//! [`ArchiveError`] always means the replica can no longer be trusted: replay
//! must stop and the embedding process has to resynchronize from an archive.

mod tuplespace;

pub use tuplespace::{Tuplespace, ZERO_TOLERANCE};

use ordo_proto::{Tick, Transaction, Tuple};
use thiserror::Error;
use tracing::{debug, warn};

/// Replay contract violations. None of these are recoverable locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchiveError {
    /// A delete targeted a tuple with no remaining instances.
    #[error("[ARCHIVE_MISSING_TUPLE] delete of absent tuple {0}")]
    MissingTuple(Tuple),
    /// A transaction arrived with a tick at or before one already applied.
    #[error("[ARCHIVE_OUT_OF_ORDER] tick {got} after {last}")]
    OutOfOrder {
        /// Last tick applied.
        last: Tick,
        /// Offending tick.
        got: Tick,
    },
}

/// Outcome of a successful [`Archiver::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Tick followed the previous one directly.
    InOrder,
    /// Ticks in `(from, to)` were never seen; a replica subscribed to
    /// everything must fetch them from an external archive.
    Gap {
        /// Last tick applied before this one.
        from: Tick,
        /// Tick just applied.
        to: Tick,
    },
}

/// Replica that applies sequencer-ordered transactions.
#[derive(Debug, Clone, Default)]
pub struct Archiver {
    space: Tuplespace,
    tick: Tick,
}

impl Archiver {
    /// Start from an empty space at `tick` (the greeting tick on first connect,
    /// or the last persisted tick on resume).
    pub fn new(tick: Tick, zero_tolerance: usize) -> Self {
        Self {
            space: Tuplespace::new(zero_tolerance),
            tick,
        }
    }

    /// Last tick applied.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Read-only view of the multiset.
    pub fn space(&self) -> &Tuplespace {
        &self.space
    }

    /// Apply the transaction stamped with `tick`.
    pub fn apply(&mut self, tick: Tick, txn: &Transaction) -> Result<Applied, ArchiveError> {
        if tick <= self.tick {
            return Err(ArchiveError::OutOfOrder {
                last: self.tick,
                got: tick,
            });
        }
        let from = self.tick;
        self.tick = tick;
        self.space.transaction(&txn.deletes, &txn.inserts)?;
        debug!(
            tick,
            deletes = txn.deletes.len(),
            inserts = txn.inserts.len(),
            "applied transaction"
        );
        if tick == from + 1 {
            Ok(Applied::InOrder)
        } else {
            warn!(from, to = tick, "tick gap in replayed stream");
            Ok(Applied::Gap { from, to: tick })
        }
    }
}
