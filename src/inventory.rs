// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 The circulation-rs Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Inventory ledger: copy registry and the single copy-state mutation point.
//!
//! Copy State Machine
//!
//  Available ──borrow──► OnLoan ──return──► Available ──offer──► ReservedHold
//                          │                                          │
//                          └──report lost──► Lost          claim──► OnLoan
//
//! [`InventoryLedger::transition`] is a compare-and-set: it fails with
//! `StateConflict` when the copy's current state differs from the expected
//! one, which is how lost races are detected. All concurrent borrow attempts
//! serialize through it.

use crate::CirculationError;
use crate::base::{BranchId, CopyId, TitleId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lifecycle state of one physical copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyState {
    /// On the shelf, free to borrow.
    Available,
    /// Out with a member; exactly one open loan references the copy.
    OnLoan,
    /// Held for an offered reservation until the offer expires.
    ReservedHold,
    /// Reported lost by the borrower.
    Lost,
    /// Pulled from circulation by staff.
    Withdrawn,
}

#[derive(Debug)]
struct CopyRecord {
    title_id: TitleId,
    branch_id: BranchId,
    state: CopyState,
}

/// Registry of physical copies, indexed by copy id.
///
/// Owns copy state exclusively: other components read it through
/// [`state`](InventoryLedger::state) and mutate it only through
/// [`transition`](InventoryLedger::transition).
#[derive(Debug, Default)]
pub struct InventoryLedger {
    copies: DashMap<CopyId, CopyRecord>,
}

impl InventoryLedger {
    pub fn new() -> Self {
        Self {
            copies: DashMap::new(),
        }
    }

    /// Registers a copy as [`CopyState::Available`].
    ///
    /// # Errors
    ///
    /// Returns [`CirculationError::DuplicateCopy`] if the id is taken.
    pub fn add_copy(
        &self,
        copy: CopyId,
        title: TitleId,
        branch: BranchId,
    ) -> Result<(), CirculationError> {
        match self.copies.entry(copy) {
            Entry::Occupied(_) => Err(CirculationError::DuplicateCopy(copy)),
            Entry::Vacant(entry) => {
                entry.insert(CopyRecord {
                    title_id: title,
                    branch_id: branch,
                    state: CopyState::Available,
                });
                Ok(())
            }
        }
    }

    /// Atomically moves a copy from `from` to `to`.
    ///
    /// The compare happens under the map's shard lock, so two simultaneous
    /// transitions on the same copy produce exactly one winner.
    ///
    /// # Errors
    ///
    /// - [`CirculationError::UnknownCopy`] - No copy with this id.
    /// - [`CirculationError::StateConflict`] - Current state differs from
    ///   `from`; the caller lost a race and must re-resolve.
    pub fn transition(
        &self,
        copy: CopyId,
        from: CopyState,
        to: CopyState,
    ) -> Result<(), CirculationError> {
        let mut record = self
            .copies
            .get_mut(&copy)
            .ok_or(CirculationError::UnknownCopy(copy))?;

        if record.state != from {
            return Err(CirculationError::StateConflict {
                copy,
                expected: from,
                actual: record.state,
            });
        }

        record.state = to;
        debug!(copy = %copy, ?from, ?to, "copy transition");
        Ok(())
    }

    /// Returns the copy's current state.
    ///
    /// Read-mostly availability check; not guaranteed fresh after the read.
    /// Mutating callers must re-check through [`transition`]'s atomic
    /// compare.
    ///
    /// [`transition`]: InventoryLedger::transition
    pub fn state(&self, copy: CopyId) -> Result<CopyState, CirculationError> {
        self.copies
            .get(&copy)
            .map(|r| r.state)
            .ok_or(CirculationError::UnknownCopy(copy))
    }

    /// Returns the title a copy belongs to.
    pub fn title_of(&self, copy: CopyId) -> Result<TitleId, CirculationError> {
        self.copies
            .get(&copy)
            .map(|r| r.title_id)
            .ok_or(CirculationError::UnknownCopy(copy))
    }

    /// Returns the branch holding a copy.
    pub fn branch_of(&self, copy: CopyId) -> Result<BranchId, CirculationError> {
        self.copies
            .get(&copy)
            .map(|r| r.branch_id)
            .ok_or(CirculationError::UnknownCopy(copy))
    }

    /// Pulls an available copy from circulation.
    pub fn withdraw(&self, copy: CopyId) -> Result<(), CirculationError> {
        self.transition(copy, CopyState::Available, CopyState::Withdrawn)
    }
}
