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

//! # Circulation Engine
//!
//! This library provides a circulation engine for a library system: it governs
//! how a physical copy of a title moves between available, on-loan, reserved
//! and overdue states, and how fines accrue and are settled against that
//! movement.
//!
//! ## Core Components
//!
//! - [`CirculationEngine`]: Orchestrates borrow, return, extend and reserve
//!   operations, enforcing membership-tier limits.
//! - [`InventoryLedger`]: Tracks copy state and owns every state transition.
//! - [`ReservationQueue`]: Per-title, priority-ordered waitlists.
//! - [`FineLedger`]: Accrued fines, settlements and the payment journal.
//! - [`PolicyTable`]: Per-tier loan limits, loan periods and fine rates.
//!
//! ## Example
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use circulation_rs::{BranchId, CirculationEngine, CopyId, MemberId, MembershipTier, TitleId};
//!
//! let engine = CirculationEngine::default();
//! engine.add_member(MemberId(1), MembershipTier::Premium).unwrap();
//! engine.add_copy(CopyId(10), TitleId(100), BranchId(1)).unwrap();
//!
//! let now = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
//! let loan = engine.borrow(MemberId(1), CopyId(10), now).unwrap();
//!
//! let receipt = engine.return_loan(loan, now).unwrap();
//! assert!(receipt.fine.is_none());
//! ```
//!
//! ## Thread Safety
//!
//! Every copy-state mutation funnels through a single atomic compare-and-set,
//! so concurrent borrow attempts on the last available copy produce exactly
//! one winner; the loser observes a typed conflict and re-resolves. Background
//! sweeps (offer expiry, fine accrual) are idempotent and safe to run
//! concurrently with foreground requests.

mod base;
mod engine;
pub mod error;
mod fines;
mod inventory;
mod loan;
pub mod policy;
mod reservation;

pub use base::{BranchId, CopyId, FineId, LoanId, MemberId, ReservationId, TitleId};
pub use engine::{CirculationEngine, EngineConfig, ReturnReceipt};
pub use error::CirculationError;
pub use fines::{Fine, FineLedger, FineReason, FineStatus, PaymentMethod, PaymentRecord};
pub use inventory::{CopyState, InventoryLedger};
pub use loan::Loan;
pub use policy::{MembershipPolicy, MembershipTier, PolicyTable};
pub use reservation::{Reservation, ReservationQueue, ReservationStatus};
