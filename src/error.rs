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

//! Error types for circulation operations.
//!
//! Every variant is a recoverable-by-caller condition. The engine never
//! panics on bad input; it returns a typed failure carrying the entity id
//! and attempted transition so the caller can decide between retry and
//! surfacing the error to the user.

use crate::base::{CopyId, FineId, LoanId, MemberId, ReservationId, TitleId};
use crate::inventory::CopyState;
use crate::policy::MembershipTier;
use rust_decimal::Decimal;
use thiserror::Error;

/// Circulation processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CirculationError {
    /// Lost a race on copy state; caller retries or reports unavailability
    #[error("copy {copy} state conflict (expected {expected:?}, found {actual:?})")]
    StateConflict {
        copy: CopyId,
        expected: CopyState,
        actual: CopyState,
    },

    /// Copy is not available for borrowing
    #[error("copy {0} is not available")]
    CopyUnavailable(CopyId),

    /// Member has reached the concurrent-loan limit for their tier
    #[error("member {member} has reached the loan limit of {limit}")]
    LoanLimitExceeded { member: MemberId, limit: u32 },

    /// Loan has used all extensions allowed by the member's tier
    #[error("loan {loan} has reached the extension limit of {limit}")]
    ExtensionLimitExceeded { loan: LoanId, limit: u32 },

    /// Overdue loans cannot be extended
    #[error("loan {0} is overdue")]
    LoanOverdue(LoanId),

    /// Reservation holders take precedence over extensions
    #[error("title {0} has a pending reservation")]
    ReservationPending(TitleId),

    /// Loan is already closed (idempotency guard)
    #[error("loan {0} has already been returned")]
    AlreadyReturned(LoanId),

    /// Member already holds a live reservation for this title
    #[error("member {member} already holds a reservation for title {title}")]
    DuplicateReservation { member: MemberId, title: TitleId },

    /// Illegal transition attempted on a reservation or fine
    #[error("illegal {entity} transition (id {id})")]
    InvalidState { entity: &'static str, id: u64 },

    /// Payment exceeds the outstanding balance
    #[error("payment of {attempted} exceeds outstanding balance {outstanding} on fine {fine}")]
    OverpaymentRejected {
        fine: FineId,
        outstanding: Decimal,
        attempted: Decimal,
    },

    /// Payment amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Reservation queue for the title is empty
    #[error("no waiting reservations for title {0}")]
    NoWaiters(TitleId),

    /// Member id is not registered
    #[error("unknown member {0}")]
    UnknownMember(MemberId),

    /// Copy id is not registered
    #[error("unknown copy {0}")]
    UnknownCopy(CopyId),

    /// Loan id does not exist
    #[error("unknown loan {0}")]
    UnknownLoan(LoanId),

    /// Reservation id does not exist
    #[error("unknown reservation {0}")]
    UnknownReservation(ReservationId),

    /// Fine id does not exist
    #[error("unknown fine {0}")]
    UnknownFine(FineId),

    /// Copy id is already registered
    #[error("copy {0} is already registered")]
    DuplicateCopy(CopyId),

    /// Member id is already registered
    #[error("member {0} is already registered")]
    DuplicateMember(MemberId),

    /// No policy configured for the tier; a configuration error, not a
    /// caller error
    #[error("no membership policy configured for tier {0:?}")]
    MissingPolicy(MembershipTier),
}

#[cfg(test)]
mod tests {
    use super::CirculationError;
    use crate::base::{CopyId, FineId, LoanId, MemberId, TitleId};
    use crate::inventory::CopyState;
    use rust_decimal_macros::dec;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            CirculationError::StateConflict {
                copy: CopyId(7),
                expected: CopyState::Available,
                actual: CopyState::OnLoan,
            }
            .to_string(),
            "copy 7 state conflict (expected Available, found OnLoan)"
        );
        assert_eq!(
            CirculationError::CopyUnavailable(CopyId(3)).to_string(),
            "copy 3 is not available"
        );
        assert_eq!(
            CirculationError::LoanLimitExceeded {
                member: MemberId(9),
                limit: 5
            }
            .to_string(),
            "member 9 has reached the loan limit of 5"
        );
        assert_eq!(
            CirculationError::AlreadyReturned(LoanId(4)).to_string(),
            "loan 4 has already been returned"
        );
        assert_eq!(
            CirculationError::DuplicateReservation {
                member: MemberId(1),
                title: TitleId(2)
            }
            .to_string(),
            "member 1 already holds a reservation for title 2"
        );
        assert_eq!(
            CirculationError::OverpaymentRejected {
                fine: FineId(5),
                outstanding: dec!(20.00),
                attempted: dec!(25.00),
            }
            .to_string(),
            "payment of 25.00 exceeds outstanding balance 20.00 on fine 5"
        );
        assert_eq!(
            CirculationError::InvalidState {
                entity: "reservation",
                id: 12
            }
            .to_string(),
            "illegal reservation transition (id 12)"
        );
    }

    #[test]
    fn errors_are_cloneable() {
        let error = CirculationError::CopyUnavailable(CopyId(1));
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
