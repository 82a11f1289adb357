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

//! Loan records and the concurrent loan store.
//!
//! A loan is one borrow episode. It is created on borrow, mutated on extend
//! (due date advances) and on return (returned-at set), and never deleted:
//! closed loans stay in the store for audit and fine computation.
//!
//! "Overdue" is a derived condition (`now > due_at` while open), recomputed
//! by the fine engine rather than stored.

use crate::CirculationError;
use crate::base::{CopyId, LoanId, MemberId, TitleId};
use crate::policy::MembershipTier;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// One borrow episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub copy_id: CopyId,
    pub title_id: TitleId,
    pub member_id: MemberId,
    /// Member's tier at borrow time; fine rates follow the tier the loan
    /// was taken under, not later upgrades.
    pub tier: MembershipTier,
    pub borrowed_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub extensions: u32,
}

impl Loan {
    /// A loan is open until returned.
    pub fn is_open(&self) -> bool {
        self.returned_at.is_none()
    }

    /// Derived: open and past due.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && now > self.due_at
    }

    /// Whole days past due at `instant`; zero when not past due.
    pub fn days_overdue(&self, instant: DateTime<Utc>) -> i64 {
        if instant > self.due_at {
            (instant - self.due_at).num_days()
        } else {
            0
        }
    }
}

/// Concurrent loan store.
///
/// The per-entry shard lock gives every mutation compare-and-set semantics:
/// `close` re-checks the open flag under the lock, so a double return fails
/// with `AlreadyReturned` instead of silently overwriting.
#[derive(Debug)]
pub struct LoanStore {
    loans: DashMap<LoanId, Loan>,
    next_id: AtomicU64,
}

impl Default for LoanStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LoanStore {
    pub fn new() -> Self {
        Self {
            loans: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Records a new open loan and returns its id.
    pub fn create(
        &self,
        copy: CopyId,
        title: TitleId,
        member: MemberId,
        tier: MembershipTier,
        borrowed_at: DateTime<Utc>,
        due_at: DateTime<Utc>,
    ) -> LoanId {
        let id = LoanId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.loans.insert(
            id,
            Loan {
                id,
                copy_id: copy,
                title_id: title,
                member_id: member,
                tier,
                borrowed_at,
                due_at,
                returned_at: None,
                extensions: 0,
            },
        );
        id
    }

    /// Snapshot of a loan.
    pub fn get(&self, id: LoanId) -> Option<Loan> {
        self.loans.get(&id).map(|l| l.clone())
    }

    /// Closes a loan, setting `returned_at = now`.
    ///
    /// # Errors
    ///
    /// - [`CirculationError::UnknownLoan`] - No loan with this id.
    /// - [`CirculationError::AlreadyReturned`] - The loan is already closed;
    ///   the idempotency guard for double returns.
    pub fn close(&self, id: LoanId, now: DateTime<Utc>) -> Result<Loan, CirculationError> {
        let mut loan = self
            .loans
            .get_mut(&id)
            .ok_or(CirculationError::UnknownLoan(id))?;
        if loan.returned_at.is_some() {
            return Err(CirculationError::AlreadyReturned(id));
        }
        loan.returned_at = Some(now);
        Ok(loan.clone())
    }

    /// Advances the due date by `extension`, re-checking every precondition
    /// under the entry lock.
    ///
    /// # Errors
    ///
    /// - [`CirculationError::AlreadyReturned`] - Closed loans cannot extend.
    /// - [`CirculationError::LoanOverdue`] - Overdue loans cannot extend.
    /// - [`CirculationError::ExtensionLimitExceeded`] - Tier allowance used.
    pub fn apply_extension(
        &self,
        id: LoanId,
        max_extensions: u32,
        extension: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CirculationError> {
        let mut loan = self
            .loans
            .get_mut(&id)
            .ok_or(CirculationError::UnknownLoan(id))?;
        if loan.returned_at.is_some() {
            return Err(CirculationError::AlreadyReturned(id));
        }
        if now > loan.due_at {
            return Err(CirculationError::LoanOverdue(id));
        }
        if loan.extensions >= max_extensions {
            return Err(CirculationError::ExtensionLimitExceeded {
                loan: id,
                limit: max_extensions,
            });
        }
        loan.due_at += extension;
        loan.extensions += 1;
        Ok(loan.due_at)
    }

    /// Runs `f` against the loan if it is still open. Used by fine accrual
    /// to re-check open state atomically with its upsert: a return blocks on
    /// the same entry lock, so it cannot interleave.
    pub fn with_open<R>(&self, id: LoanId, f: impl FnOnce(&Loan) -> R) -> Option<R> {
        let loan = self.loans.get(&id)?;
        if loan.returned_at.is_some() {
            return None;
        }
        Some(f(&loan))
    }

    /// Snapshot of all open loans past due at `now`.
    pub fn open_overdue(&self, now: DateTime<Utc>) -> Vec<Loan> {
        self.loans
            .iter()
            .filter(|l| l.is_overdue(now))
            .map(|l| l.clone())
            .collect()
    }

    /// Snapshot of all open loans.
    pub fn open_loans(&self) -> Vec<Loan> {
        self.loans
            .iter()
            .filter(|l| l.is_open())
            .map(|l| l.clone())
            .collect()
    }

    /// Snapshot of every loan a member has taken, open or closed.
    pub fn loans_for_member(&self, member: MemberId) -> Vec<Loan> {
        self.loans
            .iter()
            .filter(|l| l.member_id == member)
            .map(|l| l.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, d, 12, 0, 0).unwrap()
    }

    fn store_with_loan(due: DateTime<Utc>) -> (LoanStore, LoanId) {
        let store = LoanStore::new();
        let id = store.create(
            CopyId(1),
            TitleId(1),
            MemberId(1),
            MembershipTier::Premium,
            day(1),
            due,
        );
        (store, id)
    }

    #[test]
    fn close_is_idempotency_guarded() {
        let (store, id) = store_with_loan(day(15));
        store.close(id, day(10)).unwrap();
        assert_eq!(
            store.close(id, day(11)),
            Err(CirculationError::AlreadyReturned(id))
        );
        // First close wins; timestamp unchanged
        assert_eq!(store.get(id).unwrap().returned_at, Some(day(10)));
    }

    #[test]
    fn overdue_is_derived_not_stored() {
        let (store, id) = store_with_loan(day(15));
        let loan = store.get(id).unwrap();
        assert!(!loan.is_overdue(day(15)));
        assert!(loan.is_overdue(day(16)));
        assert_eq!(loan.days_overdue(day(18)), 3);
    }

    #[test]
    fn closed_loan_is_never_overdue() {
        let (store, id) = store_with_loan(day(15));
        store.close(id, day(20)).unwrap();
        assert!(!store.get(id).unwrap().is_overdue(day(21)));
    }

    #[test]
    fn extension_advances_due_date() {
        let (store, id) = store_with_loan(day(15));
        let new_due = store
            .apply_extension(id, 1, Duration::days(7), day(10))
            .unwrap();
        assert_eq!(new_due, day(22));
        assert_eq!(store.get(id).unwrap().extensions, 1);
    }

    #[test]
    fn extension_limit_enforced() {
        let (store, id) = store_with_loan(day(15));
        store
            .apply_extension(id, 1, Duration::days(7), day(10))
            .unwrap();
        assert_eq!(
            store.apply_extension(id, 1, Duration::days(7), day(11)),
            Err(CirculationError::ExtensionLimitExceeded { loan: id, limit: 1 })
        );
    }

    #[test]
    fn overdue_loan_cannot_extend() {
        let (store, id) = store_with_loan(day(15));
        assert_eq!(
            store.apply_extension(id, 1, Duration::days(7), day(16)),
            Err(CirculationError::LoanOverdue(id))
        );
    }

    #[test]
    fn with_open_skips_closed_loans() {
        let (store, id) = store_with_loan(day(15));
        assert_eq!(store.with_open(id, |l| l.id), Some(id));
        store.close(id, day(10)).unwrap();
        assert_eq!(store.with_open(id, |l| l.id), None);
    }

    #[test]
    fn open_overdue_snapshot() {
        let store = LoanStore::new();
        let overdue = store.create(
            CopyId(1),
            TitleId(1),
            MemberId(1),
            MembershipTier::Basic,
            day(1),
            day(5),
        );
        store.create(
            CopyId(2),
            TitleId(1),
            MemberId(2),
            MembershipTier::Basic,
            day(1),
            day(25),
        );

        let snapshot = store.open_overdue(day(10));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, overdue);
    }
}
