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

//! Fine ledger: accrued fines, settlements, waivers and the payment journal.
//!
//! Fine State Machine
//!
//  Outstanding ──settle──► PartiallyPaid ──settle to zero──► Paid
//       │                        │
//       └────────waive───────────┴──► Waived
//
//! A fine's amount is monotonically non-decreasing while any balance is
//! unpaid (accrual only ever raises it) and frozen once its loan closes.
//! Settlements are recorded in an append-only journal for the external
//! payment collaborator to reconcile; no gateway interaction happens here.

use crate::CirculationError;
use crate::base::{FineId, LoanId, MemberId};
use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Why a fine was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FineReason {
    Overdue,
    LostItem,
}

/// Settlement state of a fine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FineStatus {
    Outstanding,
    PartiallyPaid,
    Paid,
    Waived,
}

/// A monetary penalty tied to one loan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fine {
    pub id: FineId,
    pub loan_id: LoanId,
    pub member_id: MemberId,
    pub amount: Decimal,
    pub paid: Decimal,
    pub reason: FineReason,
    pub status: FineStatus,
    pub accrued_at: DateTime<Utc>,
    /// Set when the loan closes; accrual never touches a frozen fine.
    frozen: bool,
}

impl Fine {
    /// Unpaid balance.
    pub fn outstanding(&self) -> Decimal {
        self.amount - self.paid
    }

    /// Whether the amount can still grow through accrual.
    pub fn frozen(&self) -> bool {
        self.frozen
    }
}

/// How a settlement was captured by the external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Online,
    Mobile,
}

/// Journal entry for one settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub fine_id: FineId,
    pub member_id: MemberId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub recorded_at: DateTime<Utc>,
}

/// Fines indexed by id and by loan, plus the settlement journal.
///
/// The by-loan index's entry lock makes accrual upserts atomic: a sweep and
/// a return finalization racing on the same loan serialize through it.
#[derive(Debug)]
pub struct FineLedger {
    fines: DashMap<FineId, Fine>,
    by_loan: DashMap<LoanId, FineId>,
    payments: SegQueue<PaymentRecord>,
    next_id: AtomicU64,
}

impl Default for FineLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl FineLedger {
    pub fn new() -> Self {
        Self {
            fines: DashMap::new(),
            by_loan: DashMap::new(),
            payments: SegQueue::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc(&self) -> FineId {
        FineId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Records the accrual result for an open overdue loan.
    ///
    /// Creates the fine on first accrual; afterwards only ever raises the
    /// amount (monotonic while unpaid), so re-running a sweep is idempotent.
    /// Frozen, waived and fully paid fines are left untouched.
    ///
    /// Returns the fine id when a fine exists after the call.
    pub fn upsert_accrual(
        &self,
        loan: LoanId,
        member: MemberId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Option<FineId> {
        match self.by_loan.entry(loan) {
            Entry::Occupied(entry) => {
                let id = *entry.get();
                if let Some(mut fine) = self.fines.get_mut(&id) {
                    if !fine.frozen
                        && matches!(fine.status, FineStatus::Outstanding | FineStatus::PartiallyPaid)
                        && amount > fine.amount
                    {
                        fine.amount = amount;
                        debug!(fine = %id, loan = %loan, %amount, "fine accrued");
                    }
                }
                Some(id)
            }
            Entry::Vacant(entry) => {
                if amount <= Decimal::ZERO {
                    return None;
                }
                let id = self.alloc();
                self.fines.insert(
                    id,
                    Fine {
                        id,
                        loan_id: loan,
                        member_id: member,
                        amount,
                        paid: Decimal::ZERO,
                        reason: FineReason::Overdue,
                        status: FineStatus::Outstanding,
                        accrued_at: now,
                        frozen: false,
                    },
                );
                entry.insert(id);
                debug!(fine = %id, loan = %loan, %amount, "fine opened");
                Some(id)
            }
        }
    }

    /// Final accrual at return time: raises the amount to the day-of-return
    /// figure and freezes it. Later sweeps cannot touch the fine again.
    pub fn finalize(
        &self,
        loan: LoanId,
        member: MemberId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Option<FineId> {
        let id = self.upsert_accrual(loan, member, amount, now)?;
        if let Some(mut fine) = self.fines.get_mut(&id) {
            fine.frozen = true;
        }
        Some(id)
    }

    /// Freezes whatever has accrued for a loan without raising it. Used when
    /// a loan leaves circulation through the lost-item path.
    pub fn freeze_for_loan(&self, loan: LoanId) {
        if let Some(id) = self.by_loan.get(&loan).map(|e| *e) {
            if let Some(mut fine) = self.fines.get_mut(&id) {
                fine.frozen = true;
            }
        }
    }

    /// Raises a lost-item fine (replacement fee), frozen immediately: the
    /// amount does not grow with time.
    pub fn create_lost(
        &self,
        loan: LoanId,
        member: MemberId,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> FineId {
        let id = self.alloc();
        self.fines.insert(
            id,
            Fine {
                id,
                loan_id: loan,
                member_id: member,
                amount: fee,
                paid: Decimal::ZERO,
                reason: FineReason::LostItem,
                status: FineStatus::Outstanding,
                accrued_at: now,
                frozen: true,
            },
        );
        debug!(fine = %id, loan = %loan, %fee, "lost-item fine opened");
        id
    }

    /// Applies a captured payment against a fine's outstanding balance and
    /// journals it. Returns the new outstanding balance.
    ///
    /// # Errors
    ///
    /// - [`CirculationError::InvalidAmount`] - Zero or negative payment.
    /// - [`CirculationError::InvalidState`] - Fine is already Paid or Waived.
    /// - [`CirculationError::OverpaymentRejected`] - Payment exceeds the
    ///   outstanding balance; the balance is left unchanged.
    pub fn settle(
        &self,
        id: FineId,
        payment: Decimal,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<Decimal, CirculationError> {
        if payment <= Decimal::ZERO {
            return Err(CirculationError::InvalidAmount);
        }
        let mut fine = self
            .fines
            .get_mut(&id)
            .ok_or(CirculationError::UnknownFine(id))?;

        if !matches!(fine.status, FineStatus::Outstanding | FineStatus::PartiallyPaid) {
            return Err(CirculationError::InvalidState {
                entity: "fine",
                id: id.0,
            });
        }
        let outstanding = fine.outstanding();
        if payment > outstanding {
            return Err(CirculationError::OverpaymentRejected {
                fine: id,
                outstanding,
                attempted: payment,
            });
        }

        fine.paid += payment;
        fine.status = if fine.outstanding() == Decimal::ZERO {
            FineStatus::Paid
        } else {
            FineStatus::PartiallyPaid
        };

        self.payments.push(PaymentRecord {
            fine_id: id,
            member_id: fine.member_id,
            amount: payment,
            method,
            recorded_at: now,
        });

        debug!(fine = %id, %payment, remaining = %fine.outstanding(), "fine settled");
        Ok(fine.outstanding())
    }

    /// Waives a fine, freezing its amount. Authorization is the caller's
    /// concern: the engine trusts that only managers reach this path.
    ///
    /// # Errors
    ///
    /// Returns [`CirculationError::InvalidState`] unless the fine is
    /// Outstanding or PartiallyPaid.
    pub fn waive(&self, id: FineId) -> Result<(), CirculationError> {
        let mut fine = self
            .fines
            .get_mut(&id)
            .ok_or(CirculationError::UnknownFine(id))?;

        if !matches!(fine.status, FineStatus::Outstanding | FineStatus::PartiallyPaid) {
            return Err(CirculationError::InvalidState {
                entity: "fine",
                id: id.0,
            });
        }
        fine.status = FineStatus::Waived;
        fine.frozen = true;
        Ok(())
    }

    /// Snapshot of a fine.
    pub fn get(&self, id: FineId) -> Option<Fine> {
        self.fines.get(&id).map(|f| f.clone())
    }

    /// Snapshot of the fine attached to a loan, if any.
    pub fn fine_for_loan(&self, loan: LoanId) -> Option<Fine> {
        let id = *self.by_loan.get(&loan)?;
        self.get(id)
    }

    /// Sum of unpaid balances across a member's live fines.
    pub fn outstanding_for(&self, member: MemberId) -> Decimal {
        self.fines
            .iter()
            .filter(|f| {
                f.member_id == member
                    && matches!(f.status, FineStatus::Outstanding | FineStatus::PartiallyPaid)
            })
            .map(|f| f.outstanding())
            .sum()
    }

    /// Snapshot of every fine raised against a member.
    pub fn fines_for_member(&self, member: MemberId) -> Vec<Fine> {
        self.fines
            .iter()
            .filter(|f| f.member_id == member)
            .map(|f| f.clone())
            .collect()
    }

    /// Drains the settlement journal in recording order, for the external
    /// payment collaborator to reconcile.
    pub fn drain_payments(&self) -> Vec<PaymentRecord> {
        let mut drained = Vec::new();
        while let Some(record) = self.payments.pop() {
            drained.push(record);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, d, 0, 0, 0).unwrap()
    }

    const LOAN: LoanId = LoanId(1);
    const MEMBER: MemberId = MemberId(1);

    #[test]
    fn accrual_is_idempotent() {
        let ledger = FineLedger::new();
        let id = ledger
            .upsert_accrual(LOAN, MEMBER, dec!(4.00), day(1))
            .unwrap();
        let again = ledger
            .upsert_accrual(LOAN, MEMBER, dec!(4.00), day(1))
            .unwrap();
        assert_eq!(id, again);
        assert_eq!(ledger.get(id).unwrap().amount, dec!(4.00));
    }

    #[test]
    fn accrual_is_monotonic() {
        let ledger = FineLedger::new();
        let id = ledger
            .upsert_accrual(LOAN, MEMBER, dec!(4.00), day(1))
            .unwrap();
        // Higher amount raises
        ledger.upsert_accrual(LOAN, MEMBER, dec!(10.00), day(4)).unwrap();
        assert_eq!(ledger.get(id).unwrap().amount, dec!(10.00));
        // A stale lower figure never lowers
        ledger.upsert_accrual(LOAN, MEMBER, dec!(6.00), day(2)).unwrap();
        assert_eq!(ledger.get(id).unwrap().amount, dec!(10.00));
    }

    #[test]
    fn zero_amount_opens_no_fine() {
        let ledger = FineLedger::new();
        assert_eq!(
            ledger.upsert_accrual(LOAN, MEMBER, Decimal::ZERO, day(1)),
            None
        );
    }

    #[test]
    fn finalize_freezes_amount() {
        let ledger = FineLedger::new();
        let id = ledger.finalize(LOAN, MEMBER, dec!(8.00), day(4)).unwrap();
        assert!(ledger.get(id).unwrap().frozen());

        // Stale accrual after the freeze is ignored
        ledger.upsert_accrual(LOAN, MEMBER, dec!(50.00), day(9)).unwrap();
        assert_eq!(ledger.get(id).unwrap().amount, dec!(8.00));
    }

    #[test]
    fn settle_reduces_balance_and_journals() {
        let ledger = FineLedger::new();
        let id = ledger
            .upsert_accrual(LOAN, MEMBER, dec!(20.00), day(1))
            .unwrap();

        let remaining = ledger
            .settle(id, dec!(5.00), PaymentMethod::Cash, day(2))
            .unwrap();
        assert_eq!(remaining, dec!(15.00));
        assert_eq!(ledger.get(id).unwrap().status, FineStatus::PartiallyPaid);

        let remaining = ledger
            .settle(id, dec!(15.00), PaymentMethod::Card, day(3))
            .unwrap();
        assert_eq!(remaining, Decimal::ZERO);
        assert_eq!(ledger.get(id).unwrap().status, FineStatus::Paid);

        let journal = ledger.drain_payments();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].amount, dec!(5.00));
        assert_eq!(journal[0].method, PaymentMethod::Cash);
        assert_eq!(journal[1].amount, dec!(15.00));
    }

    #[test]
    fn overpayment_rejected_balance_unchanged() {
        let ledger = FineLedger::new();
        let id = ledger
            .upsert_accrual(LOAN, MEMBER, dec!(20.00), day(1))
            .unwrap();

        let result = ledger.settle(id, dec!(25.00), PaymentMethod::Cash, day(2));
        assert_eq!(
            result,
            Err(CirculationError::OverpaymentRejected {
                fine: id,
                outstanding: dec!(20.00),
                attempted: dec!(25.00),
            })
        );
        assert_eq!(ledger.get(id).unwrap().outstanding(), dec!(20.00));
        assert!(ledger.drain_payments().is_empty());
    }

    #[test]
    fn settle_rejects_nonpositive_payment() {
        let ledger = FineLedger::new();
        let id = ledger
            .upsert_accrual(LOAN, MEMBER, dec!(20.00), day(1))
            .unwrap();
        assert_eq!(
            ledger.settle(id, Decimal::ZERO, PaymentMethod::Cash, day(2)),
            Err(CirculationError::InvalidAmount)
        );
    }

    #[test]
    fn settle_paid_fine_rejected() {
        let ledger = FineLedger::new();
        let id = ledger
            .upsert_accrual(LOAN, MEMBER, dec!(10.00), day(1))
            .unwrap();
        ledger
            .settle(id, dec!(10.00), PaymentMethod::Online, day(2))
            .unwrap();

        assert_eq!(
            ledger.settle(id, dec!(1.00), PaymentMethod::Online, day(3)),
            Err(CirculationError::InvalidState {
                entity: "fine",
                id: id.0,
            })
        );
    }

    #[test]
    fn monotonic_guard_holds_after_partial_payment() {
        let ledger = FineLedger::new();
        let id = ledger
            .upsert_accrual(LOAN, MEMBER, dec!(10.00), day(1))
            .unwrap();
        ledger
            .settle(id, dec!(4.00), PaymentMethod::Cash, day(2))
            .unwrap();

        // Accrual keeps raising while a balance remains
        ledger.upsert_accrual(LOAN, MEMBER, dec!(14.00), day(3)).unwrap();
        let fine = ledger.get(id).unwrap();
        assert_eq!(fine.amount, dec!(14.00));
        assert_eq!(fine.outstanding(), dec!(10.00));
    }

    #[test]
    fn waive_freezes_and_blocks_settlement() {
        let ledger = FineLedger::new();
        let id = ledger
            .upsert_accrual(LOAN, MEMBER, dec!(12.00), day(1))
            .unwrap();
        ledger.waive(id).unwrap();

        let fine = ledger.get(id).unwrap();
        assert_eq!(fine.status, FineStatus::Waived);
        assert!(fine.frozen());
        assert!(ledger.settle(id, dec!(1.00), PaymentMethod::Cash, day(2)).is_err());
        assert!(ledger.waive(id).is_err());
        assert_eq!(ledger.outstanding_for(MEMBER), Decimal::ZERO);
    }

    #[test]
    fn lost_item_fine_is_frozen_from_the_start() {
        let ledger = FineLedger::new();
        let id = ledger.create_lost(LOAN, MEMBER, dec!(50.00), day(1));
        let fine = ledger.get(id).unwrap();
        assert_eq!(fine.reason, FineReason::LostItem);
        assert!(fine.frozen());
        assert_eq!(fine.amount, dec!(50.00));
    }

    #[test]
    fn outstanding_for_sums_live_fines() {
        let ledger = FineLedger::new();
        let a = ledger
            .upsert_accrual(LoanId(1), MEMBER, dec!(10.00), day(1))
            .unwrap();
        ledger
            .upsert_accrual(LoanId(2), MEMBER, dec!(6.00), day(1))
            .unwrap();
        ledger
            .settle(a, dec!(4.00), PaymentMethod::Cash, day(2))
            .unwrap();

        assert_eq!(ledger.outstanding_for(MEMBER), dec!(12.00));
    }
}
