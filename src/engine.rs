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

//! The circulation engine: orchestrates inventory, reservations, loans and
//! fines behind one thread-safe facade.
//!
//! Every operation takes an explicit `now`. The engine never reads the wall
//! clock, which keeps replay deterministic and lets tests drive time.
//!
//! Cross-component consistency comes from short critical sections plus
//! compensation, not from nested locks: an operation reserves its member
//! slot first, then runs the copy compare-and-set, and releases the slot
//! again if any later step fails. No guard from one component is held while
//! another component's lock is taken, except the loan read guard around fine
//! accrual (which is what keeps accrual and return from interleaving).

use crate::CirculationError;
use crate::base::{BranchId, CopyId, FineId, LoanId, MemberId, ReservationId, TitleId};
use crate::fines::{Fine, FineLedger, PaymentMethod, PaymentRecord};
use crate::inventory::{CopyState, InventoryLedger};
use crate::loan::{Loan, LoanStore};
use crate::policy::{MembershipPolicy, MembershipTier, PolicyTable};
use crate::reservation::{Reservation, ReservationQueue};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

/// Engine-level tunables not covered by the per-tier policy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long an offered copy is held before the offer lapses.
    pub hold_hours: i64,
    /// Flat replacement fee charged when a borrower reports a copy lost.
    pub lost_item_fee: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_hours: 72,
            lost_item_fee: dec!(50.00),
        }
    }
}

impl EngineConfig {
    fn hold(&self) -> Duration {
        Duration::hours(self.hold_hours)
    }
}

#[derive(Debug)]
struct MemberRecord {
    tier: MembershipTier,
    /// Count of open loans; incremented before the borrow proceeds so the
    /// per-tier limit holds under concurrent borrows.
    open_loans: u32,
}

/// Outcome of a successful return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnReceipt {
    pub loan_id: LoanId,
    pub returned_at: DateTime<Utc>,
    /// Overdue fine finalized at return time, if the loan ran late.
    pub fine: Option<FineId>,
    /// Member the freed copy was offered to, when a reservation was waiting.
    pub offered_to: Option<MemberId>,
}

/// Thread-safe circulation facade over the component ledgers.
///
/// Shared freely across threads behind an `Arc`; all methods take `&self`.
#[derive(Debug, Default)]
pub struct CirculationEngine {
    config: EngineConfig,
    policies: PolicyTable,
    members: DashMap<MemberId, MemberRecord>,
    inventory: InventoryLedger,
    reservations: ReservationQueue,
    loans: LoanStore,
    fines: FineLedger,
}

impl CirculationEngine {
    pub fn new(config: EngineConfig, policies: PolicyTable) -> Self {
        Self {
            config,
            policies,
            members: DashMap::new(),
            inventory: InventoryLedger::new(),
            reservations: ReservationQueue::new(),
            loans: LoanStore::new(),
            fines: FineLedger::new(),
        }
    }

    // ---- registration -----------------------------------------------------

    /// Registers a member under a tier.
    ///
    /// # Errors
    ///
    /// Returns [`CirculationError::DuplicateMember`] if the id is taken, or
    /// [`CirculationError::MissingPolicy`] when no policy covers the tier.
    pub fn add_member(
        &self,
        member: MemberId,
        tier: MembershipTier,
    ) -> Result<(), CirculationError> {
        if self.policies.policy(tier).is_none() {
            return Err(CirculationError::MissingPolicy(tier));
        }
        match self.members.entry(member) {
            Entry::Occupied(_) => Err(CirculationError::DuplicateMember(member)),
            Entry::Vacant(entry) => {
                entry.insert(MemberRecord {
                    tier,
                    open_loans: 0,
                });
                Ok(())
            }
        }
    }

    /// Registers a physical copy of a title at a branch.
    pub fn add_copy(
        &self,
        copy: CopyId,
        title: TitleId,
        branch: BranchId,
    ) -> Result<(), CirculationError> {
        self.inventory.add_copy(copy, title, branch)
    }

    /// Pulls an available copy from circulation.
    pub fn withdraw_copy(&self, copy: CopyId) -> Result<(), CirculationError> {
        self.inventory.withdraw(copy)
    }

    // ---- borrow -----------------------------------------------------------

    /// Lends a copy to a member, returning the new loan's id.
    ///
    /// A copy in `ReservedHold` can only be borrowed by the member it is
    /// offered to; doing so confirms the reservation. When several members
    /// race for the last available copy, exactly one borrow succeeds.
    ///
    /// # Errors
    ///
    /// - [`CirculationError::LoanLimitExceeded`] - Member is at their tier's
    ///   concurrent-loan limit.
    /// - [`CirculationError::CopyUnavailable`] - Copy is not available, or
    ///   is held for somebody else.
    pub fn borrow(
        &self,
        member: MemberId,
        copy: CopyId,
        now: DateTime<Utc>,
    ) -> Result<LoanId, CirculationError> {
        let tier = self.acquire_loan_slot(member)?;
        let result = self.borrow_inner(member, tier, copy, now);
        if result.is_err() {
            self.release_loan_slot(member);
        }
        result
    }

    fn borrow_inner(
        &self,
        member: MemberId,
        tier: MembershipTier,
        copy: CopyId,
        now: DateTime<Utc>,
    ) -> Result<LoanId, CirculationError> {
        let title = self.inventory.title_of(copy)?;

        match self
            .inventory
            .transition(copy, CopyState::Available, CopyState::OnLoan)
        {
            Ok(()) => {}
            Err(CirculationError::StateConflict {
                actual: CopyState::ReservedHold,
                ..
            }) => {
                // Claiming an offered copy confirms the reservation.
                let reservation = self
                    .reservations
                    .offer_for_copy(copy)
                    .ok_or(CirculationError::CopyUnavailable(copy))?;
                if reservation.member_id != member {
                    return Err(CirculationError::CopyUnavailable(copy));
                }
                self.reservations.confirm_offer(reservation.id, member, now)?;
                if let Err(e) =
                    self.inventory
                        .transition(copy, CopyState::ReservedHold, CopyState::OnLoan)
                {
                    self.reservations.revert_confirm(reservation.id);
                    return Err(e);
                }
            }
            Err(CirculationError::StateConflict { .. }) => {
                return Err(CirculationError::CopyUnavailable(copy));
            }
            Err(e) => return Err(e),
        }

        let policy = self
            .policies
            .policy(tier)
            .ok_or(CirculationError::MissingPolicy(tier))?;
        let due = now + Duration::days(policy.loan_period_days);
        let loan = self.loans.create(copy, title, member, tier, now, due);

        info!(loan = %loan, member = %member, copy = %copy, due = %due, "loan opened");
        Ok(loan)
    }

    /// Claims an open offer, converting the reservation to a loan.
    ///
    /// Delegates to [`borrow`](CirculationEngine::borrow): all borrow
    /// preconditions (loan limit included) apply, and a failed claim leaves
    /// the offer open until it lapses.
    pub fn confirm_offer(
        &self,
        reservation: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<LoanId, CirculationError> {
        let res = self
            .reservations
            .get(reservation)
            .ok_or(CirculationError::UnknownReservation(reservation))?;
        let copy = res
            .offered_copy
            .ok_or(CirculationError::InvalidState {
                entity: "reservation",
                id: reservation.0,
            })?;
        self.borrow(res.member_id, copy, now)
    }

    // ---- return -----------------------------------------------------------

    /// Closes a loan and releases its copy.
    ///
    /// Finalizes the overdue fine (frozen at the day-of-return figure) and,
    /// when someone is waiting on the title, immediately holds the copy for
    /// the highest-priority reservation.
    ///
    /// # Errors
    ///
    /// Returns [`CirculationError::AlreadyReturned`] on a double return; the
    /// first return's effects stand.
    pub fn return_loan(
        &self,
        id: LoanId,
        now: DateTime<Utc>,
    ) -> Result<ReturnReceipt, CirculationError> {
        let loan = self.loans.close(id, now)?;
        self.release_loan_slot(loan.member_id);

        let fine = self.settle_accrual_on_close(&loan, now)?;
        self.inventory
            .transition(loan.copy_id, CopyState::OnLoan, CopyState::Available)?;

        let offered_to = self.dispatch_offer(loan.title_id, loan.copy_id, now);

        info!(loan = %id, member = %loan.member_id, copy = %loan.copy_id, "loan closed");
        Ok(ReturnReceipt {
            loan_id: id,
            returned_at: now,
            fine,
            offered_to,
        })
    }

    /// Final fine bookkeeping for a closing loan: raise to the day-of-close
    /// figure if overdue, and freeze whatever has accrued either way.
    fn settle_accrual_on_close(
        &self,
        loan: &Loan,
        now: DateTime<Utc>,
    ) -> Result<Option<FineId>, CirculationError> {
        if now > loan.due_at {
            let policy = self
                .policies
                .policy(loan.tier)
                .ok_or(CirculationError::MissingPolicy(loan.tier))?;
            let amount = overdue_amount(policy, loan.days_overdue(now));
            Ok(self.fines.finalize(loan.id, loan.member_id, amount, now))
        } else {
            // A fine can predate an extension that pushed the due date back.
            self.fines.freeze_for_loan(loan.id);
            Ok(None)
        }
    }

    /// Holds a freed copy for the title's highest-priority waiter, if any.
    ///
    /// Losing the Available -> ReservedHold race to a direct borrow is fine:
    /// the copy went out either way.
    fn dispatch_offer(
        &self,
        title: TitleId,
        copy: CopyId,
        now: DateTime<Utc>,
    ) -> Option<MemberId> {
        if !self.reservations.has_waiting(title) {
            return None;
        }
        if self
            .inventory
            .transition(copy, CopyState::Available, CopyState::ReservedHold)
            .is_err()
        {
            return None;
        }
        self.offer_held_copy(title, copy, now)
    }

    /// Offers a copy already in `ReservedHold` to the next waiter, or returns
    /// it to `Available` when the queue has emptied.
    fn offer_held_copy(
        &self,
        title: TitleId,
        copy: CopyId,
        now: DateTime<Utc>,
    ) -> Option<MemberId> {
        match self
            .reservations
            .offer_next(title, copy, self.config.hold(), now)
        {
            Ok((reservation, member)) => {
                info!(reservation = %reservation, copy = %copy, member = %member, "copy offered");
                Some(member)
            }
            Err(_) => {
                let _ = self
                    .inventory
                    .transition(copy, CopyState::ReservedHold, CopyState::Available);
                None
            }
        }
    }

    // ---- extend -----------------------------------------------------------

    /// Extends a loan by its tier's extension period, returning the new due
    /// date.
    ///
    /// # Errors
    ///
    /// - [`CirculationError::ReservationPending`] - Another member is waiting
    ///   on the title; waiters outrank extensions.
    /// - [`CirculationError::LoanOverdue`] - Overdue loans cannot extend.
    /// - [`CirculationError::ExtensionLimitExceeded`] - Tier allowance used.
    pub fn extend(
        &self,
        id: LoanId,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CirculationError> {
        let loan = self.loans.get(id).ok_or(CirculationError::UnknownLoan(id))?;
        if self
            .reservations
            .blocks_extension(loan.title_id, loan.member_id)
        {
            return Err(CirculationError::ReservationPending(loan.title_id));
        }
        let policy = self
            .policies
            .policy(loan.tier)
            .ok_or(CirculationError::MissingPolicy(loan.tier))?;
        let due = self.loans.apply_extension(
            id,
            policy.max_extensions,
            Duration::days(policy.extension_days),
            now,
        )?;
        info!(loan = %id, new_due = %due, "loan extended");
        Ok(due)
    }

    // ---- lost -------------------------------------------------------------

    /// Records a copy as lost: closes the loan, freezes any overdue fine at
    /// the loss-time figure and raises the flat replacement fee. Returns the
    /// replacement fine's id.
    pub fn report_lost(
        &self,
        id: LoanId,
        now: DateTime<Utc>,
    ) -> Result<FineId, CirculationError> {
        let loan = self.loans.close(id, now)?;
        self.release_loan_slot(loan.member_id);
        self.settle_accrual_on_close(&loan, now)?;
        self.inventory
            .transition(loan.copy_id, CopyState::OnLoan, CopyState::Lost)?;

        let fine = self
            .fines
            .create_lost(loan.id, loan.member_id, self.config.lost_item_fee, now);
        warn!(loan = %id, copy = %loan.copy_id, fine = %fine, "copy reported lost");
        Ok(fine)
    }

    // ---- reservations -----------------------------------------------------

    /// Places a member in a title's waiting list.
    pub fn reserve(
        &self,
        member: MemberId,
        title: TitleId,
        now: DateTime<Utc>,
    ) -> Result<ReservationId, CirculationError> {
        let tier = self
            .members
            .get(&member)
            .map(|r| r.tier)
            .ok_or(CirculationError::UnknownMember(member))?;
        self.reservations.enqueue(title, member, tier, now)
    }

    /// Member-initiated cancellation. When an open offer is cancelled the
    /// held copy cascades to the next waiter; returns that member, if any.
    pub fn cancel_reservation(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Option<MemberId>, CirculationError> {
        match self.reservations.cancel(id)? {
            Some((title, copy)) => Ok(self.offer_held_copy(title, copy, now)),
            None => Ok(None),
        }
    }

    /// Expires every offer whose hold window has lapsed, cascading each freed
    /// copy to the next waiter. Returns the number of offers expired.
    ///
    /// Idempotent and safe to run concurrently with foreground traffic: a
    /// confirm racing the sweep settles under the reservation's entry lock,
    /// and the loser backs off.
    pub fn sweep_expired_offers(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for id in self.reservations.expired_offers(now) {
            match self.reservations.expire_offer(id, now) {
                Ok((title, copy)) => {
                    expired += 1;
                    self.offer_held_copy(title, copy, now);
                }
                // Confirmed (or already swept) in the meantime.
                Err(_) => continue,
            }
        }
        expired
    }

    // ---- fines ------------------------------------------------------------

    /// Accrues overdue fines across all open loans as of `now`. Returns the
    /// number of loans with a live fine after the pass.
    ///
    /// Re-running with the same `now` changes nothing; a return racing the
    /// sweep wins, because accrual re-checks the open flag under the loan's
    /// entry lock and a frozen fine rejects stale raises.
    pub fn accrue_fines(&self, now: DateTime<Utc>) -> usize {
        let mut accrued = 0;
        for loan in self.loans.open_overdue(now) {
            let Some(policy) = self.policies.policy(loan.tier) else {
                warn!(loan = %loan.id, tier = %loan.tier, "no policy for tier, skipping accrual");
                continue;
            };
            let upserted = self.loans.with_open(loan.id, |open| {
                let amount = overdue_amount(policy, open.days_overdue(now));
                self.fines
                    .upsert_accrual(open.id, open.member_id, amount, now)
            });
            if upserted.flatten().is_some() {
                accrued += 1;
            }
        }
        accrued
    }

    /// Applies a payment against a fine. See [`FineLedger::settle`].
    pub fn settle_fine(
        &self,
        fine: FineId,
        payment: Decimal,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<Decimal, CirculationError> {
        self.fines.settle(fine, payment, method, now)
    }

    /// Waives a fine. See [`FineLedger::waive`].
    pub fn waive_fine(&self, fine: FineId) -> Result<(), CirculationError> {
        self.fines.waive(fine)
    }

    // ---- member slots -----------------------------------------------------

    /// Reserves one loan slot under the member's entry lock, so the per-tier
    /// limit holds under concurrent borrows. The caller releases the slot if
    /// the borrow fails downstream.
    fn acquire_loan_slot(&self, member: MemberId) -> Result<MembershipTier, CirculationError> {
        let mut record = self
            .members
            .get_mut(&member)
            .ok_or(CirculationError::UnknownMember(member))?;
        let policy = self
            .policies
            .policy(record.tier)
            .ok_or(CirculationError::MissingPolicy(record.tier))?;
        if record.open_loans >= policy.max_loans {
            return Err(CirculationError::LoanLimitExceeded {
                member,
                limit: policy.max_loans,
            });
        }
        record.open_loans += 1;
        Ok(record.tier)
    }

    fn release_loan_slot(&self, member: MemberId) {
        if let Some(mut record) = self.members.get_mut(&member) {
            record.open_loans = record.open_loans.saturating_sub(1);
        }
    }

    // ---- read models ------------------------------------------------------

    pub fn copy_state(&self, copy: CopyId) -> Result<CopyState, CirculationError> {
        self.inventory.state(copy)
    }

    pub fn loan(&self, id: LoanId) -> Option<Loan> {
        self.loans.get(id)
    }

    pub fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        self.reservations.get(id)
    }

    pub fn fine(&self, id: FineId) -> Option<Fine> {
        self.fines.get(id)
    }

    pub fn fine_for_loan(&self, loan: LoanId) -> Option<Fine> {
        self.fines.fine_for_loan(loan)
    }

    /// Sum of the member's unpaid fine balances.
    pub fn outstanding_balance(&self, member: MemberId) -> Decimal {
        self.fines.outstanding_for(member)
    }

    pub fn member_tier(&self, member: MemberId) -> Option<MembershipTier> {
        self.members.get(&member).map(|r| r.tier)
    }

    /// Registered members with their tiers and open-loan counts.
    pub fn members(&self) -> Vec<(MemberId, MembershipTier, u32)> {
        self.members
            .iter()
            .map(|r| (*r.key(), r.tier, r.open_loans))
            .collect()
    }

    pub fn open_loans(&self) -> Vec<Loan> {
        self.loans.open_loans()
    }

    pub fn loans_for_member(&self, member: MemberId) -> Vec<Loan> {
        self.loans.loans_for_member(member)
    }

    pub fn fines_for_member(&self, member: MemberId) -> Vec<Fine> {
        self.fines.fines_for_member(member)
    }

    pub fn waiting_count(&self, title: TitleId) -> usize {
        self.reservations.waiting_count(title)
    }

    /// Drains the settlement journal for external reconciliation.
    pub fn drain_payments(&self) -> Vec<PaymentRecord> {
        self.fines.drain_payments()
    }
}

/// Overdue fine as of `days` past due: linear in days, clamped at the tier's
/// cap.
fn overdue_amount(policy: &MembershipPolicy, days: i64) -> Decimal {
    (Decimal::from(days) * policy.daily_fine_rate).min(policy.fine_cap)
}
