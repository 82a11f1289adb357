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

//! Per-title reservation queues.
//!
//! Reservation State Machine
//!
//  Waiting ──offer──► Offered ──confirm──► Fulfilled
//     │                  │
//     │                  ├──expiry sweep──► Expired
//     │cancel            └──cancel────────► Cancelled
//     ▼
//  Cancelled
//
//! Queue order is tier precedence (Premium > Basic > Student), then arrival
//! order within a tier. A reservation claims a title, not a specific copy;
//! a copy attaches only while an offer is open.
//!
//! The confirm/expire race on an offered reservation uses the same
//! compare-and-set discipline as copy transitions: the status is checked and
//! flipped under the reservation's entry lock, so one of the two racing
//! writers fails cleanly.

use crate::CirculationError;
use crate::base::{CopyId, MemberId, ReservationId, TitleId};
use crate::policy::MembershipTier;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Lifecycle state of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// In the queue, waiting for a copy to free up.
    Waiting,
    /// A freed copy is held for this member until the offer expires.
    Offered,
    /// The offer lapsed before the member claimed it.
    Expired,
    /// The member claimed the offered copy; a loan was created.
    Fulfilled,
    /// Withdrawn by the member.
    Cancelled,
}

/// A member's claim on a title while no copy is immediately available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub title_id: TitleId,
    pub member_id: MemberId,
    pub tier: MembershipTier,
    pub requested_at: DateTime<Utc>,
    pub status: ReservationStatus,
    /// Copy held for this reservation while the status is `Offered`.
    pub offered_copy: Option<CopyId>,
    /// Offer expiry; set while the status is `Offered`.
    pub offer_expires_at: Option<DateTime<Utc>>,
    /// Arrival sequence for FIFO tie-breaks within a tier.
    seq: u64,
}

/// One slot in a title's waiting list, ordered by (precedence, seq).
#[derive(Debug, Clone, Copy)]
struct QueueSlot {
    precedence: u8,
    seq: u64,
    id: ReservationId,
    member: MemberId,
}

/// Priority-ordered waitlists, one per title.
///
/// Lock discipline: at most one title's waiting list is locked at a time,
/// and reservation entries are only locked after (never before) taking a
/// waiting-list lock in the same call.
#[derive(Debug)]
pub struct ReservationQueue {
    reservations: DashMap<ReservationId, Reservation>,
    /// Waiting reservations per title, kept sorted by (precedence, seq).
    waiting: DashMap<TitleId, Mutex<Vec<QueueSlot>>>,
    /// Live (Waiting or Offered) reservation per member and title.
    /// The entry API gives the atomic duplicate check.
    active: DashMap<(TitleId, MemberId), ReservationId>,
    /// Offered reservation per held copy.
    offers: DashMap<CopyId, ReservationId>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl Default for ReservationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationQueue {
    pub fn new() -> Self {
        Self {
            reservations: DashMap::new(),
            waiting: DashMap::new(),
            active: DashMap::new(),
            offers: DashMap::new(),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Adds a member to a title's waiting list.
    ///
    /// # Errors
    ///
    /// Returns [`CirculationError::DuplicateReservation`] if the member
    /// already holds a Waiting or Offered reservation for the title.
    pub fn enqueue(
        &self,
        title: TitleId,
        member: MemberId,
        tier: MembershipTier,
        now: DateTime<Utc>,
    ) -> Result<ReservationId, CirculationError> {
        let id = ReservationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        // Atomic check-and-insert; the guard drops before any other lock is
        // taken.
        match self.active.entry((title, member)) {
            Entry::Occupied(_) => {
                return Err(CirculationError::DuplicateReservation { member, title });
            }
            Entry::Vacant(entry) => {
                entry.insert(id);
            }
        }

        self.reservations.insert(
            id,
            Reservation {
                id,
                title_id: title,
                member_id: member,
                tier,
                requested_at: now,
                status: ReservationStatus::Waiting,
                offered_copy: None,
                offer_expires_at: None,
                seq,
            },
        );

        let slot = QueueSlot {
            precedence: tier.precedence(),
            seq,
            id,
            member,
        };
        let queue = self.waiting.entry(title).or_default();
        let mut slots = queue.lock();
        let pos = slots
            .binary_search_by_key(&(slot.precedence, slot.seq), |s| (s.precedence, s.seq))
            .unwrap_err();
        slots.insert(pos, slot);

        debug!(reservation = %id, title = %title, member = %member, "reservation enqueued");
        Ok(id)
    }

    /// Pops the highest-priority waiting reservation and marks it Offered,
    /// holding `copy` for the member until `now + hold`.
    ///
    /// Returns the reservation and the member to notify.
    ///
    /// # Errors
    ///
    /// Returns [`CirculationError::NoWaiters`] when the title's queue is
    /// empty; the caller then returns the copy to Available.
    pub fn offer_next(
        &self,
        title: TitleId,
        copy: CopyId,
        hold: Duration,
        now: DateTime<Utc>,
    ) -> Result<(ReservationId, MemberId), CirculationError> {
        let queue = self
            .waiting
            .get(&title)
            .ok_or(CirculationError::NoWaiters(title))?;
        let mut slots = queue.lock();
        if slots.is_empty() {
            return Err(CirculationError::NoWaiters(title));
        }
        let slot = slots.remove(0);

        if let Some(mut res) = self.reservations.get_mut(&slot.id) {
            res.status = ReservationStatus::Offered;
            res.offered_copy = Some(copy);
            res.offer_expires_at = Some(now + hold);
        }
        self.offers.insert(copy, slot.id);

        debug!(reservation = %slot.id, copy = %copy, member = %slot.member, "offer opened");
        Ok((slot.id, slot.member))
    }

    /// Converts an open offer to Fulfilled.
    ///
    /// Loses to expiry: once `now` is past the offer's expiry instant, the
    /// confirm is rejected and the reservation stays Offered for the sweep
    /// to expire.
    ///
    /// # Errors
    ///
    /// Returns [`CirculationError::InvalidState`] when the reservation is
    /// not Offered, is offered to another member, or the offer has lapsed.
    pub fn confirm_offer(
        &self,
        id: ReservationId,
        member: MemberId,
        now: DateTime<Utc>,
    ) -> Result<CopyId, CirculationError> {
        let mut res = self
            .reservations
            .get_mut(&id)
            .ok_or(CirculationError::UnknownReservation(id))?;

        if res.status != ReservationStatus::Offered || res.member_id != member {
            return Err(CirculationError::InvalidState {
                entity: "reservation",
                id: id.0,
            });
        }
        if res.offer_expires_at.is_some_and(|expires| now > expires) {
            return Err(CirculationError::InvalidState {
                entity: "reservation",
                id: id.0,
            });
        }

        let copy = res.offered_copy.expect("offered reservation holds a copy");
        res.status = ReservationStatus::Fulfilled;
        self.offers.remove(&copy);
        self.active.remove(&(res.title_id, res.member_id));

        debug!(reservation = %id, copy = %copy, "offer confirmed");
        Ok(copy)
    }

    /// Reverts a just-confirmed reservation back to Offered.
    ///
    /// Compensation path for the engine when the copy transition after a
    /// confirm fails; never exposed to callers.
    pub(crate) fn revert_confirm(&self, id: ReservationId) {
        if let Some(mut res) = self.reservations.get_mut(&id) {
            if res.status == ReservationStatus::Fulfilled {
                res.status = ReservationStatus::Offered;
                if let Some(copy) = res.offered_copy {
                    self.offers.insert(copy, id);
                }
                self.active.insert((res.title_id, res.member_id), id);
            }
        }
    }

    /// Converts an open offer to Expired, returning the title and freed copy
    /// so the caller can cascade the offer to the next waiter.
    ///
    /// # Errors
    ///
    /// Returns [`CirculationError::InvalidState`] when the reservation is no
    /// longer Offered (e.g. the member confirmed first); the race loser
    /// fails harmlessly.
    pub fn expire_offer(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<(TitleId, CopyId), CirculationError> {
        let mut res = self
            .reservations
            .get_mut(&id)
            .ok_or(CirculationError::UnknownReservation(id))?;

        if res.status != ReservationStatus::Offered {
            return Err(CirculationError::InvalidState {
                entity: "reservation",
                id: id.0,
            });
        }

        let copy = res.offered_copy.expect("offered reservation holds a copy");
        res.status = ReservationStatus::Expired;
        res.offered_copy = None;
        self.offers.remove(&copy);
        self.active.remove(&(res.title_id, res.member_id));

        debug!(reservation = %id, copy = %copy, at = %now, "offer expired");
        Ok((res.title_id, copy))
    }

    /// Member-initiated cancellation; legal from Waiting or Offered only.
    ///
    /// Returns the title and held copy when an open offer was cancelled, so
    /// the caller can re-offer the copy.
    pub fn cancel(
        &self,
        id: ReservationId,
    ) -> Result<Option<(TitleId, CopyId)>, CirculationError> {
        let title = self
            .reservations
            .get(&id)
            .map(|r| r.title_id)
            .ok_or(CirculationError::UnknownReservation(id))?;

        // Waiting-list lock first, then the reservation entry; same order as
        // offer_next.
        let queue = self.waiting.entry(title).or_default();
        let mut slots = queue.lock();

        let mut res = self
            .reservations
            .get_mut(&id)
            .ok_or(CirculationError::UnknownReservation(id))?;

        match res.status {
            ReservationStatus::Waiting => {
                slots.retain(|s| s.id != id);
                res.status = ReservationStatus::Cancelled;
                self.active.remove(&(res.title_id, res.member_id));
                Ok(None)
            }
            ReservationStatus::Offered => {
                let copy = res.offered_copy.expect("offered reservation holds a copy");
                res.status = ReservationStatus::Cancelled;
                res.offered_copy = None;
                self.offers.remove(&copy);
                self.active.remove(&(res.title_id, res.member_id));
                Ok(Some((res.title_id, copy)))
            }
            _ => Err(CirculationError::InvalidState {
                entity: "reservation",
                id: id.0,
            }),
        }
    }

    /// Whether any member is waiting on the title.
    pub fn has_waiting(&self, title: TitleId) -> bool {
        self.waiting
            .get(&title)
            .map(|q| !q.lock().is_empty())
            .unwrap_or(false)
    }

    /// Whether a waiting reservation by someone other than `borrower` should
    /// block a loan extension on this title.
    pub fn blocks_extension(&self, title: TitleId, borrower: MemberId) -> bool {
        self.waiting
            .get(&title)
            .map(|q| q.lock().iter().any(|s| s.member != borrower))
            .unwrap_or(false)
    }

    /// The reservation currently holding `copy`, if any.
    pub fn offer_for_copy(&self, copy: CopyId) -> Option<Reservation> {
        let id = *self.offers.get(&copy)?;
        self.reservations.get(&id).map(|r| r.clone())
    }

    /// Ids of offers whose expiry instant has passed. Snapshot for the
    /// sweep; each id is re-checked under its entry lock by
    /// [`expire_offer`](ReservationQueue::expire_offer).
    pub fn expired_offers(&self, now: DateTime<Utc>) -> Vec<ReservationId> {
        self.reservations
            .iter()
            .filter(|r| {
                r.status == ReservationStatus::Offered
                    && r.offer_expires_at.is_some_and(|expires| now > expires)
            })
            .map(|r| r.id)
            .collect()
    }

    /// Snapshot of a reservation.
    pub fn get(&self, id: ReservationId) -> Option<Reservation> {
        self.reservations.get(&id).map(|r| r.clone())
    }

    /// Number of members waiting on a title.
    pub fn waiting_count(&self, title: TitleId) -> usize {
        self.waiting.get(&title).map(|q| q.lock().len()).unwrap_or(0)
    }
}
