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

//! Membership tiers and the per-tier policy table.
//!
//! Policies are immutable reference data: the loan manager reads loan limits
//! and periods from them, the fine engine reads daily rates and caps. No
//! other component writes them.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Membership class governing loan limits, loan periods and fees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipTier {
    Basic,
    Premium,
    Student,
}

impl MembershipTier {
    /// Queue precedence for reservations: lower wins.
    ///
    /// Premium members are offered freed copies before Basic, Basic before
    /// Student. Arrival order breaks ties within a tier. This ordering is a
    /// business policy and must be preserved exactly.
    pub fn precedence(self) -> u8 {
        match self {
            MembershipTier::Premium => 0,
            MembershipTier::Basic => 1,
            MembershipTier::Student => 2,
        }
    }
}

impl fmt::Display for MembershipTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MembershipTier::Basic => "basic",
            MembershipTier::Premium => "premium",
            MembershipTier::Student => "student",
        };
        write!(f, "{name}")
    }
}

impl FromStr for MembershipTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "basic" => Ok(MembershipTier::Basic),
            "premium" => Ok(MembershipTier::Premium),
            "student" => Ok(MembershipTier::Student),
            other => Err(format!("unknown membership tier '{other}'")),
        }
    }
}

/// Per-tier circulation constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipPolicy {
    /// Maximum concurrent open loans.
    pub max_loans: u32,
    /// Base loan period in days.
    pub loan_period_days: i64,
    /// How many times a single loan may be extended.
    pub max_extensions: u32,
    /// Length of one extension in days.
    pub extension_days: i64,
    /// Fine accrued per full day overdue.
    pub daily_fine_rate: Decimal,
    /// Upper bound on a single overdue fine.
    pub fine_cap: Decimal,
    /// Monthly membership fee, kept for read models.
    pub monthly_fee: Decimal,
}

/// Static tier → policy lookup consumed by the loan manager and fine engine.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<MembershipTier, MembershipPolicy>,
}

impl PolicyTable {
    /// Creates an empty table. Most callers want [`PolicyTable::default`].
    pub fn new() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    /// Returns the table with `policy` installed for `tier`.
    pub fn with_policy(mut self, tier: MembershipTier, policy: MembershipPolicy) -> Self {
        self.policies.insert(tier, policy);
        self
    }

    /// Looks up the policy for a tier. `None` is a configuration error the
    /// caller maps to [`CirculationError::MissingPolicy`].
    ///
    /// [`CirculationError::MissingPolicy`]: crate::CirculationError::MissingPolicy
    pub fn policy(&self, tier: MembershipTier) -> Option<&MembershipPolicy> {
        self.policies.get(&tier)
    }
}

impl Default for PolicyTable {
    /// The standard three-tier table.
    fn default() -> Self {
        Self::new()
            .with_policy(
                MembershipTier::Basic,
                MembershipPolicy {
                    max_loans: 3,
                    loan_period_days: 14,
                    max_extensions: 0,
                    extension_days: 0,
                    daily_fine_rate: dec!(2.00),
                    fine_cap: dec!(50.00),
                    monthly_fee: dec!(50.00),
                },
            )
            .with_policy(
                MembershipTier::Premium,
                MembershipPolicy {
                    max_loans: 5,
                    loan_period_days: 14,
                    max_extensions: 1,
                    extension_days: 7,
                    daily_fine_rate: dec!(2.00),
                    fine_cap: dec!(100.00),
                    monthly_fee: dec!(75.00),
                },
            )
            .with_policy(
                MembershipTier::Student,
                MembershipPolicy {
                    max_loans: 4,
                    loan_period_days: 21,
                    max_extensions: 0,
                    extension_days: 0,
                    daily_fine_rate: dec!(1.00),
                    fine_cap: dec!(30.00),
                    monthly_fee: dec!(30.00),
                },
            )
    }
}
