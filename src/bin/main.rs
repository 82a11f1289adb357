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

use chrono::{DateTime, Utc};
use circulation_rs::{
    BranchId, CirculationEngine, CopyId, FineId, LoanId, MemberId, MembershipTier,
    PaymentMethod, ReservationId, TitleId,
};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

/// Circulation Engine - Replay circulation event CSV files
///
/// Reads circulation events from a CSV file and outputs per-member summaries
/// to stdout. Supports registrations, borrows, returns, extensions,
/// reservations, lost reports, fine sweeps and settlements.
#[derive(Parser, Debug)]
#[command(name = "circulation-rs")]
#[command(about = "A circulation engine that replays event CSVs", long_about = None)]
struct Args {
    /// Path to CSV file with circulation events
    ///
    /// Expected format: op,member,tier,copy,title,branch,loan,reservation,fine,amount,method,at
    /// Example: cargo run -- events.csv > members.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let engine = match replay_events(BufReader::new(file)) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error replaying events: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = write_members(&engine, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `op, member, tier, copy, title, branch, loan, reservation, fine,
/// amount, method, at`. Only `op` and `at` are required; each operation
/// reads the columns it needs.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    member: Option<u32>,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    copy: Option<u32>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    title: Option<u32>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    branch: Option<u32>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    loan: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    reservation: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    fine: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
    #[serde(default)]
    method: Option<String>,
    at: DateTime<Utc>,
}

/// One replayable circulation event.
#[derive(Debug)]
enum Event {
    AddMember(MemberId, MembershipTier),
    AddCopy(CopyId, TitleId, BranchId),
    Borrow(MemberId, CopyId),
    Return(LoanId),
    Extend(LoanId),
    Lost(LoanId),
    Reserve(MemberId, TitleId),
    Confirm(ReservationId),
    Cancel(ReservationId),
    Sweep,
    Accrue,
    Settle(FineId, Decimal, PaymentMethod),
    Waive(FineId),
}

impl CsvRecord {
    /// Converts a CSV record to an event.
    ///
    /// Returns `None` for unknown operations or missing required fields.
    fn into_event(self) -> Option<(Event, DateTime<Utc>)> {
        let at = self.at;
        let event = match self.op.to_lowercase().as_str() {
            "add_member" => Event::AddMember(
                MemberId(self.member?),
                self.tier?.parse().ok()?,
            ),
            "add_copy" => Event::AddCopy(
                CopyId(self.copy?),
                TitleId(self.title?),
                BranchId(self.branch?),
            ),
            "borrow" => Event::Borrow(MemberId(self.member?), CopyId(self.copy?)),
            "return" => Event::Return(LoanId(self.loan?)),
            "extend" => Event::Extend(LoanId(self.loan?)),
            "lost" => Event::Lost(LoanId(self.loan?)),
            "reserve" => Event::Reserve(MemberId(self.member?), TitleId(self.title?)),
            "confirm" => Event::Confirm(ReservationId(self.reservation?)),
            "cancel" => Event::Cancel(ReservationId(self.reservation?)),
            "sweep" => Event::Sweep,
            "accrue" => Event::Accrue,
            "settle" => Event::Settle(
                FineId(self.fine?),
                self.amount?,
                parse_method(self.method.as_deref()),
            ),
            "waive" => Event::Waive(FineId(self.fine?)),
            _ => return None,
        };
        Some((event, at))
    }
}

fn parse_method(method: Option<&str>) -> PaymentMethod {
    match method.map(|m| m.to_lowercase()).as_deref() {
        Some("card") => PaymentMethod::Card,
        Some("online") => PaymentMethod::Online,
        Some("mobile") => PaymentMethod::Mobile,
        _ => PaymentMethod::Cash,
    }
}

/// Replays circulation events from a CSV reader against a fresh engine.
///
/// Streaming parse, so event files of any size replay in constant memory.
/// Malformed rows and failed operations are skipped; ids allocate
/// sequentially from 1 per kind, so an event file can reference the loans,
/// reservations and fines its earlier rows created.
///
/// # CSV Format
///
/// Expected columns:
/// `op, member, tier, copy, title, branch, loan, reservation, fine, amount, method, at`
/// - `op`: Event kind (add_member, add_copy, borrow, return, extend, lost,
///   reserve, confirm, cancel, sweep, accrue, settle, waive)
/// - `at`: RFC 3339 timestamp driving the engine's clock
/// - Remaining columns: ids and amounts, each read by the ops that need them
///
/// # Example
///
/// ```csv
/// op,member,tier,copy,title,branch,loan,reservation,fine,amount,method,at
/// add_member,1,premium,,,,,,,,,2026-01-05T10:00:00Z
/// add_copy,,,10,100,1,,,,,,2026-01-05T10:00:00Z
/// borrow,1,,10,,,,,,,,2026-01-05T10:00:00Z
/// return,,,,,,1,,,,,2026-01-12T10:00:00Z
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
/// Individual operation errors are logged in debug mode but don't stop the
/// replay.
pub fn replay_events<R: Read>(reader: R) -> Result<CirculationEngine, csv::Error> {
    let engine = CirculationEngine::default();

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for result in rdr.deserialize::<CsvRecord>() {
        match result {
            Ok(record) => {
                let Some((event, at)) = record.into_event() else {
                    #[cfg(debug_assertions)]
                    eprintln!("Skipping invalid event record");
                    continue;
                };

                if let Err(e) = apply_event(&engine, &event, at) {
                    #[cfg(debug_assertions)]
                    eprintln!("Skipping event {:?}: {}", event, e);
                }
            }
            Err(e) => {
                #[cfg(debug_assertions)]
                eprintln!("Skipping malformed row: {}", e);
                continue;
            }
        }
    }

    Ok(engine)
}

fn apply_event(
    engine: &CirculationEngine,
    event: &Event,
    at: DateTime<Utc>,
) -> Result<(), circulation_rs::CirculationError> {
    match *event {
        Event::AddMember(member, tier) => engine.add_member(member, tier),
        Event::AddCopy(copy, title, branch) => engine.add_copy(copy, title, branch),
        Event::Borrow(member, copy) => engine.borrow(member, copy, at).map(|_| ()),
        Event::Return(loan) => engine.return_loan(loan, at).map(|_| ()),
        Event::Extend(loan) => engine.extend(loan, at).map(|_| ()),
        Event::Lost(loan) => engine.report_lost(loan, at).map(|_| ()),
        Event::Reserve(member, title) => engine.reserve(member, title, at).map(|_| ()),
        Event::Confirm(reservation) => engine.confirm_offer(reservation, at).map(|_| ()),
        Event::Cancel(reservation) => engine.cancel_reservation(reservation, at).map(|_| ()),
        Event::Sweep => {
            engine.sweep_expired_offers(at);
            Ok(())
        }
        Event::Accrue => {
            engine.accrue_fines(at);
            Ok(())
        }
        Event::Settle(fine, amount, method) => {
            engine.settle_fine(fine, amount, method, at).map(|_| ())
        }
        Event::Waive(fine) => engine.waive_fine(fine),
    }
}

/// Per-member summary row written after the replay.
#[derive(Debug, Serialize)]
struct MemberSummary {
    member: MemberId,
    tier: MembershipTier,
    open_loans: u32,
    outstanding: Decimal,
}

/// Write per-member summaries to a CSV writer.
///
/// Rows are sorted by member id so output is stable across runs.
///
/// # CSV Format
///
/// Columns: `member, tier, open_loans, outstanding`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_members<W: Write>(engine: &CirculationEngine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    let mut members = engine.members();
    members.sort_by_key(|(id, _, _)| *id);

    for (member, tier, open_loans) in members {
        wtr.serialize(MemberSummary {
            member,
            tier,
            open_loans,
            outstanding: engine.outstanding_balance(member),
        })?;
    }

    wtr.flush()?;
    Ok(())
}
