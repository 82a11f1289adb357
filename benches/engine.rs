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

//! Benchmarks for the circulation engine.
//!
//! Run with: cargo bench
//!
//! Benchmarks include:
//! - Single-threaded borrow/return cycles
//! - Reservation offer cascades
//! - Multi-threaded contention on shared copies
//! - Fine accrual sweeps over growing loan books

use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use circulation_rs::{
    BranchId, CirculationEngine, CopyId, MemberId, MembershipTier, TitleId,
};
use rayon::prelude::*;
use std::sync::Arc;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
}

/// Engine with `members` premium members and `copies` copies of one title.
fn seeded_engine(members: u32, copies: u32) -> CirculationEngine {
    let engine = CirculationEngine::default();
    for m in 1..=members {
        engine.add_member(MemberId(m), MembershipTier::Premium).unwrap();
    }
    for c in 1..=copies {
        engine.add_copy(CopyId(c), TitleId(1), BranchId(1)).unwrap();
    }
    engine
}

// =============================================================================
// Single-Threaded Benchmarks
// =============================================================================

fn bench_borrow_return_cycle(c: &mut Criterion) {
    c.bench_function("borrow_return_cycle", |b| {
        let engine = seeded_engine(1, 1);
        let now = start();
        b.iter(|| {
            let loan = engine.borrow(MemberId(1), CopyId(1), black_box(now)).unwrap();
            engine.return_loan(loan, now + Duration::days(1)).unwrap();
        })
    });
}

fn bench_borrow_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("borrow_throughput");

    for count in [100u32, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let engine = seeded_engine(count, count);
                let now = start();
                for i in 1..=count {
                    engine.borrow(MemberId(i), CopyId(i), now).unwrap();
                }
                black_box(&engine);
            })
        });
    }
    group.finish();
}

fn bench_reservation_cascade(c: &mut Criterion) {
    let mut group = c.benchmark_group("reservation_cascade");

    // One copy circulating through a queue of waiters
    for waiters in [10u32, 100].iter() {
        group.throughput(Throughput::Elements(*waiters as u64));
        group.bench_with_input(BenchmarkId::from_parameter(waiters), waiters, |b, &waiters| {
            b.iter(|| {
                let engine = seeded_engine(waiters + 1, 1);
                let now = start();
                let mut loan = engine.borrow(MemberId(1), CopyId(1), now).unwrap();
                for m in 2..=waiters + 1 {
                    engine.reserve(MemberId(m), TitleId(1), now).unwrap();
                }

                let mut t = now;
                while let Some(member) = engine.return_loan(loan, t).unwrap().offered_to {
                    t += Duration::hours(1);
                    loan = engine.borrow(member, CopyId(1), t).unwrap();
                }
                black_box(&engine);
            })
        });
    }
    group.finish();
}

fn bench_accrual_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("accrual_sweep");

    for loans in [100u32, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*loans as u64));
        group.bench_with_input(BenchmarkId::from_parameter(loans), loans, |b, &loans| {
            let engine = seeded_engine(loans, loans);
            let now = start();
            for i in 1..=loans {
                engine.borrow(MemberId(i), CopyId(i), now).unwrap();
            }
            // Everything overdue
            let sweep_at = now + Duration::days(30);
            b.iter(|| {
                black_box(engine.accrue_fines(black_box(sweep_at)));
            })
        });
    }
    group.finish();
}

// =============================================================================
// Multi-Threaded Benchmarks
// =============================================================================

fn bench_parallel_borrow_return(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_borrow_return");

    for count in [1_000u32, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let engine = Arc::new(seeded_engine(count, count));
                let now = start();

                (1..=count).into_par_iter().for_each(|i| {
                    let loan = engine.borrow(MemberId(i), CopyId(i), now).unwrap();
                    engine.return_loan(loan, now + Duration::days(1)).unwrap();
                });

                black_box(&engine);
            })
        });
    }
    group.finish();
}

fn bench_copy_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_contention");
    let total_ops = 10_000u32;

    // Fewer copies = more threads racing the same compare-and-set
    for copies in [1u32, 10, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(total_ops as u64));
        group.bench_with_input(BenchmarkId::new("copies", copies), copies, |b, &copies| {
            b.iter(|| {
                let engine = Arc::new(seeded_engine(total_ops, copies));
                let now = start();

                (1..=total_ops).into_par_iter().for_each(|i| {
                    let copy = CopyId(i % copies + 1);
                    if let Ok(loan) = engine.borrow(MemberId(i), copy, now) {
                        let _ = engine.return_loan(loan, now + Duration::days(1));
                    }
                });

                black_box(&engine);
            })
        });
    }
    group.finish();
}

// =============================================================================
// Criterion Groups
// =============================================================================

criterion_group!(
    single_threaded,
    bench_borrow_return_cycle,
    bench_borrow_throughput,
    bench_reservation_cascade,
    bench_accrual_sweep,
);

criterion_group!(
    multi_threaded,
    bench_parallel_borrow_return,
    bench_copy_contention,
);

criterion_main!(single_threaded, multi_threaded);
