//! Randomized operation sequences checked against the scheduler's structural invariants.

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use csz_qdisc::band::Band;
use csz_qdisc::clock::ManualClock;
use csz_qdisc::scheduler::{FlowSnapshot, VirtualTime};
use csz_qdisc::{CszConfig, CszScheduler, FlowId, FlowParams, FlowSelector, Rate, ShaperConfig};

const SEEDS: [u64; 4] = [1, 7, 42, 0xc5a];
const STEPS: usize = 4000;

fn config() -> CszConfig {
    CszConfig::new(5, 3)
        .with_link_rate(1_000_000)
        .with_default_flow(FlowParams::new(Rate::from_ratio(1, 8), 8000))
        .with_flow(1, FlowParams::new(Rate::from_ratio(1, 4), 8000))
        .with_flow(2, FlowParams::new(Rate::from_ratio(1, 2), 8000))
        .with_flow(
            3,
            FlowParams::new(Rate::from_ratio(1, 8), 8000).with_shaper(ShaperConfig {
                rate: 200_000,
                burst: 3000,
            }),
        )
}

fn random_selector(rng: &mut StdRng) -> FlowSelector {
    // Slot 4 is left unconfigured on purpose.
    match rng.gen_range(0..6) {
        0 => FlowSelector::Default(Band::ALL[rng.gen_range(0..4)]),
        n => FlowSelector::Guaranteed(FlowId::new(n.min(4) as u8).unwrap()),
    }
}

struct Checker {
    rates: HashMap<FlowId, u64>,
}

impl Checker {
    fn new(scheduler: &CszScheduler<Vec<u8>>) -> Self {
        let rates = scheduler
            .stats()
            .flows
            .iter()
            .map(|flow| (flow.id, flow.rate.map_or(0, |rate| rate.raw() as u64)))
            .collect();
        Self { rates }
    }

    fn check(&self, scheduler: &CszScheduler<Vec<u8>>) {
        let round = scheduler.round_number();
        let snapshots = scheduler.flow_snapshots();
        let mut backlog = 0;
        let mut aggregate = 0;
        for s in &snapshots {
            backlog += s.backlog_packets;
            let backlogged = s.backlog_packets > 0;
            assert_eq!(
                backlogged,
                s.in_start_index || s.throttled,
                "backlogged flows are eligible or throttled: {s:?}"
            );
            assert!(!(s.in_start_index && s.throttled), "{s:?}");
            if backlogged {
                assert!(!s.start.is_ahead_of(s.finish), "start after finish: {s:?}");
            }
            assert_eq!(s.active, s.in_finish_index, "{s:?}");
            if s.in_finish_index {
                assert!(s.finish.is_ahead_of(round), "active flow already finished: {s:?}");
                aggregate += self.rates[&s.id];
            }
            if !s.configured {
                assert_eq!(s.backlog_packets, 0);
            }
        }
        assert_eq!(backlog, scheduler.len());
        assert_eq!(aggregate, scheduler.aggregate_rate());
    }
}

#[test]
fn random_operations_preserve_invariants() {
    for seed in SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let clock = ManualClock::new();
        let mut scheduler: CszScheduler<Vec<u8>> =
            CszScheduler::new(config(), clock.clone()).unwrap();
        let checker = Checker::new(&scheduler);
        let mut last_round = scheduler.round_number();

        for _ in 0..STEPS {
            match rng.gen_range(0..100) {
                0..=44 => {
                    let selector = random_selector(&mut rng);
                    let len = rng.gen_range(1..=1500);
                    let before: Vec<FlowSnapshot> = scheduler.flow_snapshots();
                    let round = scheduler.round_number();
                    let queued = scheduler.len();
                    if !scheduler.enqueue(vec![0; len], selector).is_accepted() {
                        assert_eq!(scheduler.flow_snapshots(), before, "drop changed state");
                        assert_eq!(scheduler.round_number(), round);
                        assert_eq!(scheduler.len(), queued);
                    } else {
                        assert_eq!(scheduler.len(), queued + 1);
                    }
                }
                45..=84 => {
                    let queued = scheduler.len();
                    match scheduler.dequeue() {
                        Some(_) => assert_eq!(scheduler.len(), queued - 1),
                        None => assert!(
                            queued == 0 || scheduler.next_wakeup().is_some(),
                            "nothing sent although {queued} packets are eligible"
                        ),
                    }
                }
                85..=98 => {
                    clock.advance(Duration::from_micros(rng.gen_range(0..2000)));
                    scheduler.advance_round();
                }
                _ => {
                    scheduler.reset();
                    assert!(scheduler.is_empty());
                    assert_eq!(scheduler.round_number(), VirtualTime::ZERO);
                    last_round = VirtualTime::ZERO;
                }
            }

            let round = scheduler.round_number();
            assert!(round.is_at_or_after(last_round), "round went backwards");
            last_round = round;
            checker.check(&scheduler);
        }

        assert_eq!(scheduler.stats().clock_faults, 0, "seed {seed}");
    }
}

#[test]
fn reset_restores_initial_snapshots() {
    let mut rng = StdRng::seed_from_u64(99);
    let clock = ManualClock::new();
    let mut scheduler: CszScheduler<Vec<u8>> = CszScheduler::new(config(), clock.clone()).unwrap();
    let initial = scheduler.flow_snapshots();

    for _ in 0..500 {
        let selector = random_selector(&mut rng);
        let _ = scheduler.enqueue(vec![0; rng.gen_range(1..=1500)], selector);
        if rng.gen_bool(0.3) {
            scheduler.dequeue();
        }
        clock.advance(Duration::from_micros(rng.gen_range(0..200)));
    }
    assert!(!scheduler.is_empty());

    scheduler.reset();
    assert_eq!(scheduler.flow_snapshots(), initial);
    assert_eq!(scheduler.aggregate_rate(), 0);
    assert_eq!(scheduler.next_wakeup(), None);
}

#[test]
fn every_admitted_packet_is_eventually_sent() {
    let mut rng = StdRng::seed_from_u64(5);
    let clock = ManualClock::new();
    let mut scheduler: CszScheduler<Vec<u8>> = CszScheduler::new(config(), clock.clone()).unwrap();

    let mut admitted = 0usize;
    for _ in 0..300 {
        let selector = random_selector(&mut rng);
        if scheduler
            .enqueue(vec![0; rng.gen_range(1..=1500)], selector)
            .is_accepted()
        {
            admitted += 1;
        }
    }

    let mut sent = 0usize;
    while sent < admitted {
        match scheduler.dequeue() {
            Some(_) => sent += 1,
            None => {
                let wakeup = scheduler
                    .next_wakeup()
                    .expect("a backlog with nothing eligible must be throttled");
                clock.set(wakeup);
            }
        }
    }
    assert!(scheduler.is_empty());
    assert_eq!(scheduler.dequeue(), None);
}
