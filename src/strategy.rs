// Copyright 2020 Joyent, Inc.

use std::collections::BTreeMap;
use std::sync::Mutex;

use rand::Rng;

use crate::driver::Driver;
use crate::host::Host;

/// A multi-armed bandit policy for choosing among the hosts of a service.
///
/// The tradeoff faced at each acquisition is between *exploitation* (pick
/// the host with the highest score) and *exploration* (learn about the
/// expected score of the other hosts). Strategies differ in how they
/// balance the two: some favor fairness, others favor picking hosts based
/// on how well they perform.
///
/// `select` is invoked under the service's shared host-map lock and must be
/// safe for concurrent callers; it is never given an empty map.
pub trait Strategy<D: Driver>: Send + Sync {
    /// Choose a host among the ones registered in the service.
    fn select<'a>(
        &self,
        hosts: &'a BTreeMap<String, Host<D>>,
    ) -> Option<&'a Host<D>>;

    /// Whether the strategy consumes host scores. The service skips the
    /// decay and memoization tickers for strategies that do not.
    fn uses_scores(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct RoundRobinState {
    next_schedule: i64,
    next_avail_slot: i64,
}

/// Selects hosts in a circular manner, every request returning the next
/// host in line. Scores are ignored.
#[derive(Debug, Default)]
pub struct RoundRobin {
    state: Mutex<RoundRobinState>,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin::default()
    }
}

impl<D: Driver> Strategy<D> for RoundRobin {
    // The score field is unused under round robin, so it doubles as the
    // host's scheduling slot: hosts without a slot are handed the next free
    // ordinal, and removed slots are skipped by the modular search for the
    // closest slot at or after the schedule cursor.
    fn select<'a>(
        &self,
        hosts: &'a BTreeMap<String, Host<D>>,
    ) -> Option<&'a Host<D>> {
        let mut state = self.state.lock().unwrap();
        let mut offset: i64 = 0;
        let mut found = false;
        let mut selected = None;

        for host in hosts.values() {
            if host.score() < 0.0 {
                host.set_score(state.next_avail_slot as f64);
                state.next_avail_slot += 1;
            }
            let slot = host.score() as i64;
            if slot == state.next_schedule {
                offset = 1;
                selected = Some(host);
                found = true;
            }
            if !found {
                let mut o = slot - state.next_schedule;
                if o < 0 {
                    o += state.next_avail_slot;
                }
                if offset == 0 || o < offset {
                    offset = o + 1;
                    selected = Some(host);
                }
            }
        }
        if state.next_avail_slot > 0 {
            state.next_schedule =
                (state.next_schedule + offset) % state.next_avail_slot;
        }
        selected
    }

    fn uses_scores(&self) -> bool {
        false
    }
}

/// Selects the host with the highest score most of the time, but every once
/// in a while explores a host picked uniformly at random.
///
/// `epsilon` in [0, 1] is the proportion of acquisitions spent exploring,
/// e.g. 1 for 100%.
#[derive(Debug)]
pub struct EpsilonGreedy {
    epsilon: f32,
}

impl EpsilonGreedy {
    pub fn new(epsilon: f32) -> Self {
        EpsilonGreedy { epsilon }
    }
}

impl<D: Driver> Strategy<D> for EpsilonGreedy {
    fn select<'a>(
        &self,
        hosts: &'a BTreeMap<String, Host<D>>,
    ) -> Option<&'a Host<D>> {
        let mut rng = rand::thread_rng();
        if rng.gen::<f32>() > self.epsilon {
            // Exploit: highest score wins, ties going to the host seen last.
            let mut max = f64::MIN;
            let mut selected = None;
            for host in hosts.values() {
                let score = host.score();
                if score >= max {
                    max = score;
                    selected = Some(host);
                }
            }
            selected
        } else {
            // Explore: uniform pick.
            let n = rng.gen_range(0..hosts.len());
            hosts.values().nth(n)
        }
    }
}

/// Varies host selection probabilities as a graded function of their
/// estimated scores.
///
/// The temperature tweaks the behavior: a high temperature makes every
/// host nearly equiprobable, a low one favors a greedy selection of the
/// hosts with the highest scores.
#[derive(Debug)]
pub struct Softmax {
    temperature: f32,
}

impl Softmax {
    pub fn new(temperature: f32) -> Self {
        Softmax { temperature }
    }
}

impl<D: Driver> Strategy<D> for Softmax {
    fn select<'a>(
        &self,
        hosts: &'a BTreeMap<String, Host<D>>,
    ) -> Option<&'a Host<D>> {
        let mut sum = 0.0;
        let mut weights = Vec::with_capacity(hosts.len());
        for host in hosts.values() {
            let score = host.score();
            // Hosts with no recorded score carry no weight.
            let weight = if score < 0.0 {
                0.0
            } else {
                (score / f64::from(self.temperature)).exp()
            };
            sum += weight;
            weights.push(weight);
        }

        let p: f64 = rand::thread_rng().gen();
        let mut cumulative = 0.0;
        let mut last = None;
        for (host, weight) in hosts.values().zip(weights) {
            if sum == 0.0 {
                return Some(host);
            }
            cumulative += weight / sum;
            last = Some(host);
            if cumulative > p {
                return Some(host);
            }
        }
        // Rounding can leave the cumulative probability a hair short of
        // one; fall back to the final host rather than selecting nothing.
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Statter;
    use crate::pool::types::PoolOptions;
    use crate::pool::Pool;
    use std::sync::Arc;

    use crate::driver::TcpDriver;

    fn hosts(addrs: &[&str]) -> BTreeMap<String, Host<TcpDriver>> {
        let driver = Arc::new(TcpDriver::new());
        addrs
            .iter()
            .map(|a| {
                let pool = Pool::new(a, PoolOptions::new(Arc::clone(&driver)));
                (a.to_string(), Host::new(pool, Statter::NOOP))
            })
            .collect()
    }

    fn set_scores(hosts: &BTreeMap<String, Host<TcpDriver>>, scores: &[f64]) {
        for (host, score) in hosts.values().zip(scores) {
            host.set_score(*score);
        }
    }

    #[test]
    fn round_robin_cycles_through_hosts() {
        let hosts = hosts(&["a:1", "b:1", "c:1"]);
        let rr = RoundRobin::new();
        let picks: Vec<String> = (0..6)
            .map(|_| {
                let host = Strategy::<TcpDriver>::select(&rr, &hosts).unwrap();
                host.pool().address().to_string()
            })
            .collect();
        assert_eq!(picks, ["a:1", "b:1", "c:1", "a:1", "b:1", "c:1"]);
    }

    #[test]
    fn round_robin_skips_removed_slots() {
        let mut hosts = hosts(&["a:1", "b:1", "c:1"]);
        let rr = RoundRobin::new();
        // Assign slots and advance the schedule past the first host.
        Strategy::<TcpDriver>::select(&rr, &hosts).unwrap();
        hosts.remove("b:1");
        let second = Strategy::<TcpDriver>::select(&rr, &hosts).unwrap();
        assert_eq!(second.score() as i64, 2);
        let third = Strategy::<TcpDriver>::select(&rr, &hosts).unwrap();
        assert_eq!(third.score() as i64, 0);
    }

    #[test]
    fn epsilon_zero_always_exploits() {
        let hosts = hosts(&["a:1", "b:1", "c:1"]);
        set_scores(&hosts, &[0.2, 0.9, 0.4]);
        let greedy = EpsilonGreedy::new(0.0);
        for _ in 0..50 {
            let picked = Strategy::<TcpDriver>::select(&greedy, &hosts).unwrap();
            assert_eq!(picked.score(), 0.9);
        }
    }

    #[test]
    fn epsilon_one_always_explores_within_the_set() {
        let hosts = hosts(&["a:1", "b:1"]);
        set_scores(&hosts, &[0.1, 0.9]);
        let random = EpsilonGreedy::new(1.0);
        for _ in 0..50 {
            assert!(Strategy::<TcpDriver>::select(&random, &hosts).is_some());
        }
    }

    #[test]
    fn exploit_with_no_scores_still_selects() {
        let hosts = hosts(&["a:1", "b:1"]);
        let greedy = EpsilonGreedy::new(0.0);
        assert!(Strategy::<TcpDriver>::select(&greedy, &hosts).is_some());
    }

    #[test]
    fn softmax_without_weights_returns_first_host() {
        let hosts = hosts(&["a:1", "b:1"]);
        // All scores undefined: every weight is zero.
        let softmax = Softmax::new(0.5);
        let picked = Strategy::<TcpDriver>::select(&softmax, &hosts).unwrap();
        assert_eq!(picked.score(), hosts.values().next().unwrap().score());
    }

    #[test]
    fn cold_softmax_is_effectively_greedy() {
        let hosts = hosts(&["a:1", "b:1", "c:1"]);
        set_scores(&hosts, &[0.01, 0.99, 0.02]);
        let softmax = Softmax::new(0.05);
        for _ in 0..100 {
            let picked = Strategy::<TcpDriver>::select(&softmax, &hosts).unwrap();
            assert_eq!(picked.score(), 0.99);
        }
    }
}
