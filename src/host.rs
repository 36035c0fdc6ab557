// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, RwLock};

use crate::connection::Conn;
use crate::driver::Driver;
use crate::error::Error;
use crate::metrics::Statter;
use crate::pool::Pool;

/// Canonical score for a host that failed outright.
pub const HOST_DOWN: f64 = 0.0;
/// Canonical score for a host that performed flawlessly.
pub const HOST_UP: f64 = 1.0;

// Number of decay windows contributing to a host score.
pub(crate) const SERIES_NUM: usize = 60;

/// Applies a final transform to a freshly aggregated host score, e.g. an
/// exponential or logarithmic shaping function.
pub trait ScoreCalculator: Send + Sync {
    fn compute(&self, score: f64) -> f64;
}

// Arithmetic mean of the scores observed during one decay window.
#[derive(Clone, Copy, Debug, Default)]
struct Serie {
    score: f64,
    trials: u32,
}

impl Serie {
    fn update(&mut self, score: f64) {
        self.trials += 1;
        self.score += (score - self.score) / f64::from(self.trials);
    }

    fn reset(&mut self) {
        self.score = 0.0;
        self.trials = 0;
    }
}

struct HostState {
    series: Vec<Serie>,
    slot: usize,
    score: f64,
}

struct HostInner<D: Driver> {
    pool: Pool<D>,
    state: RwLock<HostState>,
    stats: Statter,
}

/// A remote peer, referred to by its address, owning one connection pool
/// and a rolling time series summarising its recent behaviour.
///
/// `Host` is a cheaply clonable handle; clones refer to the same peer.
pub struct Host<D: Driver> {
    inner: Arc<HostInner<D>>,
}

impl<D: Driver> Clone for Host<D> {
    fn clone(&self) -> Self {
        Host {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> Host<D> {
    pub(crate) fn new(pool: Pool<D>, stats: Statter) -> Host<D> {
        let mut series = Vec::with_capacity(SERIES_NUM);
        series.push(Serie::default());
        Host {
            inner: Arc::new(HostInner {
                pool,
                state: RwLock::new(HostState {
                    series,
                    slot: 0,
                    score: -1.0,
                }),
                stats,
            }),
        }
    }

    /// The memoized score of the host, or -1 if it has not been computed
    /// yet (see the service's memoize duration).
    pub fn score(&self) -> f64 {
        self.inner.state.read().unwrap().score
    }

    pub(crate) fn set_score(&self, score: f64) {
        self.inner.state.write().unwrap().score = score;
    }

    pub(crate) fn pool(&self) -> &Pool<D> {
        &self.inner.pool
    }

    // Shifts the current decay window, growing the ring until it reaches
    // its full depth and recycling the oldest slot afterwards.
    pub(crate) fn decay(&self) {
        let mut state = self.inner.state.write().unwrap();
        state.slot = (state.slot + 1) % SERIES_NUM;
        if state.series.len() < SERIES_NUM {
            state.series.push(Serie::default());
        } else {
            let slot = state.slot;
            state.series[slot].reset();
        }
    }

    // Records a score observation in the current decay window.
    pub(crate) fn rate(&self, score: f64) {
        let mut state = self.inner.state.write().unwrap();
        let slot = state.slot;
        state.series[slot].update(score);
    }

    // Aggregates the series into a single memoized score. Each window is
    // weighted by its age, oldest first with the smallest weight; the
    // weights sum to one. Windows with no recorded trials contribute a
    // neutral 0.5 so a host without evidence is neither promoted nor
    // demoted.
    pub(crate) fn compute_score(&self, calc: Option<&dyn ScoreCalculator>) {
        let mut state = self.inner.state.write().unwrap();
        let n = state.series.len();
        let m = (n * (1 + n) / 2) as f64;
        let mut score = 0.0;

        for i in 1..=n {
            let t = (state.slot + i) % n;
            let weight = i as f64 / m;
            if state.series[t].trials > 0 {
                score += state.series[t].score * weight;
            } else {
                score += 0.5 * weight;
            }
        }
        if let Some(calc) = calc {
            score = calc.compute(score);
        }
        state.score = score;
    }

    // Returns the connection to the pool and folds the outcome into the
    // host's series: a fatal put rates the host down, anything else rates
    // it with the caller's verdict.
    pub(crate) fn release_conn(
        &self,
        conn: Conn<D>,
        err: Option<&D::Error>,
        score: f64,
    ) -> Result<(), Error> {
        if let Some(elapsed) = conn.checkout_elapsed() {
            self.inner
                .stats
                .timing("conns.active.period", elapsed.as_millis() as i64);
        }
        self.inner.stats.inc("conns.put.count", 1);

        let down = self.inner.pool.put(conn, err)?;
        if down {
            self.rate(HOST_DOWN);
        } else {
            self.rate(score);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::TcpDriver;
    use crate::pool::types::PoolOptions;

    fn host() -> Host<TcpDriver> {
        let options = PoolOptions::new(Arc::new(TcpDriver::new()));
        Host::new(Pool::new("localhost:7357", options), Statter::NOOP)
    }

    #[test]
    fn serie_tracks_a_running_mean() {
        let mut serie = Serie::default();
        serie.update(1.0);
        serie.update(0.0);
        serie.update(0.5);
        assert_eq!(serie.trials, 3);
        assert!((serie.score - 0.5).abs() < 1e-12);

        serie.reset();
        assert_eq!(serie.trials, 0);
        assert_eq!(serie.score, 0.0);
    }

    #[test]
    fn score_starts_undefined() {
        assert_eq!(host().score(), -1.0);
    }

    #[test]
    fn decay_grows_the_ring_then_recycles() {
        let h = host();
        for _ in 0..SERIES_NUM - 1 {
            h.decay();
        }
        {
            let state = h.inner.state.read().unwrap();
            assert_eq!(state.series.len(), SERIES_NUM);
            assert_eq!(state.slot, SERIES_NUM - 1);
        }
        // The ring is full; the next shift wraps and recycles slot zero.
        h.rate(1.0);
        h.decay();
        let state = h.inner.state.read().unwrap();
        assert_eq!(state.series.len(), SERIES_NUM);
        assert_eq!(state.slot, 0);
        assert_eq!(state.series[0].trials, 0);
    }

    #[test]
    fn compute_score_weights_recent_windows_highest() {
        let h = host();
        h.rate(0.6);
        h.decay();
        h.rate(0.3);
        h.decay();
        h.rate(1.0);
        h.compute_score(None);
        // n = 3, m = 6: 1*0.6/6 + 2*0.3/6 + 3*1.0/6
        assert!((h.score() - 0.7).abs() < 1e-12);
    }

    #[test]
    fn windows_without_trials_stay_neutral() {
        let h = host();
        h.decay();
        h.decay();
        h.compute_score(None);
        assert!((h.score() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn calculator_shapes_the_final_score() {
        struct Halve;
        impl ScoreCalculator for Halve {
            fn compute(&self, score: f64) -> f64 {
                score / 2.0
            }
        }
        let h = host();
        h.rate(1.0);
        h.compute_score(Some(&Halve));
        assert!((h.score() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rating_down_dominates_a_single_window() {
        let h = host();
        h.rate(HOST_UP);
        h.rate(HOST_DOWN);
        h.rate(HOST_DOWN);
        h.compute_score(None);
        assert!(h.score() < 0.5);
    }
}
