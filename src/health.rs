//! Link health classification with hysteresis.
//!
//! Thresholds are relative to the expected period of the signal, so a 1 Hz
//! heartbeat and a 30 Hz sensor stream get proportionate tolerances.
//!
//! | state  | entered when (from a better state)  | left for `Ok` when           |
//! |--------|-------------------------------------|------------------------------|
//! | `Ok`   | age < max(margin, recovery floor)   | -                            |
//! | `Warn` | age > ok_factor * P + margin        | age < max(margin, floor)     |
//! | `Lost` | age > warn_factor * P + margin      | age < max(margin, floor)     |
//!
//! where `margin = hysteresis * P`. The recovery window is checked first,
//! so for fast signals the floor also lifts the downgrade thresholds. Without
//! a previous state the plain thresholds apply.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Operator-facing link state, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkStatus {
    Ok,
    Warn,
    Lost,
    NoData,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LinkStatus::Ok => "OK",
            LinkStatus::Warn => "WARN",
            LinkStatus::Lost => "LOST",
            LinkStatus::NoData => "NO DATA",
        };
        f.write_str(text)
    }
}

/// Period-relative thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub ok_factor: f64,
    pub warn_factor: f64,
    /// Margin as a fraction of the period.
    pub hysteresis: f64,
    /// Lower bound on the recovery window, so fast signals can still recover
    /// when sampled by a slower console tick.
    pub recovery_floor: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self { ok_factor: 1.35, warn_factor: 3.25, hysteresis: 0.2, recovery_floor: Duration::from_millis(250) }
    }
}

impl HealthThresholds {
    fn limits(&self, period: Duration) -> (f64, f64, f64) {
        let p = period.as_secs_f64();
        (self.ok_factor * p, self.warn_factor * p, self.hysteresis * p)
    }

    /// Classification without history.
    pub fn plain(&self, age: Duration, period: Duration) -> LinkStatus {
        let (ok, warn, _) = self.limits(period);
        let age = age.as_secs_f64();
        if age < ok {
            LinkStatus::Ok
        } else if age < warn {
            LinkStatus::Warn
        } else {
            LinkStatus::Lost
        }
    }
}

/// Classify an activity age given the previously displayed state.
pub fn classify(
    age: Option<Duration>,
    period: Duration,
    previous: Option<LinkStatus>,
    thresholds: &HealthThresholds,
) -> LinkStatus {
    let Some(age) = age else {
        return LinkStatus::NoData;
    };
    let previous = match previous {
        None | Some(LinkStatus::NoData) => return thresholds.plain(age, period),
        Some(state) => state,
    };

    let (ok, warn, margin) = thresholds.limits(period);
    let secs = age.as_secs_f64();

    if secs < margin.max(thresholds.recovery_floor.as_secs_f64()) {
        return LinkStatus::Ok;
    }
    if secs > warn + margin {
        return LinkStatus::Lost;
    }
    if secs > ok + margin {
        return previous.max(LinkStatus::Warn);
    }
    previous
}

/// Exponentially smoothed estimate of a signal's inter-arrival period.
#[derive(Debug, Clone)]
pub struct PeriodEstimate {
    alpha: f64,
    max_gap: Duration,
    period: Duration,
    last: Option<Instant>,
}

impl Default for PeriodEstimate {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl PeriodEstimate {
    pub fn new(seed: Duration) -> Self {
        Self { alpha: 0.2, max_gap: Duration::from_secs(10), period: seed, last: None }
    }

    /// Record an arrival. Gaps longer than the restart bound are not averaged in.
    pub fn observe(&mut self, at: Instant) {
        if let Some(last) = self.last {
            let gap = at.saturating_duration_since(last);
            if !gap.is_zero() && gap <= self.max_gap {
                let smoothed = self.alpha * gap.as_secs_f64() + (1.0 - self.alpha) * self.period.as_secs_f64();
                self.period = Duration::from_secs_f64(smoothed);
            }
        }
        self.last = Some(at);
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn last(&self) -> Option<Instant> {
        self.last
    }
}

/// Last activity time and expected period of one signal source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkHealthSample {
    pub last_activity: Option<Instant>,
    pub nominal_period: Duration,
}

impl LinkHealthSample {
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.last_activity.map(|at| now.saturating_duration_since(at))
    }
}

/// Remembers the displayed state of one signal so classification can apply hysteresis.
#[derive(Debug, Clone, Default)]
pub struct HealthTracker {
    thresholds: HealthThresholds,
    current: Option<LinkStatus>,
}

impl HealthTracker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds, current: None }
    }

    pub fn update(&mut self, sample: LinkHealthSample, now: Instant) -> LinkStatus {
        let status = classify(sample.age(now), sample.nominal_period, self.current, &self.thresholds);
        self.current = Some(status);
        status
    }

    pub fn current(&self) -> Option<LinkStatus> {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn plain_thresholds_scale_with_period() {
        let t = HealthThresholds::default();
        assert_eq!(t.plain(secs(1.0), secs(1.0)), LinkStatus::Ok);
        assert_eq!(t.plain(secs(1.0), secs(0.1)), LinkStatus::Lost);
        assert_eq!(t.plain(secs(0.2), secs(0.1)), LinkStatus::Warn);
        assert_eq!(classify(None, secs(1.0), Some(LinkStatus::Ok), &t), LinkStatus::NoData);
    }

    #[test]
    fn missed_sample_does_not_flap() {
        let t = HealthThresholds::default();
        let mut previous = None;
        let mut seen = Vec::new();
        for age in [0.4, 1.6, 0.95, 1.6, 0.95] {
            let status = classify(Some(secs(age)), secs(1.0), previous, &t);
            seen.push(status);
            previous = Some(status);
        }
        assert_eq!(seen[0], LinkStatus::Ok);
        assert_eq!(seen[1], LinkStatus::Warn);
        assert_eq!(&seen[2..], &[LinkStatus::Warn, LinkStatus::Warn, LinkStatus::Warn]);
    }

    #[test]
    fn downgrade_needs_margin() {
        let t = HealthThresholds::default();
        // 1.4 s is past the 1.35 s threshold but inside the 0.2 s margin.
        assert_eq!(classify(Some(secs(1.4)), secs(1.0), Some(LinkStatus::Ok), &t), LinkStatus::Ok);
        assert_eq!(classify(Some(secs(3.3)), secs(1.0), Some(LinkStatus::Warn), &t), LinkStatus::Warn);
        assert_eq!(classify(Some(secs(3.5)), secs(1.0), Some(LinkStatus::Warn), &t), LinkStatus::Lost);
    }

    #[test]
    fn fresh_activity_recovers_immediately() {
        let t = HealthThresholds::default();
        assert_eq!(classify(Some(secs(0.05)), secs(1.0), Some(LinkStatus::Lost), &t), LinkStatus::Ok);
        // Fast signals use the floor rather than a tiny margin.
        assert_eq!(classify(Some(secs(0.1)), secs(0.033), Some(LinkStatus::Warn), &t), LinkStatus::Ok);
        assert_eq!(classify(Some(secs(0.2)), secs(0.033), Some(LinkStatus::Lost), &t), LinkStatus::Ok);
        assert_eq!(classify(Some(secs(0.3)), secs(0.033), Some(LinkStatus::Ok), &t), LinkStatus::Lost);
    }

    #[tokio::test(start_paused = true)]
    async fn period_estimate_smooths_and_ignores_restarts() {
        let mut estimate = PeriodEstimate::default();
        let start = Instant::now();
        estimate.observe(start);
        estimate.observe(start + secs(0.5));
        assert!((estimate.period().as_secs_f64() - 0.9).abs() < 1e-6);

        estimate.observe(start + secs(30.0));
        assert!((estimate.period().as_secs_f64() - 0.9).abs() < 1e-6);
        assert_eq!(estimate.last(), Some(start + secs(30.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_remembers_state() {
        let mut tracker = HealthTracker::default();
        let now = Instant::now();
        let sample = |age: f64| LinkHealthSample { last_activity: Some(now - secs(age)), nominal_period: secs(1.0) };
        assert_eq!(tracker.update(LinkHealthSample { last_activity: None, nominal_period: secs(1.0) }, now), LinkStatus::NoData);
        assert_eq!(tracker.update(sample(2.0), now), LinkStatus::Warn);
        assert_eq!(tracker.update(sample(1.0), now), LinkStatus::Warn);
        assert_eq!(tracker.update(sample(0.1), now), LinkStatus::Ok);
        assert_eq!(tracker.current(), Some(LinkStatus::Ok));
    }

    proptest! {
        #[test]
        fn alternating_ages_never_flip_every_sample(
            period in 1.25f64..5.0,
            low in 0.3f64..1.3,
            high in 1.6f64..3.0,
            rounds in 2usize..10,
        ) {
            let t = HealthThresholds::default();
            let mut previous = None;
            let mut changes = 0;
            let mut samples = 0;
            for _ in 0..rounds {
                for factor in [high, low] {
                    let status = classify(Some(secs(factor * period)), secs(period), previous, &t);
                    if previous.is_some_and(|p| p != status) {
                        changes += 1;
                    }
                    previous = Some(status);
                    samples += 1;
                }
            }
            prop_assert!(changes < samples - 1);
        }

        #[test]
        fn classification_is_monotonic_in_age(period in 0.05f64..5.0, a in 0.0f64..20.0, b in 0.0f64..20.0) {
            let t = HealthThresholds::default();
            let (young, old) = if a <= b { (a, b) } else { (b, a) };
            for previous in [None, Some(LinkStatus::Ok), Some(LinkStatus::Warn), Some(LinkStatus::Lost)] {
                let s_young = classify(Some(secs(young)), secs(period), previous, &t);
                let s_old = classify(Some(secs(old)), secs(period), previous, &t);
                prop_assert!(s_young <= s_old);
            }
        }
    }
}
