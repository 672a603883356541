// ============================================================================
// SAMPLING CONTROLLER
// ============================================================================
// Decides when a metric is due for its next sample. Three inputs shape the
// effective interval:
//   - the adaptive interval, tightened for volatile metrics and relaxed for
//     stable ones once per adaptation interval
//   - age-based downsampling rules, where age is the time since the
//     controller first saw the metric
//   - the configured [min, max] bounds
// ============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use ahash::RandomState;
use compact_str::CompactString;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::{DownsamplingRule, SamplingConfig};
use crate::stats::StatisticalFunctions;
use crate::types::Timestamp;

/// Per-metric sampling bookkeeping
#[derive(Debug, Clone)]
pub struct SamplingState {
    pub current_interval: Duration,
    pub last_sample_time: Timestamp,
    pub first_seen: Timestamp,
    pub last_adaptation: Timestamp,
    pub recent_values: VecDeque<f64>,
}

/// Whether a sample may be recorded now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingDecision {
    Sample,
    NotDue { next_due: Timestamp },
}

impl SamplingDecision {
    pub fn is_due(&self) -> bool {
        matches!(self, SamplingDecision::Sample)
    }
}

/// Interval slot reserved by [`SamplingController::admit`]. The caller
/// either commits it with the stored value or releases it when the sample
/// could not be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleTicket {
    metric: CompactString,
    at: Timestamp,
    previous: Timestamp,
}

/// Outcome of [`SamplingController::admit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted(SampleTicket),
    NotDue { next_due: Timestamp },
}

impl Admission {
    pub fn is_due(&self) -> bool {
        matches!(self, Admission::Granted(_))
    }
}

/// Result of one adaptive adjustment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adaptation {
    #[serde(with = "humantime_serde")]
    pub previous: Duration,
    #[serde(with = "humantime_serde")]
    pub current: Duration,
    pub coefficient_of_variation: f64,
}

pub struct SamplingController {
    config: SamplingConfig,
    rules: Vec<DownsamplingRule>,
    states: DashMap<CompactString, SamplingState, RandomState>,
}

impl SamplingController {
    pub fn new(config: SamplingConfig) -> Self {
        let mut rules = config.downsampling.clone();
        rules.sort_by_key(|r| r.age);
        Self {
            config,
            rules,
            states: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Downsampling rules ordered by ascending age
    pub fn downsampling_rules(&self) -> &[DownsamplingRule] {
        &self.rules
    }

    /// Interval of the rule with the greatest age threshold not exceeding `age`
    pub fn rule_interval_for_age(&self, age: Duration) -> Option<Duration> {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.age <= age)
            .map(|rule| rule.interval)
    }

    fn effective_interval(&self, state: &SamplingState, now: Timestamp) -> Duration {
        let age = now.duration_since(state.first_seen);
        match self.rule_interval_for_age(age) {
            Some(rule) => state.current_interval.max(rule),
            None => state.current_interval,
        }
    }

    fn decide(&self, state: &SamplingState, now: Timestamp) -> SamplingDecision {
        // Late arrivals fill a gap behind the newest sample and never
        // count against the interval.
        if now < state.last_sample_time {
            return SamplingDecision::Sample;
        }
        let interval = self.effective_interval(state, now);
        if now.duration_since(state.last_sample_time) >= interval {
            SamplingDecision::Sample
        } else {
            SamplingDecision::NotDue {
                next_due: state.last_sample_time.add_duration(interval),
            }
        }
    }

    /// Check without recording. Metrics never seen before are always due.
    pub fn check(&self, metric: &str, now: Timestamp) -> SamplingDecision {
        match self.states.get(metric) {
            Some(state) => self.decide(&state, now),
            None => SamplingDecision::Sample,
        }
    }

    /// `true` when `now - lastSampleTime >= effective interval`
    pub fn should_sample(&self, metric: &str, now: Timestamp) -> bool {
        self.check(metric, now).is_due()
    }

    /// Record a sample taken at `at`
    pub fn record(&self, metric: &str, value: f64, at: Timestamp) {
        let capacity = self.config.recent_values_capacity;
        let mut state = self
            .states
            .entry(CompactString::from(metric))
            .or_insert_with(|| self.fresh_state(at));
        if at > state.last_sample_time {
            state.last_sample_time = at;
        }
        push_bounded(&mut state.recent_values, value, capacity);
    }

    /// Reserve the interval slot for a sample taken at `at`. The check and
    /// the reservation happen under one entry lock, so concurrent producers
    /// of one metric cannot both pass the same interval. `last_sample_time`
    /// only moves forward.
    pub fn admit(&self, metric: &str, at: Timestamp) -> Admission {
        let mut entry = self
            .states
            .entry(CompactString::from(metric))
            .or_insert_with(|| {
                let mut state = self.fresh_state(at);
                // Guarantees the first sample is due.
                state.last_sample_time = Timestamp::EPOCH;
                state
            });

        match self.decide(&entry, at) {
            SamplingDecision::Sample => {
                let previous = entry.last_sample_time;
                if at > previous {
                    entry.last_sample_time = at;
                }
                Admission::Granted(SampleTicket {
                    metric: CompactString::from(metric),
                    at,
                    previous,
                })
            }
            SamplingDecision::NotDue { next_due } => Admission::NotDue { next_due },
        }
    }

    /// The reserved sample was stored: feed its value to the volatility window
    pub fn commit(&self, ticket: SampleTicket, value: f64) {
        let capacity = self.config.recent_values_capacity;
        if let Some(mut state) = self.states.get_mut(ticket.metric.as_str()) {
            push_bounded(&mut state.recent_values, value, capacity);
        }
    }

    /// The reserved sample was dropped: hand the slot back unless a later
    /// sample has been admitted since
    pub fn release(&self, ticket: SampleTicket) {
        if let Some(mut state) = self.states.get_mut(ticket.metric.as_str()) {
            if state.last_sample_time == ticket.at && ticket.at > ticket.previous {
                state.last_sample_time = ticket.previous;
            }
        }
    }

    fn fresh_state(&self, at: Timestamp) -> SamplingState {
        SamplingState {
            current_interval: self.config.base_interval,
            last_sample_time: at,
            first_seen: at,
            last_adaptation: at,
            recent_values: VecDeque::with_capacity(self.config.recent_values_capacity),
        }
    }

    /// Adjust one metric's interval from the volatility of its recent values.
    /// Acts only once `adaptation_interval` has elapsed since the last
    /// adjustment and at least two values are buffered.
    pub fn adapt(&self, metric: &str, now: Timestamp) -> Option<Adaptation> {
        if !self.config.adaptive {
            return None;
        }
        let mut state = self.states.get_mut(metric)?;
        self.adapt_state(metric, &mut state, now)
    }

    fn adapt_state(&self, metric: &str, state: &mut SamplingState, now: Timestamp) -> Option<Adaptation> {
        if now.duration_since(state.last_adaptation) < self.config.adaptation_interval {
            return None;
        }
        if state.recent_values.len() < 2 {
            return None;
        }

        let values: Vec<f64> = state.recent_values.iter().copied().collect();
        let cv = StatisticalFunctions::coefficient_of_variation(&values);
        let previous = state.current_interval;
        let step = self.config.adjustment_step;

        let next = if cv > self.config.variation_threshold {
            previous.mul_f64(1.0 - step).max(self.config.min_interval)
        } else {
            previous.mul_f64(1.0 + step).min(self.config.max_interval)
        };

        state.current_interval = next;
        state.last_adaptation = now;

        trace!(
            target: "pulse::sampling",
            metric,
            cv,
            previous_ms = previous.as_millis() as u64,
            current_ms = next.as_millis() as u64,
            "Sampling interval adapted"
        );

        Some(Adaptation {
            previous,
            current: next,
            coefficient_of_variation: cv,
        })
    }

    /// Adapt every tracked metric; returns how many were adjusted
    pub fn adapt_all(&self, now: Timestamp) -> usize {
        if !self.config.adaptive {
            return 0;
        }
        let mut adjusted = 0;
        for mut entry in self.states.iter_mut() {
            let (metric, state) = entry.pair_mut();
            if self.adapt_state(metric, state, now).is_some() {
                adjusted += 1;
            }
        }
        adjusted
    }

    /// Drop state for metrics silent longer than `idle_timeout`
    pub fn evict_idle(&self, now: Timestamp) -> usize {
        let before = self.states.len();
        let idle = self.config.idle_timeout;
        self.states
            .retain(|_, state| now.duration_since(state.last_sample_time) <= idle);
        let evicted = before.saturating_sub(self.states.len());
        if evicted > 0 {
            debug!(target: "pulse::sampling", evicted, "Evicted idle sampling state");
        }
        evicted
    }

    pub fn current_interval(&self, metric: &str) -> Option<Duration> {
        self.states.get(metric).map(|s| s.current_interval)
    }

    pub fn state(&self, metric: &str) -> Option<SamplingState> {
        self.states.get(metric).map(|s| s.clone())
    }

    pub fn tracked_metrics(&self) -> usize {
        self.states.len()
    }
}

fn push_bounded(ring: &mut VecDeque<f64>, value: f64, capacity: usize) {
    if ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(value);
}
