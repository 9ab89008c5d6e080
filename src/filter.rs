//! Rate and noise filter for outbound sensor values
//!
//! Two gates, checked in order:
//! 1. dead-zone: changes smaller than `dead_zone` are noise
//! 2. minimum interval: at most one send per `min_interval_ms`, unless the
//!    un-sent change exceeds `force_send_threshold`
use crate::config::FilterConfig;

/// Last accepted value and send time, owned by the sampling path
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterState {
    last_accepted: Option<f32>,
    last_send_ms: Option<u64>,
    suppressed: u64,
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_accepted(&self) -> Option<f32> {
        self.last_accepted
    }

    pub fn last_send_ms(&self) -> Option<u64> {
        self.last_send_ms
    }

    /// Readings rejected since creation
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// Forget the baseline so the next reading is sent unconditionally
    pub fn reset(&mut self) {
        self.last_accepted = None;
        self.last_send_ms = None;
    }
}

/// Stateless gate over a caller-owned [`FilterState`]
#[derive(Debug, Clone)]
pub struct RateFilter {
    config: FilterConfig,
}

impl RateFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Decide whether `value` is worth sending at `now_ms`
    ///
    /// On `true` the state's baseline and send time are updated in place.
    pub fn should_send(&self, value: f32, state: &mut FilterState, now_ms: u64) -> bool {
        if !value.is_finite() {
            state.suppressed += 1;
            return false;
        }

        let (last_value, last_send) = match (state.last_accepted, state.last_send_ms) {
            (Some(v), Some(t)) => (v, t),
            _ => {
                state.last_accepted = Some(value);
                state.last_send_ms = Some(now_ms);
                return true;
            }
        };

        let delta = (value - last_value).abs();
        if delta < self.config.dead_zone {
            state.suppressed += 1;
            return false;
        }

        let interval_elapsed = now_ms.saturating_sub(last_send) >= self.config.min_interval_ms;
        if !interval_elapsed && delta <= self.config.force_send_threshold {
            state.suppressed += 1;
            return false;
        }

        state.last_accepted = Some(value);
        state.last_send_ms = Some(now_ms);
        true
    }
}
