use cam_motion_common::config::MotionConfig;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Active,
}

/// What a single observation did to the debouncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// IDLE→ACTIVE: the only point at which a motion event is emitted.
    Rising,
    /// ACTIVE→IDLE.
    Falling,
    /// No transition.
    Steady,
}

/// Edge-triggered motion detector with a re-fire cooldown.
///
/// A score above the threshold fires once on the way up, provided at least
/// `cooldown_ms` has passed since the previous fire. Scores at or below the
/// threshold always return the debouncer to idle; the cooldown only gates
/// firing again.
pub struct MotionDebouncer {
    state: DebounceState,
    /// `None` until the first fire, so the first qualifying frame always fires.
    last_fire_ms: Option<i64>,
    threshold: u64,
    cooldown_ms: i64,
}

impl MotionDebouncer {
    pub fn new(threshold: u64, cooldown_ms: u64) -> Self {
        Self {
            state: DebounceState::Idle,
            last_fire_ms: None,
            threshold,
            cooldown_ms: i64::try_from(cooldown_ms).unwrap_or(i64::MAX),
        }
    }

    pub fn from_config(config: &MotionConfig) -> Self {
        Self::new(config.score_threshold, config.cooldown_ms)
    }

    /// Feed the score observed at `now_ms` (Unix millis).
    pub fn observe(&mut self, score: u64, now_ms: i64) -> Edge {
        if score <= self.threshold {
            return match self.state {
                DebounceState::Active => {
                    debug!(score, threshold = self.threshold, "ACTIVE→IDLE: motion ended");
                    self.state = DebounceState::Idle;
                    Edge::Falling
                }
                DebounceState::Idle => Edge::Steady,
            };
        }

        if self.state == DebounceState::Active {
            return Edge::Steady;
        }

        if !self.cooled_down(now_ms) {
            debug!(
                score,
                last_fire_ms = ?self.last_fire_ms,
                cooldown_ms = self.cooldown_ms,
                "above threshold during cooldown, suppressed"
            );
            return Edge::Steady;
        }

        self.state = DebounceState::Active;
        self.last_fire_ms = Some(now_ms);
        Edge::Rising
    }

    fn cooled_down(&self, now_ms: i64) -> bool {
        match self.last_fire_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.cooldown_ms,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn last_fire_ms(&self) -> Option<i64> {
        self.last_fire_ms
    }

    pub fn reset(&mut self) {
        self.state = DebounceState::Idle;
        self.last_fire_ms = None;
    }
}
