//! Degraded mode used when no adapter could be granted.
//!
//! The only input is focus of the host application's own window, which needs no permission. The
//! user counts as active while the window is focused. Losing focus is the last known engagement,
//! after which the usual thresholds take the state to Idle and Inactive. Nothing is simulated.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::fusion::{ActivityFusion, StateTransition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FocusChange {
    Focused,
    Blurred,
}

#[derive(Debug, Default)]
pub struct FallbackEstimator {
    focused: bool,
}

impl FallbackEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_focus_change(
        &mut self,
        change: FocusChange,
        at: DateTime<Utc>,
        fusion: &mut ActivityFusion,
    ) -> Vec<StateTransition> {
        debug!("Host window {change:?}");
        let was_focused = std::mem::replace(&mut self.focused, change == FocusChange::Focused);
        if was_focused {
            fusion.extend_engagement(at)
        } else {
            fusion.record_signal(at)
        }
    }

    /// Keeps the state fresh while focused, otherwise only lets thresholds expire.
    pub fn tick(&self, now: DateTime<Utc>, fusion: &mut ActivityFusion) -> Vec<StateTransition> {
        if self.focused {
            fusion.extend_engagement(now)
        } else {
            fusion.evaluate(now)
        }
    }
}
