//! Fuses samples from every signal source into a single [ActivityState].
//!
//! Active means a qualifying signal was seen within the active threshold, Idle means none for the
//! active threshold but within the idle timeout, Inactive means none for at least the idle
//! timeout. Active never jumps straight to Inactive: an overdue evaluation emits both edges with
//! the moments the thresholds were actually crossed.

use std::{collections::BTreeMap, fmt::Display};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    daemon::collection::{ActivitySample, SampleValue},
    signal_api::ActiveWindowData,
    utils::time::millis,
};

/// Consecutive idle readings pointing at inputs closer than this are the same input.
const INPUT_RESOLUTION: Duration = Duration::seconds(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Active,
    Idle,
    Inactive,
}

impl ActivityState {
    pub fn is_active(self) -> bool {
        self == ActivityState::Active
    }
}

impl Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityState::Active => write!(f, "active"),
            ActivityState::Idle => write!(f, "idle"),
            ActivityState::Inactive => write!(f, "inactive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionThresholds {
    pub active_threshold: Duration,
    pub idle_timeout: Duration,
}

impl Default for FusionThresholds {
    fn default() -> Self {
        Self {
            active_threshold: Duration::seconds(5),
            idle_timeout: Duration::minutes(5),
        }
    }
}

impl FusionThresholds {
    /// State implied by `quiet` time passed since the last qualifying signal.
    pub fn state_after(&self, quiet: Duration) -> ActivityState {
        if quiet < self.active_threshold {
            ActivityState::Active
        } else if quiet < self.idle_timeout {
            ActivityState::Idle
        } else {
            ActivityState::Inactive
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub previous: ActivityState,
    pub next: ActivityState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Per-day counters. Accumulated when a state is exited and reset on day rollover.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyStats {
    pub active_accumulated_ms: i64,
    /// Time spent in Idle and Inactive.
    pub idle_accumulated_ms: i64,
    /// Finished active sessions.
    pub sessions: Vec<SessionRecord>,
    /// Sessions started today, including the running one.
    pub total_sessions: u32,
    pub average_session_ms: i64,
    pub window_switches: u32,
    pub app_usage: BTreeMap<String, u32>,
    pub mouse_events: u32,
    pub keyboard_events: u32,
    pub last_reset_day_key: String,
}

impl DailyStats {
    pub fn new(day_key: String) -> Self {
        Self {
            last_reset_day_key: day_key,
            ..Default::default()
        }
    }
}

/// Kind of user input a sample was attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    Pointer,
    Keyboard,
    WindowSwitch(ActiveWindowData),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Observation {
    pub qualifying: bool,
    pub input: Option<InputKind>,
    pub transitions: Vec<StateTransition>,
}

/// Read-only view handed to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityStatus {
    pub state: ActivityState,
    pub is_active: bool,
    pub last_activity: DateTime<Utc>,
    pub idle_time_ms: i64,
    pub stats: DailyStats,
}

pub struct ActivityFusion {
    thresholds: FusionThresholds,
    state: ActivityState,
    last_signal: DateTime<Utc>,
    state_entered: DateTime<Utc>,
    session_start: DateTime<Utc>,
    last_pointer_motion: Option<DateTime<Utc>>,
    last_keyboard_input: Option<DateTime<Utc>>,
    pointer_tracked: bool,
    stats: DailyStats,
}

impl ActivityFusion {
    /// Starts optimistic: Active with a fresh session opened at `now`. `stats` carries counters
    /// already accumulated today.
    pub fn new(thresholds: FusionThresholds, now: DateTime<Utc>, mut stats: DailyStats) -> Self {
        stats.total_sessions += 1;
        Self {
            thresholds,
            state: ActivityState::Active,
            last_signal: now,
            state_entered: now,
            session_start: now,
            last_pointer_motion: None,
            last_keyboard_input: None,
            pointer_tracked: false,
            stats,
        }
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn stats(&self) -> &DailyStats {
        &self.stats
    }

    pub fn thresholds(&self) -> FusionThresholds {
        self.thresholds
    }

    pub fn last_signal(&self) -> DateTime<Utc> {
        self.last_signal
    }

    /// Keyboard input can only be told apart from pointer input when the pointer is polled.
    pub fn set_pointer_tracked(&mut self, tracked: bool) {
        self.pointer_tracked = tracked;
    }

    pub fn idle_time(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_signal).max(Duration::zero())
    }

    pub fn status(&self, now: DateTime<Utc>) -> ActivityStatus {
        ActivityStatus {
            state: self.state,
            is_active: self.state.is_active(),
            last_activity: self.last_signal,
            idle_time_ms: self.idle_time(now).num_milliseconds(),
            stats: self.stats.clone(),
        }
    }

    /// Applies timeout rules at `now`. Active is checked before Idle so a long gap yields both
    /// edges in order.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Vec<StateTransition> {
        let mut transitions = vec![];
        let quiet = now - self.last_signal;
        if self.state == ActivityState::Active && quiet >= self.thresholds.active_threshold {
            let at = self.last_signal + self.thresholds.active_threshold;
            transitions.push(self.transition(ActivityState::Idle, at));
        }
        if self.state == ActivityState::Idle && quiet >= self.thresholds.idle_timeout {
            let at = self.last_signal + self.thresholds.idle_timeout;
            transitions.push(self.transition(ActivityState::Inactive, at));
        }
        transitions
    }

    /// Registers a qualifying signal that happened at `at`.
    pub fn record_signal(&mut self, at: DateTime<Utc>) -> Vec<StateTransition> {
        let mut transitions = self.evaluate(at);
        if at > self.last_signal {
            self.last_signal = at;
        }
        if self.state != ActivityState::Active {
            transitions.push(self.transition(ActivityState::Active, at));
        }
        transitions
    }

    /// Registers engagement that lasted without a break until `now`, such as a focused window.
    pub fn extend_engagement(&mut self, now: DateTime<Utc>) -> Vec<StateTransition> {
        if self.state.is_active() && now > self.last_signal {
            self.last_signal = now;
            return vec![];
        }
        self.record_signal(now)
    }

    pub fn observe(&mut self, sample: &ActivitySample) -> Observation {
        let (signal_at, input) = self.interpret(sample);
        let mut transitions = match signal_at {
            Some(at) => self.record_signal(at),
            None => vec![],
        };
        transitions.extend(self.evaluate(sample.timestamp));
        Observation {
            qualifying: signal_at.is_some(),
            input,
            transitions,
        }
    }

    /// Clears today's counters. A running session restarts at `now`.
    pub fn reset_stats(&mut self, day_key: String, now: DateTime<Utc>) {
        info!("Resetting daily stats for {day_key}");
        self.stats = DailyStats::new(day_key);
        if self.state.is_active() {
            self.stats.total_sessions = 1;
            self.session_start = now;
        }
        self.state_entered = now;
        self.last_keyboard_input = None;
    }

    fn interpret(&mut self, sample: &ActivitySample) -> (Option<DateTime<Utc>>, Option<InputKind>) {
        let timestamp = sample.timestamp;
        match &sample.value {
            SampleValue::Idle { idle_ms } => {
                let idle = millis(u64::from(*idle_ms));
                if idle >= self.thresholds.active_threshold {
                    return (None, None);
                }
                let input_at = timestamp - idle;
                (Some(input_at), self.attribute_keyboard(input_at))
            }
            SampleValue::Pointer { moved: true } => {
                self.last_pointer_motion = Some(timestamp);
                self.stats.mouse_events += 1;
                (Some(timestamp), Some(InputKind::Pointer))
            }
            SampleValue::Window {
                window,
                changed: true,
            } => {
                self.stats.window_switches += 1;
                *self
                    .stats
                    .app_usage
                    .entry(window.app_name().to_string())
                    .or_default() += 1;
                (Some(timestamp), Some(InputKind::WindowSwitch(window.clone())))
            }
            SampleValue::Pointer { moved: false } | SampleValue::Window { changed: false, .. } => {
                (None, None)
            }
        }
    }

    /// Input reported by the idle counter with no pointer motion around it is keyboard input.
    fn attribute_keyboard(&mut self, input_at: DateTime<Utc>) -> Option<InputKind> {
        if !self.pointer_tracked {
            return None;
        }
        if self
            .last_keyboard_input
            .is_some_and(|last| input_at - last < INPUT_RESOLUTION)
        {
            return None;
        }
        if self
            .last_pointer_motion
            .is_some_and(|moved| (input_at - moved).abs() < self.thresholds.active_threshold)
        {
            return None;
        }
        self.last_keyboard_input = Some(input_at);
        self.stats.keyboard_events += 1;
        Some(InputKind::Keyboard)
    }

    fn transition(&mut self, next: ActivityState, at: DateTime<Utc>) -> StateTransition {
        let at = at.max(self.state_entered);
        let previous = self.state;

        if previous == ActivityState::Active {
            let length = at - self.session_start;
            self.stats.active_accumulated_ms += length.num_milliseconds();
            self.stats.sessions.push(SessionRecord {
                start: self.session_start,
                end: at,
                duration_ms: length.num_milliseconds(),
            });
            self.stats.average_session_ms =
                self.stats.active_accumulated_ms / i64::from(self.stats.total_sessions.max(1));
            debug!("Closed session of {}ms", length.num_milliseconds());
        } else {
            self.stats.idle_accumulated_ms += (at - self.state_entered).num_milliseconds();
        }

        if next == ActivityState::Active {
            self.stats.total_sessions += 1;
            self.session_start = at;
        }

        self.state = next;
        self.state_entered = at;
        info!("Activity state {previous} -> {next} at {at}");
        StateTransition {
            previous,
            next,
            timestamp: at,
        }
    }
}
