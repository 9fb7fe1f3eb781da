//! Turns raw adapter readings into [ActivitySample]s. One [poller::SignalPoller] runs per granted
//! adapter, each with its own cadence.

pub mod poller;

use chrono::{DateTime, Utc};

use crate::signal_api::{ActiveWindowData, PointerPosition, Reading, SignalKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleValue {
    Idle { idle_ms: u32 },
    Window { window: ActiveWindowData, changed: bool },
    Pointer { moved: bool },
}

/// Ephemeral reading from one adapter. Consumed by fusion right away and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivitySample {
    pub source: SignalKind,
    pub timestamp: DateTime<Utc>,
    pub value: SampleValue,
}

/// Remembers the last observed window and pointer position so readings become change flags.
#[derive(Debug, Default)]
pub struct ReadingInterpreter {
    last_window: Option<ActiveWindowData>,
    last_pointer: Option<PointerPosition>,
}

impl ReadingInterpreter {
    /// Starts from the reading taken during the permission probe so the first poll isn't
    /// mistaken for a change.
    pub fn with_baseline(baseline: Option<Reading>) -> Self {
        let mut interpreter = Self::default();
        if let Some(reading) = baseline {
            interpreter.interpret(reading);
        }
        interpreter
    }

    pub fn interpret(&mut self, reading: Reading) -> SampleValue {
        match reading {
            Reading::IdleMs(idle_ms) => SampleValue::Idle { idle_ms },
            Reading::Window(window) => {
                let changed = self.last_window.as_ref() != Some(&window);
                self.last_window = Some(window.clone());
                SampleValue::Window { window, changed }
            }
            Reading::Pointer(position) => {
                let moved = self.last_pointer.is_some_and(|last| last != position);
                self.last_pointer = Some(position);
                SampleValue::Pointer { moved }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::signal_api::{ActiveWindowData, PointerPosition, Reading};

    use super::{ReadingInterpreter, SampleValue};

    fn window(title: &str) -> ActiveWindowData {
        ActiveWindowData {
            window_title: title.into(),
            process_name: "/usr/bin/term".into(),
        }
    }

    #[test]
    fn pointer_motion_is_relative_to_last_position() {
        let mut interpreter = ReadingInterpreter::default();
        let origin = PointerPosition { x: 10, y: 10 };

        assert_eq!(
            interpreter.interpret(Reading::Pointer(origin)),
            SampleValue::Pointer { moved: false }
        );
        assert_eq!(
            interpreter.interpret(Reading::Pointer(origin)),
            SampleValue::Pointer { moved: false }
        );
        assert_eq!(
            interpreter.interpret(Reading::Pointer(PointerPosition { x: 11, y: 10 })),
            SampleValue::Pointer { moved: true }
        );
    }

    #[test]
    fn window_change_compares_title_and_owner() {
        let mut interpreter = ReadingInterpreter::with_baseline(Some(Reading::Window(window("a"))));

        assert_eq!(
            interpreter.interpret(Reading::Window(window("a"))),
            SampleValue::Window {
                window: window("a"),
                changed: false
            }
        );
        assert_eq!(
            interpreter.interpret(Reading::Window(window("b"))),
            SampleValue::Window {
                window: window("b"),
                changed: true
            }
        );
    }

    #[test]
    fn idle_readings_pass_through() {
        let mut interpreter = ReadingInterpreter::default();
        assert_eq!(
            interpreter.interpret(Reading::IdleMs(1200)),
            SampleValue::Idle { idle_ms: 1200 }
        );
    }
}
