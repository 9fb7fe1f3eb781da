//! Day timeline split into fixed 10 minute segments.
//!
//! A segment holds the last state fusion observed while its bucket was current. Segments are
//! only written for the current moment, except by the bounded gap fill which back-fills empty
//! segments after the process was asleep.

pub mod storage;

use std::ops::Range;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use tracing::{debug, info};

use crate::utils::time::minute_of_day;

use super::fusion::{ActivityState, FusionThresholds};

pub const SEGMENT_MINUTES: u32 = 10;
pub const SEGMENTS_PER_DAY: usize = (24 * 60 / SEGMENT_MINUTES) as usize;

pub fn segment_index(time: NaiveTime) -> usize {
    (minute_of_day(time) / SEGMENT_MINUTES) as usize
}

fn segment_start(day: NaiveDate, index: usize) -> NaiveDateTime {
    day.and_time(NaiveTime::MIN) + Duration::minutes(i64::from(SEGMENT_MINUTES) * index as i64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Breakdown {
    pub active: usize,
    pub idle: usize,
    pub inactive: usize,
    pub no_data: usize,
}

impl Breakdown {
    pub fn minutes(count: usize) -> u32 {
        count as u32 * SEGMENT_MINUTES
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineStore {
    day: NaiveDate,
    segments: Vec<Option<ActivityState>>,
}

impl TimelineStore {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            segments: vec![None; SEGMENTS_PER_DAY],
        }
    }

    /// Rebuilds a day from stored segments. Missing trailing segments become empty, extra ones
    /// are ignored.
    pub fn from_segments(day: NaiveDate, mut segments: Vec<Option<ActivityState>>) -> Self {
        segments.resize(SEGMENTS_PER_DAY, None);
        Self { day, segments }
    }

    pub fn day(&self) -> NaiveDate {
        self.day
    }

    pub fn segments(&self) -> &[Option<ActivityState>] {
        &self.segments
    }

    /// Clears every segment when `today` differs from the stored day. Returns whether it did.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.day == today {
            return false;
        }
        info!("Timeline rolled over from {} to {today}", self.day);
        *self = Self::new(today);
        true
    }

    /// Writes `state` into the segment of `at`, rolling the day over first if needed.
    pub fn record_state(&mut self, state: ActivityState, at: NaiveDateTime) {
        self.roll_over(at.date());
        let index = segment_index(at.time());
        if self.segments[index] != Some(state) {
            debug!("Segment {index} is now {state}");
        }
        self.segments[index] = Some(state);
    }

    /// Back-fills empty segments of the trailing `window` before `at`.
    ///
    /// `quiet` is the time since the last qualifying signal at `at`. Where that signal precedes
    /// a segment, the segment gets the state the quiet period implied back then. Otherwise the
    /// current state is the last thing known and is used as is. Filled segments never cross into
    /// the previous day and recorded segments are never overwritten.
    pub fn gap_fill(
        &mut self,
        current: ActivityState,
        quiet: Duration,
        thresholds: &FusionThresholds,
        at: NaiveDateTime,
        window: Duration,
    ) -> usize {
        if at.date() != self.day {
            return 0;
        }
        let window_start = (at - window).max(self.day.and_time(NaiveTime::MIN));
        let first = segment_index(window_start.time());
        let current_index = segment_index(at.time());

        let mut filled = 0;
        for index in first..=current_index {
            if self.segments[index].is_some() {
                continue;
            }
            let moment = (segment_start(self.day, index + 1) - Duration::seconds(1)).min(at);
            let age = at - moment;
            let state = if quiet >= age {
                thresholds.state_after(quiet - age)
            } else {
                current
            };
            self.segments[index] = Some(state);
            filled += 1;
        }
        if filled > 0 {
            debug!("Gap fill wrote {filled} segments");
        }
        filled
    }

    pub fn segment(&self, index: usize) -> Option<ActivityState> {
        self.segments.get(index).copied().flatten()
    }

    /// Counts segment states in `range`, clamped to the day.
    pub fn breakdown(&self, range: Range<usize>) -> Breakdown {
        let end = range.end.min(SEGMENTS_PER_DAY);
        let start = range.start.min(end);
        self.segments[start..end]
            .iter()
            .fold(Breakdown::default(), |mut breakdown, segment| {
                match segment {
                    Some(ActivityState::Active) => breakdown.active += 1,
                    Some(ActivityState::Idle) => breakdown.idle += 1,
                    Some(ActivityState::Inactive) => breakdown.inactive += 1,
                    None => breakdown.no_data += 1,
                }
                breakdown
            })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

    use crate::daemon::fusion::{ActivityState, FusionThresholds};

    use super::{Breakdown, SEGMENTS_PER_DAY, TimelineStore, segment_index};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 7, 4).unwrap()
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        day().and_hms_opt(hour, minute, 0).unwrap()
    }

    fn time(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    #[test]
    fn segment_index_follows_minute_of_day() {
        assert_eq!(SEGMENTS_PER_DAY, 144);
        assert_eq!(segment_index(time(0, 0)), 0);
        assert_eq!(segment_index(time(9, 5)), 54);
        assert_eq!(segment_index(time(9, 9)), 54);
        assert_eq!(segment_index(time(9, 10)), 55);
        assert_eq!(segment_index(time(23, 59)), 143);
    }

    #[test]
    fn record_keeps_last_state_of_bucket() {
        let mut timeline = TimelineStore::new(day());

        timeline.record_state(ActivityState::Active, at(9, 1));
        timeline.record_state(ActivityState::Idle, at(9, 8));

        assert_eq!(timeline.segment(54), Some(ActivityState::Idle));
        assert_eq!(timeline.segment(53), None);
        assert_eq!(timeline.segment(500), None);
    }

    #[test]
    fn writing_a_new_day_clears_segments() {
        let mut timeline = TimelineStore::new(day());
        timeline.record_state(ActivityState::Active, at(23, 55));

        let next_day = day().succ_opt().unwrap();
        timeline.record_state(ActivityState::Idle, next_day.and_hms_opt(0, 3, 0).unwrap());

        assert_eq!(timeline.day(), next_day);
        assert_eq!(timeline.segment(143), None);
        assert_eq!(timeline.segment(0), Some(ActivityState::Idle));
        assert_eq!(timeline.breakdown(0..SEGMENTS_PER_DAY).no_data, 143);
    }

    #[test]
    fn gap_fill_is_bounded_to_window() {
        let mut timeline = TimelineStore::new(day());
        timeline.record_state(ActivityState::Active, at(8, 0));

        // Asleep since 8:00, waking up at 10:00 with the last signal two hours old.
        let filled = timeline.gap_fill(
            ActivityState::Inactive,
            Duration::hours(2),
            &FusionThresholds::default(),
            at(10, 0),
            Duration::minutes(30),
        );

        assert_eq!(filled, 4);
        for index in 57..=60 {
            assert_eq!(timeline.segment(index), Some(ActivityState::Inactive));
        }
        assert_eq!(timeline.segment(56), None);
        assert_eq!(timeline.segment(48), Some(ActivityState::Active));
    }

    #[test]
    fn gap_fill_reconstructs_recent_transition() {
        let mut timeline = TimelineStore::new(day());
        timeline.record_state(ActivityState::Active, at(9, 25));

        // Last signal 9:38, now 9:50: idle from 9:38:05, inactive from 9:43.
        let filled = timeline.gap_fill(
            ActivityState::Inactive,
            Duration::minutes(12),
            &FusionThresholds::default(),
            at(9, 50),
            Duration::minutes(30),
        );

        assert_eq!(filled, 3);
        assert_eq!(timeline.segment(56), Some(ActivityState::Active));
        assert_eq!(timeline.segment(57), Some(ActivityState::Idle));
        assert_eq!(timeline.segment(58), Some(ActivityState::Inactive));
        assert_eq!(timeline.segment(59), Some(ActivityState::Inactive));
    }

    #[test]
    fn gap_fill_does_not_cross_midnight() {
        let mut timeline = TimelineStore::new(day());
        let filled = timeline.gap_fill(
            ActivityState::Active,
            Duration::zero(),
            &FusionThresholds::default(),
            at(0, 12),
            Duration::minutes(30),
        );
        assert_eq!(filled, 2);
        assert_eq!(timeline.breakdown(0..2).active, 2);
    }

    #[test]
    fn breakdown_counts_states_in_range() {
        let mut timeline = TimelineStore::new(day());
        timeline.record_state(ActivityState::Active, at(9, 0));
        timeline.record_state(ActivityState::Active, at(9, 10));
        timeline.record_state(ActivityState::Idle, at(9, 20));
        timeline.record_state(ActivityState::Inactive, at(9, 30));

        assert_eq!(
            timeline.breakdown(54..60),
            Breakdown {
                active: 2,
                idle: 1,
                inactive: 1,
                no_data: 2,
            }
        );
        assert_eq!(timeline.breakdown(140..500).no_data, 4);
        assert_eq!(timeline.breakdown(60..50), Breakdown::default());
        assert_eq!(Breakdown::minutes(3), 30);
    }

    #[test]
    fn from_segments_pads_short_input() {
        let timeline = TimelineStore::from_segments(day(), vec![Some(ActivityState::Idle)]);
        assert_eq!(timeline.segments().len(), SEGMENTS_PER_DAY);
        assert_eq!(timeline.segment(0), Some(ActivityState::Idle));
    }
}
