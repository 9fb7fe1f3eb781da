//! Read-only commands. They work from the snapshots the daemon writes and never talk to it.

use std::{fmt::Display, ops::Range, path::Path};

use ansi_term::Colour;
use anyhow::{Result, bail};
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime};
use chrono_english::parse_date_string;
use clap::{CommandFactory, Parser, ValueEnum};
use now::DateTimeNow;

use crate::{
    daemon::{
        config::{MonitorConfig, SETTINGS_FILE},
        fusion::{ActivityState, DailyStats},
        permissions::{CapabilityReport, CapabilityStatus, PermissionGate},
        timeline::{
            Breakdown, SEGMENT_MINUTES, SEGMENTS_PER_DAY, TimelineStore, segment_index,
            storage::{JsonSnapshotStorage, SnapshotStorage, TIMELINE_DIR},
        },
    },
    signal_api::platform_adapters,
};

use super::Args;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DateStyle {
    Uk,
    Us,
}

impl From<DateStyle> for chrono_english::Dialect {
    fn from(value: DateStyle) -> Self {
        match value {
            DateStyle::Uk => Self::Uk,
            DateStyle::Us => Self::Us,
        }
    }
}

impl Display for DateStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateStyle::Uk => write!(f, "uk"),
            DateStyle::Us => write!(f, "us"),
        }
    }
}

#[derive(Debug, Parser)]
pub struct BreakdownCommand {
    #[arg(
        long,
        short,
        help = "Start of the range. Examples are \"9am\", \"2 hours ago\", \"15/03/2025\", \"12:00 16/03/2025\""
    )]
    from: Option<String>,
    #[arg(
        long,
        short,
        help = "End of the range, on the same day as the start. Defaults to the end of that day"
    )]
    to: Option<String>,
    #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
    date_style: DateStyle,
}

/// Probes every adapter once, like the daemon does on start, and prints what was found.
pub async fn process_permissions_command(dir: &Path) -> Result<()> {
    let config = MonitorConfig::load(&dir.join(SETTINGS_FILE))?;
    let mut gate = PermissionGate::new(platform_adapters(), |kind| config.is_tracked(kind));
    print_capabilities(&gate.probe(config.probe_timeout()).await);
    Ok(())
}

fn print_capabilities(report: &CapabilityReport) {
    for capability in &report.capabilities {
        let (status, colour) = match capability.status {
            CapabilityStatus::Granted => ("granted", Colour::Green),
            CapabilityStatus::Denied => ("denied", Colour::Red),
            CapabilityStatus::Unavailable => ("unavailable", Colour::Yellow),
            CapabilityStatus::Unchecked => ("unchecked", Colour::Fixed(8)),
        };
        println!(
            "{:<20}{}{}",
            capability.name,
            colour.paint(format!("{status:<14}")),
            capability.detail.as_deref().unwrap_or_default()
        );
    }
    println!("overall: {:?}", report.overall);
}

pub async fn process_stats_command(dir: &Path) -> Result<()> {
    let storage = JsonSnapshotStorage::new(dir.join(TIMELINE_DIR))?;
    let today = Local::now().date_naive();
    let Some(snapshot) = storage.load(today).await? else {
        println!("Nothing was recorded on {today}");
        return Ok(());
    };
    print_stats(&snapshot.stats);
    Ok(())
}

fn print_stats(stats: &DailyStats) {
    println!("day\t\t{}", stats.last_reset_day_key);
    println!(
        "active\t\t{}",
        format_duration(Duration::milliseconds(stats.active_accumulated_ms))
    );
    println!(
        "idle\t\t{}",
        format_duration(Duration::milliseconds(stats.idle_accumulated_ms))
    );
    println!(
        "sessions\t{} (average {})",
        stats.total_sessions,
        format_duration(Duration::milliseconds(stats.average_session_ms))
    );
    println!("window switches\t{}", stats.window_switches);
    println!("mouse events\t{}", stats.mouse_events);
    println!("keyboard events\t{}", stats.keyboard_events);

    let mut apps = stats.app_usage.iter().collect::<Vec<_>>();
    apps.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (app, switches) in apps.into_iter().take(10) {
        println!("\t{switches}\t{app}");
    }
}

pub async fn process_breakdown_command(
    BreakdownCommand {
        from,
        to,
        date_style,
    }: BreakdownCommand,
    dir: &Path,
) -> Result<()> {
    let now = Local::now();
    let dialect: chrono_english::Dialect = date_style.into();
    let from = match from {
        Some(value) => parse_time(&value, now, dialect, "start")?,
        None => now.beginning_of_day(),
    };
    let to = match to {
        Some(value) => Some(parse_time(&value, now, dialect, "end")?),
        None => None,
    };
    let (day, range) = segment_range(
        from.naive_local(),
        to.map(|value| value.naive_local()),
    )?;

    let storage = JsonSnapshotStorage::new(dir.join(TIMELINE_DIR))?;
    let timeline = match storage.load(day).await? {
        Some(snapshot) => TimelineStore::from_segments(day, snapshot.segments),
        None => TimelineStore::new(day),
    };

    println!(
        "{day} {} - {}",
        segment_label(range.start),
        segment_label(range.end)
    );
    println!("{}", render_strip(&timeline.segments()[range.clone()], true));
    print_breakdown(&timeline.breakdown(range));
    Ok(())
}

fn parse_time(
    value: &str,
    now: DateTime<Local>,
    dialect: chrono_english::Dialect,
    name: &str,
) -> Result<DateTime<Local>> {
    match parse_date_string(value, now, dialect) {
        Ok(v) => Ok(v.with_timezone(&Local)),
        Err(e) => Err(Args::command()
            .error(
                clap::error::ErrorKind::ValueValidation,
                format!("Failed to validate {name} date {e}"),
            )
            .into()),
    }
}

/// Segments of `from`'s day between `from` and `to`. The segment containing `to` is included and
/// a missing or later-day `to` extends the range to the end of the day.
fn segment_range(
    from: NaiveDateTime,
    to: Option<NaiveDateTime>,
) -> Result<(NaiveDate, Range<usize>)> {
    let day = from.date();
    let start = segment_index(from.time());
    let end = match to {
        Some(to) if to < from => bail!("End of the range {to} is before its start {from}"),
        Some(to) if to.date() == day => segment_index(to.time()) + 1,
        Some(_) | None => SEGMENTS_PER_DAY,
    };
    Ok((day, start..end))
}

fn segment_label(index: usize) -> String {
    let minutes = index as u32 * SEGMENT_MINUTES;
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

fn symbol(segment: Option<ActivityState>) -> (char, Colour) {
    match segment {
        Some(ActivityState::Active) => ('█', Colour::Green),
        Some(ActivityState::Idle) => ('▓', Colour::Yellow),
        Some(ActivityState::Inactive) => ('░', Colour::Blue),
        None => ('·', Colour::Fixed(8)),
    }
}

/// One character per segment, with an hour separator every 6 segments.
fn render_strip(segments: &[Option<ActivityState>], colored: bool) -> String {
    let mut strip = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 && i % (60 / SEGMENT_MINUTES as usize) == 0 {
            strip.push(' ');
        }
        let (character, colour) = symbol(*segment);
        if colored {
            strip.push_str(&colour.paint(character.to_string()).to_string());
        } else {
            strip.push(character);
        }
    }
    strip
}

fn print_breakdown(breakdown: &Breakdown) {
    let rows = [
        ("active", breakdown.active, Colour::Green),
        ("idle", breakdown.idle, Colour::Yellow),
        ("inactive", breakdown.inactive, Colour::Blue),
        ("no data", breakdown.no_data, Colour::Fixed(8)),
    ];
    for (name, count, colour) in rows {
        let minutes = Breakdown::minutes(count);
        println!(
            "{}\t{count}\t{}",
            colour.paint(name),
            format_duration(Duration::minutes(i64::from(minutes)))
        );
    }
}

fn format_duration(v: Duration) -> String {
    if v.num_hours() > 0 {
        format!("{}h{}m", v.num_hours(), v.num_minutes() % 60)
    } else if v.num_minutes() > 0 {
        format!("{}m{}s", v.num_minutes() % 60, v.num_seconds() % 60)
    } else {
        format!("{}s", v.num_seconds() % 60)
    }
}
