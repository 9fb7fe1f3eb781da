//! [ActivityMonitor] owns every moving part of activity tracking and exposes the query surface.
//!
//! Each granted adapter gets its own poller task. Samples flow over a channel into a single
//! processing task, while evaluation, status and persistence run on their own timers. All of them
//! mutate [MonitorCore] through one mutex, so fusion and the timeline only ever see serialized
//! updates.

use std::{ops::Range, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    signal_api::{AdapterSlot, SignalKind},
    utils::{clock::Clock, time::day_key},
};

use super::{
    collection::{ActivitySample, poller::SignalPoller},
    config::MonitorConfig,
    events::{EventBus, MonitorEvent},
    fallback::{FallbackEstimator, FocusChange},
    fusion::{ActivityFusion, ActivityState, ActivityStatus, DailyStats, InputKind, StateTransition},
    permissions::{CapabilityReport, OverallStatus, PermissionGate},
    timeline::{
        Breakdown, TimelineStore,
        storage::{DaySnapshot, SnapshotStorage},
    },
};

const SAMPLE_CHANNEL_SIZE: usize = 32;

/// State mutated by samples and timers.
struct MonitorCore {
    fusion: ActivityFusion,
    timeline: TimelineStore,
    /// Present only when no adapter could be granted.
    fallback: Option<FallbackEstimator>,
}

impl MonitorCore {
    fn new(config: &MonitorConfig, now: DateTime<Utc>, today: NaiveDate) -> Self {
        Self {
            fusion: ActivityFusion::new(config.thresholds(), now, DailyStats::new(day_key(today))),
            timeline: TimelineStore::new(today),
            fallback: None,
        }
    }

    fn restore(&mut self, day: NaiveDate, snapshot: DaySnapshot, now: DateTime<Utc>) {
        self.timeline = TimelineStore::from_segments(day, snapshot.segments);
        self.fusion = ActivityFusion::new(self.fusion.thresholds(), now, snapshot.stats);
    }

    fn snapshot(&self) -> DaySnapshot {
        DaySnapshot {
            day_key: day_key(self.timeline.day()),
            segments: self.timeline.segments().to_vec(),
            stats: self.fusion.stats().clone(),
        }
    }

    /// Starts a new day when `today` moved past the timeline's day. Returns the finished day so it
    /// can be written before it is lost.
    fn roll_over(&mut self, today: NaiveDate, now: DateTime<Utc>) -> Option<DaySnapshot> {
        if self.timeline.day() == today {
            return None;
        }
        let finished = self.snapshot();
        self.timeline.roll_over(today);
        self.fusion.reset_stats(day_key(today), now);
        Some(finished)
    }

    fn evaluate(&mut self, now: DateTime<Utc>) -> Vec<StateTransition> {
        match &self.fallback {
            Some(fallback) => fallback.tick(now, &mut self.fusion),
            None => self.fusion.evaluate(now),
        }
    }

    fn gap_fill(&mut self, now: DateTime<Utc>, local: NaiveDateTime, window: chrono::Duration) {
        self.timeline.gap_fill(
            self.fusion.state(),
            self.fusion.idle_time(now),
            &self.fusion.thresholds(),
            local,
            window,
        );
    }
}

/// Outcome of one serialized update of the core, applied outside the lock.
struct Step {
    finished_day: Option<DaySnapshot>,
    transitions: Vec<StateTransition>,
    events: Vec<MonitorEvent>,
}

fn input_event(input: InputKind, timestamp: DateTime<Utc>) -> MonitorEvent {
    match input {
        InputKind::Pointer => MonitorEvent::MouseActivity { timestamp },
        InputKind::Keyboard => MonitorEvent::KeyboardActivity { timestamp },
        InputKind::WindowSwitch(window) => MonitorEvent::WindowChanged {
            app: window.app_name().to_string(),
            title: window.window_title.to_string(),
            timestamp,
        },
    }
}

struct Shared<S> {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    gate: Arc<tokio::sync::Mutex<PermissionGate>>,
    core: Mutex<MonitorCore>,
    events: EventBus,
    storage: S,
}

impl<S: SnapshotStorage> Shared<S> {
    /// Rolls the day over if needed, runs `action` and records the resulting state into the
    /// current segment.
    fn step(
        &self,
        action: impl FnOnce(
            &mut MonitorCore,
            DateTime<Utc>,
            NaiveDateTime,
            &mut Vec<MonitorEvent>,
        ) -> Vec<StateTransition>,
    ) -> Step {
        let now = self.clock.time();
        let local = self.clock.local_time();
        let mut core = self.core.lock();

        let finished_day = core.roll_over(local.date(), now);
        let mut inputs = vec![];
        let transitions = action(&mut *core, now, local, &mut inputs);
        let state = core.fusion.state();
        core.timeline.record_state(state, local);

        let mut events = transitions
            .iter()
            .map(MonitorEvent::from)
            .collect::<Vec<_>>();
        events.extend(inputs);
        Step {
            finished_day,
            transitions,
            events,
        }
    }

    async fn commit(&self, step: Step) {
        for event in step.events {
            self.events.publish(event);
        }
        if let Some(finished) = step.finished_day {
            self.save(&finished).await;
        }
        if !step.transitions.is_empty() {
            self.persist().await;
        }
    }

    async fn save(&self, snapshot: &DaySnapshot) {
        if let Err(e) = self.storage.save(snapshot).await {
            warn!("Failed to save snapshot for {} {e:?}", snapshot.day_key);
        }
    }

    async fn persist(&self) {
        let snapshot = self.core.lock().snapshot();
        self.save(&snapshot).await;
    }

    async fn restore(&self) {
        let today = self.clock.local_time().date();
        match self.storage.load(today).await {
            Ok(Some(snapshot)) => {
                info!("Restoring timeline of {}", snapshot.day_key);
                let now = self.clock.time();
                self.core.lock().restore(today, snapshot, now);
            }
            Ok(None) => debug!("Nothing stored for {today} yet"),
            Err(e) => warn!("Failed to restore today's snapshot {e:?}"),
        }
    }

    fn apply_sample(&self, sample: &ActivitySample) -> Step {
        self.step(|core, _, _, inputs| {
            let observation = core.fusion.observe(sample);
            if let Some(input) = observation.input {
                inputs.push(input_event(input, sample.timestamp));
            }
            observation.transitions
        })
    }

    fn evaluate(&self) -> Step {
        self.step(|core, now, _, _| core.evaluate(now))
    }

    /// Minute level upkeep. Covers the stretch the process may have slept through, then writes the
    /// day out.
    async fn maintain(&self) {
        let window = self.config.gap_fill_window();
        let step = self.step(|core, now, local, _| {
            let transitions = core.evaluate(now);
            core.gap_fill(now, local, window);
            transitions
        });
        self.commit(step).await;
        self.persist().await;
    }

    /// Switches to focus based estimation once the probe or runtime revocations left no usable
    /// adapter. Returns whether fallback is active.
    async fn fall_back_if_unusable(&self) -> bool {
        let unusable = self
            .gate
            .lock()
            .await
            .report()
            .is_some_and(|report| report.overall == OverallStatus::None);
        if !unusable {
            return false;
        }
        let mut core = self.core.lock();
        if core.fallback.is_none() {
            warn!(
                "No signal source is usable, estimating activity from window focus reported with `worktally focus`"
            );
            core.fallback = Some(FallbackEstimator::new());
        }
        true
    }

    fn publish_status(&self) {
        let status = self.core.lock().fusion.status(self.clock.time());
        self.events.publish(status.into());
    }
}

async fn process_samples<S: SnapshotStorage>(
    shared: Arc<Shared<S>>,
    mut receiver: mpsc::Receiver<ActivitySample>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let sample = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            sample = receiver.recv() => sample,
        };
        let Some(sample) = sample else {
            info!("Every poller finished, no more samples");
            shared.fall_back_if_unusable().await;
            return Ok(());
        };
        let step = shared.apply_sample(&sample);
        shared.commit(step).await;
    }
}

#[derive(Debug, Clone, Copy)]
enum PeriodicJob {
    Evaluate,
    Status,
    Maintain,
}

async fn run_periodic<S: SnapshotStorage>(
    shared: Arc<Shared<S>>,
    job: PeriodicJob,
    period: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    debug!("Running {job:?} every {period:?}");
    let mut point = shared.clock.instant();
    loop {
        point = (point + period).max(shared.clock.instant());
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = shared.clock.sleep_until(point) => (),
        }
        match job {
            PeriodicJob::Evaluate => {
                let step = shared.evaluate();
                shared.commit(step).await;
            }
            PeriodicJob::Status => shared.publish_status(),
            PeriodicJob::Maintain => shared.maintain().await,
        }
    }
}

struct RunningTasks {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<Result<()>>>,
}

enum Lifecycle {
    Created,
    Running(RunningTasks),
    Stopped,
}

pub struct ActivityMonitor<S: SnapshotStorage> {
    shared: Arc<Shared<S>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl<S: SnapshotStorage> ActivityMonitor<S> {
    /// Reads the settings once. Adapters of kinds disabled in `config` are never touched.
    pub fn new(
        config: MonitorConfig,
        slots: Vec<AdapterSlot>,
        storage: S,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let gate = PermissionGate::new(slots, |kind| config.is_tracked(kind));
        let core = MonitorCore::new(&config, clock.time(), clock.local_time().date());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                clock,
                gate: Arc::new(tokio::sync::Mutex::new(gate)),
                core: Mutex::new(core),
                events: EventBus::new(),
                storage,
            }),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Created),
        })
    }

    /// Restores today's data, probes permissions and starts every task. Calling it while running
    /// does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running(_) => {
                debug!("Monitor is already running");
                return Ok(());
            }
            Lifecycle::Stopped => bail!("Monitor was stopped and can't be started again"),
        }

        let shared = &self.shared;
        shared.restore().await;

        let (report, granted) = {
            let mut gate = shared.gate.lock().await;
            let report = gate.probe(shared.config.probe_timeout()).await;
            (report, gate.take_granted())
        };
        let shutdown = CancellationToken::new();
        let mut handles = vec![];

        if !shared.fall_back_if_unusable().await {
            shared
                .core
                .lock()
                .fusion
                .set_pointer_tracked(report.is_granted(SignalKind::Pointer));

            let (sender, receiver) = mpsc::channel(SAMPLE_CHANNEL_SIZE);
            for adapter in granted {
                let frequency = shared.config.poll_interval(adapter.adapter.kind());
                let poller = SignalPoller::new(
                    adapter,
                    sender.clone(),
                    shutdown.clone(),
                    frequency,
                    shared.clock.clone(),
                    shared.gate.clone(),
                );
                handles.push(tokio::spawn(poller.run()));
            }
            handles.push(tokio::spawn(process_samples(
                shared.clone(),
                receiver,
                shutdown.clone(),
            )));
        }

        let jobs = [
            (PeriodicJob::Evaluate, shared.config.evaluation_tick()),
            (PeriodicJob::Status, shared.config.status_interval()),
            (PeriodicJob::Maintain, shared.config.persist_interval()),
        ];
        for (job, period) in jobs {
            handles.push(tokio::spawn(run_periodic(
                shared.clone(),
                job,
                period,
                shutdown.clone(),
            )));
        }

        info!("Monitor started with {} tasks", handles.len());
        *lifecycle = Lifecycle::Running(RunningTasks { shutdown, handles });
        Ok(())
    }

    /// Cancels and joins every task, then writes a final snapshot. Safe to call at any time and
    /// more than once.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(RunningTasks { shutdown, handles }) => {
                shutdown.cancel();
                for result in futures::future::join_all(handles).await {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("Monitor task failed {e:?}"),
                        Err(e) => error!("Monitor task panicked {e:?}"),
                    }
                }
                let step = self.shared.evaluate();
                self.shared.commit(step).await;
                self.shared.persist().await;
                info!("Monitor stopped");
            }
            Lifecycle::Created => {
                debug!("Monitor was never started");
                *lifecycle = Lifecycle::Created;
            }
            Lifecycle::Stopped => debug!("Monitor is already stopped"),
        }
    }

    pub fn get_stats(&self) -> ActivityStatus {
        let now = self.shared.clock.time();
        self.shared.core.lock().fusion.status(now)
    }

    /// Probes on the first call, afterwards returns the cached report including revocations.
    pub async fn check_permissions(&self) -> CapabilityReport {
        let timeout = self.shared.config.probe_timeout();
        self.shared.gate.lock().await.probe(timeout).await
    }

    pub async fn reset_stats(&self) {
        let step = self.shared.step(|core, now, local, _| {
            core.fusion.reset_stats(day_key(local.date()), now);
            vec![]
        });
        self.shared.commit(step).await;
        self.shared.persist().await;
    }

    pub fn get_breakdown(&self, range: Range<usize>) -> Breakdown {
        self.shared.core.lock().timeline.breakdown(range)
    }

    pub fn get_segment(&self, index: usize) -> Option<ActivityState> {
        self.shared.core.lock().timeline.segment(index)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_fallback(&self) -> bool {
        self.shared.core.lock().fallback.is_some()
    }

    /// Focus changes of the host window. Only used in fallback mode.
    pub async fn notify_focus(&self, change: FocusChange) {
        let step = self.shared.step(|core, now, _, _| {
            let MonitorCore {
                fusion, fallback, ..
            } = core;
            match fallback {
                Some(fallback) => fallback.on_focus_change(change, now, fusion),
                None => {
                    debug!("Ignoring focus change, adapters are in use");
                    vec![]
                }
            }
        });
        self.shared.commit(step).await;
    }
}
