// src/ingest/scheduler.rs
//! Cycle scheduling: Idle ⇄ Running(kind) with a busy-rejecting manual
//! trigger, periodic Quick/Full cycles, and the daily retention purge.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::ingest::{CycleReport, Pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    Quick,
    Full,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKind::Quick => "quick",
            CycleKind::Full => "full",
        }
    }

    /// Quick cycles cover the primary tier only.
    fn primary_only(self) -> bool {
        matches!(self, CycleKind::Quick)
    }
}

/// Outcome of a trigger request. `Busy` is a control signal, not an error:
/// a running cycle is never cancelled and nothing queues behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Accepted,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerState {
    Idle,
    Running(CycleKind),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub state: &'static str,
    pub running: Option<&'static str>,
    pub last_report: Option<CycleReport>,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerCfg {
    pub quick_interval: Duration,
    pub full_interval: Duration,
    pub startup_delay: Duration,
    pub retention_days: i64,
}

/// Cheap to clone; every clone shares the same state machine.
#[derive(Clone)]
pub struct ScrapeScheduler {
    pipeline: Arc<Pipeline>,
    state: Arc<Mutex<SchedulerState>>,
    last_report: Arc<RwLock<Option<CycleReport>>>,
}

impl ScrapeScheduler {
    pub fn new(pipeline: Arc<Pipeline>) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            state: Arc::new(Mutex::new(SchedulerState::Idle)),
            last_report: Arc::new(RwLock::new(None)),
        })
    }

    /// Request a cycle. Accepted only from `Idle`; the cycle itself runs on
    /// a spawned task and flips the state back when it completes.
    pub fn trigger(&self, kind: CycleKind) -> TriggerOutcome {
        {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            if let SchedulerState::Running(active) = *state {
                tracing::info!(
                    target: "ingest",
                    requested = kind.as_str(),
                    active = active.as_str(),
                    "cycle refused, scheduler busy"
                );
                return TriggerOutcome::Busy;
            }
            *state = SchedulerState::Running(kind);
        }

        let this = self.clone();
        tokio::spawn(async move {
            tracing::info!(target: "ingest", kind = kind.as_str(), "cycle starting");
            let report = this.pipeline.run_cycle(kind.primary_only()).await;
            if let Ok(mut last) = this.last_report.write() {
                *last = Some(report);
            }
            let mut state = this.state.lock().expect("scheduler state poisoned");
            *state = SchedulerState::Idle;
        });
        TriggerOutcome::Accepted
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = *self.state.lock().expect("scheduler state poisoned");
        let (name, running) = match state {
            SchedulerState::Idle => ("idle", None),
            SchedulerState::Running(kind) => ("running", Some(kind.as_str())),
        };
        SchedulerStatus {
            state: name,
            running,
            last_report: self.last_report.read().ok().and_then(|r| r.clone()),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(
            *self.state.lock().expect("scheduler state poisoned"),
            SchedulerState::Idle
        )
    }

    /// Spawn the periodic driver: a startup Quick cycle, then interval
    /// ticks. A tick that lands while a cycle is running is simply refused;
    /// nothing queues.
    pub fn spawn_intervals(&self, cfg: SchedulerCfg) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cfg.startup_delay).await;
            let _ = this.trigger(CycleKind::Quick);

            let mut quick = tokio::time::interval(cfg.quick_interval);
            let mut full = tokio::time::interval(cfg.full_interval);
            let mut purge = tokio::time::interval(Duration::from_secs(24 * 3600));
            // Consume the immediate first tick of each interval.
            quick.tick().await;
            full.tick().await;
            purge.tick().await;

            loop {
                tokio::select! {
                    _ = quick.tick() => {
                        let _ = this.trigger(CycleKind::Quick);
                    }
                    _ = full.tick() => {
                        let _ = this.trigger(CycleKind::Full);
                    }
                    _ = purge.tick() => {
                        let cutoff = Utc::now() - chrono::Duration::days(cfg.retention_days);
                        match this.pipeline.store().purge_older_than(cutoff).await {
                            Ok(removed) => tracing::info!(
                                target: "ingest",
                                removed,
                                retention_days = cfg.retention_days,
                                "retention purge complete"
                            ),
                            Err(e) => tracing::error!(error = ?e, "retention purge failed"),
                        }
                    }
                }
            }
        })
    }
}
