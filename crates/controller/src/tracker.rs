//! Background build tracking.
//!
//! After a build is triggered, a tracker polls the build server on a fixed
//! interval until the build reaches a terminal status, the poll ceiling is
//! hit, polls keep failing, or the tracker is cancelled. Every observed status
//! change is written through to the job store.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::jenkins::BuildServer;
use crate::model::{BuildStatus, TrackingState};
use crate::store::{JobStore, StatusUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub max_consecutive_failures: u32,
}

impl TrackerSettings {
    #[must_use]
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_polls: config.max_polls.max(1),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}

/// The build a tracker follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackTarget {
    pub job_name: String,
    pub job_id: String,
    /// Latest build number seen before the trigger
    pub baseline_build: Option<u64>,
}

/// How a tracking run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingOutcome {
    /// The build reached a terminal status.
    Finished {
        status: BuildStatus,
        build_number: Option<u64>,
    },
    /// The build server reported a status outside the known vocabulary.
    Unrecognized { build_number: Option<u64> },
    /// The poll ceiling was reached while the build was still active.
    TimedOut { polls: u32 },
    /// Polling failed repeatedly.
    Unavailable { failures: u32, last_error: String },
    Cancelled,
}

impl TrackingOutcome {
    #[must_use]
    pub fn tracking_state(&self) -> TrackingState {
        match self {
            TrackingOutcome::Finished { .. } => TrackingState::Completed,
            TrackingOutcome::TimedOut { .. } => TrackingState::TimedOut,
            TrackingOutcome::Unrecognized { .. } | TrackingOutcome::Unavailable { .. } => {
                TrackingState::Unavailable
            }
            TrackingOutcome::Cancelled => TrackingState::Cancelled,
        }
    }

    /// Final write applied to the job record.
    #[must_use]
    pub fn status_update(&self) -> StatusUpdate {
        let tracking = self.tracking_state();
        match self {
            TrackingOutcome::Finished {
                status,
                build_number,
            } => StatusUpdate::status(*status, *build_number).with_tracking(tracking),
            TrackingOutcome::Unrecognized { build_number } => {
                StatusUpdate::status(BuildStatus::Unknown, *build_number).with_tracking(tracking)
            }
            TrackingOutcome::TimedOut { .. } | TrackingOutcome::Unavailable { .. } => {
                StatusUpdate::status(BuildStatus::Unknown, None).with_tracking(tracking)
            }
            TrackingOutcome::Cancelled => StatusUpdate {
                tracking: Some(tracking),
                ..StatusUpdate::default()
            },
        }
    }
}

/// Control handle for a spawned tracker.
pub struct TrackingHandle {
    id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<TrackingOutcome>,
}

impl TrackingHandle {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Token that stops the poll loop when cancelled.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the tracker and wait for its final write.
    pub async fn stop(self) -> TrackingOutcome {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the tracker to end on its own.
    pub async fn join(self) -> TrackingOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Build tracker {} ended abnormally: {}", self.id, e);
                TrackingOutcome::Cancelled
            }
        }
    }
}

#[derive(Clone)]
pub struct BuildTracker {
    build_server: Arc<dyn BuildServer>,
    store: Arc<dyn JobStore>,
    settings: TrackerSettings,
}

impl BuildTracker {
    #[must_use]
    pub fn new(
        build_server: Arc<dyn BuildServer>,
        store: Arc<dyn JobStore>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            build_server,
            store,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> TrackerSettings {
        self.settings
    }

    /// Run tracking on its own task. `on_finish` receives the handle ID once
    /// the final status has been written.
    pub fn spawn<F>(&self, target: TrackTarget, on_finish: F) -> TrackingHandle
    where
        F: FnOnce(Uuid) + Send + 'static,
    {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let tracker = self.clone();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let outcome = tracker.run(&target, &token).await;
            on_finish(id);
            outcome
        });

        TrackingHandle { id, cancel, task }
    }

    /// Poll until the build settles and record the outcome.
    pub async fn run(&self, target: &TrackTarget, cancel: &CancellationToken) -> TrackingOutcome {
        info!(
            job = %target.job_name,
            interval_ms = u64::try_from(self.settings.poll_interval.as_millis()).unwrap_or(u64::MAX),
            max_polls = self.settings.max_polls,
            "Build tracking started"
        );

        let outcome = self.poll_until_settled(target, cancel).await;

        match self
            .store
            .update_build_status(&target.job_name, outcome.status_update())
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => debug!(job = %target.job_name, "Job record gone before tracking ended"),
            Err(e) => warn!(job = %target.job_name, "Failed to record tracking outcome: {}", e),
        }

        info!(job = %target.job_name, outcome = ?outcome, "Build tracking finished");
        outcome
    }

    async fn poll_until_settled(
        &self,
        target: &TrackTarget,
        cancel: &CancellationToken,
    ) -> TrackingOutcome {
        let mut consecutive_failures: u32 = 0;
        let mut last_written: Option<BuildStatus> = None;

        for poll in 1..=self.settings.max_polls {
            if cancel.is_cancelled() {
                return TrackingOutcome::Cancelled;
            }

            match self.build_server.latest_build_status(&target.job_id).await {
                Ok(snapshot) => {
                    consecutive_failures = 0;
                    let status = snapshot.relative_to(target.baseline_build);
                    let build_number = snapshot
                        .number
                        .filter(|number| target.baseline_build.map_or(true, |base| *number > base));
                    debug!(job = %target.job_name, poll, status = %status, "Polled build status");

                    if status == BuildStatus::Unknown {
                        return TrackingOutcome::Unrecognized { build_number };
                    }
                    if status.is_terminal() {
                        return TrackingOutcome::Finished {
                            status,
                            build_number,
                        };
                    }
                    if last_written != Some(status) {
                        match self
                            .store
                            .update_build_status(
                                &target.job_name,
                                StatusUpdate::status(status, build_number),
                            )
                            .await
                        {
                            Ok(Some(_)) => last_written = Some(status),
                            Ok(None) => return TrackingOutcome::Cancelled,
                            Err(e) => {
                                warn!(job = %target.job_name, "Failed to record build status: {}", e);
                            }
                        }
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        job = %target.job_name,
                        poll,
                        consecutive_failures,
                        "Build status poll failed: {}", e
                    );
                    if consecutive_failures >= self.settings.max_consecutive_failures {
                        return TrackingOutcome::Unavailable {
                            failures: consecutive_failures,
                            last_error: e.to_string(),
                        };
                    }
                }
            }

            if poll == self.settings.max_polls {
                break;
            }

            tokio::select! {
                () = cancel.cancelled() => return TrackingOutcome::Cancelled,
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        TrackingOutcome::TimedOut {
            polls: self.settings.max_polls,
        }
    }
}
