//! Backup scheduler: decides when a backup runs and runs at most one at a time.
//!
//! State machine: Idle -> Due -> Running -> Idle. A timer tick or a manual trigger makes the
//! scheduler Due; it only proceeds to Running when nothing else is running and cloud backup
//! is enabled, otherwise the signal is dropped. Outcomes go to the status tracker; failures
//! never stop the loop and never shift the schedule.

use crate::domain::{
    BackupArtifact, BackupEvent, BackupOutcome, BackupSettings, BackupStatusRecord, DomainError,
    UploadMetadata,
};
use crate::usecases::events::EventBus;
use crate::usecases::gate::LiveStateGate;
use crate::usecases::remote_store::RemoteStore;
use crate::usecases::settings_store::SettingsStore;
use crate::usecases::snapshot::{self, SnapshotProducer};
use crate::usecases::status_tracker::BackupStatusTracker;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reminders repeat at most this often.
const REMINDER_COOLDOWN_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Due,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Manual,
    Timer,
}

pub struct BackupScheduler {
    settings: Arc<SettingsStore>,
    producer: SnapshotProducer,
    remote: Arc<RemoteStore>,
    tracker: Arc<BackupStatusTracker>,
    events: EventBus,
    gate: LiveStateGate,
    state: Mutex<SchedulerState>,
    last_reminder_at: Mutex<Option<DateTime<Utc>>>,
    current_run: Mutex<Option<CancellationToken>>,
}

impl BackupScheduler {
    pub fn new(
        settings: Arc<SettingsStore>,
        producer: SnapshotProducer,
        remote: Arc<RemoteStore>,
        tracker: Arc<BackupStatusTracker>,
        events: EventBus,
        gate: LiveStateGate,
    ) -> Self {
        Self {
            settings,
            producer,
            remote,
            tracker,
            events,
            gate,
            state: Mutex::new(SchedulerState::Idle),
            last_reminder_at: Mutex::new(None),
            current_run: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.state)
    }

    /// When the timer will next consider a backup due. `None` for manual schedules.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let settings = self.settings.get();
        match self.tracker.current().last_attempt_at {
            Some(last) => next_due_after(&settings, last),
            None => settings.backup_frequency.interval().map(|_| Utc::now()),
        }
    }

    /// Run one backup now. Dropped signals return `BackupInProgress` or `CloudBackupDisabled`
    /// without touching the status record; a run that starts always records its outcome.
    pub async fn trigger(&self, source: TriggerSource) -> Result<BackupStatusRecord, DomainError> {
        let (settings, cancel) = {
            let mut state = lock(&self.state);
            if *state == SchedulerState::Running {
                info!(?source, "due signal dropped: a backup is already running");
                return Err(DomainError::BackupInProgress);
            }
            *state = SchedulerState::Due;
            let settings = self.settings.get();
            if !settings.cloud_backup_enabled {
                *state = SchedulerState::Idle;
                info!(?source, "due signal dropped: cloud backup disabled");
                return Err(DomainError::CloudBackupDisabled);
            }
            *state = SchedulerState::Running;
            let cancel = CancellationToken::new();
            *lock(&self.current_run) = Some(cancel.clone());
            (settings, cancel)
        };
        let _running = RunningGuard { scheduler: self };

        let started = Utc::now();
        info!(?source, "backup started");
        let result = self.run_pipeline(&settings, &cancel).await;

        let outcome = match &result {
            Ok(artifact) => BackupOutcome::succeeded(started, Some(artifact.id.clone())),
            Err(e) => {
                error!(?source, error = %e, "backup failed");
                BackupOutcome::failed(started, e)
            }
        };
        let record = self.tracker.record(outcome).await;
        self.events.publish(BackupEvent::BackupCompleted {
            record: record.clone(),
        });
        result.map(|_| record)
    }

    /// Cancel the running backup, if any. The in-flight artifact ends up failed.
    pub fn cancel_running(&self) -> bool {
        match lock(&self.current_run).as_ref() {
            Some(token) => {
                token.cancel();
                info!("backup cancellation requested");
                true
            }
            None => false,
        }
    }

    /// One timer evaluation: emit a reminder if due, then run a backup if due.
    /// Returns `None` when no backup was due.
    pub async fn tick_at(
        &self,
        now: DateTime<Utc>,
    ) -> Option<Result<BackupStatusRecord, DomainError>> {
        let settings = self.settings.get();
        let status = self.tracker.current();
        self.maybe_remind(&settings, &status, now);

        if !settings.cloud_backup_enabled {
            debug!("cloud backup disabled; timer idle");
            return None;
        }
        if !is_due(&settings, &status, now) {
            return None;
        }
        Some(self.trigger(TriggerSource::Timer).await)
    }

    /// Timer loop. A run in progress at shutdown is cancelled and allowed to clean up.
    pub async fn run_loop(self: Arc<Self>, tick: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_secs = tick.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let run = self.tick_at(Utc::now());
            tokio::pin!(run);
            let result = tokio::select! {
                r = &mut run => r,
                _ = shutdown.cancelled() => {
                    self.cancel_running();
                    run.await
                }
            };
            match result {
                Some(Ok(record)) => debug!(message = %record.message, "scheduled backup done"),
                Some(Err(e)) => warn!(error = %e, "scheduled backup did not complete"),
                None => {}
            }
        }
        info!("scheduler stopped");
    }

    async fn run_pipeline(
        &self,
        settings: &BackupSettings,
        cancel: &CancellationToken,
    ) -> Result<BackupArtifact, DomainError> {
        let account = self.remote.require_connection()?;
        let _live = self.gate.acquire().await;

        let snap = self.producer.snapshot(&account).await?;
        if !settings.local_path.as_os_str().is_empty() {
            if let Err(e) = snapshot::write_local_copy(&settings.local_path, &snap).await {
                warn!(path = %settings.local_path.display(), error = %e, "local copy failed");
            }
        }

        let metadata = UploadMetadata::from_snapshot(&snap);
        let artifact = self.remote.upload(&snap.blob, &metadata, cancel).await?;

        if let Some(keep) = settings.retention_count {
            if let Err(e) = self.remote.retire_old(keep as usize).await {
                warn!(error = %e, "retention pass failed");
            }
        }
        Ok(artifact)
    }

    fn maybe_remind(&self, settings: &BackupSettings, status: &BackupStatusRecord, now: DateTime<Utc>) {
        if !reminder_due(settings, status, now) {
            return;
        }
        {
            let mut last = lock(&self.last_reminder_at);
            if let Some(at) = *last {
                if now - at < ChronoDuration::hours(REMINDER_COOLDOWN_HOURS) {
                    return;
                }
            }
            *last = Some(now);
        }
        info!(
            last_success_at = ?status.last_success_at,
            interval_days = settings.reminder_interval_days,
            "backup reminder due"
        );
        self.events.publish(BackupEvent::ReminderDue {
            last_success_at: status.last_success_at,
            interval_days: settings.reminder_interval_days,
        });
    }
}

struct RunningGuard<'a> {
    scheduler: &'a BackupScheduler,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.scheduler.current_run) = None;
        *lock(&self.scheduler.state) = SchedulerState::Idle;
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// `last_attempt + interval`, moved to `backup_time` (UTC) on that date when one is set.
pub fn next_due_after(settings: &BackupSettings, last_attempt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let base = last_attempt + settings.backup_frequency.interval()?;
    Some(match settings.backup_time {
        Some(time) => base.date_naive().and_time(time).and_utc(),
        None => base,
    })
}

/// Manual schedules are never due. Without any previous attempt a backup is due at once.
pub fn is_due(settings: &BackupSettings, status: &BackupStatusRecord, now: DateTime<Utc>) -> bool {
    match status.last_attempt_at {
        _ if settings.backup_frequency.interval().is_none() => false,
        None => true,
        Some(last) => next_due_after(settings, last).is_some_and(|due| due <= now),
    }
}

/// No success within `reminder_interval_days` (a backup that never succeeded counts).
pub fn reminder_due(settings: &BackupSettings, status: &BackupStatusRecord, now: DateTime<Utc>) -> bool {
    if !settings.reminder_enabled {
        return false;
    }
    match status.last_success_at {
        Some(at) => now - at >= ChronoDuration::days(settings.reminder_interval_days as i64),
        None => true,
    }
}
