//! Implements InputPort. Inquire-based interactive menu over the backup engine.

use crate::adapters::ui::progress::{format_bytes, with_spinner};
use crate::domain::{
    ArtifactRef, ArtifactStatus, BackupArtifact, BackupEvent, BackupFrequency, DomainError,
    RemoteConnection, SettingsUpdate,
};
use crate::ports::InputPort;
use crate::usecases::{BackupEngine, Subscription};
use async_trait::async_trait;
use chrono::NaiveTime;
use inquire::error::InquireError;
use inquire::ui::{Color, RenderConfig, Styled};
use inquire::{Confirm, CustomType, Select, Text};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuItem {
    BackupNow,
    ListBackups,
    Restore,
    DeleteBackup,
    Connect,
    Disconnect,
    Settings,
    Status,
    Quit,
}

impl fmt::Display for MenuItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MenuItem::BackupNow => "Back up now",
            MenuItem::ListBackups => "List backups",
            MenuItem::Restore => "Restore from a backup",
            MenuItem::DeleteBackup => "Delete a backup",
            MenuItem::Connect => "Connect Google account",
            MenuItem::Disconnect => "Disconnect Google account",
            MenuItem::Settings => "Settings",
            MenuItem::Status => "Status",
            MenuItem::Quit => "Quit",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy)]
enum SettingsItem {
    CloudBackup,
    Frequency,
    BackupTime,
    Reminder,
    ReminderDays,
    LocalPath,
    Retention,
    Back,
}

impl fmt::Display for SettingsItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SettingsItem::CloudBackup => "Toggle cloud backup",
            SettingsItem::Frequency => "Backup frequency",
            SettingsItem::BackupTime => "Backup time (UTC)",
            SettingsItem::Reminder => "Toggle reminders",
            SettingsItem::ReminderDays => "Reminder interval (days)",
            SettingsItem::LocalPath => "Local copy directory",
            SettingsItem::Retention => "Remote retention count",
            SettingsItem::Back => "Back",
        };
        f.write_str(label)
    }
}

/// Select option wrapping an artifact.
struct ArtifactChoice(BackupArtifact);

impl fmt::Display for ArtifactChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {}  {}  [{}]",
            self.0.name,
            self.0.created_at.format("%Y-%m-%d %H:%M UTC"),
            format_bytes(self.0.size_bytes),
            self.0.status.as_str()
        )
    }
}

/// Colored prompt prefix and cursor for every inquire prompt. Call once at startup.
pub fn apply_theme() {
    let mut config = RenderConfig::default_colored();
    config.prompt_prefix = Styled::new("?").with_fg(Color::LightCyan);
    config.highlighted_option_prefix = Styled::new(">").with_fg(Color::LightGreen);
    inquire::set_global_render_config(config);
}

/// Esc / Ctrl-C on a prompt cancels the current action, not the program.
fn prompt_err(e: InquireError) -> DomainError {
    match e {
        InquireError::OperationCanceled | InquireError::OperationInterrupted => DomainError::Cancelled,
        other => DomainError::Io(other.to_string()),
    }
}

fn parse_backup_time(input: &str) -> Result<Option<NaiveTime>, String> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }
    NaiveTime::parse_from_str(input, "%H:%M")
        .map(Some)
        .map_err(|_| format!("'{}' is not HH:MM", input))
}

fn describe_event(event: &BackupEvent) -> Option<String> {
    match event {
        BackupEvent::ReminderDue {
            last_success_at,
            interval_days,
        } => Some(match last_success_at {
            Some(at) => format!(
                "Reminder: last successful backup was {} (more than {} days ago).",
                at.format("%Y-%m-%d"),
                interval_days
            ),
            None => "Reminder: no backup has ever completed.".to_string(),
        }),
        BackupEvent::ConnectionLost { reason } => {
            Some(format!("Google account disconnected: {}", reason))
        }
        BackupEvent::BackupCompleted { record } if !record.success => {
            Some(format!("Scheduled backup: {}", record.message))
        }
        _ => None,
    }
}

/// TUI adapter. Inquire prompts.
pub struct TuiInputPort {
    engine: Arc<BackupEngine>,
    events: Mutex<Subscription>,
}

impl TuiInputPort {
    pub fn new(engine: Arc<BackupEngine>) -> Self {
        let events = Mutex::new(engine.subscribe());
        Self { engine, events }
    }

    /// Print notices for events that arrived while the menu was idle.
    fn drain_notices(&self) {
        let Ok(mut events) = self.events.lock() else {
            return;
        };
        while let Some(event) = events.try_recv() {
            if let Some(line) = describe_event(&event) {
                println!("  ! {}", line);
            }
        }
    }

    async fn dispatch(&self, item: MenuItem) -> Result<(), DomainError> {
        match item {
            MenuItem::BackupNow => self.backup_now().await,
            MenuItem::ListBackups => self.list_backups().await,
            MenuItem::Restore => self.restore().await,
            MenuItem::DeleteBackup => self.delete_backup().await,
            MenuItem::Connect => self.connect().await,
            MenuItem::Disconnect => self.disconnect().await,
            MenuItem::Settings => self.settings().await,
            MenuItem::Status => {
                self.show_status();
                Ok(())
            }
            MenuItem::Quit => Ok(()),
        }
    }

    async fn backup_now(&self) -> Result<(), DomainError> {
        let record = with_spinner("Backing up", self.engine.run_backup()).await?;
        println!("{}", record.message);
        if let Some(id) = record.artifact_id {
            println!("Artifact: {}", id);
        }
        Ok(())
    }

    async fn list_backups(&self) -> Result<(), DomainError> {
        let artifacts = with_spinner("Listing backups", self.engine.list_backups()).await?;
        if artifacts.is_empty() {
            println!("No backups stored yet.");
            return Ok(());
        }
        for a in &artifacts {
            println!("{}", ArtifactChoice(a.clone()));
            if let Some(link) = &a.shareable_link {
                println!("    {}", link);
            }
        }
        Ok(())
    }

    async fn pick_artifact(&self, prompt: &str, restorable_only: bool) -> Result<Option<BackupArtifact>, DomainError> {
        let artifacts: Vec<ArtifactChoice> = with_spinner("Listing backups", self.engine.list_backups())
            .await?
            .into_iter()
            .filter(|a| !restorable_only || a.status == ArtifactStatus::Success)
            .map(ArtifactChoice)
            .collect();
        if artifacts.is_empty() {
            println!("No backups available.");
            return Ok(None);
        }
        let choice = Select::new(prompt, artifacts).prompt().map_err(prompt_err)?;
        Ok(Some(choice.0))
    }

    async fn restore(&self) -> Result<(), DomainError> {
        let sources = vec!["Google Drive", "Local archive file"];
        let source = Select::new("Restore from", sources)
            .prompt()
            .map_err(prompt_err)?;
        let reference = if source == "Google Drive" {
            match self.pick_artifact("Backup to restore", true).await? {
                Some(a) => ArtifactRef::Remote(a.id),
                None => return Ok(()),
            }
        } else {
            let path = Text::new("Path to archive:").prompt().map_err(prompt_err)?;
            ArtifactRef::Local(PathBuf::from(path.trim()))
        };

        let plan = self.engine.prepare_restore(&reference).await?;
        println!(
            "This will replace ALL current data with {} ({}, created {} by {}).",
            plan.artifact.name,
            format_bytes(plan.artifact.size_bytes),
            plan.artifact.created_at.format("%Y-%m-%d %H:%M UTC"),
            plan.artifact.created_by
        );
        let confirmed = Confirm::new("Restore now?")
            .with_default(false)
            .prompt()
            .map_err(prompt_err)?;
        if !confirmed {
            println!("Restore aborted; nothing was changed.");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let result = with_spinner(
            "Restoring",
            self.engine.restore(&reference, Some(&plan.token), &cancel),
        )
        .await?;
        println!(
            "Restored {} ({}). Reload the application to see the restored data.",
            result.artifact_name,
            format_bytes(result.bytes_restored)
        );
        Ok(())
    }

    async fn delete_backup(&self) -> Result<(), DomainError> {
        let Some(artifact) = self.pick_artifact("Backup to delete", false).await? else {
            return Ok(());
        };
        let confirmed = Confirm::new(&format!("Delete {}?", artifact.name))
            .with_default(false)
            .prompt()
            .map_err(prompt_err)?;
        if confirmed {
            self.engine.delete_backup(&artifact.id).await?;
            println!("Deleted {}.", artifact.name);
        }
        Ok(())
    }

    async fn connect(&self) -> Result<(), DomainError> {
        let hint = Text::new("Google account (optional):")
            .prompt()
            .map_err(prompt_err)?;
        let hint = hint.trim();
        let hint = (!hint.is_empty()).then_some(hint);
        println!("Complete the sign-in in your browser.");
        let connection = self.engine.connect(hint, &CancellationToken::new()).await?;
        if let Some(email) = connection.account_email() {
            println!("Connected as {}.", email);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DomainError> {
        let confirmed = Confirm::new("Disconnect and turn off cloud backup?")
            .with_default(false)
            .prompt()
            .map_err(prompt_err)?;
        if confirmed {
            self.engine.disconnect().await?;
            println!("Disconnected.");
        }
        Ok(())
    }

    async fn settings(&self) -> Result<(), DomainError> {
        loop {
            let s = self.engine.get_settings();
            println!(
                "cloud backup: {} | frequency: {:?} | time: {} | reminders: {} every {} days | local copies: {} | keep: {}",
                if s.cloud_backup_enabled { "on" } else { "off" },
                s.backup_frequency,
                s.backup_time
                    .map(|t| t.format("%H:%M").to_string())
                    .unwrap_or_else(|| "-".into()),
                if s.reminder_enabled { "on" } else { "off" },
                s.reminder_interval_days,
                if s.local_path.as_os_str().is_empty() {
                    "off".to_string()
                } else {
                    s.local_path.display().to_string()
                },
                s.retention_count
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "all".into()),
            );
            let items = vec![
                SettingsItem::CloudBackup,
                SettingsItem::Frequency,
                SettingsItem::BackupTime,
                SettingsItem::Reminder,
                SettingsItem::ReminderDays,
                SettingsItem::LocalPath,
                SettingsItem::Retention,
                SettingsItem::Back,
            ];
            let item = Select::new("Change", items).prompt().map_err(prompt_err)?;
            let update = match item {
                SettingsItem::Back => return Ok(()),
                SettingsItem::CloudBackup => SettingsUpdate {
                    cloud_backup_enabled: Some(!s.cloud_backup_enabled),
                    ..Default::default()
                },
                SettingsItem::Frequency => {
                    let options = vec![
                        BackupFrequency::Daily,
                        BackupFrequency::Weekly,
                        BackupFrequency::Monthly,
                        BackupFrequency::Manual,
                    ];
                    let labels: Vec<String> = options.iter().map(|f| format!("{:?}", f)).collect();
                    let picked = Select::new("Frequency", labels)
                        .raw_prompt()
                        .map_err(prompt_err)?;
                    SettingsUpdate {
                        backup_frequency: Some(options[picked.index]),
                        ..Default::default()
                    }
                }
                SettingsItem::BackupTime => {
                    let raw = Text::new("Time of day, HH:MM UTC (empty clears):")
                        .prompt()
                        .map_err(prompt_err)?;
                    match parse_backup_time(&raw) {
                        Ok(t) => SettingsUpdate {
                            backup_time: Some(t),
                            ..Default::default()
                        },
                        Err(msg) => {
                            println!("{}", msg);
                            continue;
                        }
                    }
                }
                SettingsItem::Reminder => SettingsUpdate {
                    reminder_enabled: Some(!s.reminder_enabled),
                    ..Default::default()
                },
                SettingsItem::ReminderDays => {
                    let days = CustomType::<u32>::new("Remind after how many days without a backup?")
                        .with_default(s.reminder_interval_days)
                        .prompt()
                        .map_err(prompt_err)?;
                    SettingsUpdate {
                        reminder_interval_days: Some(days),
                        ..Default::default()
                    }
                }
                SettingsItem::LocalPath => {
                    let raw = Text::new("Directory for local copies (empty disables):")
                        .prompt()
                        .map_err(prompt_err)?;
                    SettingsUpdate {
                        local_path: Some(PathBuf::from(raw.trim())),
                        ..Default::default()
                    }
                }
                SettingsItem::Retention => {
                    let keep = CustomType::<u32>::new("Keep how many backups? (0 keeps all)")
                        .with_default(s.retention_count.unwrap_or(0))
                        .prompt()
                        .map_err(prompt_err)?;
                    SettingsUpdate {
                        retention_count: Some((keep > 0).then_some(keep)),
                        ..Default::default()
                    }
                }
            };
            if let Err(e) = self.engine.update_settings(update).await {
                println!("{}", e);
            }
        }
    }

    fn show_status(&self) {
        match self.engine.connection() {
            RemoteConnection::Connected { account_email } => println!("Google account: {}", account_email),
            RemoteConnection::Connecting { .. } => println!("Google account: connecting..."),
            RemoteConnection::Disconnected => println!("Google account: not connected"),
        }
        let status = self.engine.status();
        match status.last_attempt_at {
            Some(at) => println!(
                "Last backup: {} ({})",
                at.format("%Y-%m-%d %H:%M UTC"),
                status.message
            ),
            None => println!("{}", status.message),
        }
        if let Some(at) = status.last_success_at {
            println!("Last success: {}", at.format("%Y-%m-%d %H:%M UTC"));
        }
        match self.engine.next_due() {
            Some(at) => println!("Next scheduled backup: {}", at.format("%Y-%m-%d %H:%M UTC")),
            None => println!("No automatic backup scheduled."),
        }
    }
}

#[async_trait]
impl InputPort for TuiInputPort {
    async fn run(&self) -> Result<(), DomainError> {
        let items = vec![
            MenuItem::BackupNow,
            MenuItem::ListBackups,
            MenuItem::Restore,
            MenuItem::DeleteBackup,
            MenuItem::Connect,
            MenuItem::Disconnect,
            MenuItem::Settings,
            MenuItem::Status,
            MenuItem::Quit,
        ];
        loop {
            self.drain_notices();
            let item = match Select::new("What next?", items.clone()).prompt() {
                Ok(item) => item,
                Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => {
                    return Ok(());
                }
                Err(e) => return Err(prompt_err(e)),
            };
            if item == MenuItem::Quit {
                return Ok(());
            }
            match self.dispatch(item).await {
                Ok(()) => {}
                Err(DomainError::Cancelled) => println!("Cancelled."),
                Err(e) => {
                    warn!(action = %item, error = %e, "menu action failed");
                    println!("Error: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BackupStatusRecord;
    use chrono::{TimeZone, Utc};

    #[test]
    fn backup_time_accepts_hh_mm_or_empty() {
        assert_eq!(parse_backup_time(" "), Ok(None));
        assert_eq!(
            parse_backup_time("02:30"),
            Ok(NaiveTime::from_hms_opt(2, 30, 0))
        );
        assert!(parse_backup_time("25:99").is_err());
    }

    #[test]
    fn reminder_notice_mentions_last_success() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let line = describe_event(&BackupEvent::ReminderDue {
            last_success_at: Some(at),
            interval_days: 7,
        })
        .unwrap();
        assert!(line.contains("2024-03-01"));
        assert!(line.contains("7 days"));
    }

    #[test]
    fn successful_backups_are_not_noticed() {
        let mut record = BackupStatusRecord::never_run();
        record.success = true;
        assert!(describe_event(&BackupEvent::BackupCompleted { record }).is_none());
        assert!(describe_event(&BackupEvent::ReloadRequested).is_none());
    }
}
