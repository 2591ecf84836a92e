//! Scheduler-level pause/resume switches. They gate the next run; an
//! in-flight run is never interrupted.

use std::fmt;

use chrono::{DateTime, Utc};
use eip_core::ControlFlags;
use eip_storage::{ControlFlag, Database, StorageError};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    PauseAi,
    ResumeAi,
    EmergencyStop,
    Restart,
}

impl ControlAction {
    pub const ALL: [ControlAction; 6] = [
        ControlAction::Pause,
        ControlAction::Resume,
        ControlAction::PauseAi,
        ControlAction::ResumeAi,
        ControlAction::EmergencyStop,
        ControlAction::Restart,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::PauseAi => "pause-ai",
            ControlAction::ResumeAi => "resume-ai",
            ControlAction::EmergencyStop => "emergency-stop",
            ControlAction::Restart => "restart",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == value)
    }

    fn changes(self) -> &'static [(ControlFlag, bool)] {
        match self {
            ControlAction::Pause => &[(ControlFlag::Pipeline, false)],
            ControlAction::Resume => &[(ControlFlag::Pipeline, true)],
            ControlAction::PauseAi => &[(ControlFlag::Ai, false)],
            ControlAction::ResumeAi => &[(ControlFlag::Ai, true)],
            ControlAction::EmergencyStop => &[(ControlFlag::Pipeline, false), (ControlFlag::Ai, false)],
            ControlAction::Restart => &[(ControlFlag::Pipeline, true), (ControlFlag::Ai, true)],
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub async fn apply_control(
    db: &Database,
    action: ControlAction,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ControlFlags, StorageError> {
    let reason = reason.map(str::to_string).unwrap_or_else(|| action.to_string());
    for (flag, enabled) in action.changes() {
        db.set_control_flag(*flag, *enabled, Some(&reason), now).await?;
    }
    info!(action = action.as_str(), reason = %reason, "pipeline control updated");
    db.control_flags().await
}
