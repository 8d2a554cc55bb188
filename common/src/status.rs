use serde::{Serialize, Deserialize};

/// Lifecycle of the connection to the firmware. The process always comes
/// back to `Startup` on reconnect; nothing here is permanently terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterState {
    Startup,
    Ready,
    Error,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Standby,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
}

impl JobState {
    /// States from which `start` is allowed (anything else must go
    /// through `resume` or `reset` first).
    pub fn can_start(self) -> bool {
        matches!(
            self,
            JobState::Standby | JobState::Complete | JobState::Cancelled | JobState::Error
        )
    }
}

/// Read-only view of the print job, pushed whenever the job manager
/// changes anything client-visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub filename: Option<String>,
    pub file_position: u64,
    pub file_size: u64,
    /// Normalized [0, 1]; exactly 1.0 on completion.
    pub progress: f64,
    pub message: Option<String>,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus {
            state: JobState::Standby,
            filename: None,
            file_position: 0,
            file_size: 0,
            progress: 0.0,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterInfo {
    pub state: PrinterState,
    pub state_message: String,
    pub firmware_name: Option<String>,
    pub machine_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaterReading {
    pub temperature: f64,
    pub target: f64,
    pub power: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdFileEntry {
    pub name: String,
    pub size: u64,
    pub display_name: Option<String>,
}
