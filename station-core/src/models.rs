use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A candidate serial device node. `discovered_at` is the index in the sorted
/// scan; the highest index is treated as the most recently attached device.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SerialPort {
    pub path: String,
    pub discovered_at: usize,
}

/// A (port, baud) pair the chip answered on.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CommLink {
    pub port: String,
    pub baud: u32,
    pub confirmed_at: DateTime<Utc>,
}

impl CommLink {
    pub fn confirmed(port: impl Into<String>, baud: u32) -> Self {
        CommLink {
            port: port.into(),
            baud,
            confirmed_at: Utc::now(),
        }
    }
}

impl fmt::Display for CommLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.port, self.baud)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlashStage {
    Idle,
    Erasing,
    Writing,
    Resetting,
    Succeeded,
    Failed,
}

impl fmt::Display for FlashStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlashStage::Idle => "idle",
            FlashStage::Erasing => "erasing",
            FlashStage::Writing => "writing",
            FlashStage::Resetting => "resetting",
            FlashStage::Succeeded => "succeeded",
            FlashStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One provisioning attempt. Only the sequencer creates or advances these;
/// everyone else sees clones.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FlashJob {
    pub id: u64,
    pub firmware: PathBuf,
    pub link: CommLink,
    pub stage: FlashStage,
    pub progress: u8,
    pub error: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FlashSummary {
    pub job_id: u64,
    pub link: CommLink,
    pub firmware: PathBuf,
    pub elapsed: Duration,
    pub flash_count: u64,
    pub counter_warning: Option<PersistenceWarning>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub percent: u8,
}

/// A file that could not be written after the work it records already
/// happened. Reported, never escalated.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PersistenceWarning {
    pub what: String,
    pub detail: String,
}

impl fmt::Display for PersistenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not save {}: {}", self.what, self.detail)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobOutcome {
    Success { flash_count: u64 },
    Failure { message: String, diagnostics: Option<String> },
}

/// Everything the station reports to the presentation shell.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StationEvent {
    PortsScanned { ports: Vec<SerialPort> },
    PortSelected { port: SerialPort },
    LinkEstablished { link: CommLink },
    StageChanged { job_id: u64, stage: FlashStage },
    Progress { job_id: u64, percent: u8 },
    LogLine { line: String },
    JobResult { job_id: u64, outcome: JobOutcome },
    CounterUpdated { count: u64 },
    Warning { message: String },
    Error { message: String, diagnostics: Option<String> },
}

/// What the USB bus shows when no serial node is present.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct HardwareHint {
    pub vid_pid: String,
    pub product_name: Option<String>,
    pub connection_type: String,
}

impl fmt::Display for HardwareHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "USB device {} ({}) is attached but has no serial port; check the driver",
            self.vid_pid, self.connection_type
        )?;
        if let Some(product) = &self.product_name {
            write!(f, " [{}]", product)?;
        }
        Ok(())
    }
}
