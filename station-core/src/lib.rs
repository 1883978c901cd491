//! Provisioning core for an ESP32 factory flash station.
//!
//! Finds the board's serial port, negotiates a baud rate with the flashing
//! tool, runs erase/write/reset through it and keeps a durable count of
//! successful flashes. Presentation is left to whoever holds the
//! [`StationHandle`].

pub mod config;
pub mod counter;
pub mod error;
pub mod events;
pub mod models;
pub mod negotiator;
pub mod ports;
pub mod progress;
pub mod sequencer;
pub mod station;
pub mod tool;

pub use config::{ConfigKey, ConfigStore, DeviceConfig};
pub use counter::{CounterStore, CounterUpdate};
pub use error::{CommError, ConfigError, FlashError, StationError, ToolError};
pub use events::EventSink;
pub use models::{
    CommLink, FlashJob, FlashStage, FlashSummary, HardwareHint, JobOutcome, PersistenceWarning,
    ProgressEvent, SerialPort, StationEvent,
};
pub use negotiator::BaudNegotiator;
pub use ports::{list_ports, FixedPorts, PortSource, SystemPorts};
pub use progress::{parse_percent, MonitorItem, ProgressMonitor};
pub use sequencer::FlashSequencer;
pub use station::{Station, StationBuilder, StationHandle, StationSnapshot};
pub use tool::{EsptoolRunner, LineSender, ToolOperation, ToolOutput, ToolRequest, ToolRunner};
