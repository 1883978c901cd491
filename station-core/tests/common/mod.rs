//! Scripted stand-in for the flashing tool, plus fixtures.
#![allow(dead_code)]

use async_trait::async_trait;
use flash_station_lib::{
    ConfigStore, DeviceConfig, LineSender, StationEvent, ToolError, ToolOperation, ToolOutput,
    ToolRequest, ToolRunner,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};

/// What one scripted tool run does.
#[derive(Debug, Clone)]
pub enum Reply {
    Exit(i32, Vec<String>),
    TimedOut,
    LaunchFailure,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Exit(0, Vec::new())
    }

    pub fn ok_with(lines: &[&str]) -> Self {
        Reply::Exit(0, lines.iter().map(|l| l.to_string()).collect())
    }

    pub fn fail(code: i32, message: &str) -> Self {
        Reply::Exit(code, vec![message.to_string()])
    }
}

type Script = Box<dyn Fn(&ToolRequest) -> Reply + Send + Sync>;

struct Hold {
    operation: &'static str,
    started: Arc<Notify>,
    release: Arc<Notify>,
}

pub struct ScriptedRunner {
    script: Script,
    calls: Mutex<Vec<ToolRequest>>,
    hold: Mutex<Option<Hold>>,
}

impl ScriptedRunner {
    pub fn new(script: impl Fn(&ToolRequest) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(ScriptedRunner {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            hold: Mutex::new(None),
        })
    }

    /// Every operation succeeds silently.
    pub fn succeeding() -> Arc<Self> {
        Self::new(|_| Reply::ok())
    }

    /// Makes the next run of `operation` wait for `release`. Returns
    /// (started, release).
    pub fn hold(&self, operation: &'static str) -> (Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.hold.lock() = Some(Hold {
            operation,
            started: started.clone(),
            release: release.clone(),
        });
        (started, release)
    }

    pub fn calls(&self) -> Vec<ToolRequest> {
        self.calls.lock().clone()
    }

    /// Operation names in call order, e.g. `["identify", "erase", ...]`.
    pub fn operations(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|r| r.operation.name()).collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.operations()
            .into_iter()
            .filter(|op| *op == operation)
            .count()
    }
}

#[async_trait]
impl ToolRunner for ScriptedRunner {
    async fn run(
        &self,
        request: &ToolRequest,
        lines: Option<LineSender>,
    ) -> Result<ToolOutput, ToolError> {
        self.calls.lock().push(request.clone());

        let hold = {
            let mut hold = self.hold.lock();
            let wanted = hold
                .as_ref()
                .map_or(false, |h| h.operation == request.operation.name());
            if wanted {
                hold.take()
            } else {
                None
            }
        };
        if let Some(hold) = hold {
            hold.started.notify_one();
            hold.release.notified().await;
        }

        match (self.script)(request) {
            Reply::LaunchFailure => Err(ToolError::Launch {
                program: "esptool".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
            }),
            Reply::TimedOut => Ok(ToolOutput {
                exit_code: None,
                timed_out: true,
                output: String::new(),
            }),
            Reply::Exit(code, out) => {
                let mut output = String::new();
                for line in out {
                    output.push_str(&line);
                    output.push('\n');
                    if let Some(tx) = &lines {
                        let _ = tx.send(line);
                    }
                }
                Ok(ToolOutput {
                    exit_code: Some(code),
                    timed_out: false,
                    output,
                })
            }
        }
    }
}

pub fn is_write(request: &ToolRequest) -> bool {
    matches!(request.operation, ToolOperation::WriteImage { .. })
}

/// A temp directory holding a firmware image, a config file and a counter.
pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<ConfigStore>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let firmware = dir.path().join("fw.bin");
        std::fs::write(&firmware, [0xE9u8; 64]).expect("write firmware");
        let store = Arc::new(ConfigStore::new(dir.path().join("station.json")));
        let config = DeviceConfig {
            firmware_path: firmware,
            baud: 460_800,
            fallback_baud: 115_200,
            counter_path: dir.path().join("count.txt"),
            ..DeviceConfig::default()
        };
        store.save(&config).expect("save config");
        Fixture { dir, store }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn config(&self) -> DeviceConfig {
        self.store.try_load().expect("config")
    }

    pub fn counter(&self) -> String {
        std::fs::read_to_string(self.path("count.txt")).unwrap_or_default()
    }
}

/// Collects events until the next job result (inclusive).
pub async fn events_until_result(rx: &mut mpsc::UnboundedReceiver<StationEvent>) -> Vec<StationEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a job result")
            .expect("event channel closed");
        let done = matches!(event, StationEvent::JobResult { .. });
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<StationEvent>) -> Vec<StationEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}
