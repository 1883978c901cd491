//! Invocation of the external flashing tool.
//!
//! The core never talks to the chip itself. Every probe, erase, write and
//! reset is a separate run of the tool, judged only by its exit code and its
//! merged stdout/stderr text.

use crate::config::DeviceConfig;
use crate::error::ToolError;
use async_trait::async_trait;
use log::{debug, warn};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Receives each output line as soon as the tool prints it.
pub type LineSender = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOperation {
    /// Read the chip id; touches nothing on the device.
    Identify,
    Erase,
    WriteImage { address: u32, image: PathBuf },
    Reset,
}

impl ToolOperation {
    pub fn name(&self) -> &'static str {
        match self {
            ToolOperation::Identify => "identify",
            ToolOperation::Erase => "erase",
            ToolOperation::WriteImage { .. } => "write",
            ToolOperation::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequest {
    pub port: String,
    pub baud: u32,
    pub operation: ToolOperation,
    /// `None` lets the tool run for as long as it needs.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal or by our timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Merged stdout and stderr, in arrival order.
    pub output: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs one operation to completion. `Err` means the tool never started;
    /// a tool that ran and failed is an `Ok` with a non-zero exit.
    async fn run(
        &self,
        request: &ToolRequest,
        lines: Option<LineSender>,
    ) -> Result<ToolOutput, ToolError>;
}

/// Runs `esptool` (or anything with the same command line) as a subprocess.
#[derive(Debug, Clone)]
pub struct EsptoolRunner {
    program: String,
    base_args: Vec<String>,
    chip: String,
}

impl EsptoolRunner {
    pub fn new(program: impl Into<String>, base_args: Vec<String>, chip: impl Into<String>) -> Self {
        EsptoolRunner {
            program: program.into(),
            base_args,
            chip: chip.into(),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(
            config.tool_program.clone(),
            config.tool_args.clone(),
            config.chip.clone(),
        )
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argument list for `request`, program excluded.
    pub fn args(&self, request: &ToolRequest) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend([
            "--chip".to_string(),
            self.chip.clone(),
            "--port".to_string(),
            request.port.clone(),
            "--baud".to_string(),
            request.baud.to_string(),
        ]);
        match &request.operation {
            ToolOperation::Identify => args.push("chip_id".to_string()),
            ToolOperation::Erase => args.push("erase_flash".to_string()),
            ToolOperation::WriteImage { address, image } => args.extend([
                "write_flash".to_string(),
                "-z".to_string(),
                format!("{:#x}", address),
                image.display().to_string(),
            ]),
            ToolOperation::Reset => args.push("run".to_string()),
        }
        args
    }
}

#[async_trait]
impl ToolRunner for EsptoolRunner {
    async fn run(
        &self,
        request: &ToolRequest,
        lines: Option<LineSender>,
    ) -> Result<ToolOutput, ToolError> {
        let args = self.args(request);
        debug!("Running {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            // esptool is Python; a piped stdout would hold every line until exit.
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut captured = String::new();

        let collect = async {
            let mut out = stdout.map(|s| BufReader::new(s).split(b'\n'));
            let mut err = stderr.map(|s| BufReader::new(s).split(b'\n'));
            while out.is_some() || err.is_some() {
                let chunk = tokio::select! {
                    next = async { out.as_mut()?.next_segment().await.ok().flatten() }, if out.is_some() => {
                        if next.is_none() { out = None; }
                        next
                    }
                    next = async { err.as_mut()?.next_segment().await.ok().flatten() }, if err.is_some() => {
                        if next.is_none() { err = None; }
                        next
                    }
                };
                if let Some(bytes) = chunk {
                    for line in split_lines(&bytes) {
                        captured.push_str(&line);
                        captured.push('\n');
                        if let Some(tx) = &lines {
                            // The reader may have gone away; the capture still matters.
                            let _ = tx.send(line);
                        }
                    }
                }
            }
            child.wait().await
        };

        let status = match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(status) => Some(status?),
                Err(_) => None,
            },
            None => Some(collect.await?),
        };

        match status {
            Some(status) => Ok(ToolOutput {
                exit_code: status.code(),
                timed_out: false,
                output: captured,
            }),
            None => {
                warn!(
                    "{} on {} timed out after {:?}",
                    request.operation.name(),
                    request.port,
                    request.timeout.unwrap_or_default()
                );
                if let Err(e) = child.kill().await {
                    debug!("Kill after timeout failed: {}", e);
                }
                Ok(ToolOutput {
                    exit_code: None,
                    timed_out: true,
                    output: captured,
                })
            }
        }
    }
}

/// Progress redraws use bare carriage returns, so both `\r` and `\n` end a
/// line. Blank fragments are dropped.
fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split('\r')
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
