use crate::config::{ConfigStore, DEFAULT_PROBE_TIMEOUT_SECS};
use crate::error::{CommError, ToolError};
use crate::events::EventSink;
use crate::models::{CommLink, PersistenceWarning};
use crate::tool::{ToolOperation, ToolOutput, ToolRequest, ToolRunner};
use log::{info, warn};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

/// Finds a baud rate the chip answers on.
///
/// USB-serial adapters are often slow to come up after plug-in or left at the
/// wrong speed, so a failed probe at the preferred rate is retried once at the
/// fallback rate before giving up.
pub struct BaudNegotiator {
    runner: Arc<dyn ToolRunner>,
    config: Arc<ConfigStore>,
    events: EventSink,
    probe_timeout: Duration,
}

impl BaudNegotiator {
    pub fn new(runner: Arc<dyn ToolRunner>, config: Arc<ConfigStore>, events: EventSink) -> Self {
        BaudNegotiator {
            runner,
            config,
            events,
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn set_probe_timeout(&mut self, probe_timeout: Duration) {
        self.probe_timeout = probe_timeout;
    }

    pub fn set_runner(&mut self, runner: Arc<dyn ToolRunner>) {
        self.runner = runner;
    }

    /// One identification run, bounded by the probe timeout.
    pub async fn probe(&self, port: &str, baud: u32) -> Result<ToolOutput, ToolError> {
        let request = ToolRequest {
            port: port.to_string(),
            baud,
            operation: ToolOperation::Identify,
            timeout: Some(self.probe_timeout),
        };
        self.runner.run(&request, None).await
    }

    pub async fn negotiate(
        &self,
        port: &str,
        preferred_baud: u32,
        fallback_baud: u32,
    ) -> Result<CommLink, CommError> {
        let mut bauds = vec![preferred_baud];
        if fallback_baud != preferred_baud {
            bauds.push(fallback_baud);
        }

        let mut diagnostics = String::new();
        for baud in bauds {
            info!("Probing {} at {} baud", port, baud);
            let output = self.probe(port, baud).await?;
            if output.success() {
                let link = CommLink::confirmed(port, baud);
                info!("Device answered on {}", link);
                self.remember(&link).await;
                return Ok(link);
            }

            let status = if output.timed_out {
                "timed out".to_string()
            } else {
                match output.exit_code {
                    Some(code) => format!("exit code {}", code),
                    None => "killed".to_string(),
                }
            };
            warn!("Probe of {} at {} baud failed: {}", port, baud, status);
            let _ = writeln!(diagnostics, "--- probe at {} baud: {} ---", baud, status);
            diagnostics.push_str(&output.output);
        }

        Err(CommError::Unreachable {
            port: port.to_string(),
            output: diagnostics,
        })
    }

    /// Saves the link as the next run's starting point. The probe already
    /// succeeded, so a write failure is only a warning.
    async fn remember(&self, link: &CommLink) {
        let store = self.config.clone();
        let saved = link.clone();
        let detail = match tokio::task::spawn_blocking(move || store.record_link(&saved)).await {
            Ok(Ok(_)) => return,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        let warning = PersistenceWarning {
            what: format!("config {}", self.config.path().display()),
            detail,
        };
        warn!("{}", warning);
        self.events.warn(warning.to_string());
    }
}
