//! Erase, write, reset.
//!
//! ```text
//! Idle -> Erasing -> Writing -> Resetting -> Succeeded
//!   any state -> Failed
//! ```
//!
//! A stage whose tool run fails ends the job; nothing after it runs and
//! nothing is retried. Only one job may hold the device at a time.

use crate::counter::{CounterStore, CounterUpdate};
use crate::error::FlashError;
use crate::events::EventSink;
use crate::models::{
    CommLink, FlashJob, FlashStage, FlashSummary, JobOutcome, PersistenceWarning, StationEvent,
};
use crate::progress::{MonitorItem, ProgressMonitor};
use crate::tool::{ToolOperation, ToolRequest, ToolRunner};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

pub struct FlashSequencer {
    runner: Mutex<Arc<dyn ToolRunner>>,
    counter: Arc<Mutex<CounterStore>>,
    events: EventSink,
    flash_address: AtomicU32,
    job: Mutex<Option<FlashJob>>,
    running: AtomicBool,
    next_id: AtomicU64,
}

/// Releases the device when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FlashSequencer {
    pub fn new(runner: Arc<dyn ToolRunner>, counter: CounterStore, events: EventSink) -> Self {
        FlashSequencer {
            runner: Mutex::new(runner),
            counter: Arc::new(Mutex::new(counter)),
            events,
            flash_address: AtomicU32::new(0),
            job: Mutex::new(None),
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_flash_address(self, address: u32) -> Self {
        self.set_flash_address(address);
        self
    }

    pub fn set_flash_address(&self, address: u32) {
        self.flash_address.store(address, Ordering::Relaxed);
    }

    pub fn set_runner(&self, runner: Arc<dyn ToolRunner>) {
        *self.runner.lock() = runner;
    }

    /// Swaps in a counter file, e.g. after the config moved it.
    pub fn set_counter(&self, counter: CounterStore) {
        *self.counter.lock() = counter;
    }

    pub fn is_busy(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Copy of the current or most recent job.
    pub fn snapshot(&self) -> Option<FlashJob> {
        self.job.lock().clone()
    }

    pub fn flash_count(&self) -> u64 {
        self.counter.lock().value()
    }

    /// Forgets a finished job so the station shows Idle again. Refused while
    /// a job is running.
    pub fn clear(&self) -> bool {
        if self.is_busy() {
            return false;
        }
        *self.job.lock() = None;
        true
    }

    pub async fn run_flash(
        &self,
        link: &CommLink,
        firmware: &Path,
    ) -> Result<FlashSummary, FlashError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Flash requested while a job is running; ignored");
            return Err(FlashError::Busy);
        }
        let _guard = RunGuard(&self.running);

        let job_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *self.job.lock() = Some(FlashJob {
            id: job_id,
            firmware: firmware.to_path_buf(),
            link: link.clone(),
            stage: FlashStage::Idle,
            progress: 0,
            error: None,
        });
        info!("Job {}: flashing {} via {}", job_id, firmware.display(), link);
        let started = Instant::now();

        match self.run_stages(job_id, link, firmware).await {
            Ok(()) => {
                self.set_stage(job_id, FlashStage::Succeeded);
                let update = self.record_success().await;
                if let Some(warning) = &update.warning {
                    self.events.warn(warning.to_string());
                }
                self.events.emit(StationEvent::CounterUpdated {
                    count: update.value,
                });
                self.events.emit(StationEvent::JobResult {
                    job_id,
                    outcome: JobOutcome::Success {
                        flash_count: update.value,
                    },
                });
                info!("Job {}: flash complete, {} total", job_id, update.value);
                Ok(FlashSummary {
                    job_id,
                    link: link.clone(),
                    firmware: firmware.to_path_buf(),
                    elapsed: started.elapsed(),
                    flash_count: update.value,
                    counter_warning: update.warning,
                })
            }
            Err(e) => {
                error!("Job {}: {}", job_id, e);
                if let Some(job) = self.job.lock().as_mut() {
                    job.stage = FlashStage::Failed;
                    job.error = Some(e.to_string());
                }
                self.events.emit(StationEvent::StageChanged {
                    job_id,
                    stage: FlashStage::Failed,
                });
                self.events.emit(StationEvent::JobResult {
                    job_id,
                    outcome: JobOutcome::Failure {
                        message: e.to_string(),
                        diagnostics: e.diagnostics().map(str::to_string),
                    },
                });
                Err(e)
            }
        }
    }

    /// The counter file write ends in an fsync, so it runs on the blocking pool.
    async fn record_success(&self) -> CounterUpdate {
        let counter = self.counter.clone();
        match tokio::task::spawn_blocking(move || counter.lock().increment_and_save()).await {
            Ok(update) => update,
            Err(e) => CounterUpdate {
                value: self.flash_count(),
                warning: Some(PersistenceWarning {
                    what: "flash counter".to_string(),
                    detail: e.to_string(),
                }),
            },
        }
    }

    async fn run_stages(
        &self,
        job_id: u64,
        link: &CommLink,
        firmware: &Path,
    ) -> Result<(), FlashError> {
        // Erasing first and then finding no image would leave a blank board.
        if !firmware.is_file() {
            return Err(FlashError::FirmwareMissing(firmware.to_path_buf()));
        }

        self.run_stage(job_id, link, FlashStage::Erasing, ToolOperation::Erase)
            .await?;
        self.run_stage(
            job_id,
            link,
            FlashStage::Writing,
            ToolOperation::WriteImage {
                address: self.flash_address.load(Ordering::Relaxed),
                image: firmware.to_path_buf(),
            },
        )
        .await?;
        // A clean exit means the whole image is on the chip, markers or not.
        if self.snapshot().map_or(false, |job| job.progress < 100) {
            self.set_progress(job_id, 100);
        }
        self.run_stage(job_id, link, FlashStage::Resetting, ToolOperation::Reset)
            .await
    }

    async fn run_stage(
        &self,
        job_id: u64,
        link: &CommLink,
        stage: FlashStage,
        operation: ToolOperation,
    ) -> Result<(), FlashError> {
        self.set_stage(job_id, stage);
        let request = ToolRequest {
            port: link.port.clone(),
            baud: link.baud,
            operation,
            timeout: None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let watch = async {
            if stage == FlashStage::Writing {
                let mut monitor = ProgressMonitor::new(rx);
                while let Some(item) = monitor.next().await {
                    match item {
                        MonitorItem::Progress(event) => self.set_progress(job_id, event.percent),
                        MonitorItem::Log(line) => self.events.emit(StationEvent::LogLine { line }),
                    }
                }
            } else {
                let mut rx = rx;
                while let Some(line) = rx.recv().await {
                    self.events.emit(StationEvent::LogLine { line });
                }
            }
        };
        let runner = self.runner.lock().clone();
        let (output, ()) = tokio::join!(runner.run(&request, Some(tx)), watch);

        let output = output.map_err(|source| FlashError::Tool { stage, source })?;
        if output.success() {
            Ok(())
        } else {
            Err(FlashError::Stage {
                stage,
                exit_code: output.exit_code,
                timed_out: output.timed_out,
                output: output.output,
            })
        }
    }

    fn set_stage(&self, job_id: u64, stage: FlashStage) {
        if let Some(job) = self.job.lock().as_mut() {
            job.stage = stage;
        }
        info!("Job {}: {}", job_id, stage);
        self.events
            .emit(StationEvent::StageChanged { job_id, stage });
    }

    fn set_progress(&self, job_id: u64, percent: u8) {
        let changed = match self.job.lock().as_mut() {
            Some(job) if percent >= job.progress => {
                job.progress = percent;
                true
            }
            _ => false,
        };
        if changed {
            self.events
                .emit(StationEvent::Progress { job_id, percent });
        }
    }
}
