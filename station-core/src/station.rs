//! The provisioning orchestrator.
//!
//! A [`Station`] runs as one dedicated tokio task that owns port selection,
//! the current [`CommLink`] and the flash sequencer. The presentation shell
//! talks to it through a [`StationHandle`]: requests go in over a channel and
//! progress comes back as [`StationEvent`]s. While a command is running every
//! further request is dropped rather than queued, so a double press on the
//! flash button can never start a second tool against the same device.

use crate::config::{ConfigStore, DeviceConfig};
use crate::counter::CounterStore;
use crate::error::{FlashError, StationError};
use crate::events::EventSink;
use crate::models::{CommLink, FlashJob, FlashSummary, SerialPort, StationEvent};
use crate::negotiator::BaudNegotiator;
use crate::ports::{list_ports, next_port, select_port, PortSource, SystemPorts};
use crate::sequencer::FlashSequencer;
use crate::tool::{EsptoolRunner, ToolRunner};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Reply<T> = oneshot::Sender<Result<T, StationError>>;

enum Command {
    Connect(Reply<CommLink>),
    Flash(Reply<FlashSummary>),
    Reset(Reply<CommLink>),
    SelectPort(String, Reply<CommLink>),
    CyclePort(Reply<CommLink>),
    ReloadConfig(Reply<DeviceConfig>),
    Shutdown,
}

/// Read-only view for the shell.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct StationSnapshot {
    pub port: Option<String>,
    pub link: Option<CommLink>,
    pub job: Option<FlashJob>,
    pub flash_count: u64,
    pub busy: bool,
}

#[derive(Debug, Default)]
struct LinkState {
    port: Option<String>,
    link: Option<CommLink>,
}

pub struct StationBuilder {
    config: Arc<ConfigStore>,
    ports: Arc<dyn PortSource>,
    runner: Option<Arc<dyn ToolRunner>>,
}

impl StationBuilder {
    pub fn ports(mut self, ports: Arc<dyn PortSource>) -> Self {
        self.ports = ports;
        self
    }

    /// Replaces the esptool subprocess runner built from the config.
    pub fn runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Starts the worker task. Must be called from inside a tokio runtime.
    pub fn spawn(self) -> (StationHandle, mpsc::UnboundedReceiver<StationEvent>) {
        let (events, event_rx) = EventSink::channel();
        let config = self.config.load();
        let runner_from_config = self.runner.is_none();
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(EsptoolRunner::from_config(&config)));

        let negotiator = BaudNegotiator::new(runner.clone(), self.config.clone(), events.clone())
            .with_probe_timeout(config.probe_timeout());
        let sequencer = Arc::new(FlashSequencer::new(
            runner,
            CounterStore::open(&config.counter_path),
            events.clone(),
        ));
        let shared = Arc::new(Mutex::new(LinkState::default()));
        let busy = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            "Station ready: firmware {}, {} flashes so far",
            config.firmware_path.display(),
            sequencer.flash_count()
        );

        let station = Station {
            store: self.config,
            config,
            ports: self.ports,
            runner_from_config,
            events,
            negotiator,
            sequencer: sequencer.clone(),
            port_override: None,
            shared: shared.clone(),
            busy: busy.clone(),
        };
        let worker = tokio::spawn(station.run(rx));

        let handle = StationHandle {
            commands: tx,
            busy,
            shared,
            sequencer,
            worker: Mutex::new(Some(worker)),
        };
        (handle, event_rx)
    }
}

pub struct Station {
    store: Arc<ConfigStore>,
    config: DeviceConfig,
    ports: Arc<dyn PortSource>,
    runner_from_config: bool,
    events: EventSink,
    negotiator: BaudNegotiator,
    sequencer: Arc<FlashSequencer>,
    /// Port chosen explicitly by the operator; survives resets.
    port_override: Option<String>,
    shared: Arc<Mutex<LinkState>>,
    busy: Arc<AtomicBool>,
}

impl Station {
    pub fn builder(config: Arc<ConfigStore>) -> StationBuilder {
        StationBuilder {
            config,
            ports: Arc::new(SystemPorts),
            runner: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Connect(reply) => {
                    let result = self.connect().await;
                    self.finish(reply, result);
                }
                Command::Flash(reply) => {
                    let result = self.flash().await;
                    self.finish(reply, result);
                }
                Command::Reset(reply) => {
                    let result = self.reset().await;
                    self.finish(reply, result);
                }
                Command::SelectPort(path, reply) => {
                    let result = self.select_port(path).await;
                    self.finish(reply, result);
                }
                Command::CyclePort(reply) => {
                    let result = self.cycle_port().await;
                    self.finish(reply, result);
                }
                Command::ReloadConfig(reply) => {
                    let result = self.reload_config();
                    self.finish(reply, result);
                }
                Command::Shutdown => break,
            }
        }
        debug!("Station worker stopped");
    }

    /// Reports the outcome, then accepts new requests.
    fn finish<T>(&self, reply: Reply<T>, result: Result<T, StationError>) {
        if let Err(e) = &result {
            // Job failures were already reported by the sequencer.
            if !matches!(e, StationError::Flash(_)) {
                warn!("{}", e);
                self.events.emit(StationEvent::Error {
                    message: e.to_string(),
                    diagnostics: e.diagnostics(),
                });
            }
        }
        self.busy.store(false, Ordering::Release);
        // The requester may not be waiting for an answer.
        let _ = reply.send(result);
    }

    fn publish(&self, port: Option<String>, link: Option<CommLink>) {
        let mut shared = self.shared.lock();
        shared.port = port;
        shared.link = link;
    }

    /// OS enumeration blocks, so it runs on the blocking pool.
    async fn scan(&self) -> Vec<SerialPort> {
        let source = self.ports.clone();
        let ports = tokio::task::spawn_blocking(move || list_ports(source.as_ref()))
            .await
            .unwrap_or_else(|e| {
                warn!("Port scan failed: {}", e);
                Vec::new()
            });
        self.events.emit(StationEvent::PortsScanned {
            ports: ports.clone(),
        });
        ports
    }

    async fn no_hardware(&self) -> StationError {
        let source = self.ports.clone();
        let hint = tokio::task::spawn_blocking(move || source.diagnose())
            .await
            .unwrap_or_else(|e| {
                debug!("USB diagnosis failed: {}", e);
                None
            });
        StationError::NoHardware { hint }
    }

    /// Discovery plus negotiation. Any previous link is dropped first, so a
    /// link is never carried over to a different port.
    async fn connect(&mut self) -> Result<CommLink, StationError> {
        self.publish(None, None);
        let ports = self.scan().await;
        let Some(port) = select_port(
            &ports,
            self.port_override.as_deref(),
            self.config.last_port.as_deref(),
        )
        .cloned() else {
            return Err(self.no_hardware().await);
        };
        if let Some(wanted) = &self.port_override {
            if *wanted != port.path {
                warn!("Selected port {} is gone, using {}", wanted, port.path);
            }
        }
        info!("Using port {}", port.path);
        self.events.emit(StationEvent::PortSelected { port: port.clone() });
        self.publish(Some(port.path.clone()), None);

        let link = self
            .negotiator
            .negotiate(&port.path, self.config.baud, self.config.fallback_baud)
            .await?;
        self.config.baud = link.baud;
        self.config.last_port = Some(link.port.clone());
        self.publish(Some(link.port.clone()), Some(link.clone()));
        self.events
            .emit(StationEvent::LinkEstablished { link: link.clone() });
        Ok(link)
    }

    async fn flash(&mut self) -> Result<FlashSummary, StationError> {
        let address = self.config.flash_offset()?;
        self.sequencer.set_flash_address(address);

        let cached = self.shared.lock().link.clone();
        let link = match cached {
            Some(link) => link,
            None => self.connect().await?,
        };

        let result = self
            .sequencer
            .run_flash(&link, &self.config.firmware_path)
            .await;
        if let Err(FlashError::Stage { .. } | FlashError::Tool { .. }) = &result {
            // The device may have dropped off the bus; probe again next time.
            let port = self.shared.lock().port.clone();
            self.publish(port, None);
        }
        Ok(result?)
    }

    /// Back to Idle and a fresh negotiation. Only reachable between jobs.
    async fn reset(&mut self) -> Result<CommLink, StationError> {
        self.sequencer.clear();
        self.connect().await
    }

    async fn select_port(&mut self, path: String) -> Result<CommLink, StationError> {
        let ports = self.scan().await;
        if !ports.iter().any(|p| p.path == path) {
            return Err(StationError::UnknownPort(path));
        }
        self.port_override = Some(path);
        self.connect().await
    }

    async fn cycle_port(&mut self) -> Result<CommLink, StationError> {
        let ports = self.scan().await;
        let current = self.shared.lock().port.clone();
        let Some(next) = next_port(&ports, current.as_deref()).map(|p| p.path.clone()) else {
            return Err(self.no_hardware().await);
        };
        self.port_override = Some(next);
        self.connect().await
    }

    fn reload_config(&mut self) -> Result<DeviceConfig, StationError> {
        let config = self.store.try_load()?;
        config.flash_offset()?;

        if config.counter_path != self.config.counter_path {
            self.sequencer
                .set_counter(CounterStore::open(&config.counter_path));
        }
        if self.runner_from_config {
            let runner: Arc<dyn ToolRunner> = Arc::new(EsptoolRunner::from_config(&config));
            self.negotiator.set_runner(runner.clone());
            self.sequencer.set_runner(runner);
        }
        self.negotiator.set_probe_timeout(config.probe_timeout());

        // Speed or tool changes only take effect through a new negotiation.
        if config.baud != self.config.baud
            || config.fallback_baud != self.config.fallback_baud
            || config.tool_program != self.config.tool_program
            || config.tool_args != self.config.tool_args
            || config.chip != self.config.chip
        {
            let port = self.shared.lock().port.clone();
            self.publish(port, None);
        }
        info!("Configuration reloaded from {}", self.store.path().display());
        self.config = config.clone();
        Ok(config)
    }
}

/// The shell's side of the station. Requests made while the station is busy
/// are ignored.
pub struct StationHandle {
    commands: mpsc::UnboundedSender<Command>,
    busy: Arc<AtomicBool>,
    shared: Arc<Mutex<LinkState>>,
    sequencer: Arc<FlashSequencer>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StationHandle {
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StationSnapshot {
        let shared = self.shared.lock();
        StationSnapshot {
            port: shared.port.clone(),
            link: shared.link.clone(),
            job: self.sequencer.snapshot(),
            flash_count: self.sequencer.flash_count(),
            busy: self.is_busy(),
        }
    }

    /// Claims the worker and sends the command, or returns `None` when busy.
    fn dispatch<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Option<oneshot::Receiver<Result<T, StationError>>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Station busy, request ignored");
            return None;
        }
        let (reply, rx) = oneshot::channel();
        if self.commands.send(make(reply)).is_err() {
            self.busy.store(false, Ordering::Release);
            return None;
        }
        Some(rx)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, StationError> {
        let rx = self.dispatch(make).ok_or_else(|| {
            if self.commands.is_closed() {
                StationError::Stopped
            } else {
                StationError::Busy
            }
        })?;
        rx.await.map_err(|_| StationError::Stopped)?
    }

    // Fire-and-forget triggers for the shell; `false` means ignored.

    pub fn request_connect(&self) -> bool {
        self.dispatch(Command::Connect).is_some()
    }

    pub fn start_flash(&self) -> bool {
        self.dispatch(Command::Flash).is_some()
    }

    pub fn request_reset(&self) -> bool {
        self.dispatch(Command::Reset).is_some()
    }

    pub fn request_port(&self, path: impl Into<String>) -> bool {
        let path = path.into();
        self.dispatch(|reply| Command::SelectPort(path, reply))
            .is_some()
    }

    pub fn request_next_port(&self) -> bool {
        self.dispatch(Command::CyclePort).is_some()
    }

    // Awaitable forms of the same requests.

    pub async fn connect(&self) -> Result<CommLink, StationError> {
        self.request(Command::Connect).await
    }

    pub async fn flash(&self) -> Result<FlashSummary, StationError> {
        self.request(Command::Flash).await
    }

    pub async fn reset(&self) -> Result<CommLink, StationError> {
        self.request(Command::Reset).await
    }

    pub async fn select_port(&self, path: impl Into<String>) -> Result<CommLink, StationError> {
        let path = path.into();
        self.request(|reply| Command::SelectPort(path, reply)).await
    }

    pub async fn cycle_port(&self) -> Result<CommLink, StationError> {
        self.request(Command::CyclePort).await
    }

    pub async fn reload_config(&self) -> Result<DeviceConfig, StationError> {
        self.request(Command::ReloadConfig).await
    }

    /// Stops the worker after its current command.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Station worker ended abnormally: {}", e);
            }
        }
    }
}
