use crate::i18n::Dict;
use flash_station_lib::{
    list_ports, FlashStage, JobOutcome, PortSource, StationEvent, StationHandle,
};
use std::io::Write;
use tokio::sync::mpsc;

/// Operator input, one line per command.
#[derive(Debug, PartialEq)]
enum Input {
    Flash,
    Reset,
    NextPort,
    UsePort(String),
    ListPorts,
    Reload,
    Quit,
    Help,
    Unknown(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };
    let input = match cmd {
        "" => return None,
        "f" | "flash" => Input::Flash,
        "r" | "reset" => Input::Reset,
        "n" | "next" => Input::NextPort,
        "p" | "port" if !rest.is_empty() => Input::UsePort(rest.to_string()),
        "l" | "ports" => Input::ListPorts,
        "c" | "reload" => Input::Reload,
        "q" | "quit" | "exit" => Input::Quit,
        "h" | "help" | "?" => Input::Help,
        other => Input::Unknown(other.to_string()),
    };
    Some(input)
}

/// Kiosk loop: stdin commands in, station events out.
pub async fn run(
    station: StationHandle,
    mut events: mpsc::UnboundedReceiver<StationEvent>,
    ports: &dyn PortSource,
    dict: &Dict,
) -> anyhow::Result<()> {
    // stdin blocks, so it gets its own thread.
    let (tx, mut input) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    println!("{}", dict.help);
    station.request_connect();

    loop {
        tokio::select! {
            Some(event) = events.recv() => render(&event, dict),
            line = input.recv() => {
                let Some(line) = line else { break };
                let Some(cmd) = parse_input(&line) else { continue };
                let accepted = match cmd {
                    Input::Flash => station.start_flash(),
                    Input::Reset => station.request_reset(),
                    Input::NextPort => station.request_next_port(),
                    Input::UsePort(path) => station.request_port(path),
                    Input::ListPorts => {
                        print_ports(ports, dict);
                        true
                    }
                    Input::Reload => match station.reload_config().await {
                        Ok(config) => {
                            println!("{}: {}", dict.ready_to_flash, config.firmware_path.display());
                            true
                        }
                        Err(flash_station_lib::StationError::Busy) => false,
                        Err(e) => {
                            println!("{}: {}", dict.error, e);
                            true
                        }
                    },
                    Input::Quit => break,
                    Input::Help => {
                        println!("{}", dict.help);
                        true
                    }
                    Input::Unknown(cmd) => {
                        println!("{}: {}", dict.unknown_command, cmd);
                        true
                    }
                };
                if !accepted {
                    println!("{}", dict.busy_ignored);
                }
            }
        }
    }

    station.shutdown().await;
    // Whatever the last command produced.
    while let Ok(event) = events.try_recv() {
        render(&event, dict);
    }
    Ok(())
}

pub fn print_ports(ports: &dyn PortSource, dict: &Dict) {
    let found = list_ports(ports);
    if found.is_empty() {
        println!("{}", dict.no_device);
        if let Some(hint) = ports.diagnose() {
            println!("  {}", hint);
        }
        return;
    }
    println!("{}:", dict.scanning);
    for port in found {
        println!("  [{}] {}", port.discovered_at, port.path);
    }
}

pub fn render(event: &StationEvent, dict: &Dict) {
    match event {
        StationEvent::PortsScanned { ports } => {
            log::debug!("{} port(s) found", ports.len());
        }
        StationEvent::PortSelected { port } => println!("{}: {}", dict.port, port.path),
        StationEvent::LinkEstablished { link } => {
            println!("{} ({})", dict.connected, link);
            println!("{}", dict.ready_to_flash);
        }
        StationEvent::StageChanged { stage, .. } => match stage {
            FlashStage::Erasing => println!("{}", dict.erasing),
            FlashStage::Writing => println!("{}", dict.writing),
            FlashStage::Resetting => println!("\n{}", dict.resetting),
            FlashStage::Idle | FlashStage::Succeeded | FlashStage::Failed => {}
        },
        StationEvent::Progress { percent, .. } => {
            print!("\r  {:>3}%", percent);
            let _ = std::io::stdout().flush();
        }
        StationEvent::LogLine { line } => log::info!(target: "esptool", "{}", line),
        StationEvent::JobResult { outcome, .. } => match outcome {
            JobOutcome::Success { .. } => {
                println!("{}", dict.flash_complete);
                print!("\x07");
            }
            JobOutcome::Failure {
                message,
                diagnostics,
            } => {
                println!("\n{} {}", dict.flash_failed, message);
                if let Some(text) = diagnostics {
                    for line in text.lines() {
                        println!("  | {}", line);
                    }
                }
                println!("{}", dict.retry_required);
            }
        },
        StationEvent::CounterUpdated { count } => {
            println!("{}: {}", dict.flashes_completed, count)
        }
        StationEvent::Warning { message } => println!("{}: {}", dict.warning, message),
        StationEvent::Error {
            message,
            diagnostics,
        } => {
            println!("{}: {}", dict.error, message);
            if let Some(text) = diagnostics {
                for line in text.lines() {
                    println!("  | {}", line);
                }
            }
        }
    }
}
