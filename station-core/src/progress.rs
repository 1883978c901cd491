use crate::models::ProgressEvent;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;

/// `(57%)`, `(0 %)`: esptool's per-block progress marker.
static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d+)\s*%\)").expect("Invalid regex pattern"));

/// Percentage carried by a tool output line, clamped to 100.
pub fn parse_percent(line: &str) -> Option<u8> {
    let digits = PERCENT_RE.captures(line)?.get(1)?.as_str();
    // Anything too long for u64 is far past 100 anyway.
    let value = digits.parse::<u64>().unwrap_or(u64::MAX);
    Some(value.min(100) as u8)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorItem {
    Progress(ProgressEvent),
    /// Informational line, passed through verbatim.
    Log(String),
}

/// Turns the write stage's output stream into progress and log items as the
/// lines arrive. Ends when the tool closes its output; each write stage gets
/// its own monitor.
pub struct ProgressMonitor {
    lines: mpsc::UnboundedReceiver<String>,
    last: Option<u8>,
}

impl ProgressMonitor {
    pub fn new(lines: mpsc::UnboundedReceiver<String>) -> Self {
        ProgressMonitor { lines, last: None }
    }

    pub async fn next(&mut self) -> Option<MonitorItem> {
        let line = self.lines.recv().await?;
        match parse_percent(&line) {
            // A marker below the last one would move the bar backwards.
            Some(percent) if self.last.map_or(true, |last| percent >= last) => {
                self.last = Some(percent);
                Some(MonitorItem::Progress(ProgressEvent { percent }))
            }
            _ => Some(MonitorItem::Log(line)),
        }
    }

    pub fn last_percent(&self) -> Option<u8> {
        self.last
    }
}
