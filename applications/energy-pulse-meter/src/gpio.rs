//! Edge detection on GPIO lines through libgpiod's `gpiomon`.
//!
//! `gpiomon` prints one line per detected edge, carrying the kernel's event
//! timestamp. Edges are debounced on that timestamp, so lines that reach us
//! together after output buffering are still told apart. The meter line
//! records a pulse timestamp, the button line requests shutdown.

use crate::config::GpioConfig;
use crate::error::{AppError, Result};
use crate::pulse::{PendingPulseQueue, PulseTimestamp};
use crate::shutdown::ShutdownTrigger;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A derived wall-clock time lagging the read time by more than this means
/// the wall clock was stepped, not that output was buffered.
const REANCHOR_LAG_NS: i64 = 60 * 1_000_000_000;

/// Drops edges that follow the previously accepted one too closely.
///
/// Times are offsets on a single monotonic scale, either the kernel event
/// clock or time since the watcher started.
#[derive(Debug, Clone)]
pub struct Debounce {
    min_gap: Duration,
    last: Option<Duration>,
}

impl Debounce {
    pub fn new(min_gap: Duration) -> Self {
        Self { min_gap, last: None }
    }

    pub fn accept(&mut self, at: Duration) -> bool {
        if let Some(last) = self.last {
            if at.saturating_sub(last) < self.min_gap {
                return false;
            }
        }
        self.last = Some(at);
        true
    }
}

/// Event timestamp of a `gpiomon` line.
///
/// Understands the bracketed form `... timestamp: [ 1234.567890123]` and the
/// form with the timestamp as the first field. Returns `None` for anything
/// else.
pub fn event_timestamp(line: &str) -> Option<Duration> {
    let field = match (line.find('['), line.find(']')) {
        (Some(open), Some(close)) if open < close => &line[open + 1..close],
        _ => line.split_whitespace().next()?,
    };
    let (secs, frac) = field.trim().split_once('.')?;
    if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs: u64 = secs.parse().ok()?;
    let nanos: u32 = format!("{:0<9}", frac).parse().ok()?;
    Some(Duration::new(secs, nanos))
}

/// Maps kernel event timestamps onto wall-clock pulse timestamps.
///
/// The offset between the two clocks is the smallest one observed, since a
/// line is never read before its edge happened. It is re-anchored when the
/// mapped time falls more than a minute behind the read time.
#[derive(Debug, Clone, Default)]
pub struct EventClock {
    offset: Option<i64>,
}

impl EventClock {
    pub fn wall_time(&mut self, event: Duration, read_at: PulseTimestamp) -> PulseTimestamp {
        let Ok(event) = i64::try_from(event.as_nanos()) else {
            return read_at;
        };
        let observed = read_at.as_nanos() - event;
        let offset = match self.offset {
            Some(offset) if (0..=REANCHOR_LAG_NS).contains(&(observed - offset)) => offset,
            _ => observed,
        };
        self.offset = Some(offset);
        PulseTimestamp::from_nanos(event + offset)
    }
}

/// Arguments for a falling-edge monitor on `line` with the internal pull-up enabled.
pub fn monitor_args(chip: &str, line: u32) -> Vec<String> {
    vec![
        "--falling-edge".to_string(),
        "--bias=pull-up".to_string(),
        chip.to_string(),
        line.to_string(),
    ]
}

/// Feed every debounced edge from `reader` to `on_edge` until EOF.
///
/// `on_edge` receives the event timestamp when the line carries one. Lines
/// without one are debounced on the time they were read.
pub async fn watch_edges<R, F>(reader: R, mut debounce: Debounce, mut on_edge: F) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(Option<Duration>),
{
    let started = Instant::now();
    let mut lines = reader.lines();
    let mut accepted = 0;
    while let Some(line) = lines.next_line().await? {
        let event = event_timestamp(&line);
        if debounce.accept(event.unwrap_or_else(|| started.elapsed())) {
            on_edge(event);
            accepted += 1;
        } else {
            debug!(event = %line.trim(), "edge ignored by debounce");
        }
    }
    Ok(accepted)
}

/// A running edge monitor process and the task reading its output.
pub struct EdgeWatcher {
    name: &'static str,
    child: Child,
    task: JoinHandle<()>,
}

impl EdgeWatcher {
    pub fn spawn<F>(
        name: &'static str,
        program: &str,
        args: &[String],
        debounce: Debounce,
        on_edge: F,
    ) -> Result<Self>
    where
        F: FnMut(Option<Duration>) + Send + 'static,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::Input(format!("failed to start {} for {}: {}", program, name, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Input(format!("no stdout from {} for {}", program, name)))?;

        let task = tokio::spawn(async move {
            match watch_edges(BufReader::new(stdout), debounce, on_edge).await {
                Ok(accepted) => warn!(watcher = name, accepted, "edge monitor exited"),
                Err(e) => error!(watcher = name, error = %e, "edge monitor failed"),
            }
        });

        info!(watcher = name, program, ?args, "edge monitor started");
        Ok(Self { name, child, task })
    }

    /// Stop reading edges and terminate the monitor process.
    pub async fn stop(mut self) {
        self.task.abort();
        if let Err(e) = self.child.kill().await {
            // already exited
            debug!(watcher = self.name, error = %e, "edge monitor kill failed");
        }
        info!(watcher = self.name, "edge monitor stopped");
    }
}

/// Records a pulse timestamp in `queue` for every meter edge.
pub fn spawn_pulse_watcher(config: &GpioConfig, queue: PendingPulseQueue) -> Result<EdgeWatcher> {
    EdgeWatcher::spawn(
        "pulse",
        &config.monitor_command,
        &monitor_args(&config.chip, config.pulse_pin),
        Debounce::new(Duration::from_millis(config.pulse_debounce_ms)),
        {
            let mut clock = EventClock::default();
            move |event| {
                let read_at = PulseTimestamp::now();
                let at = match event {
                    Some(event) => clock.wall_time(event, read_at),
                    None => read_at,
                };
                queue.push(at);
                debug!(ts = at.as_nanos(), "interrupt handled");
            }
        },
    )
}

/// Sends [`ShutdownTrigger::Button`] when the shutdown button is pressed.
pub fn spawn_button_watcher(
    config: &GpioConfig,
    tx: mpsc::Sender<ShutdownTrigger>,
) -> Result<EdgeWatcher> {
    EdgeWatcher::spawn(
        "button",
        &config.monitor_command,
        &monitor_args(&config.chip, config.button_pin),
        Debounce::new(Duration::from_millis(config.button_debounce_ms)),
        move |_| {
            // a full channel already carries a pending request
            let _ = tx.try_send(ShutdownTrigger::Button);
        },
    )
}
