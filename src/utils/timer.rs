//! Phase timing
//!
//! The pipeline takes tens of minutes; these helpers report where the
//! time went.

use std::fmt::Write;
use std::time::{Duration, Instant};
use tracing::info;

/// Times a single phase and logs it when finished
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Log the elapsed time and return it
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        info!("{} finished in {}", self.label, format_duration(elapsed));
        elapsed
    }
}

/// Records consecutive phases of one pipeline run
#[derive(Debug)]
pub struct Stopwatch {
    start: Instant,
    laps: Vec<(String, Duration)>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            laps: Vec::new(),
        }
    }

    /// Close the current phase under `label`
    pub fn lap(&mut self, label: impl Into<String>) {
        self.laps.push((label.into(), self.start.elapsed()));
    }

    pub fn total(&self) -> Duration {
        self.start.elapsed()
    }

    /// Duration of each phase, not cumulative
    pub fn lap_times(&self) -> Vec<(String, Duration)> {
        let mut prev = Duration::ZERO;
        self.laps
            .iter()
            .map(|(label, cumulative)| {
                let lap = cumulative.saturating_sub(prev);
                prev = *cumulative;
                (label.clone(), lap)
            })
            .collect()
    }

    /// One line per phase followed by the total
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (label, lap) in self.lap_times() {
            let _ = writeln!(out, "  {:<12} {}", label, format_duration(lap));
        }
        let _ = write!(out, "  {:<12} {}", "total", format_duration(self.total()));
        out
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

/// `1m 05s` style rendering; sub-second values in milliseconds
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0 => format!("{}ms", d.as_millis()),
        1..=59 => format!("{}.{:01}s", secs, d.subsec_millis() / 100),
        60..=3599 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    }
}
