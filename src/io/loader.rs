//! Synchronous load: read every record, sort, number, correlate.

use super::progress::LoadProgress;
use crate::config::LoadOptions;
use crate::correlate::{color, Correlation, EventCorrelator};
use crate::event::{EventId, TraceEvent};
use crate::string_intern::StringPool;
use crate::tracedat::TraceDatReader;
use crate::traits::{TraceInfo, TraceReader};
use anyhow::Result;
use log::info;
use std::path::Path;
use std::time::Instant;

/// A fully loaded and correlated capture. Owns every event and string.
#[derive(Debug)]
pub struct LoadedTrace {
    pub info: TraceInfo,
    pub events: Vec<TraceEvent>,
    pub correlation: Correlation,
    pub pool: StringPool,
    /// True when the load stopped early on request.
    pub cancelled: bool,
}

impl LoadedTrace {
    /// Sorts `events` by timestamp, assigns dense ids and correlates them.
    pub fn from_events(
        info: TraceInfo,
        mut events: Vec<TraceEvent>,
        mut pool: StringPool,
        options: &LoadOptions,
        progress: Option<&LoadProgress>,
    ) -> Self {
        events.sort_by_key(|e| e.ts);
        for (i, event) in events.iter_mut().enumerate() {
            event.id = i as EventId;
        }

        let mut correlator = EventCorrelator::new(options).with_pid_tgid(&info.pid_tgid);
        if let Some(progress) = progress {
            correlator = correlator.with_progress(progress);
        }
        let correlation = correlator.correlate(&mut events, &info.pid_comm, &mut pool);

        LoadedTrace {
            info,
            events,
            correlation,
            pool,
            cancelled: false,
        }
    }

    pub fn event(&self, id: EventId) -> Option<&TraceEvent> {
        self.events.get(id as usize)
    }

    pub fn set_event_color(&mut self, name: &str, color: u32) -> usize {
        color::set_event_color(&mut self.events, &self.correlation.indices, name, color)
    }

    /// Recomputes auto colors and thread-group colors for new label settings.
    pub fn recolor(&mut self, saturation: f32, alpha: f32) -> usize {
        self.correlation.comms.update_tgid_colors(saturation, alpha, &mut self.pool);
        color::recolor_auto(&mut self.events, saturation, alpha)
    }
}

/// Loads a trace.dat capture.
pub fn load_trace(path: &Path, options: &LoadOptions, progress: &LoadProgress) -> Result<LoadedTrace> {
    load_with(&mut TraceDatReader::new(), path, options, progress)
}

/// Loads a capture with any reader. Cancellation through `progress` keeps
/// the records read so far.
pub fn load_with(
    reader: &mut dyn TraceReader,
    path: &Path,
    options: &LoadOptions,
    progress: &LoadProgress,
) -> Result<LoadedTrace> {
    let start = Instant::now();
    progress.begin();

    let mut pool = StringPool::new();
    let mut events = Vec::new();
    let cancelled_early = progress.is_cancel_requested();
    let result = reader.read(path, options, &mut pool, &mut |_: &TraceInfo, event: TraceEvent| {
        if cancelled_early {
            return true;
        }
        events.push(event);
        progress.record_event();
        progress.is_cancel_requested()
    });
    let info = match result {
        Ok(info) => info,
        Err(e) => {
            progress.fail();
            return Err(e);
        }
    };

    let cancelled = progress.is_cancel_requested();
    let read_time = start.elapsed();
    let mut trace = LoadedTrace::from_events(info, events, pool, options, Some(progress));
    trace.cancelled = cancelled;
    progress.finish(trace.events.len());

    info!(
        "{}: {} events, read {:.2}ms, init {:.2}ms{}",
        path.display(),
        trace.events.len(),
        read_time.as_secs_f64() * 1000.0,
        (start.elapsed() - read_time).as_secs_f64() * 1000.0,
        if cancelled { " (cancelled)" } else { "" }
    );
    Ok(trace)
}
