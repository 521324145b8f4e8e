use anyhow::Result;
use clap::Parser;
use rgpuvis::config::LoadOptions;
use rgpuvis::io::{load_with, LoadProgress, LoadedTrace};
use rgpuvis::string_intern::StringPool;
use rgpuvis::tracedat::TraceDatReader;
use rgpuvis::traits::{EventCallback, TraceInfo, TraceReader};
use rgpuvis::TraceEvent;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "gpuvis-dump")]
#[command(about = "Load a trace.dat capture, correlate GPU events and print a summary", long_about = None)]
struct Args {
    #[arg(help = "trace.dat file to load")]
    input: PathBuf,
    #[arg(long, help = "Keep recorded timestamps (no host/guest sync or offsets)")]
    raw_ts: bool,
    #[arg(long, help = "Nanoseconds added to every timestamp")]
    ts_offset: Option<i64>,
    #[arg(long, help = "Drop records before every CPU has data")]
    trim: bool,
    #[arg(long, help = "Print per-CPU statistics")]
    cpu_stats: bool,
    #[arg(short, long, help = "Stop after this many events")]
    limit: Option<usize>,
    #[arg(long, default_value = "20", help = "Number of event names to list")]
    top: usize,
}

/// Stops the wrapped reader after `limit` records.
struct LimitedReader<R> {
    inner: R,
    limit: usize,
}

impl<R: TraceReader> TraceReader for LimitedReader<R> {
    fn read(
        &mut self,
        path: &Path,
        options: &LoadOptions,
        pool: &mut StringPool,
        callback: &mut EventCallback<'_>,
    ) -> Result<TraceInfo> {
        let limit = self.limit;
        let mut seen = 0usize;
        self.inner.read(path, options, pool, &mut |info: &TraceInfo, event: TraceEvent| {
            seen += 1;
            callback(info, event) || seen >= limit
        })
    }
}

fn ms(ns: i64) -> f64 {
    ns as f64 / 1_000_000.0
}

fn print_summary(trace: &LoadedTrace, args: &Args) {
    let info = &trace.info;
    println!("file:        {}", info.file);
    println!("version:     {}", info.file_version);
    println!("cpus:        {}", info.cpus);
    println!("page size:   {}", info.page_size);
    if let Some(codec) = &info.compression {
        println!("compression: {}", codec);
    }
    if let Some(clock) = &info.trace_clock {
        println!("clock:       {}", clock);
    }
    if let Some(uname) = &info.uname {
        println!("uname:       {}", uname);
    }
    if !info.buffers.is_empty() {
        println!("buffers:     {}", info.buffers.join(", "));
    }
    println!("events:      {}{}", trace.events.len(), if trace.cancelled { " (stopped early)" } else { "" });
    if let (Some(first), Some(last)) = (trace.events.first(), trace.events.last()) {
        println!("span:        {:.3}ms", ms(last.ts - first.ts));
    }

    let mut names: Vec<(&str, usize)> = trace
        .correlation
        .indices
        .by_name
        .iter()
        .map(|(name, ids)| (&**name, ids.len()))
        .collect();
    names.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    println!();
    println!("{:>10}  event", "count");
    for (name, count) in names.iter().take(args.top) {
        println!("{:>10}  {}", count, name);
    }
    if names.len() > args.top {
        println!("{:>10}  ({} more names)", "...", names.len() - args.top);
    }

    if !trace.correlation.timelines.is_empty() {
        println!();
        println!("{:>8} {:>5}  timeline", "events", "rows");
        for timeline in &trace.correlation.timelines {
            println!(
                "{:>8} {:>5}  {} ({:?})",
                timeline.events.len(),
                timeline.row_count,
                timeline.name,
                timeline.family
            );
        }
    }

    if !trace.correlation.vblanks.is_empty() {
        println!();
        for (crtc, vblank) in &trace.correlation.vblanks {
            match vblank.median_ns {
                Some(median) => println!(
                    "crtc {}: {} vblanks, median interval {:.3}ms",
                    crtc,
                    vblank.count,
                    ms(median)
                ),
                None => println!("crtc {}: {} vblanks", crtc, vblank.count),
            }
        }
    }

    let stats = &trace.correlation.stats;
    println!();
    println!(
        "unlinked: {}  dropped: {}  pruned groups: {}  unmatched perf samples: {}",
        stats.unlinked, stats.dropped, stats.pruned_groups, stats.unmatched_perf_samples
    );

    if args.cpu_stats {
        println!();
        println!("{:>4} {:>10} {:>14} {:>14} {:>10} {:>10}", "cpu", "events", "first", "last", "entries", "overrun");
        for cpu in &info.cpu_info {
            let ts = |t: Option<i64>| t.map_or_else(|| "-".to_string(), |t| format!("{:.6}", t as f64 / 1e9));
            println!(
                "{:>4} {:>10} {:>14} {:>14} {:>10} {:>10}",
                cpu.cpu,
                cpu.events,
                ts(cpu.min_ts),
                ts(cpu.max_ts),
                cpu.entries,
                cpu.overrun
            );
        }
        if let Some(trimmed) = info.trimmed_ts {
            println!("trimmed before {:.6}", trimmed as f64 / 1e9);
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut options = LoadOptions::load_or_default();
    options.raw_timestamps |= args.raw_ts;
    options.trim_to_cpu_overlap |= args.trim;
    if let Some(offset) = args.ts_offset {
        options.ts_offset = offset;
    }

    let mut reader = LimitedReader {
        inner: TraceDatReader::new(),
        limit: args.limit.unwrap_or(usize::MAX),
    };
    let progress = LoadProgress::new();
    let mut trace = load_with(&mut reader, &args.input, &options, &progress)?;
    if args.limit.is_some_and(|limit| trace.events.len() >= limit) {
        trace.cancelled = true;
    }

    print_summary(&trace, &args);
    Ok(())
}
