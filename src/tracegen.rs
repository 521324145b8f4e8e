use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rgpuvis::tracedat::compress::Codec;
use rgpuvis::writer::{FieldType, FieldValue, TraceDatWriter};
use std::path::PathBuf;

const FRAME_NS: u64 = 16_666_667;
const START_NS: u64 = 1_000_000_000;

const DRM_SCHED_RING: &str = "gfx_0.0.0";
const AMD_TIMELINE: &str = "gfx";
const AMD_CONTEXT: u32 = 249;

/// (pid, comm) of the simulated processes.
const TASKS: &[(i32, &str)] = &[
    (1, "systemd"),
    (812, "Xorg"),
    (1404, "gnome-shell"),
    (2210, "vkcube"),
    (2211, "vkcube:gdrv0"),
    (77, "kworker/u16:3"),
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Compression {
    None,
    Zlib,
    Brotli,
    Zstd,
}

#[derive(Parser, Debug)]
#[command(name = "gpuvis-tracegen")]
#[command(about = "Write a synthetic GPU trace.dat capture", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "trace.dat", help = "Output file path")]
    output: PathBuf,
    #[arg(long, default_value = "7", help = "Container version (6 or 7)")]
    file_version: u32,
    #[arg(short, long, value_enum, default_value = "none", help = "CPU data codec (version 7 only)")]
    compression: Compression,
    #[arg(long, default_value = "4", help = "Number of CPUs")]
    cpus: u32,
    #[arg(short, long, default_value = "120", help = "Number of 60Hz frames to simulate")]
    frames: u32,
    #[arg(short, long, default_value = "1", help = "Random seed")]
    seed: u64,
}

struct Formats {
    sched_switch: u16,
    fork: u16,
    exec: u16,
    vblank: u16,
    vblank_queued: u16,
    cs_ioctl: u16,
    run_job: u16,
    fence_signaled: u16,
    job_msg: u16,
    sched_job: u16,
    sched_run_job: u16,
    sched_process_job: u16,
    msm_flush: u16,
    msm_retired: u16,
    i915_stages: [u16; 5],
    i915_notify: u16,
    print: u16,
}

impl Formats {
    fn register(w: &mut TraceDatWriter) -> Self {
        use FieldType::*;
        let amd_fields: &[(&str, FieldType)] =
            &[("timeline", Str), ("context", U32), ("seqno", U32), ("ring_name", Str)];
        let sched_fields: &[(&str, FieldType)] = &[("name", Str), ("id", U64), ("fence", Pointer)];
        let i915_fields: &[(&str, FieldType)] =
            &[("ring", U32), ("ctx", U32), ("seqno", U32), ("global_seqno", U32), ("hw_id", U32)];

        Formats {
            sched_switch: w.add_format(
                "sched",
                "sched_switch",
                &[
                    ("prev_comm", Char(16)),
                    ("prev_pid", I32),
                    ("prev_prio", I32),
                    ("prev_state", I64),
                    ("next_comm", Char(16)),
                    ("next_pid", I32),
                    ("next_prio", I32),
                ],
            ),
            fork: w.add_format(
                "sched",
                "sched_process_fork",
                &[("parent_comm", Char(16)), ("parent_pid", I32), ("child_comm", Char(16)), ("child_pid", I32)],
            ),
            exec: w.add_format("sched", "sched_process_exec", &[("filename", Str), ("pid", I32), ("old_pid", I32)]),
            vblank: w.add_format(
                "drm",
                "drm_vblank_event",
                &[("crtc", I32), ("seq", U32), ("time", I64), ("high_prec", U8)],
            ),
            vblank_queued: w.add_format("drm", "drm_vblank_event_queued", &[("crtc", I32), ("seq", U32)]),
            cs_ioctl: w.add_format("amdgpu", "amdgpu_cs_ioctl", amd_fields),
            run_job: w.add_format("amdgpu", "amdgpu_sched_run_job", amd_fields),
            fence_signaled: w.add_format(
                "dma_fence",
                "dma_fence_signaled",
                &[("driver", Str), ("timeline", Str), ("context", U32), ("seqno", U32)],
            ),
            job_msg: w.add_format(
                "amdgpu",
                "amdgpu_job_msg",
                &[("msg", Str), ("timeline", Str), ("context", U32), ("seqno", U32)],
            ),
            sched_job: w.add_format("gpu_scheduler", "drm_sched_job", sched_fields),
            sched_run_job: w.add_format("gpu_scheduler", "drm_run_job", sched_fields),
            sched_process_job: w.add_format("gpu_scheduler", "drm_sched_process_job", &[("fence", Pointer)]),
            msm_flush: w.add_format("msm", "msm_gpu_submit_flush", &[("id", U32), ("ringid", U32), ("seqno", U32)]),
            msm_retired: w.add_format(
                "msm",
                "msm_gpu_submit_retired",
                &[("id", U32), ("ringid", U32), ("seqno", U32), ("elapsed", U64)],
            ),
            i915_stages: [
                w.add_format("i915", "i915_request_queue", i915_fields),
                w.add_format("i915", "i915_request_add", i915_fields),
                w.add_format("i915", "i915_request_submit", i915_fields),
                w.add_format("i915", "i915_request_in", i915_fields),
                w.add_format("i915", "i915_request_out", i915_fields),
            ],
            i915_notify: w.add_format("i915", "intel_engine_notify", &[("ring", U32), ("seqno", U32), ("waiters", U8)]),
            print: w.add_format("ftrace", "print", &[("ip", Long), ("buf", Str)]),
        }
    }
}

/// Emits one simulated workload into the writer.
struct Generator {
    writer: TraceDatWriter,
    formats: Formats,
    rng: StdRng,
    cpus: u32,
    /// Last pid switched in, per CPU.
    running: Vec<i32>,
    amd_seqno: u32,
    drm_job_id: u64,
    msm_seqno: u32,
    i915_seqno: u32,
}

impl Generator {
    fn new(mut writer: TraceDatWriter, cpus: u32, seed: u64) -> Self {
        let formats = Formats::register(&mut writer);
        Generator {
            writer,
            formats,
            rng: StdRng::seed_from_u64(seed),
            cpus,
            running: vec![0; cpus as usize],
            amd_seqno: 0,
            drm_job_id: 0,
            msm_seqno: 0,
            i915_seqno: 0,
        }
    }

    fn cpu(&mut self) -> u32 {
        self.rng.gen_range(0..self.cpus)
    }

    fn comm_of(pid: i32) -> &'static str {
        TASKS.iter().find(|(p, _)| *p == pid).map_or("<idle>", |(_, c)| c)
    }

    fn emit(&mut self, cpu: u32, ts: u64, pid: i32, format: u16, values: &[FieldValue]) -> Result<()> {
        self.writer.add_event(cpu, ts, pid, format, values)
    }

    fn startup(&mut self) -> Result<()> {
        let ts = START_NS - 5_000_000;
        self.emit(
            0,
            ts,
            1404,
            self.formats.fork,
            &["gnome-shell".into(), 1404.into(), "gnome-shell".into(), 2210.into()],
        )?;
        self.emit(0, ts + 200_000, 2210, self.formats.exec, &["/usr/bin/vkcube".into(), 2210.into(), 2210.into()])?;
        self.emit(
            1,
            ts + 400_000,
            2210,
            self.formats.fork,
            &["vkcube".into(), 2210.into(), "vkcube".into(), 2211.into()],
        )?;
        Ok(())
    }

    fn sched_switches(&mut self, frame_start: u64) -> Result<()> {
        for _ in 0..self.cpus * 3 {
            let cpu = self.cpu();
            let ts = frame_start + self.rng.gen_range(0..FRAME_NS);
            let prev = self.running[cpu as usize];
            let next = TASKS[self.rng.gen_range(0..TASKS.len())].0;
            let state: i64 = if self.rng.gen_bool(0.5) { 0 } else { 1 };
            self.emit(
                cpu,
                ts,
                prev,
                self.formats.sched_switch,
                &[
                    Self::comm_of(prev).into(),
                    prev.into(),
                    120.into(),
                    state.into(),
                    Self::comm_of(next).into(),
                    next.into(),
                    120.into(),
                ],
            )?;
            self.running[cpu as usize] = next;
        }
        Ok(())
    }

    fn vblank(&mut self, frame: u32, frame_start: u64) -> Result<()> {
        let seq = frame + 1;
        let jitter = self.rng.gen_range(0..20_000);
        self.emit(0, frame_start + 1_000_000, 812, self.formats.vblank_queued, &[0.into(), seq.into()])?;
        let ts = frame_start + FRAME_NS - 10_000 + jitter;
        self.emit(0, ts, 0, self.formats.vblank, &[0.into(), seq.into(), (ts as i64).into(), 0u32.into()])
    }

    fn amd_submission(&mut self, frame_start: u64) -> Result<()> {
        self.amd_seqno += 1;
        let seqno = self.amd_seqno;
        let cpu = self.cpu();
        let cs = frame_start + self.rng.gen_range(1_000_000..4_000_000);
        let run = cs + self.rng.gen_range(20_000..800_000);
        let done = run + self.rng.gen_range(500_000..6_000_000);
        let values = |s: u32| -> Vec<FieldValue> {
            vec![AMD_TIMELINE.into(), AMD_CONTEXT.into(), s.into(), AMD_TIMELINE.into()]
        };
        self.emit(cpu, cs, 2210, self.formats.cs_ioctl, &values(seqno))?;
        self.emit(cpu, cs + 5_000, 2210, self.formats.job_msg, &[
            format!("frame submit {}", seqno).into(),
            AMD_TIMELINE.into(),
            AMD_CONTEXT.into(),
            seqno.into(),
        ])?;
        self.emit(cpu, run, 77, self.formats.run_job, &values(seqno))?;
        self.emit(
            0,
            done,
            0,
            self.formats.fence_signaled,
            &["amdgpu".into(), AMD_TIMELINE.into(), AMD_CONTEXT.into(), seqno.into()],
        )
    }

    fn drm_sched_job(&mut self, frame_start: u64) -> Result<()> {
        self.drm_job_id += 1;
        let id = self.drm_job_id;
        // A small pool of fence pointers, reused once a job signals.
        let fence = 0xffff_8880_0000_0000u64 + (id % 4) * 0x100;
        let cpu = self.cpu();
        let queued = frame_start + self.rng.gen_range(0..2_000_000);
        let run = queued + self.rng.gen_range(10_000..500_000);
        let done = run + self.rng.gen_range(200_000..3_000_000);
        let values = [DRM_SCHED_RING.into(), id.into(), fence.into()];
        self.emit(cpu, queued, 2211, self.formats.sched_job, &values)?;
        self.emit(cpu, run, 77, self.formats.sched_run_job, &values)?;
        self.emit(1 % self.cpus, done, 0, self.formats.sched_process_job, &[fence.into()])
    }

    fn msm_submit(&mut self, frame_start: u64) -> Result<()> {
        self.msm_seqno += 1;
        let seqno = self.msm_seqno;
        let flush = frame_start + self.rng.gen_range(0..4_000_000);
        let elapsed = self.rng.gen_range(100_000..4_000_000u64);
        let cpu = self.cpu();
        self.emit(cpu, flush, 1404, self.formats.msm_flush, &[seqno.into(), 0u32.into(), seqno.into()])?;
        self.emit(
            0,
            flush + elapsed,
            0,
            self.formats.msm_retired,
            &[seqno.into(), 0u32.into(), seqno.into(), elapsed.into()],
        )
    }

    fn i915_request(&mut self, frame_start: u64) -> Result<()> {
        self.i915_seqno += 1;
        let seqno = self.i915_seqno;
        let global = 10_000 + seqno;
        let ctx = 3 + seqno % 2;
        let hw_id = 0x20 + ctx;
        let mut ts = frame_start + self.rng.gen_range(0..3_000_000);
        let cpu = self.cpu();
        for format in self.formats.i915_stages {
            self.emit(cpu, ts, 812, format, &[0u32.into(), ctx.into(), seqno.into(), global.into(), hw_id.into()])?;
            ts += self.rng.gen_range(5_000..400_000);
        }
        self.emit(0, ts - 1_000, 0, self.formats.i915_notify, &[0u32.into(), global.into(), 0u32.into()])
    }

    fn marker(&mut self, frame: u32, frame_start: u64) -> Result<()> {
        let cpu = self.cpu();
        self.emit(
            cpu,
            frame_start + 50_000,
            2210,
            self.formats.print,
            &[0xffff_ffff_8100_0000u64.into(), format!("frame {} begin\n", frame).into()],
        )
    }

    fn run(&mut self, frames: u32) -> Result<()> {
        self.startup()?;
        for frame in 0..frames {
            let frame_start = START_NS + frame as u64 * FRAME_NS;
            self.marker(frame, frame_start)?;
            self.sched_switches(frame_start)?;
            self.vblank(frame, frame_start)?;
            self.amd_submission(frame_start)?;
            self.drm_sched_job(frame_start)?;
            self.msm_submit(frame_start)?;
            self.i915_request(frame_start)?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut writer = TraceDatWriter::new(args.file_version, args.cpus.max(1));
    writer = match args.compression {
        Compression::None => writer,
        Compression::Zlib => writer.with_compression(Codec::Zlib),
        Compression::Brotli => writer.with_compression(Codec::Brotli),
        Compression::Zstd => writer.with_compression(Codec::Zstd),
    };
    for (pid, comm) in TASKS {
        writer.add_cmdline(*pid, comm);
    }
    writer.set_trace_clock("mono");
    writer.set_uname("Linux gpuvis-tracegen 6.8.0 x86_64");
    writer.set_tracer_version("3.2");
    for cpu in 0..args.cpus.max(1) {
        writer.add_cpustat(&format!("CPU: {}\nentries: 0\noverrun: 0\ncommit overrun: 0\n", cpu));
    }

    let mut generator = Generator::new(writer, args.cpus.max(1), args.seed);
    generator.run(args.frames)?;
    info!("generated {} events over {} frames", generator.writer.event_count(), args.frames);

    generator.writer.write_to(&args.output)?;
    println!("Trace written to: {}", args.output.display());
    Ok(())
}
