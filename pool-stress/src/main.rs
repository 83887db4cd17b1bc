use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use argh::FromArgs;
use gpu_memory::{
    Allocation, BufferUsage, BufferView, Bytes, CowBufferConfig, GpuMemoryConfig, GpuMemoryError, GpuMemoryPools,
    MapAccess, MultiChunkConfig, SimulatedDevice, SimulatedFence, SingleBufferConfig, TransientConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

const MIB: u64 = 1024 * 1024;

#[derive(FromArgs)]
/// Runs frames of parallel allocations against the gpu memory pools on a
/// simulated device, with a simulated gpu reading each frame's data some time
/// later. Fails if the gpu ever sees data that was overwritten too early.
struct Opts {
    #[argh(option, default = "300")]
    /// amount of frames to run
    frames: u64,
    #[argh(option, default = "256")]
    /// transient allocations per frame
    allocations: usize,
    #[argh(option, default = "2")]
    /// how long the simulated gpu takes to process a frame, in milliseconds
    latency: u64,
    #[argh(option, default = "4")]
    /// size of the transient ring buffer in MiB
    ring_mib: u64,
    #[argh(option, default = "1")]
    /// size of the general pool's chunks in MiB
    chunk_mib: u64,
    #[argh(option, default = "8")]
    /// maximum amount of chunks in the general pool
    max_chunks: usize,
    #[argh(option, default = "0")]
    /// seed for the allocation sizes and data
    seed: u64,
    #[argh(option)]
    /// amount of allocating threads (defaults to the amount of cpus)
    threads: Option<usize>,
    #[argh(switch, short = 'v')]
    /// print debug logs and per-frame statistics
    verbose: bool,
}

struct Upload {
    view: BufferView,
    pattern: u8,
}

struct SubmittedFrame {
    index: u64,
    uploads: Vec<Upload>,
    fence: Arc<SimulatedFence>,
}

fn main() -> ExitCode {
    let opts: Opts = argh::from_env();
    {
        use logger::Logger;
        static LOGGER: Logger = Logger;
        let level = if opts.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };
        if log::set_logger(&LOGGER).map(|()| log::set_max_level(level)).is_err() {
            eprintln!("could not set the logger");
        }
    }
    if let Some(threads) = opts.threads {
        if let Err(err) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
            log::error!("could not set up the thread pool: {err}");
            return ExitCode::FAILURE;
        }
    }

    match run(&opts) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(corruptions) => {
            log::error!("{corruptions} corrupted allocations detected");
            ExitCode::FAILURE
        }
        Err(err) => {
            log::error!("stress test failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn config(opts: &Opts) -> GpuMemoryConfig {
    let chunk_size = opts.chunk_mib * MIB;
    GpuMemoryConfig {
        unified_geometry: SingleBufferConfig {
            size: 16 * MIB,
            size_classes: vec![1024, 16 * 1024, 256 * 1024, 4 * MIB, 16 * MIB],
            ..SingleBufferConfig::default()
        },
        gpu_scene: CowBufferConfig {
            initial_size: MIB,
            max_size: Some(64 * MIB),
            size_classes: vec![256, 4 * 1024, 64 * 1024, MIB],
            ..CowBufferConfig::default()
        },
        general: MultiChunkConfig {
            chunk_size,
            max_chunks: opts.max_chunks,
            size_classes: vec![256, 4 * 1024, 64 * 1024, chunk_size],
            map_access: MapAccess::Write,
            usage: BufferUsage::STORAGE_BUFFER,
            // Deleting a chunk idles the device, which would complete every
            // simulated frame before the gpu thread has read them.
            retained_empty_chunks: opts.max_chunks,
            ..MultiChunkConfig::default()
        },
        transient: TransientConfig {
            size: opts.ring_mib * MIB,
            fence_timeout: Duration::from_secs(10),
            ..TransientConfig::default()
        },
        fence_timeout: Duration::from_secs(10),
    }
}

/// Returns the amount of corrupted allocations found.
fn run(opts: &Opts) -> Result<u64, GpuMemoryError> {
    let device = SimulatedDevice::new();
    let mut pools = GpuMemoryPools::new(Arc::new(device.clone()), &config(opts))?;
    let max_transient_size = (opts.ring_mib * MIB / (opts.allocations.max(1) as u64 * 2)).max(32);

    let (frame_sender, frame_receiver) = mpsc::channel::<SubmittedFrame>();
    let gpu = {
        let device = device.clone();
        let latency = Duration::from_millis(opts.latency);
        thread::spawn(move || simulate_gpu(&device, frame_receiver, latency))
    };

    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut long_lived: Vec<(Allocation, u8)> = Vec::new();
    let mut scene_objects: Vec<Allocation> = Vec::new();
    let mut corruptions = 0;
    let start_time = Instant::now();

    for frame in 0..opts.frames {
        profiling::scope!("frame");
        let frame_seed = opts.seed ^ frame.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let uploads = (0..opts.allocations)
            .into_par_iter()
            .map(|i| -> Result<Upload, GpuMemoryError> {
                let mut rng = StdRng::seed_from_u64(frame_seed.wrapping_add(i as u64));
                let size = rng.gen_range(16..=max_transient_size);
                let alignment = 1u64 << rng.gen_range(2..=8u32);
                let pattern = rng.gen::<u8>();
                let mut allocation = pools.transient().allocate(size, alignment)?;
                allocation.write(&vec![pattern; size as usize])?;
                Ok(Upload {
                    view: allocation.into_view(),
                    pattern,
                })
            })
            .collect::<Result<Vec<Upload>, GpuMemoryError>>()?;

        for _ in 0..rng.gen_range(0..8) {
            let size = rng.gen_range(64..=64 * 1024);
            match pools.general().allocate(size, 256) {
                Ok(mut allocation) => {
                    let pattern = rng.gen::<u8>();
                    allocation.write(&vec![pattern; size as usize])?;
                    long_lived.push((allocation, pattern));
                }
                Err(err @ GpuMemoryError::OutOfMemory { .. }) => log::debug!("general pool is full: {err}"),
                Err(err) => return Err(err),
            }
        }
        while long_lived.len() > 48 || (!long_lived.is_empty() && rng.gen_bool(0.3)) {
            let (allocation, pattern) = long_lived.swap_remove(rng.gen_range(0..long_lived.len()));
            if !contents_match(&device, &allocation, pattern) {
                corruptions += 1;
            }
        }

        for _ in 0..rng.gen_range(0..4) {
            scene_objects.push(pools.gpu_scene().allocate(rng.gen_range(256..=4096), 16)?);
        }
        while scene_objects.len() > 512 || (!scene_objects.is_empty() && rng.gen_bool(0.2)) {
            scene_objects.swap_remove(rng.gen_range(0..scene_objects.len()));
        }

        let fence = device.create_fence();
        let submitted = SubmittedFrame {
            index: frame,
            uploads,
            fence: fence.clone(),
        };
        if frame_sender.send(submitted).is_err() {
            log::error!("the simulated gpu thread has stopped");
            break;
        }
        pools.end_frame(fence)?;

        if opts.verbose || frame % 60 == 59 {
            let stats = pools.stats();
            log::info!(
                "frame {frame}: general {}/{} in {} chunks, gpu scene {}/{}, transient {} in flight, {} fence waits",
                Bytes(stats.general.allocated_bytes),
                Bytes(stats.general.total_capacity_bytes),
                stats.general.chunk_count,
                Bytes(stats.gpu_scene.allocated_bytes),
                Bytes(stats.gpu_scene.total_capacity_bytes),
                Bytes(stats.transient.in_flight_bytes),
                stats.transient.fence_waits,
            );
        }
        profiling::finish_frame!();
    }

    drop(frame_sender);
    corruptions += gpu.join().unwrap_or_else(|_| {
        log::error!("the simulated gpu thread panicked");
        1
    });
    for (allocation, pattern) in long_lived.drain(..) {
        if !contents_match(&device, &allocation, pattern) {
            corruptions += 1;
        }
    }
    pools.general().validate()?;
    pools.gpu_scene().validate()?;

    let stats = pools.stats();
    log::info!(
        "{} frames in {:.2?}, {} fence waits, peak device memory {}",
        opts.frames,
        start_time.elapsed(),
        stats.transient.fence_waits,
        Bytes(device.peak_allocated_bytes()),
    );
    drop(scene_objects);
    pools.teardown()?;
    Ok(corruptions)
}

/// Plays the part of the gpu: reads each frame's uploads after a delay, then
/// signals the frame's fence. Returns the amount of corrupted uploads.
fn simulate_gpu(device: &SimulatedDevice, frames: mpsc::Receiver<SubmittedFrame>, latency: Duration) -> u64 {
    let mut corruptions = 0;
    for frame in frames {
        profiling::scope!("simulated gpu frame");
        thread::sleep(latency);
        for upload in &frame.uploads {
            let view = &upload.view;
            let intact = device
                .read_buffer(view.buffer.handle(), view.offset, view.size)
                .map_or(false, |data| data.iter().all(|&byte| byte == upload.pattern));
            if !intact {
                log::error!("frame {}: transient data at {view:?} was overwritten before the gpu read it", frame.index);
                corruptions += 1;
            }
        }
        frame.fence.signal();
    }
    corruptions
}

fn contents_match(device: &SimulatedDevice, allocation: &Allocation, pattern: u8) -> bool {
    let Some(view) = allocation.buffer_view() else {
        log::error!("a live allocation has no buffer");
        return false;
    };
    match device.read_buffer(view.buffer.handle(), view.offset, view.size) {
        Some(data) if data.iter().all(|&byte| byte == pattern) => true,
        _ => {
            log::error!("allocation at {view:?} does not contain what was written to it");
            false
        }
    }
}

mod logger {
    use log::{Level, Log, Metadata, Record};

    pub struct Logger;

    impl Log for Logger {
        fn enabled(&self, _metadata: &Metadata) -> bool {
            true
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                let message = format!("{}", record.args());
                let file = record.file().unwrap_or("");
                let line = record.line().unwrap_or(0);
                let (color_code, color_end) = if cfg!(target_family = "unix") {
                    let start = match record.level() {
                        Level::Trace => "\u{1B}[34m", /* blue */
                        Level::Debug => "\u{1B}[36m", /* cyan */
                        Level::Info => "\u{1B}[32m",  /* green */
                        Level::Warn => "\u{1B}[33m",  /* yellow */
                        Level::Error => "\u{1B}[31m", /* red */
                    };
                    (start, "\u{1B}[m")
                } else {
                    ("", "")
                };
                eprintln!("{color_code}[{file}:{line}]{color_end} {message}");
            }
        }

        fn flush(&self) {
            use std::io::Write;
            let mut stderr = std::io::stderr().lock();
            let _ = stderr.flush();
        }
    }
}
