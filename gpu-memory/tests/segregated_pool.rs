use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gpu_memory::{
    Allocation, BufferUsage, BufferView, CowBufferConfig, CowBufferHost, GpuMemoryError, MapAccess, MultiChunkConfig,
    MultiChunkHost, RecordedCommand, SegregatedPool, SimulatedDevice, SimulatedFence,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TIMEOUT: Duration = Duration::from_millis(100);

fn multi_chunk_pool(
    device: &SimulatedDevice,
    chunk_size: u64,
    max_chunks: usize,
    size_classes: Vec<u64>,
    retained_empty_chunks: usize,
) -> SegregatedPool<MultiChunkHost> {
    let config = MultiChunkConfig {
        chunk_size,
        max_chunks,
        size_classes,
        min_alignment: 256,
        usage: BufferUsage::STORAGE_BUFFER,
        map_access: MapAccess::Write,
        retained_empty_chunks,
    };
    let host = MultiChunkHost::new(Arc::new(device.clone()), config, "test pool").unwrap();
    SegregatedPool::new(Arc::new(device.clone()), host, TIMEOUT)
}

fn assert_no_overlaps(views: &mut [BufferView]) {
    views.sort_by_key(|view| (view.buffer.handle(), view.offset));
    for pair in views.windows(2) {
        assert!(!pair[0].overlaps(&pair[1]), "{:?} overlaps {:?}", pair[0], pair[1]);
    }
}

fn signaled() -> Arc<SimulatedFence> {
    Arc::new(SimulatedFence::signaled_fence())
}

#[test]
fn large_requests_fill_chunks_until_the_limit() {
    let device = SimulatedDevice::new();
    let pool = multi_chunk_pool(&device, 65536, 2, vec![256, 1024, 4096, 65536], 1);

    let first = pool.allocate(40000, 1).unwrap();
    assert_eq!(1, pool.stats().chunk_count);
    let second = pool.allocate(40000, 1).unwrap();
    assert_eq!(2, pool.stats().chunk_count);
    assert_ne!(first.chunk(), second.chunk());
    assert_ne!(first.buffer_view().unwrap().buffer.handle(), second.buffer_view().unwrap().buffer.handle());

    let third = pool.allocate(40000, 1);
    assert!(matches!(third, Err(GpuMemoryError::OutOfMemory { .. })));
    // Smaller allocations still fit in the remainders.
    assert!(pool.allocate(20000, 1).is_ok());
}

#[test]
fn capacity_is_chunk_size_times_max_chunks() {
    for size in [256, 1024, 4096, 16384, 65536] {
        let device = SimulatedDevice::new();
        let pool = multi_chunk_pool(&device, 65536, 3, vec![256, 1024, 4096, 16384, 65536], 1);
        let count = 3 * 65536 / size;
        let allocations = (0..count).map(|_| pool.allocate(size, 1).unwrap()).collect::<Vec<_>>();
        assert_eq!(3 * 65536, pool.stats().allocated_bytes);
        assert_eq!(0.0, pool.stats().external_fragmentation);
        assert!(
            matches!(pool.allocate(size, 1), Err(GpuMemoryError::OutOfMemory { .. })),
            "allocation {} of {size} bytes should not fit",
            count + 1,
        );
        pool.validate().unwrap();
        drop(allocations);
    }
}

#[test]
fn random_allocations_never_overlap() {
    let device = SimulatedDevice::new();
    let pool = multi_chunk_pool(&device, 1 << 20, 4, vec![256, 4096, 65536, 1 << 20], 1);
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let mut live: Vec<Allocation> = Vec::new();

    for _ in 0..50 {
        for _ in 0..rng.gen_range(1..40) {
            let size = rng.gen_range(1..=32 * 1024);
            let alignment = 1 << rng.gen_range(0..12);
            match pool.allocate(size, alignment) {
                Ok(allocation) => {
                    let view = allocation.buffer_view().unwrap();
                    assert_eq!(0, view.offset % alignment);
                    assert!(view.end() <= view.buffer.size());
                    live.push(allocation);
                }
                Err(GpuMemoryError::OutOfMemory { .. }) => {}
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        for _ in 0..rng.gen_range(0..live.len().max(1)) {
            if live.is_empty() {
                break;
            }
            live.swap_remove(rng.gen_range(0..live.len()));
        }

        let mut views = live.iter().map(|allocation| allocation.buffer_view().unwrap()).collect::<Vec<_>>();
        assert_no_overlaps(&mut views);
        pool.end_frame(signaled());
        pool.validate().unwrap_or_else(|err| panic!("{err}\n{}", pool.dump_free_blocks()));
    }
}

#[test]
fn freed_memory_is_reclaimed_after_the_fence() {
    let device = SimulatedDevice::new();
    let pool = multi_chunk_pool(&device, 65536, 4, vec![256, 4096, 65536], 4);
    let allocations = (0..100).map(|i| pool.allocate(100 + i * 10, 16).unwrap()).collect::<Vec<_>>();
    let allocated = pool.stats().allocated_bytes;
    drop(allocations);
    assert_eq!(allocated, pool.stats().allocated_bytes);

    let fence = device.create_fence();
    pool.end_frame(fence.clone());
    assert_eq!(allocated, pool.stats().allocated_bytes);
    assert_eq!(1, pool.stats().sealed_batches);

    fence.signal();
    pool.end_frame(device.create_fence());
    let stats = pool.stats();
    assert_eq!(0, stats.allocated_bytes);
    assert_eq!(0, stats.pending_garbage_bytes);
    assert_eq!(0, stats.sealed_batches);
    assert_eq!(0, stats.live_allocations);
    pool.validate().unwrap();
}

#[test]
fn concurrent_allocations_do_not_overlap() {
    let device = SimulatedDevice::new();
    let pool = multi_chunk_pool(&device, 1 << 20, 8, vec![256, 4096, 65536, 1 << 20], 1);

    let per_thread = thread::scope(|scope| {
        let handles = (0..8u8)
            .map(|thread_index| {
                let pool = &pool;
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(thread_index as u64);
                    let mut allocations = Vec::new();
                    for _ in 0..200 {
                        let size = rng.gen_range(16..2048usize);
                        let mut allocation = pool.allocate(size as u64, 16).unwrap();
                        allocation.write(&vec![thread_index; size]).unwrap();
                        allocations.push(allocation);
                        if rng.gen_bool(0.25) {
                            allocations.swap_remove(rng.gen_range(0..allocations.len()));
                        }
                    }
                    (thread_index, allocations)
                })
            })
            .collect::<Vec<_>>();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect::<Vec<_>>()
    });

    let mut views = Vec::new();
    for (thread_index, allocations) in &per_thread {
        for allocation in allocations {
            let view = allocation.buffer_view().unwrap();
            let data = device.read_buffer(view.buffer.handle(), view.offset, view.size).unwrap();
            assert!(data.iter().all(|byte| byte == thread_index));
            views.push(view);
        }
    }
    assert_no_overlaps(&mut views);
    pool.validate().unwrap();
}

#[test]
fn cow_growth_keeps_contents_and_offsets() {
    let device = SimulatedDevice::new();
    let config = CowBufferConfig {
        initial_size: 4096,
        max_size: None,
        growth: true,
        size_classes: vec![256, 1024, 4096],
        min_alignment: 16,
        usage: BufferUsage::STORAGE_BUFFER,
        map_access: MapAccess::Write,
    };
    let host = CowBufferHost::new(Arc::new(device.clone()), config, "gpu scene").unwrap();
    let pool = SegregatedPool::new(Arc::new(device.clone()), host, TIMEOUT);

    let mut before = Vec::new();
    for i in 0..16u8 {
        let mut allocation = pool.allocate(256, 16).unwrap();
        allocation.write(&[i; 256]).unwrap();
        before.push((allocation.buffer_view().unwrap(), allocation, i));
    }
    let old_buffer = pool.with_host(|host| host.buffer().unwrap().handle());

    // The buffer is full, this grows it.
    let grown = pool.allocate(1024, 16).unwrap();
    let new_buffer = pool.with_host(|host| host.buffer().unwrap().handle());
    assert_ne!(old_buffer, new_buffer);
    assert_eq!(8192, pool.with_host(|host| host.total_size()));
    assert_eq!(4096, grown.buffer_view().unwrap().offset);

    for (old_view, allocation, i) in &before {
        let view = allocation.buffer_view().unwrap();
        assert_eq!(old_view.offset, view.offset);
        assert_eq!(new_buffer, view.buffer.handle());
        let data = device.read_buffer(new_buffer, view.offset, view.size).unwrap();
        assert!(data.iter().all(|byte| byte == i));
    }

    let commands = device.recorded_commands();
    assert_eq!(
        vec![
            RecordedCommand::Barrier {
                buffer: old_buffer,
                src_usage: BufferUsage::STORAGE_BUFFER,
                dst_usage: BufferUsage::TRANSFER_SRC,
            },
            RecordedCommand::Barrier {
                buffer: new_buffer,
                src_usage: BufferUsage::empty(),
                dst_usage: BufferUsage::TRANSFER_DST,
            },
            RecordedCommand::Copy {
                src: old_buffer,
                dst: new_buffer,
                src_offset: 0,
                dst_offset: 0,
                size: 4096,
            },
            RecordedCommand::Barrier {
                buffer: new_buffer,
                src_usage: BufferUsage::TRANSFER_DST,
                dst_usage: BufferUsage::STORAGE_BUFFER,
            },
            RecordedCommand::Submit,
        ],
        commands,
    );

    // Views taken before growth keep the old buffer alive.
    assert!(device.read_buffer(old_buffer, 0, 16).is_some());
    drop(before);
    pool.end_frame(signaled());
    pool.end_frame(signaled());
    assert!(device.read_buffer(old_buffer, 0, 16).is_none());
}

#[test]
fn fixed_cow_buffer_runs_out() {
    let device = SimulatedDevice::new();
    let config = CowBufferConfig {
        initial_size: 4096,
        growth: false,
        size_classes: vec![256, 4096],
        ..CowBufferConfig::default()
    };
    let host = CowBufferHost::new(Arc::new(device.clone()), config, "fixed scene").unwrap();
    let pool = SegregatedPool::new(Arc::new(device), host, TIMEOUT);
    let _all = pool.allocate(4096, 1).unwrap();
    assert!(matches!(pool.allocate(16, 1), Err(GpuMemoryError::OutOfMemory { .. })));
}

#[test]
fn deleting_an_empty_chunk_idles_the_device() {
    let device = SimulatedDevice::new();
    let pool = multi_chunk_pool(&device, 65536, 2, vec![256, 65536], 0);
    let allocation = pool.allocate(1000, 1).unwrap();
    assert_eq!(65536, device.allocated_bytes());
    drop(allocation);

    let fence = device.create_fence();
    pool.end_frame(fence.clone());
    fence.signal();
    pool.end_frame(device.create_fence());
    assert_eq!(1, device.wait_idle_count());
    assert_eq!(0, device.allocated_bytes());
    assert_eq!(0, pool.stats().chunk_count);
}
