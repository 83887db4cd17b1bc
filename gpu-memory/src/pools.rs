use alloc::sync::Arc;
use core::time::Duration;

use crate::device::{FencePtr, GpuDevice};
use crate::pool::{PoolStats, SegregatedPool};
use crate::segregated::cow_buffer::{CowBufferConfig, CowBufferHost};
use crate::segregated::multi_chunk::{MultiChunkConfig, MultiChunkHost};
use crate::segregated::single_buffer::{SingleBufferConfig, SingleBufferHost};
use crate::transient::{TransientConfig, TransientRingBuffer, TransientStats};
use crate::GpuMemoryError;

#[derive(Debug, Clone)]
pub struct GpuMemoryConfig {
    /// Vertex and index data of every mesh, in one buffer so that draws can
    /// share vertex buffer bindings.
    pub unified_geometry: SingleBufferConfig,
    /// Per-object scene data, in one buffer that grows as the scene does.
    pub gpu_scene: CowBufferConfig,
    pub general: MultiChunkConfig,
    pub transient: TransientConfig,
    /// How long teardown waits for outstanding fences.
    pub fence_timeout: Duration,
}

impl Default for GpuMemoryConfig {
    fn default() -> Self {
        GpuMemoryConfig {
            unified_geometry: SingleBufferConfig::default(),
            gpu_scene: CowBufferConfig::default(),
            general: MultiChunkConfig::default(),
            transient: TransientConfig::default(),
            fence_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpuMemoryStats {
    pub unified_geometry: PoolStats,
    pub gpu_scene: PoolStats,
    pub general: PoolStats,
    pub transient: TransientStats,
}

/// Every memory pool of a renderer. Created after the device, torn down
/// before it.
pub struct GpuMemoryPools {
    device: Arc<dyn GpuDevice>,
    unified_geometry: SegregatedPool<SingleBufferHost>,
    gpu_scene: SegregatedPool<CowBufferHost>,
    general: SegregatedPool<MultiChunkHost>,
    transient: TransientRingBuffer,
    frame: u64,
}

impl GpuMemoryPools {
    pub fn new(device: Arc<dyn GpuDevice>, config: &GpuMemoryConfig) -> Result<GpuMemoryPools, GpuMemoryError> {
        profiling::scope!("gpu memory pool creation");
        let unified_geometry_host = SingleBufferHost::new(&*device, config.unified_geometry.clone(), "unified geometry buffer")?;
        let gpu_scene_host = CowBufferHost::new(device.clone(), config.gpu_scene.clone(), "gpu scene buffer")?;
        let general_host = MultiChunkHost::new(device.clone(), config.general.clone(), "general pool")?;
        let transient = TransientRingBuffer::new(device.clone(), &config.transient, "transient ring buffer")?;
        Ok(GpuMemoryPools {
            unified_geometry: SegregatedPool::new(device.clone(), unified_geometry_host, config.fence_timeout),
            gpu_scene: SegregatedPool::new(device.clone(), gpu_scene_host, config.fence_timeout),
            general: SegregatedPool::new(device.clone(), general_host, config.fence_timeout),
            transient,
            device,
            frame: 0,
        })
    }

    pub fn unified_geometry(&self) -> &SegregatedPool<SingleBufferHost> {
        &self.unified_geometry
    }

    pub fn gpu_scene(&self) -> &SegregatedPool<CowBufferHost> {
        &self.gpu_scene
    }

    pub fn general(&self) -> &SegregatedPool<MultiChunkHost> {
        &self.general
    }

    pub fn transient(&self) -> &TransientRingBuffer {
        &self.transient
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Should be called once per frame, after the frame's commands have
    /// been submitted with `fence`.
    pub fn end_frame(&mut self, fence: FencePtr) -> Result<(), GpuMemoryError> {
        profiling::scope!("gpu memory end of frame");
        self.unified_geometry.end_frame(fence.clone());
        self.gpu_scene.end_frame(fence.clone());
        self.general.end_frame(fence.clone());
        self.transient.end_frame(fence)?;
        self.frame += 1;
        Ok(())
    }

    pub fn stats(&self) -> GpuMemoryStats {
        GpuMemoryStats {
            unified_geometry: self.unified_geometry.stats(),
            gpu_scene: self.gpu_scene.stats(),
            general: self.general.stats(),
            transient: self.transient.stats(),
        }
    }

    /// Waits for the device to idle and releases every pool's memory. The
    /// first error is returned, but every pool is released regardless.
    pub fn teardown(self) -> Result<(), GpuMemoryError> {
        profiling::scope!("gpu memory teardown");
        let GpuMemoryPools {
            device,
            unified_geometry,
            gpu_scene,
            general,
            transient,
            ..
        } = self;
        device.wait_idle().map_err(GpuMemoryError::WaitIdle)?;
        let results = [
            unified_geometry.teardown_after_idle(),
            gpu_scene.teardown_after_idle(),
            general.teardown_after_idle(),
        ];
        transient.teardown_after_idle();
        log::debug!("gpu memory pools torn down");
        results.into_iter().collect()
    }
}
