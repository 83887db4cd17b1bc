//! [`GpuDevice`] implementation on top of an [`ash::Device`] created by the
//! application. Every buffer gets its own dedicated memory allocation, the
//! pools built on top of this do the suballocation.
use alloc::sync::Arc;
use ash::vk;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use core::time::Duration;
use std::sync::{Mutex, PoisonError};

use crate::device::{BufferInfo, BufferPtr, BufferUsage, GpuBuffer, GpuDevice, GpuFence, MapAccess, TransferCommand};

pub struct VulkanDevice {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Also guards the transfer queue, which must be externally synchronized.
    command_pool: Mutex<vk::CommandPool>,
    transfer_queue: vk::Queue,
    debug_identifier: &'static str,
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let command_pool = *self.command_pool.get_mut().unwrap_or_else(PoisonError::into_inner);
        unsafe { self.device.destroy_command_pool(command_pool, None) };
    }
}

impl VulkanDevice {
    /// The `device` is not destroyed when this is dropped, but it must
    /// outlive this and every buffer created from this. The `transfer_queue`
    /// must not be submitted to by anything else while buffers are being
    /// grown.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
        transfer_queue: vk::Queue,
        transfer_queue_family: u32,
        debug_identifier: &'static str,
    ) -> Result<VulkanDevice, vk::Result> {
        profiling::scope!("vulkan gpu memory device creation");
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let command_pool_create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(transfer_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe { device.create_command_pool(&command_pool_create_info, None) }?;
        Ok(VulkanDevice {
            device: device.clone(),
            memory_properties,
            command_pool: Mutex::new(command_pool),
            transfer_queue,
            debug_identifier,
        })
    }

    pub fn create_fence(&self) -> Result<Arc<VulkanFence>, vk::Result> {
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }?;
        Ok(Arc::new(VulkanFence {
            inner: fence,
            device: self.device.clone(),
        }))
    }

    fn get_memory_type_index(&self, memory_type_bits: u32, flags: &MemoryProps, size: vk::DeviceSize) -> Result<u32, vk::Result> {
        let props = &self.memory_properties;
        let types = &props.memory_types[..props.memory_type_count as usize];
        let heaps = &props.memory_heaps[..props.memory_heap_count as usize];
        let allowed = |i: usize| memory_type_bits & (1 << i) != 0;
        let fits = |memory_type: &vk::MemoryType| heaps[memory_type.heap_index as usize].size >= size;
        for (i, memory_type) in types.iter().enumerate() {
            let prop_flags = memory_type.property_flags;
            if allowed(i) && prop_flags.contains(flags.optimal) && !prop_flags.intersects(flags.unwanted) && fits(memory_type) {
                return Ok(i as u32);
            }
        }
        for (i, memory_type) in types.iter().enumerate() {
            if allowed(i) && memory_type.property_flags.contains(flags.fallback) && fits(memory_type) {
                return Ok(i as u32);
            }
        }
        Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    }
}

impl GpuDevice for VulkanDevice {
    fn create_buffer(&self, info: &BufferInfo) -> Result<BufferPtr, vk::Result> {
        profiling::scope!("vulkan buffer creation");
        let buffer_create_info = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_create_info, None) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory_props = MemoryProps::for_access(info.map_access);

        let memory = match self.get_memory_type_index(requirements.memory_type_bits, &memory_props, requirements.size) {
            Ok(memory_type_index) => {
                let alloc_info = vk::MemoryAllocateInfo::default()
                    .allocation_size(requirements.size)
                    .memory_type_index(memory_type_index);
                log::trace!(
                    "vk::allocate_memory({} bytes, index {}) for {} ({})",
                    requirements.size,
                    memory_type_index,
                    info.name,
                    self.debug_identifier,
                );
                unsafe { self.device.allocate_memory(&alloc_info, None) }
            }
            Err(err) => Err(err),
        };
        let memory = match memory {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
            return Err(err);
        }

        Ok(Arc::new(VulkanBuffer {
            inner: buffer,
            memory,
            device: self.device.clone(),
            size: info.size,
            usage: info.usage,
            mapped: AtomicPtr::new(ptr::null_mut()),
            map_lock: Mutex::new(()),
        }))
    }

    fn wait_idle(&self) -> Result<(), vk::Result> {
        profiling::scope!("vk::device_wait_idle");
        unsafe { self.device.device_wait_idle() }
    }

    fn submit_transfer(&self, commands: &[TransferCommand], name: &str) -> Result<(), vk::Result> {
        profiling::scope!("vulkan transfer submission");
        let command_pool = self.command_pool.lock().unwrap_or_else(PoisonError::into_inner);
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&allocate_info) }?[0];
        let fence = match unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(err) => {
                unsafe { self.device.free_command_buffers(*command_pool, &[command_buffer]) };
                return Err(err);
            }
        };

        let result = (|| {
            let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }?;
            for command in commands {
                self.record(command_buffer, command);
            }
            unsafe { self.device.end_command_buffer(command_buffer) }?;

            let command_buffers = [command_buffer];
            let submit_infos = [vk::SubmitInfo::default().command_buffers(&command_buffers)];
            log::trace!("vk::queue_submit for {name} ({})", self.debug_identifier);
            unsafe { self.device.queue_submit(self.transfer_queue, &submit_infos, fence) }?;
            profiling::scope!("waiting for transfer to finish");
            unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
        })();

        unsafe {
            self.device.destroy_fence(fence, None);
            self.device.free_command_buffers(*command_pool, &[command_buffer]);
        }
        result
    }
}

impl VulkanDevice {
    fn record(&self, command_buffer: vk::CommandBuffer, command: &TransferCommand) {
        match *command {
            TransferCommand::Barrier {
                buffer,
                src_usage,
                dst_usage,
            } => {
                let (src_stage_mask, src_access_mask) = usage_scope(src_usage);
                let (dst_stage_mask, dst_access_mask) = usage_scope(dst_usage);
                let barriers = [vk::BufferMemoryBarrier2::default()
                    .buffer(buffer.handle())
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .src_access_mask(src_access_mask)
                    .dst_access_mask(dst_access_mask)
                    .src_stage_mask(src_stage_mask)
                    .dst_stage_mask(dst_stage_mask)];
                let dep_info = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
                unsafe { self.device.cmd_pipeline_barrier2(command_buffer, &dep_info) };
            }
            TransferCommand::Copy {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => {
                let copy_regions = [vk::BufferCopy::default().src_offset(src_offset).dst_offset(dst_offset).size(size)];
                unsafe { self.device.cmd_copy_buffer(command_buffer, src.handle(), dst.handle(), &copy_regions) };
            }
        }
    }
}

/// The pipeline stages and memory accesses a buffer with the given usage
/// flags may be involved in.
fn usage_scope(usage: BufferUsage) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    let mut stages = vk::PipelineStageFlags2::NONE;
    let mut access = vk::AccessFlags2::NONE;
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        stages |= vk::PipelineStageFlags2::COPY;
        access |= vk::AccessFlags2::TRANSFER_READ;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        stages |= vk::PipelineStageFlags2::COPY;
        access |= vk::AccessFlags2::TRANSFER_WRITE;
    }
    if usage.contains(BufferUsage::VERTEX_BUFFER) {
        stages |= vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT;
        access |= vk::AccessFlags2::VERTEX_ATTRIBUTE_READ;
    }
    if usage.contains(BufferUsage::INDEX_BUFFER) {
        stages |= vk::PipelineStageFlags2::INDEX_INPUT;
        access |= vk::AccessFlags2::INDEX_READ;
    }
    if usage.contains(BufferUsage::INDIRECT_BUFFER) {
        stages |= vk::PipelineStageFlags2::DRAW_INDIRECT;
        access |= vk::AccessFlags2::INDIRECT_COMMAND_READ;
    }
    if usage.contains(BufferUsage::UNIFORM_BUFFER) {
        stages |= vk::PipelineStageFlags2::ALL_COMMANDS;
        access |= vk::AccessFlags2::UNIFORM_READ;
    }
    if usage.intersects(BufferUsage::STORAGE_BUFFER | BufferUsage::UNIFORM_TEXEL_BUFFER | BufferUsage::STORAGE_TEXEL_BUFFER) {
        stages |= vk::PipelineStageFlags2::ALL_COMMANDS;
        access |= vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE;
    }
    (stages, access)
}

/// A heap with the `optimal` and without the `unwanted` flags is used if found,
/// otherwise the first one that has the `fallback` flags is used.
struct MemoryProps {
    optimal: vk::MemoryPropertyFlags,
    unwanted: vk::MemoryPropertyFlags,
    fallback: vk::MemoryPropertyFlags,
}

impl MemoryProps {
    fn for_access(map_access: MapAccess) -> MemoryProps {
        match map_access {
            // Prefers resizable BAR memory, i.e. device local memory the CPU can write to.
            MapAccess::Write => MemoryProps {
                optimal: vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                unwanted: vk::MemoryPropertyFlags::empty(),
                fallback: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            },
            MapAccess::ReadWrite => MemoryProps {
                optimal: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED,
                unwanted: vk::MemoryPropertyFlags::empty(),
                fallback: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            },
            MapAccess::None => MemoryProps {
                optimal: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                unwanted: vk::MemoryPropertyFlags::HOST_VISIBLE,
                fallback: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        }
    }
}

pub struct VulkanBuffer {
    pub inner: vk::Buffer,
    memory: vk::DeviceMemory,
    device: ash::Device,
    size: vk::DeviceSize,
    usage: BufferUsage,
    mapped: AtomicPtr<u8>,
    map_lock: Mutex<()>,
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        profiling::scope!("vk::destroy_buffer");
        if !self.mapped.get_mut().is_null() {
            unsafe { self.device.unmap_memory(self.memory) };
        }
        unsafe {
            self.device.destroy_buffer(self.inner, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

impl GpuBuffer for VulkanBuffer {
    fn handle(&self) -> vk::Buffer {
        self.inner
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn usage(&self) -> BufferUsage {
        self.usage
    }

    fn map(&self) -> Result<NonNull<u8>, vk::Result> {
        let _guard = self.map_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ptr) = self.mapped_ptr() {
            return Ok(ptr);
        }
        profiling::scope!("vk::map_memory");
        let ptr = unsafe { self.device.map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }?.cast::<u8>();
        let ptr = NonNull::new(ptr).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        self.mapped.store(ptr.as_ptr(), Ordering::Release);
        Ok(ptr)
    }

    fn unmap(&self) {
        let _guard = self.map_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.mapped.swap(ptr::null_mut(), Ordering::AcqRel).is_null() {
            unsafe { self.device.unmap_memory(self.memory) };
        }
    }

    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.mapped.load(Ordering::Acquire))
    }
}

pub struct VulkanFence {
    pub inner: vk::Fence,
    device: ash::Device,
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.inner, None) };
    }
}

impl GpuFence for VulkanFence {
    fn signaled(&self) -> bool {
        unsafe { self.device.get_fence_status(self.inner) }.unwrap_or(false)
    }

    fn wait(&self, timeout: Duration) -> bool {
        let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[self.inner], true, timeout) } {
            Ok(()) => true,
            Err(vk::Result::TIMEOUT) => false,
            Err(err) => panic!("waiting for a vulkan fence should not fail: {err}"),
        }
    }
}
