use ash::vk;
use core::time::Duration;

use crate::Bytes;

#[derive(thiserror::Error, Debug)]
pub enum GpuMemoryError {
    #[error("{identifier} ({used}/{capacity} used) cannot fit {required}")]
    OutOfMemory {
        identifier: String,
        used: Bytes,
        capacity: Bytes,
        required: Bytes,
    },
    #[error("waited over {timeout:?} for a fence in {identifier} (gpu hang, or the pool is far too small for the workload)")]
    Timeout { identifier: String, timeout: Duration },
    #[error("invalid configuration for {identifier}: {reason}")]
    Configuration { identifier: String, reason: String },
    #[error("tried to write {0} into an allocation that is not host mapped or is smaller than that")]
    NotWritable(Bytes),
    #[error("allocator state of {identifier} is inconsistent: {reason}")]
    Corrupted { identifier: String, reason: String },
    #[error("failed to create buffer for {1} (size: {2}, probably out of host or device memory)")]
    BufferCreation(#[source] vk::Result, String, Bytes),
    #[error("mapping buffer memory failed for {1}")]
    Map(#[source] vk::Result, String),
    #[error("waiting for the device to go idle failed")]
    WaitIdle(#[source] vk::Result),
    #[error("submitting the buffer copy for {1} failed")]
    Transfer(#[source] vk::Result, String),
}

impl GpuMemoryError {
    /// True for errors after which the device's state should be considered
    /// suspect. The usual response is to log the error and abort.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GpuMemoryError::Timeout { .. } | GpuMemoryError::WaitIdle(_) | GpuMemoryError::Transfer(..) | GpuMemoryError::Corrupted { .. }
        )
    }

    pub(crate) fn configuration(identifier: &str, reason: impl Into<String>) -> GpuMemoryError {
        GpuMemoryError::Configuration {
            identifier: identifier.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupted(identifier: &str, reason: impl Into<String>) -> GpuMemoryError {
        GpuMemoryError::Corrupted {
            identifier: identifier.to_string(),
            reason: reason.into(),
        }
    }
}
