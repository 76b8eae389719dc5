//! Pooled staging and constant memory.
//!
//! All pools hand out [`DualPage`]s: a block of pinned host memory paired with device memory
//! of the same size. The host writes into the host half and a stream copies it over to the
//! device half, or reads it directly.
//!
//! # Overview
//!
//! - [`ConstantBufferPool`]: per command buffer bump allocator for root constants and
//!   parameter blocks. Rewound as a whole when the command buffer is reset.
//! - [`DualPageAllocator`]: power-of-two size classes with one free list per class. Pages are
//!   returned explicitly or by dropping a [`PageHandle`].
//! - [`SubmitPageAllocator`]: power-of-two size classes whose pages are grouped by submission
//!   and only become reusable after the submission's completion event fired.
//!
//! Creating a page allocates the host half first. If the device half cannot be allocated,
//! the partially created page is destroyed before the error is returned.

mod constant_buffer;
mod page;

pub use constant_buffer::{
    ConstantBufferAllocation, ConstantBufferPool, DEFAULT_ALIGNMENT, DEFAULT_PAGE_SIZE,
};
pub use page::{DualPageAllocator, PageHandle, SubmitPage, SubmitPageAllocator};

use crate::{
    Device, HasDevice, Result,
    error::native_call,
    native::{DeviceAddress, HostAddress, NativeOp, StreamHandle},
};

/// Number of size classes. Class `n` holds pages of `1 << n` bytes.
pub const SIZE_CLASS_COUNT: u32 = 32;

const PAGE_ALIGNMENT: u64 = 256;

/// Pinned host memory paired with device memory of the same size.
pub struct DualPage {
    device: Device,
    host: HostAddress,
    device_address: DeviceAddress,
    size: u64,
    class: u32,
    used: u64,
}

impl DualPage {
    /// A page of the size class `class`.
    pub(crate) fn create(device: &Device, class: u32) -> Result<Self> {
        let mut page = Self::create_sized(device, 1 << class)?;
        page.class = class;
        Ok(page)
    }

    pub(crate) fn create_sized(device: &Device, size: u64) -> Result<Self> {
        let class = crate::utils::size_class(size);
        if class >= SIZE_CLASS_COUNT {
            return Err(crate::Error::OutOfMemory);
        }
        let host = native_call!(
            device,
            device.driver().allocate_host_memory(size, PAGE_ALIGNMENT)
        )?;
        let mut page = DualPage {
            device: device.clone(),
            host,
            device_address: DeviceAddress::NULL,
            size,
            class,
            used: 0,
        };
        // On failure `page` drops here and releases the host half.
        page.device_address = native_call!(
            device,
            device.driver().allocate_device_memory(size, PAGE_ALIGNMENT)
        )?;
        Ok(page)
    }

    pub fn host_address(&self) -> HostAddress {
        self.host
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.device_address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn size_class(&self) -> u32 {
        self.class
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub(crate) fn set_used(&mut self, used: u64) {
        self.used = used;
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_null() && self.device_address.is_null()
    }

    /// Writes into the host half.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.size {
            return Err(crate::Error::InvalidArgument("write exceeds the page"));
        }
        native_call!(
            self.device,
            self.device
                .driver()
                .write_host_memory(self.host.offset(offset), data)
        )
    }

    /// Enqueues a copy of the first `size` bytes from the host half to the device half.
    pub fn upload(&self, stream: StreamHandle, size: u64) -> Result<()> {
        native_call!(
            self.device,
            self.device.driver().enqueue(
                stream,
                NativeOp::UploadMemory {
                    dst: self.device_address,
                    src: self.host,
                    size,
                },
            )
        )
    }
}

impl HasDevice for DualPage {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for DualPage {
    fn drop(&mut self) {
        let driver = self.device.driver();
        if !self.host.is_null()
            && let Err(error) = driver.free_host_memory(self.host)
        {
            tracing::error!(?error, "failed to free the host half of a page");
        }
        if !self.device_address.is_null()
            && let Err(error) = driver.free_device_memory(self.device_address)
        {
            tracing::error!(?error, "failed to free the device half of a page");
        }
    }
}

impl std::fmt::Debug for DualPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualPage")
            .field("host", &self.host)
            .field("device", &self.device_address)
            .field("size", &self.size)
            .field("used", &self.used)
            .finish()
    }
}
