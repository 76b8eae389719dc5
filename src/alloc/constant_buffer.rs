use super::DualPage;
use crate::{
    Device, Error, Result,
    native::{DeviceAddress, HostAddress, StreamHandle},
    utils::align_up,
};

pub const DEFAULT_PAGE_SIZE: u64 = 4 * 1024 * 1024;
pub const DEFAULT_ALIGNMENT: u64 = 256;

/// A range of a constant buffer page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConstantBufferAllocation {
    pub host: HostAddress,
    pub device: DeviceAddress,
    /// Offset inside the page. Always zero for large pages.
    pub offset: u64,
    pub size: u64,
}

impl ConstantBufferAllocation {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Bump allocator over fixed-size pages, owned by one command buffer.
///
/// Requests larger than a page get a dedicated page that is destroyed on
/// [`ConstantBufferPool::reset`]; they do not disturb the current page.
pub struct ConstantBufferPool {
    page_size: u64,
    alignment: u64,
    pages: Vec<DualPage>,
    large_pages: Vec<DualPage>,
    current: Option<usize>,
    offset: u64,
}

impl Default for ConstantBufferPool {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            alignment: DEFAULT_ALIGNMENT,
            pages: Vec::new(),
            large_pages: Vec::new(),
            current: None,
            offset: 0,
        }
    }
}

impl ConstantBufferPool {
    pub fn new(page_size: u64, alignment: u64) -> Result<Self> {
        if !alignment.is_power_of_two() || page_size == 0 || page_size % alignment != 0 {
            return Err(Error::InvalidArgument(
                "page size must be a non-zero multiple of a power-of-two alignment",
            ));
        }
        Ok(Self {
            page_size,
            alignment,
            ..Default::default()
        })
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn allocate(&mut self, device: &Device, size: u64) -> Result<ConstantBufferAllocation> {
        if size == 0 {
            return Ok(ConstantBufferAllocation::default());
        }
        if size > self.page_size {
            let mut page = DualPage::create_sized(device, size)?;
            page.set_used(size);
            let allocation = ConstantBufferAllocation {
                host: page.host_address(),
                device: page.device_address(),
                offset: 0,
                size,
            };
            self.large_pages.push(page);
            return Ok(allocation);
        }

        let index = match self.current {
            Some(index)
                if self
                    .offset
                    .checked_add(size)
                    .is_some_and(|end| end <= self.page_size) =>
            {
                index
            }
            current => {
                let next = current.map_or(0, |index| index + 1);
                if next >= self.pages.len() {
                    self.pages.push(DualPage::create_sized(device, self.page_size)?);
                }
                self.current = Some(next);
                self.offset = 0;
                next
            }
        };
        let page = &mut self.pages[index];
        let allocation = ConstantBufferAllocation {
            host: page.host_address().offset(self.offset),
            device: page.device_address().offset(self.offset),
            offset: self.offset,
            size,
        };
        self.offset = align_up(self.offset + size, self.alignment);
        page.set_used(self.offset);
        Ok(allocation)
    }

    /// Allocates and fills a range with `data`.
    pub fn push(&mut self, device: &Device, data: &[u8]) -> Result<ConstantBufferAllocation> {
        let allocation = self.allocate(device, data.len() as u64)?;
        if !allocation.is_empty() {
            crate::error::native_call!(
                device,
                device.driver().write_host_memory(allocation.host, data)
            )?;
        }
        Ok(allocation)
    }

    /// Enqueues host to device copies of the used part of every page.
    pub fn upload(&self, stream: StreamHandle) -> Result<()> {
        for page in self.pages.iter().chain(self.large_pages.iter()) {
            if page.used() > 0 {
                page.upload(stream, page.used())?;
            }
        }
        Ok(())
    }

    /// Rewinds to the first page and destroys large pages.
    pub fn reset(&mut self) {
        self.current = None;
        self.offset = 0;
        for page in &mut self.pages {
            page.set_used(0);
        }
        self.large_pages.clear();
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn large_page_count(&self) -> usize {
        self.large_pages.len()
    }
}
