use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{DualPage, SIZE_CLASS_COUNT};
use crate::{
    Device, Error, HasDevice, Result,
    error::native_call,
    native::{DeviceAddress, EventHandle, EventStatus, HostAddress, StreamHandle},
    utils::size_class,
};

fn free_lists() -> Vec<Vec<DualPage>> {
    (0..SIZE_CLASS_COUNT).map(|_| Vec::new()).collect()
}

fn class_for(size: u64) -> Result<u32> {
    let class = size_class(size);
    if class >= SIZE_CLASS_COUNT {
        return Err(Error::OutOfMemory);
    }
    Ok(class)
}

struct DualPageState {
    free: Vec<Vec<DualPage>>,
    total_allocated: u64,
}

struct DualPageAllocatorInner {
    device: Device,
    state: Mutex<DualPageState>,
}

/// Size-classed page allocator with explicit return.
#[derive(Clone)]
pub struct DualPageAllocator(Arc<DualPageAllocatorInner>);

impl DualPageAllocator {
    pub fn new(device: Device) -> Self {
        Self(Arc::new(DualPageAllocatorInner {
            device,
            state: Mutex::new(DualPageState {
                free: free_lists(),
                total_allocated: 0,
            }),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, DualPageState> {
        self.0
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes a page of at least `min_size` bytes from the free list of its class, or creates one.
    pub fn allocate(&self, min_size: u64) -> Result<DualPage> {
        if min_size == 0 {
            return Err(Error::InvalidArgument("page size must not be zero"));
        }
        let class = class_for(min_size)?;
        let mut state = self.lock();
        let page = match state.free[class as usize].pop() {
            Some(page) => page,
            None => DualPage::create(&self.0.device, class)?,
        };
        debug_assert!(page.size() >= min_size);
        state.total_allocated += page.size();
        Ok(page)
    }

    /// Like [`DualPageAllocator::allocate`], returning the page to this allocator on drop.
    pub fn allocate_handle(&self, min_size: u64) -> Result<PageHandle> {
        Ok(PageHandle {
            allocator: self.clone(),
            page: Some(self.allocate(min_size)?),
        })
    }

    pub fn free(&self, mut page: DualPage) -> Result<()> {
        if page.is_empty() {
            return Err(Error::InvalidArgument("cannot free an empty page"));
        }
        page.set_used(0);
        let mut state = self.lock();
        debug_assert!(state.total_allocated >= page.size());
        state.total_allocated -= page.size();
        let class = page.size_class() as usize;
        state.free[class].push(page);
        Ok(())
    }

    /// Destroys every free page.
    pub fn reset(&self) {
        for list in self.lock().free.iter_mut() {
            list.clear();
        }
    }

    /// Bytes currently handed out.
    pub fn total_allocated(&self) -> u64 {
        self.lock().total_allocated
    }

    pub fn free_page_count(&self, class: u32) -> usize {
        self.lock()
            .free
            .get(class as usize)
            .map_or(0, |list| list.len())
    }
}

impl HasDevice for DualPageAllocator {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl Drop for DualPageAllocatorInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.total_allocated != 0 {
            tracing::warn!(
                bytes = state.total_allocated,
                "page allocator dropped with pages still handed out"
            );
        }
    }
}

/// A page that goes back to its [`DualPageAllocator`] when dropped.
pub struct PageHandle {
    allocator: DualPageAllocator,
    page: Option<DualPage>,
}

impl PageHandle {
    pub fn page(&self) -> Option<&DualPage> {
        self.page.as_ref()
    }

    pub fn host_address(&self) -> HostAddress {
        self.page
            .as_ref()
            .map_or(HostAddress::NULL, |p| p.host_address())
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.page
            .as_ref()
            .map_or(DeviceAddress::NULL, |p| p.device_address())
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        match &self.page {
            Some(page) => page.write(offset, data),
            None => Err(Error::InvalidArgument("page handle is empty")),
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if let Some(page) = self.page.take()
            && let Err(error) = self.allocator.free(page)
        {
            tracing::error!(?error, "failed to return a page");
        }
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PageHandle").field(&self.page).finish()
    }
}

/// Addresses of a page loaned by a [`SubmitPageAllocator`] for the current submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmitPage {
    pub host: HostAddress,
    pub device: DeviceAddress,
    pub size: u64,
}

impl SubmitPage {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

struct PageGroup {
    event: EventHandle,
    pages: Vec<DualPage>,
}

struct SubmitState {
    free: Vec<Vec<DualPage>>,
    current: Option<PageGroup>,
    active: VecDeque<PageGroup>,
}

/// Pages grouped by submission, reusable once the submission's event fired.
pub struct SubmitPageAllocator {
    device: Device,
    state: Mutex<SubmitState>,
}

impl SubmitPageAllocator {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            state: Mutex::new(SubmitState {
                free: free_lists(),
                current: None,
                active: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubmitState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens the generation of a new submission.
    pub fn begin_submit(&self) -> Result<()> {
        let mut state = self.lock();
        if state.current.is_some() {
            return Err(Error::fail("begin_submit called twice"));
        }
        self.update_locked(&mut state)?;
        let event = native_call!(self.device, self.device.driver().create_event())?;
        state.current = Some(PageGroup {
            event,
            pages: Vec::new(),
        });
        Ok(())
    }

    /// Loans a page of at least `size` bytes to the current submission.
    pub fn allocate(&self, size: u64) -> Result<SubmitPage> {
        if size == 0 {
            return Ok(SubmitPage::default());
        }
        let class = class_for(size)?;
        let mut state = self.lock();
        let state = &mut *state;
        let Some(group) = state.current.as_mut() else {
            return Err(Error::fail("allocate called outside of a submission"));
        };
        let page = match state.free[class as usize].pop() {
            Some(page) => page,
            None => DualPage::create(&self.device, class)?,
        };
        let loan = SubmitPage {
            host: page.host_address(),
            device: page.device_address(),
            size: page.size(),
        };
        group.pages.push(page);
        Ok(loan)
    }

    /// Closes the current generation; its pages return once `stream` reaches this point.
    pub fn end_submit(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.lock();
        let Some(group) = state.current.take() else {
            return Err(Error::fail("end_submit called without begin_submit"));
        };
        let driver = self.device.driver();
        if let Err(error) = native_call!(self.device, driver.record_event(group.event, stream)) {
            // Without an event the generation is retired by waiting on the stream. Pages are
            // only recycled when that wait succeeded and are released otherwise.
            if let Err(error) = driver.destroy_event(group.event) {
                tracing::error!(?error, "failed to destroy a page group event");
            }
            match driver.synchronize_stream(stream) {
                Ok(()) => {
                    for mut page in group.pages {
                        page.set_used(0);
                        state.free[page.size_class() as usize].push(page);
                    }
                }
                Err(sync_error) => {
                    tracing::error!(
                        error = ?sync_error,
                        pages = group.pages.len(),
                        "releasing the pages of a submission that could not be fenced"
                    );
                }
            }
            return Err(error);
        }
        state.active.push_back(group);
        Ok(())
    }

    /// Returns the pages of every completed generation to the free lists.
    pub fn update(&self) -> Result<()> {
        let mut state = self.lock();
        self.update_locked(&mut state)
    }

    fn update_locked(&self, state: &mut SubmitState) -> Result<()> {
        let driver = self.device.driver();
        let mut index = 0;
        while index < state.active.len() {
            let event = state.active[index].event;
            match native_call!(self.device, driver.query_event(event))? {
                EventStatus::Ready => {
                    if let Some(group) = state.active.remove(index) {
                        for mut page in group.pages {
                            page.set_used(0);
                            let class = page.size_class() as usize;
                            state.free[class].push(page);
                        }
                        native_call!(self.device, driver.destroy_event(group.event))?;
                    }
                }
                EventStatus::NotReady => index += 1,
            }
        }
        Ok(())
    }

    pub fn outstanding_generations(&self) -> usize {
        self.lock().active.len()
    }

    pub fn free_page_count(&self, class: u32) -> usize {
        self.lock()
            .free
            .get(class as usize)
            .map_or(0, |list| list.len())
    }
}

impl Drop for SubmitPageAllocator {
    fn drop(&mut self) {
        let driver = self.device.driver();
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for group in state.active.drain(..) {
            if let Err(error) = driver.synchronize_event(group.event) {
                tracing::error!(?error, "failed to wait for an outstanding page group");
            }
            if let Err(error) = driver.destroy_event(group.event) {
                tracing::error!(?error, "failed to destroy a page group event");
            }
        }
        if let Some(group) = state.current.take() {
            tracing::warn!("submit page allocator dropped during a submission");
            if let Err(error) = driver.destroy_event(group.event) {
                tracing::error!(?error, "failed to destroy a page group event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Backend,
        native::{Driver, HostDriver},
    };

    fn device(driver: Arc<HostDriver>) -> Device {
        Device::builder(Backend::Cuda)
            .driver(driver)
            .build()
            .unwrap()
    }

    #[test]
    fn dual_pages_are_size_classed() {
        let driver = Arc::new(HostDriver::new());
        let allocator = DualPageAllocator::new(device(driver.clone()));
        assert_eq!(
            allocator.allocate(0).unwrap_err(),
            Error::InvalidArgument("page size must not be zero")
        );
        assert_eq!(allocator.allocate(1 << 32).unwrap_err(), Error::OutOfMemory);
        assert_eq!(allocator.allocate(u64::MAX).unwrap_err(), Error::OutOfMemory);
        assert_eq!(
            allocator.allocate((1 << 63) + 1).unwrap_err(),
            Error::OutOfMemory
        );

        let page = allocator.allocate(100).unwrap();
        assert_eq!(page.size(), 128);
        assert_eq!(page.size_class(), 7);
        assert_eq!(allocator.total_allocated(), 128);
        let host = page.host_address();
        allocator.free(page).unwrap();
        assert_eq!(allocator.total_allocated(), 0);
        assert_eq!(allocator.free_page_count(7), 1);

        let again = allocator.allocate(65).unwrap();
        assert_eq!(again.host_address(), host);
        allocator.free(again).unwrap();

        let live = driver.live_allocations();
        allocator.reset();
        assert_eq!(allocator.free_page_count(7), 0);
        assert_eq!(driver.live_allocations(), live - 2);
    }

    #[test]
    fn page_handles_return_on_drop() {
        let driver = Arc::new(HostDriver::new());
        let allocator = DualPageAllocator::new(device(driver));
        let handle = allocator.allocate_handle(4096).unwrap();
        handle.write(0, &[1, 2, 3]).unwrap();
        assert_eq!(allocator.total_allocated(), 4096);
        drop(handle);
        assert_eq!(allocator.total_allocated(), 0);
        assert_eq!(allocator.free_page_count(12), 1);
    }

    #[test]
    fn failed_page_creation_does_not_leak() {
        let driver = Arc::new(HostDriver::new());
        let allocator = DualPageAllocator::new(device(driver.clone()));
        let live = driver.live_allocations();
        driver.fail_device_allocations(1);
        assert_eq!(allocator.allocate(64).unwrap_err(), Error::OutOfMemory);
        assert_eq!(driver.live_allocations(), live);
        assert_eq!(allocator.total_allocated(), 0);
    }

    #[test]
    fn submit_pages_follow_the_submission_protocol() {
        let driver = Arc::new(HostDriver::manual());
        let device = device(driver.clone());
        let stream = driver.create_stream().unwrap();
        let allocator = SubmitPageAllocator::new(device);

        assert!(allocator.allocate(16).is_err());
        assert!(allocator.end_submit(stream).is_err());
        assert!(allocator.allocate(0).unwrap().is_empty());

        allocator.begin_submit().unwrap();
        assert!(allocator.begin_submit().is_err());
        let first = allocator.allocate(1000).unwrap();
        assert_eq!(first.size, 1024);
        allocator.end_submit(stream).unwrap();

        // The first generation has not completed: its page must not be handed out again.
        allocator.begin_submit().unwrap();
        let second = allocator.allocate(1000).unwrap();
        assert_ne!(second.host, first.host);
        allocator.end_submit(stream).unwrap();
        assert_eq!(allocator.outstanding_generations(), 2);

        driver.advance_all();
        allocator.update().unwrap();
        assert_eq!(allocator.outstanding_generations(), 0);
        assert_eq!(allocator.free_page_count(10), 2);

        allocator.begin_submit().unwrap();
        let third = allocator.allocate(512).unwrap();
        assert_eq!(third.size, 512);
        let reused = allocator.allocate(1024).unwrap();
        assert!(reused.host == first.host || reused.host == second.host);
        allocator.end_submit(stream).unwrap();
    }

    #[test]
    fn oversized_submit_pages_are_out_of_memory() {
        let driver = Arc::new(HostDriver::new());
        let device = device(driver.clone());
        let stream = driver.create_stream().unwrap();
        let allocator = SubmitPageAllocator::new(device);
        let live = driver.live_allocations();

        allocator.begin_submit().unwrap();
        assert_eq!(allocator.allocate(u64::MAX).unwrap_err(), Error::OutOfMemory);
        assert_eq!(driver.live_allocations(), live);
        assert_eq!(allocator.allocate(64).unwrap().size, 64);
        allocator.end_submit(stream).unwrap();
    }

    #[test]
    fn unfenced_submissions_do_not_wedge_the_allocator() {
        let driver = Arc::new(HostDriver::manual());
        let device = device(driver.clone());
        let stream = driver.create_stream().unwrap();
        let allocator = SubmitPageAllocator::new(device);
        let events = driver.live_events();

        allocator.begin_submit().unwrap();
        let lost = allocator.allocate(256).unwrap();
        assert!(matches!(
            allocator.end_submit(StreamHandle(999)),
            Err(Error::Fail { .. })
        ));
        assert_eq!(allocator.outstanding_generations(), 0);
        assert_eq!(driver.live_events(), events);

        allocator.begin_submit().unwrap();
        let next = allocator.allocate(256).unwrap();
        assert_ne!(next.host, lost.host);
        allocator.end_submit(stream).unwrap();
        assert_eq!(allocator.outstanding_generations(), 1);
    }
}
