//! Host and device synchronization.
//!
//! A [`Fence`] is a monotonically increasing `u64` counter shared by the host and the device
//! timelines. The host can raise it directly with [`Fence::set_current_value`]; the device
//! raises it when work recorded before a [`Fence::signal_from_stream`] completes.
//!
//! # Pending events
//!
//! Every device-side signal is backed by a native event recorded on the stream. The fence
//! keeps those events in a list sorted by the value they promise. Polling walks the list from
//! the front: a completed event raises the current value and is destroyed, and the walk stops
//! at the first event that is still pending, since everything recorded after it on the same
//! stream is pending too.
//!
//! ```
//! # use scoria::{Backend, Device, sync::FenceDesc};
//! # let (device, _queue) = Device::create_host_default(Backend::Cuda).unwrap();
//! let fence = device.create_fence(FenceDesc { initial_value: 5, ..Default::default() }).unwrap();
//! assert_eq!(fence.get_current_value().unwrap(), 5);
//! assert!(fence.set_current_value(3).is_err());
//! fence.set_current_value(10).unwrap();
//! assert_eq!(fence.get_current_value().unwrap(), 10);
//! ```

use std::{
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    Device, Error, HasDevice, Result,
    error::native_call,
    native::{EventHandle, EventStatus, StreamHandle},
    utils::ResourceId,
};

/// Passed to [`Device::wait_for_fences`] to wait without a deadline.
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FenceDesc {
    pub initial_value: u64,
    pub label: Option<String>,
}

struct PendingEvent {
    event: EventHandle,
    value: u64,
    /// Whether the event has been recorded on a stream.
    in_stream: bool,
}

struct FenceState {
    last_signalled: u64,
    current: u64,
    pending: Vec<PendingEvent>,
}

impl FenceState {
    fn is_consistent(&self) -> bool {
        let sorted = self.pending.windows(2).all(|w| w[0].value < w[1].value);
        let above_current = self.pending.iter().all(|p| p.value > self.current);
        let first_unrecorded = self
            .pending
            .iter()
            .position(|p| !p.in_stream)
            .unwrap_or(self.pending.len());
        let recorded_prefix = self.pending[first_unrecorded..].iter().all(|p| !p.in_stream);
        let recorded_signalled = self
            .pending
            .iter()
            .filter(|p| p.in_stream)
            .all(|p| p.value <= self.last_signalled);
        self.current <= self.last_signalled
            && sorted
            && above_current
            && recorded_prefix
            && recorded_signalled
    }
}

struct FenceInner {
    device: Device,
    id: ResourceId,
    desc: FenceDesc,
    state: Mutex<FenceState>,
}

#[derive(Clone)]
pub struct Fence(Arc<FenceInner>);

impl HasDevice for Fence {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl PartialEq for Fence {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Fence {}

impl Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.0.lock();
        f.debug_struct("Fence")
            .field("id", &self.0.id)
            .field("label", &self.0.desc.label)
            .field("current", &state.current)
            .field("last_signalled", &state.last_signalled)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Fence {
    pub(crate) fn new(device: Device, desc: FenceDesc) -> Self {
        let state = FenceState {
            last_signalled: desc.initial_value,
            current: desc.initial_value,
            pending: Vec::new(),
        };
        Self(Arc::new(FenceInner {
            device,
            id: ResourceId::next(),
            desc,
            state: Mutex::new(state),
        }))
    }

    pub fn id(&self) -> ResourceId {
        self.0.id
    }

    pub fn desc(&self) -> &FenceDesc {
        &self.0.desc
    }

    /// Polls pending events and returns the highest value known to be reached.
    pub fn get_current_value(&self) -> Result<u64> {
        let mut state = self.0.lock();
        self.0.flush(&mut state)?;
        Ok(state.current)
    }

    /// Raises the fence from the host.
    ///
    /// Fails with [`Error::InvalidArgument`] unless `value` is above every value signalled so
    /// far. Pending events promising a value at or below `value` are dropped.
    pub fn set_current_value(&self, value: u64) -> Result<()> {
        let mut state = self.0.lock();
        if value <= state.last_signalled {
            return Err(Error::InvalidArgument(
                "fence value must be above the last signalled value",
            ));
        }
        self.0.flush(&mut state)?;
        state.current = value;
        state.last_signalled = value;
        self.0.destroy_stale(&mut state)?;
        debug_assert!(state.is_consistent());
        Ok(())
    }

    /// Makes the fence reach `value` once the work enqueued on `stream` so far completes.
    pub fn signal_from_stream(&self, value: u64, stream: StreamHandle) -> Result<()> {
        let mut state = self.0.lock();
        if value <= state.last_signalled {
            return Err(Error::InvalidArgument(
                "fence value must be above the last signalled value",
            ));
        }
        self.0.flush(&mut state)?;

        let device = &self.0.device;
        let driver = device.driver();
        let position = state.pending.iter().position(|p| p.value >= value);
        match position {
            Some(index) if state.pending[index].value == value => {
                let event = state.pending[index].event;
                native_call!(device, driver.record_event(event, stream))?;
                state.pending[index].in_stream = true;
            }
            position => {
                let event = native_call!(device, driver.create_event())?;
                if let Err(error) = native_call!(device, driver.record_event(event, stream)) {
                    if let Err(error) = driver.destroy_event(event) {
                        tracing::error!(?error, "failed to destroy fence event");
                    }
                    return Err(error);
                }
                let pending = PendingEvent {
                    event,
                    value,
                    in_stream: true,
                };
                match position {
                    Some(index) => state.pending.insert(index, pending),
                    None => state.pending.push(pending),
                }
            }
        }
        state.last_signalled = value;
        debug_assert!(state.is_consistent());
        Ok(())
    }

    /// Makes future work on `stream` wait until the fence reaches `value`.
    ///
    /// Values the host already knows are reached need no wait. Otherwise the value must
    /// have been signalled from a stream; waiting on a value nobody promised fails with
    /// [`Error::NotAvailable`].
    pub fn wait_on_stream(&self, value: u64, stream: StreamHandle) -> Result<()> {
        let mut state = self.0.lock();
        self.0.flush(&mut state)?;
        if value <= state.current {
            return Ok(());
        }
        let Some(pending) = state.pending.iter().find(|p| p.value == value) else {
            return Err(Error::NotAvailable("no pending signal for this fence value"));
        };
        let device = &self.0.device;
        native_call!(
            device,
            device.driver().stream_wait_event(stream, pending.event)
        )?;
        Ok(())
    }

    /// Polls pending events without returning the value.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.0.lock();
        self.0.flush(&mut state)
    }

    pub fn last_signalled_value(&self) -> u64 {
        self.0.lock().last_signalled
    }

    /// Number of device signals that have not been observed yet.
    pub fn pending_count(&self) -> usize {
        self.0.lock().pending.len()
    }
}

impl FenceInner {
    fn lock(&self) -> MutexGuard<'_, FenceState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flush(&self, state: &mut FenceState) -> Result<()> {
        let driver = self.device.driver();
        let before = state.current;
        while let Some(pending) = state.pending.first() {
            match native_call!(self.device, driver.query_event(pending.event))? {
                EventStatus::Ready => {
                    state.current = state.current.max(pending.value);
                    let pending = state.pending.remove(0);
                    native_call!(self.device, driver.destroy_event(pending.event))?;
                }
                EventStatus::NotReady => break,
            }
        }
        if state.current != before {
            self.destroy_stale(state)?;
        }
        debug_assert!(state.is_consistent());
        Ok(())
    }

    fn destroy_stale(&self, state: &mut FenceState) -> Result<()> {
        let current = state.current;
        let stale = state.pending.iter().take_while(|p| p.value <= current).count();
        let mut result = Ok(());
        for pending in state.pending.drain(..stale) {
            let destroyed = native_call!(
                self.device,
                self.device.driver().destroy_event(pending.event)
            );
            if let Err(error) = destroyed {
                tracing::error!(?error, "failed to destroy fence event");
                result = result.and(Err(error));
            }
        }
        result
    }
}

impl Drop for FenceInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.pending.is_empty() {
            tracing::warn!(
                fence = ?self.id,
                count = state.pending.len(),
                "fence dropped with pending signals"
            );
        }
        for pending in state.pending.drain(..) {
            if let Err(error) = self.device.driver().destroy_event(pending.event) {
                tracing::error!(?error, "failed to destroy fence event");
            }
        }
    }
}

/// Busy-polls `fences` until all (or, without `wait_for_all`, any) of them reached their
/// value. A zero timeout polls once.
pub(crate) fn wait_for_fences(
    fences: &[(&Fence, u64)],
    wait_for_all: bool,
    timeout_ns: u64,
) -> Result<()> {
    if fences.is_empty() {
        return Ok(());
    }
    let deadline = if timeout_ns == TIMEOUT_INFINITE {
        None
    } else {
        Instant::now().checked_add(Duration::from_nanos(timeout_ns))
    };
    let mut reached = vec![false; fences.len()];
    loop {
        for ((fence, value), reached) in fences.iter().zip(reached.iter_mut()) {
            if !*reached && fence.get_current_value()? >= *value {
                *reached = true;
            }
        }
        let count = reached.iter().filter(|reached| **reached).count();
        if count == fences.len() || (!wait_for_all && count > 0) {
            return Ok(());
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Error::TimeOut);
        }
        std::thread::yield_now();
    }
}
