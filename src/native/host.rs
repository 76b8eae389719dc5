//! A [`Driver`] that runs on the host.
//!
//! Device and pinned host memory live in one emulated address space. Streams are FIFO queues
//! of operations that are either processed as soon as they can make progress
//! ([`HostDriver::new`]) or held until the caller advances them ([`HostDriver::manual`]), which
//! lets tests observe work that is recorded but not yet complete.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use super::{
    DeviceAddress, Driver, EventHandle, EventStatus, HostAddress, NativeError, NativeOp,
    StreamHandle,
};
use crate::utils::IdAlloc;

const ADDRESS_BASE: u64 = 0x1_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryKind {
    Device,
    Host,
}

struct Allocation {
    kind: MemoryKind,
    bytes: Vec<u8>,
}

enum StreamItem {
    Op(NativeOp),
    Record { event: u64, generation: u64 },
    Wait { event: u64, generation: u64 },
}

#[derive(Default)]
struct HostStream {
    pending: VecDeque<StreamItem>,
}

#[derive(Default)]
struct HostEvent {
    recorded: u64,
    completed: u64,
}

/// One operation as it was enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedOp {
    pub stream: StreamHandle,
    pub op: NativeOp,
}

#[derive(Default)]
struct HostState {
    memory: BTreeMap<u64, Allocation>,
    next_address: u64,
    stream_ids: IdAlloc,
    streams: BTreeMap<u64, HostStream>,
    event_ids: IdAlloc,
    events: BTreeMap<u64, HostEvent>,
    log: Vec<LoggedOp>,
    ticks: u64,
    fail_device_allocations: u32,
    fail_host_allocations: u32,
}

pub struct HostDriver {
    manual: bool,
    state: Mutex<HostState>,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver {
    /// Work completes as soon as it is enqueued and its waits are satisfied.
    pub fn new() -> Self {
        Self {
            manual: false,
            state: Mutex::new(HostState {
                next_address: ADDRESS_BASE,
                ..Default::default()
            }),
        }
    }

    /// Work stays pending until [`HostDriver::advance`] or [`HostDriver::advance_all`].
    /// Synchronizing a stream or an event still drives the work it depends on.
    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Completes up to `count` items of `stream`. Returns the number of items completed.
    pub fn advance(&self, stream: StreamHandle, count: usize) -> usize {
        let mut state = self.lock();
        let mut done = 0;
        while done < count && state.step(stream.0) {
            done += 1;
        }
        done
    }

    /// Completes everything that can complete.
    pub fn advance_all(&self) {
        self.lock().drain();
    }

    /// Every operation enqueued so far, in enqueue order.
    pub fn ops(&self) -> Vec<LoggedOp> {
        self.lock().log.clone()
    }

    pub fn ops_on(&self, stream: StreamHandle) -> Vec<NativeOp> {
        self.lock()
            .log
            .iter()
            .filter(|entry| entry.stream == stream)
            .map(|entry| entry.op.clone())
            .collect()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    pub fn pending_on(&self, stream: StreamHandle) -> usize {
        self.lock()
            .streams
            .get(&stream.0)
            .map_or(0, |s| s.pending.len())
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().memory.len()
    }

    pub fn live_events(&self) -> usize {
        self.lock().events.len()
    }

    /// Reads host memory back.
    pub fn read_host_memory(&self, src: HostAddress, dst: &mut [u8]) -> Result<(), NativeError> {
        let state = self.lock();
        let bytes = state.slice(src.0, dst.len() as u64, MemoryKind::Host)?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    /// The next `count` device allocations fail with [`NativeError::OutOfMemory`].
    pub fn fail_device_allocations(&self, count: u32) {
        self.lock().fail_device_allocations = count;
    }

    /// The next `count` host allocations fail with [`NativeError::OutOfMemory`].
    pub fn fail_host_allocations(&self, count: u32) {
        self.lock().fail_host_allocations = count;
    }

    fn settle(&self, state: &mut HostState) {
        if !self.manual {
            state.drain();
        }
    }
}

impl HostState {
    fn allocate(&mut self, kind: MemoryKind, size: u64, alignment: u64) -> Result<u64, NativeError> {
        let failures = match kind {
            MemoryKind::Device => &mut self.fail_device_allocations,
            MemoryKind::Host => &mut self.fail_host_allocations,
        };
        if *failures > 0 {
            *failures -= 1;
            return Err(NativeError::OutOfMemory);
        }
        if size == 0 {
            return Err(NativeError::InvalidValue);
        }
        let alignment = alignment.max(16);
        if !alignment.is_power_of_two() {
            return Err(NativeError::InvalidValue);
        }
        let address = self
            .next_address
            .checked_next_multiple_of(alignment)
            .ok_or(NativeError::OutOfMemory)?;
        let end = address
            .checked_add(size)
            .ok_or(NativeError::OutOfMemory)?;
        let len = usize::try_from(size).map_err(|_| NativeError::OutOfMemory)?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| NativeError::OutOfMemory)?;
        bytes.resize(len, 0);
        self.next_address = end;
        self.memory.insert(address, Allocation { kind, bytes });
        Ok(address)
    }

    fn free(&mut self, kind: MemoryKind, address: u64) -> Result<(), NativeError> {
        match self.memory.get(&address) {
            Some(allocation) if allocation.kind == kind => {
                self.memory.remove(&address);
                Ok(())
            }
            _ => Err(NativeError::InvalidValue),
        }
    }

    fn locate(&self, address: u64, size: u64, kind: MemoryKind) -> Result<(u64, usize), NativeError> {
        let (base, allocation) = self
            .memory
            .range(..=address)
            .next_back()
            .ok_or(NativeError::InvalidValue)?;
        let offset = address - base;
        if allocation.kind != kind || offset + size > allocation.bytes.len() as u64 {
            return Err(NativeError::InvalidValue);
        }
        Ok((*base, offset as usize))
    }

    fn slice(&self, address: u64, size: u64, kind: MemoryKind) -> Result<&[u8], NativeError> {
        let (base, offset) = self.locate(address, size, kind)?;
        Ok(&self.memory[&base].bytes[offset..offset + size as usize])
    }

    fn slice_mut(
        &mut self,
        address: u64,
        size: u64,
        kind: MemoryKind,
    ) -> Result<&mut [u8], NativeError> {
        let (base, offset) = self.locate(address, size, kind)?;
        let allocation = self.memory.get_mut(&base).ok_or(NativeError::InvalidValue)?;
        Ok(&mut allocation.bytes[offset..offset + size as usize])
    }

    fn validate(&self, op: &NativeOp) -> Result<(), NativeError> {
        match op {
            NativeOp::CopyMemory { dst, src, size } => {
                self.locate(dst.0, *size, MemoryKind::Device)?;
                self.locate(src.0, *size, MemoryKind::Device)?;
            }
            NativeOp::UploadMemory { dst, src, size } => {
                self.locate(dst.0, *size, MemoryKind::Device)?;
                self.locate(src.0, *size, MemoryKind::Host)?;
            }
            NativeOp::FillMemory { dst, size, .. } => {
                self.locate(dst.0, *size, MemoryKind::Device)?;
            }
            NativeOp::WriteTimestamp { dst } => {
                self.locate(dst.0, 8, MemoryKind::Device)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn execute(&mut self, op: &NativeOp) -> Result<(), NativeError> {
        match op {
            NativeOp::CopyMemory { dst, src, size } => {
                let data = self.slice(src.0, *size, MemoryKind::Device)?.to_vec();
                self.slice_mut(dst.0, *size, MemoryKind::Device)?
                    .copy_from_slice(&data);
            }
            NativeOp::UploadMemory { dst, src, size } => {
                let data = self.slice(src.0, *size, MemoryKind::Host)?.to_vec();
                self.slice_mut(dst.0, *size, MemoryKind::Device)?
                    .copy_from_slice(&data);
            }
            NativeOp::FillMemory { dst, size, value } => {
                let pattern = value.to_le_bytes();
                let bytes = self.slice_mut(dst.0, *size, MemoryKind::Device)?;
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = pattern[i % 4];
                }
            }
            NativeOp::WriteTimestamp { dst } => {
                self.ticks += 1;
                let ticks = self.ticks.to_le_bytes();
                self.slice_mut(dst.0, 8, MemoryKind::Device)?
                    .copy_from_slice(&ticks);
            }
            _ => {}
        }
        Ok(())
    }

    /// Completes the front item of one stream if it can make progress.
    fn step(&mut self, stream: u64) -> bool {
        let Some(front) = self.streams.get(&stream).and_then(|s| s.pending.front()) else {
            return false;
        };
        match front {
            StreamItem::Wait { event, generation } => {
                let satisfied = self
                    .events
                    .get(event)
                    .is_none_or(|e| e.completed >= *generation);
                if !satisfied {
                    return false;
                }
            }
            StreamItem::Record { event, generation } => {
                let (event, generation) = (*event, *generation);
                if let Some(e) = self.events.get_mut(&event) {
                    e.completed = e.completed.max(generation);
                }
            }
            StreamItem::Op(op) => {
                let op = op.clone();
                if let Err(error) = self.execute(&op) {
                    tracing::error!(?error, ?op, "host driver failed to execute operation");
                }
            }
        }
        if let Some(s) = self.streams.get_mut(&stream) {
            s.pending.pop_front();
        }
        true
    }

    fn drain(&mut self) {
        loop {
            let streams: Vec<u64> = self.streams.keys().copied().collect();
            let mut progressed = false;
            for stream in streams {
                while self.step(stream) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn stream_mut(&mut self, stream: StreamHandle) -> Result<&mut HostStream, NativeError> {
        self.streams
            .get_mut(&stream.0)
            .ok_or(NativeError::InvalidHandle)
    }
}

impl Driver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn allocate_device_memory(
        &self,
        size: u64,
        alignment: u64,
    ) -> Result<DeviceAddress, NativeError> {
        self.lock()
            .allocate(MemoryKind::Device, size, alignment)
            .map(DeviceAddress)
    }

    fn free_device_memory(&self, address: DeviceAddress) -> Result<(), NativeError> {
        self.lock().free(MemoryKind::Device, address.0)
    }

    fn allocate_host_memory(&self, size: u64, alignment: u64) -> Result<HostAddress, NativeError> {
        self.lock()
            .allocate(MemoryKind::Host, size, alignment)
            .map(HostAddress)
    }

    fn free_host_memory(&self, address: HostAddress) -> Result<(), NativeError> {
        self.lock().free(MemoryKind::Host, address.0)
    }

    fn write_host_memory(&self, dst: HostAddress, data: &[u8]) -> Result<(), NativeError> {
        let mut state = self.lock();
        state
            .slice_mut(dst.0, data.len() as u64, MemoryKind::Host)?
            .copy_from_slice(data);
        Ok(())
    }

    fn read_device_memory(&self, src: DeviceAddress, dst: &mut [u8]) -> Result<(), NativeError> {
        let state = self.lock();
        dst.copy_from_slice(state.slice(src.0, dst.len() as u64, MemoryKind::Device)?);
        Ok(())
    }

    fn create_stream(&self) -> Result<StreamHandle, NativeError> {
        let mut state = self.lock();
        let id = state.stream_ids.alloc_one() as u64;
        state.streams.insert(id, HostStream::default());
        Ok(StreamHandle(id))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<(), NativeError> {
        let mut state = self.lock();
        // Outstanding work still completes.
        while state.step(stream.0) {}
        state
            .streams
            .remove(&stream.0)
            .ok_or(NativeError::InvalidHandle)?;
        state.stream_ids.free(stream.0 as u32, 1);
        Ok(())
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> Result<(), NativeError> {
        let mut state = self.lock();
        state.stream_mut(stream)?;
        state.drain();
        if state.stream_mut(stream)?.pending.is_empty() {
            Ok(())
        } else {
            Err(NativeError::WouldBlock)
        }
    }

    fn create_event(&self) -> Result<EventHandle, NativeError> {
        let mut state = self.lock();
        let id = state.event_ids.alloc_one() as u64;
        state.events.insert(id, HostEvent::default());
        Ok(EventHandle(id))
    }

    fn destroy_event(&self, event: EventHandle) -> Result<(), NativeError> {
        let mut state = self.lock();
        state
            .events
            .remove(&event.0)
            .ok_or(NativeError::InvalidHandle)?;
        state.event_ids.free(event.0 as u32, 1);
        Ok(())
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> Result<(), NativeError> {
        let mut state = self.lock();
        state.stream_mut(stream)?;
        let e = state
            .events
            .get_mut(&event.0)
            .ok_or(NativeError::InvalidHandle)?;
        e.recorded += 1;
        let generation = e.recorded;
        state.stream_mut(stream)?.pending.push_back(StreamItem::Record {
            event: event.0,
            generation,
        });
        self.settle(&mut state);
        Ok(())
    }

    fn query_event(&self, event: EventHandle) -> Result<EventStatus, NativeError> {
        let state = self.lock();
        let e = state.events.get(&event.0).ok_or(NativeError::InvalidHandle)?;
        Ok(if e.completed >= e.recorded {
            EventStatus::Ready
        } else {
            EventStatus::NotReady
        })
    }

    fn synchronize_event(&self, event: EventHandle) -> Result<(), NativeError> {
        let mut state = self.lock();
        if !state.events.contains_key(&event.0) {
            return Err(NativeError::InvalidHandle);
        }
        state.drain();
        let e = &state.events[&event.0];
        if e.completed >= e.recorded {
            Ok(())
        } else {
            Err(NativeError::WouldBlock)
        }
    }

    fn stream_wait_event(
        &self,
        stream: StreamHandle,
        event: EventHandle,
    ) -> Result<(), NativeError> {
        let mut state = self.lock();
        let e = state.events.get(&event.0).ok_or(NativeError::InvalidHandle)?;
        let generation = e.recorded;
        let satisfied = e.completed >= generation;
        let s = state.stream_mut(stream)?;
        if !satisfied {
            s.pending.push_back(StreamItem::Wait {
                event: event.0,
                generation,
            });
        }
        self.settle(&mut state);
        Ok(())
    }

    fn enqueue(&self, stream: StreamHandle, op: NativeOp) -> Result<(), NativeError> {
        let mut state = self.lock();
        state.stream_mut(stream)?;
        state.validate(&op)?;
        state.log.push(LoggedOp {
            stream,
            op: op.clone(),
        });
        state.stream_mut(stream)?.pending.push_back(StreamItem::Op(op));
        self.settle(&mut state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_and_read_back() {
        let driver = HostDriver::new();
        let stream = driver.create_stream().unwrap();
        let host = driver.allocate_host_memory(16, 16).unwrap();
        let device = driver.allocate_device_memory(16, 16).unwrap();
        driver.write_host_memory(host, &[7; 16]).unwrap();
        driver
            .enqueue(
                stream,
                NativeOp::UploadMemory {
                    dst: device,
                    src: host,
                    size: 16,
                },
            )
            .unwrap();
        let mut out = [0u8; 16];
        driver.read_device_memory(device, &mut out).unwrap();
        assert_eq!(out, [7; 16]);
    }

    #[test]
    fn fill_repeats_the_pattern() {
        let driver = HostDriver::new();
        let stream = driver.create_stream().unwrap();
        let device = driver.allocate_device_memory(8, 16).unwrap();
        driver
            .enqueue(
                stream,
                NativeOp::FillMemory {
                    dst: device,
                    size: 8,
                    value: 0x0403_0201,
                },
            )
            .unwrap();
        let mut out = [0u8; 8];
        driver.read_device_memory(device, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn manual_mode_holds_work() {
        let driver = HostDriver::manual();
        let stream = driver.create_stream().unwrap();
        let event = driver.create_event().unwrap();
        assert_eq!(driver.query_event(event).unwrap(), EventStatus::Ready);
        driver.record_event(event, stream).unwrap();
        assert_eq!(driver.query_event(event).unwrap(), EventStatus::NotReady);
        assert_eq!(driver.pending_on(stream), 1);
        assert_eq!(driver.advance(stream, 1), 1);
        assert_eq!(driver.query_event(event).unwrap(), EventStatus::Ready);
    }

    #[test]
    fn stream_waits_for_events_recorded_elsewhere() {
        let driver = HostDriver::manual();
        let producer = driver.create_stream().unwrap();
        let consumer = driver.create_stream().unwrap();
        let event = driver.create_event().unwrap();
        let device = driver.allocate_device_memory(4, 16).unwrap();
        driver.record_event(event, producer).unwrap();
        driver.stream_wait_event(consumer, event).unwrap();
        driver
            .enqueue(
                consumer,
                NativeOp::FillMemory {
                    dst: device,
                    size: 4,
                    value: 9,
                },
            )
            .unwrap();
        assert_eq!(driver.advance(consumer, 2), 0);
        driver.advance(producer, 1);
        assert_eq!(driver.advance(consumer, 2), 2);
        let mut out = [0u8; 4];
        driver.read_device_memory(device, &mut out).unwrap();
        assert_eq!(out, [9, 0, 0, 0]);
    }

    #[test]
    fn invalid_addresses_are_rejected_at_enqueue() {
        let driver = HostDriver::new();
        let stream = driver.create_stream().unwrap();
        let device = driver.allocate_device_memory(4, 16).unwrap();
        let err = driver
            .enqueue(
                stream,
                NativeOp::FillMemory {
                    dst: device,
                    size: 64,
                    value: 0,
                },
            )
            .unwrap_err();
        assert_eq!(err, NativeError::InvalidValue);
        assert!(driver.ops().is_empty());
    }

    #[test]
    fn injected_allocation_failures() {
        let driver = HostDriver::new();
        driver.fail_device_allocations(1);
        assert_eq!(
            driver.allocate_device_memory(4, 16),
            Err(NativeError::OutOfMemory)
        );
        assert!(driver.allocate_device_memory(4, 16).is_ok());
        assert_eq!(driver.live_allocations(), 1);
    }
}
