//! Command submission.
//!
//! A [`Queue`] owns one native stream. Submitting command buffers executes their command lists
//! on that stream in submission order.
//!
//! # Command buffer lifetime
//!
//! Each submission is numbered. After the command buffers of a submission are executed the
//! queue signals an internal tracking fence with that number, and keeps the recordings until
//! the fence shows the submission finished. Finished recordings are reset and pooled, and
//! [`Queue::create_command_encoder`] hands them out again. A command buffer is owned by the
//! client while it is recorded and by the queue while it is in flight, never by both.
//!
//! ```
//! # use scoria::{Backend, Device, queue::SubmitDesc, buffer::{BufferDesc, BufferUsage}};
//! let (device, queue) = Device::create_host_default(Backend::Cuda).unwrap();
//! let buffer = device
//!     .create_buffer(&BufferDesc { size: 16, usage: BufferUsage::COPY_DESTINATION, ..Default::default() }, None)
//!     .unwrap();
//!
//! let mut encoder = queue.create_command_encoder().unwrap();
//! encoder.upload_buffer_data(&buffer, 0, &[7; 16]).unwrap();
//! queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
//! queue.wait_on_host().unwrap();
//!
//! assert_eq!(device.read_buffer(&buffer, 0, 16).unwrap(), vec![7; 16]);
//! ```

use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    Device, Error, HasDevice, Result,
    alloc::{DualPageAllocator, SubmitPageAllocator},
    command::{CommandBuffer, CommandBufferState, CommandEncoder, Recording},
    error::native_call,
    executor::execute_recording,
    native::StreamHandle,
    sync::{Fence, FenceDesc},
};

/// One call to [`Queue::submit`].
#[derive(Default)]
pub struct SubmitDesc<'a> {
    pub command_buffers: Vec<CommandBuffer>,
    /// The stream waits for each fence to reach its value before executing anything.
    pub wait_fences: Vec<(&'a Fence, u64)>,
    /// Each fence reaches its value once the submitted work completes.
    pub signal_fences: Vec<(&'a Fence, u64)>,
}

impl<'a> SubmitDesc<'a> {
    pub fn new(command_buffers: impl IntoIterator<Item = CommandBuffer>) -> Self {
        Self {
            command_buffers: command_buffers.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn wait(mut self, fence: &'a Fence, value: u64) -> Self {
        self.wait_fences.push((fence, value));
        self
    }

    pub fn signal(mut self, fence: &'a Fence, value: u64) -> Self {
        self.signal_fences.push((fence, value));
        self
    }
}

struct InFlight {
    submission_id: u64,
    recordings: Vec<Recording>,
}

struct QueueState {
    last_submitted_id: u64,
    last_finished_id: u64,
    free: Vec<Recording>,
    in_flight: VecDeque<InFlight>,
}

pub(crate) struct QueueShared {
    device: Device,
    stream: StreamHandle,
    tracking_fence: Fence,
    staging_pages: DualPageAllocator,
    submit_pages: SubmitPageAllocator,
    /// Held for the duration of a submission.
    submission: Mutex<()>,
    state: Mutex<QueueState>,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes back a recording that was never submitted.
    pub(crate) fn recycle(&self, mut recording: Recording) {
        recording.reset();
        self.lock().free.push(recording);
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        let driver = self.device.driver();
        if let Err(error) = driver.synchronize_stream(self.stream) {
            tracing::error!(?error, "failed to synchronize queue stream");
        }
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.in_flight.clear();
        state.free.clear();
        if let Err(error) = driver.destroy_stream(self.stream) {
            tracing::error!(?error, "failed to destroy queue stream");
        }
        tracing::info!(stream = ?self.stream, "queue destroyed");
    }
}

#[derive(Clone)]
pub struct Queue(Arc<QueueShared>);

impl HasDevice for Queue {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.0.lock();
        f.debug_struct("Queue")
            .field("stream", &self.0.stream)
            .field("last_submitted_id", &state.last_submitted_id)
            .field("last_finished_id", &state.last_finished_id)
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

impl Queue {
    pub(crate) fn new(device: Device) -> Result<Self> {
        let stream = native_call!(device, device.driver().create_stream())?;
        let tracking_fence = Fence::new(device.clone(), FenceDesc::default());
        tracing::info!(?stream, backend = ?device.backend(), "queue created");
        Ok(Self(Arc::new(QueueShared {
            staging_pages: DualPageAllocator::new(device.clone()),
            submit_pages: SubmitPageAllocator::new(device.clone()),
            device,
            stream,
            tracking_fence,
            submission: Mutex::new(()),
            state: Mutex::new(QueueState {
                last_submitted_id: 0,
                last_finished_id: 0,
                free: Vec::new(),
                in_flight: VecDeque::new(),
            }),
        })))
    }

    pub fn stream(&self) -> StreamHandle {
        self.0.stream
    }

    /// Starts recording into a pooled command buffer.
    pub fn create_command_encoder(&self) -> Result<CommandEncoder> {
        let pooled = self.0.lock().free.pop();
        let recording = match pooled {
            Some(recording) => recording,
            None => Recording::new(self.0.device.config())?,
        };
        let buffer = CommandBuffer::new(self.0.device.clone(), Arc::downgrade(&self.0), recording);
        Ok(CommandEncoder::new(buffer))
    }

    /// Executes the command buffers of `desc` in order.
    ///
    /// Every command buffer must be [`Finished`](CommandBufferState::Finished) and created by
    /// this queue; otherwise nothing is submitted. Once execution started, the command buffers
    /// are in flight even if one of them fails, and are reclaimed once the stream passes the
    /// submission.
    pub fn submit(&self, desc: SubmitDesc<'_>) -> Result<()> {
        let shared = &self.0;
        let _submission = shared
            .submission
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for command_buffer in &desc.command_buffers {
            if !command_buffer.belongs_to(shared) {
                return Err(Error::InvalidArgument(
                    "command buffer was created by another queue",
                ));
            }
            if command_buffer.state() != CommandBufferState::Finished {
                return Err(Error::InvalidArgument(
                    "only finished command buffers can be submitted",
                ));
            }
        }
        for (fence, value) in &desc.wait_fences {
            fence.wait_on_stream(*value, shared.stream)?;
        }

        let submission_id = shared.lock().last_submitted_id + 1;
        shared.submit_pages.begin_submit()?;
        let mut result = Ok(());
        let mut recordings = Vec::with_capacity(desc.command_buffers.len());
        for mut command_buffer in desc.command_buffers {
            let mut recording = command_buffer.take_for_submission(submission_id);
            if result.is_ok() {
                result = execute_recording(
                    &shared.device,
                    shared.stream,
                    &mut recording,
                    &shared.staging_pages,
                    &shared.submit_pages,
                );
            }
            recordings.push(recording);
        }
        let ended = shared.submit_pages.end_submit(shared.stream);

        {
            let mut state = shared.lock();
            state.last_submitted_id = submission_id;
            state.in_flight.push_back(InFlight {
                submission_id,
                recordings,
            });
        }
        if result.is_ok() {
            for (fence, value) in &desc.signal_fences {
                fence.signal_from_stream(*value, shared.stream)?;
            }
        }
        shared
            .tracking_fence
            .signal_from_stream(submission_id, shared.stream)?;
        tracing::trace!(submission_id, "submitted");

        self.retire_command_buffers()?;
        result.and(ended)
    }

    /// Blocks until everything submitted so far completed, then reclaims command buffers.
    pub fn wait_on_host(&self) -> Result<()> {
        let device = &self.0.device;
        native_call!(device, device.driver().synchronize_stream(self.0.stream))?;
        self.retire_command_buffers()
    }

    /// Pools the command buffers of every finished submission.
    pub fn retire_command_buffers(&self) -> Result<()> {
        let finished = self.0.tracking_fence.get_current_value()?;
        let retired: Vec<Recording> = {
            let mut state = self.0.lock();
            state.last_finished_id = finished;
            let mut retired = Vec::new();
            while let Some(in_flight) = state.in_flight.front()
                && in_flight.submission_id <= finished
            {
                if let Some(in_flight) = state.in_flight.pop_front() {
                    retired.extend(in_flight.recordings);
                }
            }
            retired
        };
        let retired: Vec<Recording> = retired
            .into_iter()
            .map(|mut recording| {
                recording.reset();
                recording
            })
            .collect();
        self.0.lock().free.extend(retired);
        self.0.submit_pages.update()
    }

    pub fn last_submitted_id(&self) -> u64 {
        self.0.lock().last_submitted_id
    }

    pub fn last_finished_id(&self) -> u64 {
        self.0.lock().last_finished_id
    }

    /// Number of submissions whose command buffers have not been reclaimed yet.
    pub fn in_flight_count(&self) -> usize {
        self.0.lock().in_flight.len()
    }

    /// Number of reset command buffers ready for reuse.
    pub fn pooled_count(&self) -> usize {
        self.0.lock().free.len()
    }
}
