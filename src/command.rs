//! # Command Encoding
//!
//! This module records backend-agnostic work into command buffers.
//!
//! ## Key Concepts
//! - Command List: the append-only stream of [`Command`] records a command buffer carries,
//!   together with a byte arena for upload data and debug labels.
//! - Pass: compute, render and ray tracing commands are only valid between the begin and end
//!   records of their pass. Pass encoders borrow the [`CommandEncoder`], so the commands that
//!   need a pass can only be recorded inside one, and dropping the pass encoder ends the pass.
//! - Root object: binding a pipeline on a pass encoder returns its root [`ShaderObject`].
//!   The next dispatch or draw resolves it into a `BindingData` and records the matching
//!   `Set*State` command; this is skipped when neither the pipeline nor the root object
//!   changed since the last resolution.
//! - Resource lifetime: every record holds strong handles to the objects it names, so they
//!   live until the command buffer is reset.
//!
//! ## Key Components
//!
//! - [`CommandEncoder`]: records commands into a [`CommandBuffer`].
//! - [`CommandBuffer`]: a submittable recording, pooled by the [`Queue`](crate::queue::Queue)
//!   that created it.
//! - [`ComputePassEncoder`], [`RenderPassEncoder`], [`RayTracingPassEncoder`]: pass-scoped
//!   recording.
//!
//! ## Example Usage
//!
//! ```
//! # use scoria::{Backend, Device, queue::SubmitDesc, pipeline::ComputePipelineDesc};
//! # let (device, queue) = Device::create_host_default(Backend::Cuda).unwrap();
//! let pipeline = device
//!     .create_compute_pipeline(ComputePipelineDesc {
//!         entry_point: "main".into(),
//!         thread_group_size: [64, 1, 1],
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! let mut encoder = queue.create_command_encoder().unwrap();
//! {
//!     let mut pass = encoder.begin_compute_pass();
//!     pass.bind_pipeline(&pipeline).set_data(0, &16u32.to_le_bytes());
//!     pass.dispatch_compute(4, 1, 1).unwrap();
//! }
//! queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
//! ```

mod compute;
mod list;
mod ray_tracing;
mod render;
mod transfer;

use std::{
    any::Any,
    fmt::Debug,
    sync::{Arc, Weak},
};

pub use compute::*;
pub use list::*;
pub use ray_tracing::*;
pub use render::*;

use crate::{
    Device, Error, HasDevice, Result,
    alloc::{ConstantBufferPool, PageHandle},
    buffer::Buffer,
    device::DeviceConfig,
    pipeline::{BindingDataBuilder, ShaderObject},
    query::{QueryPool, QueryType},
    queue::QueueShared,
    texture::{SubresourceRange, Texture},
    tracking::ResourceState,
    utils::ResourceId,
};

/// The parts of a command buffer that are reset and pooled.
#[derive(Default)]
pub(crate) struct Recording {
    pub(crate) list: CommandList,
    pub(crate) constant_buffers: ConstantBufferPool,
    /// Upload staging pages, held until the recording is reset.
    pub(crate) staging: Vec<PageHandle>,
}

impl Recording {
    pub(crate) fn new(config: &DeviceConfig) -> Result<Self> {
        Ok(Self {
            constant_buffers: ConstantBufferPool::new(
                config.constant_buffer_page_size,
                config.constant_buffer_alignment,
            )?,
            ..Default::default()
        })
    }

    pub(crate) fn reset(&mut self) {
        self.list.reset();
        self.constant_buffers.reset();
        self.staging.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Recording,
    /// Recording finished; the buffer can be submitted.
    Finished,
    /// Submitted and owned by the queue until its submission completes.
    InFlight,
    /// Reclaimed by the queue after completion.
    Retired,
}

/// A recorded unit of work.
///
/// A command buffer is owned by the client while it is recorded or waiting for submission;
/// [`Queue::submit`](crate::queue::Queue::submit) moves it to the queue, which resets and
/// pools it once the submission completed. Dropping a command buffer that was never submitted
/// returns it to the pool of its queue.
pub struct CommandBuffer {
    device: Device,
    queue: Weak<QueueShared>,
    recording: Recording,
    state: CommandBufferState,
    submission_id: u64,
}

impl CommandBuffer {
    pub(crate) fn new(device: Device, queue: Weak<QueueShared>, recording: Recording) -> Self {
        Self {
            device,
            queue,
            recording,
            state: CommandBufferState::Recording,
            submission_id: 0,
        }
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// The submission this buffer was last part of, zero if it was never submitted.
    pub fn submission_id(&self) -> u64 {
        self.submission_id
    }

    pub fn list(&self) -> &CommandList {
        &self.recording.list
    }

    /// Discards everything recorded and reopens the buffer for recording.
    ///
    /// Resetting twice is the same as resetting once.
    pub fn reset(&mut self) -> Result<()> {
        match self.state {
            CommandBufferState::InFlight => Err(Error::InvalidArgument(
                "command buffer is still in flight",
            )),
            _ => {
                self.recording.reset();
                self.state = CommandBufferState::Recording;
                Ok(())
            }
        }
    }

    /// Continues recording into a buffer that was reset.
    pub fn encode(self) -> Result<CommandEncoder> {
        if self.state != CommandBufferState::Recording {
            return Err(Error::InvalidArgument(
                "command buffer must be reset before it is recorded again",
            ));
        }
        Ok(CommandEncoder::new(self))
    }

    pub(crate) fn belongs_to(&self, queue: &Arc<QueueShared>) -> bool {
        std::ptr::eq(self.queue.as_ptr(), Arc::as_ptr(queue))
    }

    /// Hands the recording to the queue for execution.
    pub(crate) fn take_for_submission(&mut self, submission_id: u64) -> Recording {
        self.state = CommandBufferState::InFlight;
        self.submission_id = submission_id;
        std::mem::take(&mut self.recording)
    }
}

impl HasDevice for CommandBuffer {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("state", &self.state)
            .field("submission_id", &self.submission_id)
            .field("list", &self.recording.list)
            .finish()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if !matches!(
            self.state,
            CommandBufferState::Recording | CommandBufferState::Finished
        ) {
            return;
        }
        if self.state == CommandBufferState::Finished && !self.recording.list.is_empty() {
            tracing::warn!(
                commands = self.recording.list.len(),
                "command buffer dropped without being submitted"
            );
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.recycle(std::mem::take(&mut self.recording));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResolvedBindings {
    pipeline: ResourceId,
    version: u64,
    binding_data: BindingDataId,
}

/// Records commands into a [`CommandBuffer`].
///
/// Transfer, acceleration structure, state and debug commands are recorded directly. Compute,
/// render and ray tracing commands go through the pass encoders returned by
/// [`begin_compute_pass`](Self::begin_compute_pass),
/// [`begin_render_pass`](Self::begin_render_pass) and
/// [`begin_ray_tracing_pass`](Self::begin_ray_tracing_pass).
pub struct CommandEncoder {
    buffer: CommandBuffer,
    root: ShaderObject,
    resolved: Option<ResolvedBindings>,
    builder: BindingDataBuilder,
}

impl Debug for CommandEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEncoder")
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl HasDevice for CommandEncoder {
    fn device(&self) -> &Device {
        &self.buffer.device
    }
}

impl CommandEncoder {
    pub(crate) fn new(buffer: CommandBuffer) -> Self {
        Self {
            buffer,
            root: ShaderObject::default(),
            resolved: None,
            builder: BindingDataBuilder::default(),
        }
    }

    /// Ends recording.
    pub fn finish(mut self) -> CommandBuffer {
        self.buffer.state = CommandBufferState::Finished;
        self.buffer
    }

    pub fn list(&self) -> &CommandList {
        &self.buffer.recording.list
    }

    pub(crate) fn list_mut(&mut self) -> &mut CommandList {
        &mut self.buffer.recording.list
    }

    pub(crate) fn push(&mut self, command: Command) {
        self.buffer.recording.list.push(command);
    }

    /// Clears the root object for a newly bound pipeline.
    pub(crate) fn rebind_root(&mut self) -> &mut ShaderObject {
        self.root.reset();
        &mut self.root
    }

    /// Forgets the resolved bindings, so the next dispatch or draw records its state again.
    pub(crate) fn invalidate_bindings(&mut self) {
        self.resolved = None;
    }

    /// Resolves the root object for `pipeline` unless it was already resolved unchanged.
    ///
    /// Returns the binding data and whether it was newly recorded.
    pub(crate) fn resolve_bindings(&mut self, pipeline: ResourceId) -> Result<(BindingDataId, bool)> {
        let version = self.root.version();
        if let Some(resolved) = self.resolved
            && resolved.pipeline == pipeline
            && resolved.version == version
        {
            return Ok((resolved.binding_data, false));
        }
        let data = self.builder.build(&self.root)?;
        let binding_data = self.list_mut().push_binding_data(data);
        self.resolved = Some(ResolvedBindings {
            pipeline,
            version,
            binding_data,
        });
        Ok((binding_data, true))
    }

    /// Transitions `buffer` to `state` at this point of the stream.
    pub fn set_buffer_state(&mut self, buffer: &Buffer, state: ResourceState) {
        self.push(Command::SetBufferState {
            buffer: buffer.clone(),
            state,
        });
    }

    /// Transitions a range of `texture` to `state` at this point of the stream.
    pub fn set_texture_state(
        &mut self,
        texture: &Texture,
        range: SubresourceRange,
        state: ResourceState,
    ) -> Result<()> {
        if !range.fits(texture.desc()) {
            return Err(Error::InvalidArgument("subresource range is out of bounds"));
        }
        self.push(Command::SetTextureState {
            texture: texture.clone(),
            range,
            state,
        });
        Ok(())
    }

    pub fn push_debug_group(&mut self, name: &str, color: [f32; 3]) {
        let name = self.list_mut().write_str(name);
        self.push(Command::PushDebugGroup { name, color });
    }

    pub fn pop_debug_group(&mut self) {
        self.push(Command::PopDebugGroup);
    }

    pub fn insert_debug_marker(&mut self, name: &str, color: [f32; 3]) {
        let name = self.list_mut().write_str(name);
        self.push(Command::InsertDebugMarker { name, color });
    }

    pub fn write_timestamp(&mut self, pool: &QueryPool, index: u32) -> Result<()> {
        if pool.ty() != QueryType::Timestamp {
            return Err(Error::InvalidArgument("timestamps need a timestamp query pool"));
        }
        if index >= pool.count() {
            return Err(Error::InvalidArgument("query index out of range"));
        }
        self.push(Command::WriteTimestamp {
            pool: pool.clone(),
            index,
        });
        Ok(())
    }

    /// Runs `callback` on the host when execution reaches this point of the list.
    pub fn execute_callback(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.push(Command::ExecuteCallback {
            callback: HostCallback(Arc::new(callback)),
        });
    }

    /// Keeps `object` alive until the command buffer is reset.
    pub fn retain(&mut self, object: impl Any + Send + Sync) {
        self.list_mut().retain(object);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        Backend,
        buffer::{BufferDesc, BufferUsage},
        native::HostDriver,
        pipeline::{BindingAccess, ComputePipelineDesc},
        query::QueryPoolDesc,
        queue::{Queue, SubmitDesc},
    };

    fn setup() -> (Device, Queue) {
        let device = Device::builder(Backend::D3D12)
            .driver(Arc::new(HostDriver::new()))
            .build()
            .unwrap();
        let queue = device.create_queue().unwrap();
        (device, queue)
    }

    #[test]
    fn reset_is_idempotent() {
        let (device, queue) = setup();
        let buffer = device
            .create_buffer(
                &BufferDesc {
                    size: 16,
                    usage: BufferUsage::COPY_DESTINATION,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let mut encoder = queue.create_command_encoder().unwrap();
        encoder.clear_buffer(&buffer, 0, 16).unwrap();
        let mut command_buffer = encoder.finish();
        assert_eq!(command_buffer.state(), CommandBufferState::Finished);
        assert!(!command_buffer.list().is_empty());

        command_buffer.reset().unwrap();
        command_buffer.reset().unwrap();
        assert_eq!(command_buffer.state(), CommandBufferState::Recording);
        assert!(command_buffer.list().is_empty());

        let mut encoder = command_buffer.encode().unwrap();
        encoder.pop_debug_group();
        queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
    }

    #[test]
    fn finished_buffers_must_be_reset_before_encoding() {
        let (_device, queue) = setup();
        let command_buffer = queue.create_command_encoder().unwrap().finish();
        assert!(matches!(
            command_buffer.encode(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn bindings_are_resolved_once_per_change() {
        let (device, queue) = setup();
        let pipeline = device
            .create_compute_pipeline(ComputePipelineDesc {
                thread_group_size: [8, 8, 1],
                ..Default::default()
            })
            .unwrap();
        let target = device
            .create_buffer(
                &BufferDesc {
                    size: 64,
                    usage: BufferUsage::UNORDERED_ACCESS,
                    default_state: ResourceState::UnorderedAccess,
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        let mut encoder = queue.create_command_encoder().unwrap();
        {
            let mut pass = encoder.begin_compute_pass();
            pass.bind_pipeline(&pipeline)
                .set_buffer(0, &target, BindingAccess::ReadWrite);
            pass.dispatch_compute(1, 1, 1).unwrap();
            pass.dispatch_compute(2, 1, 1).unwrap();
            pass.root().set_data(0, &[1, 2, 3, 4]);
            pass.dispatch_compute(3, 1, 1).unwrap();
        }
        let names: Vec<&str> = encoder.list().commands().iter().map(Command::name).collect();
        assert_eq!(
            names,
            [
                "beginComputePass",
                "setComputeState",
                "dispatchCompute",
                "dispatchCompute",
                "setComputeState",
                "dispatchCompute",
                "endComputePass",
            ]
        );
        assert_eq!(encoder.list().all_binding_data().len(), 2);
    }

    #[test]
    fn passes_record_their_state_again() {
        let (device, queue) = setup();
        let pipeline = device
            .create_compute_pipeline(ComputePipelineDesc {
                thread_group_size: [1, 1, 1],
                ..Default::default()
            })
            .unwrap();
        let mut encoder = queue.create_command_encoder().unwrap();
        for _ in 0..2 {
            let mut pass = encoder.begin_compute_pass();
            pass.bind_pipeline(&pipeline);
            pass.dispatch_compute(1, 1, 1).unwrap();
            pass.end();
        }
        let states = encoder
            .list()
            .commands()
            .iter()
            .filter(|command| matches!(command, Command::SetComputeState { .. }))
            .count();
        assert_eq!(states, 2);
    }

    #[test]
    fn dispatch_without_pipeline_is_rejected() {
        let (_device, queue) = setup();
        let mut encoder = queue.create_command_encoder().unwrap();
        let mut pass = encoder.begin_compute_pass();
        assert!(matches!(
            pass.dispatch_compute(1, 1, 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn callbacks_run_during_execution() {
        let (_device, queue) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut encoder = queue.create_command_encoder().unwrap();
        let counter = calls.clone();
        encoder.execute_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retained_objects_live_until_reset() {
        let (_device, queue) = setup();
        let object = Arc::new(());
        let mut encoder = queue.create_command_encoder().unwrap();
        encoder.retain(object.clone());
        let mut command_buffer = encoder.finish();
        assert_eq!(Arc::strong_count(&object), 2);
        command_buffer.reset().unwrap();
        assert_eq!(Arc::strong_count(&object), 1);
    }

    #[test]
    fn timestamps_need_a_timestamp_pool() {
        let (device, queue) = setup();
        let pool = device
            .create_query_pool(QueryPoolDesc {
                ty: QueryType::AccelerationStructureCompactedSize,
                count: 1,
                label: None,
            })
            .unwrap();
        let mut encoder = queue.create_command_encoder().unwrap();
        assert!(encoder.write_timestamp(&pool, 0).is_err());
        assert!(encoder.list().is_empty());
    }
}
