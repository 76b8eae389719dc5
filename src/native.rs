//! The narrow interface to a native driver.
//!
//! Everything backend specific that is *not* command translation lives behind the [`Driver`]
//! trait: memory allocation, streams, completion events and a single [`Driver::enqueue`]
//! entry point that accepts already translated [`NativeOp`]s. Executors translate command
//! records into `NativeOp`s, pools and fences allocate memory and events through the driver.
//!
//! Loading a real CUDA, D3D12 or Vulkan driver is the job of the embedding application; the
//! crate ships [`HostDriver`], an implementation that emulates device memory and streams on
//! the host.

mod host;

pub use host::{HostDriver, LoggedOp};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    query::QueryType,
    rtx::AccelerationStructureCopyMode,
    texture::{ClearValue, Extent3d, Offset3d, SubresourceRange},
    tracking::ResourceState,
    utils::ResourceId,
};

/// Address of device-visible memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    pub const NULL: DeviceAddress = DeviceAddress(0);

    pub fn offset(self, bytes: u64) -> DeviceAddress {
        DeviceAddress(self.0 + bytes)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Address of pinned host memory the device can read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostAddress(pub u64);

impl HostAddress {
    pub const NULL: HostAddress = HostAddress(0);

    pub fn offset(self, bytes: u64) -> HostAddress {
        HostAddress(self.0 + bytes)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Ready,
    NotReady,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeError {
    #[error("native allocation failed")]
    OutOfMemory,
    #[error("invalid native handle")]
    InvalidHandle,
    #[error("invalid value")]
    InvalidValue,
    #[error("the operation would block forever")]
    WouldBlock,
    #[error("native error code {0}")]
    Code(i32),
}

pub trait Driver: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn allocate_device_memory(&self, size: u64, alignment: u64)
    -> Result<DeviceAddress, NativeError>;
    fn free_device_memory(&self, address: DeviceAddress) -> Result<(), NativeError>;
    fn allocate_host_memory(&self, size: u64, alignment: u64) -> Result<HostAddress, NativeError>;
    fn free_host_memory(&self, address: HostAddress) -> Result<(), NativeError>;
    fn write_host_memory(&self, dst: HostAddress, data: &[u8]) -> Result<(), NativeError>;
    /// Synchronous readback. Callers must make sure the producing work has completed.
    fn read_device_memory(&self, src: DeviceAddress, dst: &mut [u8]) -> Result<(), NativeError>;

    fn create_stream(&self) -> Result<StreamHandle, NativeError>;
    fn destroy_stream(&self, stream: StreamHandle) -> Result<(), NativeError>;
    fn synchronize_stream(&self, stream: StreamHandle) -> Result<(), NativeError>;

    fn create_event(&self) -> Result<EventHandle, NativeError>;
    fn destroy_event(&self, event: EventHandle) -> Result<(), NativeError>;
    /// Captures the work enqueued on `stream` so far. The event becomes ready once that work
    /// completed. An event that was never recorded is ready.
    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> Result<(), NativeError>;
    fn query_event(&self, event: EventHandle) -> Result<EventStatus, NativeError>;
    fn synchronize_event(&self, event: EventHandle) -> Result<(), NativeError>;
    /// Makes future work on `stream` wait for the most recent recording of `event`.
    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle)
    -> Result<(), NativeError>;

    fn enqueue(&self, stream: StreamHandle, op: NativeOp) -> Result<(), NativeError>;
}

/// One already translated native operation.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeOp {
    CopyMemory {
        dst: DeviceAddress,
        src: DeviceAddress,
        size: u64,
    },
    UploadMemory {
        dst: DeviceAddress,
        src: HostAddress,
        size: u64,
    },
    /// Fills `size` bytes with the repeated little endian `value`.
    FillMemory {
        dst: DeviceAddress,
        size: u64,
        value: u32,
    },
    CopyTexture {
        dst: ResourceId,
        dst_range: SubresourceRange,
        dst_offset: Offset3d,
        src: ResourceId,
        src_range: SubresourceRange,
        src_offset: Offset3d,
        extent: Extent3d,
    },
    CopyTextureToBuffer {
        dst: DeviceAddress,
        row_pitch: u64,
        src: ResourceId,
        src_range: SubresourceRange,
        src_offset: Offset3d,
        extent: Extent3d,
    },
    ClearTexture {
        texture: ResourceId,
        range: SubresourceRange,
        value: ClearValue,
        depth: bool,
        stencil: bool,
    },
    UploadTexture {
        dst: ResourceId,
        range: SubresourceRange,
        offset: Offset3d,
        extent: Extent3d,
        src: HostAddress,
        size: u64,
    },
    Barrier(Barrier),
    BeginRenderPass {
        color_targets: SmallVec<[ResourceId; 4]>,
        depth_target: Option<ResourceId>,
    },
    EndRenderPass,
    BindPipeline {
        pipeline: ResourceId,
    },
    BindArguments {
        constants: Option<DeviceAddress>,
        resource_count: u32,
    },
    SetRenderState {
        vertex_buffers: SmallVec<[DeviceAddress; 4]>,
        index_buffer: Option<DeviceAddress>,
        viewports: u32,
        scissor_rects: u32,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
    DrawIndirect {
        indexed: bool,
        max_draw_count: u32,
        args: DeviceAddress,
        count: Option<DeviceAddress>,
    },
    DrawMeshTasks {
        x: u32,
        y: u32,
        z: u32,
    },
    /// A compute launch: `grid` thread groups of `block` threads each.
    Dispatch {
        grid: [u32; 3],
        block: [u32; 3],
    },
    DispatchIndirect {
        args: DeviceAddress,
    },
    DispatchRays {
        raygen: u32,
        extent: [u32; 3],
    },
    BuildAccelerationStructure {
        dst: DeviceAddress,
        src: Option<DeviceAddress>,
        scratch: DeviceAddress,
        input_count: u32,
    },
    CopyAccelerationStructure {
        dst: DeviceAddress,
        src: DeviceAddress,
        mode: AccelerationStructureCopyMode,
    },
    WriteAccelerationStructureProperty {
        src: DeviceAddress,
        query: QueryType,
        dst: DeviceAddress,
    },
    SerializeAccelerationStructure {
        dst: DeviceAddress,
        src: DeviceAddress,
    },
    DeserializeAccelerationStructure {
        dst: DeviceAddress,
        src: DeviceAddress,
    },
    ConvertCooperativeVectorMatrix {
        src: DeviceAddress,
        src_size: u64,
        dst: DeviceAddress,
        dst_size: u64,
        rows: u32,
        columns: u32,
    },
    /// Writes the device tick counter as a little endian `u64`.
    WriteTimestamp {
        dst: DeviceAddress,
    },
    PushDebugGroup {
        name: String,
        color: [f32; 3],
    },
    PopDebugGroup,
    InsertDebugMarker {
        name: String,
        color: [f32; 3],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subresource {
    pub mip_level: u32,
    pub array_layer: u32,
}

/// Synchronization operations in the flavor of the backend that produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum Barrier {
    /// A state transition. `subresource` is `None` when the whole resource transitions.
    Transition {
        resource: ResourceId,
        subresource: Option<Subresource>,
        before: ResourceState,
        after: ResourceState,
    },
    /// Orders unordered-access work on the same resource without changing its state.
    UnorderedAccess { resource: ResourceId },
    /// A `vkCmdPipelineBarrier2` worth of barriers sharing one stage pair.
    Pipeline(PipelineBarrier),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub buffers: SmallVec<[BufferMemoryBarrier; 4]>,
    pub images: SmallVec<[ImageMemoryBarrier; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMemoryBarrier {
    pub buffer: ResourceId,
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMemoryBarrier {
    pub image: ResourceId,
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}
