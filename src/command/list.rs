//! The backend-agnostic command stream.
//!
//! A [`CommandList`] is an append-only sequence of [`Command`] records plus a byte arena for
//! variable-length payloads. Records own strong handles to every object they name, so a
//! resource outlives all recorded work that references it. Executors walk the list front to
//! back; [`CommandList::reset`] drops the records and rewinds the arena, keeping capacity.

use std::{any::Any, fmt::Debug, sync::Arc};

use smallvec::SmallVec;

use crate::{
    buffer::{Buffer, BufferOffset},
    pipeline::{BindingData, ComputePipeline, RayTracingPipeline, RenderPipeline},
    query::{QueryPool, QueryType},
    rtx::{
        AccelerationStructure, AccelerationStructureBuildDesc, AccelerationStructureCopyMode,
        ShaderTable,
    },
    texture::{ClearValue, Extent3d, Offset3d, SubresourceRange, Texture},
    tracking::ResourceState,
};

/// A byte range inside the arena of the list that recorded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaRange {
    pub offset: usize,
    pub len: usize,
}

impl ArenaRange {
    /// One past the last byte, `None` if that overflows.
    pub fn end(self) -> Option<usize> {
        self.offset.checked_add(self.len)
    }
}

/// Refers to a [`BindingData`] stored in the list that recorded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingDataId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadOp {
    #[default]
    Load,
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreOp {
    #[default]
    Store,
    DontCare,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorAttachment {
    pub texture: Texture,
    pub range: SubresourceRange,
    pub resolve_target: Option<Texture>,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: [f32; 4],
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthStencilAttachment {
    pub texture: Texture,
    pub range: SubresourceRange,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub depth_read_only: bool,
    pub clear_depth: f32,
    pub clear_stencil: u8,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderPassDesc {
    pub color_attachments: SmallVec<[ColorAttachment; 4]>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScissorRect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexFormat {
    Uint16,
    #[default]
    Uint32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderState {
    pub vertex_buffers: SmallVec<[BufferOffset; 4]>,
    pub index_buffer: Option<(BufferOffset, IndexFormat)>,
    pub viewports: SmallVec<[Viewport; 4]>,
    pub scissor_rects: SmallVec<[ScissorRect; 4]>,
    pub stencil_ref: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawArguments {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawIndexedArguments {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

/// Where a build or a property query writes an acceleration structure property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccelerationStructureQuery {
    pub ty: QueryType,
    pub pool: QueryPool,
    pub first_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooperativeVectorMatrixConversion {
    pub src: BufferOffset,
    pub src_size: u64,
    pub dst: BufferOffset,
    pub dst_size: u64,
    pub rows: u32,
    pub columns: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureCopy {
    pub dst: Texture,
    pub dst_range: SubresourceRange,
    pub dst_offset: Offset3d,
    pub src: Texture,
    pub src_range: SubresourceRange,
    pub src_offset: Offset3d,
    pub extent: Extent3d,
}

/// Copies texels into a buffer, one row every `dst_row_pitch` bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureToBufferCopy {
    pub dst: Buffer,
    pub dst_offset: u64,
    pub dst_size: u64,
    pub dst_row_pitch: u64,
    pub src: Texture,
    pub src_range: SubresourceRange,
    pub src_offset: Offset3d,
    pub extent: Extent3d,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureClear {
    pub texture: Texture,
    pub range: SubresourceRange,
    pub value: ClearValue,
    /// Depth and stencil flags select the aspects cleared on depth formats.
    pub depth: bool,
    pub stencil: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureUpload {
    pub dst: Texture,
    pub range: SubresourceRange,
    pub offset: Offset3d,
    pub extent: Extent3d,
    pub data: ArenaRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccelerationStructureBuild {
    pub desc: AccelerationStructureBuildDesc,
    pub dst: AccelerationStructure,
    /// The structure to update from, for [`BuildMode::Update`](crate::rtx::BuildMode::Update).
    pub src: Option<AccelerationStructure>,
    pub scratch: BufferOffset,
    pub queries: Vec<AccelerationStructureQuery>,
}

/// A host function run when the executor reaches its record.
#[derive(Clone)]
pub struct HostCallback(pub Arc<dyn Fn() + Send + Sync>);

impl Debug for HostCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HostCallback")
    }
}

impl PartialEq for HostCallback {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CopyBuffer {
        dst: Buffer,
        dst_offset: u64,
        src: Buffer,
        src_offset: u64,
        size: u64,
    },
    CopyTexture(TextureCopy),
    CopyTextureToBuffer(TextureToBufferCopy),
    /// Zeroes a byte range.
    ClearBuffer {
        buffer: Buffer,
        offset: u64,
        size: u64,
    },
    ClearTexture(TextureClear),
    UploadTextureData(TextureUpload),
    UploadBufferData {
        dst: Buffer,
        offset: u64,
        data: ArenaRange,
    },
    ResolveQuery {
        pool: QueryPool,
        index: u32,
        count: u32,
        buffer: Buffer,
        offset: u64,
    },
    BeginRenderPass {
        desc: RenderPassDesc,
    },
    EndRenderPass,
    SetRenderState {
        pipeline: RenderPipeline,
        state: RenderState,
        binding_data: BindingDataId,
    },
    Draw(DrawArguments),
    DrawIndexed(DrawIndexedArguments),
    DrawIndirect {
        max_draw_count: u32,
        args: BufferOffset,
        count: Option<BufferOffset>,
    },
    DrawIndexedIndirect {
        max_draw_count: u32,
        args: BufferOffset,
        count: Option<BufferOffset>,
    },
    DrawMeshTasks {
        x: u32,
        y: u32,
        z: u32,
    },
    BeginComputePass,
    EndComputePass,
    SetComputeState {
        pipeline: ComputePipeline,
        binding_data: BindingDataId,
    },
    DispatchCompute {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchComputeIndirect {
        args: BufferOffset,
    },
    BeginRayTracingPass,
    EndRayTracingPass,
    SetRayTracingState {
        pipeline: RayTracingPipeline,
        shader_table: ShaderTable,
        binding_data: BindingDataId,
    },
    DispatchRays {
        raygen: u32,
        width: u32,
        height: u32,
        depth: u32,
    },
    BuildAccelerationStructure(AccelerationStructureBuild),
    CopyAccelerationStructure {
        dst: AccelerationStructure,
        src: AccelerationStructure,
        mode: AccelerationStructureCopyMode,
    },
    QueryAccelerationStructureProperties {
        acceleration_structures: Vec<AccelerationStructure>,
        queries: Vec<AccelerationStructureQuery>,
    },
    SerializeAccelerationStructure {
        dst: BufferOffset,
        src: AccelerationStructure,
    },
    DeserializeAccelerationStructure {
        dst: AccelerationStructure,
        src: BufferOffset,
    },
    ConvertCooperativeVectorMatrix {
        conversions: Vec<CooperativeVectorMatrixConversion>,
    },
    SetBufferState {
        buffer: Buffer,
        state: ResourceState,
    },
    SetTextureState {
        texture: Texture,
        range: SubresourceRange,
        state: ResourceState,
    },
    PushDebugGroup {
        name: ArenaRange,
        color: [f32; 3],
    },
    PopDebugGroup,
    InsertDebugMarker {
        name: ArenaRange,
        color: [f32; 3],
    },
    WriteTimestamp {
        pool: QueryPool,
        index: u32,
    },
    ExecuteCallback {
        callback: HostCallback,
    },
}

impl Command {
    /// The encoder method that records this command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::CopyBuffer { .. } => "copyBuffer",
            Command::CopyTexture(_) => "copyTexture",
            Command::CopyTextureToBuffer(_) => "copyTextureToBuffer",
            Command::ClearBuffer { .. } => "clearBuffer",
            Command::ClearTexture(_) => "clearTexture",
            Command::UploadTextureData(_) => "uploadTextureData",
            Command::UploadBufferData { .. } => "uploadBufferData",
            Command::ResolveQuery { .. } => "resolveQuery",
            Command::BeginRenderPass { .. } => "beginRenderPass",
            Command::EndRenderPass => "endRenderPass",
            Command::SetRenderState { .. } => "setRenderState",
            Command::Draw(_) => "draw",
            Command::DrawIndexed(_) => "drawIndexed",
            Command::DrawIndirect { .. } => "drawIndirect",
            Command::DrawIndexedIndirect { .. } => "drawIndexedIndirect",
            Command::DrawMeshTasks { .. } => "drawMeshTasks",
            Command::BeginComputePass => "beginComputePass",
            Command::EndComputePass => "endComputePass",
            Command::SetComputeState { .. } => "setComputeState",
            Command::DispatchCompute { .. } => "dispatchCompute",
            Command::DispatchComputeIndirect { .. } => "dispatchComputeIndirect",
            Command::BeginRayTracingPass => "beginRayTracingPass",
            Command::EndRayTracingPass => "endRayTracingPass",
            Command::SetRayTracingState { .. } => "setRayTracingState",
            Command::DispatchRays { .. } => "dispatchRays",
            Command::BuildAccelerationStructure(_) => "buildAccelerationStructure",
            Command::CopyAccelerationStructure { .. } => "copyAccelerationStructure",
            Command::QueryAccelerationStructureProperties { .. } => {
                "queryAccelerationStructureProperties"
            }
            Command::SerializeAccelerationStructure { .. } => "serializeAccelerationStructure",
            Command::DeserializeAccelerationStructure { .. } => {
                "deserializeAccelerationStructure"
            }
            Command::ConvertCooperativeVectorMatrix { .. } => "convertCooperativeVectorMatrix",
            Command::SetBufferState { .. } => "setBufferState",
            Command::SetTextureState { .. } => "setTextureState",
            Command::PushDebugGroup { .. } => "pushDebugGroup",
            Command::PopDebugGroup => "popDebugGroup",
            Command::InsertDebugMarker { .. } => "insertDebugMarker",
            Command::WriteTimestamp { .. } => "writeTimestamp",
            Command::ExecuteCallback { .. } => "executeCallback",
        }
    }
}

#[derive(Default)]
pub struct CommandList {
    commands: Vec<Command>,
    arena: Vec<u8>,
    binding_data: Vec<BindingData>,
    retained: Vec<Box<dyn Any + Send + Sync>>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Copies `data` into the arena.
    pub fn write_bytes(&mut self, data: &[u8]) -> ArenaRange {
        let range = ArenaRange {
            offset: self.arena.len(),
            len: data.len(),
        };
        self.arena.extend_from_slice(data);
        range
    }

    pub fn write_str(&mut self, text: &str) -> ArenaRange {
        self.write_bytes(text.as_bytes())
    }

    /// The bytes behind `range`, `None` if it does not lie inside the arena.
    pub fn bytes(&self, range: ArenaRange) -> Option<&[u8]> {
        self.arena.get(range.offset..range.end()?)
    }

    /// Strings are only ever written through [`CommandList::write_str`].
    pub fn str(&self, range: ArenaRange) -> &str {
        self.bytes(range)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .unwrap_or_default()
    }

    pub fn push_binding_data(&mut self, data: BindingData) -> BindingDataId {
        self.binding_data.push(data);
        BindingDataId(self.binding_data.len() as u32 - 1)
    }

    pub fn binding_data(&self, id: BindingDataId) -> Option<&BindingData> {
        self.binding_data.get(id.0 as usize)
    }

    /// Every binding data record, indexable by [`BindingDataId`].
    pub fn all_binding_data(&self) -> &[BindingData] {
        &self.binding_data
    }

    /// Keeps `object` alive until the list is reset.
    pub fn retain(&mut self, object: impl Any + Send + Sync) {
        self.retained.push(Box::new(object));
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    pub fn arena_capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn reset(&mut self) {
        self.commands.clear();
        self.arena.clear();
        self.binding_data.clear();
        self.retained.clear();
    }
}

impl Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("commands", &self.commands.len())
            .field("arena", &self.arena.len())
            .field("binding_data", &self.binding_data.len())
            .field("retained", &self.retained.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_ranges_resolve() {
        let mut list = CommandList::new();
        let name = list.write_str("shadows");
        let data = list.write_bytes(&[1, 2, 3]);
        assert_eq!(list.str(name), "shadows");
        assert_eq!(list.bytes(data), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn foreign_ranges_do_not_resolve() {
        let mut list = CommandList::new();
        list.write_bytes(&[0; 16]);
        let past_end = ArenaRange { offset: 8, len: 9 };
        assert_eq!(list.bytes(past_end), None);
        let wrapping = ArenaRange {
            offset: usize::MAX,
            len: 2,
        };
        assert_eq!(wrapping.end(), None);
        assert_eq!(list.bytes(wrapping), None);
        assert_eq!(list.str(wrapping), "");

        let large = vec![7u8; (u16::MAX as usize) * 2];
        let range = list.write_bytes(&large);
        assert_eq!(range.offset, 16);
        assert_eq!(range.len, large.len());
        assert_eq!(list.bytes(range).map(<[u8]>::len), Some(large.len()));
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut list = CommandList::new();
        list.write_bytes(&[0; 1024]);
        list.push(Command::BeginComputePass);
        list.push(Command::EndComputePass);
        let id = list.push_binding_data(BindingData::default());
        assert_eq!(id, BindingDataId(0));
        let retained = Arc::new(5u32);
        list.retain(retained.clone());
        assert_eq!(Arc::strong_count(&retained), 2);

        let capacity = list.arena_capacity();
        list.reset();
        assert!(list.is_empty());
        assert_eq!(list.arena_len(), 0);
        assert_eq!(list.arena_capacity(), capacity);
        assert!(list.binding_data(id).is_none());
        assert_eq!(Arc::strong_count(&retained), 1);
    }

    #[test]
    fn commands_are_named_after_encoder_methods() {
        assert_eq!(Command::BeginComputePass.name(), "beginComputePass");
        assert_eq!(
            Command::DispatchCompute { x: 1, y: 1, z: 1 }.name(),
            "dispatchCompute"
        );
    }
}
