//! Command list execution.
//!
//! [`execute`] walks a [`CommandList`] front to back and hands every record to the backend's
//! [`CommandExecutor`]. For each command the backend (1) declares the states it needs through
//! the [`ExecuteContext`], (2) commits the resulting barriers and (3) enqueues the native
//! operation, so native operations appear on the stream in exactly record order.
//!
//! The walk itself owns the parts that do not depend on the backend:
//!
//! - The pass state machine. A pass of one kind is active between its begin and end records;
//!   beginning any pass invalidates the pipeline state of every kind. `Set*State` records are
//!   only applied inside their pass, and draws or dispatches without a valid state are
//!   dropped.
//! - Dirty comparison. Pipelines and arguments are only re-bound natively when the pipeline or
//!   the binding data differs from the previously bound one.
//! - The epilogue: every touched resource returns to its default state and the tracker is
//!   cleared.
//!
//! Every [`CommandExecutor`] method has a default that reports
//! `"<commandName> command is not supported!"` through the debug callback and skips the
//! command. A malformed list never fails execution.

use crate::{
    Device, HasDevice, Result,
    alloc::{ConstantBufferAllocation, DualPageAllocator, PageHandle, SubmitPageAllocator},
    backend::BackendCapabilities,
    buffer::{Buffer, BufferOffset},
    command::{
        AccelerationStructureBuild, AccelerationStructureQuery, BindingDataId, Command,
        CommandList, CooperativeVectorMatrixConversion, DrawArguments, DrawIndexedArguments,
        Recording, RenderPassDesc, RenderState, TextureClear, TextureCopy, TextureToBufferCopy,
        TextureUpload,
    },
    debug::{DebugMessageSource, DebugMessageType},
    error::native_call,
    native::{HostAddress, NativeOp, StreamHandle},
    pipeline::{BindingData, ComputePipeline, RayTracingPipeline, RenderPipeline},
    query::QueryPool,
    rtx::{AccelerationStructure, AccelerationStructureCopyMode, ShaderTable},
    texture::{SubresourceRange, Texture},
    tracking::{ResourceState, StateTracker},
    utils::ResourceId,
};

/// Which native binds a `Set*State` record needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rebind {
    pub pipeline: bool,
    pub arguments: bool,
}

/// Everything a backend needs while executing one command list.
pub struct ExecuteContext<'a> {
    device: &'a Device,
    stream: StreamHandle,
    list: &'a CommandList,
    capabilities: BackendCapabilities,
    tracker: StateTracker,
    constants: Vec<ConstantBufferAllocation>,
    staging: &'a mut Vec<PageHandle>,
    staging_pages: &'a DualPageAllocator,
    submit_pages: &'a SubmitPageAllocator,
}

impl<'a> ExecuteContext<'a> {
    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    pub fn list(&self) -> &'a CommandList {
        self.list
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut StateTracker {
        &mut self.tracker
    }

    pub fn enqueue(&self, op: NativeOp) -> Result<()> {
        native_call!(self.device, self.device.driver().enqueue(self.stream, op))
    }

    /// Reports a command the backend cannot perform and skips it.
    pub fn unsupported(&self, command: &str) -> Result<()> {
        self.device.debug_callback().handle_message(
            DebugMessageType::Warning,
            DebugMessageSource::Layer,
            &format!("{command} command is not supported!"),
        );
        Ok(())
    }

    pub fn warn(&self, message: &str) {
        self.device.debug_callback().handle_message(
            DebugMessageType::Warning,
            DebugMessageSource::Layer,
            message,
        );
    }

    pub fn require_buffer_state(&mut self, buffer: &Buffer, state: ResourceState) {
        if self.capabilities.explicit_barriers {
            self.tracker.set_buffer_state(buffer, state);
        }
    }

    pub fn require_texture_state(
        &mut self,
        texture: &Texture,
        range: SubresourceRange,
        state: ResourceState,
    ) {
        if self.capabilities.explicit_barriers {
            self.tracker.set_texture_state(texture, range, state);
        }
    }

    /// Declares the states of every resource bound in `data`.
    pub fn require_binding_states(&mut self, data: &BindingData) {
        for bound in &data.buffers {
            self.require_buffer_state(&bound.buffer, bound.access.buffer_state());
        }
        for bound in &data.textures {
            self.require_texture_state(&bound.texture, bound.range, bound.access.texture_state());
        }
        for (_, acceleration_structure) in &data.acceleration_structures {
            self.require_buffer_state(
                acceleration_structure.storage(),
                ResourceState::AccelerationStructure,
            );
        }
    }

    /// The uploaded constants of a binding data record.
    pub fn constants(&self, id: BindingDataId) -> ConstantBufferAllocation {
        self.constants.get(id.0 as usize).copied().unwrap_or_default()
    }

    /// Copies `data` into a page that lives until the current submission completed.
    pub fn stage_for_submission(&self, data: &[u8]) -> Result<HostAddress> {
        let page = self.submit_pages.allocate(data.len() as u64)?;
        if !page.is_empty() {
            native_call!(
                self.device,
                self.device.driver().write_host_memory(page.host, data)
            )?;
        }
        Ok(page.host)
    }

    /// Copies `data` into a page retained by the command buffer being executed.
    pub fn stage_for_command_buffer(&mut self, data: &[u8]) -> Result<HostAddress> {
        if data.is_empty() {
            return Ok(HostAddress::NULL);
        }
        let page = self.staging_pages.allocate_handle(data.len() as u64)?;
        page.write(0, data)?;
        let host = page.host_address();
        self.staging.push(page);
        Ok(host)
    }
}

impl HasDevice for ExecuteContext<'_> {
    fn device(&self) -> &Device {
        self.device
    }
}

/// Translates command records into native operations.
///
/// [`CommandExecutor::commit_barriers`] is the only required method. Every other method has a
/// default that reports the command as unsupported and skips it.
#[allow(unused_variables)]
pub trait CommandExecutor: Send {
    /// Turns the barriers recorded by the tracker into native barriers and clears them.
    fn commit_barriers(&mut self, cx: &mut ExecuteContext<'_>) -> Result<()>;

    fn copy_buffer(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &Buffer,
        dst_offset: u64,
        src: &Buffer,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        cx.unsupported("copyBuffer")
    }

    fn copy_texture(&mut self, cx: &mut ExecuteContext<'_>, copy: &TextureCopy) -> Result<()> {
        cx.unsupported("copyTexture")
    }

    fn copy_texture_to_buffer(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        copy: &TextureToBufferCopy,
    ) -> Result<()> {
        cx.unsupported("copyTextureToBuffer")
    }

    fn clear_buffer(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        buffer: &Buffer,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        cx.unsupported("clearBuffer")
    }

    fn clear_texture(&mut self, cx: &mut ExecuteContext<'_>, clear: &TextureClear) -> Result<()> {
        cx.unsupported("clearTexture")
    }

    fn upload_texture_data(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        upload: &TextureUpload,
        data: &[u8],
    ) -> Result<()> {
        cx.unsupported("uploadTextureData")
    }

    fn upload_buffer_data(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        cx.unsupported("uploadBufferData")
    }

    fn resolve_query(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pool: &QueryPool,
        index: u32,
        count: u32,
        buffer: &Buffer,
        offset: u64,
    ) -> Result<()> {
        cx.unsupported("resolveQuery")
    }

    fn begin_render_pass(&mut self, cx: &mut ExecuteContext<'_>, desc: &RenderPassDesc) -> Result<()> {
        cx.unsupported("beginRenderPass")
    }

    fn end_render_pass(&mut self, cx: &mut ExecuteContext<'_>) -> Result<()> {
        cx.unsupported("endRenderPass")
    }

    /// Returns whether the state was applied.
    fn set_render_state(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pipeline: &RenderPipeline,
        state: &RenderState,
        data: &BindingData,
        constants: ConstantBufferAllocation,
        rebind: Rebind,
    ) -> Result<bool> {
        cx.unsupported("setRenderState")?;
        Ok(false)
    }

    fn draw(&mut self, cx: &mut ExecuteContext<'_>, args: &DrawArguments) -> Result<()> {
        cx.unsupported("draw")
    }

    fn draw_indexed(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        args: &DrawIndexedArguments,
    ) -> Result<()> {
        cx.unsupported("drawIndexed")
    }

    fn draw_indirect(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        max_draw_count: u32,
        args: &BufferOffset,
        count: Option<&BufferOffset>,
    ) -> Result<()> {
        cx.unsupported("drawIndirect")
    }

    fn draw_indexed_indirect(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        max_draw_count: u32,
        args: &BufferOffset,
        count: Option<&BufferOffset>,
    ) -> Result<()> {
        cx.unsupported("drawIndexedIndirect")
    }

    fn draw_mesh_tasks(&mut self, cx: &mut ExecuteContext<'_>, x: u32, y: u32, z: u32) -> Result<()> {
        cx.unsupported("drawMeshTasks")
    }

    /// Returns whether the state was applied.
    fn set_compute_state(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pipeline: &ComputePipeline,
        data: &BindingData,
        constants: ConstantBufferAllocation,
        rebind: Rebind,
    ) -> Result<bool> {
        cx.unsupported("setComputeState")?;
        Ok(false)
    }

    fn dispatch_compute(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pipeline: &ComputePipeline,
        x: u32,
        y: u32,
        z: u32,
    ) -> Result<()> {
        cx.unsupported("dispatchCompute")
    }

    fn dispatch_compute_indirect(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        args: &BufferOffset,
    ) -> Result<()> {
        cx.unsupported("dispatchComputeIndirect")
    }

    /// Returns whether the state was applied.
    fn set_ray_tracing_state(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pipeline: &RayTracingPipeline,
        shader_table: &ShaderTable,
        data: &BindingData,
        constants: ConstantBufferAllocation,
        rebind: Rebind,
    ) -> Result<bool> {
        cx.unsupported("setRayTracingState")?;
        Ok(false)
    }

    fn dispatch_rays(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        shader_table: &ShaderTable,
        raygen: u32,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<()> {
        cx.unsupported("dispatchRays")
    }

    fn build_acceleration_structure(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        build: &AccelerationStructureBuild,
    ) -> Result<()> {
        cx.unsupported("buildAccelerationStructure")
    }

    fn copy_acceleration_structure(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &AccelerationStructure,
        src: &AccelerationStructure,
        mode: AccelerationStructureCopyMode,
    ) -> Result<()> {
        cx.unsupported("copyAccelerationStructure")
    }

    fn query_acceleration_structure_properties(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        acceleration_structures: &[AccelerationStructure],
        queries: &[AccelerationStructureQuery],
    ) -> Result<()> {
        cx.unsupported("queryAccelerationStructureProperties")
    }

    fn serialize_acceleration_structure(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &BufferOffset,
        src: &AccelerationStructure,
    ) -> Result<()> {
        cx.unsupported("serializeAccelerationStructure")
    }

    fn deserialize_acceleration_structure(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &AccelerationStructure,
        src: &BufferOffset,
    ) -> Result<()> {
        cx.unsupported("deserializeAccelerationStructure")
    }

    fn convert_cooperative_vector_matrix(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        conversions: &[CooperativeVectorMatrixConversion],
    ) -> Result<()> {
        cx.unsupported("convertCooperativeVectorMatrix")
    }

    fn push_debug_group(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        name: &str,
        color: [f32; 3],
    ) -> Result<()> {
        cx.unsupported("pushDebugGroup")
    }

    fn pop_debug_group(&mut self, cx: &mut ExecuteContext<'_>) -> Result<()> {
        cx.unsupported("popDebugGroup")
    }

    fn insert_debug_marker(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        name: &str,
        color: [f32; 3],
    ) -> Result<()> {
        cx.unsupported("insertDebugMarker")
    }

    fn write_timestamp(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pool: &QueryPool,
        index: u32,
    ) -> Result<()> {
        cx.unsupported("writeTimestamp")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassKind {
    Render,
    Compute,
    RayTracing,
}

/// Pass and binding state of one walk.
#[derive(Default)]
struct PassTracker {
    active: Option<PassKind>,
    state_valid: bool,
    bound: Option<(ResourceId, BindingDataId)>,
    compute_pipeline: Option<ComputePipeline>,
    shader_table: Option<ShaderTable>,
}

impl PassTracker {
    fn begin(&mut self, kind: PassKind) {
        *self = PassTracker {
            active: Some(kind),
            ..Default::default()
        };
    }

    fn end(&mut self, kind: PassKind) -> bool {
        if self.active != Some(kind) {
            return false;
        }
        *self = PassTracker::default();
        true
    }

    fn is_active(&self, kind: PassKind) -> bool {
        self.active == Some(kind)
    }

    fn rebind(&self, pipeline: ResourceId, data: BindingDataId) -> Rebind {
        match self.bound {
            Some((bound_pipeline, bound_data)) => Rebind {
                pipeline: bound_pipeline != pipeline,
                arguments: bound_pipeline != pipeline || bound_data != data,
            },
            None => Rebind {
                pipeline: true,
                arguments: true,
            },
        }
    }

    fn bind(&mut self, pipeline: ResourceId, data: BindingDataId) {
        self.bound = Some((pipeline, data));
        self.state_valid = true;
    }

    /// Forgets the bound state. Draws and dispatches are dropped until the next bind succeeds.
    fn invalidate(&mut self) {
        self.state_valid = false;
        self.bound = None;
        self.compute_pipeline = None;
        self.shader_table = None;
    }

    /// Whether a draw or dispatch of `kind` can run. Reports why not.
    fn ready(&self, kind: PassKind, command: &Command, cx: &ExecuteContext<'_>) -> bool {
        if !self.is_active(kind) {
            cx.warn(&format!(
                "{} command recorded outside of a {kind:?} pass, skipped",
                command.name()
            ));
            false
        } else if !self.state_valid {
            tracing::trace!(command = command.name(), "no valid pipeline state, dropped");
            false
        } else {
            true
        }
    }
}

/// Executes every record of the context's list with `executor`.
pub fn execute(executor: &mut dyn CommandExecutor, cx: &mut ExecuteContext<'_>) -> Result<()> {
    let list = cx.list;
    let trace = cx.device.config().trace_commands;
    let mut passes = PassTracker::default();

    for command in list.commands() {
        if trace {
            tracing::trace!(command = command.name(), "execute");
        }
        match command {
            Command::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => executor.copy_buffer(cx, dst, *dst_offset, src, *src_offset, *size)?,
            Command::CopyTexture(copy) => executor.copy_texture(cx, copy)?,
            Command::CopyTextureToBuffer(copy) => executor.copy_texture_to_buffer(cx, copy)?,
            Command::ClearBuffer {
                buffer,
                offset,
                size,
            } => executor.clear_buffer(cx, buffer, *offset, *size)?,
            Command::ClearTexture(clear) => executor.clear_texture(cx, clear)?,
            Command::UploadTextureData(upload) => match list.bytes(upload.data) {
                Some(data) => executor.upload_texture_data(cx, upload, data)?,
                None => cx.warn("uploadTextureData data is outside the command arena, skipped"),
            },
            Command::UploadBufferData { dst, offset, data } => match list.bytes(*data) {
                Some(data) => executor.upload_buffer_data(cx, dst, *offset, data)?,
                None => cx.warn("uploadBufferData data is outside the command arena, skipped"),
            },
            Command::ResolveQuery {
                pool,
                index,
                count,
                buffer,
                offset,
            } => executor.resolve_query(cx, pool, *index, *count, buffer, *offset)?,

            Command::BeginRenderPass { desc } => {
                passes.begin(PassKind::Render);
                executor.begin_render_pass(cx, desc)?;
            }
            Command::EndRenderPass => {
                if passes.end(PassKind::Render) {
                    executor.end_render_pass(cx)?;
                } else {
                    cx.warn("endRenderPass command recorded outside of a render pass, skipped");
                }
            }
            Command::SetRenderState {
                pipeline,
                state,
                binding_data,
            } => {
                passes.invalidate();
                let Some(data) = binding_data_for(&passes, PassKind::Render, command, cx) else {
                    continue;
                };
                let rebind = passes.rebind(pipeline.id(), *binding_data);
                let constants = cx.constants(*binding_data);
                if executor.set_render_state(cx, pipeline, state, data, constants, rebind)? {
                    passes.bind(pipeline.id(), *binding_data);
                }
            }
            Command::Draw(args) => {
                if passes.ready(PassKind::Render, command, cx) {
                    executor.draw(cx, args)?;
                }
            }
            Command::DrawIndexed(args) => {
                if passes.ready(PassKind::Render, command, cx) {
                    executor.draw_indexed(cx, args)?;
                }
            }
            Command::DrawIndirect {
                max_draw_count,
                args,
                count,
            } => {
                if passes.ready(PassKind::Render, command, cx) {
                    executor.draw_indirect(cx, *max_draw_count, args, count.as_ref())?;
                }
            }
            Command::DrawIndexedIndirect {
                max_draw_count,
                args,
                count,
            } => {
                if passes.ready(PassKind::Render, command, cx) {
                    executor.draw_indexed_indirect(cx, *max_draw_count, args, count.as_ref())?;
                }
            }
            Command::DrawMeshTasks { x, y, z } => {
                if passes.ready(PassKind::Render, command, cx) {
                    executor.draw_mesh_tasks(cx, *x, *y, *z)?;
                }
            }

            Command::BeginComputePass => passes.begin(PassKind::Compute),
            Command::EndComputePass => {
                if !passes.end(PassKind::Compute) {
                    cx.warn("endComputePass command recorded outside of a compute pass, skipped");
                }
            }
            Command::SetComputeState {
                pipeline,
                binding_data,
            } => {
                passes.invalidate();
                let Some(data) = binding_data_for(&passes, PassKind::Compute, command, cx) else {
                    continue;
                };
                let rebind = passes.rebind(pipeline.id(), *binding_data);
                let constants = cx.constants(*binding_data);
                if executor.set_compute_state(cx, pipeline, data, constants, rebind)? {
                    passes.bind(pipeline.id(), *binding_data);
                    passes.compute_pipeline = Some(pipeline.clone());
                }
            }
            Command::DispatchCompute { x, y, z } => {
                if passes.ready(PassKind::Compute, command, cx)
                    && let Some(pipeline) = passes.compute_pipeline.as_ref()
                {
                    executor.dispatch_compute(cx, pipeline, *x, *y, *z)?;
                }
            }
            Command::DispatchComputeIndirect { args } => {
                if passes.ready(PassKind::Compute, command, cx) {
                    executor.dispatch_compute_indirect(cx, args)?;
                }
            }

            Command::BeginRayTracingPass => passes.begin(PassKind::RayTracing),
            Command::EndRayTracingPass => {
                if !passes.end(PassKind::RayTracing) {
                    cx.warn(
                        "endRayTracingPass command recorded outside of a ray tracing pass, skipped",
                    );
                }
            }
            Command::SetRayTracingState {
                pipeline,
                shader_table,
                binding_data,
            } => {
                passes.invalidate();
                let Some(data) = binding_data_for(&passes, PassKind::RayTracing, command, cx)
                else {
                    continue;
                };
                let rebind = passes.rebind(pipeline.id(), *binding_data);
                let constants = cx.constants(*binding_data);
                if executor.set_ray_tracing_state(
                    cx,
                    pipeline,
                    shader_table,
                    data,
                    constants,
                    rebind,
                )? {
                    passes.bind(pipeline.id(), *binding_data);
                    passes.shader_table = Some(shader_table.clone());
                }
            }
            Command::DispatchRays {
                raygen,
                width,
                height,
                depth,
            } => {
                if passes.ready(PassKind::RayTracing, command, cx)
                    && let Some(table) = passes.shader_table.as_ref()
                {
                    if *raygen >= table.raygen_count() {
                        cx.warn("dispatchRays raygen index out of range, skipped");
                        continue;
                    }
                    executor.dispatch_rays(cx, table, *raygen, *width, *height, *depth)?;
                }
            }

            Command::BuildAccelerationStructure(build) => {
                executor.build_acceleration_structure(cx, build)?
            }
            Command::CopyAccelerationStructure { dst, src, mode } => {
                executor.copy_acceleration_structure(cx, dst, src, *mode)?
            }
            Command::QueryAccelerationStructureProperties {
                acceleration_structures,
                queries,
            } => executor.query_acceleration_structure_properties(
                cx,
                acceleration_structures,
                queries,
            )?,
            Command::SerializeAccelerationStructure { dst, src } => {
                executor.serialize_acceleration_structure(cx, dst, src)?
            }
            Command::DeserializeAccelerationStructure { dst, src } => {
                executor.deserialize_acceleration_structure(cx, dst, src)?
            }
            Command::ConvertCooperativeVectorMatrix { conversions } => {
                executor.convert_cooperative_vector_matrix(cx, conversions)?
            }
            Command::SetBufferState { buffer, state } => cx.require_buffer_state(buffer, *state),
            Command::SetTextureState {
                texture,
                range,
                state,
            } => cx.require_texture_state(texture, *range, *state),
            Command::PushDebugGroup { name, color } => {
                executor.push_debug_group(cx, list.str(*name), *color)?
            }
            Command::PopDebugGroup => executor.pop_debug_group(cx)?,
            Command::InsertDebugMarker { name, color } => {
                executor.insert_debug_marker(cx, list.str(*name), *color)?
            }
            Command::WriteTimestamp { pool, index } => executor.write_timestamp(cx, pool, *index)?,
            Command::ExecuteCallback { callback } => (callback.0)(),
        }
    }

    if let Some(kind) = passes.active {
        tracing::warn!(?kind, "command list ended inside a pass");
    }
    if cx.capabilities.explicit_barriers {
        cx.tracker.require_default_states();
        executor.commit_barriers(cx)?;
    }
    cx.tracker.clear();
    Ok(())
}

fn binding_data_for<'l>(
    passes: &PassTracker,
    kind: PassKind,
    command: &Command,
    cx: &ExecuteContext<'l>,
) -> Option<&'l BindingData> {
    if !passes.is_active(kind) {
        cx.warn(&format!(
            "{} command recorded outside of a {kind:?} pass, skipped",
            command.name()
        ));
        return None;
    }
    let id = match command {
        Command::SetRenderState { binding_data, .. }
        | Command::SetComputeState { binding_data, .. }
        | Command::SetRayTracingState { binding_data, .. } => *binding_data,
        _ => return None,
    };
    let data = cx.list.binding_data(id);
    if data.is_none() {
        cx.warn(&format!("{} refers to missing binding data, skipped", command.name()));
    }
    data
}

/// Uploads the constants of every binding data record, then executes the recording.
pub(crate) fn execute_recording(
    device: &Device,
    stream: StreamHandle,
    recording: &mut Recording,
    staging_pages: &DualPageAllocator,
    submit_pages: &SubmitPageAllocator,
) -> Result<()> {
    let capabilities = device.capabilities();
    let Recording {
        list,
        constant_buffers,
        staging,
    } = recording;

    let mut constants = Vec::with_capacity(list.all_binding_data().len());
    for data in list.all_binding_data() {
        let bytes = if capabilities.parameter_blocks {
            data.parameter_block()
        } else {
            data.constants.clone()
        };
        constants.push(constant_buffers.push(device, &bytes)?);
    }
    constant_buffers.upload(stream)?;

    let mut cx = ExecuteContext {
        device,
        stream,
        list,
        capabilities,
        tracker: StateTracker::new(capabilities.acceleration_structure_sync),
        constants,
        staging,
        staging_pages,
        submit_pages,
    };
    let mut executor = device.backend().executor();
    execute(executor.as_mut(), &mut cx)
}
