//! Command translation shared by the backends with explicit barriers.
//!
//! D3D12 and Vulkan record the same native operations and differ in how tracker barriers are
//! expressed, which is delegated to a [`BarrierTranslator`]. Capabilities only one of them
//! has are checked against [`BackendCapabilities`].

use crate::{
    Result,
    alloc::ConstantBufferAllocation,
    backend::BackendCapabilities,
    buffer::{Buffer, BufferOffset},
    command::{
        AccelerationStructureBuild, AccelerationStructureQuery, CooperativeVectorMatrixConversion,
        DrawArguments, DrawIndexedArguments, RenderPassDesc, RenderState, TextureClear,
        TextureCopy, TextureToBufferCopy, TextureUpload,
    },
    executor::{CommandExecutor, ExecuteContext, Rebind},
    native::{Barrier, NativeOp},
    pipeline::{BindingData, ComputePipeline, RayTracingPipeline, RenderPipeline},
    query::QueryPool,
    rtx::{AccelerationStructure, AccelerationStructureCopyMode, ShaderTable},
    texture::{SubresourceRange, TextureUsage},
    tracking::{ResourceState, StateTracker},
    utils::ResourceId,
};

use super::cuda::write_properties;

/// Expresses the barriers recorded by a [`StateTracker`] in native terms.
pub(crate) trait BarrierTranslator: Send {
    fn translate(&self, tracker: &StateTracker) -> Vec<Barrier>;
}

pub(crate) struct ExplicitExecutor<B> {
    capabilities: BackendCapabilities,
    barriers: B,
}

impl<B: BarrierTranslator> ExplicitExecutor<B> {
    pub fn new(capabilities: BackendCapabilities, barriers: B) -> Self {
        Self {
            capabilities,
            barriers,
        }
    }

    fn bind(
        &self,
        cx: &ExecuteContext<'_>,
        pipeline: ResourceId,
        data: &BindingData,
        constants: ConstantBufferAllocation,
        rebind: Rebind,
    ) -> Result<()> {
        if rebind.pipeline {
            cx.enqueue(NativeOp::BindPipeline { pipeline })?;
        }
        if rebind.arguments {
            cx.enqueue(NativeOp::BindArguments {
                constants: (!constants.is_empty()).then_some(constants.device),
                resource_count: data.resource_count(),
            })?;
        }
        Ok(())
    }

    fn require_acceleration_structure(
        cx: &mut ExecuteContext<'_>,
        acceleration_structure: &AccelerationStructure,
    ) {
        cx.require_buffer_state(
            acceleration_structure.storage(),
            ResourceState::AccelerationStructure,
        );
    }
}

impl<B: BarrierTranslator> CommandExecutor for ExplicitExecutor<B> {
    fn commit_barriers(&mut self, cx: &mut ExecuteContext<'_>) -> Result<()> {
        if !cx.tracker().has_barriers() {
            return Ok(());
        }
        for barrier in self.barriers.translate(cx.tracker()) {
            cx.enqueue(NativeOp::Barrier(barrier))?;
        }
        cx.tracker_mut().clear_barriers();
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &Buffer,
        dst_offset: u64,
        src: &Buffer,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        cx.require_buffer_state(dst, ResourceState::CopyDestination);
        cx.require_buffer_state(src, ResourceState::CopySource);
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::CopyMemory {
            dst: dst.device_address().offset(dst_offset),
            src: src.device_address().offset(src_offset),
            size,
        })
    }

    fn copy_texture(&mut self, cx: &mut ExecuteContext<'_>, copy: &TextureCopy) -> Result<()> {
        if !self.capabilities.texture_copies {
            return cx.unsupported("copyTexture");
        }
        cx.require_texture_state(&copy.dst, copy.dst_range, ResourceState::CopyDestination);
        cx.require_texture_state(&copy.src, copy.src_range, ResourceState::CopySource);
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::CopyTexture {
            dst: copy.dst.id(),
            dst_range: copy.dst_range.resolve(copy.dst.desc()),
            dst_offset: copy.dst_offset,
            src: copy.src.id(),
            src_range: copy.src_range.resolve(copy.src.desc()),
            src_offset: copy.src_offset,
            extent: copy.extent,
        })
    }

    fn copy_texture_to_buffer(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        copy: &TextureToBufferCopy,
    ) -> Result<()> {
        if !self.capabilities.texture_copies {
            return cx.unsupported("copyTextureToBuffer");
        }
        cx.require_buffer_state(&copy.dst, ResourceState::CopyDestination);
        cx.require_texture_state(&copy.src, copy.src_range, ResourceState::CopySource);
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::CopyTextureToBuffer {
            dst: copy.dst.device_address().offset(copy.dst_offset),
            row_pitch: copy.dst_row_pitch,
            src: copy.src.id(),
            src_range: copy.src_range.resolve(copy.src.desc()),
            src_offset: copy.src_offset,
            extent: copy.extent,
        })
    }

    fn clear_buffer(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        buffer: &Buffer,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        cx.require_buffer_state(buffer, ResourceState::CopyDestination);
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::FillMemory {
            dst: buffer.device_address().offset(offset),
            size,
            value: 0,
        })
    }

    fn clear_texture(&mut self, cx: &mut ExecuteContext<'_>, clear: &TextureClear) -> Result<()> {
        let state = if clear.depth || clear.stencil {
            ResourceState::DepthWrite
        } else if clear.texture.usage().contains(TextureUsage::RENDER_TARGET) {
            ResourceState::RenderTarget
        } else {
            ResourceState::UnorderedAccess
        };
        cx.require_texture_state(&clear.texture, clear.range, state);
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::ClearTexture {
            texture: clear.texture.id(),
            range: clear.range.resolve(clear.texture.desc()),
            value: clear.value,
            depth: clear.depth,
            stencil: clear.stencil,
        })
    }

    fn upload_texture_data(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        upload: &TextureUpload,
        data: &[u8],
    ) -> Result<()> {
        cx.require_texture_state(&upload.dst, upload.range, ResourceState::CopyDestination);
        self.commit_barriers(cx)?;
        let src = cx.stage_for_command_buffer(data)?;
        cx.enqueue(NativeOp::UploadTexture {
            dst: upload.dst.id(),
            range: upload.range.resolve(upload.dst.desc()),
            offset: upload.offset,
            extent: upload.extent,
            src,
            size: data.len() as u64,
        })
    }

    fn upload_buffer_data(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        cx.require_buffer_state(dst, ResourceState::CopyDestination);
        self.commit_barriers(cx)?;
        let src = cx.stage_for_command_buffer(data)?;
        cx.enqueue(NativeOp::UploadMemory {
            dst: dst.device_address().offset(offset),
            src,
            size: data.len() as u64,
        })
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
        cx.require_buffer_state(buffer, ResourceState::CopyDestination);
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::CopyMemory {
            dst: buffer.device_address().offset(offset),
            src: pool.slot_address(index)?,
            size: count as u64 * 8,
        })
    }

    fn begin_render_pass(&mut self, cx: &mut ExecuteContext<'_>, desc: &RenderPassDesc) -> Result<()> {
        if !self.capabilities.render_passes {
            return cx.unsupported("beginRenderPass");
        }
        for attachment in &desc.color_attachments {
            cx.require_texture_state(
                &attachment.texture,
                attachment.range,
                ResourceState::RenderTarget,
            );
            if let Some(resolve) = &attachment.resolve_target {
                cx.require_texture_state(
                    resolve,
                    SubresourceRange::ENTIRE,
                    ResourceState::ResolveDestination,
                );
            }
        }
        if let Some(depth) = &desc.depth_stencil_attachment {
            let state = if depth.depth_read_only {
                ResourceState::DepthRead
            } else {
                ResourceState::DepthWrite
            };
            cx.require_texture_state(&depth.texture, depth.range, state);
        }
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::BeginRenderPass {
            color_targets: desc
                .color_attachments
                .iter()
                .map(|attachment| attachment.texture.id())
                .collect(),
            depth_target: desc
                .depth_stencil_attachment
                .as_ref()
                .map(|depth| depth.texture.id()),
        })
    }

    fn end_render_pass(&mut self, cx: &mut ExecuteContext<'_>) -> Result<()> {
        cx.enqueue(NativeOp::EndRenderPass)
    }

    fn set_render_state(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pipeline: &RenderPipeline,
        state: &RenderState,
        data: &BindingData,
        constants: ConstantBufferAllocation,
        rebind: Rebind,
    ) -> Result<bool> {
        if pipeline.uses_mesh_shader() && !self.capabilities.mesh_shaders {
            cx.unsupported("setRenderState")?;
            return Ok(false);
        }
        cx.require_binding_states(data);
        for vertex_buffer in &state.vertex_buffers {
            cx.require_buffer_state(&vertex_buffer.buffer, ResourceState::VertexBuffer);
        }
        if let Some((index_buffer, _)) = &state.index_buffer {
            cx.require_buffer_state(&index_buffer.buffer, ResourceState::IndexBuffer);
        }
        self.commit_barriers(cx)?;
        self.bind(cx, pipeline.id(), data, constants, rebind)?;
        cx.enqueue(NativeOp::SetRenderState {
            vertex_buffers: state
                .vertex_buffers
                .iter()
                .map(BufferOffset::address)
                .collect(),
            index_buffer: state
                .index_buffer
                .as_ref()
                .map(|(buffer, _)| buffer.address()),
            viewports: state.viewports.len() as u32,
            scissor_rects: state.scissor_rects.len() as u32,
        })?;
        Ok(true)
    }

    fn draw(&mut self, cx: &mut ExecuteContext<'_>, args: &DrawArguments) -> Result<()> {
        cx.enqueue(NativeOp::Draw {
            vertex_count: args.vertex_count,
            instance_count: args.instance_count,
            first_vertex: args.first_vertex,
            first_instance: args.first_instance,
        })
    }

    fn draw_indexed(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        args: &DrawIndexedArguments,
    ) -> Result<()> {
        cx.enqueue(NativeOp::DrawIndexed {
            index_count: args.index_count,
            instance_count: args.instance_count,
            first_index: args.first_index,
            base_vertex: args.base_vertex,
            first_instance: args.first_instance,
        })
    }

    fn draw_indirect(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        max_draw_count: u32,
        args: &BufferOffset,
        count: Option<&BufferOffset>,
    ) -> Result<()> {
        indirect_draw(self, cx, false, max_draw_count, args, count)
    }

    fn draw_indexed_indirect(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        max_draw_count: u32,
        args: &BufferOffset,
        count: Option<&BufferOffset>,
    ) -> Result<()> {
        indirect_draw(self, cx, true, max_draw_count, args, count)
    }

    fn draw_mesh_tasks(&mut self, cx: &mut ExecuteContext<'_>, x: u32, y: u32, z: u32) -> Result<()> {
        if !self.capabilities.mesh_shaders {
            return cx.unsupported("drawMeshTasks");
        }
        cx.enqueue(NativeOp::DrawMeshTasks { x, y, z })
    }

    fn set_compute_state(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pipeline: &ComputePipeline,
        data: &BindingData,
        constants: ConstantBufferAllocation,
        rebind: Rebind,
    ) -> Result<bool> {
        cx.require_binding_states(data);
        self.commit_barriers(cx)?;
        self.bind(cx, pipeline.id(), data, constants, rebind)?;
        Ok(true)
    }

    fn dispatch_compute(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pipeline: &ComputePipeline,
        x: u32,
        y: u32,
        z: u32,
    ) -> Result<()> {
        cx.enqueue(NativeOp::Dispatch {
            grid: [x, y, z],
            block: pipeline.thread_group_size(),
        })
    }

    fn dispatch_compute_indirect(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        args: &BufferOffset,
    ) -> Result<()> {
        if !self.capabilities.indirect_dispatch {
            return cx.unsupported("dispatchComputeIndirect");
        }
        cx.require_buffer_state(&args.buffer, ResourceState::IndirectArgument);
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::DispatchIndirect {
            args: args.address(),
        })
    }

    fn set_ray_tracing_state(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pipeline: &RayTracingPipeline,
        _shader_table: &ShaderTable,
        data: &BindingData,
        constants: ConstantBufferAllocation,
        rebind: Rebind,
    ) -> Result<bool> {
        if !self.capabilities.ray_tracing {
            cx.unsupported("setRayTracingState")?;
            return Ok(false);
        }
        cx.require_binding_states(data);
        self.commit_barriers(cx)?;
        self.bind(cx, pipeline.id(), data, constants, rebind)?;
        Ok(true)
    }

    fn dispatch_rays(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        _shader_table: &ShaderTable,
        raygen: u32,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<()> {
        cx.enqueue(NativeOp::DispatchRays {
            raygen,
            extent: [width, height, depth],
        })
    }

    fn build_acceleration_structure(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        build: &AccelerationStructureBuild,
    ) -> Result<()> {
        for input in &build.desc.inputs {
            for buffer in input.buffers() {
                cx.require_buffer_state(buffer, ResourceState::AccelerationStructureBuildInput);
            }
        }
        cx.require_buffer_state(&build.scratch.buffer, ResourceState::UnorderedAccess);
        if let Some(src) = &build.src {
            Self::require_acceleration_structure(cx, src);
        }
        Self::require_acceleration_structure(cx, &build.dst);
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::BuildAccelerationStructure {
            dst: build.dst.device_address(),
            src: build.src.as_ref().map(|src| src.device_address()),
            scratch: build.scratch.address(),
            input_count: build.desc.inputs.len() as u32,
        })?;
        if !build.queries.is_empty() {
            // Properties are read from the finished build.
            Self::require_acceleration_structure(cx, &build.dst);
            self.commit_barriers(cx)?;
            write_properties(cx, std::slice::from_ref(&build.dst), &build.queries)?;
        }
        Ok(())
    }

    fn copy_acceleration_structure(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &AccelerationStructure,
        src: &AccelerationStructure,
        mode: AccelerationStructureCopyMode,
    ) -> Result<()> {
        Self::require_acceleration_structure(cx, src);
        Self::require_acceleration_structure(cx, dst);
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::CopyAccelerationStructure {
            dst: dst.device_address(),
            src: src.device_address(),
            mode,
        })
    }

    fn query_acceleration_structure_properties(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        acceleration_structures: &[AccelerationStructure],
        queries: &[AccelerationStructureQuery],
    ) -> Result<()> {
        for acceleration_structure in acceleration_structures {
            Self::require_acceleration_structure(cx, acceleration_structure);
        }
        self.commit_barriers(cx)?;
        write_properties(cx, acceleration_structures, queries)
    }

    fn serialize_acceleration_structure(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &BufferOffset,
        src: &AccelerationStructure,
    ) -> Result<()> {
        cx.require_buffer_state(&dst.buffer, ResourceState::UnorderedAccess);
        Self::require_acceleration_structure(cx, src);
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::SerializeAccelerationStructure {
            dst: dst.address(),
            src: src.device_address(),
        })
    }

    fn deserialize_acceleration_structure(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &AccelerationStructure,
        src: &BufferOffset,
    ) -> Result<()> {
        cx.require_buffer_state(&src.buffer, ResourceState::ShaderResource);
        Self::require_acceleration_structure(cx, dst);
        self.commit_barriers(cx)?;
        cx.enqueue(NativeOp::DeserializeAccelerationStructure {
            dst: dst.device_address(),
            src: src.address(),
        })
    }

    fn convert_cooperative_vector_matrix(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        conversions: &[CooperativeVectorMatrixConversion],
    ) -> Result<()> {
        if !self.capabilities.cooperative_vectors {
            return cx.unsupported("convertCooperativeVectorMatrix");
        }
        for conversion in conversions {
            cx.require_buffer_state(&conversion.src.buffer, ResourceState::CopySource);
            cx.require_buffer_state(&conversion.dst.buffer, ResourceState::CopyDestination);
        }
        self.commit_barriers(cx)?;
        for conversion in conversions {
            cx.enqueue(NativeOp::ConvertCooperativeVectorMatrix {
                src: conversion.src.address(),
                src_size: conversion.src_size,
                dst: conversion.dst.address(),
                dst_size: conversion.dst_size,
                rows: conversion.rows,
                columns: conversion.columns,
            })?;
        }
        Ok(())
    }

    fn push_debug_group(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        name: &str,
        color: [f32; 3],
    ) -> Result<()> {
        if !self.capabilities.debug_labels {
            return cx.unsupported("pushDebugGroup");
        }
        cx.enqueue(NativeOp::PushDebugGroup {
            name: name.to_owned(),
            color,
        })
    }

    fn pop_debug_group(&mut self, cx: &mut ExecuteContext<'_>) -> Result<()> {
        if !self.capabilities.debug_labels {
            return cx.unsupported("popDebugGroup");
        }
        cx.enqueue(NativeOp::PopDebugGroup)
    }

    fn insert_debug_marker(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        name: &str,
        color: [f32; 3],
    ) -> Result<()> {
        if !self.capabilities.debug_labels {
            return cx.unsupported("insertDebugMarker");
        }
        cx.enqueue(NativeOp::InsertDebugMarker {
            name: name.to_owned(),
            color,
        })
    }

    fn write_timestamp(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pool: &QueryPool,
        index: u32,
    ) -> Result<()> {
        if !self.capabilities.timestamps {
            return cx.unsupported("writeTimestamp");
        }
        cx.enqueue(NativeOp::WriteTimestamp {
            dst: pool.slot_address(index)?,
        })
    }
}

fn indirect_draw<B: BarrierTranslator>(
    executor: &mut ExplicitExecutor<B>,
    cx: &mut ExecuteContext<'_>,
    indexed: bool,
    max_draw_count: u32,
    args: &BufferOffset,
    count: Option<&BufferOffset>,
) -> Result<()> {
    cx.require_buffer_state(&args.buffer, ResourceState::IndirectArgument);
    if let Some(count) = count {
        cx.require_buffer_state(&count.buffer, ResourceState::IndirectArgument);
    }
    executor.commit_barriers(cx)?;
    cx.enqueue(NativeOp::DrawIndirect {
        indexed,
        max_draw_count,
        args: args.address(),
        count: count.map(BufferOffset::address),
    })
}
