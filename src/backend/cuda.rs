//! CUDA command translation.
//!
//! Work on a stream executes in order, so nothing is tracked and no barriers are issued.
//! Kernels receive one parameter block (see [`BindingData::parameter_block`]) uploaded through
//! the command buffer's constant buffer pool. Ray tracing and acceleration structures go
//! through OptiX style operations; everything raster or texture related is unsupported.

use crate::{
    Result,
    alloc::ConstantBufferAllocation,
    buffer::{Buffer, BufferOffset},
    command::{AccelerationStructureBuild, AccelerationStructureQuery},
    executor::{CommandExecutor, ExecuteContext, Rebind},
    native::NativeOp,
    pipeline::{BindingData, ComputePipeline, RayTracingPipeline},
    query::QueryPool,
    rtx::{AccelerationStructure, AccelerationStructureCopyMode, ShaderTable},
    utils::ResourceId,
};

pub(crate) struct CudaExecutor;

fn bind(
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

pub(super) fn write_properties(
    cx: &ExecuteContext<'_>,
    acceleration_structures: &[AccelerationStructure],
    queries: &[AccelerationStructureQuery],
) -> Result<()> {
    for (index, acceleration_structure) in acceleration_structures.iter().enumerate() {
        for query in queries {
            cx.enqueue(NativeOp::WriteAccelerationStructureProperty {
                src: acceleration_structure.device_address(),
                query: query.ty,
                dst: query.pool.slot_address(query.first_index + index as u32)?,
            })?;
        }
    }
    Ok(())
}

impl CommandExecutor for CudaExecutor {
    fn commit_barriers(&mut self, cx: &mut ExecuteContext<'_>) -> Result<()> {
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
        cx.enqueue(NativeOp::CopyMemory {
            dst: dst.device_address().offset(dst_offset),
            src: src.device_address().offset(src_offset),
            size,
        })
    }

    fn clear_buffer(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        buffer: &Buffer,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        cx.enqueue(NativeOp::FillMemory {
            dst: buffer.device_address().offset(offset),
            size,
            value: 0,
        })
    }

    fn upload_buffer_data(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let src = cx.stage_for_submission(data)?;
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
        cx.enqueue(NativeOp::CopyMemory {
            dst: buffer.device_address().offset(offset),
            src: pool.slot_address(index)?,
            size: count as u64 * 8,
        })
    }

    fn set_compute_state(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pipeline: &ComputePipeline,
        data: &BindingData,
        constants: ConstantBufferAllocation,
        rebind: Rebind,
    ) -> Result<bool> {
        bind(cx, pipeline.id(), data, constants, rebind)?;
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

    fn set_ray_tracing_state(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        pipeline: &RayTracingPipeline,
        _shader_table: &ShaderTable,
        data: &BindingData,
        constants: ConstantBufferAllocation,
        rebind: Rebind,
    ) -> Result<bool> {
        bind(cx, pipeline.id(), data, constants, rebind)?;
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
        cx.enqueue(NativeOp::BuildAccelerationStructure {
            dst: build.dst.device_address(),
            src: build.src.as_ref().map(|src| src.device_address()),
            scratch: build.scratch.address(),
            input_count: build.desc.inputs.len() as u32,
        })?;
        write_properties(cx, std::slice::from_ref(&build.dst), &build.queries)
    }

    fn copy_acceleration_structure(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &AccelerationStructure,
        src: &AccelerationStructure,
        mode: AccelerationStructureCopyMode,
    ) -> Result<()> {
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
        write_properties(cx, acceleration_structures, queries)
    }

    fn serialize_acceleration_structure(
        &mut self,
        cx: &mut ExecuteContext<'_>,
        dst: &BufferOffset,
        src: &AccelerationStructure,
    ) -> Result<()> {
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
        cx.enqueue(NativeOp::DeserializeAccelerationStructure {
            dst: dst.device_address(),
            src: src.address(),
        })
    }
}
