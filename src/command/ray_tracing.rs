//! Ray tracing passes and acceleration structure commands.

use crate::{
    Error, Result,
    buffer::BufferOffset,
    pipeline::{RayTracingPipeline, ShaderObject},
    query::QueryType,
    rtx::{
        AccelerationStructure, AccelerationStructureBuildDesc, AccelerationStructureCopyMode,
        BuildMode, ShaderTable,
    },
};

use super::{
    AccelerationStructureBuild, AccelerationStructureQuery, Command, CommandEncoder,
    compute::check_buffer_range,
};

fn check_queries(queries: &[AccelerationStructureQuery], structure_count: u32) -> Result<()> {
    for query in queries {
        if query.ty == QueryType::Timestamp || query.pool.ty() != query.ty {
            return Err(Error::InvalidArgument(
                "query type does not match an acceleration structure property pool",
            ));
        }
        if query
            .first_index
            .checked_add(structure_count)
            .is_none_or(|end| end > query.pool.count())
        {
            return Err(Error::InvalidArgument("query range out of range"));
        }
    }
    Ok(())
}

impl CommandEncoder {
    pub fn begin_ray_tracing_pass(&mut self) -> RayTracingPassEncoder<'_> {
        self.invalidate_bindings();
        self.push(Command::BeginRayTracingPass);
        RayTracingPassEncoder {
            encoder: self,
            pipeline: None,
        }
    }

    /// Builds `dst` from the inputs of `desc`, or updates it from `src`.
    ///
    /// Each query receives the property of `dst` after the build.
    pub fn build_acceleration_structure(
        &mut self,
        desc: &AccelerationStructureBuildDesc,
        dst: &AccelerationStructure,
        src: Option<&AccelerationStructure>,
        scratch: BufferOffset,
        queries: &[AccelerationStructureQuery],
    ) -> Result<()> {
        if desc.kind()? != dst.kind() {
            return Err(Error::InvalidArgument(
                "build inputs do not match the acceleration structure kind",
            ));
        }
        if desc.mode == BuildMode::Update && src.is_none() {
            return Err(Error::InvalidArgument("an update needs a source structure"));
        }
        if scratch.offset > scratch.buffer.size() {
            return Err(Error::InvalidArgument("scratch offset is out of bounds"));
        }
        check_queries(queries, 1)?;
        self.push(Command::BuildAccelerationStructure(AccelerationStructureBuild {
            desc: desc.clone(),
            dst: dst.clone(),
            src: src.cloned(),
            scratch,
            queries: queries.to_vec(),
        }));
        Ok(())
    }

    pub fn copy_acceleration_structure(
        &mut self,
        dst: &AccelerationStructure,
        src: &AccelerationStructure,
        mode: AccelerationStructureCopyMode,
    ) -> Result<()> {
        if dst.kind() != src.kind() {
            return Err(Error::InvalidArgument(
                "acceleration structure kinds do not match",
            ));
        }
        self.push(Command::CopyAccelerationStructure {
            dst: dst.clone(),
            src: src.clone(),
            mode,
        });
        Ok(())
    }

    /// Writes the properties of every structure into consecutive slots of each query.
    pub fn query_acceleration_structure_properties(
        &mut self,
        acceleration_structures: &[AccelerationStructure],
        queries: &[AccelerationStructureQuery],
    ) -> Result<()> {
        check_queries(queries, acceleration_structures.len() as u32)?;
        self.push(Command::QueryAccelerationStructureProperties {
            acceleration_structures: acceleration_structures.to_vec(),
            queries: queries.to_vec(),
        });
        Ok(())
    }

    pub fn serialize_acceleration_structure(
        &mut self,
        dst: BufferOffset,
        src: &AccelerationStructure,
    ) -> Result<()> {
        check_buffer_range(&dst.buffer, dst.offset, 0)?;
        self.push(Command::SerializeAccelerationStructure {
            dst,
            src: src.clone(),
        });
        Ok(())
    }

    pub fn deserialize_acceleration_structure(
        &mut self,
        dst: &AccelerationStructure,
        src: BufferOffset,
    ) -> Result<()> {
        check_buffer_range(&src.buffer, src.offset, 0)?;
        self.push(Command::DeserializeAccelerationStructure {
            dst: dst.clone(),
            src,
        });
        Ok(())
    }
}

/// Records ray dispatches. The pass ends when the encoder is dropped.
pub struct RayTracingPassEncoder<'a> {
    encoder: &'a mut CommandEncoder,
    pipeline: Option<(RayTracingPipeline, ShaderTable)>,
}

impl RayTracingPassEncoder<'_> {
    /// Binds `pipeline` with the shaders of `shader_table` and returns the cleared root
    /// object.
    pub fn bind_pipeline(
        &mut self,
        pipeline: &RayTracingPipeline,
        shader_table: &ShaderTable,
    ) -> Result<&mut ShaderObject> {
        if shader_table.pipeline() != pipeline {
            return Err(Error::InvalidArgument(
                "shader table was created for another pipeline",
            ));
        }
        self.pipeline = Some((pipeline.clone(), shader_table.clone()));
        Ok(self.encoder.rebind_root())
    }

    pub fn root(&mut self) -> &mut ShaderObject {
        &mut self.encoder.root
    }

    /// Launches `width * height * depth` rays from the ray generation shader `raygen` of the
    /// bound shader table.
    pub fn dispatch_rays(&mut self, raygen: u32, width: u32, height: u32, depth: u32) -> Result<()> {
        let (pipeline, shader_table) = self
            .pipeline
            .clone()
            .ok_or(Error::InvalidArgument("no ray tracing pipeline bound"))?;
        if raygen >= shader_table.raygen_count() {
            return Err(Error::InvalidArgument("raygen index out of range"));
        }
        let (binding_data, fresh) = self.encoder.resolve_bindings(pipeline.id())?;
        if fresh {
            self.encoder.push(Command::SetRayTracingState {
                pipeline,
                shader_table,
                binding_data,
            });
        }
        self.encoder.push(Command::DispatchRays {
            raygen,
            width,
            height,
            depth,
        });
        Ok(())
    }

    pub fn end(self) {}
}

impl Drop for RayTracingPassEncoder<'_> {
    fn drop(&mut self) {
        self.encoder.push(Command::EndRayTracingPass);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        Backend, Device,
        buffer::{BufferDesc, BufferOffset, BufferUsage},
        command::{AccelerationStructureQuery, Command},
        native::{HostDriver, NativeOp},
        pipeline::RayTracingPipelineDesc,
        query::{QueryPoolDesc, QueryType},
        queue::SubmitDesc,
        rtx::{
            AccelerationStructureBuildDesc, AccelerationStructureDesc, AccelerationStructureKind,
            BuildInput, BuildMode, ShaderTableDesc,
        },
    };

    fn triangles(device: &Device) -> AccelerationStructureBuildDesc {
        let vertices = device
            .create_buffer(
                &BufferDesc {
                    size: 36,
                    usage: BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        AccelerationStructureBuildDesc {
            inputs: vec![BuildInput::Triangles {
                vertices: BufferOffset::new(&vertices, 0),
                vertex_count: 3,
                vertex_stride: 12,
                indices: None,
                index_count: 0,
            }],
            ..Default::default()
        }
    }

    fn scratch(device: &Device) -> BufferOffset {
        let buffer = device
            .create_buffer(
                &BufferDesc {
                    size: 4096,
                    usage: BufferUsage::UNORDERED_ACCESS,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        BufferOffset::new(&buffer, 0)
    }

    #[test]
    fn builds_are_validated() {
        let (device, queue) = Device::create_host_default(Backend::Cuda).unwrap();
        let tlas = device
            .create_acceleration_structure(AccelerationStructureDesc {
                kind: AccelerationStructureKind::TopLevel,
                size: 1024,
                label: None,
            })
            .unwrap();
        let blas = device
            .create_acceleration_structure(AccelerationStructureDesc {
                kind: AccelerationStructureKind::BottomLevel,
                size: 1024,
                label: None,
            })
            .unwrap();
        let desc = triangles(&device);
        let mut encoder = queue.create_command_encoder().unwrap();
        assert!(encoder
            .build_acceleration_structure(&desc, &tlas, None, scratch(&device), &[])
            .is_err());
        let update = AccelerationStructureBuildDesc {
            mode: BuildMode::Update,
            ..desc.clone()
        };
        assert!(encoder
            .build_acceleration_structure(&update, &blas, None, scratch(&device), &[])
            .is_err());
        assert!(encoder
            .copy_acceleration_structure(&tlas, &blas, crate::rtx::AccelerationStructureCopyMode::Clone)
            .is_err());
        assert!(encoder.list().is_empty());
    }

    #[test]
    fn build_queries_report_the_compacted_size() {
        let driver = Arc::new(HostDriver::new());
        let device = Device::builder(Backend::Cuda)
            .driver(driver.clone())
            .build()
            .unwrap();
        let queue = device.create_queue().unwrap();
        let blas = device
            .create_acceleration_structure(AccelerationStructureDesc {
                kind: AccelerationStructureKind::BottomLevel,
                size: 1024,
                label: None,
            })
            .unwrap();
        let pool = device
            .create_query_pool(QueryPoolDesc {
                ty: QueryType::AccelerationStructureCompactedSize,
                count: 2,
                label: None,
            })
            .unwrap();
        let query = AccelerationStructureQuery {
            ty: QueryType::AccelerationStructureCompactedSize,
            pool: pool.clone(),
            first_index: 1,
        };

        let mut encoder = queue.create_command_encoder().unwrap();
        encoder
            .build_acceleration_structure(
                &triangles(&device),
                &blas,
                None,
                scratch(&device),
                std::slice::from_ref(&query),
            )
            .unwrap();
        assert!(encoder
            .query_acceleration_structure_properties(&[blas.clone(), blas.clone()], &[query])
            .is_err());
        queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
        queue.wait_on_host().unwrap();

        let ops = driver.ops_on(queue.stream());
        assert!(matches!(
            ops.as_slice(),
            [
                NativeOp::BuildAccelerationStructure { .. },
                NativeOp::WriteAccelerationStructureProperty {
                    query: QueryType::AccelerationStructureCompactedSize,
                    ..
                }
            ]
        ));
        assert_eq!(
            ops[1],
            NativeOp::WriteAccelerationStructureProperty {
                src: blas.device_address(),
                query: QueryType::AccelerationStructureCompactedSize,
                dst: pool.slot_address(1).unwrap(),
            }
        );
    }

    #[test]
    fn dispatches_need_a_matching_shader_table() {
        let (device, queue) = Device::create_host_default(Backend::Vulkan).unwrap();
        let desc = RayTracingPipelineDesc {
            raygen_entry_points: vec!["primary".into(), "shadow".into()],
            ..Default::default()
        };
        let pipeline = device.create_ray_tracing_pipeline(desc.clone()).unwrap();
        let other = device.create_ray_tracing_pipeline(desc).unwrap();
        let table = device
            .create_shader_table(
                &pipeline,
                ShaderTableDesc {
                    raygen: vec!["primary".into()],
                    ..Default::default()
                },
            )
            .unwrap();

        let mut encoder = queue.create_command_encoder().unwrap();
        let mut pass = encoder.begin_ray_tracing_pass();
        assert!(pass.dispatch_rays(0, 8, 8, 1).is_err());
        assert!(pass.bind_pipeline(&other, &table).is_err());
        pass.bind_pipeline(&pipeline, &table).unwrap();
        assert!(pass.dispatch_rays(1, 8, 8, 1).is_err());
        pass.dispatch_rays(0, 8, 8, 1).unwrap();
        pass.end();

        let names: Vec<&str> = encoder.list().commands().iter().map(Command::name).collect();
        assert_eq!(
            names,
            [
                "beginRayTracingPass",
                "setRayTracingState",
                "dispatchRays",
                "endRayTracingPass"
            ]
        );
    }
}
