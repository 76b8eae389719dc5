//! Compute passes and cooperative vector conversions.

use crate::{
    Error, Result,
    buffer::{Buffer, BufferOffset},
    pipeline::{ComputePipeline, ShaderObject},
};

use super::{Command, CommandEncoder, CooperativeVectorMatrixConversion};

/// Size of the `(x, y, z)` thread-group counts an indirect dispatch reads.
const DISPATCH_ARGUMENTS_SIZE: u64 = 12;

pub(super) fn check_buffer_range(buffer: &Buffer, offset: u64, size: u64) -> Result<()> {
    if offset
        .checked_add(size)
        .is_some_and(|end| end <= buffer.size())
    {
        Ok(())
    } else {
        Err(Error::InvalidArgument("buffer range is out of bounds"))
    }
}

impl CommandEncoder {
    pub fn begin_compute_pass(&mut self) -> ComputePassEncoder<'_> {
        self.invalidate_bindings();
        self.push(Command::BeginComputePass);
        ComputePassEncoder {
            encoder: self,
            pipeline: None,
        }
    }

    /// Converts matrices between cooperative vector layouts.
    pub fn convert_cooperative_vector_matrix(
        &mut self,
        conversions: &[CooperativeVectorMatrixConversion],
    ) -> Result<()> {
        for conversion in conversions {
            check_buffer_range(&conversion.src.buffer, conversion.src.offset, conversion.src_size)?;
            check_buffer_range(&conversion.dst.buffer, conversion.dst.offset, conversion.dst_size)?;
        }
        if conversions.is_empty() {
            return Ok(());
        }
        self.push(Command::ConvertCooperativeVectorMatrix {
            conversions: conversions.to_vec(),
        });
        Ok(())
    }
}

/// Records compute work. The pass ends when the encoder is dropped.
pub struct ComputePassEncoder<'a> {
    encoder: &'a mut CommandEncoder,
    pipeline: Option<ComputePipeline>,
}

impl ComputePassEncoder<'_> {
    /// Binds `pipeline` and returns its cleared root object.
    pub fn bind_pipeline(&mut self, pipeline: &ComputePipeline) -> &mut ShaderObject {
        self.pipeline = Some(pipeline.clone());
        self.encoder.rebind_root()
    }

    /// The root object of the bound pipeline.
    pub fn root(&mut self) -> &mut ShaderObject {
        &mut self.encoder.root
    }

    fn prepare(&mut self) -> Result<()> {
        let pipeline = self
            .pipeline
            .clone()
            .ok_or(Error::InvalidArgument("no compute pipeline bound"))?;
        let (binding_data, fresh) = self.encoder.resolve_bindings(pipeline.id())?;
        if fresh {
            self.encoder.push(Command::SetComputeState {
                pipeline,
                binding_data,
            });
        }
        Ok(())
    }

    /// Dispatches `x * y * z` thread groups.
    pub fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.prepare()?;
        self.encoder.push(Command::DispatchCompute { x, y, z });
        Ok(())
    }

    /// Dispatches with thread-group counts read from `args`.
    pub fn dispatch_compute_indirect(&mut self, args: &Buffer, offset: u64) -> Result<()> {
        check_buffer_range(args, offset, DISPATCH_ARGUMENTS_SIZE)?;
        self.prepare()?;
        self.encoder.push(Command::DispatchComputeIndirect {
            args: BufferOffset::new(args, offset),
        });
        Ok(())
    }

    pub fn end(self) {}
}

impl Drop for ComputePassEncoder<'_> {
    fn drop(&mut self) {
        self.encoder.push(Command::EndComputePass);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        Backend, Device,
        buffer::{BufferDesc, BufferUsage},
        command::Command,
        native::{HostDriver, NativeOp},
        pipeline::{BindingAccess, ComputePipelineDesc},
        queue::SubmitDesc,
    };

    #[test]
    fn kernels_run_with_their_thread_group_size() {
        let driver = Arc::new(HostDriver::new());
        let device = Device::builder(Backend::Cuda)
            .driver(driver.clone())
            .build()
            .unwrap();
        let queue = device.create_queue().unwrap();
        let pipeline = device
            .create_compute_pipeline(ComputePipelineDesc {
                entry_point: "scale".into(),
                thread_group_size: [32, 2, 1],
                ..Default::default()
            })
            .unwrap();
        let data = device
            .create_buffer(
                &BufferDesc {
                    size: 256,
                    usage: BufferUsage::UNORDERED_ACCESS,
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        let mut encoder = queue.create_command_encoder().unwrap();
        let mut pass = encoder.begin_compute_pass();
        pass.bind_pipeline(&pipeline)
            .set_buffer(0, &data, BindingAccess::ReadWrite);
        pass.dispatch_compute(4, 2, 1).unwrap();
        assert!(pass.dispatch_compute_indirect(&data, 250).is_err());
        pass.end();
        queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();

        let dispatch = driver
            .ops_on(queue.stream())
            .into_iter()
            .find(|op| matches!(op, NativeOp::Dispatch { .. }));
        assert_eq!(
            dispatch,
            Some(NativeOp::Dispatch {
                grid: [4, 2, 1],
                block: [32, 2, 1],
            })
        );
    }

    #[test]
    fn empty_conversions_record_nothing() {
        let (_device, queue) = Device::create_host_default(Backend::Vulkan).unwrap();
        let mut encoder = queue.create_command_encoder().unwrap();
        encoder.convert_cooperative_vector_matrix(&[]).unwrap();
        assert!(
            !encoder
                .list()
                .commands()
                .iter()
                .any(|command| matches!(command, Command::ConvertCooperativeVectorMatrix { .. }))
        );
    }
}
