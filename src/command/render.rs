//! Render passes.
//!
//! A render pass draws into the color and depth-stencil attachments named by its
//! [`RenderPassDesc`]. Draws use the bound [`RenderPipeline`] with the current
//! [`RenderState`] (vertex and index buffers, viewports, scissor rectangles).
//!
//! ```
//! # use scoria::{Backend, Device, command::*, pipeline::RenderPipelineDesc};
//! # use scoria::texture::{TextureDesc, TextureUsage, SubresourceRange, Extent3d};
//! # use scoria::tracking::ResourceState;
//! # let (device, queue) = Device::create_host_default(Backend::D3D12).unwrap();
//! let target = device
//!     .create_texture(
//!         &TextureDesc {
//!             size: Extent3d::new(64, 64, 1),
//!             usage: TextureUsage::RENDER_TARGET,
//!             default_state: ResourceState::RenderTarget,
//!             ..Default::default()
//!         },
//!         None,
//!     )
//!     .unwrap();
//! let pipeline = device
//!     .create_render_pipeline(RenderPipelineDesc {
//!         vertex_entry_point: Some("vs".into()),
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! let mut encoder = queue.create_command_encoder().unwrap();
//! let mut pass = encoder
//!     .begin_render_pass(&RenderPassDesc {
//!         color_attachments: [ColorAttachment {
//!             texture: target.clone(),
//!             range: SubresourceRange::ENTIRE,
//!             resolve_target: None,
//!             load_op: LoadOp::Clear,
//!             store_op: StoreOp::Store,
//!             clear_value: [0.0, 0.0, 0.0, 1.0],
//!         }]
//!         .into_iter()
//!         .collect(),
//!         depth_stencil_attachment: None,
//!     })
//!     .unwrap();
//! pass.bind_pipeline(&pipeline);
//! pass.draw(DrawArguments { vertex_count: 3, instance_count: 1, ..Default::default() }).unwrap();
//! pass.end();
//! ```

use crate::{
    Error, Result,
    buffer::{Buffer, BufferOffset},
    pipeline::{RenderPipeline, ShaderObject},
};

use super::{
    Command, CommandEncoder, DrawArguments, DrawIndexedArguments, RenderPassDesc, RenderState,
    compute::check_buffer_range,
};

/// Size of one indirect draw record.
const DRAW_ARGUMENTS_SIZE: u64 = 16;
const DRAW_INDEXED_ARGUMENTS_SIZE: u64 = 20;

impl CommandEncoder {
    /// Begins a render pass over the attachments of `desc`.
    pub fn begin_render_pass(&mut self, desc: &RenderPassDesc) -> Result<RenderPassEncoder<'_>> {
        for attachment in &desc.color_attachments {
            if !attachment.range.fits(attachment.texture.desc()) {
                return Err(Error::InvalidArgument(
                    "color attachment range is out of bounds",
                ));
            }
        }
        if let Some(attachment) = &desc.depth_stencil_attachment {
            if !attachment.texture.desc().format.is_depth() {
                return Err(Error::InvalidArgument(
                    "depth-stencil attachment needs a depth format",
                ));
            }
            if !attachment.range.fits(attachment.texture.desc()) {
                return Err(Error::InvalidArgument(
                    "depth-stencil attachment range is out of bounds",
                ));
            }
        }
        self.invalidate_bindings();
        self.push(Command::BeginRenderPass { desc: desc.clone() });
        Ok(RenderPassEncoder {
            encoder: self,
            pipeline: None,
            state: RenderState::default(),
            state_dirty: true,
        })
    }
}

/// Records draws. The pass ends when the encoder is dropped.
pub struct RenderPassEncoder<'a> {
    encoder: &'a mut CommandEncoder,
    pipeline: Option<RenderPipeline>,
    state: RenderState,
    state_dirty: bool,
}

impl RenderPassEncoder<'_> {
    /// Binds `pipeline` and returns its cleared root object.
    pub fn bind_pipeline(&mut self, pipeline: &RenderPipeline) -> &mut ShaderObject {
        self.pipeline = Some(pipeline.clone());
        self.encoder.rebind_root()
    }

    pub fn root(&mut self) -> &mut ShaderObject {
        &mut self.encoder.root
    }

    /// Replaces the fixed-function state used by the following draws.
    pub fn set_render_state(&mut self, state: RenderState) -> Result<()> {
        let buffers = state
            .vertex_buffers
            .iter()
            .chain(state.index_buffer.as_ref().map(|(index, _)| index));
        for binding in buffers {
            if binding.offset > binding.buffer.size() {
                return Err(Error::InvalidArgument("buffer offset is out of bounds"));
            }
        }
        self.state = state;
        self.state_dirty = true;
        Ok(())
    }

    pub fn render_state(&self) -> &RenderState {
        &self.state
    }

    fn prepare(&mut self) -> Result<()> {
        let pipeline = self
            .pipeline
            .clone()
            .ok_or(Error::InvalidArgument("no render pipeline bound"))?;
        let (binding_data, fresh) = self.encoder.resolve_bindings(pipeline.id())?;
        if fresh || self.state_dirty {
            self.encoder.push(Command::SetRenderState {
                pipeline,
                state: self.state.clone(),
                binding_data,
            });
            self.state_dirty = false;
        }
        Ok(())
    }

    pub fn draw(&mut self, args: DrawArguments) -> Result<()> {
        self.prepare()?;
        self.encoder.push(Command::Draw(args));
        Ok(())
    }

    pub fn draw_indexed(&mut self, args: DrawIndexedArguments) -> Result<()> {
        if self.state.index_buffer.is_none() {
            return Err(Error::InvalidArgument("indexed draws need an index buffer"));
        }
        self.prepare()?;
        self.encoder.push(Command::DrawIndexed(args));
        Ok(())
    }

    /// Draws up to `max_draw_count` records from `args`, or as many as `count` holds.
    pub fn draw_indirect(
        &mut self,
        max_draw_count: u32,
        args: &Buffer,
        offset: u64,
        count: Option<BufferOffset>,
    ) -> Result<()> {
        check_indirect(args, offset, max_draw_count, DRAW_ARGUMENTS_SIZE, count.as_ref())?;
        self.prepare()?;
        self.encoder.push(Command::DrawIndirect {
            max_draw_count,
            args: BufferOffset::new(args, offset),
            count,
        });
        Ok(())
    }

    pub fn draw_indexed_indirect(
        &mut self,
        max_draw_count: u32,
        args: &Buffer,
        offset: u64,
        count: Option<BufferOffset>,
    ) -> Result<()> {
        if self.state.index_buffer.is_none() {
            return Err(Error::InvalidArgument("indexed draws need an index buffer"));
        }
        check_indirect(
            args,
            offset,
            max_draw_count,
            DRAW_INDEXED_ARGUMENTS_SIZE,
            count.as_ref(),
        )?;
        self.prepare()?;
        self.encoder.push(Command::DrawIndexedIndirect {
            max_draw_count,
            args: BufferOffset::new(args, offset),
            count,
        });
        Ok(())
    }

    pub fn draw_mesh_tasks(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        if !self
            .pipeline
            .as_ref()
            .is_some_and(RenderPipeline::uses_mesh_shader)
        {
            return Err(Error::InvalidArgument("mesh tasks need a mesh pipeline"));
        }
        self.prepare()?;
        self.encoder.push(Command::DrawMeshTasks { x, y, z });
        Ok(())
    }

    pub fn end(self) {}
}

impl Drop for RenderPassEncoder<'_> {
    fn drop(&mut self) {
        self.encoder.push(Command::EndRenderPass);
    }
}

fn check_indirect(
    args: &Buffer,
    offset: u64,
    max_draw_count: u32,
    record_size: u64,
    count: Option<&BufferOffset>,
) -> Result<()> {
    check_buffer_range(args, offset, max_draw_count as u64 * record_size)?;
    if let Some(count) = count {
        check_buffer_range(&count.buffer, count.offset, 4)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        Backend, Device, Error,
        buffer::{BufferDesc, BufferOffset, BufferUsage},
        command::{
            Command, DepthStencilAttachment, DrawArguments, DrawIndexedArguments, IndexFormat,
            LoadOp, RenderPassDesc, RenderState, StoreOp,
        },
        pipeline::RenderPipelineDesc,
        texture::{SubresourceRange, TextureDesc, TextureUsage},
    };

    #[test]
    fn state_changes_record_a_new_state() {
        let (device, queue) = Device::create_host_default(Backend::Vulkan).unwrap();
        let pipeline = device
            .create_render_pipeline(RenderPipelineDesc {
                vertex_entry_point: Some("vs".into()),
                ..Default::default()
            })
            .unwrap();
        let vertices = device
            .create_buffer(
                &BufferDesc {
                    size: 1024,
                    usage: BufferUsage::VERTEX_BUFFER | BufferUsage::INDEX_BUFFER,
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        let mut encoder = queue.create_command_encoder().unwrap();
        let mut pass = encoder.begin_render_pass(&RenderPassDesc::default()).unwrap();
        pass.bind_pipeline(&pipeline);
        let draw = DrawArguments {
            vertex_count: 3,
            instance_count: 1,
            ..Default::default()
        };
        pass.draw(draw).unwrap();
        pass.draw(draw).unwrap();
        assert!(matches!(
            pass.draw_indexed(DrawIndexedArguments::default()),
            Err(Error::InvalidArgument(_))
        ));
        pass.set_render_state(RenderState {
            vertex_buffers: [BufferOffset::new(&vertices, 0)].into_iter().collect(),
            index_buffer: Some((BufferOffset::new(&vertices, 512), IndexFormat::Uint16)),
            ..Default::default()
        })
        .unwrap();
        pass.draw_indexed(DrawIndexedArguments {
            index_count: 3,
            instance_count: 1,
            ..Default::default()
        })
        .unwrap();
        assert!(pass.draw_indirect(100, &vertices, 0, None).is_err());
        pass.end();

        let names: Vec<&str> = encoder.list().commands().iter().map(Command::name).collect();
        assert_eq!(
            names,
            [
                "beginRenderPass",
                "setRenderState",
                "draw",
                "draw",
                "setRenderState",
                "drawIndexed",
                "endRenderPass",
            ]
        );
    }

    #[test]
    fn depth_attachments_need_a_depth_format() {
        let (device, queue) = Device::create_host_default(Backend::D3D12).unwrap();
        let color = device
            .create_texture(
                &TextureDesc {
                    usage: TextureUsage::DEPTH_WRITE,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let mut encoder = queue.create_command_encoder().unwrap();
        let result = encoder.begin_render_pass(&RenderPassDesc {
            depth_stencil_attachment: Some(DepthStencilAttachment {
                texture: color,
                range: SubresourceRange::ENTIRE,
                depth_load_op: LoadOp::Clear,
                depth_store_op: StoreOp::Store,
                depth_read_only: false,
                clear_depth: 1.0,
                clear_stencil: 0,
            }),
            ..Default::default()
        });
        assert!(result.is_err());
        drop(result);
        assert!(encoder.list().is_empty());
    }

    #[test]
    fn mesh_tasks_need_a_mesh_pipeline() {
        let (device, queue) = Device::create_host_default(Backend::D3D12).unwrap();
        let classic = device
            .create_render_pipeline(RenderPipelineDesc {
                vertex_entry_point: Some("vs".into()),
                ..Default::default()
            })
            .unwrap();
        let mesh = device
            .create_render_pipeline(RenderPipelineDesc {
                mesh_entry_point: Some("ms".into()),
                ..Default::default()
            })
            .unwrap();
        let mut encoder = queue.create_command_encoder().unwrap();
        let mut pass = encoder.begin_render_pass(&RenderPassDesc::default()).unwrap();
        pass.bind_pipeline(&classic);
        assert!(pass.draw_mesh_tasks(1, 1, 1).is_err());
        pass.bind_pipeline(&mesh);
        pass.draw_mesh_tasks(1, 1, 1).unwrap();
    }
}
