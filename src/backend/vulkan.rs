//! Vulkan barriers.
//!
//! Every [`ResourceState`] maps to an [`Access`] (the pipeline stages and access types of the
//! work using a resource in that state) and, for images, an image layout. Tracker barriers
//! become synchronization2 buffer and image barriers; consecutive barriers that share a source
//! and destination stage mask are recorded with a single `vkCmdPipelineBarrier2`.

use std::ops::{BitOr, BitOrAssign};

use ash::vk;

use crate::{
    native::{Barrier, BufferMemoryBarrier, ImageMemoryBarrier, PipelineBarrier},
    tracking::{ResourceState, StateTracker},
};

use super::explicit::BarrierTranslator;

/// Pipeline stages and access types of one use of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            stage: self.stage | rhs.stage,
            access: self.access | rhs.access,
        }
    }
}

impl BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.stage |= rhs.stage;
        self.access |= rhs.access;
    }
}

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    pub const COPY_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const COPY_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const RESOLVE_READ: Access = Access {
        stage: vk::PipelineStageFlags2::RESOLVE,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const RESOLVE_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::RESOLVE,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const VERTEX_READ: Access = Access {
        stage: vk::PipelineStageFlags2::VERTEX_INPUT,
        access: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
    };
    pub const INDEX_READ: Access = Access {
        stage: vk::PipelineStageFlags2::INDEX_INPUT,
        access: vk::AccessFlags2::INDEX_READ,
    };
    pub const INDIRECT_READ: Access = Access {
        stage: vk::PipelineStageFlags2::DRAW_INDIRECT,
        access: vk::AccessFlags2::INDIRECT_COMMAND_READ,
    };
    pub const COLOR_ATTACHMENT: Access = Access {
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
        ),
    };
    pub const DEPTH_READ: Access = Access {
        stage: Self::FRAGMENT_TESTS,
        access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
    };
    pub const DEPTH_WRITE: Access = Access {
        stage: Self::FRAGMENT_TESTS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
        ),
    };
    pub const STREAM_OUTPUT: Access = Access {
        stage: vk::PipelineStageFlags2::TRANSFORM_FEEDBACK_EXT,
        access: vk::AccessFlags2::TRANSFORM_FEEDBACK_WRITE_EXT,
    };
    pub const CONSTANT_READ: Access = Access {
        stage: Self::SHADERS,
        access: vk::AccessFlags2::UNIFORM_READ,
    };
    pub const SHADER_READ: Access = Access {
        stage: Self::SHADERS,
        access: vk::AccessFlags2::SHADER_READ,
    };
    pub const SHADER_READ_WRITE: Access = Access {
        stage: Self::SHADERS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::SHADER_READ.as_raw() | vk::AccessFlags2::SHADER_WRITE.as_raw(),
        ),
    };
    pub const ACCELERATION_STRUCTURE: Access = Access {
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR.as_raw()
                | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw()
                | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
        ),
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw()
                | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
        ),
    };
    pub const BUILD_INPUT_READ: Access = Access {
        stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        access: vk::AccessFlags2::SHADER_READ,
    };
    pub const ALL: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
    };

    const FRAGMENT_TESTS: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
        vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
            | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
    );
    const SHADERS: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
        vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
            | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
            | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw()
            | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw(),
    );

    pub fn of(state: ResourceState) -> Access {
        match state {
            ResourceState::Undefined | ResourceState::Present => Access::NONE,
            ResourceState::General => Access::ALL,
            ResourceState::VertexBuffer => Access::VERTEX_READ,
            ResourceState::IndexBuffer => Access::INDEX_READ,
            ResourceState::ConstantBuffer => Access::CONSTANT_READ,
            ResourceState::StreamOutput => Access::STREAM_OUTPUT,
            ResourceState::ShaderResource => Access::SHADER_READ,
            ResourceState::UnorderedAccess => Access::SHADER_READ_WRITE,
            ResourceState::RenderTarget => Access::COLOR_ATTACHMENT,
            ResourceState::DepthRead => Access::DEPTH_READ,
            ResourceState::DepthWrite => Access::DEPTH_WRITE,
            ResourceState::IndirectArgument => Access::INDIRECT_READ,
            ResourceState::CopySource => Access::COPY_READ,
            ResourceState::CopyDestination => Access::COPY_WRITE,
            ResourceState::ResolveSource => Access::RESOLVE_READ,
            ResourceState::ResolveDestination => Access::RESOLVE_WRITE,
            ResourceState::AccelerationStructure => Access::ACCELERATION_STRUCTURE,
            ResourceState::AccelerationStructureBuildInput => Access::BUILD_INPUT_READ,
        }
    }
}

pub(crate) fn image_layout(state: ResourceState) -> vk::ImageLayout {
    match state {
        ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
        ResourceState::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ResourceState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ResourceState::DepthRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ResourceState::DepthWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        ResourceState::CopySource | ResourceState::ResolveSource => {
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        }
        ResourceState::CopyDestination | ResourceState::ResolveDestination => {
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        }
        _ => vk::ImageLayout::GENERAL,
    }
}

pub(crate) struct VulkanBarriers;

impl VulkanBarriers {
    fn batch(
        batches: &mut Vec<PipelineBarrier>,
        src_stage: vk::PipelineStageFlags2,
        dst_stage: vk::PipelineStageFlags2,
    ) -> &mut PipelineBarrier {
        let reuse = batches
            .last()
            .is_some_and(|last| last.src_stage == src_stage && last.dst_stage == dst_stage);
        if !reuse {
            batches.push(PipelineBarrier {
                src_stage,
                dst_stage,
                ..Default::default()
            });
        }
        let index = batches.len() - 1;
        &mut batches[index]
    }
}

impl BarrierTranslator for VulkanBarriers {
    fn translate(&self, tracker: &StateTracker) -> Vec<Barrier> {
        let mut batches: Vec<PipelineBarrier> = Vec::new();
        for barrier in tracker.buffer_barriers() {
            let before = Access::of(barrier.before);
            let after = Access::of(barrier.after);
            Self::batch(&mut batches, before.stage, after.stage)
                .buffers
                .push(BufferMemoryBarrier {
                    buffer: barrier.buffer.id(),
                    src_access: before.access,
                    dst_access: after.access,
                    offset: 0,
                    size: barrier.buffer.size(),
                });
        }
        for barrier in tracker.texture_barriers() {
            let before = Access::of(barrier.before);
            let after = Access::of(barrier.after);
            let texture = &barrier.texture;
            let (base_mip_level, level_count, base_array_layer, layer_count) = if barrier.entire {
                (0, texture.mip_count(), 0, texture.array_layer_count())
            } else {
                (barrier.mip, 1, barrier.layer, 1)
            };
            Self::batch(&mut batches, before.stage, after.stage)
                .images
                .push(ImageMemoryBarrier {
                    image: texture.id(),
                    src_access: before.access,
                    dst_access: after.access,
                    old_layout: image_layout(barrier.before),
                    new_layout: image_layout(barrier.after),
                    base_mip_level,
                    level_count,
                    base_array_layer,
                    layer_count,
                });
        }
        batches.into_iter().map(Barrier::Pipeline).collect()
    }
}
