//! Resource state tracking and barrier computation.
//!
//! Every command buffer runs its commands through a [`StateTracker`]. Executors declare the
//! state each command needs a resource in, and the tracker records the minimal set of
//! barriers that gets it there. The barriers are then translated into the backend's own
//! synchronization primitives.
//!
//! # Overview
//!
//! - Buffers have one state. Buffers outside [`MemoryType::DeviceLocal`] memory are never
//!   tracked.
//! - Textures have one state while every subresource agrees. Transitioning part of a texture
//!   splits it into per (layer, mip) states, which collapse back into one state as soon as
//!   they agree again.
//! - Requiring the state a resource is already in records nothing, except for
//!   [`ResourceState::UnorderedAccess`]: consecutive unordered accesses still need to be
//!   ordered, so the tracker records a synchronization-only barrier with `before == after`.
//! - At the end of a command buffer [`StateTracker::require_default_states`] returns every
//!   touched resource to its declared default state.
//!
//! ```
//! use scoria::tracking::{ResourceState, StateTracker};
//! # use scoria::{Backend, Device, buffer::{BufferDesc, BufferUsage}};
//! # let (device, _queue) = Device::create_host_default(Backend::D3D12).unwrap();
//! # let buffer = device.create_buffer(&BufferDesc {
//! #     size: 64,
//! #     usage: BufferUsage::UNORDERED_ACCESS | BufferUsage::SHADER_RESOURCE,
//! #     default_state: ResourceState::ShaderResource,
//! #     ..Default::default()
//! # }, None).unwrap();
//! let mut tracker = StateTracker::default();
//! tracker.set_buffer_state(&buffer, ResourceState::UnorderedAccess);
//! tracker.set_buffer_state(&buffer, ResourceState::UnorderedAccess);
//! tracker.require_default_states();
//!
//! let barriers = tracker.buffer_barriers();
//! assert_eq!(barriers.len(), 3);
//! assert_eq!(barriers[1].before, barriers[1].after);
//! ```
//!
//! [`MemoryType::DeviceLocal`]: crate::buffer::MemoryType::DeviceLocal

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    backend::AccelerationStructureSync,
    buffer::{Buffer, BufferUsage},
    texture::{SubresourceRange, Texture},
    utils::ResourceId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResourceState {
    #[default]
    Undefined,
    General,
    VertexBuffer,
    IndexBuffer,
    ConstantBuffer,
    StreamOutput,
    ShaderResource,
    UnorderedAccess,
    RenderTarget,
    DepthRead,
    DepthWrite,
    Present,
    IndirectArgument,
    CopySource,
    CopyDestination,
    ResolveSource,
    ResolveDestination,
    AccelerationStructure,
    AccelerationStructureBuildInput,
}

impl ResourceState {
    /// Whether work using a resource in this state may write to it.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            ResourceState::General
                | ResourceState::StreamOutput
                | ResourceState::UnorderedAccess
                | ResourceState::RenderTarget
                | ResourceState::DepthWrite
                | ResourceState::CopyDestination
                | ResourceState::ResolveDestination
                | ResourceState::AccelerationStructure
        )
    }
}

#[derive(Debug, Clone)]
pub struct BufferBarrier {
    pub buffer: Buffer,
    pub before: ResourceState,
    pub after: ResourceState,
}

impl BufferBarrier {
    /// Barriers that only order accesses without changing the state.
    pub fn is_synchronization_only(&self) -> bool {
        self.before == self.after
    }
}

#[derive(Debug, Clone)]
pub struct TextureBarrier {
    pub texture: Texture,
    /// When set, `mip` and `layer` are meaningless and the barrier covers every subresource.
    pub entire: bool,
    pub mip: u32,
    pub layer: u32,
    pub before: ResourceState,
    pub after: ResourceState,
}

impl TextureBarrier {
    pub fn is_synchronization_only(&self) -> bool {
        self.before == self.after
    }
}

struct TrackedBuffer {
    buffer: Buffer,
    state: ResourceState,
}

struct TrackedTexture {
    texture: Texture,
    /// Meaningful while `subresources` is empty.
    state: ResourceState,
    /// Indexed by `layer * mip_count + mip`.
    subresources: Vec<ResourceState>,
}

#[derive(Default)]
pub struct StateTracker {
    acceleration_structure_sync: AccelerationStructureSync,
    buffers: BTreeMap<ResourceId, TrackedBuffer>,
    textures: BTreeMap<ResourceId, TrackedTexture>,
    buffer_barriers: Vec<BufferBarrier>,
    texture_barriers: Vec<TextureBarrier>,
}

impl StateTracker {
    /// A tracker that synchronizes acceleration structure storage according to `policy`.
    pub fn new(policy: AccelerationStructureSync) -> Self {
        Self {
            acceleration_structure_sync: policy,
            ..Default::default()
        }
    }

    pub fn set_buffer_state(&mut self, buffer: &Buffer, state: ResourceState) {
        if !buffer.is_tracked() {
            return;
        }
        debug_assert!(
            buffer.usage().allows(state),
            "buffer {:?} with usage {:?} cannot be in state {:?}",
            buffer.id(),
            buffer.usage(),
            state
        );
        let tracked = self
            .buffers
            .entry(buffer.id())
            .or_insert_with(|| TrackedBuffer {
                buffer: buffer.clone(),
                state: buffer.default_state(),
            });

        if buffer.usage().contains(BufferUsage::ACCELERATION_STRUCTURE) {
            match self.acceleration_structure_sync {
                AccelerationStructureSync::Transition => {}
                AccelerationStructureSync::UnorderedAccessOnly => {
                    // The storage never leaves its state; accesses are ordered with UAV barriers.
                    self.buffer_barriers.push(BufferBarrier {
                        buffer: buffer.clone(),
                        before: tracked.state,
                        after: tracked.state,
                    });
                    return;
                }
                AccelerationStructureSync::None => return,
            }
        }

        if state != tracked.state || state == ResourceState::UnorderedAccess {
            self.buffer_barriers.push(BufferBarrier {
                buffer: buffer.clone(),
                before: tracked.state,
                after: state,
            });
            tracked.state = state;
        }
    }

    pub fn set_texture_state(
        &mut self,
        texture: &Texture,
        range: SubresourceRange,
        state: ResourceState,
    ) {
        if !texture.is_tracked() {
            return;
        }
        debug_assert!(
            texture.usage().allows(state),
            "texture {:?} with usage {:?} cannot be in state {:?}",
            texture.id(),
            texture.usage(),
            state
        );
        let desc = texture.desc();
        let range = range.resolve(desc);
        let entire = range.is_entire(desc);
        let tracked = self
            .textures
            .entry(texture.id())
            .or_insert_with(|| TrackedTexture {
                texture: texture.clone(),
                state: texture.default_state(),
                subresources: Vec::new(),
            });

        if entire && tracked.subresources.is_empty() {
            if state != tracked.state || state == ResourceState::UnorderedAccess {
                self.texture_barriers.push(TextureBarrier {
                    texture: texture.clone(),
                    entire: true,
                    mip: 0,
                    layer: 0,
                    before: tracked.state,
                    after: state,
                });
                tracked.state = state;
            }
            return;
        }

        let mip_count = texture.mip_count();
        if tracked.subresources.is_empty() {
            tracked.subresources = vec![tracked.state; desc.subresource_count() as usize];
            tracked.state = ResourceState::Undefined;
        }
        let last_layer = (range.layer + range.layer_count).min(texture.array_layer_count());
        let last_mip = (range.mip + range.mip_count).min(mip_count);
        for layer in range.layer..last_layer {
            for mip in range.mip..last_mip {
                let current = &mut tracked.subresources[(layer * mip_count + mip) as usize];
                if state != *current || state == ResourceState::UnorderedAccess {
                    self.texture_barriers.push(TextureBarrier {
                        texture: texture.clone(),
                        entire: false,
                        mip,
                        layer,
                        before: *current,
                        after: state,
                    });
                    *current = state;
                }
            }
        }

        let common = tracked.subresources[0];
        if tracked.subresources.iter().all(|s| *s == common) {
            tracked.state = common;
            tracked.subresources.clear();
        }
    }

    /// Current state of a tracked buffer.
    pub fn buffer_state(&self, buffer: &Buffer) -> Option<ResourceState> {
        self.buffers.get(&buffer.id()).map(|tracked| tracked.state)
    }

    /// Current state of one subresource of a tracked texture.
    pub fn texture_state(&self, texture: &Texture, layer: u32, mip: u32) -> Option<ResourceState> {
        let tracked = self.textures.get(&texture.id())?;
        if tracked.subresources.is_empty() {
            Some(tracked.state)
        } else {
            let index = layer * texture.mip_count() + mip;
            tracked.subresources.get(index as usize).copied()
        }
    }

    /// Whether a tracked texture is currently split into per-subresource states.
    pub fn is_split(&self, texture: &Texture) -> bool {
        self.textures
            .get(&texture.id())
            .is_some_and(|tracked| !tracked.subresources.is_empty())
    }

    /// Transitions every resource touched since the last [`StateTracker::clear`] back to its
    /// default state.
    pub fn require_default_states(&mut self) {
        let buffers: Vec<Buffer> = self
            .buffers
            .values()
            .filter(|tracked| tracked.state != tracked.buffer.default_state())
            .map(|tracked| tracked.buffer.clone())
            .collect();
        for buffer in buffers {
            self.set_buffer_state(&buffer, buffer.default_state());
        }
        let textures: Vec<Texture> = self
            .textures
            .values()
            .filter(|tracked| {
                !tracked.subresources.is_empty()
                    || tracked.state != tracked.texture.default_state()
            })
            .map(|tracked| tracked.texture.clone())
            .collect();
        for texture in textures {
            self.set_texture_state(&texture, SubresourceRange::ENTIRE, texture.default_state());
        }
    }

    pub fn buffer_barriers(&self) -> &[BufferBarrier] {
        &self.buffer_barriers
    }

    pub fn texture_barriers(&self) -> &[TextureBarrier] {
        &self.texture_barriers
    }

    pub fn has_barriers(&self) -> bool {
        !self.buffer_barriers.is_empty() || !self.texture_barriers.is_empty()
    }

    /// Drops recorded barriers, keeping the tracked states.
    pub fn clear_barriers(&mut self) {
        self.buffer_barriers.clear();
        self.texture_barriers.clear();
    }

    /// Forgets every tracked resource and barrier.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.textures.clear();
        self.clear_barriers();
    }
}
