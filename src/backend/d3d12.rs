//! D3D12 barriers.
//!
//! Tracker barriers map one to one onto `D3D12_RESOURCE_BARRIER`s: a state change becomes a
//! transition and a synchronization-only barrier becomes a UAV barrier. Acceleration structure
//! storage never changes state under the D3D12 policy, so it only ever produces UAV barriers.

use crate::{
    native::{Barrier, Subresource},
    tracking::StateTracker,
};

use super::explicit::BarrierTranslator;

pub(crate) struct D3D12Barriers;

impl BarrierTranslator for D3D12Barriers {
    fn translate(&self, tracker: &StateTracker) -> Vec<Barrier> {
        let buffers = tracker.buffer_barriers().iter().map(|barrier| {
            if barrier.is_synchronization_only() {
                Barrier::UnorderedAccess {
                    resource: barrier.buffer.id(),
                }
            } else {
                Barrier::Transition {
                    resource: barrier.buffer.id(),
                    subresource: None,
                    before: barrier.before,
                    after: barrier.after,
                }
            }
        });
        let textures = tracker.texture_barriers().iter().map(|barrier| {
            if barrier.is_synchronization_only() {
                Barrier::UnorderedAccess {
                    resource: barrier.texture.id(),
                }
            } else {
                Barrier::Transition {
                    resource: barrier.texture.id(),
                    subresource: (!barrier.entire).then_some(Subresource {
                        mip_level: barrier.mip,
                        array_layer: barrier.layer,
                    }),
                    before: barrier.before,
                    after: barrier.after,
                }
            }
        });
        buffers.chain(textures).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        Backend, Device,
        backend::AccelerationStructureSync,
        buffer::{BufferDesc, BufferUsage},
        native::HostDriver,
        texture::{SubresourceRange, TextureDesc, TextureUsage},
        tracking::ResourceState,
    };

    fn device() -> Device {
        Device::builder(Backend::D3D12)
            .driver(Arc::new(HostDriver::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn transitions_and_uav_barriers() {
        let device = device();
        let buffer = device
            .create_buffer(
                &BufferDesc {
                    size: 256,
                    usage: BufferUsage::UNORDERED_ACCESS | BufferUsage::COPY_DESTINATION,
                    default_state: ResourceState::UnorderedAccess,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let mut tracker = StateTracker::new(AccelerationStructureSync::UnorderedAccessOnly);
        tracker.set_buffer_state(&buffer, ResourceState::UnorderedAccess);
        tracker.set_buffer_state(&buffer, ResourceState::CopyDestination);

        assert_eq!(
            D3D12Barriers.translate(&tracker),
            vec![
                Barrier::UnorderedAccess {
                    resource: buffer.id()
                },
                Barrier::Transition {
                    resource: buffer.id(),
                    subresource: None,
                    before: ResourceState::UnorderedAccess,
                    after: ResourceState::CopyDestination,
                },
            ]
        );
    }

    #[test]
    fn partial_texture_transitions_name_the_subresource() {
        let device = device();
        let texture = device
            .create_texture(
                &TextureDesc {
                    mip_count: 2,
                    usage: TextureUsage::SHADER_RESOURCE | TextureUsage::COPY_DESTINATION,
                    default_state: ResourceState::ShaderResource,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let mut tracker = StateTracker::new(AccelerationStructureSync::UnorderedAccessOnly);
        tracker.set_texture_state(
            &texture,
            SubresourceRange::single(0, 1),
            ResourceState::CopyDestination,
        );

        assert_eq!(
            D3D12Barriers.translate(&tracker),
            vec![Barrier::Transition {
                resource: texture.id(),
                subresource: Some(Subresource {
                    mip_level: 1,
                    array_layer: 0,
                }),
                before: ResourceState::ShaderResource,
                after: ResourceState::CopyDestination,
            }]
        );
    }
}
