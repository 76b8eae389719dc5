//! Native backends.
//!
//! A [`Backend`] selects the executor that translates command lists into [`NativeOp`]s and
//! the [`BackendCapabilities`] the rest of the crate consults. The native driver itself is
//! supplied separately through [`Driver`](crate::native::Driver).
//!
//! | | CUDA | D3D12 | Vulkan |
//! |---|---|---|---|
//! | explicit barriers | no | transition + UAV | pipeline barriers |
//! | acceleration structure sync | none | UAV only | transition |
//! | render passes, draws | no | yes | yes |
//! | texture copies | no | yes | yes |
//! | cooperative vectors | no | no | yes |
//!
//! [`NativeOp`]: crate::native::NativeOp

mod cuda;
mod d3d12;
mod explicit;
mod vulkan;

use serde::{Deserialize, Serialize};

use crate::executor::CommandExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Backend {
    Cuda,
    D3D12,
    Vulkan,
}

impl Backend {
    pub const COUNT: usize = 3;
    pub const ALL: [Backend; Backend::COUNT] = [Backend::Cuda, Backend::D3D12, Backend::Vulkan];

    pub fn capabilities(self) -> BackendCapabilities {
        match self {
            Backend::Cuda => BackendCapabilities {
                explicit_barriers: false,
                acceleration_structure_sync: AccelerationStructureSync::None,
                parameter_blocks: true,
                render_passes: false,
                ray_tracing: true,
                texture_copies: false,
                mesh_shaders: false,
                cooperative_vectors: false,
                timestamps: false,
                debug_labels: false,
                indirect_dispatch: false,
            },
            Backend::D3D12 => BackendCapabilities {
                explicit_barriers: true,
                acceleration_structure_sync: AccelerationStructureSync::UnorderedAccessOnly,
                parameter_blocks: false,
                render_passes: true,
                ray_tracing: true,
                texture_copies: true,
                mesh_shaders: true,
                cooperative_vectors: false,
                timestamps: true,
                debug_labels: true,
                indirect_dispatch: true,
            },
            Backend::Vulkan => BackendCapabilities {
                explicit_barriers: true,
                acceleration_structure_sync: AccelerationStructureSync::Transition,
                parameter_blocks: false,
                render_passes: true,
                ray_tracing: true,
                texture_copies: true,
                mesh_shaders: true,
                cooperative_vectors: true,
                timestamps: true,
                debug_labels: true,
                indirect_dispatch: true,
            },
        }
    }

    pub(crate) fn executor(self) -> Box<dyn CommandExecutor> {
        match self {
            Backend::Cuda => Box::new(cuda::CudaExecutor),
            Backend::D3D12 => Box::new(explicit::ExplicitExecutor::new(
                self.capabilities(),
                d3d12::D3D12Barriers,
            )),
            Backend::Vulkan => Box::new(explicit::ExplicitExecutor::new(
                self.capabilities(),
                vulkan::VulkanBarriers,
            )),
        }
    }
}

/// How acceleration structure storage is synchronized between builds and traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccelerationStructureSync {
    /// Stream order is enough.
    None,
    /// The storage stays in its state; accesses are ordered with UAV barriers.
    UnorderedAccessOnly,
    /// The storage is transitioned like any other buffer.
    #[default]
    Transition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Whether resource states are tracked and turned into barriers.
    pub explicit_barriers: bool,
    pub acceleration_structure_sync: AccelerationStructureSync,
    /// Kernels take one parameter block holding the uniform data followed by the device
    /// address of every bound resource, instead of separately bound constants and resources.
    pub parameter_blocks: bool,
    pub render_passes: bool,
    pub ray_tracing: bool,
    pub texture_copies: bool,
    pub mesh_shaders: bool,
    pub cooperative_vectors: bool,
    pub timestamps: bool,
    pub debug_labels: bool,
    pub indirect_dispatch: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backends_index_the_registry() {
        for (index, backend) in Backend::ALL.into_iter().enumerate() {
            assert_eq!(backend as usize, index);
        }
    }

    #[test]
    fn acceleration_structure_policies() {
        assert_eq!(
            Backend::Cuda.capabilities().acceleration_structure_sync,
            AccelerationStructureSync::None
        );
        assert_eq!(
            Backend::D3D12.capabilities().acceleration_structure_sync,
            AccelerationStructureSync::UnorderedAccessOnly
        );
        assert_eq!(
            Backend::Vulkan.capabilities().acceleration_structure_sync,
            AccelerationStructureSync::Transition
        );
    }

    #[test]
    fn capabilities_serialize() {
        let caps = Backend::Vulkan.capabilities();
        let json = serde_json::to_string(&caps).unwrap();
        let back: BackendCapabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }
}
