//! Pipelines, root shader objects and resolved binding data.
//!
//! Shader compilation and reflection happen elsewhere; a pipeline here is an opaque object
//! carrying what command recording needs to know about it, such as the thread-group size of
//! a compute kernel.
//!
//! # Binding model
//!
//! Binding a pipeline on a pass encoder returns its root [`ShaderObject`]. Resources and
//! uniform data are written into numbered slots of the root object. When the next dispatch or
//! draw is recorded, a [`BindingDataBuilder`] resolves the root object into a [`BindingData`],
//! the flat list of resources the executor needs to transition and bind.

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    Device, Error, HasDevice, Result,
    buffer::Buffer,
    rtx::AccelerationStructure,
    texture::{Format, SubresourceRange, Texture},
    tracking::ResourceState,
    utils::ResourceId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Compute,
    Render,
    RayTracing,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComputePipelineDesc {
    pub label: Option<String>,
    pub entry_point: String,
    pub thread_group_size: [u32; 3],
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RenderPipelineDesc {
    pub label: Option<String>,
    pub vertex_entry_point: Option<String>,
    pub mesh_entry_point: Option<String>,
    pub fragment_entry_point: Option<String>,
    pub color_formats: SmallVec<[Format; 4]>,
    pub depth_format: Option<Format>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RayTracingPipelineDesc {
    pub label: Option<String>,
    pub raygen_entry_points: Vec<String>,
    pub miss_entry_points: Vec<String>,
    pub hit_groups: Vec<String>,
    pub callable_entry_points: Vec<String>,
    pub max_recursion: u32,
}

struct PipelineInner<D> {
    device: Device,
    id: ResourceId,
    desc: D,
}

macro_rules! pipeline_handle {
    ($name:ident, $desc:ty) => {
        #[derive(Clone)]
        pub struct $name(Arc<PipelineInner<$desc>>);

        impl $name {
            pub fn id(&self) -> ResourceId {
                self.0.id
            }

            pub fn desc(&self) -> &$desc {
                &self.0.desc
            }
        }

        impl HasDevice for $name {
            fn device(&self) -> &Device {
                &self.0.device
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0)
            }
        }
        impl Eq for $name {}

        impl Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("id", &self.0.id)
                    .field("label", &self.0.desc.label)
                    .finish()
            }
        }
    };
}

pipeline_handle!(ComputePipeline, ComputePipelineDesc);
pipeline_handle!(RenderPipeline, RenderPipelineDesc);
pipeline_handle!(RayTracingPipeline, RayTracingPipelineDesc);

impl ComputePipeline {
    pub(crate) fn new(device: Device, desc: ComputePipelineDesc) -> Result<Self> {
        if desc.thread_group_size.contains(&0) {
            return Err(Error::InvalidArgument(
                "thread group size must not be zero",
            ));
        }
        Ok(Self(Arc::new(PipelineInner {
            device,
            id: ResourceId::next(),
            desc,
        })))
    }

    /// Threads per thread group of the kernel.
    pub fn thread_group_size(&self) -> [u32; 3] {
        self.0.desc.thread_group_size
    }
}

impl RenderPipeline {
    pub(crate) fn new(device: Device, desc: RenderPipelineDesc) -> Result<Self> {
        if desc.vertex_entry_point.is_some() == desc.mesh_entry_point.is_some() {
            return Err(Error::InvalidArgument(
                "a render pipeline needs exactly one of a vertex or a mesh shader",
            ));
        }
        Ok(Self(Arc::new(PipelineInner {
            device,
            id: ResourceId::next(),
            desc,
        })))
    }

    pub fn uses_mesh_shader(&self) -> bool {
        self.0.desc.mesh_entry_point.is_some()
    }
}

impl RayTracingPipeline {
    pub(crate) fn new(device: Device, desc: RayTracingPipelineDesc) -> Result<Self> {
        if desc.raygen_entry_points.is_empty() {
            return Err(Error::InvalidArgument(
                "a ray tracing pipeline needs a ray generation shader",
            ));
        }
        Ok(Self(Arc::new(PipelineInner {
            device,
            id: ResourceId::next(),
            desc,
        })))
    }
}

/// A pipeline of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pipeline {
    Compute(ComputePipeline),
    Render(RenderPipeline),
    RayTracing(RayTracingPipeline),
}

impl Pipeline {
    pub fn id(&self) -> ResourceId {
        match self {
            Pipeline::Compute(p) => p.id(),
            Pipeline::Render(p) => p.id(),
            Pipeline::RayTracing(p) => p.id(),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        match self {
            Pipeline::Compute(_) => PipelineKind::Compute,
            Pipeline::Render(_) => PipelineKind::Render,
            Pipeline::RayTracing(_) => PipelineKind::RayTracing,
        }
    }
}

/// How a shader accesses a bound resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BindingAccess {
    Constant,
    #[default]
    Read,
    ReadWrite,
}

impl BindingAccess {
    pub fn buffer_state(self) -> ResourceState {
        match self {
            BindingAccess::Constant => ResourceState::ConstantBuffer,
            BindingAccess::Read => ResourceState::ShaderResource,
            BindingAccess::ReadWrite => ResourceState::UnorderedAccess,
        }
    }

    pub fn texture_state(self) -> ResourceState {
        match self {
            BindingAccess::Constant | BindingAccess::Read => ResourceState::ShaderResource,
            BindingAccess::ReadWrite => ResourceState::UnorderedAccess,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Buffer {
        buffer: Buffer,
        offset: u64,
        size: u64,
        access: BindingAccess,
    },
    Texture {
        texture: Texture,
        range: SubresourceRange,
        access: BindingAccess,
    },
    AccelerationStructure(AccelerationStructure),
}

/// The root object of a bound pipeline.
///
/// ```
/// use scoria::pipeline::ShaderObject;
///
/// let mut root = ShaderObject::default();
/// let before = root.version();
/// root.set_data(4, &7u32.to_le_bytes());
/// assert_eq!(root.data(), &[0, 0, 0, 0, 7, 0, 0, 0]);
/// assert_ne!(root.version(), before);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShaderObject {
    data: Vec<u8>,
    bindings: BTreeMap<u32, Binding>,
    version: u64,
}

impl ShaderObject {
    /// Writes uniform data at `offset`, growing the data block as needed.
    pub fn set_data(&mut self, offset: usize, data: &[u8]) -> &mut Self {
        if self.data.len() < offset + data.len() {
            self.data.resize(offset + data.len(), 0);
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        self.touch()
    }

    pub fn set_buffer(&mut self, slot: u32, buffer: &Buffer, access: BindingAccess) -> &mut Self {
        let size = buffer.size();
        self.set_buffer_range(slot, buffer, 0, size, access)
    }

    pub fn set_buffer_range(
        &mut self,
        slot: u32,
        buffer: &Buffer,
        offset: u64,
        size: u64,
        access: BindingAccess,
    ) -> &mut Self {
        self.bindings.insert(
            slot,
            Binding::Buffer {
                buffer: buffer.clone(),
                offset,
                size,
                access,
            },
        );
        self.touch()
    }

    pub fn set_texture(
        &mut self,
        slot: u32,
        texture: &Texture,
        range: SubresourceRange,
        access: BindingAccess,
    ) -> &mut Self {
        self.bindings.insert(
            slot,
            Binding::Texture {
                texture: texture.clone(),
                range,
                access,
            },
        );
        self.touch()
    }

    pub fn set_acceleration_structure(
        &mut self,
        slot: u32,
        acceleration_structure: &AccelerationStructure,
    ) -> &mut Self {
        self.bindings.insert(
            slot,
            Binding::AccelerationStructure(acceleration_structure.clone()),
        );
        self.touch()
    }

    pub fn clear_slot(&mut self, slot: u32) -> &mut Self {
        self.bindings.remove(&slot);
        self.touch()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bindings(&self) -> impl Iterator<Item = (u32, &Binding)> {
        self.bindings.iter().map(|(slot, binding)| (*slot, binding))
    }

    /// Changes whenever the object is modified.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn reset(&mut self) {
        self.data.clear();
        self.bindings.clear();
        self.touch();
    }

    fn touch(&mut self) -> &mut Self {
        self.version += 1;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundBuffer {
    pub slot: u32,
    pub buffer: Buffer,
    pub offset: u64,
    pub size: u64,
    pub access: BindingAccess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundTexture {
    pub slot: u32,
    pub texture: Texture,
    pub range: SubresourceRange,
    pub access: BindingAccess,
}

/// A root object resolved for one dispatch or draw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingData {
    pub constants: Vec<u8>,
    pub buffers: Vec<BoundBuffer>,
    pub textures: Vec<BoundTexture>,
    pub acceleration_structures: Vec<(u32, AccelerationStructure)>,
}

impl BindingData {
    pub fn resource_count(&self) -> u32 {
        (self.buffers.len() + self.textures.len() + self.acceleration_structures.len()) as u32
    }

    /// Uniform data followed by the device address of every bound resource in slot order,
    /// the parameter block layout kernels without descriptor tables consume.
    pub fn parameter_block(&self) -> Vec<u8> {
        let mut slots: Vec<(u32, u64)> = self
            .buffers
            .iter()
            .map(|b| (b.slot, b.buffer.device_address().offset(b.offset).0))
            .chain(
                self.textures
                    .iter()
                    .map(|t| (t.slot, t.texture.device_address().0)),
            )
            .chain(
                self.acceleration_structures
                    .iter()
                    .map(|(slot, a)| (*slot, a.device_address().0)),
            )
            .collect();
        slots.sort_by_key(|(slot, _)| *slot);
        let mut block = self.constants.clone();
        block.resize(crate::utils::align_up(block.len() as u64, 8) as usize, 0);
        for (_, address) in slots {
            block.extend_from_slice(&address.to_le_bytes());
        }
        block
    }
}

/// Resolves root objects into [`BindingData`].
#[derive(Debug, Clone)]
pub struct BindingDataBuilder {
    max_constant_size: usize,
}

impl Default for BindingDataBuilder {
    fn default() -> Self {
        Self {
            max_constant_size: 64 * 1024,
        }
    }
}

impl BindingDataBuilder {
    pub fn with_max_constant_size(max_constant_size: usize) -> Self {
        Self { max_constant_size }
    }

    pub fn build(&self, root: &ShaderObject) -> Result<BindingData> {
        if root.data().len() > self.max_constant_size {
            return Err(Error::InvalidArgument(
                "uniform data exceeds the constant buffer limit",
            ));
        }
        let mut data = BindingData {
            constants: root.data().to_vec(),
            ..Default::default()
        };
        for (slot, binding) in root.bindings() {
            match binding {
                Binding::Buffer {
                    buffer,
                    offset,
                    size,
                    access,
                } => {
                    if offset + size > buffer.size() {
                        return Err(Error::InvalidArgument("buffer binding is out of range"));
                    }
                    data.buffers.push(BoundBuffer {
                        slot,
                        buffer: buffer.clone(),
                        offset: *offset,
                        size: *size,
                        access: *access,
                    });
                }
                Binding::Texture {
                    texture,
                    range,
                    access,
                } => {
                    if !range.fits(texture.desc()) {
                        return Err(Error::InvalidArgument("texture binding is out of range"));
                    }
                    data.textures.push(BoundTexture {
                        slot,
                        texture: texture.clone(),
                        range: *range,
                        access: *access,
                    });
                }
                Binding::AccelerationStructure(acceleration_structure) => {
                    data.acceleration_structures
                        .push((slot, acceleration_structure.clone()));
                }
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Backend,
        buffer::{BufferDesc, BufferUsage},
    };

    #[test]
    fn compute_pipelines_need_a_thread_group_size() {
        let (device, _queue) = Device::create_host_default(Backend::Cuda).unwrap();
        assert!(device
            .create_compute_pipeline(ComputePipelineDesc::default())
            .is_err());
        let pipeline = device
            .create_compute_pipeline(ComputePipelineDesc {
                entry_point: "main".into(),
                thread_group_size: [64, 1, 1],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pipeline.thread_group_size(), [64, 1, 1]);
    }

    #[test]
    fn binding_data_lists_resources_in_slot_order() {
        let (device, _queue) = Device::create_host_default(Backend::Cuda).unwrap();
        let desc = BufferDesc {
            size: 64,
            usage: BufferUsage::SHADER_RESOURCE | BufferUsage::UNORDERED_ACCESS,
            ..Default::default()
        };
        let a = device.create_buffer(&desc, None).unwrap();
        let b = device.create_buffer(&desc, None).unwrap();
        let mut root = ShaderObject::default();
        root.set_buffer(3, &a, BindingAccess::ReadWrite)
            .set_buffer(1, &b, BindingAccess::Read)
            .set_data(0, &[1, 2, 3]);
        let data = BindingDataBuilder::default().build(&root).unwrap();
        assert_eq!(data.resource_count(), 2);
        assert_eq!(data.buffers[0].slot, 1);
        assert_eq!(data.buffers[1].buffer, a);

        let block = data.parameter_block();
        assert_eq!(block.len(), 8 + 16);
        assert_eq!(&block[..3], &[1, 2, 3]);
        assert_eq!(
            &block[8..16],
            &b.device_address().0.to_le_bytes()
        );
    }

    #[test]
    fn out_of_range_bindings_are_rejected() {
        let (device, _queue) = Device::create_host_default(Backend::Cuda).unwrap();
        let buffer = device
            .create_buffer(
                &BufferDesc {
                    size: 16,
                    usage: BufferUsage::SHADER_RESOURCE,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let mut root = ShaderObject::default();
        root.set_buffer_range(0, &buffer, 8, 16, BindingAccess::Read);
        assert!(BindingDataBuilder::default().build(&root).is_err());
        assert!(BindingDataBuilder::with_max_constant_size(2)
            .build(ShaderObject::default().set_data(0, &[0; 4]))
            .is_err());
    }
}
