//! Ray tracing objects: acceleration structures and shader tables.
//!
//! Geometry encoding is the business of the native layer. An [`AccelerationStructure`] is a
//! region of device memory with a kind, and a build is described by the buffers that hold
//! its inputs.

use std::{fmt::Debug, sync::Arc};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{
    Device, Error, HasDevice, Result,
    buffer::{Buffer, BufferDesc, BufferOffset, BufferUsage, MemoryType},
    native::DeviceAddress,
    pipeline::RayTracingPipeline,
    tracking::ResourceState,
    utils::{ResourceId, align_up},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccelerationStructureKind {
    TopLevel,
    BottomLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccelerationStructureCopyMode {
    Clone,
    Compact,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
        const MINIMIZE_MEMORY = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BuildMode {
    #[default]
    Build,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildInput {
    Instances {
        instances: BufferOffset,
        count: u32,
    },
    Triangles {
        vertices: BufferOffset,
        vertex_count: u32,
        vertex_stride: u32,
        indices: Option<BufferOffset>,
        index_count: u32,
    },
    ProceduralPrimitives {
        aabbs: BufferOffset,
        count: u32,
        stride: u32,
    },
}

impl BuildInput {
    /// Every buffer the build reads.
    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        let (first, second) = match self {
            BuildInput::Instances { instances, .. } => (instances, None),
            BuildInput::Triangles {
                vertices, indices, ..
            } => (vertices, indices.as_ref()),
            BuildInput::ProceduralPrimitives { aabbs, .. } => (aabbs, None),
        };
        std::iter::once(&first.buffer).chain(second.map(|s| &s.buffer))
    }

    fn primitive_count(&self) -> u64 {
        match self {
            BuildInput::Instances { count, .. } => *count as u64,
            BuildInput::Triangles {
                vertex_count,
                index_count,
                indices,
                ..
            } => {
                if indices.is_some() {
                    *index_count as u64 / 3
                } else {
                    *vertex_count as u64 / 3
                }
            }
            BuildInput::ProceduralPrimitives { count, .. } => *count as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccelerationStructureBuildDesc {
    pub inputs: Vec<BuildInput>,
    pub mode: BuildMode,
    pub flags: BuildFlags,
}

impl AccelerationStructureBuildDesc {
    pub fn kind(&self) -> Result<AccelerationStructureKind> {
        match self.inputs.as_slice() {
            [] => Err(Error::InvalidArgument("a build needs at least one input")),
            [BuildInput::Instances { .. }] => Ok(AccelerationStructureKind::TopLevel),
            inputs if inputs
                .iter()
                .all(|i| !matches!(i, BuildInput::Instances { .. })) =>
            {
                Ok(AccelerationStructureKind::BottomLevel)
            }
            _ => Err(Error::InvalidArgument(
                "instances cannot be mixed with other inputs",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerationStructureSizes {
    pub acceleration_structure_size: u64,
    pub scratch_size: u64,
    pub update_scratch_size: u64,
}

/// Conservative memory requirements of a build.
pub fn acceleration_structure_sizes(
    desc: &AccelerationStructureBuildDesc,
) -> Result<AccelerationStructureSizes> {
    let kind = desc.kind()?;
    let primitives: u64 = desc.inputs.iter().map(BuildInput::primitive_count).sum();
    let node = match kind {
        AccelerationStructureKind::TopLevel => 128,
        AccelerationStructureKind::BottomLevel => 64,
    };
    let size = align_up((primitives.max(1) * node * 2).max(256), 256);
    let scratch = align_up(size / 2, 256).max(256);
    Ok(AccelerationStructureSizes {
        acceleration_structure_size: size,
        scratch_size: scratch,
        update_scratch_size: if desc.flags.contains(BuildFlags::ALLOW_UPDATE) {
            scratch
        } else {
            0
        },
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccelerationStructureDesc {
    pub kind: AccelerationStructureKind,
    pub size: u64,
    pub label: Option<String>,
}

#[derive(Clone)]
pub struct AccelerationStructure(Arc<AccelerationStructureInner>);

struct AccelerationStructureInner {
    id: ResourceId,
    desc: AccelerationStructureDesc,
    storage: Buffer,
}

impl AccelerationStructure {
    pub(crate) fn new(device: &Device, desc: AccelerationStructureDesc) -> Result<Self> {
        let storage = device.create_buffer(
            &BufferDesc {
                size: desc.size,
                usage: BufferUsage::ACCELERATION_STRUCTURE,
                memory_type: MemoryType::DeviceLocal,
                default_state: ResourceState::AccelerationStructure,
                label: desc.label.clone(),
            },
            None,
        )?;
        Ok(Self(Arc::new(AccelerationStructureInner {
            id: ResourceId::next(),
            desc,
            storage,
        })))
    }

    pub fn id(&self) -> ResourceId {
        self.0.id
    }

    pub fn kind(&self) -> AccelerationStructureKind {
        self.0.desc.kind
    }

    pub fn size(&self) -> u64 {
        self.0.desc.size
    }

    /// The buffer backing the acceleration structure. Its state is what barriers track.
    pub fn storage(&self) -> &Buffer {
        &self.0.storage
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.0.storage.device_address()
    }
}

impl HasDevice for AccelerationStructure {
    fn device(&self) -> &Device {
        self.0.storage.device()
    }
}

impl PartialEq for AccelerationStructure {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for AccelerationStructure {}

impl Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("id", &self.0.id)
            .field("kind", &self.0.desc.kind)
            .field("label", &self.0.desc.label)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShaderTableDesc {
    pub raygen: Vec<String>,
    pub miss: Vec<String>,
    pub hit_groups: Vec<String>,
    pub callable: Vec<String>,
}

/// Records of a ray tracing pipeline's shaders, selected by index at dispatch time.
#[derive(Clone)]
pub struct ShaderTable(Arc<ShaderTableInner>);

struct ShaderTableInner {
    id: ResourceId,
    pipeline: RayTracingPipeline,
    desc: ShaderTableDesc,
}

impl ShaderTable {
    pub(crate) fn new(pipeline: &RayTracingPipeline, desc: ShaderTableDesc) -> Result<Self> {
        let p = pipeline.desc();
        let known = |names: &[String], entries: &[String]| names.iter().all(|n| entries.contains(n));
        if !known(&desc.raygen, &p.raygen_entry_points)
            || !known(&desc.miss, &p.miss_entry_points)
            || !known(&desc.hit_groups, &p.hit_groups)
            || !known(&desc.callable, &p.callable_entry_points)
        {
            return Err(Error::InvalidArgument(
                "shader table names a shader the pipeline does not have",
            ));
        }
        Ok(Self(Arc::new(ShaderTableInner {
            id: ResourceId::next(),
            pipeline: pipeline.clone(),
            desc,
        })))
    }

    pub fn id(&self) -> ResourceId {
        self.0.id
    }

    pub fn pipeline(&self) -> &RayTracingPipeline {
        &self.0.pipeline
    }

    pub fn raygen_count(&self) -> u32 {
        self.0.desc.raygen.len() as u32
    }

    pub fn desc(&self) -> &ShaderTableDesc {
        &self.0.desc
    }
}

impl PartialEq for ShaderTable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for ShaderTable {}

impl Debug for ShaderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderTable")
            .field("id", &self.0.id)
            .field("raygen", &self.0.desc.raygen)
            .finish()
    }
}
