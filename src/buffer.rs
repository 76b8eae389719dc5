//! Linear device memory.
//!
//! A [`Buffer`] is a cheaply clonable handle. Command records hold clones, so a buffer stays
//! alive while any command buffer that references it can still execute.
//!
//! # Memory types
//!
//! - [`MemoryType::DeviceLocal`]: GPU memory. The only memory type whose state is tracked.
//! - [`MemoryType::Upload`]: written by the host, read by the device.
//! - [`MemoryType::ReadBack`]: written by the device, read by the host.

use std::{fmt::Debug, sync::Arc};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{
    Device, HasDevice, Result,
    error::native_call,
    native::DeviceAddress,
    tracking::ResourceState,
    utils::ResourceId,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BufferUsage: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const CONSTANT_BUFFER = 1 << 2;
        const SHADER_RESOURCE = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const INDIRECT_ARGUMENT = 1 << 5;
        const COPY_SOURCE = 1 << 6;
        const COPY_DESTINATION = 1 << 7;
        const STREAM_OUTPUT = 1 << 8;
        const ACCELERATION_STRUCTURE = 1 << 9;
        const ACCELERATION_STRUCTURE_BUILD_INPUT = 1 << 10;
        const SHADER_TABLE = 1 << 11;
    }
}

impl BufferUsage {
    /// Whether a buffer with this usage may be put in `state`.
    pub fn allows(self, state: ResourceState) -> bool {
        use ResourceState::*;
        match state {
            Undefined | General => true,
            VertexBuffer => self.contains(Self::VERTEX_BUFFER),
            IndexBuffer => self.contains(Self::INDEX_BUFFER),
            ConstantBuffer => self.contains(Self::CONSTANT_BUFFER),
            StreamOutput => self.contains(Self::STREAM_OUTPUT),
            ShaderResource => self.intersects(Self::SHADER_RESOURCE | Self::SHADER_TABLE),
            UnorderedAccess => self.contains(Self::UNORDERED_ACCESS),
            IndirectArgument => self.contains(Self::INDIRECT_ARGUMENT),
            CopySource => self.contains(Self::COPY_SOURCE),
            CopyDestination => self.contains(Self::COPY_DESTINATION),
            AccelerationStructure => self.contains(Self::ACCELERATION_STRUCTURE),
            AccelerationStructureBuildInput => {
                self.contains(Self::ACCELERATION_STRUCTURE_BUILD_INPUT)
            }
            RenderTarget | DepthRead | DepthWrite | Present | ResolveSource
            | ResolveDestination => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryType {
    #[default]
    DeviceLocal,
    Upload,
    ReadBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory_type: MemoryType,
    /// The state the buffer is returned to at the end of every command buffer.
    pub default_state: ResourceState,
    pub label: Option<String>,
}

#[derive(Clone)]
pub struct Buffer(Arc<BufferInner>);

struct BufferInner {
    device: Device,
    id: ResourceId,
    desc: BufferDesc,
    address: DeviceAddress,
}

impl HasDevice for Buffer {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Buffer {}

impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.0.id)
            .field("label", &self.0.desc.label)
            .field("size", &self.0.desc.size)
            .field("address", &self.0.address)
            .finish()
    }
}

impl Buffer {
    pub(crate) fn new(device: Device, desc: &BufferDesc, init_data: Option<&[u8]>) -> Result<Self> {
        if desc.size == 0 {
            return Err(crate::Error::InvalidArgument("buffer size must not be zero"));
        }
        if let Some(data) = init_data
            && data.len() as u64 > desc.size
        {
            return Err(crate::Error::InvalidArgument(
                "initial data is larger than the buffer",
            ));
        }
        let address = native_call!(device, device.driver().allocate_device_memory(desc.size, 256))?;
        let buffer = Buffer(Arc::new(BufferInner {
            device,
            id: ResourceId::next(),
            desc: desc.clone(),
            address,
        }));
        if let Some(data) = init_data
            && !data.is_empty()
        {
            buffer.device().upload_immediate(address, data)?;
        }
        Ok(buffer)
    }

    pub fn id(&self) -> ResourceId {
        self.0.id
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.0.desc
    }

    pub fn size(&self) -> u64 {
        self.0.desc.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.0.desc.usage
    }

    pub fn memory_type(&self) -> MemoryType {
        self.0.desc.memory_type
    }

    pub fn default_state(&self) -> ResourceState {
        self.0.desc.default_state
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.0.address
    }

    /// Whether the state tracker follows this buffer.
    pub fn is_tracked(&self) -> bool {
        self.0.desc.memory_type == MemoryType::DeviceLocal
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Err(error) = self.device.driver().free_device_memory(self.address) {
            tracing::error!(?error, id = ?self.id, "failed to free buffer memory");
        }
    }
}

/// A buffer together with a byte offset into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferOffset {
    pub buffer: Buffer,
    pub offset: u64,
}

impl BufferOffset {
    pub fn new(buffer: &Buffer, offset: u64) -> Self {
        Self {
            buffer: buffer.clone(),
            offset,
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.buffer.device_address().offset(self.offset)
    }
}

impl From<&Buffer> for BufferOffset {
    fn from(buffer: &Buffer) -> Self {
        BufferOffset::new(buffer, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Backend, Error};

    #[test]
    fn usage_gates_states() {
        let usage = BufferUsage::COPY_SOURCE | BufferUsage::UNORDERED_ACCESS;
        assert!(usage.allows(ResourceState::CopySource));
        assert!(usage.allows(ResourceState::UnorderedAccess));
        assert!(usage.allows(ResourceState::General));
        assert!(!usage.allows(ResourceState::CopyDestination));
        assert!(!usage.allows(ResourceState::RenderTarget));
    }

    #[test]
    fn initial_data_is_uploaded() {
        let (device, _queue) = Device::create_host_default(Backend::Cuda).unwrap();
        let buffer = device
            .create_buffer(
                &BufferDesc {
                    size: 8,
                    usage: BufferUsage::COPY_SOURCE,
                    ..Default::default()
                },
                Some(&[1, 2, 3, 4]),
            )
            .unwrap();
        assert!(buffer.is_tracked());
        assert_eq!(
            device.read_buffer(&buffer, 0, 8).unwrap(),
            vec![1, 2, 3, 4, 0, 0, 0, 0]
        );
    }

    #[test]
    fn invalid_descriptions() {
        let (device, _queue) = Device::create_host_default(Backend::Cuda).unwrap();
        assert!(matches!(
            device.create_buffer(&BufferDesc::default(), None),
            Err(Error::InvalidArgument(_))
        ));
        let desc = BufferDesc {
            size: 2,
            ..Default::default()
        };
        assert!(matches!(
            device.create_buffer(&desc, Some(&[0; 3])),
            Err(Error::InvalidArgument(_))
        ));
    }
}
