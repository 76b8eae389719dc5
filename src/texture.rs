//! Textures and subresource ranges.
//!
//! Textures are tracked per subresource. A subresource is one mip level of one array layer;
//! cube textures have six layers per array element.

use std::{fmt::Debug, sync::Arc};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{
    Device, Error, HasDevice, Result,
    buffer::MemoryType,
    error::native_call,
    native::DeviceAddress,
    tracking::ResourceState,
    utils::ResourceId,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct TextureUsage: u32 {
        const SHADER_RESOURCE = 1 << 0;
        const UNORDERED_ACCESS = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const DEPTH_READ = 1 << 3;
        const DEPTH_WRITE = 1 << 4;
        const PRESENT = 1 << 5;
        const COPY_SOURCE = 1 << 6;
        const COPY_DESTINATION = 1 << 7;
        const RESOLVE_SOURCE = 1 << 8;
        const RESOLVE_DESTINATION = 1 << 9;
    }
}

impl TextureUsage {
    /// Whether a texture with this usage may be put in `state`.
    pub fn allows(self, state: ResourceState) -> bool {
        use ResourceState::*;
        match state {
            Undefined | General => true,
            ShaderResource => self.contains(Self::SHADER_RESOURCE),
            UnorderedAccess => self.contains(Self::UNORDERED_ACCESS),
            RenderTarget => self.contains(Self::RENDER_TARGET),
            DepthRead => self.intersects(Self::DEPTH_READ | Self::DEPTH_WRITE),
            DepthWrite => self.contains(Self::DEPTH_WRITE),
            Present => self.contains(Self::PRESENT),
            CopySource => self.contains(Self::COPY_SOURCE),
            CopyDestination => self.contains(Self::COPY_DESTINATION),
            ResolveSource => self.contains(Self::RESOLVE_SOURCE),
            ResolveDestination => self.contains(Self::RESOLVE_DESTINATION),
            VertexBuffer | IndexBuffer | ConstantBuffer | StreamOutput | IndirectArgument
            | AccelerationStructure | AccelerationStructureBuildInput => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureType {
    Texture1D,
    #[default]
    Texture2D,
    Texture3D,
    TextureCube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Format {
    R8Unorm,
    Rg8Unorm,
    #[default]
    Rgba8Unorm,
    Bgra8Unorm,
    R16Float,
    Rgba16Float,
    R32Uint,
    R32Float,
    Rg32Float,
    Rgba32Float,
    D16Unorm,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Format::R8Unorm => 1,
            Format::Rg8Unorm | Format::R16Float | Format::D16Unorm => 2,
            Format::Rgba8Unorm
            | Format::Bgra8Unorm
            | Format::R32Uint
            | Format::R32Float
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::Rgba16Float | Format::Rg32Float => 8,
            Format::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Format::D16Unorm | Format::D32Float | Format::D24UnormS8Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        self == Format::D24UnormS8Uint
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3d {
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub fn mip(self, level: u32) -> Extent3d {
        Extent3d {
            width: (self.width >> level).max(1),
            height: (self.height >> level).max(1),
            depth: (self.depth >> level).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Offset3d {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClearValue {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u8,
}

/// Array layers and mip levels of a texture.
///
/// A count of zero extends the range to the last layer or mip level, so
/// `SubresourceRange::default()` names the whole texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SubresourceRange {
    pub layer: u32,
    pub layer_count: u32,
    pub mip: u32,
    pub mip_count: u32,
}

impl SubresourceRange {
    pub const ENTIRE: SubresourceRange = SubresourceRange {
        layer: 0,
        layer_count: 0,
        mip: 0,
        mip_count: 0,
    };

    pub fn single(layer: u32, mip: u32) -> Self {
        Self {
            layer,
            layer_count: 1,
            mip,
            mip_count: 1,
        }
    }

    /// Replaces zero counts with the remaining layers and mip levels of `desc`.
    pub fn resolve(self, desc: &TextureDesc) -> SubresourceRange {
        let layers = desc.array_layer_count();
        let mips = desc.mip_count.max(1);
        SubresourceRange {
            layer: self.layer,
            layer_count: if self.layer_count == 0 {
                layers.saturating_sub(self.layer)
            } else {
                self.layer_count
            },
            mip: self.mip,
            mip_count: if self.mip_count == 0 {
                mips.saturating_sub(self.mip)
            } else {
                self.mip_count
            },
        }
    }

    pub fn is_entire(self, desc: &TextureDesc) -> bool {
        let range = self.resolve(desc);
        range.layer == 0
            && range.mip == 0
            && range.layer_count == desc.array_layer_count()
            && range.mip_count == desc.mip_count.max(1)
    }

    pub fn fits(self, desc: &TextureDesc) -> bool {
        let range = self.resolve(desc);
        range.layer + range.layer_count <= desc.array_layer_count()
            && range.mip + range.mip_count <= desc.mip_count.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureDesc {
    pub ty: TextureType,
    pub size: Extent3d,
    pub array_length: u32,
    pub mip_count: u32,
    pub sample_count: u32,
    pub format: Format,
    pub usage: TextureUsage,
    pub memory_type: MemoryType,
    /// The state every subresource is returned to at the end of every command buffer.
    pub default_state: ResourceState,
    pub label: Option<String>,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            ty: TextureType::Texture2D,
            size: Extent3d::new(1, 1, 1),
            array_length: 1,
            mip_count: 1,
            sample_count: 1,
            format: Format::Rgba8Unorm,
            usage: TextureUsage::empty(),
            memory_type: MemoryType::DeviceLocal,
            default_state: ResourceState::Undefined,
            label: None,
        }
    }
}

impl TextureDesc {
    /// Number of array layers. Cube textures count six layers per array element.
    pub fn array_layer_count(&self) -> u32 {
        let length = self.array_length.max(1);
        match self.ty {
            TextureType::TextureCube => length * 6,
            _ => length,
        }
    }

    pub fn subresource_count(&self) -> u32 {
        self.array_layer_count() * self.mip_count.max(1)
    }

    pub fn subresource_size(&self, mip: u32) -> u64 {
        let extent = self.size.mip(mip);
        extent.width as u64
            * extent.height as u64
            * extent.depth as u64
            * self.format.bytes_per_texel() as u64
    }

    /// Bytes of backing memory, all mips of one layer followed by the next layer.
    pub fn memory_size(&self) -> u64 {
        let layer: u64 = (0..self.mip_count.max(1))
            .map(|mip| self.subresource_size(mip))
            .sum();
        layer * self.array_layer_count() as u64 * self.sample_count.max(1) as u64
    }
}

#[derive(Clone)]
pub struct Texture(Arc<TextureInner>);

struct TextureInner {
    device: Device,
    id: ResourceId,
    desc: TextureDesc,
    address: DeviceAddress,
}

impl HasDevice for Texture {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl PartialEq for Texture {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Texture {}

impl Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.0.id)
            .field("label", &self.0.desc.label)
            .field("ty", &self.0.desc.ty)
            .field("size", &self.0.desc.size)
            .finish()
    }
}

impl Texture {
    pub(crate) fn new(device: Device, desc: &TextureDesc, init_data: Option<&[u8]>) -> Result<Self> {
        if desc.size.width == 0 || desc.size.height == 0 || desc.size.depth == 0 {
            return Err(Error::InvalidArgument("texture extent must not be zero"));
        }
        if desc.ty == TextureType::Texture3D && desc.array_length > 1 {
            return Err(Error::InvalidArgument("3D textures cannot be arrays"));
        }
        let size = desc.memory_size();
        if let Some(data) = init_data
            && data.len() as u64 > size
        {
            return Err(Error::InvalidArgument(
                "initial data is larger than the texture",
            ));
        }
        let address = native_call!(device, device.driver().allocate_device_memory(size, 256))?;
        let texture = Texture(Arc::new(TextureInner {
            device,
            id: ResourceId::next(),
            desc: desc.clone(),
            address,
        }));
        if let Some(data) = init_data
            && !data.is_empty()
        {
            texture.device().upload_immediate(address, data)?;
        }
        Ok(texture)
    }

    pub fn id(&self) -> ResourceId {
        self.0.id
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.0.desc
    }

    pub fn usage(&self) -> TextureUsage {
        self.0.desc.usage
    }

    pub fn default_state(&self) -> ResourceState {
        self.0.desc.default_state
    }

    pub fn array_layer_count(&self) -> u32 {
        self.0.desc.array_layer_count()
    }

    pub fn mip_count(&self) -> u32 {
        self.0.desc.mip_count.max(1)
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.0.address
    }

    pub fn is_tracked(&self) -> bool {
        self.0.desc.memory_type == MemoryType::DeviceLocal
    }
}

impl Drop for TextureInner {
    fn drop(&mut self) {
        if let Err(error) = self.device.driver().free_device_memory(self.address) {
            tracing::error!(?error, id = ?self.id, "failed to free texture memory");
        }
    }
}
