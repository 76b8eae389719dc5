//! Copy, clear, upload and query resolve commands.

use crate::{
    Error, Result,
    buffer::Buffer,
    query::QueryPool,
    texture::{ClearValue, Extent3d, Offset3d, SubresourceRange, Texture},
};

use super::{
    Command, CommandEncoder, TextureClear, TextureCopy, TextureToBufferCopy, TextureUpload,
    compute::check_buffer_range,
};

fn check_texture_range(texture: &Texture, range: SubresourceRange) -> Result<()> {
    if range.fits(texture.desc()) {
        Ok(())
    } else {
        Err(Error::InvalidArgument("subresource range is out of bounds"))
    }
}

impl CommandEncoder {
    pub fn copy_buffer(
        &mut self,
        dst: &Buffer,
        dst_offset: u64,
        src: &Buffer,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        check_buffer_range(dst, dst_offset, size)?;
        check_buffer_range(src, src_offset, size)?;
        self.push(Command::CopyBuffer {
            dst: dst.clone(),
            dst_offset,
            src: src.clone(),
            src_offset,
            size,
        });
        Ok(())
    }

    pub fn copy_texture(&mut self, copy: TextureCopy) -> Result<()> {
        check_texture_range(&copy.dst, copy.dst_range)?;
        check_texture_range(&copy.src, copy.src_range)?;
        self.push(Command::CopyTexture(copy));
        Ok(())
    }

    pub fn copy_texture_to_buffer(&mut self, copy: TextureToBufferCopy) -> Result<()> {
        check_texture_range(&copy.src, copy.src_range)?;
        check_buffer_range(&copy.dst, copy.dst_offset, copy.dst_size)?;
        let row_size = copy.extent.width as u64 * copy.src.desc().format.bytes_per_texel() as u64;
        if copy.dst_row_pitch < row_size {
            return Err(Error::InvalidArgument("row pitch is smaller than a row"));
        }
        self.push(Command::CopyTextureToBuffer(copy));
        Ok(())
    }

    /// Zeroes `size` bytes of `buffer` starting at `offset`.
    pub fn clear_buffer(&mut self, buffer: &Buffer, offset: u64, size: u64) -> Result<()> {
        check_buffer_range(buffer, offset, size)?;
        self.push(Command::ClearBuffer {
            buffer: buffer.clone(),
            offset,
            size,
        });
        Ok(())
    }

    /// Clears a range of `texture`. Depth formats clear their depth and, if present, stencil
    /// aspects.
    pub fn clear_texture(
        &mut self,
        texture: &Texture,
        range: SubresourceRange,
        value: ClearValue,
    ) -> Result<()> {
        let format = texture.desc().format;
        self.clear_texture_aspects(texture, range, value, format.is_depth(), format.has_stencil())
    }

    /// Clears only the selected aspects of a depth-stencil texture.
    pub fn clear_texture_aspects(
        &mut self,
        texture: &Texture,
        range: SubresourceRange,
        value: ClearValue,
        depth: bool,
        stencil: bool,
    ) -> Result<()> {
        check_texture_range(texture, range)?;
        let format = texture.desc().format;
        if (depth && !format.is_depth()) || (stencil && !format.has_stencil()) {
            return Err(Error::InvalidArgument(
                "the texture format has no such aspect",
            ));
        }
        self.push(Command::ClearTexture(TextureClear {
            texture: texture.clone(),
            range,
            value,
            depth,
            stencil,
        }));
        Ok(())
    }

    /// Copies `data` into the command buffer and uploads it when the buffer executes.
    pub fn upload_buffer_data(&mut self, dst: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        check_buffer_range(dst, offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }
        let data = self.list_mut().write_bytes(data);
        self.push(Command::UploadBufferData {
            dst: dst.clone(),
            offset,
            data,
        });
        Ok(())
    }

    /// Uploads tightly packed texels into a region of `dst`.
    pub fn upload_texture_data(
        &mut self,
        dst: &Texture,
        range: SubresourceRange,
        offset: Offset3d,
        extent: Extent3d,
        data: &[u8],
    ) -> Result<()> {
        check_texture_range(dst, range)?;
        let range = range.resolve(dst.desc());
        let expected = extent.width as u64
            * extent.height as u64
            * extent.depth as u64
            * dst.desc().format.bytes_per_texel() as u64
            * range.layer_count as u64
            * range.mip_count as u64;
        if data.len() as u64 != expected {
            return Err(Error::InvalidArgument(
                "upload size does not match the texture region",
            ));
        }
        let data = self.list_mut().write_bytes(data);
        self.push(Command::UploadTextureData(TextureUpload {
            dst: dst.clone(),
            range,
            offset,
            extent,
            data,
        }));
        Ok(())
    }

    /// Copies `count` query results starting at `index` into `buffer` as `u64` values.
    pub fn resolve_query(
        &mut self,
        pool: &QueryPool,
        index: u32,
        count: u32,
        buffer: &Buffer,
        offset: u64,
    ) -> Result<()> {
        if index
            .checked_add(count)
            .is_none_or(|end| end > pool.count())
        {
            return Err(Error::InvalidArgument("query range out of range"));
        }
        check_buffer_range(buffer, offset, count as u64 * 8)?;
        self.push(Command::ResolveQuery {
            pool: pool.clone(),
            index,
            count,
            buffer: buffer.clone(),
            offset,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        Backend, Device,
        buffer::{BufferDesc, BufferUsage},
        native::{HostDriver, NativeOp},
        queue::SubmitDesc,
        texture::{ClearValue, Extent3d, Format, Offset3d, SubresourceRange, TextureDesc, TextureUsage},
        tracking::ResourceState,
    };

    fn buffer_desc(size: u64) -> BufferDesc {
        BufferDesc {
            size,
            usage: BufferUsage::COPY_SOURCE | BufferUsage::COPY_DESTINATION,
            ..Default::default()
        }
    }

    #[test]
    fn ranges_are_checked_when_recording() {
        let (device, queue) = Device::create_host_default(Backend::Cuda).unwrap();
        let small = device.create_buffer(&buffer_desc(16), None).unwrap();
        let large = device.create_buffer(&buffer_desc(64), None).unwrap();
        let mut encoder = queue.create_command_encoder().unwrap();
        assert!(encoder.copy_buffer(&small, 0, &large, 0, 32).is_err());
        assert!(encoder.clear_buffer(&small, 8, 9).is_err());
        assert!(encoder.clear_buffer(&small, u64::MAX, 2).is_err());
        assert!(encoder.upload_buffer_data(&small, 12, &[0; 8]).is_err());
        assert!(encoder.list().is_empty());
        encoder.upload_buffer_data(&small, 0, &[]).unwrap();
        assert!(encoder.list().is_empty());
    }

    #[test]
    fn copies_and_clears_reach_memory() {
        let driver = Arc::new(HostDriver::new());
        let device = Device::builder(Backend::Vulkan)
            .driver(driver.clone())
            .build()
            .unwrap();
        let queue = device.create_queue().unwrap();
        let src = device
            .create_buffer(&buffer_desc(8), Some(&[1, 2, 3, 4, 5, 6, 7, 8]))
            .unwrap();
        let dst = device.create_buffer(&buffer_desc(8), None).unwrap();

        let mut encoder = queue.create_command_encoder().unwrap();
        encoder.copy_buffer(&dst, 0, &src, 0, 8).unwrap();
        encoder.clear_buffer(&dst, 2, 4).unwrap();
        queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
        queue.wait_on_host().unwrap();

        assert_eq!(
            device.read_buffer(&dst, 0, 8).unwrap(),
            vec![1, 2, 0, 0, 0, 0, 7, 8]
        );
    }

    #[test]
    fn texture_uploads_need_matching_sizes() {
        let driver = Arc::new(HostDriver::new());
        let device = Device::builder(Backend::D3D12)
            .driver(driver.clone())
            .build()
            .unwrap();
        let queue = device.create_queue().unwrap();
        let texture = device
            .create_texture(
                &TextureDesc {
                    size: Extent3d::new(4, 4, 1),
                    usage: TextureUsage::COPY_DESTINATION | TextureUsage::SHADER_RESOURCE,
                    default_state: ResourceState::ShaderResource,
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        let mut encoder = queue.create_command_encoder().unwrap();
        let extent = Extent3d::new(2, 2, 1);
        assert!(
            encoder
                .upload_texture_data(&texture, SubresourceRange::ENTIRE, Offset3d::default(), extent, &[0; 15])
                .is_err()
        );
        encoder
            .upload_texture_data(&texture, SubresourceRange::ENTIRE, Offset3d::default(), extent, &[0; 16])
            .unwrap();
        queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();

        let ops = driver.ops_on(queue.stream());
        assert!(matches!(
            ops.first(),
            Some(NativeOp::Barrier(_))
        ));
        assert!(ops
            .iter()
            .any(|op| matches!(op, NativeOp::UploadTexture { size: 16, .. })));
    }

    #[test]
    fn color_textures_have_no_depth_aspect() {
        let (device, queue) = Device::create_host_default(Backend::D3D12).unwrap();
        let color = device
            .create_texture(
                &TextureDesc {
                    usage: TextureUsage::COPY_DESTINATION,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let depth = device
            .create_texture(
                &TextureDesc {
                    format: Format::D32Float,
                    usage: TextureUsage::DEPTH_WRITE | TextureUsage::COPY_DESTINATION,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let mut encoder = queue.create_command_encoder().unwrap();
        let value = ClearValue::default();
        assert!(
            encoder
                .clear_texture_aspects(&color, SubresourceRange::ENTIRE, value, true, false)
                .is_err()
        );
        assert!(
            encoder
                .clear_texture_aspects(&depth, SubresourceRange::ENTIRE, value, false, true)
                .is_err()
        );
        encoder
            .clear_texture(&depth, SubresourceRange::ENTIRE, value)
            .unwrap();
        assert_eq!(encoder.list().len(), 1);
    }
}
