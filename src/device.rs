//! Device creation and management.
//!
//! This module provides the core [`Device`] type and [`DeviceBuilder`] for creating devices on
//! one of the supported [`Backend`]s.
//!
//! # Overview
//!
//! A device is a connection to the native driver of one backend. It owns the driver handle,
//! the debug message callback and the [`DeviceConfig`], and it creates every other object:
//!
//! - [`Device`]: The main device handle, reference-counted for cheap sharing
//! - [`DeviceBuilder`]: Fluent builder for configuring devices before creation
//! - [`DeviceConfig`]: Serializable tuning knobs
//! - [`HasDevice`]: Trait for types associated with a device
//!
//! # Quick Start
//!
//! [`Device::create_host_default`] creates a device on the host driver together with a queue:
//!
//! ```
//! # use scoria::{Backend, Device};
//! let (device, queue) = Device::create_host_default(Backend::Vulkan).unwrap();
//! ```
//!
//! # Custom Configuration
//!
//! ```
//! # use std::sync::Arc;
//! # use scoria::{Backend, Device, device::DeviceConfig, native::HostDriver, debug::DebugMessageLog};
//! let log = Arc::new(DebugMessageLog::default());
//! let device = Device::builder(Backend::D3D12)
//!     .driver(Arc::new(HostDriver::new()))
//!     .debug_callback(log.clone())
//!     .config(DeviceConfig {
//!         constant_buffer_page_size: 64 * 1024,
//!         ..Default::default()
//!     })
//!     .build()
//!     .unwrap();
//! assert_eq!(device.config().constant_buffer_page_size, 64 * 1024);
//! ```

use std::{fmt::Debug, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    Backend, Error, Result,
    alloc::{DEFAULT_ALIGNMENT, DEFAULT_PAGE_SIZE},
    api::NativeApi,
    backend::BackendCapabilities,
    buffer::{Buffer, BufferDesc},
    debug::{DebugCallback, TracingDebugCallback},
    error::native_call,
    native::{DeviceAddress, Driver, HostAddress, HostDriver, NativeOp},
    pipeline::{
        ComputePipeline, ComputePipelineDesc, RayTracingPipeline, RayTracingPipelineDesc,
        RenderPipeline, RenderPipelineDesc,
    },
    query::{QueryPool, QueryPoolDesc},
    queue::Queue,
    rtx::{AccelerationStructure, AccelerationStructureDesc, ShaderTable, ShaderTableDesc},
    sync::{Fence, FenceDesc},
    texture::{Texture, TextureDesc},
};

/// A trait for types created from a device.
pub trait HasDevice {
    fn device(&self) -> &Device;
}

/// Device-wide settings.
///
/// Missing fields take their default when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub label: Option<String>,
    /// Size of the pages of every command buffer's constant buffer pool.
    pub constant_buffer_page_size: u64,
    /// Alignment of constant buffer allocations. Must be a power of two dividing the page
    /// size.
    pub constant_buffer_alignment: u64,
    /// Emit a `trace` event for every executed command.
    pub trace_commands: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            label: None,
            constant_buffer_page_size: DEFAULT_PAGE_SIZE,
            constant_buffer_alignment: DEFAULT_ALIGNMENT,
            trace_commands: false,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        let alignment = self.constant_buffer_alignment;
        if !alignment.is_power_of_two()
            || self.constant_buffer_page_size == 0
            || self.constant_buffer_page_size % alignment != 0
        {
            return Err(Error::InvalidArgument(
                "constant buffer page size must be a non-zero multiple of a power-of-two alignment",
            ));
        }
        Ok(())
    }
}

/// A device on one backend.
///
/// This struct is reference-counted using [`Arc`] for cheap shared access. Objects created
/// from a device keep it alive.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.0.backend)
            .field("driver", &self.0.driver.name())
            .field("label", &self.0.config.label)
            .finish()
    }
}

struct DeviceInner {
    backend: Backend,
    capabilities: BackendCapabilities,
    driver: Arc<dyn Driver>,
    debug_callback: Arc<dyn DebugCallback>,
    config: DeviceConfig,
    /// Registry reference keeping a shared native driver loaded.
    _native_api: Option<NativeApi>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::info!(backend = ?self.backend, label = ?self.config.label, "device destroyed");
    }
}

impl Device {
    /// Creates a new device builder for `backend`.
    pub fn builder(backend: Backend) -> DeviceBuilder {
        DeviceBuilder::new(backend)
    }

    /// Creates a device on a fresh [`HostDriver`] with default settings, and one queue.
    pub fn create_host_default(backend: Backend) -> Result<(Self, Queue)> {
        let device = Device::builder(backend)
            .driver(Arc::new(HostDriver::new()))
            .build()?;
        let queue = device.create_queue()?;
        Ok((device, queue))
    }

    pub fn backend(&self) -> Backend {
        self.0.backend
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.0.capabilities
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.0.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.0.driver
    }

    pub fn debug_callback(&self) -> &dyn DebugCallback {
        self.0.debug_callback.as_ref()
    }

    pub fn create_queue(&self) -> Result<Queue> {
        Queue::new(self.clone())
    }

    /// Creates a buffer, optionally filled with `init_data`.
    pub fn create_buffer(&self, desc: &BufferDesc, init_data: Option<&[u8]>) -> Result<Buffer> {
        Buffer::new(self.clone(), desc, init_data)
    }

    /// Creates a texture, optionally filled with tightly packed `init_data`.
    pub fn create_texture(&self, desc: &TextureDesc, init_data: Option<&[u8]>) -> Result<Texture> {
        Texture::new(self.clone(), desc, init_data)
    }

    pub fn create_compute_pipeline(&self, desc: ComputePipelineDesc) -> Result<ComputePipeline> {
        ComputePipeline::new(self.clone(), desc)
    }

    pub fn create_render_pipeline(&self, desc: RenderPipelineDesc) -> Result<RenderPipeline> {
        RenderPipeline::new(self.clone(), desc)
    }

    pub fn create_ray_tracing_pipeline(
        &self,
        desc: RayTracingPipelineDesc,
    ) -> Result<RayTracingPipeline> {
        if !self.0.capabilities.ray_tracing {
            return Err(Error::NotAvailable("ray tracing"));
        }
        RayTracingPipeline::new(self.clone(), desc)
    }

    pub fn create_shader_table(
        &self,
        pipeline: &RayTracingPipeline,
        desc: ShaderTableDesc,
    ) -> Result<ShaderTable> {
        ShaderTable::new(pipeline, desc)
    }

    pub fn create_acceleration_structure(
        &self,
        desc: AccelerationStructureDesc,
    ) -> Result<AccelerationStructure> {
        if !self.0.capabilities.ray_tracing {
            return Err(Error::NotAvailable("ray tracing"));
        }
        AccelerationStructure::new(self, desc)
    }

    pub fn create_query_pool(&self, desc: QueryPoolDesc) -> Result<QueryPool> {
        QueryPool::new(self.clone(), desc)
    }

    pub fn create_fence(&self, desc: FenceDesc) -> Result<Fence> {
        Ok(Fence::new(self.clone(), desc))
    }

    /// Blocks until the fences reach their values.
    ///
    /// With `wait_for_all` unset, returns once any fence reached its value. Returns
    /// [`Error::TimeOut`] when `timeout_ns` elapses first; a zero timeout polls once and
    /// [`TIMEOUT_INFINITE`](crate::sync::TIMEOUT_INFINITE) never expires.
    pub fn wait_for_fences(
        &self,
        fences: &[(&Fence, u64)],
        wait_for_all: bool,
        timeout_ns: u64,
    ) -> Result<()> {
        crate::sync::wait_for_fences(fences, wait_for_all, timeout_ns)
    }

    /// Reads `size` bytes of `buffer` back to the host.
    ///
    /// Work writing the range must have completed.
    pub fn read_buffer(&self, buffer: &Buffer, offset: u64, size: u64) -> Result<Vec<u8>> {
        if offset
            .checked_add(size)
            .is_none_or(|end| end > buffer.size())
        {
            return Err(Error::InvalidArgument("buffer range is out of bounds"));
        }
        let mut data = vec![0u8; size as usize];
        native_call!(
            self,
            self.driver()
                .read_device_memory(buffer.device_address().offset(offset), &mut data)
        )?;
        Ok(data)
    }

    /// Uploads `data` to `dst` on a private stream and waits for completion.
    pub(crate) fn upload_immediate(&self, dst: DeviceAddress, data: &[u8]) -> Result<()> {
        let driver = self.driver();
        let size = data.len() as u64;
        let staging = native_call!(self, driver.allocate_host_memory(size, 16))?;
        let result = self.upload_through(staging, dst, data);
        if let Err(error) = driver.free_host_memory(staging) {
            tracing::error!(?error, "failed to free upload staging memory");
        }
        result
    }

    fn upload_through(
        &self,
        staging: HostAddress,
        dst: DeviceAddress,
        data: &[u8],
    ) -> Result<()> {
        let driver = self.driver();
        native_call!(self, driver.write_host_memory(staging, data))?;
        let stream = native_call!(self, driver.create_stream())?;
        let result = native_call!(
            self,
            driver.enqueue(
                stream,
                NativeOp::UploadMemory {
                    dst,
                    src: staging,
                    size: data.len() as u64,
                },
            )
        )
        .and_then(|()| native_call!(self, driver.synchronize_stream(stream)));
        if let Err(error) = driver.destroy_stream(stream) {
            tracing::error!(?error, "failed to destroy upload stream");
        }
        result
    }
}

/// Builder for configuring a [`Device`].
///
/// The native driver either comes from [`driver`](Self::driver) or from a loaded
/// [`NativeApi`] registry entry passed to [`native_api`](Self::native_api).
pub struct DeviceBuilder {
    backend: Backend,
    driver: Option<Arc<dyn Driver>>,
    native_api: Option<NativeApi>,
    debug_callback: Arc<dyn DebugCallback>,
    config: DeviceConfig,
}

impl DeviceBuilder {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            driver: None,
            native_api: None,
            debug_callback: Arc::new(TracingDebugCallback),
            config: DeviceConfig::default(),
        }
    }

    /// Uses `driver` directly.
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Uses the driver loaded in the registry; the device holds the registry reference.
    pub fn native_api(mut self, api: NativeApi) -> Self {
        self.native_api = Some(api);
        self
    }

    /// Receives validation and driver messages. Defaults to [`TracingDebugCallback`].
    pub fn debug_callback(mut self, callback: Arc<dyn DebugCallback>) -> Self {
        self.debug_callback = callback;
        self
    }

    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Creates the device.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the configuration is invalid, or the registry entry
    ///   belongs to another backend.
    /// - [`Error::NotAvailable`] if no driver was provided.
    pub fn build(self) -> Result<Device> {
        self.config.validate()?;
        if let Some(api) = &self.native_api
            && api.backend() != self.backend
        {
            return Err(Error::InvalidArgument(
                "native api was loaded for another backend",
            ));
        }
        let driver = match (self.driver, &self.native_api) {
            (Some(driver), _) => driver,
            (None, Some(api)) => api.driver().clone(),
            (None, None) => return Err(Error::NotAvailable("native driver")),
        };
        tracing::info!(
            backend = ?self.backend,
            driver = driver.name(),
            label = ?self.config.label,
            "device created"
        );
        Ok(Device(Arc::new(DeviceInner {
            backend: self.backend,
            capabilities: self.backend.capabilities(),
            driver,
            debug_callback: self.debug_callback,
            config: self.config,
            _native_api: self.native_api,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::BufferUsage,
        debug::{DebugMessageLog, DebugMessageType},
    };

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{ "label": "main", "trace_commands": true }"#).unwrap();
        assert_eq!(config.label.as_deref(), Some("main"));
        assert!(config.trace_commands);
        assert_eq!(config.constant_buffer_page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.constant_buffer_alignment, DEFAULT_ALIGNMENT);

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<DeviceConfig>(&json).unwrap(), config);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let result = Device::builder(Backend::Cuda)
            .driver(Arc::new(HostDriver::new()))
            .config(DeviceConfig {
                constant_buffer_alignment: 48,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn a_driver_is_required() {
        assert_eq!(
            Device::builder(Backend::Cuda).build().unwrap_err(),
            Error::NotAvailable("native driver")
        );
    }

    #[test]
    fn devices_keep_registry_references() {
        let api = NativeApi::init(Backend::D3D12, || Ok(Arc::new(HostDriver::new()))).unwrap();
        let references = NativeApi::references(Backend::D3D12);
        let device = Device::builder(Backend::D3D12)
            .native_api(api.clone())
            .build()
            .unwrap();
        assert!(Arc::ptr_eq(device.driver(), api.driver()));
        assert_eq!(NativeApi::references(Backend::D3D12), references + 1);
        drop(device);
        assert_eq!(NativeApi::references(Backend::D3D12), references);

        let mismatched = Device::builder(Backend::Cuda).native_api(api).build();
        assert!(matches!(mismatched, Err(Error::InvalidArgument(_))));
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
        assert_eq!(device.read_buffer(&buffer, 0, 8).unwrap(), vec![1, 2, 3, 4, 0, 0, 0, 0]);
        assert!(device.read_buffer(&buffer, 4, 8).is_err());
    }

    #[test]
    fn native_failures_reach_the_debug_callback() {
        let driver = Arc::new(HostDriver::new());
        let log = Arc::new(DebugMessageLog::default());
        let device = Device::builder(Backend::Cuda)
            .driver(driver.clone())
            .debug_callback(log.clone())
            .build()
            .unwrap();
        driver.fail_device_allocations(1);
        let result = device.create_buffer(
            &BufferDesc {
                size: 64,
                ..Default::default()
            },
            None,
        );
        assert_eq!(result.unwrap_err(), Error::OutOfMemory);
        let messages = log.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].ty, DebugMessageType::Error);
        assert!(messages[0].message.contains("allocate_device_memory"));
    }
}
