//! # Scoria
//!
//! Backend-agnostic command recording for Vulkan, D3D12 and CUDA style GPU APIs.
//!
//! Scoria records GPU work into backend-neutral command lists, tracks the state of every
//! resource the commands touch, and replays the lists through a per-backend executor that
//! emits the minimal set of barriers and native calls. Work is ordered across queues and
//! the host with timeline [`Fence`](sync::Fence)s.
//!
//! ## Quick Start
//!
//! ```
//! use scoria::prelude::*;
//!
//! let (device, queue) = Device::create_host_default(Backend::Vulkan).unwrap();
//! let buffer = device
//!     .create_buffer(
//!         &BufferDesc {
//!             size: 16,
//!             usage: BufferUsage::COPY_DESTINATION | BufferUsage::COPY_SOURCE,
//!             ..Default::default()
//!         },
//!         None,
//!     )
//!     .unwrap();
//!
//! let mut encoder = queue.create_command_encoder().unwrap();
//! encoder.upload_buffer_data(&buffer, 4, &[1, 2, 3, 4]).unwrap();
//! queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
//! queue.wait_on_host().unwrap();
//!
//! assert_eq!(device.read_buffer(&buffer, 4, 4).unwrap(), vec![1, 2, 3, 4]);
//! ```
//!
//! ## Overview
//!
//! ### Devices and Drivers
//!
//! A [`Device`] talks to a [`Driver`](native::Driver), the thin layer of native calls every
//! backend provides. [`HostDriver`](native::HostDriver) implements it in host memory and
//! records every operation it receives, which makes it suitable for tests and tooling.
//! Drivers shared by several devices are loaded once per process through
//! [`NativeApi`](api::NativeApi).
//!
//! ### Command Recording
//!
//! A [`Queue`] hands out [`CommandEncoder`](command::CommandEncoder)s. Encoders record
//! copies, clears and uploads directly, and open compute, render and ray tracing passes for
//! dispatches and draws. [`CommandEncoder::finish`](command::CommandEncoder::finish) yields
//! a [`CommandBuffer`](command::CommandBuffer) for [`Queue::submit`]. Submitted command
//! buffers return to the queue's pool once the GPU finished them.
//!
//! ### State Tracking
//!
//! Buffers and textures have a default [`ResourceState`](tracking::ResourceState). Backends
//! with explicit barriers transition resources into the state each command needs and back
//! to the default state at the end of every command buffer, so command buffers can be
//! submitted in any order.
//!
//! ### Synchronization
//!
//! - [`Fence`](sync::Fence): monotonically increasing timeline value, signaled by the host
//!   or a queue and waited on by either.
//! - [`Queue::wait_on_host`]: blocks until all submitted work finished.

pub mod alloc;
pub mod api;
pub mod backend;
pub mod buffer;
pub mod command;
pub mod debug;
pub mod device;
pub mod error;
mod executor;
pub mod native;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod rtx;
pub mod sync;
pub mod texture;
pub mod tracking;
pub mod utils;

pub use backend::Backend;
pub use device::{Device, DeviceBuilder, DeviceConfig, HasDevice};
pub use error::{Error, Result};
pub use queue::Queue;

pub mod prelude {
    pub use crate::{
        Backend, Device, Error, HasDevice, Queue, Result,
        buffer::{Buffer, BufferDesc, BufferOffset, BufferUsage},
        command::{CommandBuffer, CommandEncoder},
        pipeline::ShaderObject,
        queue::SubmitDesc,
        sync::{Fence, FenceDesc},
        texture::{Format, Texture, TextureDesc, TextureUsage},
        tracking::ResourceState,
    };
}
