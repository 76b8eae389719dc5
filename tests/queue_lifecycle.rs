use std::sync::Arc;

use scoria::{
    Backend, Device, Error,
    api::NativeApi,
    buffer::{Buffer, BufferDesc, BufferUsage},
    command::CommandBufferState,
    native::{Driver, HostDriver, NativeOp},
    queue::SubmitDesc,
    sync::{FenceDesc, TIMEOUT_INFINITE},
};

fn copy_buffer(device: &Device, size: u64) -> Buffer {
    device
        .create_buffer(
            &BufferDesc {
                size,
                usage: BufferUsage::COPY_SOURCE | BufferUsage::COPY_DESTINATION,
                ..Default::default()
            },
            None,
        )
        .unwrap()
}

fn without_barriers(ops: Vec<NativeOp>) -> Vec<NativeOp> {
    ops.into_iter()
        .filter(|op| !matches!(op, NativeOp::Barrier(_)))
        .collect()
}

#[test]
fn commands_execute_in_record_order_on_every_backend() {
    for backend in Backend::ALL {
        let driver = Arc::new(HostDriver::new());
        let device = Device::builder(backend)
            .driver(driver.clone())
            .build()
            .unwrap();
        let queue = device.create_queue().unwrap();
        let a = copy_buffer(&device, 8);
        let b = copy_buffer(&device, 8);

        let mut encoder = queue.create_command_encoder().unwrap();
        encoder
            .upload_buffer_data(&a, 0, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        encoder.copy_buffer(&b, 0, &a, 0, 8).unwrap();
        encoder.clear_buffer(&b, 4, 4).unwrap();
        encoder.upload_buffer_data(&a, 0, &[9; 8]).unwrap();
        queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
        queue.wait_on_host().unwrap();

        let ops = without_barriers(driver.ops_on(queue.stream()));
        let kinds: Vec<&str> = ops
            .iter()
            .map(|op| match op {
                NativeOp::UploadMemory { .. } => "upload",
                NativeOp::CopyMemory { .. } => "copy",
                NativeOp::FillMemory { .. } => "fill",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["upload", "copy", "fill", "upload"], "{backend:?}");
        assert_eq!(
            device.read_buffer(&b, 0, 8).unwrap(),
            vec![1, 2, 3, 4, 0, 0, 0, 0],
            "{backend:?}"
        );
        assert_eq!(device.read_buffer(&a, 0, 8).unwrap(), vec![9; 8], "{backend:?}");
    }
}

#[test]
fn reset_buffers_behave_like_new_ones() {
    let driver = Arc::new(HostDriver::new());
    let device = Device::builder(Backend::Vulkan)
        .driver(driver.clone())
        .build()
        .unwrap();
    let queue = device.create_queue().unwrap();
    let target = copy_buffer(&device, 16);

    let mut encoder = queue.create_command_encoder().unwrap();
    encoder.upload_buffer_data(&target, 0, &[5; 16]).unwrap();
    encoder.push_debug_group("discarded", [1.0, 0.0, 0.0]);
    let mut command_buffer = encoder.finish();
    assert_eq!(command_buffer.state(), CommandBufferState::Finished);

    command_buffer.reset().unwrap();
    command_buffer.reset().unwrap();
    assert_eq!(command_buffer.state(), CommandBufferState::Recording);
    assert!(command_buffer.list().is_empty());

    let mut encoder = command_buffer.encode().unwrap();
    encoder.clear_buffer(&target, 0, 16).unwrap();
    queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
    queue.wait_on_host().unwrap();

    let ops = without_barriers(driver.ops_on(queue.stream()));
    assert_eq!(
        ops,
        vec![NativeOp::FillMemory {
            dst: target.device_address(),
            size: 16,
            value: 0,
        }]
    );
}

#[test]
fn staging_pages_are_reused_only_after_completion() {
    let driver = Arc::new(HostDriver::manual());
    let device = Device::builder(Backend::Cuda)
        .driver(driver.clone())
        .build()
        .unwrap();
    let queue = device.create_queue().unwrap();
    let first = copy_buffer(&device, 16);
    let second = copy_buffer(&device, 16);

    let upload = |target: &Buffer, value: u8| {
        let mut encoder = queue.create_command_encoder().unwrap();
        encoder.upload_buffer_data(target, 0, &[value; 16]).unwrap();
        queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
    };
    let sources = || -> Vec<u64> {
        driver
            .ops_on(queue.stream())
            .into_iter()
            .filter_map(|op| match op {
                NativeOp::UploadMemory { src, size: 16, .. } => Some(src.0),
                _ => None,
            })
            .collect()
    };

    upload(&first, 1);
    upload(&second, 2);
    assert!(driver.pending_on(queue.stream()) > 0);
    let pending = sources();
    assert_ne!(pending[0], pending[1]);

    driver.advance_all();
    queue.retire_command_buffers().unwrap();
    assert_eq!(queue.in_flight_count(), 0);
    assert_eq!(device.read_buffer(&first, 0, 16).unwrap(), vec![1; 16]);
    assert_eq!(device.read_buffer(&second, 0, 16).unwrap(), vec![2; 16]);

    upload(&first, 3);
    let reused = sources()[2];
    assert!(pending.contains(&reused));
    queue.wait_on_host().unwrap();
    assert_eq!(device.read_buffer(&first, 0, 16).unwrap(), vec![3; 16]);
}

#[test]
fn waits_observe_signals_from_other_queues() {
    let driver = Arc::new(HostDriver::manual());
    let device = Device::builder(Backend::D3D12)
        .driver(driver.clone())
        .build()
        .unwrap();
    let producer = device.create_queue().unwrap();
    let consumer = device.create_queue().unwrap();
    let fence = device.create_fence(FenceDesc::default()).unwrap();
    let target = copy_buffer(&device, 32);

    let mut encoder = producer.create_command_encoder().unwrap();
    encoder.upload_buffer_data(&target, 0, &[4; 32]).unwrap();
    producer
        .submit(SubmitDesc::new([encoder.finish()]).signal(&fence, 1))
        .unwrap();
    assert_eq!(fence.last_signalled_value(), 1);
    assert_eq!(
        device.wait_for_fences(&[(&fence, 1)], true, 0),
        Err(Error::TimeOut)
    );
    assert_eq!(fence.get_current_value().unwrap(), 0);

    let mut encoder = consumer.create_command_encoder().unwrap();
    let copy = copy_buffer(&device, 32);
    encoder.copy_buffer(&copy, 0, &target, 0, 32).unwrap();
    consumer
        .submit(SubmitDesc::new([encoder.finish()]).wait(&fence, 1))
        .unwrap();

    driver.advance_all();
    device
        .wait_for_fences(&[(&fence, 1)], true, TIMEOUT_INFINITE)
        .unwrap();
    consumer.wait_on_host().unwrap();
    assert_eq!(device.read_buffer(&copy, 0, 32).unwrap(), vec![4; 32]);
}

#[test]
fn registry_drivers_outlive_their_devices_only_while_referenced() {
    let loaded = Arc::new(HostDriver::new());
    let api = NativeApi::init(Backend::Cuda, {
        let loaded = loaded.clone();
        move || Ok(loaded as Arc<dyn Driver>)
    })
    .unwrap();
    let device = Device::builder(Backend::Cuda)
        .native_api(api.clone())
        .build()
        .unwrap();
    let again = NativeApi::init(Backend::Cuda, || Err(Error::NotAvailable("reloaded")))
        .unwrap();
    assert_eq!(NativeApi::references(Backend::Cuda), 3);

    let queue = device.create_queue().unwrap();
    let buffer = copy_buffer(&device, 4);
    let mut encoder = queue.create_command_encoder().unwrap();
    encoder.upload_buffer_data(&buffer, 0, &[1, 2, 3, 4]).unwrap();
    queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
    queue.wait_on_host().unwrap();
    assert!(!loaded.ops_on(queue.stream()).is_empty());

    again.shutdown();
    api.shutdown();
    assert_eq!(NativeApi::references(Backend::Cuda), 1);
    drop((buffer, queue, device));
    assert_eq!(NativeApi::references(Backend::Cuda), 0);
}
