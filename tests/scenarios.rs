use std::sync::Arc;

use scoria::{
    Backend, Device, Error,
    alloc::ConstantBufferPool,
    buffer::{BufferDesc, BufferUsage},
    native::{Barrier, HostDriver, NativeOp},
    queue::SubmitDesc,
    sync::FenceDesc,
    tracking::ResourceState,
};

fn host_device(backend: Backend) -> (Device, Arc<HostDriver>) {
    let driver = Arc::new(HostDriver::new());
    let device = Device::builder(backend)
        .driver(driver.clone())
        .build()
        .unwrap();
    (device, driver)
}

#[test]
fn fence_values_only_move_forward() {
    let (device, _driver) = host_device(Backend::Cuda);
    let fence = device
        .create_fence(FenceDesc {
            initial_value: 5,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(fence.get_current_value().unwrap(), 5);

    assert!(matches!(
        fence.set_current_value(3),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(fence.get_current_value().unwrap(), 5);

    fence.set_current_value(10).unwrap();
    assert_eq!(fence.get_current_value().unwrap(), 10);
}

#[test]
fn copies_transition_both_buffers_and_restore_them() {
    let (device, driver) = host_device(Backend::D3D12);
    let queue = device.create_queue().unwrap();
    let desc = BufferDesc {
        size: 64,
        usage: BufferUsage::SHADER_RESOURCE | BufferUsage::COPY_SOURCE | BufferUsage::COPY_DESTINATION,
        default_state: ResourceState::ShaderResource,
        ..Default::default()
    };
    let src = device.create_buffer(&desc, Some(&[7; 64])).unwrap();
    let dst = device.create_buffer(&desc, None).unwrap();

    let mut encoder = queue.create_command_encoder().unwrap();
    encoder.copy_buffer(&dst, 0, &src, 0, 64).unwrap();
    queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
    queue.wait_on_host().unwrap();

    let transition = |resource, before, after| {
        NativeOp::Barrier(Barrier::Transition {
            resource,
            subresource: None,
            before,
            after,
        })
    };
    let ops = driver.ops_on(queue.stream());
    assert_eq!(ops.len(), 5);
    assert_eq!(
        ops[..3],
        [
            transition(
                dst.id(),
                ResourceState::ShaderResource,
                ResourceState::CopyDestination
            ),
            transition(
                src.id(),
                ResourceState::ShaderResource,
                ResourceState::CopySource
            ),
            NativeOp::CopyMemory {
                dst: dst.device_address(),
                src: src.device_address(),
                size: 64,
            },
        ]
    );
    let restores = [
        transition(
            dst.id(),
            ResourceState::CopyDestination,
            ResourceState::ShaderResource,
        ),
        transition(
            src.id(),
            ResourceState::CopySource,
            ResourceState::ShaderResource,
        ),
    ];
    for restore in &restores {
        assert!(ops[3..].contains(restore), "missing {restore:?}");
    }

    assert_eq!(device.read_buffer(&dst, 0, 64).unwrap(), vec![7; 64]);
}

#[test]
fn small_constants_share_a_page_and_large_ones_get_their_own() {
    let (device, driver) = host_device(Backend::Cuda);
    let mut pool = ConstantBufferPool::new(4 * 1024 * 1024, 64).unwrap();
    let allocations: Vec<_> = (0..3)
        .map(|_| pool.allocate(&device, 64).unwrap())
        .collect();
    assert_eq!(
        allocations.iter().map(|a| a.offset).collect::<Vec<_>>(),
        vec![0, 64, 128]
    );
    assert!(allocations.iter().all(|a| a.offset % 64 == 0));
    assert_eq!(
        allocations[1].device,
        allocations[0].device.offset(64)
    );
    assert_eq!(pool.page_count(), 1);

    let live = driver.live_allocations();
    let large = pool.allocate(&device, 8 * 1024 * 1024).unwrap();
    assert_eq!(large.offset, 0);
    assert_eq!(large.size, 8 * 1024 * 1024);
    assert_eq!(pool.large_page_count(), 1);
    assert!(driver.live_allocations() > live);

    assert_eq!(pool.allocate(&device, 64).unwrap().offset, 192);
    assert_eq!(pool.page_count(), 1);

    pool.reset();
    assert_eq!(pool.large_page_count(), 0);
    assert_eq!(driver.live_allocations(), live);
}

#[test]
fn round_trips_through_another_state_cost_two_transitions() {
    let (device, driver) = host_device(Backend::D3D12);
    let queue = device.create_queue().unwrap();
    let buffer = device
        .create_buffer(
            &BufferDesc {
                size: 32,
                usage: BufferUsage::SHADER_RESOURCE
                    | BufferUsage::COPY_SOURCE
                    | BufferUsage::COPY_DESTINATION,
                default_state: ResourceState::ShaderResource,
                ..Default::default()
            },
            None,
        )
        .unwrap();
    let transitions = |states: &[ResourceState]| -> Vec<(ResourceState, ResourceState)> {
        driver.clear_log();
        let mut encoder = queue.create_command_encoder().unwrap();
        for state in states {
            encoder.set_buffer_state(&buffer, *state);
        }
        queue.submit(SubmitDesc::new([encoder.finish()])).unwrap();
        queue.wait_on_host().unwrap();
        driver
            .ops_on(queue.stream())
            .into_iter()
            .filter_map(|op| match op {
                NativeOp::Barrier(Barrier::Transition {
                    resource,
                    before,
                    after,
                    ..
                }) if resource == buffer.id() => Some((before, after)),
                _ => None,
            })
            .collect()
    };

    // Starting from the default state, nothing is left to restore.
    assert_eq!(
        transitions(&[
            ResourceState::ShaderResource,
            ResourceState::CopyDestination,
            ResourceState::ShaderResource,
        ]),
        [
            (ResourceState::ShaderResource, ResourceState::CopyDestination),
            (ResourceState::CopyDestination, ResourceState::ShaderResource),
        ]
    );

    // Away from the default state, the end of the command buffer returns to it.
    assert_eq!(
        transitions(&[
            ResourceState::CopyDestination,
            ResourceState::CopySource,
            ResourceState::CopyDestination,
        ]),
        [
            (ResourceState::ShaderResource, ResourceState::CopyDestination),
            (ResourceState::CopyDestination, ResourceState::CopySource),
            (ResourceState::CopySource, ResourceState::CopyDestination),
            (ResourceState::CopyDestination, ResourceState::ShaderResource),
        ]
    );
}
