//! Query pools.
//!
//! Each query is a `u64` slot in device memory. Timestamps and acceleration structure
//! properties are written into the slots by commands; [`QueryPool::get_results`] reads them
//! back once the writing command buffer has completed.

use std::{fmt::Debug, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    Device, Error, HasDevice, Result, error::native_call, native::DeviceAddress,
    utils::ResourceId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryType {
    Timestamp,
    AccelerationStructureCompactedSize,
    AccelerationStructureSerializedSize,
    AccelerationStructureCurrentSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPoolDesc {
    pub ty: QueryType,
    pub count: u32,
    pub label: Option<String>,
}

#[derive(Clone)]
pub struct QueryPool(Arc<QueryPoolInner>);

struct QueryPoolInner {
    device: Device,
    id: ResourceId,
    desc: QueryPoolDesc,
    memory: DeviceAddress,
}

const SLOT_SIZE: u64 = std::mem::size_of::<u64>() as u64;

impl QueryPool {
    pub(crate) fn new(device: Device, desc: QueryPoolDesc) -> Result<Self> {
        if desc.count == 0 {
            return Err(Error::InvalidArgument("a query pool needs at least one query"));
        }
        let memory = native_call!(
            device,
            device
                .driver()
                .allocate_device_memory(desc.count as u64 * SLOT_SIZE, 256)
        )?;
        Ok(Self(Arc::new(QueryPoolInner {
            device,
            id: ResourceId::next(),
            desc,
            memory,
        })))
    }

    pub fn id(&self) -> ResourceId {
        self.0.id
    }

    pub fn ty(&self) -> QueryType {
        self.0.desc.ty
    }

    pub fn count(&self) -> u32 {
        self.0.desc.count
    }

    pub fn slot_address(&self, index: u32) -> Result<DeviceAddress> {
        if index >= self.0.desc.count {
            return Err(Error::InvalidArgument("query index out of range"));
        }
        Ok(self.0.memory.offset(index as u64 * SLOT_SIZE))
    }

    pub fn get_results(&self, index: u32, count: u32) -> Result<Vec<u64>> {
        if count == 0 || index.checked_add(count).is_none_or(|end| end > self.0.desc.count) {
            return Err(Error::InvalidArgument("query range out of range"));
        }
        let mut bytes = vec![0u8; (count as u64 * SLOT_SIZE) as usize];
        let device = &self.0.device;
        native_call!(
            device,
            device
                .driver()
                .read_device_memory(self.slot_address(index)?, &mut bytes)
        )?;
        Ok(bytes
            .chunks_exact(SLOT_SIZE as usize)
            .map(|chunk| bytemuck::pod_read_unaligned::<u64>(chunk))
            .collect())
    }
}

impl HasDevice for QueryPool {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl Drop for QueryPoolInner {
    fn drop(&mut self) {
        if let Err(error) = self.device.driver().free_device_memory(self.memory) {
            tracing::error!(?error, id = ?self.id, "failed to free query pool memory");
        }
    }
}

impl PartialEq for QueryPool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for QueryPool {}

impl Debug for QueryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPool")
            .field("id", &self.0.id)
            .field("ty", &self.0.desc.ty)
            .field("count", &self.0.desc.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Backend;

    #[test]
    fn results_start_zeroed() {
        let (device, _queue) = Device::create_host_default(Backend::Vulkan).unwrap();
        let pool = device
            .create_query_pool(QueryPoolDesc {
                ty: QueryType::Timestamp,
                count: 4,
                label: None,
            })
            .unwrap();
        assert_eq!(pool.get_results(1, 3).unwrap(), vec![0, 0, 0]);
        assert!(pool.get_results(2, 3).is_err());
        assert!(pool.slot_address(4).is_err());
    }
}
