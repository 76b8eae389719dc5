//! Process-wide native driver registry.
//!
//! Native APIs keep global state, so each backend's driver is loaded at most once per process
//! and shared by every device of that backend. [`NativeApi::init`] loads the driver on first
//! use and otherwise hands out another reference to the loaded one; the driver is unloaded
//! when the last [`NativeApi`] guard is dropped or shut down.

use std::sync::{Arc, Mutex};

use crate::{Backend, Result, native::Driver};

struct Entry {
    driver: Arc<dyn Driver>,
    references: usize,
}

static REGISTRY: Mutex<[Option<Entry>; Backend::COUNT]> = Mutex::new([None, None, None]);

/// A counted reference to a loaded native driver.
pub struct NativeApi {
    backend: Backend,
    driver: Arc<dyn Driver>,
}

impl NativeApi {
    /// Loads the driver for `backend` with `loader` unless it is already loaded.
    pub fn init(
        backend: Backend,
        loader: impl FnOnce() -> Result<Arc<dyn Driver>>,
    ) -> Result<NativeApi> {
        let mut registry = REGISTRY
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = &mut registry[backend as usize];
        if let Some(entry) = slot {
            entry.references += 1;
            return Ok(NativeApi {
                backend,
                driver: entry.driver.clone(),
            });
        }
        let driver = loader()?;
        tracing::info!(?backend, driver = driver.name(), "native api loaded");
        *slot = Some(Entry {
            driver: driver.clone(),
            references: 1,
        });
        Ok(NativeApi { backend, driver })
    }

    /// Number of live references to the driver of `backend`.
    pub fn references(backend: Backend) -> usize {
        REGISTRY
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())[backend as usize]
            .as_ref()
            .map_or(0, |entry| entry.references)
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Same as dropping the guard.
    pub fn shutdown(self) {}
}

impl Clone for NativeApi {
    fn clone(&self) -> Self {
        let mut registry = REGISTRY
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = &mut registry[self.backend as usize] {
            entry.references += 1;
        }
        NativeApi {
            backend: self.backend,
            driver: self.driver.clone(),
        }
    }
}

impl Drop for NativeApi {
    fn drop(&mut self) {
        let mut registry = REGISTRY
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = &mut registry[self.backend as usize];
        let Some(entry) = slot else {
            tracing::error!(backend = ?self.backend, "native api dropped after unload");
            return;
        };
        entry.references -= 1;
        if entry.references == 0 {
            *slot = None;
            tracing::info!(backend = ?self.backend, "native api unloaded");
        }
    }
}

impl std::fmt::Debug for NativeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeApi")
            .field("backend", &self.backend)
            .field("driver", &self.driver.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, native::HostDriver};

    // Vulkan is reserved for this test so parallel tests on other backends do not interfere.
    #[test]
    fn reference_counted_lifecycle() {
        let mut loads = 0;
        let first = NativeApi::init(Backend::Vulkan, || {
            loads += 1;
            Ok(Arc::new(HostDriver::new()))
        })
        .unwrap();
        let second = NativeApi::init(Backend::Vulkan, || {
            loads += 1;
            Ok(Arc::new(HostDriver::new()))
        })
        .unwrap();
        assert_eq!(loads, 1);
        assert!(Arc::ptr_eq(first.driver(), second.driver()));
        assert_eq!(NativeApi::references(Backend::Vulkan), 2);

        first.shutdown();
        assert_eq!(NativeApi::references(Backend::Vulkan), 1);
        drop(second);
        assert_eq!(NativeApi::references(Backend::Vulkan), 0);

        let failed = NativeApi::init(Backend::Vulkan, || Err(Error::NotAvailable("vulkan")));
        assert_eq!(failed.unwrap_err(), Error::NotAvailable("vulkan"));
        assert_eq!(NativeApi::references(Backend::Vulkan), 0);
    }
}
