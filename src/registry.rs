//! Opened cameras, addressed by id.
//!
//! The map lock is only held to find a camera's slot. The slot's own lock is
//! taken before the map lock is let go, and slow work (open, API calls, close)
//! runs under the slot lock alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, instrument, warn};

use crate::driver::{CameraProvider, Capabilities};
use crate::error::{HalError, HalResult};
use crate::hwi::Camera;

type Slot = Arc<Mutex<Option<Camera>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct CameraRegistry {
    provider: Arc<dyn CameraProvider>,
    slots: Mutex<HashMap<u32, Slot>>,
}

impl CameraRegistry {
    pub fn new(provider: Arc<dyn CameraProvider>) -> Self {
        Self {
            provider,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn num_cameras(&self) -> usize {
        self.provider.num_cameras()
    }

    pub fn capabilities(&self, id: u32) -> HalResult<Capabilities> {
        self.check_id(id)?;
        self.provider.capabilities(id)
    }

    fn check_id(&self, id: u32) -> HalResult<()> {
        let len = self.num_cameras();
        if id as usize >= len {
            return Err(HalError::OutOfRange {
                index: id as usize,
                len,
            });
        }
        Ok(())
    }

    /// Open camera `id` with the configuration current at call time.
    #[instrument(skip(self))]
    pub fn open(&self, id: u32) -> HalResult<()> {
        self.check_id(id)?;
        let slot: Slot = Arc::new(Mutex::new(None));
        let mut guard = {
            let mut slots = lock(&self.slots);
            if slots.contains_key(&id) {
                return Err(HalError::InvalidOperation(format!("camera {id} already open")));
            }
            slots.insert(id, slot.clone());
            lock(&slot)
        };

        let config = crate::CONFIG.load();
        let opened = self
            .provider
            .open(id)
            .and_then(|ops| Camera::open(id, ops, &config));
        match opened {
            Ok(camera) => {
                *guard = Some(camera);
                info!(id, "Camera registered");
                Ok(())
            }
            Err(e) => {
                drop(guard);
                lock(&self.slots).remove(&id);
                warn!(id, "Camera open failed: {}", e);
                Err(e)
            }
        }
    }

    /// Run `f` on camera `id`. Not for use from camera callbacks: the camera
    /// stays locked while `f` runs.
    pub fn with_camera<R>(&self, id: u32, f: impl FnOnce(&Camera) -> R) -> HalResult<R> {
        self.check_id(id)?;
        let slot = lock(&self.slots)
            .get(&id)
            .cloned()
            .ok_or_else(|| HalError::NotFound(format!("camera {id} not open")))?;
        let guard = lock(&slot);
        match guard.as_ref() {
            Some(camera) => Ok(f(camera)),
            None => Err(HalError::NotFound(format!("camera {id} not open"))),
        }
    }

    pub fn is_open(&self, id: u32) -> bool {
        lock(&self.slots).contains_key(&id)
    }

    #[instrument(skip(self))]
    pub fn close(&self, id: u32) -> HalResult<()> {
        self.check_id(id)?;
        let camera = {
            let mut slots = lock(&self.slots);
            let slot = slots
                .remove(&id)
                .ok_or_else(|| HalError::NotFound(format!("camera {id} not open")))?;
            let mut guard = lock(&slot);
            drop(slots);
            guard.take()
        };
        match camera {
            Some(camera) => {
                camera.close();
                Ok(())
            }
            None => Err(HalError::NotFound(format!("camera {id} not open"))),
        }
    }

    /// Close every open camera.
    pub fn close_all(&self) {
        let ids: Vec<u32> = lock(&self.slots).keys().copied().collect();
        for id in ids {
            if let Err(e) = self.close(id) {
                warn!(id, "Close failed: {}", e);
            }
        }
    }
}

impl Drop for CameraRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimProvider;
    use crate::state_machine::State;

    fn registry() -> CameraRegistry {
        CameraRegistry::new(Arc::new(SimProvider::new(2, 30)))
    }

    #[test]
    fn lookups_are_checked() {
        let reg = registry();
        assert_eq!(reg.num_cameras(), 2);
        assert!(matches!(reg.open(2), Err(HalError::OutOfRange { index: 2, len: 2 })));
        assert!(matches!(reg.with_camera(0, |_| ()), Err(HalError::NotFound(_))));
        assert!(matches!(reg.close(1), Err(HalError::NotFound(_))));
        assert!(!reg.capabilities(1).unwrap().supports_auto_focus);
    }

    #[test]
    fn open_twice_is_refused() {
        let reg = registry();
        reg.open(0).unwrap();
        assert!(matches!(reg.open(0), Err(HalError::InvalidOperation(_))));
        assert_eq!(reg.with_camera(0, |c| c.state()).unwrap(), State::PreviewStopped);
    }

    #[test]
    fn close_then_reopen() {
        let reg = registry();
        reg.open(1).unwrap();
        reg.with_camera(1, |c| c.start_no_display_preview()).unwrap().unwrap();
        reg.close(1).unwrap();
        assert!(!reg.is_open(1));
        reg.open(1).unwrap();
        assert_eq!(reg.with_camera(1, |c| c.id()).unwrap(), 1);
    }
}
