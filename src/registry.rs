use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::debug;

use crate::device::Device;

/// Tracks the trainer that speaks the vendor resistance protocol, if one is connected
///
/// Other parts of an application (a calibration screen, for instance) need to reach the
/// proprietary trainer without holding on to it. The registry only keeps a weak
/// reference, so a trainer that everyone else has dropped disappears from it too.
#[derive(Debug, Default)]
pub struct TrainerRegistry {
    active: RwLock<Option<Weak<Device>>>,
}

impl TrainerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `device` the active trainer
    pub fn set_active(&self, device: &Arc<Device>) {
        debug!("Registering {} as active trainer", device.name());
        *self.active.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::downgrade(device));
    }

    /// The active trainer, if it is still alive
    #[must_use]
    pub fn active(&self) -> Option<Arc<Device>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Forget the active trainer
    pub fn clear(&self) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
