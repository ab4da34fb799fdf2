use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info};

use super::Resource;
use crate::config::ServiceTime;
use crate::{Error, Result};

/// The shared resource. Holding `busy` is the critical section.
///
/// Each instance owns its lock; nothing is process-wide.
pub struct ResourceServer {
    busy: Mutex<()>,
    service_time: Mutex<ServiceTime>,
}

impl ResourceServer {
    pub fn new(service_time: ServiceTime) -> Self {
        Self {
            busy: Mutex::new(()),
            service_time: Mutex::new(service_time),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.is_locked()
    }

    pub fn service_time(&self) -> ServiceTime {
        *self.service_time.lock()
    }

    /// Moves the upper bound of the critical-section duration.
    pub fn set_service_time(&self, t: Duration) -> Result<()> {
        self.service_time.lock().set_upper(t)?;
        info!("resource service time set to {t:?}");
        Ok(())
    }
}

impl Default for ResourceServer {
    fn default() -> Self {
        Self::new(ServiceTime::fixed(ServiceTime::RESOURCE_FLOOR))
    }
}

impl Resource for ResourceServer {
    fn use_resource(&self) -> Result<()> {
        let Some(_guard) = self.busy.try_lock() else {
            error!("resource entered while already in use");
            return Err(Error::ResourceBusy);
        };
        let t = self.service_time.lock().sample();
        std::thread::sleep(t);
        Ok(())
    }
}
