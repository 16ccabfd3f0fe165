//! Process-wide state: the device registry, the shared Allowed and
//! Invalid lists, and the flags that gate startup behaviour and
//! synthetic devices.

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::ap_list::{ApList, ApListKind, SharedApList};
use crate::device::Device;
use crate::models::{DeviceError, DeviceKind};
use crate::platform::Platform;
use crate::Result;

/// State every device shares: the process-wide AP lists and the
/// starting-up flag. Cloning shares, it does not copy.
#[derive(Clone)]
pub struct SharedState {
    pub allowed: SharedApList,
    pub invalid: SharedApList,
    starting_up: Arc<AtomicBool>,
}

impl SharedState {
    pub fn new() -> SharedState {
        SharedState {
            allowed: ApList::shared(ApListKind::Allowed),
            invalid: ApList::shared(ApListKind::Invalid),
            starting_up: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn starting_up(&self) -> bool {
        self.starting_up.load(Ordering::SeqCst)
    }

    pub fn set_starting_up(&self, value: bool) {
        self.starting_up.store(value, Ordering::SeqCst)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        SharedState::new()
    }
}

/// Owns the devices and the state they share.
pub struct Manager {
    devices: Mutex<Vec<Arc<Device>>>,
    state: SharedState,
    platform: Arc<Platform>,
    enable_test_devices: bool,
}

impl Manager {
    pub fn new(platform: Arc<Platform>, enable_test_devices: bool) -> Manager {
        Manager {
            devices: Mutex::new(Vec::new()),
            state: SharedState::new(),
            platform,
            enable_test_devices,
        }
    }

    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn allowed_list(&self) -> SharedApList {
        Arc::clone(&self.state.allowed)
    }

    pub fn invalid_list(&self) -> SharedApList {
        Arc::clone(&self.state.invalid)
    }

    /// Policy action: forget every invalidated network.
    pub fn clear_invalid_list(&self) {
        self.state.invalid.lock().unwrap().clear();
    }

    pub fn starting_up(&self) -> bool {
        self.state.starting_up()
    }

    /// Marks initial startup as finished; wired devices with addresses
    /// stop taking the configured-at-boot shortcut.
    pub fn startup_complete(&self) {
        self.state.set_starting_up(false);
    }

    /// Registers a real device that hardware discovery reported.
    pub fn create_device(&self, iface: &str, udi: &str) -> Result<Arc<Device>> {
        let dev = Device::new(
            iface,
            udi,
            false,
            DeviceKind::Unknown,
            self.state.clone(),
            Arc::clone(&self.platform),
        )?;
        info!("now managing {} device '{iface}'", dev.kind());
        self.devices.lock().unwrap().push(Arc::clone(&dev));
        Ok(dev)
    }

    /// Registers a synthetic device. Refused unless the process was
    /// started with test devices enabled.
    pub fn create_test_device(
        &self,
        iface: &str,
        udi: &str,
        kind: DeviceKind,
    ) -> Result<Arc<Device>> {
        if !self.enable_test_devices {
            warn!("attempt to create a test device, but test devices are not enabled");
            return Err(DeviceError::InvalidArgument(
                "test devices are not enabled".into(),
            ));
        }
        let dev = Device::new(
            iface,
            udi,
            true,
            kind,
            self.state.clone(),
            Arc::clone(&self.platform),
        )?;
        self.devices.lock().unwrap().push(Arc::clone(&dev));
        Ok(dev)
    }

    /// Unregisters a device on hardware removal, tearing down whatever
    /// it was doing.
    pub fn remove_device(&self, udi: &str) -> bool {
        let removed = {
            let mut devices = self.devices.lock().unwrap();
            match devices.iter().position(|d| d.udi() == udi) {
                Some(idx) => Some(devices.remove(idx)),
                None => None,
            }
        };
        match removed {
            Some(dev) => {
                info!("no longer managing device '{}'", dev.iface());
                dev.deactivate(true);
                true
            }
            None => false,
        }
    }

    pub fn device_by_udi(&self, udi: &str) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.udi() == udi)
            .cloned()
    }

    pub fn device_by_iface(&self, iface: &str) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.iface() == iface)
            .cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().clone()
    }
}
