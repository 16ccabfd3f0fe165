//! Shared fixtures for in-crate tests: recording/scripted collaborator
//! mocks and synthetic-device builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::access_point::AccessPoint;
use crate::device::Device;
use crate::manager::SharedState;
use crate::models::{DeviceKind, DeviceStatus, DriverSupport, KeyType};
use crate::platform::{
    DhcpClient, DhcpLease, DhcpOutcome, HostBus, Platform, PropertyStore, SystemTools, Timings,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BusEvent {
    Status(DeviceStatus),
    Ip4(Ipv4Addr),
    Appeared(String),
    Disappeared(String),
    KeyRequested(String, u32),
    Finished(bool),
}

/// Records every bus event; replies to key prompts from a queue.
#[derive(Default)]
pub(crate) struct RecordingBus {
    pub events: Mutex<Vec<BusEvent>>,
    pub key_replies: Mutex<VecDeque<(String, KeyType)>>,
}

impl RecordingBus {
    pub fn push(&self, event: BusEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn queue_key_reply(&self, key: &str, key_type: KeyType) {
        self.key_replies
            .lock()
            .unwrap()
            .push_back((key.to_string(), key_type));
    }
}

impl HostBus for RecordingBus {
    fn device_status_changed(&self, _dev: &Device, status: DeviceStatus) {
        self.push(BusEvent::Status(status));
    }

    fn device_ip4_changed(&self, _dev: &Device, addr: Ipv4Addr) {
        self.push(BusEvent::Ip4(addr));
    }

    fn wireless_network_appeared(&self, _dev: &Device, ap: &AccessPoint) {
        self.push(BusEvent::Appeared(ap.essid_or_none().to_string()));
    }

    fn wireless_network_disappeared(&self, _dev: &Device, ap: &AccessPoint) {
        self.push(BusEvent::Disappeared(ap.essid_or_none().to_string()));
    }

    fn request_user_key(&self, dev: &Device, essid: &str, attempt: u32) {
        self.push(BusEvent::KeyRequested(essid.to_string(), attempt));
        if let Some((key, key_type)) = self.key_replies.lock().unwrap().pop_front() {
            dev.set_user_key_for_network(essid, &key, key_type);
        }
    }

    fn activation_finished(&self, _dev: &Device, success: bool) {
        self.push(BusEvent::Finished(success));
    }
}

pub(crate) fn long_lease() -> DhcpLease {
    DhcpLease {
        renew_after: Duration::from_secs(3600),
        rebind_after: Duration::from_secs(6300),
        expires_after: Duration::from_secs(7200),
    }
}

/// DHCP client that answers from a scripted queue, with bound-forever
/// as the default once the script runs out.
#[derive(Default)]
pub(crate) struct ScriptedDhcp {
    pub outcomes: Mutex<VecDeque<DhcpOutcome>>,
    pub requests: AtomicU32,
    pub freed: Mutex<Vec<String>>,
}

impl ScriptedDhcp {
    pub fn script(&self, outcomes: &[DhcpOutcome]) {
        self.outcomes.lock().unwrap().extend(outcomes.iter().copied());
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

impl DhcpClient for ScriptedDhcp {
    fn request(&self, _dev: &Device) -> DhcpOutcome {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DhcpOutcome::Bound(long_lease()))
    }

    fn renew(&self, _dev: &Device) -> DhcpOutcome {
        DhcpOutcome::Bound(long_lease())
    }

    fn rebind(&self, _dev: &Device) -> DhcpOutcome {
        DhcpOutcome::Bound(long_lease())
    }

    fn cease(&self, _dev: &Device) {}

    fn free(&self, iface: &str) {
        self.freed.lock().unwrap().push(iface.to_string());
    }
}

/// System tools that count calls and succeed on demand.
pub(crate) struct CountingSystem {
    pub autoip_ok: AtomicBool,
    pub static_ok: AtomicBool,
    pub autoip_calls: AtomicU32,
    pub arp_flushes: AtomicU32,
    pub mdns_restarts: AtomicU32,
    pub default_route_deletes: AtomicU32,
    pub route_flushes: AtomicU32,
    pub address_flushes: AtomicU32,
}

impl Default for CountingSystem {
    fn default() -> Self {
        CountingSystem {
            autoip_ok: AtomicBool::new(true),
            static_ok: AtomicBool::new(true),
            autoip_calls: AtomicU32::new(0),
            arp_flushes: AtomicU32::new(0),
            mdns_restarts: AtomicU32::new(0),
            default_route_deletes: AtomicU32::new(0),
            route_flushes: AtomicU32::new(0),
            address_flushes: AtomicU32::new(0),
        }
    }
}

impl SystemTools for CountingSystem {
    fn delete_default_route(&self) {
        self.default_route_deletes.fetch_add(1, Ordering::SeqCst);
    }

    fn flush_routes(&self, _dev: &Device) {
        self.route_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn flush_addresses(&self, _dev: &Device) {
        self.address_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn flush_arp_cache(&self) {
        self.arp_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn restart_mdns_responder(&self) {
        self.mdns_restarts.fetch_add(1, Ordering::SeqCst);
    }

    fn setup_static_ip4(&self, _dev: &Device) -> bool {
        self.static_ok.load(Ordering::SeqCst)
    }

    fn autoip(&self, _dev: &Device) -> bool {
        self.autoip_calls.fetch_add(1, Ordering::SeqCst);
        self.autoip_ok.load(Ordering::SeqCst)
    }

    fn update_config_info(&self, _dev: &Device) {}
}

pub(crate) struct FixedProps(pub DriverSupport);

impl PropertyStore for FixedProps {
    fn exists(&self, _udi: &str, _key: &str) -> bool {
        false
    }

    fn get_bool(&self, _udi: &str, _key: &str) -> bool {
        false
    }

    fn driver_support(&self, _udi: &str, _iface: &str) -> DriverSupport {
        self.0
    }
}

pub(crate) struct Rig {
    pub bus: Arc<RecordingBus>,
    pub dhcp: Arc<ScriptedDhcp>,
    pub system: Arc<CountingSystem>,
    pub state: SharedState,
    pub platform: Arc<Platform>,
}

pub(crate) fn rig() -> Rig {
    rig_with_support(DriverSupport::FullySupported)
}

pub(crate) fn rig_with_support(support: DriverSupport) -> Rig {
    let bus = Arc::new(RecordingBus::default());
    let dhcp = Arc::new(ScriptedDhcp::default());
    let system = Arc::new(CountingSystem::default());
    let platform = Platform::new(
        Arc::clone(&bus) as Arc<dyn HostBus>,
        Arc::clone(&dhcp) as Arc<dyn DhcpClient>,
        Arc::clone(&system) as Arc<dyn SystemTools>,
        Arc::new(FixedProps(support)),
        Timings::accelerated(),
    );
    Rig {
        bus,
        dhcp,
        system,
        state: SharedState::new(),
        platform,
    }
}

pub(crate) fn wireless_dev(rig: &Rig, iface: &str) -> Arc<Device> {
    Device::new(
        iface,
        &format!("/test/{iface}"),
        true,
        DeviceKind::Wireless,
        rig.state.clone(),
        Arc::clone(&rig.platform),
    )
    .unwrap()
}

pub(crate) fn wired_dev(rig: &Rig, iface: &str) -> Arc<Device> {
    Device::new(
        iface,
        &format!("/test/{iface}"),
        true,
        DeviceKind::Wired,
        rig.state.clone(),
        Arc::clone(&rig.platform),
    )
    .unwrap()
}

pub(crate) fn allowed_entry(
    essid: &str,
    timestamp: u64,
    trusted: bool,
    key: Option<(&str, KeyType)>,
) -> AccessPoint {
    let mut ap = AccessPoint::new();
    ap.set_essid(Some(essid));
    ap.set_timestamp(timestamp);
    ap.set_trusted(trusted);
    if let Some((k, kt)) = key {
        ap.set_encrypted(true);
        ap.set_key(Some(k), kt);
    }
    ap
}

/// Polls `cond` until it holds or `timeout` elapses.
pub(crate) fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
