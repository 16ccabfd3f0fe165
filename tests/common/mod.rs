//! Mock collaborators and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nlm_core::{
    AccessPoint, Device, DeviceKind, DeviceStatus, DhcpClient, DhcpLease, DhcpOutcome,
    DriverSupport, HostBus, KeyType, Platform, PropertyStore, SharedState, SystemTools, Timings,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Status(DeviceStatus),
    Ip4(Ipv4Addr),
    Appeared(String),
    Disappeared(String),
    KeyRequested(String, u32),
    Finished(bool),
}

/// Records every bus event and answers key prompts from a queue.
#[derive(Default)]
pub struct MockBus {
    events: Mutex<Vec<Event>>,
    key_replies: Mutex<VecDeque<(String, KeyType)>>,
}

impl MockBus {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn queue_key_reply(&self, key: &str, key_type: KeyType) {
        self.key_replies
            .lock()
            .unwrap()
            .push_back((key.to_string(), key_type));
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    /// Index of the first occurrence of `event`, for order assertions.
    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

impl HostBus for MockBus {
    fn device_status_changed(&self, _dev: &Device, status: DeviceStatus) {
        self.push(Event::Status(status));
    }

    fn device_ip4_changed(&self, _dev: &Device, addr: Ipv4Addr) {
        self.push(Event::Ip4(addr));
    }

    fn wireless_network_appeared(&self, _dev: &Device, ap: &AccessPoint) {
        self.push(Event::Appeared(ap.essid_or_none().to_string()));
    }

    fn wireless_network_disappeared(&self, _dev: &Device, ap: &AccessPoint) {
        self.push(Event::Disappeared(ap.essid_or_none().to_string()));
    }

    fn request_user_key(&self, dev: &Device, essid: &str, attempt: u32) {
        self.push(Event::KeyRequested(essid.to_string(), attempt));
        if let Some((key, key_type)) = self.key_replies.lock().unwrap().pop_front() {
            dev.set_user_key_for_network(essid, &key, key_type);
        }
    }

    fn activation_finished(&self, _dev: &Device, success: bool) {
        self.push(Event::Finished(success));
    }
}

pub fn long_lease() -> DhcpLease {
    DhcpLease {
        renew_after: Duration::from_secs(3600),
        rebind_after: Duration::from_secs(6300),
        expires_after: Duration::from_secs(7200),
    }
}

/// DHCP client that answers from a scripted queue; once the script runs
/// out every request binds with a long lease.
#[derive(Default)]
pub struct MockDhcp {
    outcomes: Mutex<VecDeque<DhcpOutcome>>,
    requests: AtomicU32,
    freed: Mutex<Vec<String>>,
}

impl MockDhcp {
    pub fn script(&self, outcomes: &[DhcpOutcome]) {
        self.outcomes
            .lock()
            .unwrap()
            .extend(outcomes.iter().copied());
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> Vec<String> {
        self.freed.lock().unwrap().clone()
    }
}

impl DhcpClient for MockDhcp {
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
pub struct MockSystem {
    pub autoip_ok: AtomicBool,
    pub static_ok: AtomicBool,
    pub autoip_calls: AtomicU32,
    pub arp_flushes: AtomicU32,
    pub mdns_restarts: AtomicU32,
    pub default_route_deletes: AtomicU32,
    pub route_flushes: AtomicU32,
    pub address_flushes: AtomicU32,
}

impl Default for MockSystem {
    fn default() -> Self {
        MockSystem {
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

impl SystemTools for MockSystem {
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

pub struct MockProps(pub DriverSupport);

impl PropertyStore for MockProps {
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

pub struct Rig {
    pub bus: Arc<MockBus>,
    pub dhcp: Arc<MockDhcp>,
    pub system: Arc<MockSystem>,
    pub state: SharedState,
    pub platform: Arc<Platform>,
}

pub fn rig() -> Rig {
    let bus = Arc::new(MockBus::default());
    let dhcp = Arc::new(MockDhcp::default());
    let system = Arc::new(MockSystem::default());
    let platform = Platform::new(
        Arc::clone(&bus) as Arc<dyn HostBus>,
        Arc::clone(&dhcp) as Arc<dyn DhcpClient>,
        Arc::clone(&system) as Arc<dyn SystemTools>,
        Arc::new(MockProps(DriverSupport::FullySupported)),
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

pub fn wireless_device(rig: &Rig, iface: &str) -> Arc<Device> {
    Device::new(
        iface,
        &format!("/org/freedesktop/Hal/devices/{iface}"),
        true,
        DeviceKind::Wireless,
        rig.state.clone(),
        Arc::clone(&rig.platform),
    )
    .unwrap()
}

pub fn wired_device(rig: &Rig, iface: &str) -> Arc<Device> {
    Device::new(
        iface,
        &format!("/org/freedesktop/Hal/devices/{iface}"),
        true,
        DeviceKind::Wired,
        rig.state.clone(),
        Arc::clone(&rig.platform),
    )
    .unwrap()
}

pub fn allowed_entry(
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
pub fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
