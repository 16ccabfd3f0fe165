//! Boundaries to the rest of the system.
//!
//! The core never talks to D-Bus, a DHCP client or the routing table
//! directly; it drives the traits collected here. Production wires them
//! to the real services, tests wire them to mocks.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crate::access_point::AccessPoint;
use crate::device::Device;
use crate::models::{DeviceStatus, DriverSupport};

/// Outbound host-bus surface plus the user key prompt channel.
///
/// `request_user_key` is fire-and-forget; the reply comes back through
/// [`Device::set_user_key_for_network`], with the exact byte string
/// [`crate::constants::bus::KEY_CANCELED`] marking a dismissed prompt.
pub trait HostBus: Send + Sync {
    fn device_status_changed(&self, dev: &Device, status: DeviceStatus);
    fn device_ip4_changed(&self, dev: &Device, addr: Ipv4Addr);
    fn wireless_network_appeared(&self, dev: &Device, ap: &AccessPoint);
    fn wireless_network_disappeared(&self, dev: &Device, ap: &AccessPoint);
    fn request_user_key(&self, dev: &Device, essid: &str, attempt: u32);

    /// Upstream policy notification at the end of an activation attempt.
    fn activation_finished(&self, dev: &Device, success: bool);
}

/// Lease parameters handed back by the DHCP collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpLease {
    /// When to start renewing (T1).
    pub renew_after: Duration,
    /// When to start rebinding (T2).
    pub rebind_after: Duration,
    /// When the lease expires outright.
    pub expires_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpOutcome {
    Bound(DhcpLease),
    Failed,
}

/// External DHCP client engine.
pub trait DhcpClient: Send + Sync {
    fn request(&self, dev: &Device) -> DhcpOutcome;
    fn renew(&self, dev: &Device) -> DhcpOutcome;
    fn rebind(&self, dev: &Device) -> DhcpOutcome;

    /// Abort any in-flight transaction for the device.
    fn cease(&self, dev: &Device);

    /// Release client state for an interface once its worker is done.
    fn free(&self, iface: &str);
}

/// Routing-table, ARP and service glue the engine leans on around IP
/// configuration.
pub trait SystemTools: Send + Sync {
    fn delete_default_route(&self);
    fn flush_routes(&self, dev: &Device);
    fn flush_addresses(&self, dev: &Device);
    fn flush_arp_cache(&self);
    fn restart_mdns_responder(&self);

    /// Apply the device's static IPv4 configuration record.
    fn setup_static_ip4(&self, dev: &Device) -> bool;

    /// Link-local auto-IP configuration (ad-hoc and fallback path).
    fn autoip(&self, dev: &Device) -> bool;

    /// Load the device's static-vs-DHCP record from system config.
    fn update_config_info(&self, dev: &Device);
}

/// Hardware-abstraction property store.
pub trait PropertyStore: Send + Sync {
    fn exists(&self, udi: &str, key: &str) -> bool;
    fn get_bool(&self, udi: &str, key: &str) -> bool;
    fn driver_support(&self, udi: &str, iface: &str) -> DriverSupport;
}

/// Every fixed wait the engine takes, in one place.
///
/// The defaults are the published contract; tests construct accelerated
/// values so a full activation runs in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Settle after bringing the interface down. Some drivers drop
    /// commands issued too close to a state change.
    pub settle_after_down: Duration,
    /// Settle after bringing the interface up.
    pub settle_after_up: Duration,
    /// Short settle at worker start and before existence probes.
    pub worker_settle: Duration,
    /// Association pause for cards limited to the 14 802.11b channels.
    pub association_pause_short: Duration,
    /// Association pause for A/B/G cards that must sweep more channels.
    pub association_pause_long: Duration,
    /// Poll cadence while waiting for a best AP to appear.
    pub ap_wait_poll: Duration,
    /// Poll cadence while waiting for a user key (2 Hz).
    pub key_wait_poll: Duration,
    /// Poll cadence while a cancel waits for the worker (2 Hz).
    pub cancel_wait_poll: Duration,
    /// Cadence of the periodic scan loop.
    pub scan_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            settle_after_down: Duration::from_secs(4),
            settle_after_up: Duration::from_secs(2),
            worker_settle: Duration::from_secs(1),
            association_pause_short: Duration::from_secs(5),
            association_pause_long: Duration::from_secs(10),
            ap_wait_poll: Duration::from_secs(2),
            key_wait_poll: Duration::from_millis(500),
            cancel_wait_poll: Duration::from_millis(500),
            scan_interval: Duration::from_secs(crate::constants::scan::INTERVAL_SECS),
        }
    }
}

impl Timings {
    /// Millisecond-scale waits for test runs.
    pub fn accelerated() -> Timings {
        Timings {
            settle_after_down: Duration::from_millis(2),
            settle_after_up: Duration::from_millis(2),
            worker_settle: Duration::from_millis(1),
            association_pause_short: Duration::from_millis(5),
            association_pause_long: Duration::from_millis(10),
            ap_wait_poll: Duration::from_millis(5),
            key_wait_poll: Duration::from_millis(2),
            cancel_wait_poll: Duration::from_millis(2),
            scan_interval: Duration::from_millis(50),
        }
    }

    /// How long to let the card chase an ESSID before checking for a
    /// link. Cards with more than 14 tunable channels are A/B/G chipsets
    /// and need the long pause to sweep them all.
    pub fn association_pause(&self, num_frequency: u16) -> Duration {
        if num_frequency > crate::constants::wireless::B_ONLY_CHANNEL_COUNT {
            self.association_pause_long
        } else {
            self.association_pause_short
        }
    }
}

/// The collaborator bundle every device is constructed with.
pub struct Platform {
    pub bus: Arc<dyn HostBus>,
    pub dhcp: Arc<dyn DhcpClient>,
    pub system: Arc<dyn SystemTools>,
    pub props: Arc<dyn PropertyStore>,
    pub timings: Timings,
}

impl Platform {
    pub fn new(
        bus: Arc<dyn HostBus>,
        dhcp: Arc<dyn DhcpClient>,
        system: Arc<dyn SystemTools>,
        props: Arc<dyn PropertyStore>,
        timings: Timings,
    ) -> Arc<Platform> {
        Arc::new(Platform {
            bus,
            dhcp,
            system,
            props,
            timings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn association_pause_depends_on_channel_count() {
        let t = Timings::default();
        assert_eq!(t.association_pause(2), Duration::from_secs(5));
        assert_eq!(t.association_pause(14), Duration::from_secs(5));
        assert_eq!(t.association_pause(15), Duration::from_secs(10));
        assert_eq!(t.association_pause(32), Duration::from_secs(10));
    }

    #[test]
    fn default_settles_match_the_radio_reset_contract() {
        let t = Timings::default();
        assert_eq!(t.settle_after_down, Duration::from_secs(4));
        assert_eq!(t.settle_after_up, Duration::from_secs(2));
        assert_eq!(t.key_wait_poll, Duration::from_millis(500));
        assert_eq!(t.cancel_wait_poll, Duration::from_millis(500));
    }
}
