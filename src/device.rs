//! The device object.
//!
//! A [`Device`] represents one network interface for its whole hardware
//! lifetime. Wireless devices carry a [`WirelessInfo`] sub-state: the
//! rolling scan snapshots, the visible AP list, the best-AP handle with
//! its freeze flag, and the user-key gate the activation worker parks on.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

use crate::access_point::{format_mac, hash_wep_key, AccessPoint};
use crate::activation::CancelToken;
use crate::ap_list::{ApList, ApListKind};
use crate::constants::bus::{DEVICES_PATH, KEY_CANCELED};
use crate::manager::SharedState;
use crate::models::{
    ActivationPhase, AuthMethod, DeviceConfig, DeviceError, DeviceKind, DeviceStatus,
    DriverSupport, KeyType, WirelessMode,
};
use crate::platform::{DhcpLease, Platform};
use crate::radio;
use crate::Result;

/// What the card can tune, read from the driver at creation time.
#[derive(Debug, Clone, Default)]
pub struct RadioRange {
    /// Driver's quality ceiling, for strength percentages.
    pub max_quality: u8,
    /// `(channel, frequency in Hz)` pairs the card supports.
    pub channels: Vec<(i32, f64)>,
}

impl RadioRange {
    pub fn num_frequency(&self) -> u16 {
        self.channels.len() as u16
    }
}

#[derive(Debug, Default)]
pub(crate) struct SignalState {
    pub strength: Option<u8>,
    pub invalid_reads: u8,
    pub noise: u8,
    pub max_quality: u8,
}

#[derive(Debug, Default)]
pub(crate) struct BestAp {
    pub ap: Option<AccessPoint>,
    pub frozen: bool,
}

/// The three rolling scan snapshots, newest first.
pub(crate) struct ScanRing {
    pub newest: ApList,
    pub middle: ApList,
    pub oldest: ApList,
}

impl Default for ScanRing {
    fn default() -> Self {
        ScanRing {
            newest: ApList::new(ApListKind::DeviceScan),
            middle: ApList::new(ApListKind::DeviceScan),
            oldest: ApList::new(ApListKind::DeviceScan),
        }
    }
}

pub(crate) struct KeyGate {
    pub received: Mutex<bool>,
    pub cv: Condvar,
}

pub(crate) struct WirelessInfo {
    pub scan_capable: bool,
    pub cur_essid: Mutex<String>,
    pub range: Mutex<RadioRange>,
    pub signal: Mutex<SignalState>,
    pub best_ap: Mutex<BestAp>,
    pub scan_lock: Mutex<()>,
    pub snapshots: Mutex<ScanRing>,
    pub visible: Mutex<ApList>,
    pub now_scanning: AtomicBool,
    pub key_gate: KeyGate,
}

impl WirelessInfo {
    fn new(scan_capable: bool) -> WirelessInfo {
        WirelessInfo {
            scan_capable,
            cur_essid: Mutex::new(String::new()),
            range: Mutex::new(RadioRange::default()),
            signal: Mutex::new(SignalState::default()),
            best_ap: Mutex::new(BestAp::default()),
            scan_lock: Mutex::new(()),
            snapshots: Mutex::new(ScanRing::default()),
            visible: Mutex::new(ApList::new(ApListKind::DeviceScan)),
            now_scanning: AtomicBool::new(false),
            key_gate: KeyGate {
                received: Mutex::new(false),
                cv: Condvar::new(),
            },
        }
    }
}

pub(crate) struct ActivationControl {
    /// Covers the whole worker lifetime, lease loop included. At most
    /// one worker per device, ever.
    pub worker_active: AtomicBool,
    /// Covers the progress window `activation_cancel` waits on.
    pub activating: AtomicBool,
    pub cancel: CancelToken,
    pub phase: Mutex<ActivationPhase>,
}

pub struct Device {
    udi: String,
    iface: String,
    kind: DeviceKind,
    synthetic: bool,
    driver_support: DriverSupport,
    pub(crate) link_active: AtomicBool,
    /// Synthetic devices track their up/down state here.
    pub(crate) test_up: AtomicBool,
    pub(crate) ip4_address: AtomicU32,
    pub(crate) hw_addr: Mutex<[u8; 6]>,
    config: Mutex<DeviceConfig>,
    pub(crate) wireless: Option<WirelessInfo>,
    pub(crate) activation: ActivationControl,
    pub(crate) dhcp_lease: Mutex<Option<DhcpLease>>,
    pub(crate) state: SharedState,
    pub(crate) platform: Arc<Platform>,
    /// Back-reference so the device can hand its own `Arc` to worker
    /// threads it spawns.
    pub(crate) me: Weak<Device>,
}

impl Device {
    /// Creates and initialises a device for `iface`.
    ///
    /// Real hardware is probed for its kind; synthetic devices must name
    /// theirs. The caller (normally [`crate::manager::Manager`]) is
    /// responsible for gating synthetic devices behind the
    /// enable-test-devices option.
    pub fn new(
        iface: &str,
        udi: &str,
        synthetic: bool,
        synthetic_kind: DeviceKind,
        state: SharedState,
        platform: Arc<Platform>,
    ) -> Result<Arc<Device>> {
        if iface.is_empty() {
            return Err(DeviceError::InvalidArgument("empty interface name".into()));
        }
        if synthetic && synthetic_kind == DeviceKind::Unknown {
            return Err(DeviceError::InvalidArgument(
                "synthetic devices must specify a kind".into(),
            ));
        }

        let kind = if synthetic {
            synthetic_kind
        } else if radio::probe_wireless_extensions(iface) {
            DeviceKind::Wireless
        } else {
            DeviceKind::Wired
        };

        let driver_support = platform.props.driver_support(udi, iface);

        let wireless = if kind == DeviceKind::Wireless {
            let scan_capable = synthetic || radio::probe_scan_capability(iface);
            Some(WirelessInfo::new(scan_capable))
        } else {
            None
        };

        let dev = Arc::new_cyclic(|me| Device {
            udi: udi.to_string(),
            iface: iface.to_string(),
            kind,
            synthetic,
            driver_support,
            link_active: AtomicBool::new(false),
            test_up: AtomicBool::new(false),
            ip4_address: AtomicU32::new(0),
            hw_addr: Mutex::new([0u8; 6]),
            config: Mutex::new(DeviceConfig::default()),
            wireless,
            activation: ActivationControl {
                worker_active: AtomicBool::new(false),
                activating: AtomicBool::new(false),
                cancel: CancelToken::new(),
                phase: Mutex::new(ActivationPhase::Idle),
            },
            dhcp_lease: Mutex::new(None),
            state,
            platform,
            me: me.clone(),
        });

        // The interface has to be up before link and addresses mean
        // anything.
        if let Err(e) = dev.bring_up() {
            debug!("{}: could not bring interface up at creation: {e}", iface);
        }

        if dev.is_wireless() {
            let _ = dev.set_mode(WirelessMode::Infrastructure);
            dev.update_range_info();
        }

        if dev.driver_support() != DriverSupport::Unsupported {
            dev.update_link_active(true);
            dev.update_ip4_address();
            dev.update_hw_address();
            dev.platform.system.update_config_info(&dev);
        }

        Ok(dev)
    }

    pub fn udi(&self) -> &str {
        &self.udi
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_wireless(&self) -> bool {
        self.kind == DeviceKind::Wireless
    }

    pub fn is_wired(&self) -> bool {
        self.kind == DeviceKind::Wired
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn driver_support(&self) -> DriverSupport {
        self.driver_support
    }

    pub fn link_active(&self) -> bool {
        self.link_active.load(Ordering::SeqCst)
    }

    /// Sets the link flag directly. Synthetic devices get their link
    /// state driven from outside; real devices normally go through
    /// [`Device::update_link_active`].
    pub fn set_link_active(&self, link: bool) {
        self.link_active.store(link, Ordering::SeqCst);
    }

    pub fn ip4_address(&self) -> Option<std::net::Ipv4Addr> {
        match self.ip4_address.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(std::net::Ipv4Addr::from(raw)),
        }
    }

    /// IPv6 is not configured beyond this stub.
    pub fn ip6_address(&self) -> Option<std::net::Ipv6Addr> {
        None
    }

    pub fn hw_address(&self) -> [u8; 6] {
        *self.hw_addr.lock().unwrap()
    }

    pub fn config(&self) -> DeviceConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn set_config(&self, config: DeviceConfig) {
        *self.config.lock().unwrap() = config;
    }

    /// Whether the device can run driver scans; scan-incapable cards
    /// fall back to the pseudo-scan.
    pub fn supports_wireless_scan(&self) -> bool {
        self.wireless.as_ref().map_or(false, |wi| wi.scan_capable)
    }

    /// True while the activation worker is waiting for a usable access
    /// point to show up.
    pub fn is_scanning(&self) -> bool {
        self.wireless
            .as_ref()
            .map_or(false, |wi| wi.now_scanning.load(Ordering::SeqCst))
    }

    pub(crate) fn set_scanning(&self, scanning: bool) {
        if let Some(wi) = self.wireless.as_ref() {
            wi.now_scanning.store(scanning, Ordering::SeqCst);
        }
    }

    pub fn signal_strength(&self) -> Option<u8> {
        self.wireless
            .as_ref()
            .and_then(|wi| wi.signal.lock().unwrap().strength)
    }

    pub fn noise(&self) -> u8 {
        self.wireless
            .as_ref()
            .map_or(0, |wi| wi.signal.lock().unwrap().noise)
    }

    pub fn max_quality(&self) -> u8 {
        self.wireless
            .as_ref()
            .map_or(0, |wi| wi.signal.lock().unwrap().max_quality)
    }

    pub fn radio_range(&self) -> RadioRange {
        self.wireless
            .as_ref()
            .map(|wi| wi.range.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Installs a radio range on a synthetic device, standing in for
    /// what `SIOCGIWRANGE` reports on hardware.
    pub fn set_test_range(&self, range: RadioRange) {
        if !self.synthetic {
            return;
        }
        if let Some(wi) = self.wireless.as_ref() {
            *wi.range.lock().unwrap() = range;
        }
    }

    /// Snapshot of the networks this device currently sees.
    pub fn access_points(&self) -> Vec<AccessPoint> {
        self.wireless
            .as_ref()
            .map(|wi| wi.visible.lock().unwrap().snapshot())
            .unwrap_or_default()
    }

    pub fn ap_by_essid(&self, essid: &str) -> Option<AccessPoint> {
        self.wireless
            .as_ref()
            .and_then(|wi| wi.visible.lock().unwrap().get_by_essid(essid))
    }

    pub fn ap_by_address(&self, addr: &[u8; 6]) -> Option<AccessPoint> {
        self.wireless
            .as_ref()
            .and_then(|wi| wi.visible.lock().unwrap().get_by_bssid(addr))
    }

    /// Bus object path for one of this device's access points. Cloaked
    /// APs (no ESSID) have no path.
    pub fn path_for_ap(&self, ap: &AccessPoint) -> Option<String> {
        ap.essid()
            .map(|essid| format!("{}/{}/Networks/{}", DEVICES_PATH, self.iface, essid))
    }

    // Best-AP handle.

    /// The access point the device should be (or is) associated with.
    pub fn best_ap(&self) -> Option<AccessPoint> {
        self.wireless
            .as_ref()
            .and_then(|wi| wi.best_ap.lock().unwrap().ap.clone())
    }

    /// Publishes a new best AP. Any previous freeze is dropped; callers
    /// that want a sticky selection freeze again afterwards.
    pub fn set_best_ap(&self, ap: Option<AccessPoint>) {
        let Some(wi) = self.wireless.as_ref() else {
            return;
        };
        let mut guard = wi.best_ap.lock().unwrap();
        guard.ap = ap;
        guard.frozen = false;
    }

    /// Pins the current best AP so scans do not replace it while it
    /// remains visible (or is user-created).
    pub fn freeze_best_ap(&self) {
        if let Some(wi) = self.wireless.as_ref() {
            wi.best_ap.lock().unwrap().frozen = true;
        }
    }

    pub fn unfreeze_best_ap(&self) {
        if let Some(wi) = self.wireless.as_ref() {
            wi.best_ap.lock().unwrap().frozen = false;
        }
    }

    pub fn is_best_ap_frozen(&self) -> bool {
        self.wireless
            .as_ref()
            .map_or(false, |wi| wi.best_ap.lock().unwrap().frozen)
    }

    /// True when the ESSID on the card differs from the best AP's, i.e.
    /// the radio is associated to the wrong network.
    pub fn need_ap_switch(&self) -> bool {
        let cur = self.essid();
        let best = self.best_ap().and_then(|ap| ap.essid().map(str::to_string));
        cur != best
    }

    // User-key gate.

    pub(crate) fn clear_user_key_gate(&self) {
        if let Some(wi) = self.wireless.as_ref() {
            *wi.key_gate.received.lock().unwrap() = false;
        }
    }

    /// Parks until the front-end answers a key prompt, or the activation
    /// is cancelled. Returns whether a reply arrived.
    pub(crate) fn wait_user_key(&self) -> bool {
        let Some(wi) = self.wireless.as_ref() else {
            return false;
        };
        let poll = self.platform.timings.key_wait_poll;
        let mut received = wi.key_gate.received.lock().unwrap();
        loop {
            if *received {
                return true;
            }
            if self.activation.cancel.is_cancelled() {
                return false;
            }
            let (guard, _) = wi.key_gate.cv.wait_timeout(received, poll).unwrap();
            received = guard;
        }
    }

    /// Delivers the front-end's reply to a key prompt.
    ///
    /// The exact sentinel `***canceled***` means the user dismissed the
    /// prompt: the network moves to the Invalid list and the best AP is
    /// recomputed. Anything else is stored as key material on the best
    /// AP, provided it still names the network we asked about.
    pub fn set_user_key_for_network(&self, network: &str, key: &str, key_type: KeyType) {
        let Some(wi) = self.wireless.as_ref() else {
            return;
        };

        if key == KEY_CANCELED {
            info!(
                "activation ({}): user declined key for '{network}'",
                self.iface
            );
            if let Some(ap) = wi.visible.lock().unwrap().get_by_essid(network) {
                let mut bad = ap;
                bad.set_invalid(true);
                self.state.invalid.lock().unwrap().append(bad);
            }
            self.update_best_ap();
        } else {
            let mut guard = wi.best_ap.lock().unwrap();
            if let Some(best) = guard.ap.as_mut() {
                if best.essid() == Some(network) {
                    best.set_encrypted(true);
                    best.set_key(Some(key), key_type);
                }
            }
        }

        *wi.key_gate.received.lock().unwrap() = true;
        wi.key_gate.cv.notify_all();
    }

    // Activation bookkeeping shared with the worker.

    pub fn is_activating(&self) -> bool {
        self.activation.activating.load(Ordering::SeqCst)
    }

    pub(crate) fn activation_should_cancel(&self) -> bool {
        self.activation.cancel.is_cancelled()
    }

    pub fn activation_phase(&self) -> ActivationPhase {
        *self.activation.phase.lock().unwrap()
    }

    pub(crate) fn set_phase(&self, phase: ActivationPhase) {
        let mut guard = self.activation.phase.lock().unwrap();
        if *guard != phase {
            debug!("activation ({}): {} -> {}", self.iface, *guard, phase);
            *guard = phase;
        }
    }

    /// Tears the device down: cancels any activation, flushes routes and
    /// addresses, and leaves a wireless card dissociated in
    /// Infrastructure mode. `just_added` suppresses the
    /// no-longer-active signal for devices that were never active.
    pub fn deactivate(&self, just_added: bool) {
        self.activation_cancel();

        // A worker parked in the lease-maintenance loop is past the
        // activating window; stop that one too.
        if self.activation.worker_active.load(Ordering::SeqCst) {
            self.activation.cancel.cancel();
            while self.activation.worker_active.load(Ordering::SeqCst) {
                thread::sleep(self.platform.timings.cancel_wait_poll);
            }
        }

        if self.driver_support() == DriverSupport::Unsupported {
            return;
        }

        self.platform.system.flush_routes(self);
        self.platform.system.flush_addresses(self);
        self.ip4_address.store(0, Ordering::SeqCst);

        if !just_added {
            self.platform
                .bus
                .device_status_changed(self, DeviceStatus::NoLongerActive);
        }

        if self.is_wireless() {
            self.set_essid("");
            self.set_enc_key(None, AuthMethod::None);
            let _ = self.set_mode(WirelessMode::Infrastructure);
        }
    }

    /// Tells the card to chase `network` outright and reports whether
    /// some AP answered, walking the auth methods until one associates.
    ///
    /// Returns the associated BSSID and whether encryption was in play.
    /// This blows away whatever the card was doing.
    pub fn wireless_network_exists(
        &self,
        network: &str,
        key: Option<&str>,
        key_type: KeyType,
    ) -> Option<([u8; 6], bool)> {
        let Some(wi) = self.wireless.as_ref() else {
            return None;
        };
        if network.is_empty() {
            return None;
        }

        info!("({}): looking for network '{network}'...", self.iface);

        let known = wi.visible.lock().unwrap().get_by_essid(network);
        let mut mode = WirelessMode::Infrastructure;
        let mut auths = [
            AuthMethod::SharedKey,
            AuthMethod::OpenSystem,
            AuthMethod::None,
        ];
        if let Some(ap) = &known {
            mode = ap.mode();
            // A network we know is open skips the encrypted probes.
            if !ap.encrypted() {
                auths = [
                    AuthMethod::None,
                    AuthMethod::SharedKey,
                    AuthMethod::OpenSystem,
                ];
            }
        }

        if !self.is_up() {
            let _ = self.bring_up();
        }
        thread::sleep(self.platform.timings.settle_after_down);

        // An ad-hoc network has no base station to associate with; if we
        // know about it, that has to be good enough.
        if mode == WirelessMode::AdHoc {
            return known.map(|ap| {
                let enc = ap.encrypted();
                (ap.address().unwrap_or([0u8; 6]), enc)
            });
        }

        let _ = self.set_mode(mode);

        for auth in auths {
            let temp_enc = match auth {
                AuthMethod::SharedKey | AuthMethod::OpenSystem => {
                    let material = match key {
                        Some(k) if !k.is_empty() && key_type != KeyType::Unknown => {
                            hash_wep_key(k, key_type)
                        }
                        _ => crate::constants::wireless::PROBE_KEY.to_string(),
                    };
                    self.set_enc_key(Some(&material), auth);
                    true
                }
                _ => {
                    self.set_enc_key(None, auth);
                    false
                }
            };

            self.set_essid(network);
            thread::sleep(self.association_pause());
            self.update_link_active(false);

            if self.wireless_is_associated() && self.essid().is_some() {
                if let Some(addr) = self.associated_bssid() {
                    let encrypted = known.as_ref().map_or(temp_enc, |ap| ap.encrypted());
                    info!(
                        "({}): found '{network}' at {} ({})",
                        self.iface,
                        format_mac(&addr),
                        if encrypted { "encrypted" } else { "unencrypted" }
                    );
                    return Some((addr, encrypted));
                }
            }
        }

        info!("({}): network '{network}' not found", self.iface);
        None
    }

    /// Forces the device onto `essid` even if no scan has seen it.
    ///
    /// On success the network becomes the frozen best AP and any
    /// in-flight activation is cancelled so the next one targets it.
    pub fn find_and_use_essid(&self, essid: &str, key: Option<&str>, key_type: KeyType) -> bool {
        let Some(wi) = self.wireless.as_ref() else {
            return false;
        };
        debug!("({}): forcing AP '{essid}'", self.iface);

        self.deactivate(false);
        thread::sleep(self.platform.timings.worker_settle);

        // Flaky drivers routinely miss the first probe; give them one
        // more chance before concluding the network is not there.
        let mut found = self.wireless_network_exists(essid, key, key_type);
        if found.is_none() {
            found = self.wireless_network_exists(essid, key, key_type);
        }

        let mut target: Option<AccessPoint> = None;
        if let Some((addr, encrypted)) = found {
            let mut visible = wi.visible.lock().unwrap();
            let mut ap = visible
                .get_by_essid(essid)
                .or_else(|| visible.get_by_bssid(&addr))
                .unwrap_or_else(|| {
                    // The card associates but the scan never shows the
                    // network (some Cisco firmware): record it as an
                    // artificial AP so later scans preserve it.
                    let mut fresh = AccessPoint::new();
                    fresh.set_encrypted(encrypted);
                    fresh.set_artificial(true);
                    fresh.set_address(addr);
                    fresh
                });
            ap.set_essid(Some(essid));
            visible.replace(ap.clone());
            target = Some(ap);
        }

        let Some(mut ap) = target else {
            return false;
        };

        // Now that the AP has a name, pull whatever the allowed list
        // knows about it.
        if let Some(entry) = self
            .state
            .allowed
            .lock()
            .unwrap()
            .get_by_essid(ap.essid_or_none())
        {
            if entry.key().is_some() {
                ap.set_encrypted(true);
                ap.set_key(entry.key(), entry.key_type());
            }
            ap.set_invalid(entry.invalid());
            ap.set_timestamp(entry.timestamp());
        }

        if let (Some(k), true) = (key, key_type != KeyType::Unknown) {
            if !k.is_empty() {
                ap.set_encrypted(true);
                ap.set_key(Some(k), key_type);
            }
        }

        self.set_best_ap(Some(ap));
        self.freeze_best_ap();
        self.activation_cancel();
        true
    }

    pub(crate) fn store_lease(&self, lease: Option<DhcpLease>) {
        *self.dhcp_lease.lock().unwrap() = lease;
    }

    pub(crate) fn dhcp_lease(&self) -> Option<DhcpLease> {
        *self.dhcp_lease.lock().unwrap()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.activation.worker_active.load(Ordering::SeqCst) {
            warn!(
                "device {} dropped while its activation worker is alive",
                self.iface
            );
        }
    }
}
