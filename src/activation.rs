//! The activation engine.
//!
//! One activation is a dedicated worker thread driving the device from
//! candidate to usable default route: AP selection, the authentication
//! fallback ladder, link verification, IP configuration, and for DHCP
//! devices a lease-maintenance loop that keeps the worker alive until
//! the lease is released or the activation is torn down.
//!
//! The whole sequence is cooperatively cancellable: every fixed sleep
//! goes through [`CancelToken::sleep`], so a cancel from another thread
//! wakes the worker immediately instead of waiting out a poll interval.

use log::{debug, error, info, warn};
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::access_point::AccessPoint;
use crate::constants::wireless as wireless_consts;
use crate::device::{Device, RadioRange};
use crate::models::{
    ActivationPhase, AuthMethod, DeviceError, DeviceStatus, DriverSupport, WirelessMode,
};
use crate::platform::DhcpOutcome;
use crate::Result;

/// Cross-thread cancellation flag with prompt wakeup.
///
/// A mutex-guarded bool paired with a condvar: setting the flag wakes
/// every sleeper immediately. Cancellation is idempotent.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn cancel(&self) {
        let (lock, cv) = &*self.inner;
        *lock.lock().unwrap() = true;
        cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    pub fn reset(&self) {
        *self.inner.0.lock().unwrap() = false;
    }

    /// Sleeps for `dur`, waking early if cancelled. Returns whether the
    /// token was cancelled.
    pub fn sleep(&self, dur: Duration) -> bool {
        let (lock, cv) = &*self.inner;
        let deadline = Instant::now() + dur;
        let mut cancelled = lock.lock().unwrap();
        loop {
            if *cancelled {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cv.wait_timeout(cancelled, deadline - now).unwrap();
            cancelled = guard;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

/// Picks the frequency for a new ad-hoc network: the lowest 802.11b
/// channel the card supports that no visible AP already occupies, with
/// a random b-range channel as the congested fallback.
pub fn choose_adhoc_frequency(range: &RadioRange, visible: &[AccessPoint]) -> Option<f64> {
    let claimed: Vec<f64> = visible
        .iter()
        .map(|ap| ap.freq())
        .filter(|f| *f > 0.0)
        .collect();

    let mut candidates: Vec<(i32, f64)> = range
        .channels
        .iter()
        .filter(|(ch, _)| {
            (wireless_consts::B_CHANNEL_MIN..=wireless_consts::B_CHANNEL_MAX).contains(ch)
        })
        .copied()
        .collect();
    candidates.sort_by_key(|(ch, _)| *ch);

    for (_, freq) in &candidates {
        if !claimed.iter().any(|c| (c - freq).abs() < 1.0) {
            return Some(*freq);
        }
    }

    // Every b channel is taken; pick one more or less at random.
    if candidates.is_empty() {
        return None;
    }
    let pick = rand::thread_rng().gen_range(0..candidates.len());
    Some(candidates[pick].1)
}

impl Device {
    /// Starts activating this device on a dedicated worker thread.
    ///
    /// A second call while a worker exists is a no-op. The only error
    /// surfaced to the caller is a device whose driver is unsupported.
    ///
    /// On initial startup a wired device that already has an address is
    /// taken as configured: it completes immediately without touching
    /// the kernel, and only the final success is published.
    pub fn activate_begin(&self) -> Result<()> {
        if self.driver_support() == DriverSupport::Unsupported {
            return Err(DeviceError::NoDriverSupport);
        }
        if self.activation.worker_active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.activation.activating.store(true, Ordering::SeqCst);
        self.activation.cancel.reset();
        self.set_phase(ActivationPhase::Prepare);
        if self.is_wireless() {
            self.set_scanning(false);
            self.clear_user_key_gate();
        }

        if self.state.starting_up() && self.is_wired() && self.ip4_address().is_some() {
            info!(
                "activation ({}): already configured at startup, leaving it alone",
                self.iface()
            );
            self.activation.activating.store(false, Ordering::SeqCst);
            self.platform.bus.activation_finished(self, true);
            self.platform
                .bus
                .device_status_changed(self, DeviceStatus::NowActive);
            self.set_phase(ActivationPhase::Done);
            self.activation.worker_active.store(false, Ordering::SeqCst);
            return Ok(());
        }

        // Published synchronously with the transition, before the
        // worker can race ahead to a final state.
        self.platform
            .bus
            .device_status_changed(self, DeviceStatus::Activating);

        let Some(dev) = self.me.upgrade() else {
            self.activation.activating.store(false, Ordering::SeqCst);
            self.activation.worker_active.store(false, Ordering::SeqCst);
            return Err(DeviceError::InvalidArgument(
                "device is being torn down".into(),
            ));
        };
        let spawned = thread::Builder::new()
            .name(format!("activate-{}", self.iface()))
            .spawn(move || activation_worker(dev));
        if let Err(e) = spawned {
            error!(
                "activation ({}): could not create worker thread: {e}",
                self.iface()
            );
            self.activation.activating.store(false, Ordering::SeqCst);
            self.activation.worker_active.store(false, Ordering::SeqCst);
            self.platform.bus.activation_finished(self, false);
            return Err(e.into());
        }
        Ok(())
    }

    /// Tells the activation worker to stop, and waits until it has left
    /// its activating window. Idempotent: a second cancel is a no-op
    /// that still waits out the worker.
    pub fn activation_cancel(&self) {
        if !self.is_activating() {
            return;
        }
        debug!("activation ({}): cancelling...", self.iface());
        self.activation.cancel.cancel();
        if self.dhcp_lease().is_some() {
            self.platform.dhcp.cease(self);
        }
        while self.is_activating() {
            thread::sleep(self.platform.timings.cancel_wait_poll);
        }
        // A cancelled worker never reaches the lease loop; wait until
        // it is fully gone so the device can activate again at once.
        while self.activation.worker_active.load(Ordering::SeqCst) {
            thread::sleep(self.platform.timings.cancel_wait_poll);
        }
        debug!("activation ({}): cancelled", self.iface());
    }
}

fn activation_worker(dev: Arc<Device>) {
    debug!("activation ({}) started", dev.iface());

    if !dev.is_up() {
        let _ = dev.bring_up();
    }

    let mut success = false;
    if dev.is_wireless() {
        let mut created = false;
        if let Some(best) = dev.best_ap() {
            if best.user_created() {
                created = true;
                info!("creating wireless network '{}'", best.essid_or_none());
                success = activate_wireless_adhoc(&dev, &best);
                info!(
                    "wireless network creation for '{}' was {}",
                    best.essid_or_none(),
                    if success { "successful" } else { "unsuccessful" }
                );
            }
        }
        if !created {
            success = activate_wireless(&dev);
        }
    } else if dev.is_wired() {
        dev.set_phase(ActivationPhase::ConfigureIp);
        success = configure_ip(&dev, false);
    }

    debug!(
        "activation ({}): IP configuration {}",
        dev.iface(),
        if success { "successful" } else { "unsuccessful" }
    );

    if handle_cancel(&dev) {
        end_worker(&dev);
        return;
    }

    if !success {
        dev.set_phase(ActivationPhase::Failed);
        dev.platform.bus.activation_finished(&dev, false);
        end_worker(&dev);
        return;
    }

    // Configured. Leave the activating window before the lease loop so
    // a waiting cancel unblocks, then report up.
    dev.activation.activating.store(false, Ordering::SeqCst);
    dev.platform.bus.activation_finished(&dev, true);
    dev.platform
        .bus
        .device_status_changed(&dev, DeviceStatus::NowActive);
    info!("activation ({}): device activated", dev.iface());

    if dev.config().use_dhcp && dev.dhcp_lease().is_some() {
        run_lease_loop(&dev);
        dev.platform.dhcp.free(dev.iface());
        dev.store_lease(None);
    }

    end_worker(&dev);
}

/// Check the cancel flag; when set, unwind the radio so the card is not
/// left associated, and mark the phase.
fn handle_cancel(dev: &Device) -> bool {
    if !dev.activation_should_cancel() {
        return false;
    }
    debug!("activation ({}): activation canceled", dev.iface());
    if dev.is_wireless() {
        dev.set_essid("");
        dev.set_enc_key(None, AuthMethod::None);
        let _ = dev.set_mode(WirelessMode::Infrastructure);
    }
    dev.set_phase(ActivationPhase::Cancelled);
    true
}

fn end_worker(dev: &Device) {
    dev.set_phase(ActivationPhase::Done);
    dev.activation.activating.store(false, Ordering::SeqCst);
    dev.activation.cancel.reset();
    dev.activation.worker_active.store(false, Ordering::SeqCst);
    debug!("activation ({}) ending thread", dev.iface());
}

/// The wireless association state machine.
fn activate_wireless(dev: &Arc<Device>) -> bool {
    let timings = dev.platform.timings;
    let cancel = dev.activation.cancel.clone();
    let mut attempt: u32 = 1;
    let mut last_essid = String::new();

    if !dev.is_up() {
        let _ = dev.bring_up();
    }
    if cancel.sleep(timings.worker_settle) {
        return false;
    }

    'find_ap: loop {
        if dev.activation_should_cancel() {
            return false;
        }

        dev.set_phase(ActivationPhase::WaitForAp);
        let best = loop {
            if let Some(best) = dev.best_ap() {
                break best;
            }
            dev.set_scanning(true);
            debug!(
                "activation ({}): waiting for an access point",
                dev.iface()
            );
            if cancel.sleep(timings.ap_wait_poll) {
                dev.set_scanning(false);
                return false;
            }
        };
        dev.set_scanning(false);

        if !best.encrypted() {
            dev.set_phase(ActivationPhase::Associate);
            if !set_wireless_config(dev, &best, AuthMethod::None) {
                return false;
            }
            if best.mode() == WirelessMode::AdHoc {
                dev.set_phase(ActivationPhase::ConfigureIp);
                return configure_ip(dev, true);
            }
            dev.set_phase(ActivationPhase::VerifyLink);
            if !have_link(dev) {
                debug!(
                    "activation ({}): no link to '{}', trying another access point",
                    dev.iface(),
                    best.essid_or_none()
                );
                invalidate_best(dev, &best);
                continue 'find_ap;
            }
            dev.set_phase(ActivationPhase::ConfigureIp);
            if !configure_ip(dev, false) {
                debug!(
                    "activation ({}): could not configure IP for '{}', trying another access point",
                    dev.iface(),
                    best.essid_or_none()
                );
                invalidate_best(dev, &best);
                continue 'find_ap;
            }
            info!(
                "activation ({}): connected to '{}' and got an IP address",
                dev.iface(),
                best.essid_or_none()
            );
            return true;
        }

        // Encrypted target: possibly fetch a key, then walk the auth
        // ladder from Shared Key down.
        let mut auth = AuthMethod::SharedKey;
        let mut need_key = best.needs_key();
        'key: loop {
            if need_key {
                dev.set_phase(ActivationPhase::NeedKey);
                let essid = best.essid_or_none().to_string();
                if essid != last_essid {
                    attempt = 1;
                }
                last_essid = essid.clone();

                dev.clear_user_key_gate();
                dev.platform.bus.request_user_key(dev, &essid, attempt);
                attempt += 1;

                debug!("activation ({}): asking for user key", dev.iface());
                if !dev.wait_user_key() {
                    return false;
                }
                debug!("activation ({}): user key received", dev.iface());
                if dev.activation_should_cancel() {
                    return false;
                }

                // The user may have cancelled the prompt, in which case
                // the best AP was already recomputed; either way the
                // target is re-fetched from the top.
                continue 'find_ap;
            }

            loop {
                if dev.activation_should_cancel() {
                    return false;
                }
                dev.set_phase(ActivationPhase::Associate);
                if !set_wireless_config(dev, &best, auth) {
                    return false;
                }

                // Link checking and the auth fallback make no sense for
                // ad-hoc; just configure the interface.
                if best.mode() == WirelessMode::AdHoc {
                    dev.set_phase(ActivationPhase::ConfigureIp);
                    return configure_ip(dev, true);
                }

                dev.set_phase(ActivationPhase::VerifyLink);
                if !have_link(dev) {
                    if auth == AuthMethod::SharedKey {
                        debug!(
                            "activation ({}): no link to '{}' in Shared Key mode, trying Open System",
                            dev.iface(),
                            best.essid_or_none()
                        );
                        auth = AuthMethod::OpenSystem;
                        continue;
                    }
                    debug!(
                        "activation ({}): no link to '{}' in Open System mode, trying another access point",
                        dev.iface(),
                        best.essid_or_none()
                    );
                    invalidate_best(dev, &best);
                    continue 'find_ap;
                }

                dev.set_phase(ActivationPhase::ConfigureIp);
                if !configure_ip(dev, false) {
                    if auth == AuthMethod::SharedKey {
                        debug!(
                            "activation ({}): no IP configuration for '{}' in Shared Key mode, trying Open System",
                            dev.iface(),
                            best.essid_or_none()
                        );
                        auth = AuthMethod::OpenSystem;
                        continue;
                    }
                    // Open System with a key and still no lease: the
                    // key must be wrong.
                    debug!(
                        "activation ({}): no IP configuration for '{}' in Open System mode, asking for a new key",
                        dev.iface(),
                        best.essid_or_none()
                    );
                    need_key = true;
                    continue 'key;
                }

                info!(
                    "activation ({}): connected to '{}' and got an IP address",
                    dev.iface(),
                    best.essid_or_none()
                );
                return true;
            }
        }
    }
}

/// Create an ad-hoc network rather than joining one.
fn activate_wireless_adhoc(dev: &Device, ap: &AccessPoint) -> bool {
    let auth = if ap.encrypted() {
        AuthMethod::SharedKey
    } else {
        AuthMethod::None
    };

    let range = dev.radio_range();
    let visible = dev.access_points();
    let Some(freq) = choose_adhoc_frequency(&range, &visible) else {
        warn!(
            "no usable channel for new ad-hoc network '{}'",
            ap.essid_or_none()
        );
        return false;
    };

    let mut target = ap.clone();
    target.set_freq(freq);
    target.set_mode(WirelessMode::AdHoc);
    info!(
        "will create network '{}' with frequency {freq}",
        target.essid_or_none()
    );

    dev.set_phase(ActivationPhase::Associate);
    if !set_wireless_config(dev, &target, auth) {
        return false;
    }
    dev.set_phase(ActivationPhase::ConfigureIp);
    configure_ip(dev, true)
}

/// Push an AP's parameters onto the radio, running the full reset
/// sequence first. Returns false when cancelled mid-sequence.
///
/// Some drivers drop commands issued too close to an interface state
/// change; the settles around the down/up cycle are mandatory.
fn set_wireless_config(dev: &Device, ap: &AccessPoint, auth: AuthMethod) -> bool {
    let essid = match ap.essid() {
        Some(e) => e.to_string(),
        None => return false,
    };
    let timings = dev.platform.timings;
    let cancel = &dev.activation.cancel;

    let _ = dev.bring_down();
    if cancel.sleep(timings.settle_after_down) {
        return false;
    }
    let _ = dev.bring_up();
    if cancel.sleep(timings.settle_after_up) {
        return false;
    }
    let _ = dev.set_mode(WirelessMode::Infrastructure);
    dev.set_essid(" ");

    let _ = dev.set_mode(ap.mode());
    dev.set_bitrate(0);
    if ap.user_created() || (ap.freq() > 0.0 && ap.mode() == WirelessMode::AdHoc) {
        dev.set_frequency(ap.freq());
    }
    dev.set_enc_key(None, AuthMethod::None);
    if ap.encrypted() {
        if let Some(hashed) = ap.hashed_key() {
            dev.set_enc_key(Some(&hashed), auth);
        }
    }
    dev.set_essid(&essid);

    info!(
        "activation ({}): using essid '{}', with {} authentication",
        dev.iface(),
        essid,
        auth
    );

    // After the ESSID lands the card sweeps its channels looking for
    // the AP, which takes a while on cards with many of them.
    if cancel.sleep(dev.association_pause()) {
        return false;
    }

    // Some cards refuse to move traffic in ad-hoc mode until a bitrate
    // is forced (Atheros 5212 with madwifi); clamp those to 11 Mb/s.
    if ap.mode() == WirelessMode::AdHoc && dev.bitrate() <= 0 {
        dev.set_bitrate(11_000);
    }

    dev.update_link_active(false);
    true
}

fn have_link(dev: &Device) -> bool {
    let link = dev.link_active();
    debug!(
        "activation ({}): card appears {} a link to the access point",
        dev.iface(),
        if link { "to have" } else { "NOT to have" }
    );
    link
}

/// Move the AP onto the Invalid list and recompute the best AP.
fn invalidate_best(dev: &Device, ap: &AccessPoint) {
    let mut bad = ap.clone();
    bad.set_invalid(true);
    dev.state.invalid.lock().unwrap().append(bad);
    dev.update_best_ap();
}

/// IP-level configuration: auto-IP, DHCP or the static record.
fn configure_ip(dev: &Device, only_autoip: bool) -> bool {
    let platform = &dev.platform;
    platform.system.delete_default_route();

    let success = if only_autoip {
        platform.system.autoip(dev)
    } else if dev.config().use_dhcp {
        match platform.dhcp.request(dev) {
            DhcpOutcome::Bound(lease) => {
                dev.store_lease(Some(lease));
                true
            }
            DhcpOutcome::Failed => {
                warn!("activation ({}): DHCP request failed", dev.iface());
                // The interface cannot sit down while it is the active
                // one; scanning and link detection need it up.
                if dev.is_wireless() {
                    dev.set_essid("");
                    dev.set_enc_key(None, AuthMethod::None);
                }
                if !dev.is_up() {
                    let _ = dev.bring_up();
                }
                false
            }
        }
    } else {
        platform.system.setup_static_ip4(dev)
    };

    if success {
        platform.system.flush_arp_cache();
        platform.system.restart_mdns_responder();
        dev.update_ip4_address();
    }
    success
}

/// Keep a DHCP lease alive: renew at T1, rebind at T2, re-request at
/// expiry. Exits on cancel or when the lease cannot be kept.
fn run_lease_loop(dev: &Device) {
    let Some(mut lease) = dev.dhcp_lease() else {
        return;
    };
    dev.set_phase(ActivationPhase::Running);
    let cancel = &dev.activation.cancel;

    loop {
        if cancel.sleep(lease.renew_after) {
            break;
        }
        match dev.platform.dhcp.renew(dev) {
            DhcpOutcome::Bound(next) => {
                debug!("activation ({}): DHCP lease renewed", dev.iface());
                dev.store_lease(Some(next));
                dev.update_ip4_address();
                lease = next;
                continue;
            }
            DhcpOutcome::Failed => {
                warn!(
                    "activation ({}): DHCP renewal failed, will try rebinding",
                    dev.iface()
                );
            }
        }

        let to_rebind = lease.rebind_after.saturating_sub(lease.renew_after);
        if cancel.sleep(to_rebind) {
            break;
        }
        match dev.platform.dhcp.rebind(dev) {
            DhcpOutcome::Bound(next) => {
                debug!("activation ({}): DHCP lease rebound", dev.iface());
                dev.store_lease(Some(next));
                dev.update_ip4_address();
                lease = next;
                continue;
            }
            DhcpOutcome::Failed => {
                warn!(
                    "activation ({}): DHCP rebind failed, will re-request at expiry",
                    dev.iface()
                );
            }
        }

        let to_expiry = lease.expires_after.saturating_sub(lease.rebind_after);
        if cancel.sleep(to_expiry) {
            break;
        }
        match dev.platform.dhcp.request(dev) {
            DhcpOutcome::Bound(next) => {
                dev.store_lease(Some(next));
                dev.update_ip4_address();
                lease = next;
            }
            DhcpOutcome::Failed => {
                error!(
                    "activation ({}): lease expired and could not be reacquired",
                    dev.iface()
                );
                dev.platform
                    .bus
                    .device_status_changed(dev, DeviceStatus::NoLongerActive);
                break;
            }
        }
    }
}
