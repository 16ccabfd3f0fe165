//! The scan reconciler.
//!
//! Merges consecutive radio scans into a stable view of the visible
//! networks: driver records become [`AccessPoint`]s, the three-snapshot
//! ring damps driver flakiness, cloaked base stations recover their
//! known ESSIDs, allowed-network metadata is folded in, and add/remove
//! deltas go out on the host bus.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::access_point::AccessPoint;
use crate::ap_list::{ApList, ApListKind};
use crate::device::Device;
use crate::models::{AuthMethod, DriverSupport, WirelessMode};
use crate::radio::qual_to_percent;
use crate::wext::{ScanRecord, IW_ENCODE_DISABLED, IW_MODE_ADHOC};

impl Device {
    /// One reconciler tick: scan, merge, reconcile, publish deltas.
    ///
    /// Synthetic devices get a fixed list; scan-incapable cards run the
    /// pseudo-scan instead. A tick that finds the scan lock held skips
    /// itself; a scan is already in progress.
    pub fn do_wireless_scan(&self) {
        let Some(wi) = self.wireless.as_ref() else {
            return;
        };
        if self.driver_support() == DriverSupport::Unsupported {
            return;
        }

        if self.is_synthetic() {
            fake_ap_list(self);
            self.update_best_ap();
            return;
        }

        if !wi.scan_capable {
            pseudo_scan(self);
            return;
        }

        let guard = match wi.scan_lock.try_lock() {
            Ok(g) => g,
            Err(_) => {
                debug!("scan already in progress on {}, skipping tick", self.iface());
                return;
            }
        };

        if !self.is_up() {
            let _ = self.bring_up();
        }
        thread::sleep(self.platform.timings.worker_settle);

        match self.run_driver_scan() {
            Ok(records) => process_scan_results(self, &records),
            Err(e) => warn!("wireless scan on {} failed: {e}", self.iface()),
        }
        drop(guard);

        self.update_best_ap();
    }
}

/// Fold one round of driver records into the device's AP view.
pub(crate) fn process_scan_results(dev: &Device, records: &[ScanRecord]) {
    let Some(wi) = dev.wireless.as_ref() else {
        return;
    };

    let mut have_blank_essids = false;
    let mut fresh = ApList::new(ApListKind::DeviceScan);
    let max_quality = dev.max_quality();

    for rec in records {
        // A usable record has at least a name or a station address.
        if rec.essid.is_none() && rec.bssid.is_none() {
            continue;
        }

        let mut ap = AccessPoint::new();
        ap.set_essid(rec.essid.as_deref());
        if ap.essid().is_none() {
            have_blank_essids = true;
        }
        if let Some(mac) = rec.bssid {
            ap.set_address(mac);
        }

        // Cells are presumed encrypted unless the driver said the key
        // is disabled.
        let encrypted = match rec.key_flags {
            Some(flags) => (flags & IW_ENCODE_DISABLED) == 0,
            None => true,
        };
        ap.set_encrypted(encrypted);

        ap.set_mode(match rec.mode {
            Some(IW_MODE_ADHOC) => WirelessMode::AdHoc,
            _ => WirelessMode::Infrastructure,
        });

        if let Some(q) = &rec.quality {
            if let Some(pct) = qual_to_percent(q, max_quality) {
                ap.set_strength(pct);
            }
        }
        if let Some(freq) = rec.freq {
            ap.set_freq(freq);
        }

        fresh.append(ap);
    }

    let allowed = dev.state.allowed.lock().unwrap().clone();
    let old_visible = wi.visible.lock().unwrap().clone();

    // Shift the snapshot ring and compose the new view from the two
    // freshest scans; one flaky scan alone cannot drop a network.
    let (mut visible, old_for_diff) = {
        let mut ring = wi.snapshots.lock().unwrap();
        let new_middle = std::mem::replace(&mut ring.newest, fresh);
        let new_oldest = std::mem::replace(&mut ring.middle, new_middle);
        let shifted_out = std::mem::replace(&mut ring.oldest, new_oldest);
        (
            ApList::combine(&ring.newest, &ring.middle),
            ApList::combine(&ring.oldest, &shifted_out),
        )
    };

    // Give cloaking base stations their known names back, from earlier
    // sightings and from the allowed list.
    if have_blank_essids {
        visible.copy_essids_by_address(&old_visible);
        visible.copy_essids_by_address(&allowed);
    }

    visible.copy_properties(&allowed);

    // Keep an artificial AP alive while the card is associated with it;
    // some firmware never reports non-broadcasting networks in scans.
    if let Some(cur_essid) = dev.essid() {
        for ap in old_visible.snapshot() {
            if ap.artificial() && ap.essid() == Some(cur_essid.as_str()) {
                visible.append(ap);
            }
        }
    }

    *wi.visible.lock().unwrap() = visible.clone();

    emit_diff_events(dev, &old_for_diff, &visible);
}

fn emit_diff_events(dev: &Device, old: &ApList, new: &ApList) {
    let (added, removed) = ApList::diff(old, new);
    for ap in added {
        if ap.essid().is_some() {
            dev.platform.bus.wireless_network_appeared(dev, &ap);
        }
    }
    for ap in removed {
        if ap.essid().is_some() {
            dev.platform.bus.wireless_network_disappeared(dev, &ap);
        }
    }
}

/// The fixed list a synthetic device "sees".
fn fake_ap_list(dev: &Device) {
    const ESSIDS: [&str; 4] = ["green", "bay", "packers", "rule"];
    const ADDRS: [[u8; 6]; 4] = [
        [0x70, 0x37, 0x03, 0x70, 0x37, 0x03],
        [0x12, 0x34, 0x56, 0x78, 0x90, 0xab],
        [0xcd, 0xef, 0x12, 0x34, 0x56, 0x78],
        [0x90, 0xab, 0xcd, 0xef, 0x12, 0x34],
    ];
    const QUALITIES: [u8; 4] = [150, 26, 200, 100];
    const FREQS: [f64; 4] = [3.1416, 4.1416, 5.1415, 6.1415];
    const ENCRYPTED: [bool; 4] = [false, true, false, true];

    let Some(wi) = dev.wireless.as_ref() else {
        return;
    };

    let allowed = dev.state.allowed.lock().unwrap().clone();
    let old = wi.visible.lock().unwrap().clone();
    let mut list = ApList::new(ApListKind::DeviceScan);

    for i in 0..ESSIDS.len() {
        let mut ap = AccessPoint::new();
        ap.set_essid(Some(ESSIDS[i]));
        ap.set_encrypted(ENCRYPTED[i]);
        ap.set_address(ADDRS[i]);
        ap.set_strength(QUALITIES[i]);
        ap.set_freq(FREQS[i]);

        // Merge settings from the allowed networks, mainly keys.
        if let Some(entry) = allowed.get_by_essid(ESSIDS[i]) {
            ap.set_timestamp(entry.timestamp());
            if ap.encrypted() && entry.key().is_some() {
                ap.set_key(entry.key(), entry.key_type());
            }
        }

        list.append(ap);
    }

    *wi.visible.lock().unwrap() = list.clone();
    emit_diff_events(dev, &old, &list);
}

/// Brute-force discovery for cards that cannot scan: walk the allowed
/// list and try each network until one associates.
fn pseudo_scan(dev: &Device) {
    debug!("pseudo-scan on {}", dev.iface());

    let allowed = dev.state.allowed.lock().unwrap().snapshot();

    dev.set_essid("");
    for ap in allowed {
        let essid = match ap.essid() {
            Some(e) => e.to_string(),
            None => continue,
        };

        if !dev.is_up() {
            let _ = dev.bring_up();
        }

        // Remember who we were associated with before the attempt.
        let previous = dev.associated_bssid();

        match ap.hashed_key() {
            Some(key) => dev.set_enc_key(Some(&key), AuthMethod::SharedKey),
            None => dev.set_enc_key(None, AuthMethod::None),
        }
        dev.set_essid(&essid);

        thread::sleep(dev.association_pause());

        let current = match dev.associated_bssid() {
            Some(addr) => addr,
            None => continue,
        };

        // Certain cards (orinoco) accept the new ESSID but silently
        // stay associated to the old AP when they cannot reach the new
        // one; an unchanged BSSID is not a success.
        if previous == Some(current) {
            continue;
        }

        info!("{}: setting AP '{essid}' best", dev.iface());
        dev.set_best_ap(Some(ap));
        break;
    }
}

/// Handle to a running periodic scan thread.
pub struct ScanLoopHandle {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl ScanLoopHandle {
    /// Stops the loop and waits for the thread to exit.
    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

/// Runs the reconciler for one device on a helper thread at the
/// platform's scan cadence.
pub fn spawn_scan_loop(dev: Arc<Device>) -> crate::Result<ScanLoopHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let name = format!("scan-{}", dev.iface());

    let handle = thread::Builder::new().name(name).spawn(move || {
        let interval = dev.platform.timings.scan_interval;
        let step = Duration::from_millis(50).min(interval.max(Duration::from_millis(1)));
        loop {
            if flag.load(Ordering::SeqCst) {
                break;
            }
            dev.do_wireless_scan();

            let mut waited = Duration::ZERO;
            while waited < interval {
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                thread::sleep(step);
                waited += step;
            }
        }
    })?;

    Ok(ScanLoopHandle { stop, handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KeyType;
    use crate::testutil::{allowed_entry, rig, wireless_dev, BusEvent};

    fn record(essid: Option<&str>, bssid: [u8; 6]) -> ScanRecord {
        ScanRecord {
            essid: essid.map(String::from),
            bssid: Some(bssid),
            mode: None,
            freq: Some(2_412_000_000.0),
            quality: None,
            key_flags: None,
        }
    }

    fn names(dev: &Device) -> Vec<String> {
        dev.access_points()
            .iter()
            .map(|ap| ap.essid_or_none().to_string())
            .collect()
    }

    #[test]
    fn visible_list_is_union_of_two_freshest_scans() {
        let rig = rig();
        let dev = wireless_dev(&rig, "wlan0");

        process_scan_results(&dev, &[record(Some("alpha"), [1; 6])]);
        process_scan_results(&dev, &[record(Some("beta"), [2; 6])]);
        let visible = names(&dev);
        assert!(visible.contains(&"alpha".to_string()));
        assert!(visible.contains(&"beta".to_string()));

        // One scan missing alpha does not drop it; a second one does.
        process_scan_results(&dev, &[record(Some("beta"), [2; 6])]);
        let visible = names(&dev);
        assert!(!visible.contains(&"alpha".to_string()));
        assert!(visible.contains(&"beta".to_string()));
    }

    #[test]
    fn disappearance_is_reported_after_the_diff_horizon() {
        let rig = rig();
        let dev = wireless_dev(&rig, "wlan0");

        process_scan_results(&dev, &[record(Some("alpha"), [1; 6])]);
        process_scan_results(&dev, &[record(Some("beta"), [2; 6])]);
        process_scan_results(&dev, &[record(Some("beta"), [2; 6])]);

        let events = rig.bus.events();
        assert!(events.contains(&BusEvent::Appeared("alpha".to_string())));
        assert!(events.contains(&BusEvent::Appeared("beta".to_string())));
        assert!(events.contains(&BusEvent::Disappeared("alpha".to_string())));
        assert!(!events.contains(&BusEvent::Disappeared("beta".to_string())));
    }

    #[test]
    fn key_disabled_flag_means_open_network() {
        let rig = rig();
        let dev = wireless_dev(&rig, "wlan0");

        let mut open = record(Some("open"), [1; 6]);
        open.key_flags = Some(IW_ENCODE_DISABLED);
        let mut wep = record(Some("wep"), [2; 6]);
        wep.key_flags = Some(0);
        // No encode event at all is treated as encrypted.
        let silent = record(Some("silent"), [3; 6]);

        process_scan_results(&dev, &[open, wep, silent]);
        assert!(!dev.ap_by_essid("open").unwrap().encrypted());
        assert!(dev.ap_by_essid("wep").unwrap().encrypted());
        assert!(dev.ap_by_essid("silent").unwrap().encrypted());
    }

    #[test]
    fn cloaked_station_keeps_its_known_name() {
        let rig = rig();
        let dev = wireless_dev(&rig, "wlan0");
        let station = [7, 7, 7, 7, 7, 7];

        process_scan_results(&dev, &[record(Some("secret"), station)]);
        process_scan_results(&dev, &[record(None, station)]);
        process_scan_results(&dev, &[record(None, station)]);

        let ap = dev.ap_by_address(&station).unwrap();
        assert_eq!(ap.essid(), Some("secret"));
    }

    #[test]
    fn allowed_properties_fold_into_scan_results() {
        let rig = rig();
        let dev = wireless_dev(&rig, "wlan0");
        rig.state.allowed.lock().unwrap().append(allowed_entry(
            "home",
            4242,
            true,
            Some(("deadbeef01", KeyType::Hex)),
        ));

        process_scan_results(&dev, &[record(Some("home"), [1; 6])]);

        let ap = dev.ap_by_essid("home").unwrap();
        assert_eq!(ap.key(), Some("deadbeef01"));
        assert!(ap.trusted());
        assert_eq!(ap.timestamp(), 4242);
    }

    #[test]
    fn artificial_ap_survives_scans_while_associated() {
        let rig = rig();
        let dev = wireless_dev(&rig, "wlan0");

        let mut ghost = crate::access_point::AccessPoint::new();
        ghost.set_essid(Some("ghost"));
        ghost.set_address([9; 6]);
        ghost.set_artificial(true);
        dev.wireless
            .as_ref()
            .unwrap()
            .visible
            .lock()
            .unwrap()
            .append(ghost);
        dev.set_essid("ghost");

        process_scan_results(&dev, &[record(Some("beta"), [2; 6])]);
        assert!(dev.ap_by_essid("ghost").is_some());

        // Once the card associates elsewhere the ghost is dropped.
        dev.set_essid("beta");
        process_scan_results(&dev, &[record(Some("beta"), [2; 6])]);
        assert!(dev.ap_by_essid("ghost").is_none());
    }

    #[test]
    fn synthetic_scan_produces_the_seed_list() {
        let rig = rig();
        let dev = wireless_dev(&rig, "wlan0");
        rig.state.allowed.lock().unwrap().append(allowed_entry(
            "bay",
            7,
            false,
            Some(("deadbeef01", KeyType::Hex)),
        ));

        dev.do_wireless_scan();

        let visible = names(&dev);
        for essid in ["green", "bay", "packers", "rule"] {
            assert!(visible.contains(&essid.to_string()), "missing {essid}");
        }

        // Encryption follows the per-entry seed table.
        assert!(!dev.ap_by_essid("green").unwrap().encrypted());
        assert!(dev.ap_by_essid("bay").unwrap().encrypted());
        assert!(!dev.ap_by_essid("packers").unwrap().encrypted());
        assert!(dev.ap_by_essid("rule").unwrap().encrypted());

        // Strength is clamped to the percentage range.
        assert_eq!(dev.ap_by_essid("green").unwrap().strength(), 100);
        assert_eq!(dev.ap_by_essid("bay").unwrap().strength(), 26);

        // Keys merged from the allowed list.
        assert_eq!(dev.ap_by_essid("bay").unwrap().key(), Some("deadbeef01"));
    }
}
