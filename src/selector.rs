//! Best-AP selection.
//!
//! Recomputes which visible access point a device should associate
//! with, from the visible list, the process-wide Allowed and Invalid
//! lists, and the freeze flag a user's explicit choice sets.

use log::debug;

use crate::access_point::AccessPoint;
use crate::device::Device;
use crate::models::AuthMethod;

impl Device {
    /// Recalculates the best access point for this device.
    ///
    /// A frozen selection survives as long as it is still visible (and
    /// not invalidated) or is user-created. Otherwise the visible list
    /// is walked: networks on the Invalid list are skipped, networks
    /// matching an Allowed entry inherit its key material, and the
    /// winner is the trusted match with the newest timestamp, falling
    /// back to the newest untrusted match.
    ///
    /// This can disrupt the current association, so callers invoke it
    /// only when the current best AP went out of range or became
    /// unusable.
    pub fn update_best_ap(&self) {
        if self.wireless.is_none() {
            return;
        }

        if self.is_best_ap_frozen() {
            if let Some(frozen) = self.best_ap() {
                let essid = frozen.essid_or_none();
                let invalidated = self
                    .state
                    .invalid
                    .lock()
                    .unwrap()
                    .contains_essid(essid);
                let still_visible = self.ap_by_essid(essid).is_some();
                if (still_visible && !invalidated) || frozen.user_created() {
                    return;
                }
            }
            // Gone out of range; the pin no longer means anything.
            self.unfreeze_best_ap();
        }

        let visible = self.access_points();
        let allowed = self.state.allowed.lock().unwrap().clone();
        let invalid = self.state.invalid.lock().unwrap().clone();

        let mut trusted_best: Option<AccessPoint> = None;
        let mut trusted_latest: u64 = 0;
        let mut untrusted_best: Option<AccessPoint> = None;
        let mut untrusted_latest: u64 = 0;

        for scan_ap in visible {
            let essid = match scan_ap.essid() {
                Some(e) => e,
                None => continue,
            };
            if invalid.contains_essid(essid) {
                continue;
            }
            let entry = match allowed.get_by_essid(essid) {
                Some(e) => e,
                None => continue,
            };

            // Merge in the allowed entry's key so an activation can use
            // the winner as-is.
            let mut candidate = scan_ap.clone();
            if entry.key().is_some() {
                candidate.set_encrypted(true);
                candidate.set_key(entry.key(), entry.key_type());
            }

            if entry.trusted() && entry.timestamp() > trusted_latest {
                trusted_latest = entry.timestamp();
                trusted_best = Some(candidate);
            } else if !entry.trusted() && entry.timestamp() > untrusted_latest {
                untrusted_latest = entry.timestamp();
                untrusted_best = Some(candidate);
            }
        }

        let best = trusted_best.or(untrusted_best);
        let found = best.is_some();
        debug!(
            "device {}: best AP is now '{}'",
            self.iface(),
            best.as_ref().map(|ap| ap.essid_or_none()).unwrap_or("(none)")
        );
        self.set_best_ap(best);

        // With nothing to chase, leave the card up but dissociated so
        // scanning keeps working.
        if !found {
            self.set_essid(" ");
            self.set_enc_key(None, AuthMethod::None);
            let _ = self.bring_up();
        }
    }
}
