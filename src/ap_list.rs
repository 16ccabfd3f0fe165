//! Access point lists.
//!
//! A list is a set of [`AccessPoint`]s with set identity by BSSID when
//! both sides have one, by ESSID otherwise. Lookups hand out clones;
//! a snapshot taken for iteration never observes later mutation.
//!
//! The Allowed and Invalid lists are process-wide and shared between all
//! devices; [`SharedApList`] is the handle injected into each device.

use log::warn;
use std::sync::{Arc, Mutex};

use crate::access_point::AccessPoint;

/// What role a list plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApListKind {
    /// Networks one device currently sees.
    DeviceScan,
    /// Networks the administrator permits.
    Allowed,
    /// Networks that failed during the current activation cycle. Grows
    /// monotonically until policy explicitly clears it.
    Invalid,
}

/// Shared, lock-guarded list handle.
pub type SharedApList = Arc<Mutex<ApList>>;

#[derive(Debug, Clone)]
pub struct ApList {
    kind: ApListKind,
    aps: Vec<AccessPoint>,
}

impl ApList {
    pub fn new(kind: ApListKind) -> ApList {
        ApList {
            kind,
            aps: Vec::new(),
        }
    }

    pub fn shared(kind: ApListKind) -> SharedApList {
        Arc::new(Mutex::new(ApList::new(kind)))
    }

    pub fn kind(&self) -> ApListKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.aps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aps.is_empty()
    }

    /// Adds an access point, collapsing duplicates.
    ///
    /// An AP that matches an existing entry's BSSID merges into it with
    /// the newer timestamp winning; an AP without a BSSID merges into an
    /// address-less entry with the same ESSID. An AP carrying neither an
    /// ESSID nor a usable BSSID is dropped.
    pub fn append(&mut self, ap: AccessPoint) {
        if ap.essid().is_none() && ap.address().map_or(true, |a| a == [0u8; 6]) {
            warn!("dropping access point with neither ESSID nor BSSID");
            return;
        }

        if let Some(existing) = self.aps.iter_mut().find(|e| e.same_station(&ap)) {
            merge_preferring_newer(existing, &ap);
            return;
        }
        self.aps.push(ap);
    }

    /// Replaces the entry describing the same station, or appends.
    pub fn replace(&mut self, ap: AccessPoint) {
        if let Some(existing) = self.aps.iter_mut().find(|e| e.same_station(&ap)) {
            *existing = ap;
            return;
        }
        self.append(ap);
    }

    pub fn remove_by_essid(&mut self, essid: &str) {
        self.aps.retain(|ap| ap.essid() != Some(essid));
    }

    pub fn clear(&mut self) {
        self.aps.clear();
    }

    pub fn get_by_essid(&self, essid: &str) -> Option<AccessPoint> {
        self.aps
            .iter()
            .find(|ap| ap.essid() == Some(essid))
            .cloned()
    }

    pub fn get_by_bssid(&self, bssid: &[u8; 6]) -> Option<AccessPoint> {
        self.aps
            .iter()
            .find(|ap| ap.address().as_ref() == Some(bssid))
            .cloned()
    }

    pub fn contains_essid(&self, essid: &str) -> bool {
        self.aps.iter().any(|ap| ap.essid() == Some(essid))
    }

    /// Stable snapshot for iteration.
    pub fn snapshot(&self) -> Vec<AccessPoint> {
        self.aps.clone()
    }

    /// Union of two lists; on collision the record with the newer
    /// timestamp wins.
    pub fn combine(a: &ApList, b: &ApList) -> ApList {
        let mut out = a.clone();
        for ap in &b.aps {
            out.append(ap.clone());
        }
        out
    }

    /// Station-level difference: `(added, removed)` going from `old`
    /// to `new`.
    pub fn diff(old: &ApList, new: &ApList) -> (Vec<AccessPoint>, Vec<AccessPoint>) {
        let added = new
            .aps
            .iter()
            .filter(|ap| !old.aps.iter().any(|o| o.same_station(ap)))
            .cloned()
            .collect();
        let removed = old
            .aps
            .iter()
            .filter(|ap| !new.aps.iter().any(|n| n.same_station(ap)))
            .cloned()
            .collect();
        (added, removed)
    }

    /// Copies key material, timestamps and the trusted flag from `src`
    /// entries onto entries here with matching ESSIDs.
    pub fn copy_properties(&mut self, src: &ApList) {
        for ap in &mut self.aps {
            let matching = ap
                .essid()
                .and_then(|essid| src.aps.iter().find(|s| s.essid() == Some(essid)));
            if let Some(s) = matching {
                if s.key().is_some() {
                    ap.set_encrypted(true);
                    ap.set_key(s.key(), s.key_type());
                }
                ap.set_timestamp(s.timestamp());
                ap.set_trusted(s.trusted());
            }
        }
    }

    /// Fills in blank ESSIDs here from `src` entries with the same
    /// BSSID. This is how a cloaking base station keeps its known name
    /// across scans.
    pub fn copy_essids_by_address(&mut self, src: &ApList) {
        for ap in &mut self.aps {
            if ap.essid().is_some() {
                continue;
            }
            let addr = match ap.address() {
                Some(a) => a,
                None => continue,
            };
            if let Some(named) = src.get_by_bssid(&addr) {
                if let Some(essid) = named.essid() {
                    ap.set_essid(Some(essid));
                }
            }
        }
    }
}

/// Merge `incoming` into `existing`: the newer record's scalar fields
/// win, and one-sided ESSID / key material survives either way.
fn merge_preferring_newer(existing: &mut AccessPoint, incoming: &AccessPoint) {
    let kept = existing.clone();
    if incoming.timestamp() >= kept.timestamp() {
        *existing = incoming.clone();
        if existing.essid().is_none() && kept.essid().is_some() {
            existing.set_essid(kept.essid());
        }
        if existing.key().is_none() && kept.key().is_some() && existing.encrypted() {
            existing.set_key(kept.key(), kept.key_type());
        }
    } else {
        if kept.essid().is_none() && incoming.essid().is_some() {
            existing.set_essid(incoming.essid());
        }
        if kept.key().is_none() && incoming.key().is_some() && kept.encrypted() {
            existing.set_key(incoming.key(), incoming.key_type());
        }
    }
}
