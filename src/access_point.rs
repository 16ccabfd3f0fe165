//! Access point records.
//!
//! An [`AccessPoint`] is a plain value: lists hand out clones, so a
//! record obtained from an accessor stays valid after the list that
//! produced it has moved on.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::models::{AuthMethod, KeyType, WirelessMode};

/// One wireless network as seen by a device or configured by the
/// administrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessPoint {
    essid: Option<String>,
    address: Option<[u8; 6]>,
    mode: WirelessMode,
    freq: f64,
    strength: u8,
    encrypted: bool,
    key: Option<String>,
    key_type: KeyType,
    auth: AuthMethod,
    invalid: bool,
    artificial: bool,
    user_created: bool,
    trusted: bool,
    timestamp: u64,
}

impl Default for AccessPoint {
    fn default() -> Self {
        AccessPoint {
            essid: None,
            address: None,
            mode: WirelessMode::Infrastructure,
            freq: 0.0,
            strength: 0,
            encrypted: false,
            key: None,
            key_type: KeyType::Unknown,
            auth: AuthMethod::Unknown,
            invalid: false,
            artificial: false,
            user_created: false,
            trusted: false,
            timestamp: 0,
        }
    }
}

impl AccessPoint {
    pub fn new() -> AccessPoint {
        AccessPoint::default()
    }

    pub fn essid(&self) -> Option<&str> {
        self.essid.as_deref()
    }

    /// ESSID for log lines; cloaked networks print as `(none)`.
    pub fn essid_or_none(&self) -> &str {
        self.essid.as_deref().unwrap_or("(none)")
    }

    /// Stores an ESSID, normalising blank and driver sentinel values to
    /// "no ESSID". The ipw2x00 drivers report `<hidden>` for cloaking
    /// base stations.
    pub fn set_essid(&mut self, essid: Option<&str>) {
        self.essid = match essid {
            Some(s) if !s.is_empty() && s != "<hidden>" => Some(s.to_string()),
            _ => None,
        };
    }

    pub fn address(&self) -> Option<[u8; 6]> {
        self.address
    }

    pub fn set_address(&mut self, addr: [u8; 6]) {
        self.address = Some(addr);
    }

    pub fn mode(&self) -> WirelessMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: WirelessMode) {
        self.mode = mode;
    }

    /// Frequency in Hz; 0.0 when unknown.
    pub fn freq(&self) -> f64 {
        self.freq
    }

    pub fn set_freq(&mut self, freq: f64) {
        self.freq = freq;
    }

    pub fn strength(&self) -> u8 {
        self.strength
    }

    /// Stores a strength percentage, clamped to 0-100.
    pub fn set_strength(&mut self, strength: u8) {
        self.strength = strength.min(100);
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    /// Marking an AP unencrypted drops any key material it carried.
    pub fn set_encrypted(&mut self, encrypted: bool) {
        self.encrypted = encrypted;
        if !encrypted {
            self.key = None;
            self.key_type = KeyType::Unknown;
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn set_key(&mut self, key: Option<&str>, key_type: KeyType) {
        match key {
            Some(k) if !k.is_empty() => {
                self.key = Some(k.to_string());
                self.key_type = key_type;
            }
            _ => {
                self.key = None;
                self.key_type = KeyType::Unknown;
            }
        }
    }

    /// The key material in the raw hex form the radio expects, derived
    /// from whatever form the user supplied it in.
    pub fn hashed_key(&self) -> Option<String> {
        self.key
            .as_deref()
            .map(|k| hash_wep_key(k, self.key_type))
    }

    /// True when this AP is encrypted but no usable key exists yet.
    pub fn needs_key(&self) -> bool {
        self.encrypted && self.key.as_deref().map_or(true, str::is_empty)
    }

    pub fn auth(&self) -> AuthMethod {
        self.auth
    }

    pub fn set_auth(&mut self, auth: AuthMethod) {
        self.auth = auth;
    }

    pub fn invalid(&self) -> bool {
        self.invalid
    }

    pub fn set_invalid(&mut self, invalid: bool) {
        self.invalid = invalid;
    }

    pub fn artificial(&self) -> bool {
        self.artificial
    }

    pub fn set_artificial(&mut self, artificial: bool) {
        self.artificial = artificial;
    }

    pub fn user_created(&self) -> bool {
        self.user_created
    }

    pub fn set_user_created(&mut self, user_created: bool) {
        self.user_created = user_created;
    }

    pub fn trusted(&self) -> bool {
        self.trusted
    }

    pub fn set_trusted(&mut self, trusted: bool) {
        self.trusted = trusted;
    }

    /// Last-seen / last-used timestamp, seconds since the epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    pub fn touch(&mut self) {
        self.timestamp = now_secs();
    }

    /// Whether two records describe the same base station: BSSIDs decide
    /// when both sides have one, otherwise the ESSIDs do.
    pub fn same_station(&self, other: &AccessPoint) -> bool {
        match (self.address, other.address) {
            (Some(a), Some(b)) => a == b,
            (None, None) => {
                self.essid.is_some() && self.essid == other.essid
            }
            _ => false,
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Derive the raw hex WEP key the driver wants from user-form material.
pub(crate) fn hash_wep_key(key: &str, key_type: KeyType) -> String {
    match key_type {
        KeyType::Passphrase128 => wep128_key_from_passphrase(key),
        KeyType::Ascii => {
            if key.len() <= 5 {
                hex_of(&key.as_bytes()[..key.len().min(5)])
            } else {
                hex_of(&key.as_bytes()[..key.len().min(13)])
            }
        }
        KeyType::Hex | KeyType::Unknown => key.to_string(),
    }
}

/// The de-facto 128-bit WEP passphrase derivation: the passphrase is
/// repeated to fill 64 bytes, MD5-hashed, and the first 13 bytes of the
/// digest become the key.
fn wep128_key_from_passphrase(passphrase: &str) -> String {
    let mut material = [0u8; 64];
    let bytes = passphrase.as_bytes();
    if !bytes.is_empty() {
        for (i, slot) in material.iter_mut().enumerate() {
            *slot = bytes[i % bytes.len()];
        }
    }
    let digest = Md5::digest(material);
    hex_of(&digest[..13])
}

fn hex_of(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// A MAC address usable as a BSSID: neither all-zero nor broadcast.
pub fn ethernet_address_is_valid(addr: &[u8; 6]) -> bool {
    *addr != [0u8; 6] && *addr != [0xffu8; 6]
}

pub(crate) fn format_mac(addr: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        addr[0], addr[1], addr[2], addr[3], addr[4], addr[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_and_sentinel_essids_normalise_to_none() {
        let mut ap = AccessPoint::new();
        ap.set_essid(Some("home"));
        assert_eq!(ap.essid(), Some("home"));
        ap.set_essid(Some(""));
        assert_eq!(ap.essid(), None);
        ap.set_essid(Some("<hidden>"));
        assert_eq!(ap.essid(), None);
        assert_eq!(ap.essid_or_none(), "(none)");
    }

    #[test]
    fn clearing_encryption_drops_key_material() {
        let mut ap = AccessPoint::new();
        ap.set_encrypted(true);
        ap.set_key(Some("deadbeef01"), KeyType::Hex);
        assert!(!ap.needs_key());
        ap.set_encrypted(false);
        assert_eq!(ap.key(), None);
        assert_eq!(ap.key_type(), KeyType::Unknown);
    }

    #[test]
    fn encrypted_without_key_needs_one() {
        let mut ap = AccessPoint::new();
        ap.set_encrypted(true);
        assert!(ap.needs_key());
        ap.set_key(Some("deadbeef01"), KeyType::Hex);
        assert!(!ap.needs_key());
        let mut open = AccessPoint::new();
        open.set_encrypted(false);
        assert!(!open.needs_key());
    }

    #[test]
    fn strength_is_clamped() {
        let mut ap = AccessPoint::new();
        ap.set_strength(200);
        assert_eq!(ap.strength(), 100);
        ap.set_strength(42);
        assert_eq!(ap.strength(), 42);
    }

    #[test]
    fn station_identity_prefers_bssid() {
        let mut a = AccessPoint::new();
        let mut b = AccessPoint::new();
        a.set_essid(Some("one"));
        b.set_essid(Some("two"));
        a.set_address([1, 2, 3, 4, 5, 6]);
        b.set_address([1, 2, 3, 4, 5, 6]);
        assert!(a.same_station(&b));

        b.set_address([9, 9, 9, 9, 9, 9]);
        assert!(!a.same_station(&b));

        // No addresses on either side: ESSIDs decide.
        let mut c = AccessPoint::new();
        let mut d = AccessPoint::new();
        c.set_essid(Some("lab"));
        d.set_essid(Some("lab"));
        assert!(c.same_station(&d));

        // One-sided address is never a match.
        d.set_address([1, 1, 1, 1, 1, 1]);
        assert!(!c.same_station(&d));
    }

    #[test]
    fn ascii_keys_hash_by_length() {
        // 5-char ASCII key -> 64-bit WEP, 10 hex digits.
        assert_eq!(hash_wep_key("hello", KeyType::Ascii), "68656c6c6f");
        // Longer ASCII key -> 128-bit WEP, 26 hex digits.
        let k = hash_wep_key("thirteenchars", KeyType::Ascii);
        assert_eq!(k.len(), 26);
        assert!(k.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn passphrase_hash_is_deterministic_128_bit() {
        let a = hash_wep_key("correct horse", KeyType::Passphrase128);
        let b = hash_wep_key("correct horse", KeyType::Passphrase128);
        let c = hash_wep_key("battery staple", KeyType::Passphrase128);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 26);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn hex_keys_pass_through() {
        assert_eq!(hash_wep_key("deadbeef01", KeyType::Hex), "deadbeef01");
        assert_eq!(hash_wep_key("cafe", KeyType::Unknown), "cafe");
    }

    #[test]
    fn ethernet_address_validity() {
        assert!(ethernet_address_is_valid(&[0x70, 0x37, 0x03, 0x70, 0x37, 0x03]));
        assert!(!ethernet_address_is_valid(&[0; 6]));
        assert!(!ethernet_address_is_valid(&[0xff; 6]));
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(
            format_mac(&[0x70, 0x37, 0x03, 0x70, 0x37, 0x03]),
            "70:37:03:70:37:03"
        );
    }
}
