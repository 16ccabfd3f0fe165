//! Constants shared across the link-manager core.
//!
//! Timing values live on [`crate::platform::Timings`]; what is collected
//! here are the wire-level size caps, channel ranges and bus path roots
//! that never vary at runtime.

/// Wireless-extension size limits.
pub mod wireless {
    /// Longest ESSID the kernel accepts, in bytes.
    pub const ESSID_MAX_SIZE: usize = 32;

    /// Longest encryption token (key string) the kernel accepts.
    pub const ENCODING_TOKEN_MAX: usize = 64;

    /// Largest frequency table a driver can report.
    pub const MAX_FREQUENCIES: usize = 32;

    /// 802.11b channel range used for ad-hoc network creation.
    pub const B_CHANNEL_MIN: i32 = 1;
    pub const B_CHANNEL_MAX: i32 = 14;

    /// A card that can tune more channels than this is an A/B/G chipset
    /// and needs the long association pause.
    pub const B_ONLY_CHANNEL_COUNT: u16 = 14;

    /// Throwaway WEP key used when probing an encrypted network whose
    /// real key we do not have yet.
    pub const PROBE_KEY: &str = "11111111111111111111111111";
}

/// Host-bus identifiers.
pub mod bus {
    /// Root under which per-device access point objects are published.
    pub const DEVICES_PATH: &str = "/org/freedesktop/NetworkLinkManager/Devices";

    /// Exact byte string a front-end returns when the user dismissed a
    /// key prompt instead of typing a key.
    pub const KEY_CANCELED: &str = "***canceled***";
}

/// Scan policy.
pub mod scan {
    /// Default cadence of the periodic scan loop, in seconds.
    pub const INTERVAL_SECS: u64 = 10;
}

/// Synthetic-device fixtures. Synthetic devices short-circuit every radio
/// primitive to these values so the whole engine can run without hardware.
pub mod test_device {
    /// MAC reported for a synthetic radio, and the BSSID it claims to be
    /// associated with while its link flag is set.
    pub const HW_ADDR: [u8; 6] = [0x70, 0x37, 0x03, 0x70, 0x37, 0x03];

    /// IPv4 address (host order) a synthetic device acquires.
    pub const IP4_ADDRESS: u32 = 0x0703_0703;

    /// Frequency a synthetic radio reports, in Hz.
    pub const FREQUENCY: f64 = 703_000_000.0;

    /// Bitrate a synthetic radio reports, in Mb/s.
    pub const BITRATE: i32 = 11;

    /// Signal strength a synthetic radio reports, in percent.
    pub const STRENGTH: u8 = 75;
}
