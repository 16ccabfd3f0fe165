use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use thiserror::Error;

/// What kind of link a device drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Wired,
    Wireless,
    Unknown,
}

/// How well the kernel driver behind a device is known to behave.
///
/// `Unsupported` devices accept no operations besides creation and
/// destruction; `SemiSupported` drivers work but lie about some state
/// (link, scan results), `FullySupported` drivers are trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverSupport {
    Unsupported,
    SemiSupported,
    FullySupported,
}

/// Wireless topology of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WirelessMode {
    Infrastructure,
    AdHoc,
    Unknown,
}

/// 802.11 authentication method used when associating.
///
/// The variants are ordered the way the fallback ladder walks them:
/// Shared Key first, then Open System, then none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    Unknown,
    None,
    OpenSystem,
    SharedKey,
}

/// Interpretation of the raw key material stored on an access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Unknown,
    Hex,
    Ascii,
    Passphrase128,
}

/// Where an activation currently stands.
///
/// Transitions only move forward along the documented edges; any phase can
/// jump to `Cancelled` (cancel flag) or `Failed` (unrecoverable error),
/// both of which end in `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationPhase {
    Idle,
    Prepare,
    WaitForAp,
    Associate,
    NeedKey,
    VerifyLink,
    ConfigureIp,
    Running,
    Cancelled,
    Failed,
    Done,
}

/// Device status published on the host bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Activating,
    NoLongerActive,
    NowActive,
}

/// Static-vs-DHCP IPv4 configuration for one device, read from the
/// system configuration at device creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub use_dhcp: bool,
    pub ip4_address: Option<Ipv4Addr>,
    pub ip4_gateway: Option<Ipv4Addr>,
    pub ip4_netmask: Option<Ipv4Addr>,
    pub ip4_broadcast: Option<Ipv4Addr>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            use_dhcp: true,
            ip4_address: None,
            ip4_gateway: None,
            ip4_netmask: None,
            ip4_broadcast: None,
        }
    }
}

/// Errors that can occur while managing a device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The kernel or driver rejected an ioctl.
    #[error("I/O error (errno {errno})")]
    Io { errno: i32 },

    /// The device's driver is classified unsupported; nothing besides
    /// creation and destruction is allowed.
    #[error("no driver support")]
    NoDriverSupport,

    /// No link came up after the association pause.
    #[error("association failed")]
    AssociationFailed,

    /// Shared Key gave no link, or DHCP failed after dropping to Open
    /// System; the key is presumed wrong.
    #[error("authentication failed")]
    AuthFailed,

    /// The target access point is encrypted and no key material exists.
    #[error("encryption key required")]
    KeyRequired,

    /// The user declined a key prompt.
    #[error("cancelled by user")]
    UserCancelled,

    /// The activation was cancelled from another thread.
    #[error("activation cancelled")]
    ActivationCancelled,

    /// DHCP did not reach the bound state.
    #[error("DHCP failed")]
    DhcpFailed,

    /// A caller passed something nonsensical.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        DeviceError::Io {
            errno: e.raw_os_error().unwrap_or(0),
        }
    }
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Wired => write!(f, "wired"),
            DeviceKind::Wireless => write!(f, "wireless"),
            DeviceKind::Unknown => write!(f, "unknown"),
        }
    }
}

impl Display for WirelessMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WirelessMode::Infrastructure => write!(f, "Infra"),
            WirelessMode::AdHoc => write!(f, "Ad-Hoc"),
            WirelessMode::Unknown => write!(f, "Unknown"),
        }
    }
}

impl Display for AuthMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Unknown => write!(f, "unknown"),
            AuthMethod::None => write!(f, "no"),
            AuthMethod::OpenSystem => write!(f, "Open System"),
            AuthMethod::SharedKey => write!(f, "Shared Key"),
        }
    }
}

impl Display for ActivationPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActivationPhase::Idle => "idle",
            ActivationPhase::Prepare => "prepare",
            ActivationPhase::WaitForAp => "wait-for-ap",
            ActivationPhase::Associate => "associate",
            ActivationPhase::NeedKey => "need-key",
            ActivationPhase::VerifyLink => "verify-link",
            ActivationPhase::ConfigureIp => "configure-ip",
            ActivationPhase::Running => "running",
            ActivationPhase::Cancelled => "cancelled",
            ActivationPhase::Failed => "failed",
            ActivationPhase::Done => "done",
        };
        write!(f, "{name}")
    }
}

impl Display for DeviceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Activating => write!(f, "activating"),
            DeviceStatus::NoLongerActive => write!(f, "no longer active"),
            DeviceStatus::NowActive => write!(f, "now active"),
        }
    }
}
