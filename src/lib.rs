// Internal implementation modules
mod activation;
mod radio;
mod scan;
mod selector;
#[cfg(test)]
mod testutil;
mod wext;

// Public API modules
pub mod access_point;
pub mod ap_list;
pub mod constants;
pub mod device;
pub mod manager;
pub mod models;
pub mod platform;

// Re-exported public API
pub use access_point::AccessPoint;
pub use activation::{choose_adhoc_frequency, CancelToken};
pub use ap_list::{ApList, ApListKind, SharedApList};
pub use device::{Device, RadioRange};
pub use manager::{Manager, SharedState};
pub use models::{
    ActivationPhase, AuthMethod, DeviceConfig, DeviceError, DeviceKind, DeviceStatus,
    DriverSupport, KeyType, WirelessMode,
};
pub use platform::{
    DhcpClient, DhcpLease, DhcpOutcome, HostBus, Platform, PropertyStore, SystemTools, Timings,
};
pub use scan::{spawn_scan_loop, ScanLoopHandle};

// Re-exported types
pub type Result<T> = std::result::Result<T, DeviceError>;
