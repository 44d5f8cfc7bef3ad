//! The BlueZ side of a sync: the `/var/lib/bluetooth` store and the daemon
//! that owns it.

pub mod info;
pub mod service;
pub mod store;

pub use info::InfoFile;
pub use service::{ServiceControl, ServiceGuard, Systemd, Unmanaged};
pub use store::{BluezStore, DEFAULT_BLUETOOTH_DIR};
