//! Virtual interface capability
//!
//! Interface construction is owned by the host OS. The session manager
//! describes the interface it needs with an [`InterfaceSpec`] and asks an
//! [`InterfaceProvider`] to establish it.

use crate::engine::InterfaceDescriptor;
use crate::error::Result;
use ipnet::Ipv4Net;
use std::collections::BTreeSet;

#[cfg(all(target_os = "linux", feature = "tun-device"))]
pub mod tun_device;

/// Everything the OS needs to build the virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    /// Session label shown by the OS
    pub session_name: String,
    pub mtu: u16,
    pub address: Ipv4Net,
    pub routes: Vec<Ipv4Net>,
    /// Applications whose traffic must bypass the tunnel
    pub disallowed_apps: BTreeSet<String>,
    /// Kill switch: block traffic instead of falling back to the direct path
    pub blocking: bool,
}

/// An established interface
pub trait InterfaceHandle: Send {
    /// Descriptor handed to the engine bridge
    fn descriptor(&self) -> InterfaceDescriptor;

    /// Release the interface
    fn close(self: Box<Self>) -> Result<()>;
}

/// OS capability that builds virtual interfaces
pub trait InterfaceProvider: Send + Sync {
    /// Whether the user granted tunnel permission
    fn permission_granted(&self) -> bool {
        true
    }

    fn establish(&self, spec: &InterfaceSpec) -> Result<Box<dyn InterfaceHandle>>;
}
