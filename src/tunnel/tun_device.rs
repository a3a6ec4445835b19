//! Linux TUN adapter for the interface capability
//!
//! Creates a real TUN device with the `tun` crate. Linux has no per-app
//! routing at the device level, so disallowed applications and the blocking
//! flag are logged and left to the host's firewall policy.

use super::{InterfaceHandle, InterfaceProvider, InterfaceSpec};
use crate::engine::InterfaceDescriptor;
use crate::error::{Result, TunError};
use std::os::unix::io::AsRawFd;

/// Builds TUN devices named after `interface_name`
pub struct TunDeviceProvider {
    interface_name: String,
}

impl TunDeviceProvider {
    pub fn new(interface_name: &str) -> Self {
        Self {
            interface_name: interface_name.to_string(),
        }
    }
}

impl InterfaceProvider for TunDeviceProvider {
    fn establish(&self, spec: &InterfaceSpec) -> Result<Box<dyn InterfaceHandle>> {
        let mut config = tun::Configuration::default();
        config
            .name(&self.interface_name)
            .address(spec.address.addr())
            .netmask(spec.address.netmask())
            .mtu(i32::from(spec.mtu))
            .up();

        let device = tun::create(&config).map_err(|e| {
            TunError::Interface(format!("TUN interface creation failed: {e}"))
        })?;

        if !spec.disallowed_apps.is_empty() {
            log::warn!(
                "{} excluded application(s) cannot be enforced by a Linux TUN device",
                spec.disallowed_apps.len()
            );
        }
        if spec.blocking {
            log::info!("Kill switch requested for {}", self.interface_name);
        }
        log::info!(
            "TUN interface '{}' up ({}, mtu {})",
            self.interface_name,
            spec.address,
            spec.mtu
        );

        Ok(Box::new(TunDeviceHandle { device }))
    }
}

struct TunDeviceHandle {
    device: tun::platform::Device,
}

impl InterfaceHandle for TunDeviceHandle {
    fn descriptor(&self) -> InterfaceDescriptor {
        self.device.as_raw_fd()
    }

    fn close(self: Box<Self>) -> Result<()> {
        // the device closes its fd on drop
        drop(self.device);
        Ok(())
    }
}
