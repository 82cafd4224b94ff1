//! Default-network state, as consumed by connection-context selection and
//! the doctor's diagnosis.

use color_eyre::Result;

use crate::libvirt::Libvirt;

pub const DEFAULT_NETWORK: &str = "default";

/// The NAT network definition shipped with libvirt installations.
pub const DEFAULT_NETWORK_XML: &str = "/usr/share/libvirt/networks/default.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub defined: bool,
    pub active: bool,
    pub autostart: bool,
}

pub fn exists(lv: &Libvirt, name: &str) -> Result<bool> {
    let out = lv.virsh(&["net-list", "--all", "--name"])?;
    if !out.success() {
        return Ok(false);
    }
    Ok(out.stdout.lines().any(|l| l.trim() == name))
}

/// Status of one network from `virsh net-info`:
///
/// ```text
/// Name:           default
/// UUID:           ...
/// Active:         yes
/// Persistent:     yes
/// Autostart:      yes
/// Bridge:         virbr0
/// ```
pub fn status(lv: &Libvirt, name: &str) -> Result<NetworkStatus> {
    let out = lv.virsh(&["net-info", name])?;
    if !out.success() {
        return Ok(NetworkStatus {
            defined: false,
            active: false,
            autostart: false,
        });
    }
    Ok(NetworkStatus {
        defined: true,
        active: info_field(&out.stdout, "Active") == Some("yes"),
        autostart: info_field(&out.stdout, "Autostart") == Some("yes"),
    })
}

fn info_field<'a>(output: &'a str, field: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == field).then_some(v.trim())
    })
}
