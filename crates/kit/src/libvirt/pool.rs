//! Default storage pool state, as consumed by the doctor's diagnosis.

use color_eyre::Result;

use crate::libvirt::Libvirt;

pub const DEFAULT_POOL: &str = "default";

/// Directory backing the pool the doctor defines when none exists.
pub const DEFAULT_POOL_DIR: &str = "/var/lib/libvirt/images";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub defined: bool,
    pub active: bool,
    pub autostart: bool,
}

pub fn status(lv: &Libvirt, name: &str) -> Result<PoolStatus> {
    let out = lv.virsh(&["pool-info", name])?;
    if !out.success() {
        return Ok(PoolStatus {
            defined: false,
            active: false,
            autostart: false,
        });
    }
    let field = |key: &str| {
        out.stdout.lines().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k.trim() == key).then(|| v.trim().to_string())
        })
    };
    Ok(PoolStatus {
        defined: true,
        active: field("State").as_deref() == Some("running"),
        autostart: field("Autostart").as_deref() == Some("yes"),
    })
}
