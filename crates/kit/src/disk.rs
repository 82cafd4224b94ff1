//! Overlay disk creation: a qcow2 copy-on-write layer over the cached base
//! image, sized to the spec at creation time.

use std::path::{Path, PathBuf};

use color_eyre::Result;

use crate::errors::Error;
use crate::hostcmd::{argv, Runner};

pub const DISK_NAME: &str = "disk.qcow2";

pub fn overlay_path(work_dir: &Path) -> PathBuf {
    work_dir.join(DISK_NAME)
}

/// `qemu-img create -f qcow2 -b <base> -F qcow2 <overlay> <disk>G`
pub fn create_overlay(
    runner: &dyn Runner,
    base_image: &Path,
    work_dir: &Path,
    disk_gib: u32,
) -> Result<PathBuf> {
    let overlay = overlay_path(work_dir);
    let out = runner.run(&argv(
        "qemu-img",
        [
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            "-b".to_string(),
            base_image.display().to_string(),
            "-F".to_string(),
            "qcow2".to_string(),
            overlay.display().to_string(),
            format!("{disk_gib}G"),
        ],
    ))?;
    if !out.success() {
        return Err(Error::DiskCreate {
            path: overlay.display().to_string(),
            message: out.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(overlay)
}
