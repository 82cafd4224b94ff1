//! Domain lifecycle operations: define-and-start via `virt-install`,
//! idempotent destroy, and listing.

use std::path::Path;

use color_eyre::Result;

use crate::config::OsImage;
use crate::errors::Error;
use crate::libvirt::Libvirt;
use crate::spec::{NetSpec, VmSpec};

/// Whether a domain with this name is defined in any state.
pub fn exists(lv: &Libvirt, name: &str) -> Result<bool> {
    Ok(list(lv)?.iter().any(|d| d == name))
}

/// Names of all defined domains, running or not.
pub fn list(lv: &Libvirt) -> Result<Vec<String>> {
    let out = lv.virsh(&["list", "--all", "--name"])?;
    if !out.success() {
        return Err(color_eyre::eyre::eyre!(
            "listing domains failed: {}",
            out.stderr.trim()
        ));
    }
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// `running`, `shut off`, … — or None when the domain is not defined.
pub fn state(lv: &Libvirt, name: &str) -> Result<Option<String>> {
    let out = lv.virsh(&["domstate", name])?;
    if !out.success() {
        return Ok(None);
    }
    Ok(Some(out.stdout.trim().to_string()))
}

pub fn is_running(lv: &Libvirt, name: &str) -> Result<bool> {
    Ok(state(lv, name)?.as_deref() == Some("running"))
}

/// Create and start the domain for a prepared VM: overlay disk plus the
/// seed ISO as a read-only CD-ROM, guest variant from the image catalog,
/// NIC on the declared network. Fails with `DomainCreate` when a domain of
/// this name already exists in any state.
pub fn define_and_start(
    lv: &Libvirt,
    spec: &VmSpec,
    os_image: &OsImage,
    disk: &Path,
    seed: &Path,
) -> Result<()> {
    if exists(lv, &spec.name)? {
        return Err(Error::DomainCreate {
            name: spec.name.clone(),
            message: "a domain with this name is already defined".into(),
        }
        .into());
    }

    let network_arg = match &spec.net {
        NetSpec::Default => "network=default".to_string(),
        NetSpec::Bridge(ifname) => format!("bridge={ifname}"),
    };

    let argv = vec![
        "virt-install".to_string(),
        "--connect".to_string(),
        lv.connection.uri().to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--memory".to_string(),
        spec.mem_mib.to_string(),
        "--vcpus".to_string(),
        spec.cpus.to_string(),
        "--disk".to_string(),
        format!("path={},format=qcow2,bus=virtio", disk.display()),
        "--disk".to_string(),
        format!("path={},device=cdrom", seed.display()),
        "--os-variant".to_string(),
        os_image.variant.clone(),
        "--import".to_string(),
        "--network".to_string(),
        network_arg,
        "--noautoconsole".to_string(),
        "--graphics".to_string(),
        "none".to_string(),
    ];

    tracing::info!(name = %spec.name, variant = %os_image.variant, "defining and starting domain");
    let out = lv.runner().run(&argv)?;
    if !out.success() {
        return Err(Error::DomainCreate {
            name: spec.name.clone(),
            message: out.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(())
}

/// Power off (if needed) and undefine. Absent domains are success, and the
/// whole operation can be repeated freely.
pub fn destroy(lv: &Libvirt, name: &str) -> Result<()> {
    if !exists(lv, name)? {
        tracing::debug!(name, "domain already absent");
        return Ok(());
    }
    if is_running(lv, name)? {
        let out = lv.virsh(&["destroy", name])?;
        if !out.success() {
            tracing::warn!(name, stderr = %out.stderr.trim(), "virsh destroy failed");
        }
    }
    let out = lv.virsh(&["undefine", name])?;
    if !out.success() {
        // Racing with another teardown is fine; only fail when the domain
        // is still defined afterwards.
        if exists(lv, name)? {
            return Err(color_eyre::eyre::eyre!(
                "undefining domain '{name}' failed: {}",
                out.stderr.trim()
            ));
        }
    }
    tracing::info!(name, "domain destroyed");
    Ok(())
}
