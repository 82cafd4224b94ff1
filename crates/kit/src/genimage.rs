//! `generate-image`: remaster a bootable PC installer ISO that carries the
//! dockvirt binary, the user's image catalog, and a cloud-init autoinstall
//! payload which provisions Docker + libvirt on first boot.
//!
//! The exact installer format is deliberately a thin contract: extract the
//! base installer ISO, graft the payload, rebuild with xorriso. The base
//! ISO's own boot loader is reused, so the output boots wherever the input
//! did.

use std::path::{Path, PathBuf};

use clap::Parser;
use color_eyre::eyre::Context;
use color_eyre::Result;

use crate::env::Environment;
use crate::errors::Error;
use crate::hostcmd::{argv, run_ok, Runner};
use crate::sysprobe;

pub const INSTALLER_VOLID: &str = "DOCKVIRT-INSTALLER";

#[derive(Debug, Parser)]
pub struct GenerateImageOpts {
    /// Base installer ISO to remaster (e.g. an Ubuntu Server ISO)
    #[clap(long)]
    pub base_iso: PathBuf,

    /// Where to write the produced installer image
    #[clap(long, default_value = "dockvirt-installer.iso")]
    pub output: PathBuf,
}

/// First-boot autoinstall payload: provision virtualization and container
/// tooling, install the bundled dockvirt binary, seed the image catalog.
pub fn installer_user_data(has_config: bool) -> String {
    let mut out = String::from(
        "#cloud-config\n\
         package_update: true\n\
         packages:\n\
         \x20 - qemu-kvm\n\
         \x20 - libvirt-daemon-system\n\
         \x20 - libvirt-clients\n\
         \x20 - virtinst\n\
         \x20 - cloud-image-utils\n\
         \x20 - curl\n\
         runcmd:\n\
         \x20 - command -v docker >/dev/null 2>&1 || curl -fsSL https://get.docker.com | sh\n\
         \x20 - systemctl enable --now libvirtd docker\n\
         \x20 - virsh net-autostart default || true\n\
         \x20 - install -m 0755 /cdrom/dockvirt/dockvirt /usr/local/bin/dockvirt\n",
    );
    if has_config {
        out.push_str(
            "\x20 - install -D -m 0644 /cdrom/dockvirt/config.yaml /root/.dockvirt/config.yaml\n",
        );
    }
    out
}

pub fn installer_meta_data() -> String {
    "instance-id: dockvirt-installer\nlocal-hostname: dockvirt\n".to_string()
}

pub fn run(env: &Environment, runner: &dyn Runner, opts: &GenerateImageOpts) -> Result<()> {
    if sysprobe::which("xorriso").is_none() {
        return Err(Error::ToolMissing {
            tool: "xorriso".into(),
            hint: sysprobe::install_hint(sysprobe::OsFamily::detect(), "xorriso"),
        }
        .into());
    }
    if !opts.base_iso.is_file() {
        return Err(Error::ConfigInvalid {
            message: format!("base ISO {} does not exist", opts.base_iso.display()),
        }
        .into());
    }

    let staging = tempfile::tempdir().wrap_err("creating staging directory")?;
    let tree = staging.path().join("iso");
    std::fs::create_dir_all(&tree)?;

    tracing::info!(base = %opts.base_iso.display(), "extracting base installer ISO");
    run_ok(
        runner,
        &argv(
            "xorriso",
            [
                "-osirrox".to_string(),
                "on".to_string(),
                "-indev".to_string(),
                opts.base_iso.display().to_string(),
                "-extract".to_string(),
                "/".to_string(),
                tree.display().to_string(),
            ],
        ),
    )
    .wrap_err("extracting base ISO")?;

    write_payload(env, &tree)?;

    tracing::info!(output = %opts.output.display(), "rebuilding installer ISO");
    let mut rebuild = vec![
        "-as".to_string(),
        "mkisofs".to_string(),
        "-r".to_string(),
        "-V".to_string(),
        INSTALLER_VOLID.to_string(),
        "-J".to_string(),
        "-joliet-long".to_string(),
        "-o".to_string(),
        opts.output.display().to_string(),
    ];
    // Reuse the base image's BIOS boot loader when present.
    if tree.join("isolinux/isolinux.bin").is_file() {
        rebuild.extend(
            [
                "-b",
                "isolinux/isolinux.bin",
                "-c",
                "isolinux/boot.cat",
                "-no-emul-boot",
                "-boot-load-size",
                "4",
                "-boot-info-table",
            ]
            .map(str::to_string),
        );
    }
    rebuild.push(tree.display().to_string());
    run_ok(runner, &argv("xorriso", rebuild)).wrap_err("rebuilding installer ISO")?;

    println!("installer image written to {}", opts.output.display());
    Ok(())
}

/// Graft the dockvirt payload into the extracted ISO tree.
fn write_payload(env: &Environment, tree: &Path) -> Result<()> {
    let payload = tree.join("dockvirt");
    std::fs::create_dir_all(&payload)?;

    let exe = std::env::current_exe().wrap_err("locating the running dockvirt binary")?;
    std::fs::copy(&exe, payload.join("dockvirt"))
        .wrap_err_with(|| format!("bundling {}", exe.display()))?;

    let has_config = env.config_path().is_file();
    if has_config {
        std::fs::copy(env.config_path(), payload.join("config.yaml"))?;
    }

    let nocloud = tree.join("nocloud");
    std::fs::create_dir_all(&nocloud)?;
    std::fs::write(nocloud.join("user-data"), installer_user_data(has_config))?;
    std::fs::write(nocloud.join("meta-data"), installer_meta_data())?;
    Ok(())
}
