//! Host environment probing: OS family, required external tools, and
//! whether the hypervisor answers in each connection context. Pure — this
//! module never mutates the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::hostcmd::SharedRunner;
use crate::libvirt::{self, Connection};

/// External tools the core drives as child processes.
pub const REQUIRED_TOOLS: &[&str] = &[
    "virsh",
    "virt-install",
    "qemu-img",
    "cloud-localds",
    "docker",
    "curl",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OsFamily {
    Apt,
    Dnf,
    Pacman,
    Unknown,
}

impl OsFamily {
    pub fn detect() -> Self {
        match std::fs::read_to_string("/etc/os-release") {
            Ok(text) => Self::from_osrelease(&parse_osrelease(&text)),
            Err(_) => OsFamily::Unknown,
        }
    }

    pub fn from_osrelease(fields: &HashMap<String, String>) -> Self {
        let id = fields.get("ID").map(String::as_str).unwrap_or("");
        let id_like: Vec<&str> = fields
            .get("ID_LIKE")
            .map(|v| v.split_ascii_whitespace().collect())
            .unwrap_or_default();
        let matches = |needle: &str| id == needle || id_like.contains(&needle);
        if matches("debian") || matches("ubuntu") {
            OsFamily::Apt
        } else if matches("fedora") || matches("rhel") || matches("centos") {
            OsFamily::Dnf
        } else if matches("arch") {
            OsFamily::Pacman
        } else {
            OsFamily::Unknown
        }
    }
}

/// Parse an os-release file.
pub fn parse_osrelease(s: &str) -> HashMap<String, String> {
    s.lines()
        .filter_map(|line| {
            let (k, v) = line.split_once('=')?;
            if k.starts_with('#') {
                return None;
            }
            let v = shlex::split(v)?.into_iter().next()?;
            Some((k.to_string(), v))
        })
        .collect()
}

/// Locate a tool on `PATH`.
pub fn which(tool: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Platform-specific install hint for a missing tool. Surfaced, never run.
pub fn install_hint(family: OsFamily, tool: &str) -> String {
    let package = match (family, tool) {
        (OsFamily::Apt, "cloud-localds") => "cloud-image-utils",
        (OsFamily::Dnf, "cloud-localds") | (OsFamily::Pacman, "cloud-localds") => "cloud-utils",
        (OsFamily::Apt, "virsh") => "libvirt-clients libvirt-daemon-system",
        (OsFamily::Dnf, "virsh") => "libvirt-client libvirt",
        (OsFamily::Pacman, "virsh") => "libvirt",
        (_, "virt-install") => "virt-install",
        (OsFamily::Apt, "qemu-img") => "qemu-utils",
        (_, "qemu-img") => "qemu-img",
        (_, "docker") => {
            return "curl -fsSL https://get.docker.com | sh".to_string();
        }
        (_, other) => other,
    };
    match family {
        OsFamily::Apt => format!("sudo apt install -y {package}"),
        OsFamily::Dnf => format!("sudo dnf install -y {package}"),
        OsFamily::Pacman => format!("sudo pacman -S --noconfirm {package}"),
        OsFamily::Unknown => format!("install '{package}' with your distribution's package manager"),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub tool: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemReport {
    pub family: OsFamily,
    pub tools: Vec<ToolStatus>,
    pub session_reachable: bool,
    pub system_reachable: bool,
}

impl SystemReport {
    pub fn missing_required(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter(|t| t.path.is_none())
            .map(|t| t.tool.as_str())
            .collect()
    }
}

/// Probe the host. Tool lookup is plain `PATH` scanning; hypervisor
/// reachability shells out through the runner so tests can stub it.
pub fn probe(runner: &SharedRunner) -> SystemReport {
    let tools = REQUIRED_TOOLS
        .iter()
        .map(|tool| ToolStatus {
            tool: tool.to_string(),
            path: which(tool),
        })
        .collect();
    SystemReport {
        family: OsFamily::detect(),
        tools,
        session_reachable: libvirt::reachable(runner, Connection::Session),
        system_reachable: libvirt::reachable(runner, Connection::System),
    }
}

/// Render the `check` table.
pub fn render(report: &SystemReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("OS family: {:?}\n\n", report.family));
    out.push_str(&format!("{:<16} {:<8} PATH\n", "TOOL", "FOUND"));
    for tool in &report.tools {
        match &tool.path {
            Some(path) => {
                out.push_str(&format!("{:<16} {:<8} {}\n", tool.tool, "yes", path.display()));
            }
            None => {
                out.push_str(&format!(
                    "{:<16} {:<8} ({})\n",
                    tool.tool,
                    "NO",
                    install_hint(report.family, &tool.tool)
                ));
            }
        }
    }
    out.push_str(&format!(
        "\nlibvirt session ({}) reachable: {}\n",
        Connection::Session.uri(),
        if report.session_reachable { "yes" } else { "no" }
    ));
    out.push_str(&format!(
        "libvirt system  ({}) reachable: {}\n",
        Connection::System.uri(),
        if report.system_reachable { "yes" } else { "no" }
    ));
    out
}
