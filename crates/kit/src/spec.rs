//! Resolving the layered configuration into one frozen [`VmSpec`].
//!
//! Precedence, lowest to highest: built-in defaults, the project file,
//! CLI overrides. Validation happens exactly once, here; downstream
//! components consume the immutable result.

use std::fmt;

use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::config::GlobalConfig;
use crate::errors::Error;
use crate::project::ProjectConfig;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MEM_MIB: u32 = 4096;
const DEFAULT_CPUS: u32 = 2;
const DEFAULT_DISK_GIB: u32 = 20;

pub const MIN_MEM_MIB: u32 = 256;

/// Network attachment for the guest NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetSpec {
    /// The hypervisor's default NAT network.
    Default,
    /// An existing host bridge.
    Bridge(String),
}

impl NetSpec {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "default" => Ok(NetSpec::Default),
            other => match other.strip_prefix("bridge=") {
                Some(ifname) if !ifname.is_empty() => Ok(NetSpec::Bridge(ifname.to_string())),
                _ => Err(Error::ConfigInvalid {
                    message: format!("net '{other}' is neither `default` nor `bridge=<ifname>`"),
                }
                .into()),
            },
        }
    }
}

impl fmt::Display for NetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetSpec::Default => write!(f, "default"),
            NetSpec::Bridge(ifname) => write!(f, "bridge={ifname}"),
        }
    }
}

/// The frozen result of the config merge. Serialized into the per-VM work
/// directory so a later `up` can detect spec drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub domain: String,
    /// Container image reference to run inside the guest.
    pub image: String,
    /// Guest port the container publishes and the proxy forwards to.
    pub port: u16,
    /// OS image catalog key.
    pub os: String,
    pub mem_mib: u32,
    pub cpus: u32,
    pub disk_gib: u32,
    pub net: NetSpec,
}

/// Per-invocation overrides, all optional; populated by the CLI.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub name: Option<String>,
    pub domain: Option<String>,
    pub image: Option<String>,
    pub port: Option<u16>,
    pub os: Option<String>,
    pub mem_mib: Option<u32>,
    pub cpus: Option<u32>,
    pub disk_gib: Option<u32>,
    pub net: Option<String>,
}

/// Merge defaults, project file and CLI overrides; validate; freeze.
pub fn resolve(
    global: &GlobalConfig,
    project: Option<&ProjectConfig>,
    cli: &Overrides,
) -> Result<VmSpec> {
    let field = |cli_value: Option<&str>, key: &str| -> Option<String> {
        cli_value
            .map(str::to_string)
            .or_else(|| project.and_then(|p| p.get(key)).map(str::to_string))
    };

    let name = field(cli.name.as_deref(), "name").ok_or_else(|| missing("name"))?;
    let domain = field(cli.domain.as_deref(), "domain").ok_or_else(|| missing("domain"))?;
    let image = field(cli.image.as_deref(), "image").ok_or_else(|| missing("image"))?;
    let os = field(cli.os.as_deref(), "os").unwrap_or_else(|| global.default_os.clone());

    let port = match cli.port {
        Some(p) => p,
        None => parse_num(project, "port", DEFAULT_PORT)?,
    };
    let mem_mib = match cli.mem_mib {
        Some(m) => m,
        None => parse_num(project, "mem", DEFAULT_MEM_MIB)?,
    };
    let cpus = match cli.cpus {
        Some(c) => c,
        None => parse_num(project, "cpus", DEFAULT_CPUS)?,
    };
    let disk_gib = match cli.disk_gib {
        Some(d) => d,
        None => parse_num(project, "disk", DEFAULT_DISK_GIB)?,
    };
    let net = NetSpec::parse(
        &field(cli.net.as_deref(), "net").unwrap_or_else(|| "default".to_string()),
    )?;

    if !is_dns_label(&name) {
        return Err(Error::ConfigInvalid {
            message: format!("name '{name}' is not a valid DNS label (lowercase alphanumerics and '-', at most 63 chars)"),
        }
        .into());
    }
    // virt-install and the catalog both reject unknown keys, but fail here
    // before any filesystem work happens.
    global.lookup(&os)?;
    if port == 0 {
        return Err(Error::ConfigInvalid {
            message: "port must be between 1 and 65535".to_string(),
        }
        .into());
    }
    if mem_mib < MIN_MEM_MIB {
        return Err(Error::ConfigInvalid {
            message: format!("mem {mem_mib} MiB is below the {MIN_MEM_MIB} MiB minimum"),
        }
        .into());
    }
    if cpus < 1 {
        return Err(Error::ConfigInvalid {
            message: "cpus must be at least 1".to_string(),
        }
        .into());
    }
    if disk_gib < 1 {
        return Err(Error::ConfigInvalid {
            message: "disk must be at least 1 GiB".to_string(),
        }
        .into());
    }

    Ok(VmSpec {
        name,
        domain,
        image,
        port,
        os,
        mem_mib,
        cpus,
        disk_gib,
        net,
    })
}

fn missing(key: &str) -> color_eyre::Report {
    Error::ConfigInvalid {
        message: format!("'{key}' is required; set it in {} or pass --{key}", crate::project::PROJECT_FILE),
    }
    .into()
}

fn parse_num<T: std::str::FromStr>(
    project: Option<&ProjectConfig>,
    key: &str,
    default: T,
) -> Result<T> {
    match project.and_then(|p| p.get(key)) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            Error::ConfigInvalid {
                message: format!("'{key}={raw}' is not a valid number"),
            }
            .into()
        }),
    }
}

/// DNS-1123 label: lowercase alphanumerics and hyphens, must start and end
/// alphanumeric, at most 63 characters.
fn is_dns_label(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    let bytes = s.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}
