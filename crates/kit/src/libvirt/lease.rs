//! DHCP lease discovery.
//!
//! There is no event source to subscribe to on the virsh surface, so this
//! is bounded polling with a little jitter: first the default network's
//! lease table, then `domifaddr` as a fallback for bridged guests that
//! registered with the agent.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use color_eyre::Result;
use rand::Rng as _;

use crate::cancel::CancelToken;
use crate::errors::Error;
use crate::libvirt::{network, Libvirt};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One lease query, no waiting. Returns the guest's IPv4 if present.
pub fn query(lv: &Libvirt, name: &str) -> Result<Option<Ipv4Addr>> {
    let out = lv.virsh(&["net-dhcp-leases", network::DEFAULT_NETWORK])?;
    if out.success() {
        if let Some(ip) = parse_dhcp_leases(&out.stdout, name) {
            return Ok(Some(ip));
        }
    }
    let out = lv.virsh(&["domifaddr", name])?;
    if out.success() {
        return Ok(parse_domifaddr(&out.stdout));
    }
    Ok(None)
}

/// Poll until the domain holds a lease or the deadline passes. The failure
/// path returns within about a second of `timeout`.
pub fn wait(
    lv: &Libvirt,
    name: &str,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<Ipv4Addr> {
    let deadline = Instant::now() + timeout;
    loop {
        cancel.check()?;
        if let Some(ip) = query(lv, name)? {
            tracing::info!(name, %ip, "lease acquired");
            return Ok(ip);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::LeaseTimeout {
                name: name.to_string(),
                secs: timeout.as_secs(),
            }
            .into());
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..500));
        std::thread::sleep((POLL_INTERVAL + jitter).min(remaining));
    }
}

/// Parse `virsh net-dhcp-leases <net>` output, matching on the hostname
/// column:
///
/// ```text
///  Expiry Time           MAC address         Protocol   IP address          Hostname   Client ID or DUID
/// ----------------------------------------------------------------------------------------------------
///  2024-05-01 12:00:00   52:54:00:aa:bb:cc   ipv4       192.168.122.10/24   demo       01:52:54:00:...
/// ```
fn parse_dhcp_leases(output: &str, name: &str) -> Option<Ipv4Addr> {
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // date + time + mac + proto + addr + hostname
        if fields.len() < 6 || fields[3] != "ipv4" || fields[5] != name {
            continue;
        }
        if let Some(ip) = fields[4].split('/').next() {
            if let Ok(ip) = ip.parse() {
                return Some(ip);
            }
        }
    }
    None
}

/// Parse `virsh domifaddr <name>` output (first ipv4 row).
fn parse_domifaddr(output: &str) -> Option<Ipv4Addr> {
    for line in output.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[2] != "ipv4" {
            continue;
        }
        if let Some(ip) = fields[3].split('/').next() {
            if let Ok(ip) = ip.parse() {
                return Some(ip);
            }
        }
    }
    None
}
