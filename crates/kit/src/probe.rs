//! HTTP readiness probing: after the guest holds a lease, poll the mapped
//! port with the user's domain as the `Host` header until the stack behind
//! the proxy answers.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use color_eyre::Result;
use rand::Rng as _;

use crate::cancel::CancelToken;
use crate::errors::Error;

pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(180);

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One GET against `http://<ip>:<port>/` with `Host: <domain>`; any 2xx/3xx
/// counts as ready.
fn try_get(client: &reqwest::blocking::Client, ip: Ipv4Addr, port: u16, domain: &str) -> bool {
    let url = format!("http://{ip}:{port}/");
    match client
        .get(&url)
        .header(reqwest::header::HOST, domain)
        .send()
    {
        Ok(response) => {
            let status = response.status().as_u16();
            (200..400).contains(&status)
        }
        Err(err) => {
            tracing::trace!(%url, %err, "probe attempt failed");
            false
        }
    }
}

/// Poll until HTTP-ready or the deadline passes.
pub fn wait_http(
    ip: Ipv4Addr,
    port: u16,
    domain: &str,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        // The proxy may answer with a redirect to https://<domain>/, which
        // does not resolve from the host; the redirect itself is readiness.
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| Error::Internal(format!("building HTTP client: {e}")))?;

    let deadline = Instant::now() + timeout;
    loop {
        cancel.check()?;
        if try_get(&client, ip, port, domain) {
            tracing::info!(%ip, port, domain, "HTTP ready");
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::HttpTimeout {
                url: format!("http://{ip}:{port}/"),
                secs: timeout.as_secs(),
            }
            .into());
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..500));
        std::thread::sleep((POLL_INTERVAL + jitter).min(remaining));
    }
}
