//! libvirt integration, driven through the `virsh`/`virt-install` CLI
//! surface as child processes.
//!
//! Submodules:
//! - `domain`: define/start/destroy/undefine/list
//! - `lease`: DHCP lease polling against the default network
//! - `network`/`pool`: default-network and storage-pool state, used by the
//!   doctor for diagnosis and repair

use color_eyre::Result;

use crate::hostcmd::{CmdOutput, SharedRunner};
use crate::spec::NetSpec;

pub mod domain;
pub mod lease;
pub mod network;
pub mod pool;

/// libvirt has two connection contexts; VMs created in one are invisible
/// to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    /// Per-user `qemu:///session`.
    Session,
    /// System-wide `qemu:///system` (the context the default NAT network
    /// and storage pool normally live in).
    System,
}

impl Connection {
    pub fn uri(&self) -> &'static str {
        match self {
            Connection::Session => "qemu:///session",
            Connection::System => "qemu:///system",
        }
    }
}

/// Handle over one libvirt connection context.
#[derive(Clone)]
pub struct Libvirt {
    runner: SharedRunner,
    pub connection: Connection,
}

impl Libvirt {
    pub fn new(runner: SharedRunner, connection: Connection) -> Self {
        Self { runner, connection }
    }

    /// Pick the connection context for a spec.
    ///
    /// `LIBVIRT_DEFAULT_URI` wins when set (it is also what the doctor
    /// recommends exporting). Otherwise: use the session context when it
    /// carries the network the spec declares, and fall back to the system
    /// context when the network is defined only there and the context is
    /// reachable.
    pub fn detect(runner: SharedRunner, net: &NetSpec) -> Self {
        Self::detect_with(runner, net, std::env::var("LIBVIRT_DEFAULT_URI").ok())
    }

    fn detect_with(runner: SharedRunner, net: &NetSpec, uri_override: Option<String>) -> Self {
        if let Some(uri) = uri_override {
            let connection = if uri.contains("session") {
                Connection::Session
            } else {
                Connection::System
            };
            tracing::debug!(%uri, "connection context from LIBVIRT_DEFAULT_URI");
            return Self::new(runner, connection);
        }

        let connection = match net {
            // Bridged NICs attach to a host interface; that normally needs
            // the system-wide daemon.
            NetSpec::Bridge(_) => {
                if reachable(&runner, Connection::System) {
                    Connection::System
                } else {
                    Connection::Session
                }
            }
            NetSpec::Default => {
                let session = Self::new(runner.clone(), Connection::Session);
                let system = Self::new(runner.clone(), Connection::System);
                if network::exists(&session, network::DEFAULT_NETWORK).unwrap_or(false) {
                    Connection::Session
                } else if reachable(&runner, Connection::System)
                    && network::exists(&system, network::DEFAULT_NETWORK).unwrap_or(false)
                {
                    Connection::System
                } else {
                    Connection::Session
                }
            }
        };
        tracing::debug!(uri = connection.uri(), "selected connection context");
        Self::new(runner, connection)
    }

    /// Run `virsh -c <uri> <args…>`, returning the raw output.
    pub(crate) fn virsh(&self, args: &[&str]) -> Result<CmdOutput> {
        let mut argv = vec![
            "virsh".to_string(),
            "-c".to_string(),
            self.connection.uri().to_string(),
        ];
        argv.extend(args.iter().map(|s| s.to_string()));
        self.runner.run(&argv)
    }

    pub(crate) fn runner(&self) -> &SharedRunner {
        &self.runner
    }
}

/// Whether `virsh` can talk to the given context at all.
pub fn reachable(runner: &SharedRunner, connection: Connection) -> bool {
    runner
        .run(&[
            "virsh".to_string(),
            "-c".to_string(),
            connection.uri().to_string(),
            "uri".to_string(),
        ])
        .map(|out| out.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostcmd::testing::StubRunner;
    use std::sync::Arc;

    #[test]
    fn session_preferred_when_it_has_the_default_network() {
        let runner = Arc::new(StubRunner::new(|argv| {
            let line = argv.join(" ");
            if line.contains("session") && line.contains("net-list") {
                CmdOutput::ok(0, "default\n")
            } else {
                CmdOutput::ok(0, "")
            }
        }));
        let lv = Libvirt::detect_with(runner, &NetSpec::Default, None);
        assert_eq!(lv.connection, Connection::Session);
    }

    #[test]
    fn env_uri_override_wins() {
        let runner = Arc::new(StubRunner::always_ok());
        let lv = Libvirt::detect_with(
            runner,
            &NetSpec::Default,
            Some("qemu:///system".to_string()),
        );
        assert_eq!(lv.connection, Connection::System);
    }

    #[test]
    fn system_selected_when_default_network_only_there() {
        let runner = Arc::new(StubRunner::new(|argv| {
            let line = argv.join(" ");
            if line.contains("qemu:///system") && line.contains("net-list") {
                CmdOutput::ok(0, "default\n")
            } else if line.ends_with("uri") {
                CmdOutput::ok(0, "qemu:///system\n")
            } else {
                CmdOutput::ok(0, "")
            }
        }));
        let lv = Libvirt::detect_with(runner, &NetSpec::Default, None);
        assert_eq!(lv.connection, Connection::System);
    }

    #[test]
    fn virsh_always_passes_connection_uri() {
        let runner = Arc::new(StubRunner::always_ok());
        let lv = Libvirt::new(runner.clone(), Connection::System);
        lv.virsh(&["list", "--all", "--name"]).unwrap();
        let call = runner.call_lines().remove(0);
        assert_eq!(call, "virsh -c qemu:///system list --all --name");
    }
}
