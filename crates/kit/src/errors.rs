//! Error taxonomy shared by every component.
//!
//! Functions return `color_eyre::Result`; errors that the CLI contract
//! assigns an exit code to are raised as [`Error`] values, which convert
//! into an `eyre::Report` through `?`. `main` downcasts the report back to
//! recover the exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("unknown operating system '{os}'; known keys: {known}. Add it to config.yaml or run `dockvirt heal`")]
    UnknownOs { os: String, known: String },

    #[error("required tool '{tool}' not found on PATH. {hint}")]
    ToolMissing { tool: String, hint: String },

    #[error("libvirt network '{network}' is not active; run `dockvirt heal --apply`")]
    NetworkInactive { network: String },

    #[error("libvirt storage pool '{pool}' is not active; run `dockvirt heal --apply`")]
    PoolInactive { pool: String },

    #[error("{path}: {message}; run `dockvirt heal --apply` to fix ACL/SELinux access for the hypervisor service account")]
    PermissionDenied { path: String, message: String },

    #[error("failed to fetch image from {url}: {message}")]
    ImageFetch { url: String, message: String },

    #[error("failed to create overlay disk {path}: {message}")]
    DiskCreate { path: String, message: String },

    #[error("cannot create domain '{name}': {message}")]
    DomainCreate { name: String, message: String },

    #[error("domain '{name}' is already running with a different spec ({message}); run `dockvirt down {name}` first")]
    SpecConflict { name: String, message: String },

    #[error("no DHCP lease for '{name}' after {secs}s; the domain is still running — inspect with `virsh console {name}` or retry")]
    LeaseTimeout { name: String, secs: u64 },

    #[error("no HTTP response from {url} after {secs}s; the domain is still running — the guest may still be provisioning")]
    HttpTimeout { url: String, secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Exit code per the CLI contract.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::ConfigInvalid { .. } | Error::UnknownOs { .. } => 2,
            Error::ToolMissing { .. }
            | Error::NetworkInactive { .. }
            | Error::PoolInactive { .. }
            | Error::PermissionDenied { .. } => 3,
            Error::DomainCreate { .. } | Error::SpecConflict { .. } => 4,
            Error::LeaseTimeout { .. } | Error::HttpTimeout { .. } => 5,
            Error::Cancelled => 6,
            Error::ImageFetch { .. } | Error::DiskCreate { .. } | Error::Internal(_) => 1,
        }
    }

    /// Short kind tag used in stack status maps and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigInvalid { .. } => "ConfigInvalid",
            Error::UnknownOs { .. } => "UnknownOS",
            Error::ToolMissing { .. } => "ToolMissing",
            Error::NetworkInactive { .. } => "NetworkInactive",
            Error::PoolInactive { .. } => "PoolInactive",
            Error::PermissionDenied { .. } => "PermissionDenied",
            Error::ImageFetch { .. } => "ImageFetch",
            Error::DiskCreate { .. } => "DiskCreate",
            Error::DomainCreate { .. } => "DomainCreate",
            Error::SpecConflict { .. } => "SpecConflict",
            Error::LeaseTimeout { .. } => "LeaseTimeout",
            Error::HttpTimeout { .. } => "HTTPTimeout",
            Error::Cancelled => "Cancelled",
            Error::Internal(_) => "Internal",
        }
    }
}

/// Map an `eyre::Report` back to the exit code of the typed error it wraps,
/// or 1 for reports that never carried a kind.
pub fn exit_code_of(report: &color_eyre::Report) -> u8 {
    report
        .downcast_ref::<Error>()
        .map(Error::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        let cases: Vec<(Error, u8)> = vec![
            (
                Error::ConfigInvalid {
                    message: "mem".into(),
                },
                2,
            ),
            (
                Error::UnknownOs {
                    os: "alpine99".into(),
                    known: "ubuntu22.04".into(),
                },
                2,
            ),
            (
                Error::ToolMissing {
                    tool: "virsh".into(),
                    hint: String::new(),
                },
                3,
            ),
            (
                Error::DomainCreate {
                    name: "demo".into(),
                    message: "exists".into(),
                },
                4,
            ),
            (
                Error::LeaseTimeout {
                    name: "demo".into(),
                    secs: 120,
                },
                5,
            ),
            (Error::Cancelled, 6),
            (Error::Internal("boom".into()), 1),
        ];
        for (err, code) in cases {
            assert_eq!(err.exit_code(), code, "{}", err.kind());
        }
    }

    #[test]
    fn report_downcast_recovers_exit_code() {
        let report: color_eyre::Report = Error::UnknownOs {
            os: "alpine99".into(),
            known: "ubuntu22.04, fedora38".into(),
        }
        .into();
        assert_eq!(exit_code_of(&report), 2);

        let plain = color_eyre::eyre::eyre!("some internal failure");
        assert_eq!(exit_code_of(&plain), 1);
    }

    #[test]
    fn messages_name_the_offending_value() {
        let err = Error::UnknownOs {
            os: "alpine99".into(),
            known: "ubuntu22.04".into(),
        };
        assert!(err.to_string().contains("alpine99"));

        let err = Error::ImageFetch {
            url: "https://example.invalid/img.qcow2".into(),
            message: "connection refused".into(),
        };
        assert!(err.to_string().contains("example.invalid"));
    }
}
