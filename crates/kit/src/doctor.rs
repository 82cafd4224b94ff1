//! Host diagnosis and self-heal.
//!
//! Each check is independent and idempotent and yields a [`Finding`];
//! findings are data, never errors. Repairs are opt-in (`heal --apply`),
//! deterministic, and guarded by their checks, so applying them twice is a
//! no-op. Nothing here runs elevated by itself: repairs that need root are
//! wrapped in an announced `sudo -n` invocation.

use std::fmt;

use color_eyre::Result;

use crate::cloudinit;
use crate::config;
use crate::env::Environment;
use crate::errors::Error;
use crate::hostcmd::SharedRunner;
use crate::libvirt::{self, network, pool, Connection, Libvirt};
use crate::spec::{NetSpec, VmSpec};
use crate::sysprobe::{self, OsFamily};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// How a failed check can be repaired.
#[derive(Debug, Clone)]
pub enum FixAction {
    /// Run these argvs in order; `needs_root` wraps each in `sudo -n`.
    Commands {
        argvs: Vec<Vec<String>>,
        needs_root: bool,
    },
    /// Rewrite the image catalog: unify `os_images` under `images` and
    /// persist with the current schema.
    RewriteCatalog,
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub id: &'static str,
    pub severity: Severity,
    pub ok: bool,
    pub message: String,
    pub fix: Option<FixAction>,
}

impl Finding {
    fn ok(id: &'static str, message: impl Into<String>) -> Self {
        Finding {
            id,
            severity: Severity::Info,
            ok: true,
            message: message.into(),
            fix: None,
        }
    }

    fn bad(
        id: &'static str,
        severity: Severity,
        message: impl Into<String>,
        fix: Option<FixAction>,
    ) -> Self {
        Finding {
            id,
            severity,
            ok: false,
            message: message.into(),
            fix,
        }
    }

    #[allow(dead_code)]
    pub fn fixable(&self) -> bool {
        self.fix.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DoctorReport {
    pub findings: Vec<Finding>,
}

impl DoctorReport {
    pub fn healthy(&self) -> bool {
        !self
            .findings
            .iter()
            .any(|f| !f.ok && f.severity == Severity::Error)
    }

    #[allow(dead_code)]
    pub fn finding(&self, id: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.id == id)
    }

    /// The typed error the CLI should exit with when the host is still
    /// unhealthy after diagnosis (or repair).
    pub fn primary_error(&self) -> Option<Error> {
        let first = self
            .findings
            .iter()
            .find(|f| !f.ok && f.severity == Severity::Error)?;
        Some(match first.id {
            "tools" => Error::ToolMissing {
                tool: first.message.clone(),
                hint: "run `dockvirt check` for install hints".into(),
            },
            "network" => Error::NetworkInactive {
                network: network::DEFAULT_NETWORK.into(),
            },
            "pool" => Error::PoolInactive {
                pool: pool::DEFAULT_POOL.into(),
            },
            "acl" => Error::PermissionDenied {
                path: first.message.clone(),
                message: "hypervisor service account cannot traverse the base directory".into(),
            },
            _ => Error::Internal(first.message.clone()),
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for f in &self.findings {
            let mark = if f.ok { "ok " } else { "FAIL" };
            out.push_str(&format!("[{mark}] {:<10} {:<10} {}\n", f.id, f.severity, f.message));
            if !f.ok {
                match &f.fix {
                    Some(FixAction::Commands { argvs, needs_root }) => {
                        for argv in argvs {
                            let prefix = if *needs_root { "sudo " } else { "" };
                            out.push_str(&format!("       fix: {prefix}{}\n", argv.join(" ")));
                        }
                    }
                    Some(FixAction::RewriteCatalog) => {
                        out.push_str("       fix: normalize config.yaml (heal --apply)\n");
                    }
                    None => {}
                }
            }
        }
        out
    }
}

/// The doctor itself: pure diagnosis over the runner seam.
pub struct Doctor {
    env: Environment,
    runner: SharedRunner,
    family: OsFamily,
}

impl Doctor {
    pub fn new(env: Environment, runner: SharedRunner) -> Self {
        let family = OsFamily::detect();
        Self {
            env,
            runner,
            family,
        }
    }

    fn libvirt(&self) -> Libvirt {
        let connection = if libvirt::reachable(&self.runner, Connection::System) {
            Connection::System
        } else {
            Connection::Session
        };
        Libvirt::new(self.runner.clone(), connection)
    }

    pub fn diagnose(&self) -> DoctorReport {
        let lv = self.libvirt();
        let findings = vec![
            self.check_tools(),
            self.check_libvirtd(),
            self.check_docker_daemon(),
            self.check_network(&lv),
            self.check_pool(&lv),
            self.check_groups(),
            self.check_kvm(),
            self.check_base_dir_access(),
            self.check_catalog(),
            self.check_templates(),
            self.check_default_uri(),
        ];
        DoctorReport { findings }
    }

    /// Apply every available fix for failed checks, then re-diagnose.
    /// Announces each command before running it; root-requiring commands go
    /// through `sudo -n` and are never run silently.
    pub fn heal(&self) -> Result<DoctorReport> {
        let report = self.diagnose();
        for finding in report.findings.iter().filter(|f| !f.ok) {
            match &finding.fix {
                None => {}
                Some(FixAction::RewriteCatalog) => {
                    tracing::info!(id = finding.id, "normalizing image catalog");
                    let catalog = config::load_or_init(&self.env)?;
                    catalog.save(&self.env.config_path())?;
                }
                Some(FixAction::Commands { argvs, needs_root }) => {
                    for argv in argvs {
                        let mut full = Vec::new();
                        if *needs_root {
                            full.extend(["sudo".to_string(), "-n".to_string()]);
                        }
                        full.extend(argv.iter().cloned());
                        println!("applying fix ({}): {}", finding.id, full.join(" "));
                        let out = self.runner.run(&full)?;
                        if !out.success() {
                            tracing::warn!(
                                id = finding.id,
                                cmd = %full.join(" "),
                                stderr = %out.stderr.trim(),
                                "fix command failed"
                            );
                        }
                    }
                }
            }
        }
        Ok(self.diagnose())
    }

    fn check_tools(&self) -> Finding {
        let missing: Vec<&str> = sysprobe::REQUIRED_TOOLS
            .iter()
            .copied()
            .filter(|tool| sysprobe::which(tool).is_none())
            .collect();
        if missing.is_empty() {
            return Finding::ok("tools", "all required tools present");
        }
        let hints: Vec<String> = missing
            .iter()
            .map(|tool| format!("{tool}: {}", sysprobe::install_hint(self.family, tool)))
            .collect();
        // Deliberately not fixable: the doctor never installs packages.
        Finding::bad(
            "tools",
            Severity::Error,
            format!("missing: {} ({})", missing.join(", "), hints.join("; ")),
            None,
        )
    }

    fn check_libvirtd(&self) -> Finding {
        let active = self
            .runner
            .run(&cmd(&["systemctl", "is-active", "libvirtd"]))
            .map(|out| out.success() && out.stdout.trim() == "active")
            .unwrap_or(false);
        if active {
            Finding::ok("libvirtd", "libvirtd is active")
        } else {
            Finding::bad(
                "libvirtd",
                Severity::Warn,
                "libvirtd service is not active",
                Some(FixAction::Commands {
                    argvs: vec![vec![
                        "systemctl".into(),
                        "enable".into(),
                        "--now".into(),
                        "libvirtd".into(),
                    ]],
                    needs_root: true,
                }),
            )
        }
    }

    fn check_docker_daemon(&self) -> Finding {
        let ok = self
            .runner
            .run(&cmd(&["docker", "ps"]))
            .map(|out| out.success())
            .unwrap_or(false);
        if ok {
            Finding::ok("docker", "docker daemon reachable")
        } else {
            Finding::bad(
                "docker",
                Severity::Warn,
                "docker daemon not reachable (host-side builds unavailable; guests install their own)",
                Some(FixAction::Commands {
                    argvs: vec![vec![
                        "systemctl".into(),
                        "enable".into(),
                        "--now".into(),
                        "docker".into(),
                    ]],
                    needs_root: true,
                }),
            )
        }
    }

    fn check_network(&self, lv: &Libvirt) -> Finding {
        let status = match network::status(lv, network::DEFAULT_NETWORK) {
            Ok(s) => s,
            Err(err) => {
                return Finding::bad(
                    "network",
                    Severity::Error,
                    format!("cannot query default network: {err}"),
                    None,
                )
            }
        };
        if status.defined && status.active && status.autostart {
            return Finding::ok("network", "default network active, autostart on");
        }

        let mut argvs = Vec::new();
        let virsh = |args: &[&str]| -> Vec<String> {
            let mut v = vec![
                "virsh".to_string(),
                "-c".to_string(),
                lv.connection.uri().to_string(),
            ];
            v.extend(args.iter().map(|s| s.to_string()));
            v
        };
        if !status.defined {
            argvs.push(virsh(&["net-define", network::DEFAULT_NETWORK_XML]));
        }
        if !status.active {
            argvs.push(virsh(&["net-start", network::DEFAULT_NETWORK]));
        }
        if !status.autostart {
            argvs.push(virsh(&["net-autostart", network::DEFAULT_NETWORK]));
        }
        let state = if !status.defined {
            "missing"
        } else if !status.active {
            "defined but inactive"
        } else {
            "active but autostart off"
        };
        Finding::bad(
            "network",
            if status.active { Severity::Warn } else { Severity::Error },
            format!("default network is {state}"),
            Some(FixAction::Commands {
                argvs,
                needs_root: false,
            }),
        )
    }

    fn check_pool(&self, lv: &Libvirt) -> Finding {
        let status = match pool::status(lv, pool::DEFAULT_POOL) {
            Ok(s) => s,
            Err(err) => {
                return Finding::bad(
                    "pool",
                    Severity::Error,
                    format!("cannot query default storage pool: {err}"),
                    None,
                )
            }
        };
        if status.defined && status.active && status.autostart {
            return Finding::ok("pool", "default storage pool active, autostart on");
        }

        let virsh = |args: &[&str]| -> Vec<String> {
            let mut v = vec![
                "virsh".to_string(),
                "-c".to_string(),
                lv.connection.uri().to_string(),
            ];
            v.extend(args.iter().map(|s| s.to_string()));
            v
        };
        let mut argvs = Vec::new();
        if !status.defined {
            argvs.push(virsh(&[
                "pool-define-as",
                pool::DEFAULT_POOL,
                "dir",
                "--target",
                pool::DEFAULT_POOL_DIR,
            ]));
            argvs.push(virsh(&["pool-build", pool::DEFAULT_POOL]));
        }
        if !status.active {
            argvs.push(virsh(&["pool-start", pool::DEFAULT_POOL]));
        }
        if !status.autostart {
            argvs.push(virsh(&["pool-autostart", pool::DEFAULT_POOL]));
        }
        let state = if !status.defined {
            "missing"
        } else if !status.active {
            "defined but inactive"
        } else {
            "active but autostart off"
        };
        Finding::bad(
            "pool",
            if status.active { Severity::Warn } else { Severity::Error },
            format!("default storage pool is {state}"),
            Some(FixAction::Commands {
                argvs,
                needs_root: false,
            }),
        )
    }

    fn check_groups(&self) -> Finding {
        let out = self.runner.run(&cmd(&["id", "-nG"]));
        let groups = match out {
            Ok(out) if out.success() => out.stdout,
            _ => {
                return Finding::bad("groups", Severity::Warn, "cannot read group membership", None)
            }
        };
        let member: Vec<&str> = groups.split_whitespace().collect();
        let missing: Vec<&str> = ["libvirt", "kvm", "docker"]
            .into_iter()
            .filter(|g| !member.contains(g))
            .collect();
        if missing.is_empty() {
            return Finding::ok("groups", "member of libvirt, kvm, docker");
        }
        let user = std::env::var("USER").unwrap_or_else(|_| "$USER".into());
        let argvs = missing
            .iter()
            .map(|g| {
                vec![
                    "usermod".to_string(),
                    "-aG".to_string(),
                    g.to_string(),
                    user.clone(),
                ]
            })
            .collect();
        Finding::bad(
            "groups",
            Severity::Warn,
            format!("not a member of: {} (re-login required after the fix)", missing.join(", ")),
            Some(FixAction::Commands {
                argvs,
                needs_root: true,
            }),
        )
    }

    fn check_kvm(&self) -> Finding {
        if std::path::Path::new("/dev/kvm").exists() {
            Finding::ok("kvm", "/dev/kvm present")
        } else {
            Finding::bad(
                "kvm",
                Severity::Warn,
                "/dev/kvm missing; enable virtualization in BIOS/UEFI (guests will fall back to emulation)",
                None,
            )
        }
    }

    /// The qemu service account needs traverse on the base directory and
    /// read on images; under enforcing SELinux the files also need the
    /// svirt_image_t label.
    fn check_base_dir_access(&self) -> Finding {
        let base = self.env.base_dir();
        if !base.exists() {
            return Finding::ok("acl", "base directory not created yet");
        }
        let base_str = base.display().to_string();

        let acl_ok = self
            .runner
            .run(&cmd(&["getfacl", "-p", &base_str]))
            .map(|out| out.success() && out.stdout.contains("user:qemu"))
            .unwrap_or(false);
        if acl_ok {
            return Finding::ok("acl", "qemu ACLs present on base directory");
        }

        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".into());
        let mut argvs = vec![
            vec!["setfacl".into(), "-m".into(), "u:qemu:x".into(), home],
            vec![
                "setfacl".into(),
                "-R".into(),
                "-m".into(),
                "u:qemu:rX".into(),
                base_str.clone(),
            ],
        ];
        let enforcing = self
            .runner
            .run(&cmd(&["getenforce"]))
            .map(|out| out.success() && out.stdout.trim() == "Enforcing")
            .unwrap_or(false);
        if enforcing {
            argvs.push(vec![
                "semanage".into(),
                "fcontext".into(),
                "-a".into(),
                "-t".into(),
                "svirt_image_t".into(),
                format!("{base_str}(/.*)?"),
            ]);
            argvs.push(vec!["restorecon".into(), "-R".into(), base_str.clone()]);
        }
        Finding::bad(
            "acl",
            Severity::Warn,
            format!("{base_str}: no qemu ACL; system-context VMs may not read disks"),
            Some(FixAction::Commands {
                argvs,
                needs_root: true,
            }),
        )
    }

    fn check_catalog(&self) -> Finding {
        let path = self.env.config_path();
        if !path.exists() {
            return Finding::ok("catalog", "config.yaml will be created on first run");
        }
        if config::has_legacy_key(&self.env) {
            return Finding::bad(
                "catalog",
                Severity::Warn,
                "config.yaml still uses the legacy `os_images` key",
                Some(FixAction::RewriteCatalog),
            );
        }
        match config::load_or_init(&self.env) {
            Ok(_) => Finding::ok("catalog", "image catalog valid"),
            Err(err) => Finding::bad(
                "catalog",
                Severity::Error,
                format!("config.yaml invalid: {err}"),
                None,
            ),
        }
    }

    /// Rendering is pure, so this mostly guards against regressions that
    /// would ship an unusable seed.
    fn check_templates(&self) -> Finding {
        let probe_spec = VmSpec {
            name: "doctor-probe".into(),
            domain: "probe.local".into(),
            image: "nginx:latest".into(),
            port: 80,
            os: "ubuntu22.04".into(),
            mem_mib: 1024,
            cpus: 1,
            disk_gib: 5,
            net: NetSpec::Default,
        };
        let docs = cloudinit::render(&probe_spec, &cloudinit::AppContext::default());
        if docs.user_data.starts_with("#cloud-config")
            && !docs.meta_data.is_empty()
            && docs.network_config.starts_with("version:")
        {
            Finding::ok("templates", "cloud-init templates render")
        } else {
            Finding::bad(
                "templates",
                Severity::Error,
                "cloud-init templates produced unusable output",
                None,
            )
        }
    }

    fn check_default_uri(&self) -> Finding {
        match std::env::var("LIBVIRT_DEFAULT_URI") {
            Ok(uri) if uri == "qemu:///system" => {
                Finding::ok("uri", "LIBVIRT_DEFAULT_URI=qemu:///system")
            }
            Ok(uri) => Finding::bad(
                "uri",
                Severity::Warn,
                format!("LIBVIRT_DEFAULT_URI={uri}; qemu:///system is recommended"),
                None,
            ),
            Err(_) => Finding::bad(
                "uri",
                Severity::Warn,
                "LIBVIRT_DEFAULT_URI unset; export LIBVIRT_DEFAULT_URI=qemu:///system is recommended",
                None,
            ),
        }
    }
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
