//! The VM lifecycle engine: orchestrates config, cache, seed, disk and the
//! hypervisor driver for one named VM.
//!
//! States per instance: Absent → Prepared → Defined → Running → Ready, and
//! Torn-down from anywhere. Preparation failures leave no domain and a
//! clean work directory; failures after the domain is defined roll the
//! partial domain back before surfacing. Lease/HTTP timeouts fail the
//! command but deliberately leave the domain running for inspection.
//!
//! `up_start` (through Running) and `probe_ready` are separate so the
//! stack reconciler can release dependents as soon as a dependency is
//! Running rather than Ready.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Context;
use color_eyre::Result;

use crate::cache::{self, Fetcher};
use crate::cancel::CancelToken;
use crate::cloudinit;
use crate::config::GlobalConfig;
use crate::disk;
use crate::env::Environment;
use crate::errors::Error;
use crate::hostcmd::SharedRunner;
use crate::libvirt::{domain, lease, Libvirt};
use crate::probe;
use crate::seed;
use crate::spec::{NetSpec, VmSpec};

/// Spec snapshot recorded in the work directory at definition time, used
/// to detect drift on a later `up`.
const INSTANCE_RECORD: &str = "instance.json";

#[derive(Debug, Clone, Copy)]
pub struct UpOutcome {
    pub ip: Ipv4Addr,
    pub http_ok: bool,
}

/// Result of [`Engine::up_start`]: the connection the domain lives on, and
/// whether this invocation created it (which decides rollback on cancel).
pub struct Started {
    pub lv: Libvirt,
    pub fresh: bool,
}

#[derive(Clone)]
pub struct Engine {
    pub env: Environment,
    runner: SharedRunner,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancelToken,
    lease_timeout: Duration,
    http_timeout: Duration,
}

impl Engine {
    pub fn new(
        env: Environment,
        runner: SharedRunner,
        fetcher: Arc<dyn Fetcher>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            env,
            runner,
            fetcher,
            cancel,
            lease_timeout: probe::DEFAULT_LEASE_TIMEOUT,
            http_timeout: probe::DEFAULT_HTTP_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, lease: Duration, http: Duration) -> Self {
        self.lease_timeout = lease;
        self.http_timeout = http;
        self
    }

    /// Bring the named VM to Ready.
    pub fn up(
        &self,
        global: &GlobalConfig,
        spec: &VmSpec,
        project_dir: Option<&Path>,
    ) -> Result<UpOutcome> {
        let started = self.up_start(global, spec, project_dir)?;
        match self.probe_ready(&started.lv, spec) {
            Err(err)
                if started.fresh
                    && matches!(err.downcast_ref::<Error>(), Some(Error::Cancelled)) =>
            {
                // Ctrl-C while waiting on a VM this invocation created:
                // same rollback as a post-definition failure.
                let _ = domain::destroy(&started.lv, &spec.name);
                let _ = std::fs::remove_dir_all(self.env.vm_dir(&spec.name));
                Err(err)
            }
            other => other,
        }
    }

    /// Drive the VM to Running (domain defined and started). Idempotent:
    /// an already-running domain whose recorded spec matches is left
    /// untouched; a mismatch is a `SpecConflict`, never auto-replaced.
    pub fn up_start(
        &self,
        global: &GlobalConfig,
        spec: &VmSpec,
        project_dir: Option<&Path>,
    ) -> Result<Started> {
        let lv = Libvirt::detect(self.runner.clone(), &spec.net);
        let work_dir = self.env.vm_dir(&spec.name);

        if domain::exists(&lv, &spec.name)? {
            if !domain::is_running(&lv, &spec.name)? {
                return Err(Error::DomainCreate {
                    name: spec.name.clone(),
                    message: "a domain with this name is defined but not running; run `dockvirt down` first".into(),
                }
                .into());
            }
            self.verify_recorded_spec(&work_dir, spec)?;
            tracing::info!(name = %spec.name, "domain already running; spec matches");
            return Ok(Started { lv, fresh: false });
        }

        self.cancel.check()?;
        let os_image = global.lookup(&spec.os)?;

        // Preparation: everything before the domain exists. Any failure
        // rolls the work directory back to Absent.
        let prepared = (|| -> Result<(std::path::PathBuf, std::path::PathBuf)> {
            let base_image = cache::ensure(&self.env, os_image, self.fetcher.as_ref())?;
            self.cancel.check()?;

            std::fs::create_dir_all(&work_dir)
                .wrap_err_with(|| format!("creating {}", work_dir.display()))?;

            let app = match project_dir {
                Some(dir) => cloudinit::collect_app_context(dir)?,
                None => cloudinit::AppContext::default(),
            };
            let docs = cloudinit::render(spec, &app);
            let seed_iso = seed::build_seed(self.runner.as_ref(), &work_dir, &docs)?;
            self.cancel.check()?;

            let overlay =
                disk::create_overlay(self.runner.as_ref(), &base_image, &work_dir, spec.disk_gib)?;

            let record = serde_json::to_string_pretty(spec)?;
            std::fs::write(work_dir.join(INSTANCE_RECORD), record)?;
            Ok((overlay, seed_iso))
        })();

        let (overlay, seed_iso) = match prepared {
            Ok(paths) => paths,
            Err(err) => {
                let _ = std::fs::remove_dir_all(&work_dir);
                return Err(err);
            }
        };

        if let Err(err) = domain::define_and_start(&lv, spec, os_image, &overlay, &seed_iso) {
            // The CLI may have partially defined the domain before failing.
            let _ = domain::destroy(&lv, &spec.name);
            let _ = std::fs::remove_dir_all(&work_dir);
            return Err(err);
        }

        if self.cancel.is_cancelled() {
            let _ = domain::destroy(&lv, &spec.name);
            let _ = std::fs::remove_dir_all(&work_dir);
            return Err(Error::Cancelled.into());
        }

        Ok(Started { lv, fresh: true })
    }

    /// Running → Ready: wait for the DHCP lease, then for HTTP on the
    /// guest's mapped port with the user's domain as `Host` header.
    pub fn probe_ready(&self, lv: &Libvirt, spec: &VmSpec) -> Result<UpOutcome> {
        let ip = lease::wait(lv, &spec.name, self.lease_timeout, &self.cancel)?;
        probe::wait_http(ip, spec.port, &spec.domain, self.http_timeout, &self.cancel)?;
        Ok(UpOutcome { ip, http_ok: true })
    }

    fn verify_recorded_spec(&self, work_dir: &Path, spec: &VmSpec) -> Result<()> {
        let record_path = work_dir.join(INSTANCE_RECORD);
        let recorded: VmSpec = match std::fs::read_to_string(&record_path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| Error::SpecConflict {
                name: spec.name.clone(),
                message: format!("unreadable spec record {}: {e}", record_path.display()),
            })?,
            Err(_) => {
                return Err(Error::SpecConflict {
                    name: spec.name.clone(),
                    message: format!("no spec record at {}", record_path.display()),
                }
                .into())
            }
        };
        if recorded.image != spec.image || recorded.port != spec.port {
            return Err(Error::SpecConflict {
                name: spec.name.clone(),
                message: format!(
                    "running with image={} port={}, requested image={} port={}",
                    recorded.image, recorded.port, spec.image, spec.port
                ),
            }
            .into());
        }
        Ok(())
    }

    /// Tear the named VM down: destroy + undefine the domain and delete
    /// the work directory. Safe to call repeatedly; an absent VM is
    /// success.
    pub fn down(&self, name: &str) -> Result<()> {
        let lv = Libvirt::detect(self.runner.clone(), &self.recorded_net(name));
        domain::destroy(&lv, name)?;
        let work_dir = self.env.vm_dir(name);
        if work_dir.exists() {
            std::fs::remove_dir_all(&work_dir)
                .wrap_err_with(|| format!("removing {}", work_dir.display()))?;
        }
        Ok(())
    }

    /// Current IPv4 of the named VM, without waiting.
    pub fn ip(&self, name: &str) -> Result<Ipv4Addr> {
        let lv = Libvirt::detect(self.runner.clone(), &self.recorded_net(name));
        lease::query(&lv, name)?.ok_or_else(|| {
            Error::LeaseTimeout {
                name: name.to_string(),
                secs: 0,
            }
            .into()
        })
    }

    /// The network the instance was defined with, for picking the right
    /// connection context on `down`/`ip`.
    fn recorded_net(&self, name: &str) -> NetSpec {
        let record_path = self.env.vm_dir(name).join(INSTANCE_RECORD);
        std::fs::read_to_string(record_path)
            .ok()
            .and_then(|text| serde_json::from_str::<VmSpec>(&text).ok())
            .map(|spec| spec.net)
            .unwrap_or(NetSpec::Default)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{http_server, FakeHost};
    use super::*;
    use crate::cache::testing::StubFetcher;
    use crate::config::GlobalConfig;
    use std::sync::atomic::Ordering;

    fn demo_spec(port: u16) -> VmSpec {
        VmSpec {
            name: "demo".into(),
            domain: "demo.local".into(),
            image: "nginx:latest".into(),
            port,
            os: "ubuntu22.04".into(),
            mem_mib: 4096,
            cpus: 2,
            disk_gib: 20,
            net: NetSpec::Default,
        }
    }

    fn engine(dir: &tempfile::TempDir, runner: crate::hostcmd::SharedRunner) -> Engine {
        Engine::new(
            Environment::at(dir.path()),
            runner,
            Arc::new(StubFetcher::new()),
            CancelToken::new(),
        )
        .with_timeouts(Duration::from_secs(5), Duration::from_secs(5))
    }

    #[test]
    fn up_reaches_ready_and_populates_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let port = http_server();
        let host = FakeHost::new("127.0.0.1");
        let eng = engine(&dir, host.runner());

        let outcome = eng
            .up(&GlobalConfig::default_catalog(), &demo_spec(port), None)
            .unwrap();
        assert_eq!(outcome.ip, Ipv4Addr::LOCALHOST);
        assert!(outcome.http_ok);

        let work = eng.env.vm_dir("demo");
        assert!(work.join("disk.qcow2").exists());
        assert!(work.join("seed.iso").exists());
        assert!(work.join("user-data").exists());
        assert!(work.join(INSTANCE_RECORD).exists());
        assert!(host.is_defined("demo"));
    }

    #[test]
    fn up_twice_skips_preparation_and_reprobes() {
        let dir = tempfile::tempdir().unwrap();
        let port = http_server();
        let host = FakeHost::new("127.0.0.1");
        let eng = engine(&dir, host.runner());
        let global = GlobalConfig::default_catalog();
        let spec = demo_spec(port);

        eng.up(&global, &spec, None).unwrap();

        let runner2 = host.runner();
        let eng2 = engine(&dir, runner2.clone());
        eng2.up(&global, &spec, None).unwrap();
        let lines = runner2.call_lines();
        assert!(
            !lines.iter().any(|l| l.starts_with("virt-install")),
            "second up must not redefine"
        );
        assert!(!lines.iter().any(|l| l.starts_with("qemu-img")));
        assert!(lines.iter().any(|l| l.contains("net-dhcp-leases")));
    }

    #[test]
    fn up_with_changed_spec_is_spec_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let port = http_server();
        let host = FakeHost::new("127.0.0.1");
        let eng = engine(&dir, host.runner());
        let global = GlobalConfig::default_catalog();
        eng.up(&global, &demo_spec(port), None).unwrap();

        let mut changed = demo_spec(port);
        changed.image = "httpd:latest".into();
        let err = engine(&dir, host.runner())
            .up(&global, &changed, None)
            .unwrap_err();
        assert_eq!(crate::errors::exit_code_of(&err), 4);
        assert!(err.to_string().contains("httpd:latest"));
    }

    #[test]
    fn preparation_failure_leaves_no_domain_and_no_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new("127.0.0.1");
        let runner = host.runner();
        let eng = Engine::new(
            Environment::at(dir.path()),
            runner.clone(),
            Arc::new(StubFetcher::failing()),
            CancelToken::new(),
        );

        let err = eng
            .up(&GlobalConfig::default_catalog(), &demo_spec(80), None)
            .unwrap_err();
        assert_eq!(crate::errors::exit_code_of(&err), 1);
        assert!(!eng.env.vm_dir("demo").exists());
        assert!(!host.is_defined("demo"));
        assert!(!runner
            .call_lines()
            .iter()
            .any(|l| l.starts_with("virt-install")));
    }

    #[test]
    fn post_define_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new("127.0.0.1");
        host.fail_virt_install.store(true, Ordering::SeqCst);
        let eng = engine(&dir, host.runner());

        let err = eng
            .up(&GlobalConfig::default_catalog(), &demo_spec(80), None)
            .unwrap_err();
        assert_eq!(crate::errors::exit_code_of(&err), 4);
        assert!(!eng.env.vm_dir("demo").exists());
        assert!(!host.is_defined("demo"));
    }

    #[test]
    fn cancellation_after_define_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new("127.0.0.1");
        let cancel = CancelToken::new();
        // Cancellation lands while virt-install runs, so the engine sees it
        // right after the domain started and must roll back.
        let runner = {
            let host = host.clone();
            let cancel = cancel.clone();
            Arc::new(crate::hostcmd::testing::StubRunner::new(move |argv| {
                if argv[0] == "virt-install" {
                    cancel.cancel();
                }
                host.handle(argv)
            }))
        };
        let eng = Engine::new(
            Environment::at(dir.path()),
            runner,
            Arc::new(StubFetcher::new()),
            cancel,
        );

        let err = eng
            .up(&GlobalConfig::default_catalog(), &demo_spec(80), None)
            .unwrap_err();
        assert_eq!(crate::errors::exit_code_of(&err), 6);
        assert!(!eng.env.vm_dir("demo").exists());
        assert!(!host.is_defined("demo"), "partial domain must be destroyed");
    }

    #[test]
    fn lease_timeout_keeps_domain_running() {
        let dir = tempfile::tempdir().unwrap();
        // Lease table rows never parse as an address.
        let host = FakeHost::new("unparseable");
        let eng = Engine::new(
            Environment::at(dir.path()),
            host.runner(),
            Arc::new(StubFetcher::new()),
            CancelToken::new(),
        )
        .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));

        let err = eng
            .up(&GlobalConfig::default_catalog(), &demo_spec(80), None)
            .unwrap_err();
        assert_eq!(crate::errors::exit_code_of(&err), 5);
        assert!(host.is_defined("demo"), "no rollback on timeout");
        assert!(eng.env.vm_dir("demo").exists());
    }

    #[test]
    fn down_is_idempotent_and_removes_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let port = http_server();
        let host = FakeHost::new("127.0.0.1");
        let eng = engine(&dir, host.runner());
        let global = GlobalConfig::default_catalog();
        eng.up(&global, &demo_spec(port), None).unwrap();
        assert!(eng.env.vm_dir("demo").exists());

        eng.down("demo").unwrap();
        assert!(!eng.env.vm_dir("demo").exists());
        assert!(!host.is_defined("demo"));

        // Second down: absent VM is a no-op success.
        eng.down("demo").unwrap();
    }

    #[test]
    fn cache_is_reused_across_up_down_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let port = http_server();
        let host = FakeHost::new("127.0.0.1");
        let fetcher = Arc::new(StubFetcher::new());
        let eng = Engine::new(
            Environment::at(dir.path()),
            host.runner(),
            fetcher.clone(),
            CancelToken::new(),
        )
        .with_timeouts(Duration::from_secs(5), Duration::from_secs(5));
        let global = GlobalConfig::default_catalog();

        eng.up(&global, &demo_spec(port), None).unwrap();
        eng.down("demo").unwrap();
        eng.up(&global, &demo_spec(port), None).unwrap();
        assert_eq!(fetcher.count(), 1, "image must be fetched exactly once");
    }

    #[test]
    fn ip_reports_current_lease_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new("192.168.122.77");
        let eng = engine(&dir, host.runner());
        host.domains.lock().unwrap().insert("demo".into(), true);
        assert_eq!(eng.ip("demo").unwrap(), Ipv4Addr::new(192, 168, 122, 77));
    }

    #[test]
    fn ip_of_unleased_vm_fails() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new("192.168.122.77");
        let eng = engine(&dir, host.runner());
        let err = eng.ip("demo").unwrap_err();
        assert_eq!(crate::errors::exit_code_of(&err), 5);
    }
}
