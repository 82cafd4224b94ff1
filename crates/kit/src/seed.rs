//! Seed ISO assembly: write the rendered cloud-init documents into the
//! per-VM work directory and bundle them with `cloud-localds`, which
//! produces a NoCloud ISO with the `cidata` volume label the guest's init
//! system requires.

use std::path::{Path, PathBuf};

use color_eyre::eyre::Context;
use color_eyre::Result;

use crate::cloudinit::SeedDocs;
use crate::hostcmd::{argv, run_ok, Runner};

pub const SEED_ISO: &str = "seed.iso";

/// Write `user-data`, `meta-data` and `network-config` into `work_dir` and
/// build `seed.iso` from them. The documents stay on disk next to the ISO
/// for inspection.
pub fn build_seed(runner: &dyn Runner, work_dir: &Path, docs: &SeedDocs) -> Result<PathBuf> {
    let user_data = work_dir.join("user-data");
    let meta_data = work_dir.join("meta-data");
    let network_config = work_dir.join("network-config");
    for (path, content) in [
        (&user_data, &docs.user_data),
        (&meta_data, &docs.meta_data),
        (&network_config, &docs.network_config),
    ] {
        std::fs::write(path, content)
            .wrap_err_with(|| format!("writing {}", path.display()))?;
    }

    let seed = work_dir.join(SEED_ISO);
    run_ok(
        runner,
        &argv(
            "cloud-localds",
            [
                "-N".to_string(),
                network_config.display().to_string(),
                seed.display().to_string(),
                user_data.display().to_string(),
                meta_data.display().to_string(),
            ],
        ),
    )
    .wrap_err("building cloud-init seed ISO")?;
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostcmd::testing::StubRunner;

    fn docs() -> SeedDocs {
        SeedDocs {
            user_data: "#cloud-config\nruncmd: []\n".into(),
            meta_data: "instance-id: demo\n".into(),
            network_config: "version: 2\n".into(),
        }
    }

    #[test]
    fn writes_documents_and_invokes_cloud_localds() {
        let dir = tempfile::tempdir().unwrap();
        let runner = StubRunner::always_ok();

        let seed = build_seed(&runner, dir.path(), &docs()).unwrap();
        assert_eq!(seed, dir.path().join(SEED_ISO));

        for name in ["user-data", "meta-data", "network-config"] {
            assert!(dir.path().join(name).exists(), "{name} must be rendered");
        }

        let calls = runner.call_lines();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("cloud-localds -N "));
        assert!(calls[0].contains("seed.iso"));
    }

    #[test]
    fn seed_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = StubRunner::new(|_| {
            crate::hostcmd::CmdOutput::failed(1, "iso write failed")
        });
        let err = build_seed(&runner, dir.path(), &docs()).unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("iso write failed"));
    }
}
