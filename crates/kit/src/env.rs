//! The per-user base directory, modeled as an explicit value threaded
//! through components rather than ambient globals. Tests point it at a
//! temp directory via `DOCKVIRT_HOME`.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use color_eyre::eyre::eyre;
use color_eyre::Result;

/// Environment variable overriding the base directory (primarily for tests).
pub const HOME_OVERRIDE_VAR: &str = "DOCKVIRT_HOME";

/// Handle to the per-user base directory (`~/.dockvirt` by default).
#[derive(Debug, Clone)]
pub struct Environment {
    base_dir: PathBuf,
}

impl Environment {
    pub fn new() -> Result<Self> {
        if let Ok(dir) = std::env::var(HOME_OVERRIDE_VAR) {
            return Ok(Self {
                base_dir: PathBuf::from(dir),
            });
        }
        let home = std::env::var_os("HOME").ok_or_else(|| eyre!("HOME is not set"))?;
        Ok(Self {
            base_dir: PathBuf::from(home).join(".dockvirt"),
        })
    }

    /// Build directly from a path; used by tests and the doctor when acting
    /// on behalf of another user.
    #[allow(dead_code)]
    pub fn at(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join("config.yaml")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.base_dir.join("images")
    }

    /// Per-VM working directory holding the overlay disk, seed ISO and
    /// rendered cloud-init documents.
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    pub fn cli_log_path(&self) -> PathBuf {
        self.base_dir.join("cli.log")
    }

    /// Append one line per invocation to `cli.log`. Failures are swallowed;
    /// logging must never break a command.
    pub fn log_invocation(&self, args: &[String]) {
        if std::fs::create_dir_all(&self.base_dir).is_err() {
            return;
        }
        let Ok(mut f) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.cli_log_path())
        else {
            return;
        };
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let _ = writeln!(f, "{now} dockvirt {}", args.join(" "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_base_dir() {
        let env = Environment::at("/tmp/dv-test");
        assert_eq!(env.config_path(), PathBuf::from("/tmp/dv-test/config.yaml"));
        assert_eq!(env.images_dir(), PathBuf::from("/tmp/dv-test/images"));
        assert_eq!(env.vm_dir("demo"), PathBuf::from("/tmp/dv-test/demo"));
    }

    #[test]
    fn invocation_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::at(dir.path());
        env.log_invocation(&["up".into()]);
        env.log_invocation(&["down".into(), "demo".into()]);
        let log = std::fs::read_to_string(env.cli_log_path()).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("dockvirt up"));
        assert!(lines[1].contains("dockvirt down demo"));
    }
}
