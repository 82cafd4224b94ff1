//! Child-process execution seam.
//!
//! Everything that shells out (virsh, virt-install, qemu-img, cloud-localds,
//! xorriso, sudo) goes through [`Runner`] so tests can substitute a stub and
//! assert on the exact argv without a hypervisor on the machine.

use std::process::Command;
use std::sync::Arc;

use color_eyre::eyre::eyre;
use color_eyre::Result;

use crate::errors::Error;

/// Captured result of one child process.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    #[allow(dead_code)]
    pub fn ok(status: i32, stdout: &str) -> Self {
        Self {
            status,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[allow(dead_code)]
    pub fn failed(status: i32, stderr: &str) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Run an argv, get exit status plus captured stdout/stderr.
pub trait Runner: Send + Sync {
    fn run(&self, argv: &[String]) -> Result<CmdOutput>;
}

pub type SharedRunner = Arc<dyn Runner>;

/// Production runner: spawns the argv directly on the host.
#[derive(Debug, Default)]
pub struct HostRunner;

impl Runner for HostRunner {
    fn run(&self, argv: &[String]) -> Result<CmdOutput> {
        let (exe, args) = argv
            .split_first()
            .ok_or_else(|| eyre!("empty command line"))?;
        tracing::debug!(cmd = %argv.join(" "), "exec");
        let output = Command::new(exe).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                color_eyre::Report::from(Error::ToolMissing {
                    tool: exe.clone(),
                    hint: "run `dockvirt check` for per-distro install hints".into(),
                })
            } else {
                color_eyre::Report::from(e).wrap_err(format!("spawning {exe}"))
            }
        })?;
        Ok(CmdOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Convenience: run and require success, surfacing stderr on failure.
pub fn run_ok(runner: &dyn Runner, argv: &[String]) -> Result<CmdOutput> {
    let out = runner.run(argv)?;
    if !out.success() {
        return Err(eyre!(
            "`{}` failed ({}): {}",
            argv.join(" "),
            out.status,
            out.stderr.trim()
        ));
    }
    Ok(out)
}

/// Build an argv from a program name and string-ish arguments.
pub fn argv<I, S>(program: &str, args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    std::iter::once(program.to_string())
        .chain(args.into_iter().map(Into::into))
        .collect()
}
