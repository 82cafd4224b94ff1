use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;

mod cache;
mod cancel;
mod cloudinit;
mod config;
mod disk;
mod doctor;
mod env;
mod errors;
mod genimage;
mod hostcmd;
mod libvirt;
mod probe;
mod project;
mod seed;
mod spec;
mod stack;
mod sysprobe;
mod vm;

use cancel::CancelToken;
use hostcmd::HostRunner;
use vm::Engine;

#[derive(Parser)]
#[command(name = "dockvirt", version, about = "Run container workloads in short-lived local VMs behind an in-VM reverse proxy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Per-invocation overrides; anything not given here comes from the
/// project's `.dockvirt` file and the global defaults.
#[derive(Debug, Parser)]
struct UpOpts {
    /// VM name (DNS label)
    #[clap(long)]
    name: Option<String>,

    /// Application domain the in-VM proxy serves (e.g. app.local)
    #[clap(long)]
    domain: Option<String>,

    /// Container image reference to run inside the guest
    #[clap(long)]
    image: Option<String>,

    /// Guest port the container publishes
    #[clap(long)]
    port: Option<u16>,

    /// OS image key from the catalog (e.g. ubuntu22.04)
    #[clap(long)]
    os: Option<String>,

    /// RAM for the VM in MiB
    #[clap(long)]
    mem: Option<u32>,

    /// Number of vCPUs
    #[clap(long)]
    cpus: Option<u32>,

    /// Disk size in GiB
    #[clap(long)]
    disk: Option<u32>,

    /// Network: `default` or `bridge=<ifname>`
    #[clap(long)]
    net: Option<String>,

    /// Seconds to wait for a DHCP lease
    #[clap(long, default_value_t = 120)]
    lease_timeout: u64,

    /// Seconds to wait for the HTTP endpoint
    #[clap(long, default_value_t = 180)]
    http_timeout: u64,
}

#[derive(Debug, Parser)]
struct StackOpts {
    #[command(subcommand)]
    command: StackCommands,
}

#[derive(Debug, Subcommand)]
enum StackCommands {
    /// Deploy every VM in the stack file, honoring dependency order
    Deploy { file: PathBuf },
    /// Destroy every VM in the stack file, in reverse order
    Destroy { file: PathBuf },
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the spec and bring the VM to Ready
    Up(UpOpts),
    /// Tear a VM down; absent VMs are a no-op success
    Down { name: String },
    /// Print the VM's current IPv4 address
    Ip { name: String },
    /// Deploy or destroy a declared multi-VM stack
    Stack(StackOpts),
    /// Probe the host: OS family, required tools, hypervisor contexts
    Check,
    /// Diagnose host readiness; `--apply` performs the repairs
    Heal {
        #[clap(long)]
        apply: bool,
    },
    /// Produce a bootable installer image bundling dockvirt
    GenerateImage(genimage::GenerateImageOpts),
}

fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn engine(env: env::Environment, lease_timeout: u64, http_timeout: u64) -> Engine {
    Engine::new(
        env,
        Arc::new(HostRunner),
        Arc::new(cache::HttpFetcher),
        CancelToken::for_cli(),
    )
    .with_timeouts(
        Duration::from_secs(lease_timeout),
        Duration::from_secs(http_timeout),
    )
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let environment = env::Environment::new()?;
    environment.log_invocation(&std::env::args().skip(1).collect::<Vec<_>>());

    match cli.command {
        Commands::Up(opts) => {
            let global = config::load_or_init(&environment)?;
            let cwd = std::env::current_dir()?;
            let project = match project::discover(&cwd) {
                Some(path) => Some(project::load(&path)?),
                None => None,
            };
            let overrides = spec::Overrides {
                name: opts.name,
                domain: opts.domain,
                image: opts.image,
                port: opts.port,
                os: opts.os,
                mem_mib: opts.mem,
                cpus: opts.cpus,
                disk_gib: opts.disk,
                net: opts.net,
            };
            let vm_spec = spec::resolve(&global, project.as_ref(), &overrides)?;
            let project_dir = project.as_ref().map(|p| p.dir.clone());

            let engine = engine(environment, opts.lease_timeout, opts.http_timeout);
            let outcome = engine.up(&global, &vm_spec, project_dir.as_deref())?;
            println!(
                "✅ VM {} is running: http://{} ({})",
                vm_spec.name, vm_spec.domain, outcome.ip
            );
            Ok(())
        }
        Commands::Down { name } => {
            let engine = engine(environment, 120, 180);
            engine.down(&name)?;
            println!("🗑️ VM {name} removed");
            Ok(())
        }
        Commands::Ip { name } => {
            let engine = engine(environment, 120, 180);
            let ip = engine.ip(&name)?;
            println!("{ip}");
            Ok(())
        }
        Commands::Stack(opts) => {
            let global = config::load_or_init(&environment)?;
            let engine = engine(environment, 120, 180);
            match opts.command {
                StackCommands::Deploy { file } => {
                    let decl = stack::load(&file, &global)?;
                    let report = stack::deploy(&engine, &global, &decl);
                    print!("{}", report.render());
                    if report.all_ready() {
                        Ok(())
                    } else {
                        Err(errors::Error::Internal(
                            "stack deploy finished with failed or skipped nodes".into(),
                        )
                        .into())
                    }
                }
                StackCommands::Destroy { file } => {
                    let decl = stack::load(&file, &global)?;
                    let report = stack::destroy(&engine, &decl);
                    print!("{}", report.render());
                    if report
                        .statuses
                        .iter()
                        .all(|(_, s)| *s == stack::NodeStatus::Destroyed)
                    {
                        Ok(())
                    } else {
                        Err(errors::Error::Internal(
                            "stack destroy could not remove every node".into(),
                        )
                        .into())
                    }
                }
            }
        }
        Commands::Check => {
            let runner: hostcmd::SharedRunner = Arc::new(HostRunner);
            let report = sysprobe::probe(&runner);
            print!("{}", sysprobe::render(&report));
            let missing = report.missing_required();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(errors::Error::ToolMissing {
                    tool: missing.join(", "),
                    hint: "install hints are listed above".into(),
                }
                .into())
            }
        }
        Commands::Heal { apply } => {
            let doctor = doctor::Doctor::new(environment, Arc::new(HostRunner));
            let report = if apply {
                doctor.heal()?
            } else {
                doctor.diagnose()
            };
            print!("{}", report.render());
            match report.primary_error() {
                None => Ok(()),
                Some(err) => Err(err.into()),
            }
        }
        Commands::GenerateImage(opts) => {
            genimage::run(&environment, &HostRunner, &opts)
        }
    }
}

fn main() -> ExitCode {
    install_tracing();
    if let Err(err) = color_eyre::install() {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("Error: {report:#}");
            ExitCode::from(errors::exit_code_of(&report))
        }
    }
}
