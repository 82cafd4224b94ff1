//! Cloud-init document rendering.
//!
//! Templates are pure functions from the frozen spec (plus the collected
//! project context) to strings; no template engine, no filesystem access
//! during rendering. The rendered `user-data` encodes the guest contract:
//! install Docker if absent, build or pull the user's container image,
//! start it publishing the declared port, and front it with Caddy on
//! 80/443 with locally issued certificates.

use std::path::Path;

use color_eyre::eyre::Context;
use color_eyre::Result;
use yaml_rust2::{yaml, Yaml, YamlEmitter};

use crate::spec::VmSpec;

/// Guest-side directory the compose project is written to.
const GUEST_APP_DIR: &str = "/opt/dockvirt";

/// Project files shipped into the guest as the build context, when no
/// Dockerfile names its own context.
const WELL_KNOWN_FILES: &[&str] = &[
    "index.html",
    "index.php",
    "app.py",
    "server.js",
    "main.py",
    "requirements.txt",
    "package.json",
    "composer.json",
    "nginx.conf",
    "apache.conf",
    "default.conf",
];

const WELL_KNOWN_DIRS: &[&str] = &["static", "templates", "public", "www", "html"];

/// Skip anything larger than this when copying project files into the seed;
/// big blobs belong in a registry, not in cloud-init.
const MAX_APP_FILE_BYTES: u64 = 256 * 1024;

/// The three documents cloud-init reads from the seed ISO.
#[derive(Debug, Clone)]
pub struct SeedDocs {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

/// Files collected from the project directory for an in-VM `docker build`.
#[derive(Debug, Clone, Default)]
pub struct AppContext {
    pub dockerfile: Option<String>,
    /// Relative path → UTF-8 content.
    pub files: Vec<(String, String)>,
}

impl AppContext {
    pub fn has_build_context(&self) -> bool {
        self.dockerfile.is_some()
    }
}

/// Scan the project directory for a Dockerfile and well-known app files.
pub fn collect_app_context(project_dir: &Path) -> Result<AppContext> {
    let mut ctx = AppContext::default();

    let dockerfile = project_dir.join("Dockerfile");
    if dockerfile.is_file() {
        ctx.dockerfile = Some(
            std::fs::read_to_string(&dockerfile)
                .wrap_err_with(|| format!("reading {}", dockerfile.display()))?,
        );
    }

    for name in WELL_KNOWN_FILES {
        push_file(&mut ctx.files, project_dir, Path::new(name));
    }
    for dir in WELL_KNOWN_DIRS {
        let root = project_dir.join(dir);
        if !root.is_dir() {
            continue;
        }
        collect_dir(&mut ctx.files, project_dir, &root);
    }
    Ok(ctx)
}

fn collect_dir(files: &mut Vec<(String, String)>, base: &Path, dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_dir(files, base, &path);
        } else if let Ok(rel) = path.strip_prefix(base) {
            push_file(files, base, rel);
        }
    }
}

fn push_file(files: &mut Vec<(String, String)>, base: &Path, rel: &Path) {
    let path = base.join(rel);
    let Ok(meta) = path.metadata() else {
        return;
    };
    if !meta.is_file() || meta.len() > MAX_APP_FILE_BYTES {
        return;
    }
    // Binary assets are skipped; the guest pulls those through the image
    // registry instead.
    let Ok(content) = std::fs::read_to_string(&path) else {
        return;
    };
    files.push((rel.to_string_lossy().into_owned(), content));
}

/// Render all three seed documents.
pub fn render(spec: &VmSpec, app: &AppContext) -> SeedDocs {
    SeedDocs {
        user_data: user_data(spec, app),
        meta_data: meta_data(spec),
        network_config: NETWORK_CONFIG.to_string(),
    }
}

pub fn meta_data(spec: &VmSpec) -> String {
    format!(
        "instance-id: {name}\nlocal-hostname: {name}\n",
        name = spec.name
    )
}

/// Network config v2 for the NoCloud datasource: DHCP on every ethernet
/// device. The file is the config directly, without an outer `network:`
/// wrapper.
pub const NETWORK_CONFIG: &str = "\
version: 2
ethernets:
  id0:
    match:
      name: \"en*\"
    dhcp4: true
  id1:
    match:
      name: \"eth*\"
    dhcp4: true
";

pub fn caddyfile(spec: &VmSpec) -> String {
    format!(
        "{{\n\
         \tlocal_certs\n\
         }}\n\
         \n\
         {domain} {{\n\
         \treverse_proxy app:{port}\n\
         }}\n",
        domain = spec.domain,
        port = spec.port
    )
}

pub fn docker_compose(spec: &VmSpec, build: bool) -> String {
    let app_source = if build {
        format!(
            "    build: ./app\n    image: {name}:dockvirt\n",
            name = spec.name
        )
    } else {
        format!("    image: {image}\n", image = spec.image)
    };
    format!(
        "services:\n\
         \x20 app:\n\
         {app_source}\
         \x20   restart: unless-stopped\n\
         \x20   expose:\n\
         \x20     - \"{port}\"\n\
         \x20 caddy:\n\
         \x20   image: caddy:2\n\
         \x20   restart: unless-stopped\n\
         \x20   ports:\n\
         \x20     - \"80:80\"\n\
         \x20     - \"443:443\"\n\
         \x20   volumes:\n\
         \x20     - ./Caddyfile:/etc/caddy/Caddyfile:ro\n\
         \x20     - caddy-data:/data\n\
         volumes:\n\
         \x20 caddy-data:\n",
        port = spec.port
    )
}

fn write_file_entry(path: String, permissions: &str, content: String) -> Yaml {
    let mut entry = yaml::Hash::new();
    entry.insert(Yaml::String("path".into()), Yaml::String(path));
    entry.insert(
        Yaml::String("permissions".into()),
        Yaml::String(permissions.into()),
    );
    entry.insert(Yaml::String("content".into()), Yaml::String(content));
    Yaml::Hash(entry)
}

fn user_data(spec: &VmSpec, app: &AppContext) -> String {
    let build = app.has_build_context();
    let mut root = yaml::Hash::new();
    root.insert(Yaml::String("package_update".into()), Yaml::Boolean(true));

    let mut write_files = yaml::Array::new();
    write_files.push(write_file_entry(
        format!("{GUEST_APP_DIR}/Caddyfile"),
        "0644",
        caddyfile(spec),
    ));
    write_files.push(write_file_entry(
        format!("{GUEST_APP_DIR}/docker-compose.yml"),
        "0644",
        docker_compose(spec, build),
    ));
    if let Some(dockerfile) = &app.dockerfile {
        write_files.push(write_file_entry(
            format!("{GUEST_APP_DIR}/app/Dockerfile"),
            "0644",
            dockerfile.clone(),
        ));
    }
    for (rel, content) in &app.files {
        write_files.push(write_file_entry(
            format!("{GUEST_APP_DIR}/app/{rel}"),
            "0644",
            content.clone(),
        ));
    }
    root.insert(Yaml::String("write_files".into()), Yaml::Array(write_files));

    let mut runcmd = yaml::Array::new();
    // Docker's convenience script is a no-op detector-wise; guard anyway so
    // images that preinstall Docker boot faster.
    runcmd.push(Yaml::String(
        "command -v docker >/dev/null 2>&1 || curl -fsSL https://get.docker.com | sh".into(),
    ));
    runcmd.push(Yaml::String("systemctl enable --now docker".into()));
    if build {
        runcmd.push(Yaml::String(format!(
            "cd {GUEST_APP_DIR} && docker compose build"
        )));
    } else {
        runcmd.push(Yaml::String(format!("docker pull {}", spec.image)));
    }
    runcmd.push(Yaml::String(format!(
        "cd {GUEST_APP_DIR} && docker compose up -d"
    )));
    root.insert(Yaml::String("runcmd".into()), Yaml::Array(runcmd));

    let mut out = String::new();
    let mut emitter = YamlEmitter::new(&mut out);
    emitter.dump(&Yaml::Hash(root)).expect("yaml emit");
    // cloud-init wants `#cloud-config` on the first line; drop the emitter's
    // document separator rather than stacking the two.
    let out = out.strip_prefix("---\n").unwrap_or(&out);
    format!("#cloud-config\n{out}")
}
