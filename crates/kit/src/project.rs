//! Per-project configuration: a hidden `.dockvirt` file of `key=value`
//! lines, discovered by walking from the working directory toward the
//! filesystem root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use color_eyre::eyre::Context;
use color_eyre::Result;

pub const PROJECT_FILE: &str = ".dockvirt";

/// Parsed project file. Unknown keys are kept so collaborators can layer
/// their own settings on the same file; the core only reads the keys the
/// spec resolver asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectConfig {
    pub values: BTreeMap<String, String>,
    /// Directory the file was found in; the seed builder copies the
    /// Dockerfile/app context from here.
    pub dir: PathBuf,
}

impl ProjectConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Walk upward from `start` until a project file is found or the root is
/// reached.
pub fn discover(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(d) = dir {
        let candidate = d.join(PROJECT_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = d.parent();
    }
    None
}

pub fn load(path: &Path) -> Result<ProjectConfig> {
    let text =
        std::fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    let mut config = parse(&text);
    config.dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(config)
}

/// `key=value` per line; `#` comments and blank lines ignored; duplicate
/// keys last-wins.
pub fn parse(text: &str) -> ProjectConfig {
    let mut values = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        values.insert(key.trim().to_string(), value.trim().to_string());
    }
    ProjectConfig {
        values,
        dir: PathBuf::new(),
    }
}
