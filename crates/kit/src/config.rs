//! Global configuration: the OS image catalog (`~/.dockvirt/config.yaml`).
//!
//! The file is YAML with a `default_os` key and an `images` mapping. Older
//! releases wrote the mapping under `os_images`; both keys are accepted on
//! read (entries under `images` win) and the file is rewritten with only
//! `images` on the next save.

use std::collections::BTreeMap;
use std::path::Path;

use color_eyre::eyre::Context;
use color_eyre::Result;
use yaml_rust2::{yaml, Yaml, YamlEmitter, YamlLoader};

use crate::env::Environment;
use crate::errors::Error;

/// One catalog entry: where to download the base image and which guest
/// variant tag virt-install should tune for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsImage {
    pub url: String,
    pub variant: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    pub default_os: String,
    pub images: BTreeMap<String, OsImage>,
}

impl GlobalConfig {
    /// Catalog written on first run: a current Ubuntu LTS and a Fedora
    /// Cloud base.
    pub fn default_catalog() -> Self {
        let mut images = BTreeMap::new();
        images.insert(
            "ubuntu22.04".to_string(),
            OsImage {
                url: "https://cloud-images.ubuntu.com/releases/22.04/release/ubuntu-22.04-server-cloudimg-amd64.img".to_string(),
                variant: "ubuntu22.04".to_string(),
            },
        );
        images.insert(
            "fedora38".to_string(),
            OsImage {
                url: "https://download.fedoraproject.org/pub/fedora/linux/releases/38/Cloud/x86_64/images/Fedora-Cloud-Base-38-1.6.x86_64.qcow2".to_string(),
                variant: "fedora38".to_string(),
            },
        );
        GlobalConfig {
            default_os: "ubuntu22.04".to_string(),
            images,
        }
    }

    pub fn lookup(&self, key: &str) -> Result<&OsImage> {
        self.images.get(key).ok_or_else(|| {
            Error::UnknownOs {
                os: key.to_string(),
                known: self.images.keys().cloned().collect::<Vec<_>>().join(", "),
            }
            .into()
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let docs = YamlLoader::load_from_str(text)
            .map_err(|e| Error::ConfigInvalid {
                message: format!("config.yaml is not valid YAML: {e}"),
            })?;
        let doc = docs.first().ok_or_else(|| Error::ConfigInvalid {
            message: "config.yaml is empty".to_string(),
        })?;

        let mut images = BTreeMap::new();
        // Legacy alias first so that current-key entries overwrite it.
        for root in ["os_images", "images"] {
            if let Some(hash) = doc[root].as_hash() {
                for (k, v) in hash {
                    let key = k
                        .as_str()
                        .ok_or_else(|| Error::ConfigInvalid {
                            message: format!("non-string image key under `{root}`"),
                        })?
                        .to_string();
                    images.insert(key, parse_image(root, v)?);
                }
            }
        }
        if images.is_empty() {
            return Err(Error::ConfigInvalid {
                message: "config.yaml declares no images".to_string(),
            }
            .into());
        }

        let default_os = doc["default_os"]
            .as_str()
            .ok_or_else(|| Error::ConfigInvalid {
                message: "config.yaml is missing `default_os`".to_string(),
            })?
            .to_string();
        if !images.contains_key(&default_os) {
            return Err(Error::ConfigInvalid {
                message: format!("default_os '{default_os}' is not a key of `images`"),
            }
            .into());
        }

        Ok(GlobalConfig { default_os, images })
    }

    /// Serialize with only the current `images` key.
    pub fn to_yaml(&self) -> String {
        let mut root = yaml::Hash::new();
        root.insert(
            Yaml::String("default_os".into()),
            Yaml::String(self.default_os.clone()),
        );
        let mut images = yaml::Hash::new();
        for (key, image) in &self.images {
            let mut entry = yaml::Hash::new();
            entry.insert(
                Yaml::String("url".into()),
                Yaml::String(image.url.clone()),
            );
            entry.insert(
                Yaml::String("variant".into()),
                Yaml::String(image.variant.clone()),
            );
            images.insert(Yaml::String(key.clone()), Yaml::Hash(entry));
        }
        root.insert(Yaml::String("images".into()), Yaml::Hash(images));

        let mut out = String::new();
        let mut emitter = YamlEmitter::new(&mut out);
        // Emitting a hash built in memory cannot fail.
        emitter.dump(&Yaml::Hash(root)).expect("yaml emit");
        out.push('\n');
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, self.to_yaml())
            .wrap_err_with(|| format!("writing {}", path.display()))
    }
}

fn parse_image(root: &str, v: &Yaml) -> Result<OsImage> {
    let get = |field: &str| -> Result<String> {
        v[field].as_str().map(str::to_string).ok_or_else(|| {
            Error::ConfigInvalid {
                message: format!("image entry under `{root}` is missing `{field}`"),
            }
            .into()
        })
    };
    Ok(OsImage {
        url: get("url")?,
        variant: get("variant")?,
    })
}

/// Load the global config, writing the default catalog on first run.
pub fn load_or_init(env: &Environment) -> Result<GlobalConfig> {
    let path = env.config_path();
    if !path.exists() {
        let config = GlobalConfig::default_catalog();
        config.save(&path)?;
        tracing::info!(path = %path.display(), "wrote default image catalog");
        return Ok(config);
    }
    let text =
        std::fs::read_to_string(&path).wrap_err_with(|| format!("reading {}", path.display()))?;
    GlobalConfig::parse(&text)
}

/// True when the on-disk file still uses the legacy `os_images` root key.
pub fn has_legacy_key(env: &Environment) -> bool {
    let Ok(text) = std::fs::read_to_string(env.config_path()) else {
        return false;
    };
    let Ok(docs) = YamlLoader::load_from_str(&text) else {
        return false;
    };
    docs.first()
        .map(|doc| !doc["os_images"].is_badvalue())
        .unwrap_or(false)
}
