//! Image cache: idempotent downloads of base cloud images.
//!
//! A complete image lives at `<base>/images/<basename(url)>`. In-flight
//! downloads stream to a `.part` file and are renamed into place only on
//! success, so completeness is equivalent to existence. Concurrent callers
//! are serialized by an advisory lock file next to the image.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use color_eyre::eyre::Context;
use color_eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rustix::fs::FlockOperation;

use crate::config::OsImage;
use crate::env::Environment;
use crate::errors::Error;

/// Download seam so tests can count fetches and fail on demand.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Streams over HTTP with a progress bar. Proxy environment variables are
/// honored by the client.
#[derive(Debug, Default)]
pub struct HttpFetcher;

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let response = reqwest::blocking::get(url)
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::ImageFetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let pb = match response.content_length() {
            Some(len) => {
                let pb = ProgressBar::new(len);
                pb.set_style(
                    ProgressStyle::with_template(
                        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes}",
                    )
                    .expect("static template")
                    .progress_chars("#>-"),
                );
                pb
            }
            None => ProgressBar::new_spinner(),
        };

        let mut file = std::fs::File::create(dest)
            .wrap_err_with(|| format!("creating {}", dest.display()))?;
        let mut reader = pb.wrap_read(response);
        std::io::copy(&mut reader, &mut file).map_err(|e| Error::ImageFetch {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        file.flush()?;
        pb.finish_and_clear();
        Ok(())
    }
}

/// Cache file name: the URL basename, given a disk-image suffix when the
/// URL lacks one.
pub fn cache_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let base = path.rsplit('/').next().unwrap_or("image");
    let base = if base.is_empty() { "image" } else { base };
    if base.ends_with(".qcow2") || base.ends_with(".img") {
        base.to_string()
    } else {
        format!("{base}.qcow2")
    }
}

/// Ensure the base image for `image` is cached locally; returns its path.
///
/// Complete file present: returns immediately with zero network I/O.
/// Otherwise takes an exclusive advisory lock, re-checks (the lock winner
/// may have finished the download first), then streams and renames.
pub fn ensure(env: &Environment, image: &OsImage, fetcher: &dyn Fetcher) -> Result<PathBuf> {
    let images_dir = env.images_dir();
    std::fs::create_dir_all(&images_dir)
        .wrap_err_with(|| format!("creating {}", images_dir.display()))?;

    let dest = images_dir.join(cache_file_name(&image.url));
    if dest.exists() {
        tracing::debug!(path = %dest.display(), "image cache hit");
        return Ok(dest);
    }

    let lock_path = dest.with_extension("lock");
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .wrap_err_with(|| format!("opening {}", lock_path.display()))?;
    rustix::fs::flock(&lock, FlockOperation::LockExclusive)
        .wrap_err("acquiring image cache lock")?;

    // Another invocation may have completed while we waited on the lock.
    if dest.exists() {
        return Ok(dest);
    }

    tracing::info!(url = %image.url, "downloading base image");
    let part = dest.with_extension(
        dest.extension()
            .map(|e| format!("{}.part", e.to_string_lossy()))
            .unwrap_or_else(|| "part".to_string()),
    );
    if let Err(err) = fetcher.fetch(&image.url, &part) {
        let _ = std::fs::remove_file(&part);
        return Err(err);
    }
    std::fs::rename(&part, &dest)
        .wrap_err_with(|| format!("renaming {} into place", part.display()))?;
    tracing::info!(path = %dest.display(), "base image cached");
    Ok(dest)
    // Lock released when `lock` drops.
}
