//! Post-packaging compression of raw disk images.
//!
//! Every `*.img` in the output directory is replaced by `*.img.zst`.
//! ISO images are already compressed internally and are left alone.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

pub const DEFAULT_LEVEL: i32 = 10;
/// Levels zstd accepts.
pub const LEVELS: RangeInclusive<i32> = 1..=22;
const IMAGE_EXTENSION: &str = "img";

/// Compress the disk images directly inside `dir`. Returns the paths of the
/// compressed files, sorted.
pub fn compress_images(dir: &Path, level: i32) -> Result<Vec<PathBuf>> {
    if !LEVELS.contains(&level) {
        bail!("zstd level {level} out of range (1-22)");
    }
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut images = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("reading output directory '{}'", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == IMAGE_EXTENSION) {
            images.push(path);
        }
    }
    images.sort();

    let mut written = Vec::with_capacity(images.len());
    for image in images {
        written.push(compress_one(&image, level)?);
    }
    Ok(written)
}

fn compress_one(image: &Path, level: i32) -> Result<PathBuf> {
    let mut dest = image.as_os_str().to_owned();
    dest.push(".zst");
    let dest = PathBuf::from(dest);
    let parent = image.parent().unwrap_or(Path::new("."));

    tracing::info!(image = %image.display(), level, "compressing disk image");

    let mut input = BufReader::new(
        File::open(image).with_context(|| format!("opening '{}'", image.display()))?,
    );
    let tmp = tempfile::Builder::new()
        .prefix(".imagesmith-compress.")
        .tempfile_in(parent)
        .with_context(|| format!("creating temp file in '{}'", parent.display()))?;

    let mut encoder = zstd::stream::Encoder::new(tmp.as_file(), level)?;
    io::copy(&mut input, &mut encoder)
        .with_context(|| format!("compressing '{}'", image.display()))?;
    encoder.finish()?.sync_all()?;

    tmp.persist(&dest)
        .with_context(|| format!("moving compressed image to '{}'", dest.display()))?;
    fs::remove_file(image).with_context(|| format!("removing '{}'", image.display()))?;
    Ok(dest)
}
