//! The `layers`, `top` and `diff` reports.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::image::{Image, LayerSource};
use crate::index::{self, MergedIndex};

/// Formats a byte count with SI units, like `999 B` or `1.5 kB`.
pub fn human_readable_size(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{bytes} B");
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefix = b"kMGTPE"[exp] as char;
    format!("{:.1} {prefix}B", bytes as f64 / div as f64)
}

/// Shortens `algorithm:hex` to the first 12 hex characters unless `full` is set.
pub fn format_digest(digest: &str, full: bool) -> String {
    if full {
        return digest.to_string();
    }
    let encoded = digest.split_once(':').map_or(digest, |(_, encoded)| encoded);
    encoded.chars().take(12).collect()
}

/// `sha256:<hex>` of a file's contents.
pub fn file_digest(path: &Path) -> Result<String> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("Opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Resolves and indexes an image.
pub async fn index_image(imgref: &str) -> Result<MergedIndex> {
    let image = Image::resolve(imgref).with_context(|| format!("Resolving image {imgref}"))?;
    Ok(index::build(&image).await)
}

/// sha256 of a layer's decompressed stream.
async fn uncompressed_digest(source: &impl LayerSource, layer: usize) -> Result<String> {
    let mut stream = source.open_layer(layer).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// One diff ID per layer, bottom first.
///
/// These come from the image configuration when it lists them.  Otherwise each layer's
/// decompressed stream is hashed, and a layer that can't be read falls back to its blob digest.
pub async fn layer_diff_ids(image: &Image) -> Result<Vec<String>> {
    if let Some(diff_ids) = image.diff_ids() {
        return Ok(diff_ids.to_vec());
    }

    let mut diff_ids = Vec::with_capacity(image.layer_count());
    for (layer, blob) in image.layers().iter().enumerate() {
        let diff_id = match uncompressed_digest(image, layer).await {
            Ok(digest) => digest,
            Err(err) => {
                log::warn!("hashing layer {layer}: {err:#}, using its blob digest");
                match &blob.digest {
                    Some(digest) => digest.clone(),
                    None => file_digest(&blob.path)?,
                }
            }
        };
        diff_ids.push(diff_id);
    }
    Ok(diff_ids)
}

/// Indices of the layers named by `wanted`, each a full diff ID or a prefix of its hex part.
///
/// An empty `wanted` selects every layer.
pub fn select_layers(diff_ids: &[String], wanted: &[String]) -> Result<Vec<usize>> {
    if wanted.is_empty() {
        return Ok((0..diff_ids.len()).collect());
    }

    let mut selected = BTreeSet::new();
    for want in wanted {
        let found = diff_ids.iter().position(|diff_id| {
            let encoded = diff_id.split_once(':').map_or(diff_id.as_str(), |(_, e)| e);
            diff_id == want || (!want.is_empty() && encoded.starts_with(want.as_str()))
        });
        match found {
            Some(layer) => selected.insert(layer),
            None => bail!("diff ID {want} not found in image"),
        };
    }
    Ok(selected.into_iter().collect())
}

/// A regular file of the merged image and the layer its contents come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopFile {
    pub path: String,
    pub size: u64,
    pub layer: usize,
}

/// The regular files of the merged image, in path order, each tagged with its layer.
pub async fn layer_files(source: &impl LayerSource) -> Vec<TopFile> {
    let mut files = BTreeMap::new();
    for layer in 0..source.layer_count() {
        for record in index::build_layer(source, layer).await.records() {
            if record.is_dir {
                files.remove(&record.path);
            } else {
                files.insert(
                    record.path.clone(),
                    TopFile {
                        path: record.path.clone(),
                        size: record.size,
                        layer,
                    },
                );
            }
        }
    }
    files.into_values().collect()
}

/// The `n` largest files, largest first, ties broken by path.
///
/// With a non-empty `layers`, only files whose contents come from one of those layers count.
pub fn top_files(mut files: Vec<TopFile>, n: usize, layers: &[usize]) -> Vec<TopFile> {
    if !layers.is_empty() {
        files.retain(|file| layers.contains(&file.layer));
    }
    files.sort_by(|a, b| {
        Reverse(a.size)
            .cmp(&Reverse(b.size))
            .then_with(|| a.path.cmp(&b.path))
    });
    files.truncate(n);
    files
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Added => "ADDED",
            ChangeKind::Deleted => "DELETED",
            ChangeKind::Modified => "MODIFIED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub change: ChangeKind,
    /// Size change from the first to the second image.
    pub size_diff: i64,
}

/// Regular files that were added, deleted or changed size between `old` and `new`.
pub fn diff(old: &MergedIndex, new: &MergedIndex) -> Vec<FileDiff> {
    let regular = |index: &MergedIndex, path: &str| {
        index
            .get(path)
            .filter(|record| !record.is_dir)
            .map(|record| record.size as i64)
    };
    let paths: BTreeSet<&str> = old
        .regular_files()
        .chain(new.regular_files())
        .map(|record| record.path.as_str())
        .collect();

    paths
        .into_iter()
        .filter_map(|path| {
            let (change, size_diff) = match (regular(old, path), regular(new, path)) {
                (Some(before), None) => (ChangeKind::Deleted, -before),
                (None, Some(after)) => (ChangeKind::Added, after),
                (Some(before), Some(after)) if before != after => {
                    (ChangeKind::Modified, after - before)
                }
                _ => return None,
            };
            Some(FileDiff {
                path: path.to_string(),
                change,
                size_diff,
            })
        })
        .collect()
}

/// Writes rows as left-aligned columns separated by two spaces.
fn write_table(out: &mut impl Write, header: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    for row in std::iter::once(&header).chain(rows) {
        let mut line = String::new();
        for (i, (cell, width)) in row.iter().zip(&widths).enumerate() {
            if i + 1 == row.len() {
                line.push_str(cell);
            } else {
                line.push_str(&format!("{cell:<width$}  "));
            }
        }
        writeln!(out, "{line}")?;
    }
    Ok(())
}

fn size_column(size: u64, human_readable: bool) -> String {
    if human_readable {
        human_readable_size(size)
    } else {
        size.to_string()
    }
}

/// Lists diff IDs when the image configuration has them, compressed digests otherwise.
pub fn write_layers(out: &mut impl Write, image: &Image, full_digest: bool) -> Result<()> {
    if let Some(diff_ids) = image.diff_ids() {
        let rows: Vec<Vec<String>> = diff_ids
            .iter()
            .zip(image.layers())
            .map(|(diff_id, blob)| {
                vec![format_digest(diff_id, full_digest), blob.size.to_string()]
            })
            .collect();
        return write_table(out, &["Diff ID", "Compressed Size"], &rows);
    }

    let mut rows = vec![];
    for blob in image.layers() {
        let digest = match &blob.digest {
            Some(digest) => digest.clone(),
            None => file_digest(&blob.path)?,
        };
        rows.push(vec![format_digest(&digest, full_digest), blob.size.to_string()]);
    }
    write_table(out, &["Compressed Digest", "Compressed Size"], &rows)
}

pub fn write_top(
    out: &mut impl Write,
    files: &[TopFile],
    diff_ids: &[String],
    human_readable: bool,
) -> Result<()> {
    let rows: Vec<Vec<String>> = files
        .iter()
        .map(|file| {
            let diff_id = diff_ids
                .get(file.layer)
                .map_or_else(String::new, |diff_id| format_digest(diff_id, false));
            vec![
                file.path.clone(),
                size_column(file.size, human_readable),
                diff_id,
            ]
        })
        .collect();
    write_table(out, &["FILE PATH", "SIZE", "DIFF ID"], &rows)
}

pub fn write_diff(out: &mut impl Write, diffs: &[FileDiff], human_readable: bool) -> Result<()> {
    if diffs.is_empty() {
        writeln!(out, "No differences found between the images.")?;
        return Ok(());
    }

    let rows: Vec<Vec<String>> = diffs
        .iter()
        .map(|diff| {
            let size = if human_readable {
                let sign = if diff.size_diff < 0 { '-' } else { '+' };
                format!("{sign}{}", human_readable_size(diff.size_diff.unsigned_abs()))
            } else {
                format!("{:+}", diff.size_diff)
            };
            vec![diff.change.to_string(), size, diff.path.clone()]
        })
        .collect();
    write_table(out, &["Change", "Size Diff", "Path"], &rows)
}
