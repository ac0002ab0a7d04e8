//! The merged view over all layers of an image.
//!
//! Layers are applied bottom to top and a later layer's entry for a path simply replaces the
//! earlier one.  There is no whiteout handling: `.wh.*` markers are indexed like any other file.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::image::LayerSource;
use crate::tar::{LayerEntry, TarStream};

/// Metadata for one path of the merged image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    /// Mode bits as stored in the tar header.
    pub mode: u32,
    pub mtime: i64,
    pub is_dir: bool,
}

impl FileRecord {
    fn from_entry(entry: &LayerEntry) -> Option<Self> {
        if !entry.is_regular() && !entry.is_dir() {
            return None;
        }
        Some(Self {
            path: entry.path.clone(),
            size: if entry.is_dir() { 0 } else { entry.size },
            mode: entry.mode,
            mtime: entry.mtime,
            is_dir: entry.is_dir(),
        })
    }
}

/// An immutable path → [`FileRecord`] map, ordered by path.
///
/// Serializes as `{"files": {"<path>": <record>, ...}}`, which is the payload of an
/// `index-response`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedIndex {
    files: BTreeMap<String, FileRecord>,
}

impl MergedIndex {
    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All records in path order.
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    /// Records of regular files only, in path order.
    pub fn regular_files(&self) -> impl Iterator<Item = &FileRecord> {
        self.records().filter(|record| !record.is_dir)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Accumulates layers into a [`MergedIndex`].
#[derive(Debug, Default)]
pub struct IndexBuilder {
    files: BTreeMap<String, FileRecord>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts `entry` if it is a regular file or a directory.  Returns whether it was indexed.
    pub fn add_entry(&mut self, entry: &LayerEntry) -> bool {
        match FileRecord::from_entry(entry) {
            Some(record) => {
                self.files.insert(record.path.clone(), record);
                true
            }
            None => false,
        }
    }

    /// Walks one uncompressed layer.
    ///
    /// On error, the entries read before the failure stay in the builder.
    pub async fn add_layer(&mut self, reader: impl AsyncRead + Unpin) -> Result<()> {
        let mut stream = TarStream::new(reader);
        while let Some(entry) = stream.next_entry().await? {
            if !self.add_entry(&entry) {
                log::trace!("not indexing {} ({:?})", entry.path, entry.entry_type);
            }
        }
        Ok(())
    }

    async fn add_source_layer(&mut self, source: &impl LayerSource, layer: usize) {
        let result = match source.open_layer(layer).await {
            Ok(stream) => self.add_layer(stream).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            log::warn!("skipping rest of layer {layer}: {err:#}");
        }
    }

    pub fn finish(self) -> MergedIndex {
        MergedIndex { files: self.files }
    }
}

/// Builds the merged index of every layer of `source`, bottom to top.
///
/// A layer that fails to open or parse is reported and skipped; it never fails the build.
pub async fn build(source: &impl LayerSource) -> MergedIndex {
    let mut builder = IndexBuilder::new();
    for layer in 0..source.layer_count() {
        builder.add_source_layer(source, layer).await;
    }

    let index = builder.finish();
    log::debug!(
        "indexed {} paths from {} layers",
        index.len(),
        source.layer_count()
    );
    index
}

/// Indexes a single layer of `source` on its own, with the same failure handling as [`build()`].
pub async fn build_layer(source: &impl LayerSource, layer: usize) -> MergedIndex {
    let mut builder = IndexBuilder::new();
    builder.add_source_layer(source, layer).await;
    builder.finish()
}
