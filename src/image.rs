//! Image references and access to their layer blobs.
//!
//! Two kinds of image are understood:
//!
//!  - `oci:DIR[:TAG]`: an OCI image layout directory.  The manifest is picked from
//!    `index.json` by its `org.opencontainers.image.ref.name` annotation, or is the only one
//!    present.  A bare directory path containing `index.json` means the same thing.
//!  - `tar:FILE[,FILE...]`: a list of layer tarballs, bottom layer first.
//!
//! Layer blobs may be plain, gzip or zstd compressed tar; the format is sniffed from the first
//! bytes of the blob rather than trusted from a media type.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest, MediaType};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// An uncompressed layer tar stream.
pub type LayerStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("unsupported image reference '{0}' (expected oci:DIR[:TAG] or tar:FILE[,FILE...])")]
    InvalidReference(String),

    #[error("invalid OCI layout at {}: {reason}", path.display())]
    InvalidLayout { path: PathBuf, reason: String },

    #[error("failed to parse OCI document: {0}")]
    Spec(#[from] oci_spec::OciSpecError),

    #[error("image has no layer {0}")]
    NoSuchLayer(usize),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Produces uncompressed tar streams for the layers of one image.
///
/// Layer numbers count from the bottom of the image, starting at 0.  Every call to
/// [`LayerSource::open_layer()`] returns a fresh stream positioned at the start of the layer.
pub trait LayerSource: Send + Sync {
    fn layer_count(&self) -> usize;

    fn open_layer(
        &self,
        layer: usize,
    ) -> impl Future<Output = Result<LayerStream, SourceError>> + Send;
}

/// One layer blob on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerBlob {
    /// The content digest, if the image format records one.
    pub digest: Option<String>,
    /// Size of the (possibly compressed) blob.
    pub size: u64,
    pub path: PathBuf,
}

/// A resolved image: an ordered list of layer blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    reference: String,
    layers: Vec<LayerBlob>,
    /// Uncompressed layer digests from the image configuration, one per layer.
    diff_ids: Option<Vec<String>>,
}

/// Parse an OCI layout reference like "/path/to/dir:tag" or "/path/to/dir".
///
/// A colon only separates a tag when it comes after the last slash.
fn parse_oci_layout_ref(imgref: &str) -> (&str, Option<&str>) {
    let name_start = imgref.rfind('/').unwrap_or(0);
    match imgref[name_start..].rfind(':') {
        Some(colon) => {
            let (path, tag) = imgref.split_at(name_start + colon);
            (path, Some(&tag[1..]))
        }
        None => (imgref, None),
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SourceError + '_ {
    move |source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn blob_path(layout: &Path, descriptor: &Descriptor) -> Result<PathBuf, SourceError> {
    let digest = descriptor.digest().to_string();
    match digest.split_once(':') {
        Some((algorithm, encoded)) if !encoded.contains('/') && !algorithm.contains('/') => {
            Ok(layout.join("blobs").join(algorithm).join(encoded))
        }
        _ => Err(SourceError::InvalidLayout {
            path: layout.to_path_buf(),
            reason: format!("malformed digest '{digest}'"),
        }),
    }
}

/// Picks the manifest descriptor out of an OCI layout's index.
fn resolve_manifest_descriptor(
    layout: &Path,
    index: &ImageIndex,
    tag: Option<&str>,
) -> Result<Descriptor, SourceError> {
    let invalid = |reason: String| SourceError::InvalidLayout {
        path: layout.to_path_buf(),
        reason,
    };
    let manifests = index.manifests();

    if let Some(tag) = tag {
        return manifests
            .iter()
            .find(|desc| {
                desc.annotations()
                    .as_ref()
                    .and_then(|annotations| annotations.get(REF_NAME_ANNOTATION))
                    .is_some_and(|name| name == tag)
            })
            .cloned()
            .ok_or_else(|| invalid(format!("tag '{tag}' not found in index.json")));
    }

    match manifests.as_slice() {
        [] => Err(invalid("index.json contains no manifests".into())),
        [only] => Ok(only.clone()),
        _ => Err(invalid(format!(
            "index.json lists {} manifests; pick one with oci:DIR:TAG",
            manifests.len()
        ))),
    }
}

/// `rootfs.diff_ids` of the manifest's configuration.
///
/// An unreadable configuration, a rootfs type other than `layers` or a count that doesn't match
/// the manifest's layers all give `None`.
fn config_diff_ids(layout: &Path, manifest: &ImageManifest) -> Option<Vec<String>> {
    let path = blob_path(layout, manifest.config()).ok()?;
    let config = match ImageConfiguration::from_file(&path) {
        Ok(config) => config,
        Err(err) => {
            log::debug!("ignoring image config {}: {err}", path.display());
            return None;
        }
    };

    let rootfs = config.rootfs();
    if rootfs.typ() != "layers" || rootfs.diff_ids().len() != manifest.layers().len() {
        log::debug!("image config has no usable diff IDs");
        return None;
    }
    Some(rootfs.diff_ids().clone())
}

impl Image {
    /// Resolves an image reference to its layer blobs (`resolveImage`).
    pub fn resolve(imgref: &str) -> Result<Self, SourceError> {
        let (layers, diff_ids) = if let Some(layout) = imgref.strip_prefix("oci:") {
            let (path, tag) = parse_oci_layout_ref(layout);
            Self::oci_layers(Path::new(path), tag)?
        } else if let Some(files) = imgref.strip_prefix("tar:") {
            (Self::tarball_layers(files)?, None)
        } else if Path::new(imgref).join("index.json").is_file() {
            Self::oci_layers(Path::new(imgref), None)?
        } else {
            return Err(SourceError::InvalidReference(imgref.to_string()));
        };

        log::debug!("resolved {imgref} to {} layers", layers.len());
        Ok(Self {
            reference: imgref.to_string(),
            layers,
            diff_ids,
        })
    }

    #[allow(clippy::type_complexity)]
    fn oci_layers(
        layout: &Path,
        tag: Option<&str>,
    ) -> Result<(Vec<LayerBlob>, Option<Vec<String>>), SourceError> {
        let index_path = layout.join("index.json");
        if !index_path.is_file() {
            return Err(SourceError::InvalidLayout {
                path: layout.to_path_buf(),
                reason: "no index.json".into(),
            });
        }
        let index = ImageIndex::from_file(&index_path)?;

        let descriptor = resolve_manifest_descriptor(layout, &index, tag)?;
        if *descriptor.media_type() == MediaType::ImageIndex {
            return Err(SourceError::InvalidLayout {
                path: layout.to_path_buf(),
                reason: "nested image indexes are not supported".into(),
            });
        }

        let manifest = ImageManifest::from_file(blob_path(layout, &descriptor)?)?;
        let layers = manifest
            .layers()
            .iter()
            .map(|layer| {
                Ok(LayerBlob {
                    digest: Some(layer.digest().to_string()),
                    size: layer.size() as u64,
                    path: blob_path(layout, layer)?,
                })
            })
            .collect::<Result<Vec<_>, SourceError>>()?;

        Ok((layers, config_diff_ids(layout, &manifest)))
    }

    fn tarball_layers(files: &str) -> Result<Vec<LayerBlob>, SourceError> {
        files
            .split(',')
            .filter(|name| !name.is_empty())
            .map(|name| {
                let path = PathBuf::from(name);
                let metadata = std::fs::metadata(&path).map_err(io_error(&path))?;
                Ok(LayerBlob {
                    digest: None,
                    size: metadata.len(),
                    path,
                })
            })
            .collect()
    }

    /// The reference this image was resolved from.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// The layer blobs, bottom first.
    pub fn layers(&self) -> &[LayerBlob] {
        &self.layers
    }

    /// The diff IDs recorded in the image configuration, if there is a set matching the layers.
    pub fn diff_ids(&self) -> Option<&[String]> {
        self.diff_ids.as_deref()
    }
}

impl LayerSource for Image {
    fn layer_count(&self) -> usize {
        self.layers.len()
    }

    async fn open_layer(&self, layer: usize) -> Result<LayerStream, SourceError> {
        let blob = self
            .layers
            .get(layer)
            .ok_or(SourceError::NoSuchLayer(layer))?;
        let file = tokio::fs::File::open(&blob.path)
            .await
            .map_err(io_error(&blob.path))?;
        decompress_async(file).await.map_err(io_error(&blob.path))
    }
}

/// Wraps a layer blob in the matching decompressor (`openLayerStream`).
///
/// gzip and zstd are recognised by their magic numbers; anything else is assumed to be an
/// uncompressed tar.
pub async fn decompress_async<R>(reader: R) -> std::io::Result<LayerStream>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = BufReader::new(reader);
    let head = buf.fill_buf().await?;

    if head.starts_with(&GZIP_MAGIC) {
        let mut decoder = GzipDecoder::new(buf);
        decoder.multiple_members(true);
        Ok(Box::pin(decoder))
    } else if head.starts_with(&ZSTD_MAGIC) {
        Ok(Box::pin(ZstdDecoder::new(buf)))
    } else {
        Ok(Box::pin(buf))
    }
}
