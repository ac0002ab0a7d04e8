//! Finding file content in the layer stack.
//!
//! There is no offset index: every lookup reopens layers from the top of the stack and scans
//! them from the beginning until a regular file with the wanted path turns up.

use anyhow::Result;

use crate::image::LayerSource;
use crate::tar::TarStream;

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("file not found: {0}")]
    NotFound(String),
}

/// Scans one layer for `path`, returning `None` if the layer has no regular file there.
async fn read_from_layer(
    source: &impl LayerSource,
    layer: usize,
    path: &str,
    offset: u64,
    length: u64,
) -> Result<Option<Vec<u8>>> {
    let mut stream = TarStream::new(source.open_layer(layer).await?);

    while let Some(entry) = stream.next_entry().await? {
        if entry.path == path && entry.is_regular() {
            return Ok(Some(stream.read_data(offset, length).await?));
        }
    }
    Ok(None)
}

/// Reads up to `length` bytes at `offset` of the file at `path` in the topmost layer holding
/// a regular file there.
///
/// A `length` of 0 means "to the end of the file"; an `offset` at or past the end of the file
/// gives an empty result.  Layers that fail to open or parse are skipped in favour of older
/// ones.  Within one layer the first matching member is used.
pub async fn locate(
    source: &impl LayerSource,
    path: &str,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>, LocateError> {
    for layer in (0..source.layer_count()).rev() {
        match read_from_layer(source, layer, path, offset, length).await {
            Ok(Some(data)) => {
                log::trace!(
                    "read {} bytes of {path} at {offset} from layer {layer}",
                    data.len()
                );
                return Ok(data);
            }
            Ok(None) => {}
            Err(err) => log::warn!("skipping layer {layer} while looking for {path}: {err:#}"),
        }
    }

    Err(LocateError::NotFound(path.to_string()))
}
