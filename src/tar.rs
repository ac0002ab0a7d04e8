//! Sequential walking of (uncompressed) tar layer streams.
//!
//! Layers are only ever read front to back.  [`TarStream`] hands out one [`LayerEntry`] per
//! archive member with the name already resolved from any preceding GNU long-name (`L`) or PAX
//! (`x`) record, and keeps track of how much of the member's data and block padding is still
//! unread so that the next call to [`TarStream::next_entry()`] lands on a header again, whether
//! or not the caller looked at the content.

use std::borrow::Cow;

use anyhow::{bail, Context, Result};
use tar::{EntryType, Header, PaxExtensions};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::util::{discard_async, normalize_path, read_exactish_async};

const TAR_BLOCK_SIZE: u64 = 512;

/// Largest GNU long-name or PAX record we are willing to buffer.
pub const MAX_EXTENSION_SIZE: u64 = 1024 * 1024;

/// Byte range of the checksum field, which counts as spaces while summing.
const CHECKSUM_FIELD: std::ops::Range<usize> = 148..156;

/// Metadata of one archive member, as needed by the index and the locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    /// Absolute, normalized path.
    pub path: String,
    pub entry_type: EntryType,
    /// Size of the member's data in bytes.
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
}

impl LayerEntry {
    pub fn is_regular(&self) -> bool {
        matches!(self.entry_type, EntryType::Regular | EntryType::Continuous)
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Directory
    }
}

/// A forward-only reader of tar members.
#[derive(Debug)]
pub struct TarStream<R> {
    reader: R,
    /// Unread data bytes of the current member.
    remaining: u64,
    /// Block padding following the current member's data.
    padding: u64,
    finished: bool,
}

fn padding_for(size: u64) -> u64 {
    size.next_multiple_of(TAR_BLOCK_SIZE) - size
}

/// Accepts both the unsigned sum and the signed one some old tar implementations wrote.
fn verify_checksum(header: &Header) -> Result<()> {
    let stored = header.cksum().context("Invalid tar header checksum field")?;

    let mut unsigned: u32 = 0;
    let mut signed: i64 = 0;
    for (i, &byte) in header.as_bytes().iter().enumerate() {
        let byte = if CHECKSUM_FIELD.contains(&i) { b' ' } else { byte };
        unsigned += u32::from(byte);
        signed += i64::from(byte as i8);
    }

    if stored != unsigned && i64::from(stored) != signed {
        bail!("invalid tar header checksum: stored {stored}, computed {unsigned}");
    }
    Ok(())
}

fn strip_nuls(mut bytes: Vec<u8>) -> Vec<u8> {
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes
}

impl<R: AsyncRead + Unpin> TarStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            remaining: 0,
            padding: 0,
            finished: false,
        }
    }

    async fn read_header(&mut self) -> Result<Option<Header>> {
        let mut header = Header::new_gnu();
        if read_exactish_async(&mut self.reader, header.as_mut_bytes()).await? {
            Ok(Some(header))
        } else {
            Ok(None)
        }
    }

    /// Drops whatever is left of the current member, including padding.
    async fn skip_current(&mut self) -> Result<()> {
        let count = self.remaining + self.padding;
        if count > 0 {
            discard_async(&mut self.reader, count)
                .await
                .context("Skipping tar entry data")?;
        }
        self.remaining = 0;
        self.padding = 0;
        Ok(())
    }

    /// Reads the full content of a metadata member (long name, PAX record) plus its padding.
    async fn read_member(&mut self, size: u64) -> Result<Vec<u8>> {
        if size > MAX_EXTENSION_SIZE {
            bail!("tar extension record of {size} bytes exceeds {MAX_EXTENSION_SIZE}");
        }
        let mut content = vec![0u8; size as usize];
        self.reader
            .read_exact(&mut content)
            .await
            .context("Reading tar extension record")?;
        discard_async(&mut self.reader, padding_for(size)).await?;
        Ok(content)
    }

    /// Advances to the next real archive member.
    ///
    /// Returns `None` at the end-of-archive marker or at a clean end of stream.  The name of the
    /// returned entry comes from, in order of preference, a PAX `path` record, a GNU long name,
    /// or the header itself (including the ustar prefix field).  Either kind of override only
    /// applies to the member immediately following it.
    pub async fn next_entry(&mut self) -> Result<Option<LayerEntry>> {
        if self.finished {
            return Ok(None);
        }
        self.skip_current().await?;

        let mut gnu_longname: Option<Vec<u8>> = None;
        let mut pax_path: Option<Vec<u8>> = None;

        loop {
            let Some(header) = self.read_header().await? else {
                self.finished = true;
                return Ok(None);
            };
            if header.as_bytes() == &[0u8; 512] {
                self.finished = true;
                return Ok(None);
            }
            verify_checksum(&header)?;

            let size = header.entry_size().context("Invalid tar entry size")?;

            match header.entry_type() {
                EntryType::GNULongName => {
                    gnu_longname = Some(strip_nuls(self.read_member(size).await?));
                }
                EntryType::XHeader => {
                    let content = self.read_member(size).await?;
                    for extension in PaxExtensions::new(&content) {
                        let extension = extension.context("Invalid PAX extension")?;
                        if extension.key_bytes() == b"path" {
                            pax_path = Some(extension.value_bytes().to_vec());
                        }
                    }
                }
                EntryType::XGlobalHeader | EntryType::GNULongLink => {
                    // link targets and global defaults don't affect the index
                    self.read_member(size).await?;
                }
                entry_type => {
                    let name = match pax_path.or(gnu_longname) {
                        Some(name) => Cow::Owned(name),
                        None => header.path_bytes(),
                    };

                    self.remaining = size;
                    self.padding = padding_for(size);

                    return Ok(Some(LayerEntry {
                        path: normalize_path(&name),
                        entry_type,
                        size,
                        mode: header.mode().context("Invalid tar entry mode")?,
                        mtime: i64::try_from(header.mtime().context("Invalid tar entry mtime")?)
                            .context("Tar entry mtime out of range")?,
                    }));
                }
            }
        }
    }

    /// Reads part of the current member's data.
    ///
    /// Skips `offset` bytes and returns up to `length` bytes after that, fewer if the member ends
    /// first.  A `length` of 0 reads to the end of the member and an `offset` at or past the end
    /// yields an empty buffer.  Must be called at most once per member.
    pub async fn read_data(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let available = self.remaining.saturating_sub(offset);
        let count = match length {
            0 => available,
            n => n.min(available),
        };

        let skip = offset.min(self.remaining);
        discard_async(&mut self.reader, skip).await?;
        self.remaining -= skip;

        // grows with what actually arrives, the header's size may be a lie
        let mut data = vec![];
        (&mut self.reader)
            .take(count)
            .read_to_end(&mut data)
            .await
            .context("Reading tar entry data")?;
        if data.len() as u64 != count {
            bail!(
                "tar entry data ended after {} of {count} bytes",
                data.len()
            );
        }
        self.remaining -= count;

        Ok(data)
    }
}
