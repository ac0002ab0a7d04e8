use std::io::{Error, ErrorKind, Read, Result};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Fills `buf` completely from `reader`, retrying short reads and EINTR.
///
/// Unlike [`Read::read_exact()`] this distinguishes a clean end of stream from a truncated
/// one:
///
///  - `Ok(true)` when the buffer was filled,
///  - `Ok(false)` when the stream ended before a single byte was read,
///  - `Err(UnexpectedEof)` when the stream ended part way through the buffer,
///  - any other error from the reader is returned as-is.
///
/// Frame and tar header readers rely on the `Ok(false)` case to tell "peer hung up" or "archive
/// ended" apart from corruption.
pub(crate) fn read_exactish(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let buflen = buf.len();
    let mut todo: &mut [u8] = buf;

    while !todo.is_empty() {
        match reader.read(todo) {
            Ok(0) if todo.len() == buflen => return Ok(false),
            Ok(0) => return Err(Error::from(ErrorKind::UnexpectedEof)),
            Ok(n) => todo = &mut todo[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}

/// The async flavour of [`read_exactish()`].
pub(crate) async fn read_exactish_async(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut [u8],
) -> Result<bool> {
    let buflen = buf.len();
    let mut todo: &mut [u8] = buf;

    while !todo.is_empty() {
        match reader.read(todo).await {
            Ok(0) if todo.len() == buflen => return Ok(false),
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => todo = &mut todo[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}

/// Reads and throws away exactly `count` bytes.
///
/// Fails with `UnexpectedEof` if the stream is shorter than that.
pub(crate) async fn discard_async(reader: &mut (impl AsyncRead + Unpin), count: u64) -> Result<()> {
    let copied = tokio::io::copy(&mut reader.take(count), &mut tokio::io::sink()).await?;
    if copied != count {
        return Err(Error::new(
            ErrorKind::UnexpectedEof,
            format!("stream ended {} bytes early", count - copied),
        ));
    }
    Ok(())
}

/// Turns an archive member name into the canonical absolute path used as index key.
///
/// The name is rooted at `/`, empty and `.` components are dropped and `..` pops the previous
/// component without ever escaping the root.  The result never has a trailing slash, except for
/// the root itself.  Invalid UTF-8 is replaced lossily.
pub fn normalize_path(name: &[u8]) -> String {
    let name = String::from_utf8_lossy(name);
    let mut parts: Vec<&str> = vec![];

    for component in name.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let mut path = String::with_capacity(name.len() + 1);
    for part in &parts {
        path.push('/');
        path.push_str(part);
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_exactish() {
        let mut buf = [0u8; 4];

        let mut full: &[u8] = b"abcdef";
        assert!(read_exactish(&mut full, &mut buf).unwrap());
        assert_eq!(&buf, b"abcd");

        let mut empty: &[u8] = b"";
        assert!(!read_exactish(&mut empty, &mut buf).unwrap());

        let mut short: &[u8] = b"ab";
        let err = read_exactish(&mut short, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_exactish_async() {
        let mut buf = [0u8; 3];

        let mut full: &[u8] = b"xyz";
        assert!(read_exactish_async(&mut full, &mut buf).await.unwrap());
        assert_eq!(&buf, b"xyz");

        let mut empty: &[u8] = b"";
        assert!(!read_exactish_async(&mut empty, &mut buf).await.unwrap());

        let mut short: &[u8] = b"x";
        let err = read_exactish_async(&mut short, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_discard_async() {
        let mut data: &[u8] = b"0123456789";
        discard_async(&mut data, 4).await.unwrap();
        assert_eq!(data, b"456789");

        let err = discard_async(&mut data, 100).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(b""), "/");
        assert_eq!(normalize_path(b"./"), "/");
        assert_eq!(normalize_path(b"/"), "/");
        assert_eq!(normalize_path(b"etc/"), "/etc");
        assert_eq!(normalize_path(b"./etc/hostname"), "/etc/hostname");
        assert_eq!(normalize_path(b"usr//lib/./x"), "/usr/lib/x");
        assert_eq!(normalize_path(b"a/b/../c"), "/a/c");
        assert_eq!(normalize_path(b"../../etc/passwd"), "/etc/passwd");
    }
}
