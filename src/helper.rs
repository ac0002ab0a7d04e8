//! The privileged side of a mount: owns layer access and answers requests.
//!
//! A helper process indexes its image once, binds a Unix socket and then serves any number of
//! sessions concurrently, one tokio task each.  All sessions share the same immutable
//! [`MergedIndex`] and [`LayerSource`].

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rustix::process::{set_parent_process_death_signal, Signal};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};

use crate::channel::{Channel, ChannelError, Message, MAX_DATA_SIZE};
use crate::image::{Image, LayerSource};
use crate::index::{self, MergedIndex};
use crate::locate::{locate, LocateError};
use crate::userns::{Privileges, READY_LINE};

/// Pause after a failed accept, so a full file table doesn't turn into a busy loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where [`serve()`] gets its sessions from.
pub trait Acceptor {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = std::io::Result<Self::Stream>> + Send;
}

impl Acceptor for UnixListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> std::io::Result<UnixStream> {
        let (stream, _) = UnixListener::accept(self).await?;
        Ok(stream)
    }
}

/// Removes the socket file when dropped.
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    /// Binds a listener at `path`, owning the socket file from then on.
    pub fn bind(path: &Path) -> Result<(UnixListener, Self)> {
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Binding helper socket {}", path.display()))?;
        Ok((
            listener,
            Self {
                path: path.to_path_buf(),
            },
        ))
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::debug!("removing {}: {err}", self.path.display());
        }
    }
}

async fn handle_request(
    index: &MergedIndex,
    source: &impl LayerSource,
    request: Message,
) -> Message {
    match request {
        Message::IndexRequest => match index.to_json() {
            Ok(data) => Message::IndexResponse { data },
            Err(err) => Message::error(format!("failed to encode index: {err}")),
        },
        Message::DataRequest {
            path,
            offset,
            length,
        } => {
            if !index.get(&path).is_some_and(|record| !record.is_dir) {
                return Message::error(LocateError::NotFound(path));
            }
            // 0 means "to the end", but never past what fits in one frame
            let length = match u64::from(length) {
                0 => MAX_DATA_SIZE,
                n => n.min(MAX_DATA_SIZE),
            };
            match locate(source, &path, offset, length).await {
                Ok(data) => Message::DataResponse { data },
                Err(err) => Message::error(err),
            }
        }
        other => Message::error(format!("unexpected message: {}", other.kind())),
    }
}

/// Runs one session until the peer ends it, hangs up, or the connection breaks.
pub async fn serve_session<T>(index: &MergedIndex, source: &impl LayerSource, stream: T)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut channel = Channel::new(stream);

    loop {
        let request = match channel.receive_async().await {
            Ok(Message::SessionEnd) => {
                log::debug!("session ended by client");
                break;
            }
            Ok(request) => request,
            Err(ChannelError::Closed) => {
                log::debug!("client hung up");
                break;
            }
            Err(err) => {
                log::error!("session failed: {err}");
                break;
            }
        };

        log::trace!("request: {request:?}");
        let response = handle_request(index, source, request).await;
        if let Message::ErrorResponse { error } = &response {
            log::debug!("replying with error: {error}");
        }

        if let Err(err) = channel.send_async(&response).await {
            log::error!("failed to send {}: {err}", response.kind());
            break;
        }
    }
}

/// Accepts connections until `shutdown` resolves, serving each on its own task.
///
/// A failed accept is logged and does not affect sessions that are already running.
pub async fn serve<L, S>(
    mut listener: L,
    index: Arc<MergedIndex>,
    source: Arc<S>,
    shutdown: impl Future<Output = ()>,
) where
    L: Acceptor,
    S: LayerSource + 'static,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                log::debug!("shutting down");
                return;
            }
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok(stream) => stream,
                    Err(err) => {
                        log::error!("accepting connection: {err}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                log::debug!("new session");
                let index = Arc::clone(&index);
                let source = Arc::clone(&source);
                tokio::spawn(async move {
                    serve_session(&index, &*source, stream).await;
                });
            }
        }
    }
}

/// Entry point of `skiff mount-helper IMAGE SOCKET`.
///
/// Binds `socket`, indexes `image`, announces readiness on stdout and serves sessions until
/// `SIGTERM` or `SIGINT`.  The socket file is removed on the way out.
pub fn run(image: &str, socket: &Path) -> Result<()> {
    if let Err(errno) = set_parent_process_death_signal(Some(Signal::TERM)) {
        log::warn!("failed to set parent death signal: {errno}");
    }
    log::debug!(
        "helper {} running with {:?}",
        std::process::id(),
        Privileges::current()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Creating tokio runtime")?;
    runtime.block_on(run_async(image, socket))
}

async fn run_async(image: &str, socket: &Path) -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("Installing SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("Installing SIGINT handler")?;

    let (listener, _guard) = SocketGuard::bind(socket)?;

    let source = Image::resolve(image).with_context(|| format!("Resolving image {image}"))?;
    let index = index::build(&source).await;
    log::info!("serving {} paths of {image} on {}", index.len(), socket.display());

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{READY_LINE}").context("Writing readiness line")?;
        stdout.flush().context("Flushing readiness line")?;
    }

    let shutdown = async move {
        tokio::select! {
            _ = term.recv() => log::debug!("received SIGTERM"),
            _ = int.recv() => log::debug!("received SIGINT"),
        }
    };
    serve(listener, Arc::new(index), Arc::new(source), shutdown).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use similar_asserts::assert_eq;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::image::tests::MemorySource;
    use crate::tar::tests::{append_dir, append_file, make_layer};

    async fn fixture() -> (MergedIndex, MemorySource) {
        let source = MemorySource(vec![
            Some(make_layer(|b| {
                append_dir(b, "etc");
                append_file(b, "etc/motd", b"hello world");
            })),
            Some(make_layer(|b| append_file(b, "etc/motd", b"HELLO"))),
        ]);
        (index::build(&source).await, source)
    }

    #[tokio::test]
    async fn test_requests() {
        let (index, source) = fixture().await;

        let Message::IndexResponse { data } =
            handle_request(&index, &source, Message::IndexRequest).await
        else {
            panic!("expected an index response");
        };
        assert_eq!(MergedIndex::from_json(&data).unwrap(), index);

        let response = handle_request(
            &index,
            &source,
            Message::DataRequest {
                path: "/etc/motd".into(),
                offset: 1,
                length: 3,
            },
        )
        .await;
        assert_eq!(
            response,
            Message::DataResponse {
                data: b"ELL".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn test_error_responses() {
        let (index, source) = fixture().await;

        for path in ["/nope", "/etc"] {
            let response = handle_request(
                &index,
                &source,
                Message::DataRequest {
                    path: path.into(),
                    offset: 0,
                    length: 0,
                },
            )
            .await;
            assert_eq!(response, Message::error(format!("file not found: {path}")));
        }

        let response = handle_request(
            &index,
            &source,
            Message::DataResponse { data: vec![] },
        )
        .await;
        assert_eq!(response, Message::error("unexpected message: data-response"));
    }

    #[tokio::test]
    async fn test_session_loop() {
        let (index, source) = fixture().await;
        let (client, server) = tokio::io::duplex(4096);

        let client = tokio::spawn(async move {
            let mut channel = Channel::new(client);
            channel.send_async(&Message::IndexRequest).await.unwrap();
            assert!(matches!(
                channel.receive_async().await.unwrap(),
                Message::IndexResponse { .. }
            ));

            // a stray response doesn't end the session
            channel.send_async(&Message::error("oops")).await.unwrap();
            assert_eq!(
                channel.receive_async().await.unwrap(),
                Message::error("unexpected message: error-response")
            );

            channel
                .send_async(&Message::DataRequest {
                    path: "/etc/motd".into(),
                    offset: 0,
                    length: 0,
                })
                .await
                .unwrap();
            assert_eq!(
                channel.receive_async().await.unwrap(),
                Message::DataResponse {
                    data: b"HELLO".to_vec()
                }
            );

            channel.send_async(&Message::SessionEnd).await.unwrap();
            // the helper closes its end
            assert!(matches!(
                channel.receive_async().await,
                Err(ChannelError::Closed)
            ));
        });

        serve_session(&index, &source, server).await;
        client.await.unwrap();
    }

    /// Hands out prepared accept results, then waits forever.
    struct ScriptedAcceptor(VecDeque<std::io::Result<DuplexStream>>);

    impl Acceptor for ScriptedAcceptor {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> std::io::Result<DuplexStream> {
            match self.0.pop_front() {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn test_accept_error_keeps_serving() {
        let (index, source) = fixture().await;
        let (first, first_server) = tokio::io::duplex(4096);
        let (second, second_server) = tokio::io::duplex(4096);
        let acceptor = ScriptedAcceptor(VecDeque::from([
            Ok(first_server),
            Err(std::io::Error::from_raw_os_error(rustix::io::Errno::MFILE.raw_os_error())),
            Ok(second_server),
        ]));

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(
            acceptor,
            Arc::new(index),
            Arc::new(source),
            async move {
                let _ = stopped.await;
            },
        ));

        // both sessions live, the one accepted before the failure included
        for stream in [first, second] {
            let mut channel = Channel::new(stream);
            channel
                .send_async(&Message::DataRequest {
                    path: "/etc/motd".into(),
                    offset: 0,
                    length: 0,
                })
                .await
                .unwrap();
            assert_eq!(
                channel.receive_async().await.unwrap(),
                Message::DataResponse {
                    data: b"HELLO".to_vec()
                }
            );
        }

        stop.send(()).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socket_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.sock");
        {
            let (_listener, _guard) = SocketGuard::bind(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
