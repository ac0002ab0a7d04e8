//! Blocking client for a helper session, used from FUSE callbacks.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;

use crate::channel::{Channel, ChannelError, Message};
use crate::index::MergedIndex;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The helper answered with a message kind that doesn't fit the request.
    #[error("unexpected {0} from helper")]
    Unexpected(&'static str),

    /// The helper answered with an `error-response`.
    #[error("helper error: {0}")]
    Helper(String),

    #[error("invalid index from helper: {0}")]
    Index(#[source] serde_json::Error),

    #[error("helper session lock poisoned")]
    Poisoned,

    /// An earlier transport or protocol failure ended this session.
    #[error("helper session is closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// One session with the helper.
///
/// Requests are serialized through a mutex since the protocol has no request IDs.  Any failure
/// other than an `error-response` closes the session; later calls get
/// [`ClientError::SessionClosed`].
#[derive(Debug)]
pub struct HelperClient {
    channel: Mutex<Option<Channel<UnixStream>>>,
}

impl HelperClient {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            channel: Mutex::new(Some(Channel::new(stream))),
        }
    }

    pub fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket).map_err(ChannelError::from)?;
        Ok(Self::new(stream))
    }

    /// Sends `request` and hands the reply to `accept`, which rejects kinds it didn't expect.
    fn request<T>(&self, request: &Message, accept: impl FnOnce(Message) -> Result<T>) -> Result<T> {
        let mut session = self.channel.lock().map_err(|_| ClientError::Poisoned)?;
        let channel = session.as_mut().ok_or(ClientError::SessionClosed)?;

        let result = channel
            .send(request)
            .and_then(|()| channel.receive())
            .map_err(ClientError::from)
            .and_then(|response| match response {
                Message::ErrorResponse { error } => Err(ClientError::Helper(error)),
                response => accept(response),
            });

        if let Err(err) = &result {
            if !matches!(err, ClientError::Helper(_)) {
                log::error!("closing helper session: {err}");
                *session = None;
            }
        }
        result
    }

    /// Fetches and decodes the merged index.
    pub fn fetch_index(&self) -> Result<MergedIndex> {
        self.request(&Message::IndexRequest, |response| match response {
            Message::IndexResponse { data } => {
                MergedIndex::from_json(&data).map_err(ClientError::Index)
            }
            other => Err(ClientError::Unexpected(other.kind())),
        })
    }

    /// Reads up to `length` bytes of `path` at `offset`; a `length` of 0 reads to the end.
    pub fn read(&self, path: &str, offset: u64, length: u32) -> Result<Vec<u8>> {
        let request = Message::DataRequest {
            path: path.to_string(),
            offset,
            length,
        };
        self.request(&request, |response| match response {
            Message::DataResponse { data } => Ok(data),
            other => Err(ClientError::Unexpected(other.kind())),
        })
    }

    /// Tells the helper this session is over.  No response is expected.
    ///
    /// Does nothing if the session is already closed.
    pub fn end_session(&self) -> Result<()> {
        let mut session = self.channel.lock().map_err(|_| ClientError::Poisoned)?;
        if let Some(mut channel) = session.take() {
            channel.send(&Message::SessionEnd)?;
        }
        Ok(())
    }
}
