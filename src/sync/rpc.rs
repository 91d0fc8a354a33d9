//! Framed duplex RPC for the sync protocol.
//!
//! Length-prefixed postcard frames over any `AsyncRead + AsyncWrite` pair.
//! Each frame is an [`Envelope`]: a request with an id, a response echoing
//! the id, or a one-way notice. Both peers run the same connection type;
//! each side owns its outbound request stream and serves the partner's
//! requests through a [`RequestHandler`].

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::ensure;
use bytes::{Buf, BufMut, BytesMut};
use futures::SinkExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc, oneshot},
};
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::doc::Document;
use crate::peer::PeerId;
use crate::share::ShareAddress;

const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 16;

/// Per-connection handshake salt.
pub type Salt = [u8; 16];

/// Calls a peer can make on its partner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Learn the partner's identity and which shares it holds, salted so
    /// neither side can enumerate shares it does not already know.
    SaltedHandshake {
        /// Caller-chosen salt the responder hashes its share addresses with.
        salt: Salt,
    },
    /// Highest local index per common share.
    AllShareStates,
    /// Highest local index for one share. `other_index` reports how far the
    /// caller has pulled from the responder, so the responder can tell when
    /// the caller has caught up with it.
    GetShareState {
        /// The share in question.
        share: ShareAddress,
        /// Highest responder-side index the caller has ingested.
        other_index: u64,
    },
    /// Documents with `local_index > from_index`, ascending, at most
    /// `limit` (capped by the responder).
    GetDocs {
        /// The share to pull from.
        share: ShareAddress,
        /// Exclusive lower bound on the responder's local index.
        from_index: u64,
        /// Maximum number of documents.
        limit: u32,
    },
}

/// Responses to [`Request`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Reply to [`Request::SaltedHandshake`].
    SaltedHandshake {
        /// The responder's stable peer id.
        peer_id: PeerId,
        /// `blake3(salt || share_address)` for each share the responder holds.
        salted_shares: Vec<[u8; 32]>,
    },
    /// Reply to [`Request::AllShareStates`].
    AllShareStates {
        /// Highest local index per share, restricted to common shares.
        states: BTreeMap<ShareAddress, u64>,
    },
    /// Reply to [`Request::GetShareState`].
    ShareState {
        /// The responder's highest local index for the share.
        highest_local_index: u64,
    },
    /// Reply to [`Request::GetDocs`].
    Docs {
        /// The pulled documents, ascending by the responder's local index.
        docs: Vec<Document>,
    },
    /// The request could not be served.
    Error {
        /// Why.
        message: String,
    },
}

/// One-way events pushed outside the request/response flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Notice {
    /// The sender accepted new documents for a common share.
    ShareUpdated {
        /// The share that grew.
        share: ShareAddress,
        /// The sender's new highest local index.
        highest_local_index: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Envelope {
    Request { id: u64, body: Request },
    Response { id: u64, body: Response },
    Notice(Notice),
}

/// Failure of an RPC operation.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The connection is gone.
    #[error("connection closed")]
    ConnectionClosed,
    /// The partner answered with an error.
    #[error("remote error: {0}")]
    Remote(String),
    /// The partner answered with the wrong response shape.
    #[error("unexpected response")]
    UnexpectedResponse,
}

/// Serves the partner's requests against local state.
pub trait RequestHandler: Send + Sync + 'static {
    /// Answer one request.
    fn handle(&self, request: Request) -> Response;
}

#[derive(Debug, Default)]
struct RpcCodec;

impl Decoder for RpcCodec {
    type Item = Envelope;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let bytes: [u8; 4] = src[..4].try_into().expect("just checked");
        let frame_len = u32::from_be_bytes(bytes) as usize;
        ensure!(
            frame_len <= MAX_MESSAGE_SIZE,
            "received message that is too large: {}",
            frame_len
        );
        if src.len() < 4 + frame_len {
            return Ok(None);
        }

        let envelope: Envelope = postcard::from_bytes(&src[4..4 + frame_len])?;
        src.advance(4 + frame_len);
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for RpcCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = postcard::serialize_with_flavor(&item, postcard::ser_flavors::Size::default())?;
        ensure!(
            len <= MAX_MESSAGE_SIZE,
            "attempting to send message that is too large {}",
            len
        );

        dst.put_u32(u32::try_from(len).expect("already checked"));
        let start = dst.len();
        dst.resize(start + len, 0u8);
        postcard::to_slice(&item, &mut dst[start..])?;

        Ok(())
    }
}

#[derive(Debug)]
struct ConnInner {
    out_tx: mpsc::Sender<Envelope>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    next_request_id: AtomicU64,
    notices: broadcast::Sender<Notice>,
    closed: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// One side of a duplex RPC connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RpcConnection {
    inner: Arc<ConnInner>,
}

impl RpcConnection {
    /// Spawn read/write loops over the stream, serving incoming requests
    /// with `handler`. Must be called from within a tokio runtime.
    pub fn spawn<IO>(io: IO, handler: Arc<dyn RequestHandler>) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let mut framed_read = FramedRead::new(reader, RpcCodec);
        let mut framed_write = FramedWrite::new(writer, RpcCodec);

        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(64);
        let (notices_tx, _) = broadcast::channel(64);

        let inner = Arc::new(ConnInner {
            out_tx,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            notices: notices_tx,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let write_task = tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                if let Err(err) = framed_write.send(envelope).await {
                    debug!(?err, "rpc write failed");
                    break;
                }
            }
        });

        let read_inner = inner.clone();
        let read_task = tokio::spawn(async move {
            while let Some(frame) = framed_read.next().await {
                let envelope = match frame {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        debug!(?err, "rpc read failed");
                        break;
                    }
                };
                match envelope {
                    Envelope::Request { id, body } => {
                        trace!(id, ?body, "rpc request");
                        let response = handler.handle(body);
                        if read_inner
                            .out_tx
                            .send(Envelope::Response { id, body: response })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Envelope::Response { id, body } => {
                        if let Some(reply) = read_inner.pending.lock().remove(&id) {
                            reply.send(body).ok();
                        }
                    }
                    Envelope::Notice(notice) => {
                        read_inner.notices.send(notice).ok();
                    }
                }
            }
            // Fail any callers still waiting for a response.
            read_inner.closed.store(true, Ordering::SeqCst);
            read_inner.pending.lock().clear();
        });

        inner.tasks.lock().extend([write_task, read_task]);
        RpcConnection { inner }
    }

    /// Whether the connection has stopped.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send a request and await the partner's response.
    pub async fn call(&self, request: Request) -> Result<Response, RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        if self
            .inner
            .out_tx
            .send(Envelope::Request { id, body: request })
            .await
            .is_err()
        {
            self.inner.pending.lock().remove(&id);
            return Err(RpcError::ConnectionClosed);
        }

        match rx.await {
            Ok(Response::Error { message }) => Err(RpcError::Remote(message)),
            Ok(response) => Ok(response),
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Push a one-way notice to the partner.
    pub async fn notify(&self, notice: Notice) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        self.inner
            .out_tx
            .send(Envelope::Notice(notice))
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Subscribe to notices pushed by the partner.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    /// Stop the read/write loops and fail pending calls. Idempotent.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.pending.lock().clear();
    }
}
