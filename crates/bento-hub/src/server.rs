// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Unix-socket front end: one reader loop and one writer task per connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bento_kernel::{DispatchError, Dispatcher, PeerHandle, PeerId};
use bento_proto::{decode_message, encode_message, packet_len, ErrorPayload, Message, WireError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Shared state of a running hub.
#[derive(Debug)]
pub struct Hub {
    dispatcher: Dispatcher,
    next_ts: AtomicU64,
}

impl Hub {
    /// Wraps a started dispatcher.
    pub fn new(dispatcher: Dispatcher) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            next_ts: AtomicU64::new(0),
        })
    }

    /// The dispatcher this hub fronts.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn alloc_ts(&self) -> u64 {
        self.next_ts.fetch_add(1, Ordering::Relaxed)
    }

    fn packet(&self, msg: &Message) -> Result<Vec<u8>, WireError> {
        encode_message(msg, self.alloc_ts())
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            let hub = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = handle_client(stream, hub).await {
                    warn!(?err, "client handler error");
                }
            });
        }
    }
}

/// Per-connection state.
struct Session {
    out: UnboundedSender<Vec<u8>>,
    peer: Option<(PeerId, JoinHandle<()>)>,
}

impl Session {
    fn release(&mut self, hub: &Hub) {
        if let Some((id, forwarder)) = self.peer.take() {
            forwarder.abort();
            hub.dispatcher.disconnect(id);
        }
    }
}

async fn handle_client(stream: UnixStream, hub: Arc<Hub>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (out, mut outbox) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(buf) = outbox.recv().await {
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session { out, peer: None };
    let result = read_loop(&mut reader, &mut session, &hub).await;
    session.release(&hub);
    result
}

async fn read_loop(
    reader: &mut (impl AsyncRead + Unpin),
    session: &mut Session,
    hub: &Arc<Hub>,
) -> Result<()> {
    let mut read_buf = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    loop {
        let n = reader.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
        acc.extend_from_slice(&read_buf[..n]);

        // process as many frames as are buffered
        while acc.len() >= bento_proto::wire::HEADER_LEN {
            let frame_len = match packet_len(&acc) {
                Ok(len) => len,
                Err(err) => {
                    warn!(%err, "dropping connection on bad header");
                    return Ok(());
                }
            };
            if acc.len() < frame_len {
                break;
            }
            let packet: Vec<u8> = acc.drain(..frame_len).collect();
            match decode_message(&packet) {
                Ok((msg, _ts, _used)) => handle_message(msg, session, hub).await?,
                Err(err) => {
                    warn!(%err, "failed to decode packet");
                    reply(session, hub, &ErrorPayload::new(ErrorPayload::BAD_REQUEST, err.to_string()))?;
                }
            }
        }
    }
}

// Handle a single inbound message from a connection.
async fn handle_message(msg: Message, session: &mut Session, hub: &Arc<Hub>) -> Result<()> {
    match msg {
        Message::Init { scopes } => {
            session.release(hub);
            match hub.dispatcher.connect(scopes).await {
                Ok(handle) => {
                    let id = handle.id;
                    let forwarder = forward(Arc::clone(hub), handle, session.out.clone());
                    session.peer = Some((id, forwarder));
                }
                Err(err) => reply(session, hub, &error_payload(&err))?,
            }
        }
        Message::Action { name, payload } => match hub.dispatcher.dispatch(&name, payload).await {
            Ok(outcome) => debug!(action = %name, ?outcome, "action applied"),
            Err(err) => reply(session, hub, &error_payload(&err))?,
        },
        Message::Emit { .. } | Message::Error(_) => {
            // hub-originated frames; peers may not send them
            let payload = ErrorPayload::new(
                ErrorPayload::BAD_REQUEST,
                format!("{} frames are sent by the hub only", msg.op()),
            );
            reply(session, hub, &payload)?;
        }
    }
    Ok(())
}

fn reply(session: &Session, hub: &Hub, payload: &ErrorPayload) -> Result<()> {
    let pkt = hub.packet(&Message::Error(payload.clone()))?;
    // writer gone means the peer hung up; the reader will see EOF
    let _ = session.out.send(pkt);
    Ok(())
}

fn forward(hub: Arc<Hub>, mut handle: PeerHandle, out: UnboundedSender<Vec<u8>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(emit) = handle.emits.recv().await {
            let pkt = match hub.packet(&Message::Emit {
                patches: emit.patches,
            }) {
                Ok(pkt) => pkt,
                Err(err) => {
                    error!(%err, peer = %handle.id, "cannot encode emit; closing stream");
                    break;
                }
            };
            if out.send(pkt).is_err() {
                break;
            }
        }
    })
}

/// Maps a dispatch failure onto the error frame sent to the requesting peer.
pub fn error_payload(err: &DispatchError) -> ErrorPayload {
    let kind = match err {
        DispatchError::UnknownAction(_) => ErrorPayload::UNKNOWN_ACTION,
        DispatchError::Transaction { .. } | DispatchError::StateCorruption { .. } => {
            ErrorPayload::ACTION_FAILED
        }
        _ if err.is_fatal() => ErrorPayload::UNAVAILABLE,
        _ => ErrorPayload::ACTION_FAILED,
    };
    ErrorPayload::new(kind, err.to_string())
}
