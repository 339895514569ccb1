// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client helper for talking to the Bento hub over Unix sockets
//! (CBOR-framed), with a local replica of the subscribed state.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path as FsPath;
use std::sync::mpsc::{self, Receiver};
use std::thread;

use anyhow::Result;
use bento_core::{Path, Replica, Value};
use bento_proto::wire::HEADER_LEN;
use bento_proto::{decode_message, encode_message, packet_len, ErrorPayload, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream as AsyncUnixStream;
use tracing::debug;

/// Async client over Unix sockets.
#[derive(Debug)]
pub struct BentoClient {
    stream: AsyncUnixStream,
    replica: Replica,
}

impl BentoClient {
    /// Connect to the hub at the given Unix socket path.
    pub async fn connect(path: impl AsRef<FsPath>) -> Result<Self> {
        let stream = AsyncUnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: AsyncUnixStream) -> Self {
        Self {
            stream,
            replica: Replica::default(),
        }
    }

    /// Register subscription scopes. The hub answers with the initial view.
    pub async fn init(&mut self, scopes: Vec<Path>) -> Result<()> {
        self.send(&Message::Init { scopes }).await
    }

    /// Invoke a registered action on the hub.
    pub async fn act(&mut self, name: &str, payload: impl Into<Value>) -> Result<()> {
        self.send(&Message::Action {
            name: name.to_owned(),
            payload: payload.into(),
        })
        .await
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        let pkt = encode_message(msg, 0)?;
        self.stream.write_all(&pkt).await?;
        Ok(())
    }

    /// Read the next frame. Emitted patches are applied to the replica before
    /// the message is returned. Returns `Ok(None)` when the stream is closed
    /// before any bytes are read.
    pub async fn poll_message(&mut self) -> Result<Option<Message>> {
        let mut header = [0u8; HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.stream.read(&mut header[read..]).await?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("truncated frame header: read {read} of {HEADER_LEN} bytes"),
                )
                .into());
            }
            read += n;
        }
        let total = packet_len(&header)?;
        let mut packet = vec![0u8; total];
        packet[..HEADER_LEN].copy_from_slice(&header);
        self.stream.read_exact(&mut packet[HEADER_LEN..]).await?;
        let (msg, ts, _) = decode_message(&packet)?;
        debug!(op = msg.op(), ts, "frame received");
        if let Message::Emit { patches } = &msg {
            self.replica.apply(patches);
        }
        Ok(Some(msg))
    }

    /// Read frames until the next emit; hub errors surface as `Err`.
    pub async fn next_emit(&mut self) -> Result<Option<Vec<bento_core::Patch>>> {
        while let Some(msg) = self.poll_message().await? {
            match msg {
                Message::Emit { patches } => return Ok(Some(patches)),
                Message::Error(err) => anyhow::bail!("{}: {}", err.name, err.message),
                Message::Init { .. } | Message::Action { .. } => {}
            }
        }
        Ok(None)
    }

    /// Local mirror of the subscribed state.
    pub fn state(&self) -> &Value {
        self.replica.state()
    }

    /// Expose the underlying stream (e.g., for select!).
    pub fn stream(&mut self) -> &mut AsyncUnixStream {
        &mut self.stream
    }
}

/// Blocking helper: connect, subscribe to `scopes`, and stream replica states
/// and hub errors on a background thread. On connection failure the receivers
/// stay empty and disconnect.
pub fn connect_channels(
    path: impl AsRef<FsPath>,
    scopes: Vec<Path>,
) -> (Receiver<Value>, Receiver<ErrorPayload>) {
    let (state_tx, state_rx) = mpsc::channel();
    let (err_tx, err_rx) = mpsc::channel();
    let path = path.as_ref().to_path_buf();

    thread::spawn(move || {
        let Ok(mut stream) = UnixStream::connect(path) else {
            return;
        };
        let Ok(init) = encode_message(&Message::Init { scopes }, 0) else {
            return;
        };
        if stream.write_all(&init).is_err() {
            return;
        }
        let mut replica = Replica::default();
        loop {
            let mut header = [0u8; HEADER_LEN];
            if stream.read_exact(&mut header).is_err() {
                break;
            }
            let Ok(total) = packet_len(&header) else {
                break;
            };
            let mut packet = vec![0u8; total];
            packet[..HEADER_LEN].copy_from_slice(&header);
            if stream.read_exact(&mut packet[HEADER_LEN..]).is_err() {
                break;
            }
            match decode_message(&packet) {
                Ok((Message::Emit { patches }, _, _)) => {
                    replica.apply(&patches);
                    if state_tx.send(replica.state().clone()).is_err() {
                        break;
                    }
                }
                Ok((Message::Error(err), _, _)) => {
                    let _ = err_tx.send(err);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (state_rx, err_rx)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use bento_core::Patch;

    #[tokio::test]
    async fn split_frames_reassemble_into_the_replica() {
        let (ours, mut theirs) = AsyncUnixStream::pair().unwrap();
        let mut client = BentoClient::from_stream(ours);

        let first = encode_message(
            &Message::Emit {
                patches: vec![Patch::set(["count"], 0)],
            },
            0,
        )
        .unwrap();
        let second = encode_message(
            &Message::Emit {
                patches: vec![Patch::set(["count"], 1), Patch::set(["obs", "scene"], "intro")],
            },
            1,
        )
        .unwrap();
        let mut bytes = first;
        bytes.extend_from_slice(&second);

        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(5) {
                theirs.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            theirs
        });

        assert_eq!(client.next_emit().await.unwrap().unwrap().len(), 1);
        assert_eq!(client.next_emit().await.unwrap().unwrap().len(), 2);
        let theirs = writer.await.unwrap();
        drop(theirs);
        assert!(client.poll_message().await.unwrap().is_none());

        let state = client.state();
        assert_eq!(state.at(&["count"].into()), Some(&Value::from(1)));
        assert_eq!(state.at(&["obs", "scene"].into()), Some(&Value::from("intro")));
    }

    #[tokio::test]
    async fn hub_errors_surface_from_next_emit() {
        let (ours, mut theirs) = AsyncUnixStream::pair().unwrap();
        let mut client = BentoClient::from_stream(ours);
        let err = ErrorPayload::new(ErrorPayload::UNKNOWN_ACTION, "unknown action \"nope\"");
        theirs
            .write_all(&encode_message(&Message::Error(err), 0).unwrap())
            .await
            .unwrap();
        let failure = client.next_emit().await.unwrap_err();
        assert!(failure.to_string().starts_with("E_UNKNOWN_ACTION"));
    }
}
