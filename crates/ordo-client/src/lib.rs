// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client side of the Ordo tuplespace: talk to the sequencer over Unix
//! sockets (CBOR-framed) and serve local reads from a replayed replica.
//!
//! - [`SequencerClient`]: thin async connection (tokio).
//! - [`dispatch`]: the worker thread that owns the replica and wakes readers.
//! - [`Client`]: blocking facade wiring a connection to a worker.

use ordo_proto::{
    wire::{decode_message, encode_message, frame_len, WireError, HEADER_BYTES},
    BlobType, ControlOp, DataMessage, Greeting, Message, Tag, Tick,
};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream as AsyncUnixStream;

mod blocking;
pub mod dispatch;
mod error;

pub use blocking::{Client, ClientOptions, Subscription};
pub use dispatch::{
    MatchCloser, MatchStream, Notifier, NotifyEvent, Waiter, Worker, WorkerHandle,
};
pub use error::ClientError;

/// Minimal async client over Unix sockets.
pub struct SequencerClient {
    stream: AsyncUnixStream,
    greeting: Greeting,
}

impl SequencerClient {
    /// Connect to the sequencer and read its greeting.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = AsyncUnixStream::connect(path).await?;
        Self::from_stream(stream).await
    }

    /// Wrap an already-connected stream; the greeting must be the next frame.
    pub async fn from_stream(stream: AsyncUnixStream) -> Result<Self, ClientError> {
        let mut client = Self {
            stream,
            greeting: Greeting {
                blob: BlobType::default(),
                tick: 0,
            },
        };
        match client.poll_message().await? {
            Some((Message::Greeting(greeting), _)) => {
                client.greeting = greeting;
                Ok(client)
            }
            Some((other, _)) => Err(ClientError::NoGreeting(other.op_name())),
            None => Err(ClientError::Disconnected),
        }
    }

    /// Greeting received on connect.
    pub fn greeting(&self) -> Greeting {
        self.greeting
    }

    async fn send(&mut self, msg: &Message) -> Result<(), ClientError> {
        let pkt = encode_message(msg, 0)?;
        self.stream.write_all(&pkt).await?;
        Ok(())
    }

    /// Receive every data message.
    pub async fn subscribe_all(&mut self) -> Result<(), ClientError> {
        self.send(&Message::Control(ControlOp::SubscribeAll)).await
    }

    /// Receive data messages tagged with any of `tags`.
    pub async fn subscribe(&mut self, tags: Vec<Tag>) -> Result<(), ClientError> {
        self.send(&Message::Control(ControlOp::Subscribe(tags)))
            .await
    }

    /// Undo [`SequencerClient::subscribe_all`].
    pub async fn unsubscribe_all(&mut self) -> Result<(), ClientError> {
        self.send(&Message::Control(ControlOp::UnsubscribeAll))
            .await
    }

    /// Stop receiving `tags`.
    pub async fn unsubscribe(&mut self, tags: Vec<Tag>) -> Result<(), ClientError> {
        self.send(&Message::Control(ControlOp::Unsubscribe(tags)))
            .await
    }

    /// Submit a data message for sequencing.
    pub async fn send_data(&mut self, msg: DataMessage) -> Result<(), ClientError> {
        self.send(&Message::Data(msg)).await
    }

    /// Read one message with the tick it was stamped with. Returns Ok(None) when the stream is closed before any bytes are read.
    /// Reads until a full frame header is buffered so short reads cannot desynchronize framing.
    pub async fn poll_message(&mut self) -> Result<Option<(Message, Tick)>, ClientError> {
        let mut header = [0u8; HEADER_BYTES];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.stream.read(&mut header[read..]).await?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "truncated frame header: read {} of {} bytes",
                        read,
                        header.len()
                    ),
                )
                .into());
            }
            read += n;
        }
        let total = frame_len(&header)?.ok_or(WireError::Incomplete)?;
        let mut packet = vec![0u8; total];
        packet[..HEADER_BYTES].copy_from_slice(&header);
        self.stream.read_exact(&mut packet[HEADER_BYTES..]).await?;
        let (msg, ts, _) = decode_message(&packet)?;
        Ok(Some((msg, ts)))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use ordo_proto::{tuple, ReflectAck, Transaction};
    use tokio::task;

    fn greeting_pkt(tick: Tick) -> Vec<u8> {
        encode_message(
            &Message::Greeting(Greeting {
                blob: BlobType::Json,
                tick,
            }),
            tick,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn poll_message_handles_partial_header_without_losing_bytes() {
        let (client_stream, mut server_stream) = AsyncUnixStream::pair().unwrap();

        let ack = ReflectAck {
            client_id: 3,
            local_tick: 8,
            global_tick: 42,
        };
        let encoded = encode_message(&Message::Reflect(ack), 42).unwrap();

        let client_task = task::spawn(async move {
            let mut client = SequencerClient {
                stream: client_stream,
                greeting: Greeting {
                    blob: BlobType::Cbor,
                    tick: 0,
                },
            };
            client.poll_message().await
        });

        server_stream.write_all(&encoded[..5]).await.unwrap();
        task::yield_now().await;
        server_stream.write_all(&encoded[5..]).await.unwrap();

        match client_task.await.unwrap().unwrap() {
            Some((Message::Reflect(r), 42)) => assert_eq!(r, ack),
            other => panic!("expected reflect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_reads_greeting_first() {
        let (client_stream, mut server_stream) = AsyncUnixStream::pair().unwrap();
        server_stream.write_all(&greeting_pkt(17)).await.unwrap();
        let client = SequencerClient::from_stream(client_stream).await.unwrap();
        assert_eq!(
            client.greeting(),
            Greeting {
                blob: BlobType::Json,
                tick: 17
            }
        );
    }

    #[tokio::test]
    async fn non_greeting_first_frame_is_rejected() {
        let (client_stream, mut server_stream) = AsyncUnixStream::pair().unwrap();
        let pkt = encode_message(&Message::Control(ControlOp::SubscribeAll), 0).unwrap();
        server_stream.write_all(&pkt).await.unwrap();
        assert!(matches!(
            SequencerClient::from_stream(client_stream).await,
            Err(ClientError::NoGreeting("control"))
        ));
    }

    #[tokio::test]
    async fn outbound_frames_decode_on_the_other_side() {
        let (client_stream, mut server_stream) = AsyncUnixStream::pair().unwrap();
        server_stream.write_all(&greeting_pkt(0)).await.unwrap();
        let mut client = SequencerClient::from_stream(client_stream).await.unwrap();

        let txn = Transaction::write([tuple!["hi"]]);
        let data = DataMessage::with_transaction(1, 1, BlobType::Json, &txn).unwrap();
        client.subscribe(vec!["t".into()]).await.unwrap();
        client.send_data(data.clone()).await.unwrap();

        let mut server = SequencerClient {
            stream: server_stream,
            greeting: client.greeting(),
        };
        assert_eq!(
            server.poll_message().await.unwrap(),
            Some((Message::Control(ControlOp::Subscribe(vec!["t".into()])), 0))
        );
        assert_eq!(
            server.poll_message().await.unwrap(),
            Some((Message::Data(data), 0))
        );
    }
}
