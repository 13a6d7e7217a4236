// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Unix-socket transport around [`Sequencer`].
//!
//! One control task owns the sequencer and handles accepts and inbound
//! frames one at a time. Each connection gets a reader task (framing and
//! decode) and a writer task (draining its outbox).

use crate::sequencer::{ConnId, Sequencer, SequencerConfig};
use anyhow::Result;
use ordo_proto::wire::{decode_message, FrameBuffer};
use ordo_proto::{Message, Tick};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Fatal control-loop failure. Carries the last tick handed out so the
/// caller can still persist it.
#[derive(Debug, thiserror::Error)]
#[error("sequencer stopped at tick {tick}: {error:#}")]
pub struct ServiceError {
    /// Last tick assigned before the failure.
    pub tick: Tick,
    /// What went wrong.
    pub error: anyhow::Error,
}

impl ServiceError {
    fn at(seq: &Sequencer, error: impl Into<anyhow::Error>) -> Self {
        Self {
            tick: seq.tick(),
            error: error.into(),
        }
    }
}

enum Event {
    Frame(ConnId, Message),
    Closed(ConnId),
}

/// Sequencer bound to a listener and/or a set of pre-connected streams.
pub struct SequencerService {
    config: SequencerConfig,
    listener: Option<UnixListener>,
    initial: Vec<UnixStream>,
}

impl SequencerService {
    /// Service accepting on `listener` (if any).
    pub fn new(config: SequencerConfig, listener: Option<UnixListener>) -> Self {
        Self {
            config,
            listener,
            initial: Vec::new(),
        }
    }

    /// Register an already-connected stream when the service starts.
    pub fn attach(&mut self, stream: UnixStream) {
        self.initial.push(stream);
    }

    /// Spawn the control loop on the current runtime.
    pub fn start(self) -> ServiceHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(shutdown_rx));
        ServiceHandle {
            shutdown: Some(shutdown_tx),
            join,
        }
    }

    /// Run until `shutdown` fires (or its sender is dropped). Returns the
    /// last tick handed out, on failure inside the [`ServiceError`].
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<Tick, ServiceError> {
        let mut seq = Sequencer::new(self.config);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<Event>();
        let mut readers: HashMap<ConnId, AbortHandle> = HashMap::new();

        for stream in self.initial {
            connect(&mut seq, &mut readers, stream, &ev_tx)
                .map_err(|err| ServiceError::at(&seq, err))?;
        }
        info!(tick = seq.tick(), blob = %self.config.blob, "sequencer running");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = accept(self.listener.as_ref()) => match accepted {
                    Ok(stream) => connect(&mut seq, &mut readers, stream, &ev_tx)
                        .map_err(|err| ServiceError::at(&seq, err))?,
                    Err(err) => {
                        error!(?err, tick = seq.tick(), "accept failed");
                        return Err(ServiceError::at(&seq, err));
                    }
                },
                Some(ev) = ev_rx.recv() => match ev {
                    Event::Frame(conn, msg) => {
                        if let Err(err) = seq.handle(conn, msg) {
                            error!(?err, conn, tick = seq.tick(), "sequencer loop failed");
                            return Err(ServiceError::at(&seq, err));
                        }
                    }
                    Event::Closed(conn) => {
                        readers.remove(&conn);
                        seq.reject(conn);
                    }
                },
            }
            for conn in seq.drain_rejected() {
                if let Some(reader) = readers.remove(&conn) {
                    reader.abort();
                }
            }
        }

        for reader in readers.into_values() {
            reader.abort();
        }
        info!(tick = seq.tick(), "sequencer stopped");
        Ok(seq.tick())
    }
}

/// Running service.
pub struct ServiceHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<Tick, ServiceError>>,
}

impl ServiceHandle {
    /// Ask the control loop to exit; resolves to the final tick.
    pub async fn stop(mut self) -> Result<Tick> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        Ok(self.join.await??)
    }
}

async fn accept(listener: Option<&UnixListener>) -> std::io::Result<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

fn connect(
    seq: &mut Sequencer,
    readers: &mut HashMap<ConnId, AbortHandle>,
    stream: UnixStream,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let Some(conn) = seq.register(tx)? else {
        return Ok(());
    };
    tokio::spawn(write_loop(conn, writer, rx, events.clone()));
    let task = tokio::spawn(read_loop(conn, reader, events.clone()));
    readers.insert(conn, task.abort_handle());
    Ok(())
}

async fn write_loop(
    conn: ConnId,
    mut writer: tokio::net::unix::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(buf) = rx.recv().await {
        if let Err(err) = writer.write_all(&buf).await {
            debug!(?err, conn, "write failed");
            let _ = events.send(Event::Closed(conn));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    conn: ConnId,
    mut reader: tokio::net::unix::OwnedReadHalf,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut read_buf = vec![0u8; 16 * 1024];
    let mut frames = FrameBuffer::new();
    'read: loop {
        let n = match reader.read(&mut read_buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(?err, conn, "read failed");
                break;
            }
        };
        frames.extend(&read_buf[..n]);
        loop {
            let packet = match frames.next_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(err) => {
                    warn!(?err, conn, "bad frame; closing");
                    break 'read;
                }
            };
            match decode_message(&packet) {
                Ok((msg, _ts, _)) => {
                    if events.send(Event::Frame(conn, msg)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(?err, conn, "failed to decode packet; closing");
                    break 'read;
                }
            }
        }
    }
    let _ = events.send(Event::Closed(conn));
}
