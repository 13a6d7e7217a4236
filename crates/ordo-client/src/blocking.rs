// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Blocking client: one socket, one reader thread, one dispatch worker.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;

use ordo_archiver::ZERO_TOLERANCE;
use ordo_proto::wire::{decode_message, encode_message, frame_len, WireError, HEADER_BYTES};
use ordo_proto::{
    BlobType, ClientId, ControlOp, DataMessage, Message, Tag, Template, Tick, Transaction, Tuple,
};
use tracing::{debug, error, warn};

use crate::dispatch::{MatchStream, Notifier, Worker, WorkerHandle};
use crate::ClientError;

/// Which part of the stream the replica follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Everything (a full replica).
    All,
    /// Only messages carrying one of these tags.
    Tags(Vec<Tag>),
}

/// Settings for [`Client::connect`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Identifier stamped on outgoing transactions.
    pub client_id: ClientId,
    /// What to subscribe to after the greeting.
    pub subscription: Subscription,
    /// Tags attached to every committed transaction.
    pub publish_tags: Vec<Tag>,
    /// Ask the sequencer to reflect each commit back.
    pub reflect: bool,
    /// Zero tolerance of the local replica.
    pub zero_tolerance: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: 0,
            subscription: Subscription::All,
            publish_tags: Vec::new(),
            reflect: false,
            zero_tolerance: ZERO_TOLERANCE,
        }
    }
}

/// Connected tuplespace client.
///
/// Writes go to the sequencer; reads are answered by the local replica once
/// the sequenced transaction comes back. A client therefore reads its own
/// writes only when its subscription covers them.
pub struct Client {
    stream: Mutex<UnixStream>,
    blob: BlobType,
    options: ClientOptions,
    local_tick: AtomicU64,
    worker: WorkerHandle,
}

impl Client {
    /// Connect, read the greeting, subscribe, and start replaying. Returns once
    /// the subscription is acknowledged.
    pub fn connect(path: impl AsRef<Path>, options: ClientOptions) -> Result<Self, ClientError> {
        let mut stream = UnixStream::connect(path)?;
        let greeting = match read_message(&mut stream)? {
            Some((Message::Greeting(g), _)) => g,
            Some((other, _)) => return Err(ClientError::NoGreeting(other.op_name())),
            None => return Err(ClientError::Disconnected),
        };
        debug!(tick = greeting.tick, blob = %greeting.blob, "greeted");

        let worker = Worker::spawn_from(greeting.tick, options.zero_tolerance);
        let op = match &options.subscription {
            Subscription::All => ControlOp::SubscribeAll,
            Subscription::Tags(tags) => ControlOp::Subscribe(tags.clone()),
        };
        stream.write_all(&encode_message(&Message::Control(op), 0)?)?;
        // nothing is routed to us before the ack, so replay starts clean
        loop {
            match read_message(&mut stream)? {
                Some((Message::Control(ack), ts)) => {
                    debug!(op = ack.name(), ts, "subscribed");
                    break;
                }
                Some((other, _)) => warn!(op = other.op_name(), "frame before subscribe ack"),
                None => return Err(ClientError::Disconnected),
            }
        }

        let reader = stream.try_clone()?;
        let replay = worker.clone();
        thread::spawn(move || read_loop(reader, greeting.blob, &replay));

        Ok(Self {
            stream: Mutex::new(stream),
            blob: greeting.blob,
            options,
            local_tick: AtomicU64::new(0),
            worker,
        })
    }

    /// Insert `tuples` (one transaction).
    pub fn write(&self, tuples: impl IntoIterator<Item = Tuple>) -> Result<Tick, ClientError> {
        self.commit(&Transaction::write(tuples))
    }

    /// Submit `txn` for sequencing. Returns the local tick it was sent with.
    pub fn commit(&self, txn: &Transaction) -> Result<Tick, ClientError> {
        let local_tick = self.local_tick.fetch_add(1, Ordering::Relaxed) + 1;
        let mut msg =
            DataMessage::with_transaction(self.options.client_id, local_tick, self.blob, txn)?;
        msg.tags.clone_from(&self.options.publish_tags);
        msg.reflect = self.options.reflect;
        let pkt = encode_message(&Message::Data(msg), 0)?;
        let mut stream = self.stream.lock().map_err(|_| ClientError::Closed)?;
        stream.write_all(&pkt)?;
        Ok(local_tick)
    }

    /// Block until a tuple matching `template` is present.
    pub fn read(&self, template: Template) -> Result<Tuple, ClientError> {
        self.worker.read(template)
    }

    /// A tuple matching `template` if one is present now.
    pub fn read_nowait(&self, template: Template) -> Result<Option<Tuple>, ClientError> {
        self.worker.read_nowait(template)
    }

    /// Current and future matches of `template`.
    pub fn read_all(&self, template: Template) -> Result<MatchStream, ClientError> {
        self.worker.read_all(template)
    }

    /// Applied-transaction events.
    pub fn notifier(&self) -> Result<Notifier, ClientError> {
        self.worker.notifier()
    }

    /// Last tick applied to the local replica.
    pub fn last_tick(&self) -> Tick {
        self.worker.last_tick()
    }

    /// Blob encoding announced by the sequencer.
    pub fn blob(&self) -> BlobType {
        self.blob
    }

    /// The dispatch worker behind this client.
    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // unblocks the reader thread, which then closes the flow
        if let Ok(stream) = self.stream.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn read_message(stream: &mut UnixStream) -> Result<Option<(Message, Tick)>, ClientError> {
    let mut header = [0u8; HEADER_BYTES];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let total = frame_len(&header)?.ok_or(WireError::Incomplete)?;
    let mut packet = vec![0u8; total];
    packet[..HEADER_BYTES].copy_from_slice(&header);
    stream.read_exact(&mut packet[HEADER_BYTES..])?;
    let (msg, ts, _) = decode_message(&packet)?;
    Ok(Some((msg, ts)))
}

fn read_loop(mut stream: UnixStream, blob: BlobType, worker: &WorkerHandle) {
    loop {
        match read_message(&mut stream) {
            Ok(Some((Message::Data(msg), _))) => {
                let txn = match msg.transaction(blob) {
                    Ok(txn) => txn,
                    Err(err) => {
                        error!(%err, tick = msg.global_tick, "undecodable transaction; closing flow");
                        break;
                    }
                };
                if worker.apply(msg.global_tick, msg.client_id, txn).is_err() {
                    break;
                }
            }
            Ok(Some((Message::Control(op), ts))) => debug!(op = op.name(), ts, "control ack"),
            Ok(Some((Message::Reflect(ack), _))) => debug!(
                local = ack.local_tick,
                global = ack.global_tick,
                "reflected"
            ),
            Ok(Some((Message::Greeting(_), _))) => warn!("unexpected second greeting"),
            Ok(None) => break,
            Err(err) => {
                debug!(%err, "connection closed");
                break;
            }
        }
    }
    worker.close();
}
