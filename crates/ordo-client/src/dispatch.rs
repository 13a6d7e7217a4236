// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client-side dispatch: one worker thread owns the local replica and every
//! registration, and hands matching tuples to the threads waiting on them.
//!
//! Three kinds of registration exist:
//!
//! - [`Waiter`]: one-shot, blocks until a matching tuple exists.
//! - matcher: either a probe ([`WorkerHandle::read_nowait`]) answered at once,
//!   or a stream ([`MatchStream`]) of current and future matches.
//! - [`Notifier`]: every applied transaction, toggled on and off.
//!
//! Application threads only ever block on their own channel. Registrations
//! are mutated exclusively by the worker, which processes commands in
//! arrival order; a command sent after [`WorkerHandle::apply`] observes the
//! applied state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use ordo_archiver::{ArchiveError, Archiver};
use ordo_proto::{ClientId, Template, Tick, Transaction, Tuple};
use tracing::{debug, error};

use crate::ClientError;

type RegId = u64;

/// One applied transaction, as seen by notifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEvent {
    /// Tick the sequencer assigned.
    pub global_tick: Tick,
    /// Client that committed the transaction.
    pub client_id: ClientId,
    /// Tuples removed.
    pub deletes: Vec<Tuple>,
    /// Tuples added.
    pub inserts: Vec<Tuple>,
}

enum Registration {
    Waiter {
        template: Template,
        tx: Sender<Tuple>,
    },
    Probe {
        template: Template,
        tx: Sender<Option<Tuple>>,
    },
    All {
        template: Template,
        tx: Sender<Option<Tuple>>,
    },
    Notifier {
        tx: Sender<NotifyEvent>,
    },
}

enum Command {
    Register(RegId, Registration),
    Unregister(RegId),
    SetNotifier(RegId, bool),
    Apply {
        tick: Tick,
        client_id: ClientId,
        txn: Transaction,
    },
    CloseMatcher(RegId),
    CloseFlow,
}

struct NotifierSlot {
    tx: Sender<NotifyEvent>,
    active: bool,
}

enum Live {
    Waiter(Template, Sender<Tuple>),
    All(Template, Sender<Option<Tuple>>),
}

/// Owner of the local replica. Only reachable through a [`WorkerHandle`].
pub struct Worker {
    archiver: Archiver,
    live: BTreeMap<RegId, Live>,
    notifiers: BTreeMap<RegId, NotifierSlot>,
    shared: Arc<Shared>,
    halted: bool,
}

struct Shared {
    next_id: AtomicU64,
    tick: AtomicU64,
    failure: OnceLock<ArchiveError>,
}

impl Worker {
    /// Spawn a worker whose replica starts empty at tick 0.
    pub fn spawn(zero_tolerance: usize) -> WorkerHandle {
        Self::spawn_from(0, zero_tolerance)
    }

    /// Spawn a worker whose replica starts empty at `tick` (the greeting tick
    /// of a fresh connection).
    pub fn spawn_from(tick: Tick, zero_tolerance: usize) -> WorkerHandle {
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(0),
            tick: AtomicU64::new(tick),
            failure: OnceLock::new(),
        });
        let (tx, rx) = mpsc::channel();
        let worker = Self {
            archiver: Archiver::new(tick, zero_tolerance),
            live: BTreeMap::new(),
            notifiers: BTreeMap::new(),
            shared: shared.clone(),
            halted: false,
        };
        thread::spawn(move || worker.run(&rx));
        WorkerHandle { tx, shared }
    }

    fn run(mut self, rx: &Receiver<Command>) {
        while let Ok(cmd) = rx.recv() {
            match cmd {
                Command::Register(id, reg) => self.register(id, reg),
                Command::Unregister(id) => {
                    self.live.remove(&id);
                    self.notifiers.remove(&id);
                }
                Command::SetNotifier(id, active) => {
                    if let Some(slot) = self.notifiers.get_mut(&id) {
                        slot.active = active;
                    }
                }
                Command::Apply {
                    tick,
                    client_id,
                    txn,
                } => self.apply(tick, client_id, txn),
                Command::CloseMatcher(id) => {
                    if let Some(Live::All(_, tx)) = self.live.remove(&id) {
                        let _ = tx.send(None);
                    }
                }
                Command::CloseFlow => break,
            }
        }
        self.end_all();
        debug!(tick = self.archiver.tick(), "dispatch worker stopped");
    }

    fn register(&mut self, id: RegId, reg: Registration) {
        if self.halted {
            // dropping the sender reports the halt to the caller
            return;
        }
        let space = self.archiver.space();
        match reg {
            Registration::Waiter { template, tx } => match space.find_template(&template) {
                Some(tuple) => {
                    let _ = tx.send(tuple);
                }
                None => {
                    self.live.insert(id, Live::Waiter(template, tx));
                }
            },
            Registration::Probe { template, tx } => {
                let _ = tx.send(space.find_template(&template));
            }
            Registration::All { template, tx } => {
                for tuple in space.matches(&template) {
                    if tx.send(Some(tuple)).is_err() {
                        return;
                    }
                }
                self.live.insert(id, Live::All(template, tx));
            }
            Registration::Notifier { tx } => {
                self.notifiers.insert(id, NotifierSlot { tx, active: true });
            }
        }
    }

    fn apply(&mut self, tick: Tick, client_id: ClientId, txn: Transaction) {
        if self.halted {
            return;
        }
        if let Err(err) = self.archiver.apply(tick, &txn) {
            error!(%err, tick, "archive contract violated; halting replay");
            let _ = self.shared.failure.set(err);
            self.halted = true;
            self.end_all();
            return;
        }
        self.shared.tick.store(tick, Ordering::Release);

        let event = NotifyEvent {
            global_tick: tick,
            client_id,
            deletes: txn.deletes,
            inserts: txn.inserts,
        };
        self.notifiers
            .retain(|_, slot| !slot.active || slot.tx.send(event.clone()).is_ok());

        for tuple in &event.inserts {
            self.offer(tuple);
        }
    }

    fn offer(&mut self, tuple: &Tuple) {
        self.live.retain(|_, reg| match reg {
            Live::Waiter(template, tx) => {
                if template.matches(tuple) {
                    let _ = tx.send(tuple.clone());
                    false
                } else {
                    true
                }
            }
            Live::All(template, tx) => {
                !template.matches(tuple) || tx.send(Some(tuple.clone())).is_ok()
            }
        });
    }

    fn end_all(&mut self) {
        for (_, reg) in std::mem::take(&mut self.live) {
            if let Live::All(_, tx) = reg {
                let _ = tx.send(None);
            }
        }
        self.notifiers.clear();
    }
}

/// Cheap, cloneable access to a running [`Worker`].
#[derive(Clone)]
pub struct WorkerHandle {
    tx: Sender<Command>,
    shared: Arc<Shared>,
}

impl WorkerHandle {
    fn next_id(&self) -> RegId {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.tx.send(cmd).map_err(|_| self.gone())
    }

    /// Error for a caller whose channel went silent: the halt if there was
    /// one, plain closure otherwise.
    fn gone(&self) -> ClientError {
        match self.failure() {
            Some(err) => ClientError::Halted(err),
            None => ClientError::Closed,
        }
    }

    /// Apply the transaction the sequencer stamped with `tick`.
    pub fn apply(
        &self,
        tick: Tick,
        client_id: ClientId,
        txn: Transaction,
    ) -> Result<(), ClientError> {
        self.send(Command::Apply {
            tick,
            client_id,
            txn,
        })
    }

    /// Last tick applied to the replica.
    pub fn last_tick(&self) -> Tick {
        self.shared.tick.load(Ordering::Acquire)
    }

    /// The violation that halted replay, if any.
    pub fn failure(&self) -> Option<ArchiveError> {
        self.shared.failure.get().cloned()
    }

    /// Register a one-shot waiter for `template`.
    pub fn waiter(&self, template: Template) -> Result<Waiter, ClientError> {
        let id = self.next_id();
        let (tx, rx) = mpsc::channel();
        self.send(Command::Register(id, Registration::Waiter { template, tx }))?;
        Ok(Waiter {
            id,
            rx,
            handle: self.clone(),
        })
    }

    /// Block until a tuple matching `template` is present, then return it.
    pub fn read(&self, template: Template) -> Result<Tuple, ClientError> {
        self.waiter(template)?.wait()
    }

    /// A tuple matching `template` if one is present right now.
    pub fn read_nowait(&self, template: Template) -> Result<Option<Tuple>, ClientError> {
        let (tx, rx) = mpsc::channel();
        self.send(Command::Register(
            self.next_id(),
            Registration::Probe { template, tx },
        ))?;
        rx.recv().map_err(|_| self.gone())
    }

    /// Every present match (with multiplicity), then each later one, until
    /// the stream is closed.
    pub fn read_all(&self, template: Template) -> Result<MatchStream, ClientError> {
        let id = self.next_id();
        let (tx, rx) = mpsc::channel();
        self.send(Command::Register(id, Registration::All { template, tx }))?;
        Ok(MatchStream {
            rx,
            done: false,
            closer: MatchCloser {
                id,
                tx: self.tx.clone(),
            },
        })
    }

    /// Subscribe to applied transactions. Starts active.
    pub fn notifier(&self) -> Result<Notifier, ClientError> {
        let id = self.next_id();
        let (tx, rx) = mpsc::channel();
        self.send(Command::Register(id, Registration::Notifier { tx }))?;
        Ok(Notifier {
            id,
            rx,
            active: true,
            tx: self.tx.clone(),
        })
    }

    /// End the flow: every stream ends, waiters fail with
    /// [`ClientError::Closed`], and the worker thread exits.
    pub fn close(&self) {
        let _ = self.tx.send(Command::CloseFlow);
    }
}

/// Pending one-shot read. Dropping it withdraws the registration.
pub struct Waiter {
    id: RegId,
    rx: Receiver<Tuple>,
    handle: WorkerHandle,
}

impl Waiter {
    /// Block until the match arrives.
    pub fn wait(self) -> Result<Tuple, ClientError> {
        self.rx.recv().map_err(|_| self.handle.gone())
    }

    /// Like [`Waiter::wait`] but gives up after `timeout`, keeping the
    /// registration alive.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<Tuple>, ClientError> {
        match self.rx.recv_timeout(timeout) {
            Ok(tuple) => Ok(Some(tuple)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.handle.gone()),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(Command::Unregister(self.id));
    }
}

/// Lazy stream of matches. Ends when closed or when the flow closes.
pub struct MatchStream {
    rx: Receiver<Option<Tuple>>,
    done: bool,
    closer: MatchCloser,
}

impl MatchStream {
    /// Handle that ends this stream from another thread.
    pub fn closer(&self) -> MatchCloser {
        self.closer.clone()
    }

    /// Next match if one is already queued. `None` also after the end.
    pub fn try_next(&mut self) -> Option<Tuple> {
        if self.done {
            return None;
        }
        match self.rx.try_recv() {
            Ok(Some(tuple)) => Some(tuple),
            Ok(None) | Err(TryRecvError::Disconnected) => {
                self.done = true;
                None
            }
            Err(TryRecvError::Empty) => None,
        }
    }

    /// True once the end marker was seen.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl Iterator for MatchStream {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(Some(tuple)) => Some(tuple),
            Ok(None) | Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

impl Drop for MatchStream {
    fn drop(&mut self) {
        if !self.done {
            self.closer.close();
        }
    }
}

/// Ends one [`MatchStream`].
#[derive(Clone)]
pub struct MatchCloser {
    id: RegId,
    tx: Sender<Command>,
}

impl MatchCloser {
    /// Push the end marker to the stream. Idempotent.
    pub fn close(&self) {
        let _ = self.tx.send(Command::CloseMatcher(self.id));
    }
}

/// Queue of [`NotifyEvent`]s.
pub struct Notifier {
    id: RegId,
    rx: Receiver<NotifyEvent>,
    active: bool,
    tx: Sender<Command>,
}

impl Notifier {
    /// Flip between active and inactive. Events applied while inactive are
    /// never delivered. Returns the new state.
    pub fn toggle(&mut self) -> bool {
        self.active = !self.active;
        let _ = self.tx.send(Command::SetNotifier(self.id, self.active));
        self.active
    }

    /// Current state as last set by [`Notifier::toggle`].
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Block for the next event. `None` once the flow is closed.
    pub fn recv(&self) -> Option<NotifyEvent> {
        self.rx.recv().ok()
    }

    /// Next event if one is queued.
    pub fn try_recv(&self) -> Option<NotifyEvent> {
        self.rx.try_recv().ok()
    }

    /// Block up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<NotifyEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Unregister(self.id));
    }
}
