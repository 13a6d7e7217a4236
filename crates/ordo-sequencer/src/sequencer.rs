// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ordering core: tick assignment, subscription tables, tag routing.
//!
//! Everything here runs on one control loop, so the tick counter and the
//! tables need no locking. Connections are plain outboxes; a failed send is
//! how the core learns a peer is gone.

use anyhow::Result;
use ordo_proto::{
    wire::encode_message, BlobType, ControlOp, DataMessage, Greeting, Message, ReflectAck, Tag,
    Tick,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Connection identifier, unique for the lifetime of a sequencer.
pub type ConnId = u64;

/// Outbound queue of encoded packets for one connection.
pub type Outbox = mpsc::UnboundedSender<Vec<u8>>;

/// Static sequencer settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencerConfig {
    /// Blob encoding advertised in every greeting.
    pub blob: BlobType,
    /// Tick to resume from (the last tick a previous run handed out).
    pub start_tick: Tick,
}

struct ConnState {
    tx: Outbox,
    tags: HashSet<Tag>,
}

/// Assigns global ticks and routes data messages to subscribers.
pub struct Sequencer {
    blob: BlobType,
    tick: Tick,
    next_conn_id: ConnId,
    conns: HashMap<ConnId, ConnState>,
    subscribers_to_all: HashSet<ConnId>,
    subscribers: HashMap<Tag, HashSet<ConnId>>,
    rejected: Vec<ConnId>,
}

impl Sequencer {
    /// Fresh sequencer with no connections.
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            blob: config.blob,
            tick: config.start_tick,
            next_conn_id: 0,
            conns: HashMap::new(),
            subscribers_to_all: HashSet::new(),
            subscribers: HashMap::new(),
            rejected: Vec::new(),
        }
    }

    /// Last tick assigned (persist this to resume later).
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Greeting a connection registered right now would receive.
    pub fn greeting(&self) -> Greeting {
        Greeting {
            blob: self.blob,
            tick: self.tick,
        }
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// True while `conn` is registered.
    pub fn is_registered(&self, conn: ConnId) -> bool {
        self.conns.contains_key(&conn)
    }

    /// True if `conn` receives untagged and all tagged traffic.
    pub fn subscribes_to_all(&self, conn: ConnId) -> bool {
        self.subscribers_to_all.contains(&conn)
    }

    /// Connections subscribed to `tag`.
    pub fn subscribers_of(&self, tag: &str) -> Vec<ConnId> {
        self.subscribers
            .get(tag)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Greet a new connection and register it.
    ///
    /// Returns `None` only when the outbox is already closed. A socket that
    /// dies while the greeting is in flight is registered (with no
    /// subscriptions) and removed once its writer reports the failure.
    pub fn register(&mut self, tx: Outbox) -> Result<Option<ConnId>> {
        let pkt = encode_message(&Message::Greeting(self.greeting()), self.tick)?;
        if tx.send(pkt).is_err() {
            debug!("greeting failed; dropping connection");
            return Ok(None);
        }
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conns.insert(
            id,
            ConnState {
                tx,
                tags: HashSet::new(),
            },
        );
        debug!(conn = id, tick = self.tick, "connected");
        Ok(Some(id))
    }

    /// Handle one inbound message from `conn`.
    pub fn handle(&mut self, conn: ConnId, msg: Message) -> Result<()> {
        if !self.is_registered(conn) {
            // late frame from a connection rejected earlier in this loop
            return Ok(());
        }
        match msg {
            Message::Control(op) => self.handle_control(conn, op),
            Message::Data(data) => self.handle_data(conn, data),
            other => {
                warn!(conn, op = other.op_name(), "ignoring client-originated frame");
                Ok(())
            }
        }
    }

    fn handle_control(&mut self, conn: ConnId, op: ControlOp) -> Result<()> {
        debug!(conn, op = op.name(), "control");
        match &op {
            ControlOp::SubscribeAll => {
                self.subscribers_to_all.insert(conn);
            }
            ControlOp::Subscribe(tags) => {
                for tag in tags {
                    self.subscribers.entry(tag.clone()).or_default().insert(conn);
                }
                if let Some(state) = self.conns.get_mut(&conn) {
                    state.tags.extend(tags.iter().cloned());
                }
            }
            ControlOp::UnsubscribeAll => {
                self.subscribers_to_all.remove(&conn);
            }
            ControlOp::Unsubscribe(tags) => {
                for tag in tags {
                    self.remove_from_tag(tag, conn);
                }
                if let Some(state) = self.conns.get_mut(&conn) {
                    for tag in tags {
                        state.tags.remove(tag);
                    }
                }
            }
            ControlOp::Unrecognized(name) => {
                error!(conn, op = %name, "bad control operation");
                return Ok(());
            }
        }
        let ack = encode_message(&Message::Control(op), self.tick)?;
        self.send(conn, ack);
        Ok(())
    }

    fn handle_data(&mut self, origin: ConnId, mut msg: DataMessage) -> Result<()> {
        self.tick += 1;
        msg.global_tick = self.tick;
        msg.delta = None;
        let reflect = std::mem::take(&mut msg.reflect);

        let mut dests = self.subscribers_to_all.clone();
        for tag in &msg.tags {
            if let Some(subs) = self.subscribers.get(tag) {
                dests.extend(subs.iter().copied());
            }
        }

        if reflect {
            let echo = Message::Reflect(ReflectAck {
                client_id: msg.client_id,
                local_tick: msg.local_tick,
                global_tick: msg.global_tick,
            });
            debug!(conn = origin, tick = self.tick, "reflecting message");
            let pkt = encode_message(&echo, self.tick)?;
            self.send(origin, pkt);
        }

        debug!(
            conn = origin,
            tick = self.tick,
            dests = dests.len(),
            "routing message"
        );
        let pkt = encode_message(&Message::Data(msg), self.tick)?;
        for dest in dests {
            self.send(dest, pkt.clone());
        }
        Ok(())
    }

    /// Deliver `pkt` to `conn`, deregistering it if the outbox is closed.
    fn send(&mut self, conn: ConnId, pkt: Vec<u8>) -> bool {
        let delivered = self
            .conns
            .get(&conn)
            .is_some_and(|state| state.tx.send(pkt).is_ok());
        if !delivered {
            debug!(conn, "send failed; closing");
            self.reject(conn);
        }
        delivered
    }

    fn remove_from_tag(&mut self, tag: &str, conn: ConnId) {
        if let Some(subs) = self.subscribers.get_mut(tag) {
            subs.remove(&conn);
            if subs.is_empty() {
                self.subscribers.remove(tag);
            }
        }
    }

    /// Remove `conn` from the registry and from every subscription set.
    pub fn reject(&mut self, conn: ConnId) {
        let Some(state) = self.conns.remove(&conn) else {
            return;
        };
        self.subscribers_to_all.remove(&conn);
        for tag in &state.tags {
            self.remove_from_tag(tag, conn);
        }
        self.rejected.push(conn);
        debug!(conn, "deregistered");
    }

    /// Connections rejected since the last call (so the transport can tear
    /// down their readers).
    pub fn drain_rejected(&mut self) -> Vec<ConnId> {
        std::mem::take(&mut self.rejected)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use ordo_proto::wire::decode_message;
    use ordo_proto::{tuple, Transaction};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(seq: &mut Sequencer) -> (ConnId, UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = seq.register(tx).unwrap().expect("registered");
        (id, rx)
    }

    fn next(rx: &mut UnboundedReceiver<Vec<u8>>) -> (Message, Tick) {
        let pkt = rx.try_recv().expect("packet queued");
        let (msg, ts, _) = decode_message(&pkt).expect("decode");
        (msg, ts)
    }

    fn greeting(rx: &mut UnboundedReceiver<Vec<u8>>) -> Greeting {
        match next(rx) {
            (Message::Greeting(g), _) => g,
            other => panic!("expected greeting, got {other:?}"),
        }
    }

    fn data(client_id: u64, tags: &[&str], reflect: bool) -> Message {
        let txn = Transaction::write([tuple!["n", 1]]);
        let mut d = DataMessage::with_transaction(client_id, 7, BlobType::Cbor, &txn).unwrap();
        d.tags = tags.iter().map(|t| (*t).to_string()).collect();
        d.reflect = reflect;
        d.delta = Some(3);
        Message::Data(d)
    }

    fn subscribe(seq: &mut Sequencer, conn: ConnId, rx: &mut UnboundedReceiver<Vec<u8>>, op: ControlOp) {
        seq.handle(conn, Message::Control(op.clone())).unwrap();
        assert_eq!(next(rx).0, Message::Control(op));
    }

    #[test]
    fn ticks_are_one_through_n_without_gaps() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let (a, mut rx) = connect(&mut seq);
        greeting(&mut rx);
        subscribe(&mut seq, a, &mut rx, ControlOp::SubscribeAll);
        for _ in 0..5 {
            seq.handle(a, data(1, &[], false)).unwrap();
        }
        let ticks: Vec<Tick> = (0..5)
            .map(|_| match next(&mut rx) {
                (Message::Data(d), ts) => {
                    assert_eq!(d.global_tick, ts);
                    d.global_tick
                }
                other => panic!("expected data, got {other:?}"),
            })
            .collect();
        assert_eq!(ticks, vec![1, 2, 3, 4, 5]);
        assert_eq!(seq.tick(), 5);
    }

    #[test]
    fn greeting_carries_current_tick() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let (a, mut rx_a) = connect(&mut seq);
        assert_eq!(greeting(&mut rx_a).tick, 0);
        seq.handle(a, data(1, &[], false)).unwrap();
        let (_b, mut rx_b) = connect(&mut seq);
        assert_eq!(greeting(&mut rx_b).tick, 1);
    }

    #[test]
    fn resumed_sequencer_continues_from_start_tick() {
        let mut seq = Sequencer::new(SequencerConfig {
            blob: BlobType::Json,
            start_tick: 41,
        });
        let (a, mut rx) = connect(&mut seq);
        assert_eq!(
            greeting(&mut rx),
            Greeting {
                blob: BlobType::Json,
                tick: 41
            }
        );
        subscribe(&mut seq, a, &mut rx, ControlOp::SubscribeAll);
        seq.handle(a, data(1, &[], false)).unwrap();
        assert_eq!(next(&mut rx).1, 42);
    }

    #[test]
    fn acks_echo_op_stamped_with_current_tick() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let (a, mut rx) = connect(&mut seq);
        greeting(&mut rx);
        seq.handle(a, data(1, &[], false)).unwrap();
        seq.handle(a, Message::Control(ControlOp::Subscribe(vec!["x".into()])))
            .unwrap();
        let (ack, ts) = next(&mut rx);
        assert_eq!(ack, Message::Control(ControlOp::Subscribe(vec!["x".into()])));
        assert_eq!(ts, 1);
        assert_eq!(seq.subscribers_of("x"), vec![a]);
    }

    #[test]
    fn unrecognized_control_is_not_acked_and_keeps_connection() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let (a, mut rx) = connect(&mut seq);
        greeting(&mut rx);
        seq.handle(a, Message::Control(ControlOp::Unrecognized("frob".into())))
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert!(seq.is_registered(a));
    }

    #[test]
    fn tag_routing_only_reaches_interested_streams() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let (producer, mut rx_p) = connect(&mut seq);
        let (x_sub, mut rx_x) = connect(&mut seq);
        let (all_sub, mut rx_all) = connect(&mut seq);
        greeting(&mut rx_p);
        greeting(&mut rx_x);
        greeting(&mut rx_all);
        subscribe(&mut seq, x_sub, &mut rx_x, ControlOp::Subscribe(vec!["x".into()]));
        subscribe(&mut seq, all_sub, &mut rx_all, ControlOp::SubscribeAll);

        seq.handle(producer, data(1, &["y"], false)).unwrap();
        seq.handle(producer, data(1, &[], false)).unwrap();
        seq.handle(producer, data(1, &["x", "y"], false)).unwrap();

        // x subscriber sees only the message tagged x
        match next(&mut rx_x) {
            (Message::Data(d), ts) => {
                assert_eq!(ts, 3);
                assert_eq!(d.tags, vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx_x.try_recv().is_err());

        // all subscriber sees everything, once each
        let seen: Vec<Tick> = std::iter::from_fn(|| rx_all.try_recv().ok())
            .map(|pkt| decode_message(&pkt).unwrap().1)
            .collect();
        assert_eq!(seen, vec![1, 2, 3]);

        // producer never subscribed
        assert!(rx_p.try_recv().is_err());
    }

    #[test]
    fn reflect_echoes_reduced_message_to_unsubscribed_origin() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let (origin, mut rx_o) = connect(&mut seq);
        let (x_sub, mut rx_x) = connect(&mut seq);
        greeting(&mut rx_o);
        greeting(&mut rx_x);
        subscribe(&mut seq, x_sub, &mut rx_x, ControlOp::Subscribe(vec!["x".into()]));

        seq.handle(origin, data(9, &["x"], true)).unwrap();

        assert_eq!(
            next(&mut rx_o).0,
            Message::Reflect(ReflectAck {
                client_id: 9,
                local_tick: 7,
                global_tick: 1
            })
        );
        assert!(rx_o.try_recv().is_err());

        match next(&mut rx_x).0 {
            Message::Data(d) => {
                assert_eq!(d.tags, vec!["x".to_string()]);
                assert!(!d.reflect);
                assert_eq!(d.delta, None);
                assert_eq!(d.global_tick, 1);
                assert!(d.blob.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reflect_and_subscription_both_deliver_to_subscribed_origin() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let (origin, mut rx) = connect(&mut seq);
        greeting(&mut rx);
        subscribe(&mut seq, origin, &mut rx, ControlOp::SubscribeAll);
        seq.handle(origin, data(2, &["x"], true)).unwrap();
        assert!(matches!(next(&mut rx).0, Message::Reflect(_)));
        assert!(matches!(next(&mut rx).0, Message::Data(_)));
    }

    #[test]
    fn failed_destination_is_deregistered_others_still_served() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let (producer, _rx_p) = connect(&mut seq);
        let (dead, rx_dead) = connect(&mut seq);
        let (live, mut rx_live) = connect(&mut seq);
        greeting(&mut rx_live);
        seq.handle(dead, Message::Control(ControlOp::Subscribe(vec!["t".into()])))
            .unwrap();
        seq.handle(dead, Message::Control(ControlOp::SubscribeAll))
            .unwrap();
        subscribe(&mut seq, live, &mut rx_live, ControlOp::SubscribeAll);
        drop(rx_dead);

        seq.handle(producer, data(1, &["t"], false)).unwrap();

        assert!(!seq.is_registered(dead));
        assert!(!seq.subscribes_to_all(dead));
        assert!(seq.subscribers_of("t").is_empty());
        assert_eq!(seq.drain_rejected(), vec![dead]);
        assert!(matches!(next(&mut rx_live).0, Message::Data(_)));
        assert_eq!(seq.connection_count(), 2);
    }

    #[test]
    fn closed_outbox_is_not_registered() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert_eq!(seq.register(tx).unwrap(), None);
        assert_eq!(seq.connection_count(), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let (a, mut rx) = connect(&mut seq);
        greeting(&mut rx);
        subscribe(&mut seq, a, &mut rx, ControlOp::Subscribe(vec!["x".into(), "y".into()]));
        subscribe(&mut seq, a, &mut rx, ControlOp::Unsubscribe(vec!["x".into()]));
        seq.handle(a, data(1, &["x"], false)).unwrap();
        assert!(rx.try_recv().is_err());
        seq.handle(a, data(1, &["y"], false)).unwrap();
        assert_eq!(next(&mut rx).1, 2);

        subscribe(&mut seq, a, &mut rx, ControlOp::SubscribeAll);
        subscribe(&mut seq, a, &mut rx, ControlOp::UnsubscribeAll);
        seq.handle(a, data(1, &[], false)).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
