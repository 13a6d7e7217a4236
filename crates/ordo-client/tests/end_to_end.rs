// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Blocking clients against a live sequencer on a temp-dir socket.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;
use std::time::Duration;

use ordo_client::{Client, ClientError, ClientOptions, Subscription};
use ordo_proto::{template, tuple, Tick, Transaction};
use ordo_sequencer::{SequencerConfig, SequencerService, ServiceHandle};
use tokio::net::UnixListener;
use tokio::runtime::Runtime;

struct Harness {
    rt: Runtime,
    handle: ServiceHandle,
    sock: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn start() -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("ordo.sock");
        let handle = {
            let _guard = rt.enter();
            let listener = UnixListener::bind(&sock).unwrap();
            SequencerService::new(SequencerConfig::default(), Some(listener)).start()
        };
        Self {
            rt,
            handle,
            sock,
            _dir: dir,
        }
    }

    fn client(&self, client_id: u64, subscription: Subscription, publish: &[&str]) -> Client {
        Client::connect(
            &self.sock,
            ClientOptions {
                client_id,
                subscription,
                publish_tags: publish.iter().map(|t| (*t).to_string()).collect(),
                ..ClientOptions::default()
            },
        )
        .unwrap()
    }

    fn stop(self) -> Tick {
        self.rt.block_on(self.handle.stop()).unwrap()
    }
}

#[test]
fn writes_become_readable_everywhere_in_one_order() {
    let h = Harness::start();
    let a = h.client(1, Subscription::All, &[]);
    let b = h.client(2, Subscription::All, &[]);

    a.write([tuple!["job", 1]]).unwrap();
    assert_eq!(b.read(template!["job", _]).unwrap(), tuple!["job", 1]);
    assert_eq!(a.read(template!["job", _]).unwrap(), tuple!["job", 1]);

    b.commit(&Transaction {
        deletes: vec![tuple!["job", 1]],
        inserts: vec![tuple!["done", 1]],
    })
    .unwrap();
    assert_eq!(a.read(template!["done", _]).unwrap(), tuple!["done", 1]);
    assert_eq!(a.read_nowait(template!["job", _]).unwrap(), None);
    assert_eq!(a.last_tick(), 2);

    drop((a, b));
    assert_eq!(h.stop(), 2);
}

#[test]
fn tagged_replica_only_sees_its_tags() {
    let h = Harness::start();
    let red = h.client(1, Subscription::All, &["red"]);
    let blue = h.client(2, Subscription::All, &["blue"]);
    let watcher = h.client(3, Subscription::Tags(vec!["blue".into()]), &[]);

    red.write([tuple!["red"]]).unwrap();
    blue.read(template!["red"]).unwrap();
    blue.write([tuple!["blue"]]).unwrap();

    assert_eq!(watcher.read(template!["blue"]).unwrap(), tuple!["blue"]);
    assert_eq!(watcher.read_nowait(template!["red"]).unwrap(), None);
    assert_eq!(watcher.last_tick(), 2);
}

#[test]
fn read_all_and_notifier_follow_other_clients() {
    let h = Harness::start();
    let writer = h.client(7, Subscription::All, &[]);
    let reader = h.client(8, Subscription::All, &[]);
    let notes = reader.notifier().unwrap();
    let stream = reader.read_all(template!["n", _]).unwrap();
    let closer = stream.closer();

    for n in 0..3 {
        writer.write([tuple!["n", n]]).unwrap();
    }
    writer.write([tuple!["other"]]).unwrap();
    writer.write([tuple!["n", 0]]).unwrap();

    let seen: Vec<_> = stream.take(4).collect();
    assert_eq!(
        seen,
        vec![tuple!["n", 0], tuple!["n", 1], tuple!["n", 2], tuple!["n", 0]]
    );
    closer.close();

    for tick in 1..=5 {
        let event = notes.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.global_tick, tick);
        assert_eq!(event.client_id, 7);
    }
}

#[test]
fn dropping_the_client_closes_the_flow() {
    let h = Harness::start();
    let c = h.client(1, Subscription::All, &[]);
    c.write([tuple!["x"]]).unwrap();
    c.read(template!["x"]).unwrap();
    let stream = c.read_all(template!["x"]).unwrap();
    let waiter = c.worker().waiter(template!["never"]).unwrap();
    drop(c);
    assert_eq!(stream.count(), 1);
    assert!(matches!(waiter.wait(), Err(ClientError::Closed)));
}
