// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Minimal CLI publisher for exercising a running sequencer.
//!
//! Connects a blocking [`Client`], writes `("pulse", i)` tuples at a fixed
//! interval, and waits for each to come back through the replica before
//! sending the next. A quick way to check that `ordo-sequencer` is alive and
//! ordering without writing any application code.

use anyhow::{Context, Result};
use ordo_client::{Client, ClientOptions};
use ordo_proto::{default_socket_path, template, tuple};
use std::time::Duration;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let socket_path = args
        .next()
        .map_or_else(default_socket_path, Into::into);
    let pulses: i64 = args
        .next()
        .as_deref()
        .unwrap_or("5")
        .parse()
        .context("parse pulses")?;
    let delay_ms: u64 = args
        .next()
        .as_deref()
        .unwrap_or("250")
        .parse()
        .context("parse delay_ms")?;

    let client = Client::connect(
        &socket_path,
        ClientOptions {
            client_id: u64::from(std::process::id()),
            ..ClientOptions::default()
        },
    )
    .with_context(|| format!("connect {}", socket_path.display()))?;

    for i in 0..pulses {
        client.write([tuple!["pulse", i]]).context("write pulse")?;
        client.read(template!["pulse", i]).context("read pulse back")?;
        tracing::info!(pulse = i, tick = client.last_tick(), "pulse sequenced");
        std::thread::sleep(Duration::from_millis(delay_ms));
    }

    Ok(())
}
