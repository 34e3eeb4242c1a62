//! SMI integration test harness.
//!
//! Each test wires ports, arbiters and simulated memory together in-process
//! and drives real transfers end to end:
//!
//!   cargo test --test integration
//!
//! Tests own everything they spawn; dropping the links ends the servers.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use smi_bus::{link, Link, MemoryPort, MemoryServer, SharedMemory, TransactionLog};
use smi_core::{BusConfig, Word};

mod arbitration;
mod bursts;
mod single;
mod split_channel;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Memory size used by every test.
pub const MEMORY_SIZE: u64 = 1 << 24;

/// Upper bound on any single test step; a hang fails the test instead of
/// stalling the run.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// A port wired straight to a memory server, plus handles to inspect it.
pub struct Rig {
    pub port: MemoryPort,
    pub memory: SharedMemory,
    pub log: TransactionLog,
}

/// Start a memory server on a fresh link and return a port to it.
pub fn direct_rig(config: &BusConfig) -> Rig {
    let memory = SharedMemory::new(MEMORY_SIZE);
    let (client, log) = serve(config, &memory);
    Rig {
        port: MemoryPort::new(client, config).unwrap(),
        memory,
        log,
    }
}

/// Spawn a memory server for `memory` and return the client side of its link.
pub fn serve(config: &BusConfig, memory: &SharedMemory) -> (Link, TransactionLog) {
    let (client, endpoint) = link(config.link_capacity);
    let server = MemoryServer::new(endpoint, memory.clone());
    let log = server.log();
    tokio::spawn(server.run());
    (client, log)
}

/// Burst-write `values` starting at `address`.
pub async fn write_values<T: Word>(port: &mut MemoryPort, address: u64, values: &[T]) -> Result<smi_core::Status> {
    let (tx, mut rx) = mpsc::channel(values.len().max(1));
    for v in values {
        tx.send(*v).await.context("source channel closed")?;
    }
    drop(tx);
    let status = tokio::time::timeout(
        STEP_TIMEOUT,
        port.write_burst(address, 0, values.len() as u32, &mut rx),
    )
    .await
    .context("write burst timed out")??;
    Ok(status)
}

/// Burst-read `count` elements starting at `address`.
pub async fn read_values<T: Word>(port: &mut MemoryPort, address: u64, count: u32) -> Result<(Vec<T>, smi_core::Status)> {
    let (tx, mut rx) = mpsc::channel(count.max(1) as usize);
    let status = tokio::time::timeout(STEP_TIMEOUT, port.read_burst(address, 0, count, &tx))
        .await
        .context("read burst timed out")??;
    drop(tx);
    let mut values = Vec::with_capacity(count as usize);
    while let Some(v) = rx.recv().await {
        values.push(v);
    }
    Ok((values, status))
}
