//! Tagged N-to-1 arbiter: lets several ports share one SMI link.
//!
//! Each upstream port gets a request worker and a response worker. The
//! request worker takes a free local tag, registers the requester's
//! original tag bytes with its response worker, rewrites header bytes 2 and
//! 3 to (port id, local tag), and offers the frame to the selector. The
//! selector copies one whole frame at a time to the downstream link,
//! picking ports round-robin. The steerer reads the port id out of each
//! downstream response header and hands the whole frame to that port's
//! response worker, which restores the original tag and frees the local
//! tag once the frame has been delivered.
//!
//! Port ids run from 1 to N. Downstream never sees an original tag.

use std::future::Future;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use smi_core::{BusConfig, Flit};

use crate::link::{link, recv_flit, send_flit};
use crate::select::recv_round_robin;
use crate::tags::{free_tags, TagTable};
use crate::{BusError, Link, LinkEndpoint};

// ── Handle ────────────────────────────────────────────────────────────────────

/// Owns the worker tasks of a running arbiter. Dropping it aborts them.
pub struct ArbiterHandle {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ArbiterHandle {
    pub(crate) fn new(shutdown: broadcast::Sender<()>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { shutdown, tasks }
    }

    /// Signal every worker and wait for them to stop. Workers only notice
    /// the signal between frames.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
    }
}

impl Drop for ArbiterHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub(crate) fn spawn_worker<F>(name: &'static str, worker: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), BusError>> + Send + 'static,
{
    tokio::spawn(async move {
        match worker.await {
            Ok(()) => tracing::debug!(worker = name, "stopped"),
            Err(e) => tracing::debug!(worker = name, error = %e, "stopped"),
        }
    })
}

// ── Spawning ──────────────────────────────────────────────────────────────────

pub struct TaggedArbiter;

impl TaggedArbiter {
    /// Start an arbiter in front of `downstream` with `ports` upstream links.
    /// The returned links belong to ports 1..=ports in order.
    pub fn spawn(
        downstream: Link,
        ports: usize,
        config: &BusConfig,
    ) -> Result<(ArbiterHandle, Vec<Link>), BusError> {
        if ports == 0 || ports > u8::MAX as usize {
            return Err(BusError::PortCount(ports));
        }

        let (shutdown, _) = broadcast::channel(1);
        let frame_capacity = config.frame_capacity();
        let limit = config.in_flight_limit;
        let Link {
            request: downstream_tx,
            response: downstream_rx,
        } = downstream;

        let mut tasks = Vec::with_capacity(ports * 2 + 2);
        let mut links = Vec::with_capacity(ports);
        let mut tagged = Vec::with_capacity(ports);
        let mut steered = Vec::with_capacity(ports);

        for idx in 0..ports {
            let port_id = (idx + 1) as u8;
            let (client, endpoint) = link(config.link_capacity);
            let LinkEndpoint { request, response } = endpoint;
            let (tag_tx, tag_rx) = free_tags(limit);
            let (reg_tx, reg_rx) = mpsc::channel(limit.max(1) as usize);
            let (tagged_tx, tagged_rx) = mpsc::channel(frame_capacity);
            let (steer_tx, steer_rx) = mpsc::channel(frame_capacity);

            let requests = RequestWorker {
                port_id,
                upstream: request,
                free_tags: tag_rx,
                registrations: reg_tx,
                tagged: tagged_tx,
                shutdown: shutdown.subscribe(),
            };
            let responses = ResponseWorker {
                port_id,
                steered: steer_rx,
                registrations: reg_rx,
                table: TagTable::new(limit),
                free_tags: tag_tx,
                upstream: response,
                shutdown: shutdown.subscribe(),
            };
            tasks.push(spawn_worker("arbiter request", requests.run()));
            tasks.push(spawn_worker("arbiter response", responses.run()));

            links.push(client);
            tagged.push(tagged_rx);
            steered.push(steer_tx);
        }

        let selector = Selector {
            ports: tagged,
            downstream: downstream_tx,
            next: 0,
            shutdown: shutdown.subscribe(),
        };
        let steerer = Steerer {
            downstream: downstream_rx,
            ports: steered,
            shutdown: shutdown.subscribe(),
        };
        tasks.push(spawn_worker("arbiter selector", selector.run()));
        tasks.push(spawn_worker("arbiter steerer", steerer.run()));

        tracing::info!(ports, in_flight_limit = limit, "tagged arbiter started");
        Ok((ArbiterHandle::new(shutdown, tasks), links))
    }
}

// ── Request path ──────────────────────────────────────────────────────────────

struct RequestWorker {
    port_id: u8,
    upstream: mpsc::Receiver<Flit>,
    free_tags: mpsc::Receiver<u8>,
    registrations: mpsc::Sender<(u8, [u8; 2])>,
    tagged: mpsc::Sender<Flit>,
    shutdown: broadcast::Receiver<()>,
}

impl RequestWorker {
    async fn run(mut self) -> Result<(), BusError> {
        loop {
            let mut header = tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                flit = self.upstream.recv() => match flit {
                    Some(f) => f,
                    None => return Ok(()),
                },
            };

            // Blocks while the port already has `limit` transactions in flight.
            let tag = tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                tag = self.free_tags.recv() => tag.ok_or(BusError::LinkClosed)?,
            };

            let original = [header.data[2], header.data[3]];
            self.registrations
                .send((tag, original))
                .await
                .map_err(|_| BusError::LinkClosed)?;
            header.data[2] = self.port_id;
            header.data[3] = tag;
            tracing::trace!(port = self.port_id, tag, original = %hex::encode(original), "request tagged");

            let mut last = header.is_last();
            send_flit(&self.tagged, header).await?;
            while !last {
                let flit = recv_flit(&mut self.upstream).await?;
                last = flit.is_last();
                send_flit(&self.tagged, flit).await?;
            }
        }
    }
}

struct Selector {
    ports: Vec<mpsc::Receiver<Flit>>,
    downstream: mpsc::Sender<Flit>,
    next: usize,
    shutdown: broadcast::Receiver<()>,
}

impl Selector {
    async fn run(mut self) -> Result<(), BusError> {
        loop {
            let picked = tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                picked = recv_round_robin(&mut self.ports, self.next) => picked,
            };
            let Some((idx, header)) = picked else {
                return Ok(());
            };
            self.next = idx + 1;
            tracing::trace!(port = idx + 1, "frame selected");

            // The whole frame goes out before any other port is considered.
            let mut last = header.is_last();
            send_flit(&self.downstream, header).await?;
            while !last {
                let flit = recv_flit(&mut self.ports[idx]).await?;
                last = flit.is_last();
                send_flit(&self.downstream, flit).await?;
            }
        }
    }
}

// ── Response path ─────────────────────────────────────────────────────────────

struct Steerer {
    downstream: mpsc::Receiver<Flit>,
    ports: Vec<mpsc::Sender<Flit>>,
    shutdown: broadcast::Receiver<()>,
}

impl Steerer {
    async fn run(mut self) -> Result<(), BusError> {
        loop {
            let header = tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                flit = self.downstream.recv() => match flit {
                    Some(f) => f,
                    None => return Ok(()),
                },
            };

            let port = header.port_id();
            let mut target = (port as usize)
                .checked_sub(1)
                .and_then(|idx| self.ports.get(idx))
                .cloned();
            if target.is_none() {
                tracing::warn!(port, ?header, "response for unknown port dropped");
            }

            let mut flit = header;
            loop {
                let last = flit.is_last();
                if let Some(tx) = &target {
                    if tx.send(flit).await.is_err() {
                        tracing::warn!(port, "port gone, dropping rest of response");
                        target = None;
                    }
                }
                if last {
                    break;
                }
                flit = recv_flit(&mut self.downstream).await?;
            }
        }
    }
}

struct ResponseWorker {
    port_id: u8,
    steered: mpsc::Receiver<Flit>,
    registrations: mpsc::Receiver<(u8, [u8; 2])>,
    table: TagTable,
    free_tags: mpsc::Sender<u8>,
    upstream: mpsc::Sender<Flit>,
    shutdown: broadcast::Receiver<()>,
}

impl ResponseWorker {
    async fn run(mut self) -> Result<(), BusError> {
        loop {
            let mut header = tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                flit = self.steered.recv() => match flit {
                    Some(f) => f,
                    None => return Ok(()),
                },
            };

            // A request is registered before its frame leaves the port, so
            // everything this response could match is already queued.
            while let Ok((tag, original)) = self.registrations.try_recv() {
                if self.table.record(tag, original).is_some() {
                    tracing::warn!(port = self.port_id, tag, "tag reissued while still live");
                }
            }

            let tag = header.local_tag();
            let Some(original) = self.table.lookup(tag) else {
                tracing::warn!(port = self.port_id, tag, "response for unknown tag dropped");
                self.skip_frame(header).await?;
                continue;
            };

            header.set_tag(u16::from_le_bytes(original));
            let mut delivering = true;
            let mut flit = header;
            loop {
                let last = flit.is_last();
                if delivering && self.upstream.send(flit).await.is_err() {
                    // Requester hung up; keep consuming so the tag can be reused.
                    delivering = false;
                }
                if last {
                    break;
                }
                flit = recv_flit(&mut self.steered).await?;
            }

            self.table.release(tag);
            self.free_tags.send(tag).await.map_err(|_| BusError::LinkClosed)?;
            tracing::trace!(port = self.port_id, tag, live = self.table.live(), "response delivered");
        }
    }

    async fn skip_frame(&mut self, mut flit: Flit) -> Result<(), BusError> {
        while !flit.is_last() {
            flit = recv_flit(&mut self.steered).await?;
        }
        Ok(())
    }
}
