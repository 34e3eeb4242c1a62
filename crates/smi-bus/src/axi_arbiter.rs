//! N-to-1 arbiters for the split-channel bus.
//!
//! The selector picks the next port with an address beat waiting
//! (round-robin), notes the port in a FIFO for the response side, and
//! forwards the address. Writes then copy that port's data beats through
//! `last`. The response side pops the FIFO and hands the next response
//! (one write response, or read data through `last`) to that port, relying
//! on the memory answering in address order.

use tokio::sync::{broadcast, mpsc};

use smi_core::BusConfig;

use crate::arbiter::{spawn_worker, ArbiterHandle};
use crate::axi::{
    axi_read_bus, axi_write_bus, recv, send, AddrBeat, AxiReadBus, AxiWriteBus, ReadData, WriteData,
    WriteResp,
};
use crate::select::recv_round_robin;
use crate::BusError;

fn check_ports(ports: usize) -> Result<(), BusError> {
    if ports == 0 || ports > u8::MAX as usize {
        return Err(BusError::PortCount(ports));
    }
    Ok(())
}

// ── Write ─────────────────────────────────────────────────────────────────────

pub struct WriteArbiter;

impl WriteArbiter {
    pub fn spawn(
        downstream: AxiWriteBus,
        ports: usize,
        config: &BusConfig,
    ) -> Result<(ArbiterHandle, Vec<AxiWriteBus>), BusError> {
        check_ports(ports)?;
        let (shutdown, _) = broadcast::channel(1);
        let (select_tx, select_rx) = mpsc::channel(config.in_flight_limit.max(1) as usize);

        let mut clients = Vec::with_capacity(ports);
        let mut addrs = Vec::with_capacity(ports);
        let mut data = Vec::with_capacity(ports);
        let mut resps = Vec::with_capacity(ports);
        for _ in 0..ports {
            let (bus, target) = axi_write_bus(config.link_capacity);
            clients.push(bus);
            addrs.push(target.addr);
            data.push(target.data);
            resps.push(target.resp);
        }

        let AxiWriteBus {
            addr: down_addr,
            data: down_data,
            resp: down_resp,
        } = downstream;

        let selector = WriteSelector {
            addrs,
            data,
            downstream_addr: down_addr,
            downstream_data: down_data,
            resp_select: select_tx,
            next: 0,
            shutdown: shutdown.subscribe(),
        };
        let steerer = WriteRespSteerer {
            resp_select: select_rx,
            downstream_resp: down_resp,
            ports: resps,
            shutdown: shutdown.subscribe(),
        };
        let tasks = vec![
            spawn_worker("write arbiter selector", selector.run()),
            spawn_worker("write arbiter steerer", steerer.run()),
        ];
        tracing::info!(ports, "write arbiter started");
        Ok((ArbiterHandle::new(shutdown, tasks), clients))
    }
}

struct WriteSelector {
    addrs: Vec<mpsc::Receiver<AddrBeat>>,
    data: Vec<mpsc::Receiver<WriteData>>,
    downstream_addr: mpsc::Sender<AddrBeat>,
    downstream_data: mpsc::Sender<WriteData>,
    resp_select: mpsc::Sender<usize>,
    next: usize,
    shutdown: broadcast::Receiver<()>,
}

impl WriteSelector {
    async fn run(mut self) -> Result<(), BusError> {
        loop {
            let picked = tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                picked = recv_round_robin(&mut self.addrs, self.next) => picked,
            };
            let Some((idx, addr)) = picked else {
                return Ok(());
            };
            self.next = idx + 1;

            send(&self.resp_select, idx).await?;
            send(&self.downstream_addr, addr).await?;
            loop {
                let beat = recv(&mut self.data[idx]).await?;
                send(&self.downstream_data, beat).await?;
                if beat.last {
                    break;
                }
            }
            tracing::trace!(port = idx + 1, addr = format_args!("0x{:x}", addr.addr), "write forwarded");
        }
    }
}

struct WriteRespSteerer {
    resp_select: mpsc::Receiver<usize>,
    downstream_resp: mpsc::Receiver<WriteResp>,
    ports: Vec<mpsc::Sender<WriteResp>>,
    shutdown: broadcast::Receiver<()>,
}

impl WriteRespSteerer {
    async fn run(mut self) -> Result<(), BusError> {
        loop {
            let idx = tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                idx = self.resp_select.recv() => match idx {
                    Some(i) => i,
                    None => return Ok(()),
                },
            };
            let resp = recv(&mut self.downstream_resp).await?;
            if self.ports[idx].send(resp).await.is_err() {
                tracing::warn!(port = idx + 1, "write response for departed port dropped");
            }
        }
    }
}

// ── Read ──────────────────────────────────────────────────────────────────────

pub struct ReadArbiter;

impl ReadArbiter {
    pub fn spawn(
        downstream: AxiReadBus,
        ports: usize,
        config: &BusConfig,
    ) -> Result<(ArbiterHandle, Vec<AxiReadBus>), BusError> {
        check_ports(ports)?;
        let (shutdown, _) = broadcast::channel(1);
        let (select_tx, select_rx) = mpsc::channel(config.in_flight_limit.max(1) as usize);

        let mut clients = Vec::with_capacity(ports);
        let mut addrs = Vec::with_capacity(ports);
        let mut data = Vec::with_capacity(ports);
        for _ in 0..ports {
            let (bus, target) = axi_read_bus(config.link_capacity);
            clients.push(bus);
            addrs.push(target.addr);
            data.push(target.data);
        }

        let AxiReadBus {
            addr: down_addr,
            data: down_data,
        } = downstream;

        let selector = ReadSelector {
            addrs,
            downstream_addr: down_addr,
            data_select: select_tx,
            next: 0,
            shutdown: shutdown.subscribe(),
        };
        let steerer = ReadDataSteerer {
            data_select: select_rx,
            downstream_data: down_data,
            ports: data,
            shutdown: shutdown.subscribe(),
        };
        let tasks = vec![
            spawn_worker("read arbiter selector", selector.run()),
            spawn_worker("read arbiter steerer", steerer.run()),
        ];
        tracing::info!(ports, "read arbiter started");
        Ok((ArbiterHandle::new(shutdown, tasks), clients))
    }
}

struct ReadSelector {
    addrs: Vec<mpsc::Receiver<AddrBeat>>,
    downstream_addr: mpsc::Sender<AddrBeat>,
    data_select: mpsc::Sender<usize>,
    next: usize,
    shutdown: broadcast::Receiver<()>,
}

impl ReadSelector {
    async fn run(mut self) -> Result<(), BusError> {
        loop {
            let picked = tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                picked = recv_round_robin(&mut self.addrs, self.next) => picked,
            };
            let Some((idx, addr)) = picked else {
                return Ok(());
            };
            self.next = idx + 1;

            send(&self.data_select, idx).await?;
            send(&self.downstream_addr, addr).await?;
            tracing::trace!(port = idx + 1, addr = format_args!("0x{:x}", addr.addr), "read forwarded");
        }
    }
}

struct ReadDataSteerer {
    data_select: mpsc::Receiver<usize>,
    downstream_data: mpsc::Receiver<ReadData>,
    ports: Vec<mpsc::Sender<ReadData>>,
    shutdown: broadcast::Receiver<()>,
}

impl ReadDataSteerer {
    async fn run(mut self) -> Result<(), BusError> {
        loop {
            let idx = tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                idx = self.data_select.recv() => match idx {
                    Some(i) => i,
                    None => return Ok(()),
                },
            };
            let mut delivering = true;
            loop {
                let beat = recv(&mut self.downstream_data).await?;
                if delivering && self.ports[idx].send(beat).await.is_err() {
                    tracing::warn!(port = idx + 1, "read data for departed port dropped");
                    delivering = false;
                }
                if beat.last {
                    break;
                }
            }
        }
    }
}
