//! Split-channel memory bus: separate address, write data, write response
//! and read data channels with a fixed 64-bit data path.
//!
//! Narrow accesses use one beat and place the value in the byte lanes
//! picked by the address offset inside the 64-bit word, with a strobe bit
//! per written lane. Bursts are incrementing with one element per beat, so
//! a narrow burst walks the lanes of each word before moving to the next.

use tokio::sync::mpsc;

use smi_core::lanes::{extract_from_beat, place_in_beat};
use smi_core::{Status, Word};

use crate::port::Readback;
use crate::BusError;

/// Longest burst issued by the client, in beats.
pub const AXI_MAX_BURST_BEATS: u32 = 64;

/// Incrementing burst.
pub const AXI_BURST_INCR: u8 = 0b01;

/// Response bit signalling a failed transaction.
pub const AXI_RESP_ERROR: u8 = 0x02;

/// Cache bit: transaction may be buffered.
pub const AXI_CACHE_BUFFERABLE: u8 = 0b0001;
/// Cache bit: transaction may be modified.
pub const AXI_CACHE_MODIFIABLE: u8 = 0b0010;

// ── Beats ─────────────────────────────────────────────────────────────────────

/// Address channel beat, shared by reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrBeat {
    pub id: u8,
    pub addr: u64,
    /// Beats in the burst minus one.
    pub len: u8,
    /// log2 of the bytes per beat.
    pub size: u8,
    pub burst: u8,
    pub cache: u8,
}

impl AddrBeat {
    pub fn beats(&self) -> usize {
        self.len as usize + 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteData {
    pub data: u64,
    /// One bit per byte lane.
    pub strb: u8,
    pub last: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResp {
    pub id: u8,
    pub resp: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadData {
    pub id: u8,
    pub data: u64,
    pub resp: u8,
    pub last: bool,
}

pub fn resp_status(resp: u8) -> Status {
    if resp & AXI_RESP_ERROR == 0 {
        Status::Ok
    } else {
        Status::Failed
    }
}

pub fn status_resp(status: Status) -> u8 {
    match status {
        Status::Ok => 0,
        Status::Failed => AXI_RESP_ERROR,
    }
}

// ── Channels ──────────────────────────────────────────────────────────────────

/// Client side of a write bus.
#[derive(Debug)]
pub struct AxiWriteBus {
    pub addr: mpsc::Sender<AddrBeat>,
    pub data: mpsc::Sender<WriteData>,
    pub resp: mpsc::Receiver<WriteResp>,
}

/// Memory side of a write bus.
#[derive(Debug)]
pub struct AxiWriteTarget {
    pub addr: mpsc::Receiver<AddrBeat>,
    pub data: mpsc::Receiver<WriteData>,
    pub resp: mpsc::Sender<WriteResp>,
}

/// Client side of a read bus.
#[derive(Debug)]
pub struct AxiReadBus {
    pub addr: mpsc::Sender<AddrBeat>,
    pub data: mpsc::Receiver<ReadData>,
}

/// Memory side of a read bus.
#[derive(Debug)]
pub struct AxiReadTarget {
    pub addr: mpsc::Receiver<AddrBeat>,
    pub data: mpsc::Sender<ReadData>,
}

pub fn axi_write_bus(capacity: usize) -> (AxiWriteBus, AxiWriteTarget) {
    let capacity = capacity.max(1);
    let (addr_tx, addr_rx) = mpsc::channel(capacity);
    let (data_tx, data_rx) = mpsc::channel(capacity);
    let (resp_tx, resp_rx) = mpsc::channel(capacity);
    (
        AxiWriteBus {
            addr: addr_tx,
            data: data_tx,
            resp: resp_rx,
        },
        AxiWriteTarget {
            addr: addr_rx,
            data: data_rx,
            resp: resp_tx,
        },
    )
}

pub fn axi_read_bus(capacity: usize) -> (AxiReadBus, AxiReadTarget) {
    let capacity = capacity.max(1);
    let (addr_tx, addr_rx) = mpsc::channel(capacity);
    let (data_tx, data_rx) = mpsc::channel(capacity);
    (
        AxiReadBus {
            addr: addr_tx,
            data: data_rx,
        },
        AxiReadTarget {
            addr: addr_rx,
            data: data_tx,
        },
    )
}

pub(crate) async fn send<T>(tx: &mpsc::Sender<T>, value: T) -> Result<(), BusError> {
    tx.send(value).await.map_err(|_| BusError::LinkClosed)
}

pub(crate) async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> Result<T, BusError> {
    rx.recv().await.ok_or(BusError::LinkClosed)
}

fn cache_bits(buffered: bool) -> u8 {
    AXI_CACHE_MODIFIABLE | if buffered { AXI_CACHE_BUFFERABLE } else { 0 }
}

fn single_addr<T: Word>(address: u64, buffered: bool) -> AddrBeat {
    AddrBeat {
        id: 0,
        addr: T::WIDTH.align(address),
        len: 0,
        size: T::WIDTH.align_bits() as u8,
        burst: AXI_BURST_INCR,
        cache: cache_bits(buffered),
    }
}

fn burst_addr<T: Word>(address: u64, beats: u32, buffered: bool) -> AddrBeat {
    AddrBeat {
        id: 0,
        addr: address,
        len: (beats - 1) as u8,
        size: T::WIDTH.align_bits() as u8,
        burst: AXI_BURST_INCR,
        cache: cache_bits(buffered),
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Sequential client of a split-channel write bus.
pub struct AxiWriter {
    bus: AxiWriteBus,
}

impl AxiWriter {
    pub fn new(bus: AxiWriteBus) -> Self {
        Self { bus }
    }

    /// Write one value into the lanes its address selects.
    pub async fn write<T: Word>(&mut self, address: u64, buffered: bool, value: T) -> Result<Status, BusError> {
        let (data, strb) = place_in_beat(address, value);
        send(&self.bus.addr, single_addr::<T>(address, buffered)).await?;
        send(&self.bus.data, WriteData { data, strb, last: true }).await?;
        let resp = recv(&mut self.bus.resp).await?;
        Ok(resp_status(resp.resp))
    }

    /// Write `count` values from `source` in bursts of up to 64 beats.
    /// Each burst's beats are collected before its address goes out, so an
    /// early end of `source` never leaves a half-issued burst on the bus.
    pub async fn write_burst<T: Word>(
        &mut self,
        address: u64,
        buffered: bool,
        count: u32,
        source: &mut mpsc::Receiver<T>,
    ) -> Result<Status, BusError> {
        let step = T::WIDTH.bytes() as u64;
        let mut address = T::WIDTH.align(address);
        let mut remaining = count;
        let mut status = Status::Ok;
        let mut values = Vec::with_capacity(AXI_MAX_BURST_BEATS as usize);
        while remaining != 0 {
            let burst = remaining.min(AXI_MAX_BURST_BEATS);
            values.clear();
            for _ in 0..burst {
                values.push(source.recv().await.ok_or(BusError::SourceExhausted)?);
            }

            send(&self.bus.addr, burst_addr::<T>(address, burst, buffered)).await?;
            for (i, &value) in values.iter().enumerate() {
                let (data, strb) = place_in_beat(address + i as u64 * step, value);
                let last = i + 1 == values.len();
                send(&self.bus.data, WriteData { data, strb, last }).await?;
            }
            let resp = recv(&mut self.bus.resp).await?;
            status = status.and(resp_status(resp.resp));

            remaining -= burst;
            address += burst as u64 * step;
        }
        Ok(status)
    }
}

/// Sequential client of a split-channel read bus.
pub struct AxiReader {
    bus: AxiReadBus,
}

impl AxiReader {
    pub fn new(bus: AxiReadBus) -> Self {
        Self { bus }
    }

    /// Read the value in the lanes its address selects.
    pub async fn read<T: Word>(&mut self, address: u64, buffered: bool) -> Result<Readback<T>, BusError> {
        send(&self.bus.addr, single_addr::<T>(address, buffered)).await?;
        let mut status = Status::Ok;
        let beat = loop {
            let data = recv(&mut self.bus.data).await?;
            status = status.and(resp_status(data.resp));
            if data.last {
                break data.data;
            }
        };
        Ok(Readback {
            value: extract_from_beat(address, beat),
            status,
        })
    }

    /// Read `count` values into `sink` in bursts of up to 64 beats.
    pub async fn read_burst<T: Word>(
        &mut self,
        address: u64,
        buffered: bool,
        count: u32,
        sink: &mpsc::Sender<T>,
    ) -> Result<Status, BusError> {
        let step = T::WIDTH.bytes() as u64;
        let mut address = T::WIDTH.align(address);
        let mut remaining = count;
        let mut status = Status::Ok;
        while remaining != 0 {
            let burst = remaining.min(AXI_MAX_BURST_BEATS);
            send(&self.bus.addr, burst_addr::<T>(address, burst, buffered)).await?;
            let mut beat_addr = address;
            loop {
                let data = recv(&mut self.bus.data).await?;
                status = status.and(resp_status(data.resp));
                let _ = sink.send(extract_from_beat(beat_addr, data.data)).await;
                beat_addr += step;
                if data.last {
                    break;
                }
            }
            remaining -= burst;
            address += burst as u64 * step;
        }
        Ok(status)
    }
}

// ── Per-width entry points ────────────────────────────────────────────────────

macro_rules! burst_aliases {
    ($ty:ty, $write_burst:ident, $read_burst:ident) => {
        impl AxiWriter {
            pub async fn $write_burst(
                &mut self,
                address: u64,
                buffered: bool,
                count: u32,
                source: &mut mpsc::Receiver<$ty>,
            ) -> Result<Status, BusError> {
                self.write_burst::<$ty>(address, buffered, count, source).await
            }
        }

        impl AxiReader {
            pub async fn $read_burst(
                &mut self,
                address: u64,
                buffered: bool,
                count: u32,
                sink: &mpsc::Sender<$ty>,
            ) -> Result<Status, BusError> {
                self.read_burst::<$ty>(address, buffered, count, sink).await
            }
        }
    };
}

burst_aliases!(u8, write_burst_u8, read_burst_u8);
burst_aliases!(u16, write_burst_u16, read_burst_u16);
burst_aliases!(u32, write_burst_u32, read_burst_u32);
burst_aliases!(u64, write_burst_u64, read_burst_u64);
