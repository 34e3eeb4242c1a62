//! Simulated shared memory and the servers that terminate links into it.
//!
//! `SharedMemory` is a sparse byte store made of 4 KiB pages, allocated on
//! first write and zero until then. Any number of servers can share one
//! store. Accesses past the configured size, or touching an injected fault
//! range, fail without side effects.

use std::sync::{Arc, Mutex, RwLock};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use zerocopy::AsBytes;

use smi_core::frame::frame_bytes;
use smi_core::lanes::apply_strobe;
use smi_core::wire::{decode_request, encode_response, Opcode, REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN};
use smi_core::{FaultRange, MemoryConfig, Status, Word};

use crate::axi::{recv, send, status_resp, AddrBeat, AxiReadTarget, AxiWriteTarget, ReadData, WriteResp};
use crate::codec::{recv_frame, send_frame};
use crate::port::Readback;
use crate::{BusError, LinkEndpoint};

pub const PAGE_SIZE: usize = 4096;

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SharedMemory {
    inner: Arc<Store>,
}

struct Store {
    pages: DashMap<u64, Box<[u8; PAGE_SIZE]>>,
    size: u64,
    faults: RwLock<Vec<FaultRange>>,
}

impl SharedMemory {
    pub fn new(size: u64) -> Self {
        Self {
            inner: Arc::new(Store {
                pages: DashMap::new(),
                size,
                faults: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        let memory = Self::new(config.size_bytes);
        for fault in &config.faults {
            memory.inject_fault(*fault);
        }
        memory
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// Make every access overlapping `range` fail.
    pub fn inject_fault(&self, range: FaultRange) {
        self.inner
            .faults
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(range);
    }

    pub fn clear_faults(&self) {
        self.inner.faults.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Would an access to `[address, address + length)` succeed?
    pub fn check(&self, address: u64, length: usize) -> Status {
        let length = length as u64;
        let in_range = address
            .checked_add(length)
            .is_some_and(|end| end <= self.inner.size);
        if !in_range {
            return Status::Failed;
        }
        let faults = self.inner.faults.read().unwrap_or_else(|e| e.into_inner());
        if faults.iter().any(|f| f.overlaps(address, length)) {
            Status::Failed
        } else {
            Status::Ok
        }
    }

    /// Fill `buf` from memory. On failure `buf` is zeroed.
    pub fn read(&self, address: u64, buf: &mut [u8]) -> Status {
        if !self.check(address, buf.len()).is_ok() {
            buf.fill(0);
            return Status::Failed;
        }
        for_each_page(address, buf.len(), |page, offset, range| {
            let chunk = &mut buf[range];
            match self.inner.pages.get(&page) {
                Some(p) => chunk.copy_from_slice(&p[offset..offset + chunk.len()]),
                None => chunk.fill(0),
            }
        });
        Status::Ok
    }

    /// Copy `data` into memory. On failure nothing is written.
    pub fn write(&self, address: u64, data: &[u8]) -> Status {
        if !self.check(address, data.len()).is_ok() {
            return Status::Failed;
        }
        for_each_page(address, data.len(), |page, offset, range| {
            let mut p = self
                .inner
                .pages
                .entry(page)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            p[offset..offset + range.len()].copy_from_slice(&data[range]);
        });
        Status::Ok
    }

    pub fn load<T: Word>(&self, address: u64) -> Readback<T> {
        let mut lanes = [0u8; 8];
        let status = self.read(address, &mut lanes[..T::WIDTH.bytes()]);
        Readback {
            value: T::read_lanes(&lanes),
            status,
        }
    }

    pub fn store<T: Word>(&self, address: u64, value: T) -> Status {
        let mut lanes = [0u8; 8];
        value.write_lanes(&mut lanes);
        self.write(address, &lanes[..T::WIDTH.bytes()])
    }

    /// Merge the strobed lanes of a 64-bit beat into the word at `address`.
    pub fn merge_word(&self, address: u64, data: u64, strobe: u8) -> Status {
        let current = self.load::<u64>(address);
        if !current.status.is_ok() {
            return Status::Failed;
        }
        self.store(address, apply_strobe(current.value, data, strobe))
    }

    /// Pages that have been written at least once.
    pub fn resident_pages(&self) -> usize {
        self.inner.pages.len()
    }
}

fn for_each_page(address: u64, length: usize, mut f: impl FnMut(u64, usize, std::ops::Range<usize>)) {
    let mut done = 0;
    while done < length {
        let at = address + done as u64;
        let page = at / PAGE_SIZE as u64;
        let offset = (at % PAGE_SIZE as u64) as usize;
        let n = (PAGE_SIZE - offset).min(length - done);
        f(page, offset, done..done + n);
        done += n;
    }
}

// ── Transaction log ───────────────────────────────────────────────────────────

/// One request as seen by a memory server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionRecord {
    pub opcode: Opcode,
    pub options: u8,
    pub tag: u16,
    pub address: u64,
    pub length: u16,
}

/// Shared, append-only record of the requests a server has handled.
#[derive(Debug, Clone, Default)]
pub struct TransactionLog {
    records: Arc<Mutex<Vec<TransactionRecord>>>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: TransactionRecord) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
    }

    pub fn snapshot(&self) -> Vec<TransactionRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

// ── SMI server ────────────────────────────────────────────────────────────────

/// Answers SMI requests arriving on one link.
pub struct MemoryServer {
    endpoint: LinkEndpoint,
    memory: SharedMemory,
    log: TransactionLog,
}

impl MemoryServer {
    pub fn new(endpoint: LinkEndpoint, memory: SharedMemory) -> Self {
        Self {
            endpoint,
            memory,
            log: TransactionLog::new(),
        }
    }

    /// Record into an existing log instead of a fresh one.
    pub fn with_log(mut self, log: TransactionLog) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> TransactionLog {
        self.log.clone()
    }

    /// Serve until the client side of the link is dropped.
    pub async fn run(mut self) -> Result<(), BusError> {
        loop {
            let flits = match recv_frame(&mut self.endpoint.request).await {
                Ok(flits) => flits,
                Err(BusError::LinkClosed) => {
                    tracing::debug!("link closed, memory server exiting");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            match frame_bytes(&flits) {
                Ok(bytes) => self.handle(Bytes::from(bytes)).await?,
                Err(e) => tracing::warn!(error = %e, "malformed request frame dropped"),
            }
        }
    }

    async fn handle(&mut self, frame: Bytes) -> Result<(), BusError> {
        let header = match decode_request(&frame) {
            Ok(h) => h,
            Err(e) => {
                let preview = &frame[..frame.len().min(REQUEST_HEADER_LEN)];
                tracing::warn!(error = %e, header = %hex::encode(preview), "request dropped");
                return Ok(());
            }
        };
        let opcode = header.opcode()?;
        let address = header.address();
        let length = header.length() as usize;
        let tag = header.tag();
        self.log.push(TransactionRecord {
            opcode,
            options: header.options,
            tag,
            address,
            length: header.length(),
        });

        match opcode {
            Opcode::WriteRequest => {
                let payload = frame.slice(REQUEST_HEADER_LEN..);
                let status = if payload.len() < length {
                    tracing::warn!(length, got = payload.len(), "write payload short");
                    Status::Failed
                } else {
                    self.memory.write(address, &payload[..length])
                };
                tracing::debug!(address = format_args!("0x{address:x}"), length, tag, ?status, "write");
                let response = encode_response(Opcode::WriteResponse, status, tag);
                send_frame(&self.endpoint.response, response.as_bytes()).await?;
            }
            Opcode::ReadRequest => {
                let mut out = BytesMut::zeroed(RESPONSE_HEADER_LEN + length);
                let status = self.memory.read(address, &mut out[RESPONSE_HEADER_LEN..]);
                out[..RESPONSE_HEADER_LEN]
                    .copy_from_slice(encode_response(Opcode::ReadResponse, status, tag).as_bytes());
                tracing::debug!(address = format_args!("0x{address:x}"), length, tag, ?status, "read");
                send_frame(&self.endpoint.response, &out).await?;
            }
            other => tracing::warn!(?other, "non-request opcode dropped"),
        }
        Ok(())
    }
}

// ── Split-channel server ──────────────────────────────────────────────────────

/// Answers split-channel reads and writes against a shared store.
/// Either side may be absent.
pub struct AxiMemoryServer {
    memory: SharedMemory,
    write: Option<AxiWriteTarget>,
    read: Option<AxiReadTarget>,
}

impl AxiMemoryServer {
    pub fn new(memory: SharedMemory, write: Option<AxiWriteTarget>, read: Option<AxiReadTarget>) -> Self {
        Self { memory, write, read }
    }

    pub async fn run(self) -> Result<(), BusError> {
        let Self { memory, write, read } = self;
        let writes = async {
            match write {
                Some(target) => serve_writes(&memory, target).await,
                None => Ok(()),
            }
        };
        let reads = async {
            match read {
                Some(target) => serve_reads(&memory, target).await,
                None => Ok(()),
            }
        };
        let (w, r) = tokio::join!(writes, reads);
        w?;
        r
    }
}

/// Word address carrying beat `beat` of an incrementing burst. Narrow
/// bursts step through the lanes of a word before moving to the next one.
fn beat_word(addr: &AddrBeat, beat: usize) -> u64 {
    let step = 1u64 << addr.size.min(3);
    let start = addr.addr & !(step - 1);
    (start + beat as u64 * step) & !0x7
}

async fn serve_writes(memory: &SharedMemory, mut target: AxiWriteTarget) -> Result<(), BusError> {
    while let Some(addr) = target.addr.recv().await {
        let beats = addr.beats();
        let mut status = Status::Ok;
        for beat in 0..beats {
            let data = recv(&mut target.data).await?;
            status = status.and(memory.merge_word(beat_word(&addr, beat), data.data, data.strb));
            if data.last {
                if beat + 1 != beats {
                    tracing::warn!(expected = beats, got = beat + 1, "write burst ended early");
                }
                break;
            }
        }
        tracing::debug!(addr = format_args!("0x{:x}", addr.addr), beats, ?status, "axi write");
        send(&target.resp, WriteResp { id: addr.id, resp: status_resp(status) }).await?;
    }
    Ok(())
}

async fn serve_reads(memory: &SharedMemory, mut target: AxiReadTarget) -> Result<(), BusError> {
    while let Some(addr) = target.addr.recv().await {
        let beats = addr.beats();
        for beat in 0..beats {
            let word = memory.load::<u64>(beat_word(&addr, beat));
            let data = ReadData {
                id: addr.id,
                data: word.value,
                resp: status_resp(word.status),
                last: beat + 1 == beats,
            };
            send(&target.data, data).await?;
        }
        tracing::debug!(addr = format_args!("0x{:x}", addr.addr), beats, "axi read");
    }
    Ok(())
}
