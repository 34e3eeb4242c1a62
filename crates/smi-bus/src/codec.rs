//! Async frame IO over flit channels.
//!
//! `FrameWriter` streams bytes onto a channel as flits fill up, so a burst
//! payload never has to exist as one contiguous buffer. `ResponseReader`
//! does the reverse for response frames and keeps the link in sync by
//! always consuming through the end-of-frame flit.

use tokio::sync::mpsc;

use smi_core::frame::{frame_flits, FlitPacker, FlitUnpacker};
use smi_core::wire::{decode_response_header, DecodedResponse, RESPONSE_HEADER_LEN};
use smi_core::{Flit, Status, Word};

use crate::link::{recv_flit, send_flit};
use crate::BusError;

// ── Writing ───────────────────────────────────────────────────────────────────

/// Packs a byte stream into flits and sends each one as soon as it is final.
pub struct FrameWriter<'a> {
    tx: &'a mpsc::Sender<Flit>,
    packer: FlitPacker,
    flits: usize,
}

impl<'a> FrameWriter<'a> {
    pub fn new(tx: &'a mpsc::Sender<Flit>) -> Self {
        Self {
            tx,
            packer: FlitPacker::new(),
            flits: 0,
        }
    }

    pub async fn push(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        for &b in bytes {
            if let Some(flit) = self.packer.push(b) {
                send_flit(self.tx, flit).await?;
                self.flits += 1;
            }
        }
        Ok(())
    }

    /// Send the terminating flit. Returns the number of flits in the frame.
    pub async fn finish(self) -> Result<usize, BusError> {
        let last = self.packer.finish().ok_or(smi_core::WireError::EmptyFrame)?;
        send_flit(self.tx, last).await?;
        Ok(self.flits + 1)
    }
}

/// Send a complete frame held in memory.
pub async fn send_frame(tx: &mpsc::Sender<Flit>, bytes: &[u8]) -> Result<usize, BusError> {
    let flits = frame_flits(bytes)?;
    let count = flits.len();
    for flit in flits {
        tracing::trace!(?flit, "tx");
        send_flit(tx, flit).await?;
    }
    Ok(count)
}

/// Receive every flit of one frame.
pub async fn recv_frame(rx: &mut mpsc::Receiver<Flit>) -> Result<Vec<Flit>, BusError> {
    let mut flits = Vec::new();
    loop {
        let flit = recv_flit(rx).await?;
        tracing::trace!(?flit, "rx");
        let last = flit.is_last();
        flits.push(flit);
        if last {
            return Ok(flits);
        }
    }
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// Reads the payload of one response frame.
pub struct ResponseReader<'a> {
    rx: &'a mut mpsc::Receiver<Flit>,
    unpacker: FlitUnpacker,
    header: DecodedResponse,
    payload_read: usize,
}

impl<'a> ResponseReader<'a> {
    /// Wait for a response header flit and position after the 4-byte header.
    pub async fn open(rx: &'a mut mpsc::Receiver<Flit>) -> Result<Self, BusError> {
        let first = recv_flit(rx).await?;
        let header = decode_response_header(&first);
        let mut unpacker = FlitUnpacker::new(first)?;
        let header_len = unpacker.skip(RESPONSE_HEADER_LEN);
        let mut reader = Self {
            rx,
            unpacker,
            header,
            payload_read: 0,
        };
        if header_len < RESPONSE_HEADER_LEN {
            // Too short to hold a header; consume it and report.
            reader.drain().await?;
            return Err(BusError::TruncatedFrame(0));
        }
        Ok(reader)
    }

    pub fn status(&self) -> Status {
        self.header.status
    }

    pub fn tag(&self) -> u16 {
        self.header.tag
    }

    pub fn opcode(&self) -> u8 {
        self.header.opcode
    }

    /// Next payload byte, or None once the frame has ended.
    pub async fn next_byte(&mut self) -> Result<Option<u8>, BusError> {
        loop {
            if let Some(b) = self.unpacker.next_byte() {
                self.payload_read += 1;
                return Ok(Some(b));
            }
            if self.unpacker.has_ended() {
                return Ok(None);
            }
            let flit = recv_flit(self.rx).await?;
            self.unpacker.feed(flit)?;
        }
    }

    /// Read one little-endian word from the payload.
    pub async fn read_word<T: Word>(&mut self) -> Result<T, BusError> {
        let mut lanes = [0u8; 8];
        for lane in lanes.iter_mut().take(T::WIDTH.bytes()) {
            match self.next_byte().await? {
                Some(b) => *lane = b,
                None => return Err(BusError::TruncatedFrame(self.payload_read)),
            }
        }
        Ok(T::read_lanes(&lanes))
    }

    async fn drain(&mut self) -> Result<(), BusError> {
        while !self.unpacker.has_ended() {
            let flit = recv_flit(self.rx).await?;
            self.unpacker.feed(flit)?;
        }
        Ok(())
    }

    /// Consume the rest of the frame and return its status.
    pub async fn finish(mut self) -> Result<Status, BusError> {
        self.drain().await?;
        Ok(self.header.status)
    }
}
