//! Frame codec: byte streams to flits and back, and burst segment planning.
//!
//! A frame is a byte stream (header then payload) cut into eight-byte flits.
//! Every flit but the last carries eofc = 0; the last carries the number of
//! valid bytes it holds. The packer only emits a full flit once it has seen
//! the next byte, so it never has to retract an end marker.

use crate::wire::{Flit, WireError, FLIT_BYTES};

// ── Packing ───────────────────────────────────────────────────────────────────

/// Incrementally cuts a byte stream into flits.
#[derive(Debug, Default)]
pub struct FlitPacker {
    pending: [u8; FLIT_BYTES],
    fill: usize,
}

impl FlitPacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one byte. Returns the previous flit once it is known not to be
    /// the last one.
    pub fn push(&mut self, byte: u8) -> Option<Flit> {
        let mut emitted = None;
        if self.fill == FLIT_BYTES {
            emitted = Some(Flit::new(self.pending, 0));
            self.pending = [0u8; FLIT_BYTES];
            self.fill = 0;
        }
        self.pending[self.fill] = byte;
        self.fill += 1;
        emitted
    }

    /// Append a run of bytes, collecting any completed flits into `out`.
    pub fn push_slice(&mut self, bytes: &[u8], out: &mut Vec<Flit>) {
        for &b in bytes {
            if let Some(flit) = self.push(b) {
                out.push(flit);
            }
        }
    }

    /// Close the frame. Returns the terminating flit, or None if nothing was
    /// ever pushed.
    pub fn finish(self) -> Option<Flit> {
        if self.fill == 0 {
            None
        } else {
            Some(Flit::new(self.pending, self.fill as u8))
        }
    }
}

/// Cut a complete frame into flits.
pub fn frame_flits(bytes: &[u8]) -> Result<Vec<Flit>, WireError> {
    let mut packer = FlitPacker::new();
    let mut flits = Vec::with_capacity(bytes.len().div_ceil(FLIT_BYTES));
    packer.push_slice(bytes, &mut flits);
    flits.push(packer.finish().ok_or(WireError::EmptyFrame)?);
    Ok(flits)
}

// ── Unpacking ─────────────────────────────────────────────────────────────────

/// Reads the byte stream back out of a frame, one flit at a time.
#[derive(Debug)]
pub struct FlitUnpacker {
    current: Flit,
    pos: usize,
    ended: bool,
}

impl FlitUnpacker {
    /// Start a frame at its header flit.
    pub fn new(first: Flit) -> Result<Self, WireError> {
        check_end_marker(&first)?;
        Ok(Self {
            current: first,
            pos: 0,
            ended: first.is_last(),
        })
    }

    /// Next byte of the current flit, or None once it is used up.
    pub fn next_byte(&mut self) -> Option<u8> {
        if self.pos < self.current.valid_len() {
            let b = self.current.data[self.pos];
            self.pos += 1;
            Some(b)
        } else {
            None
        }
    }

    /// Drop up to `n` bytes from the current flit. Returns how many were skipped.
    pub fn skip(&mut self, n: usize) -> usize {
        let skipped = n.min(self.current.valid_len() - self.pos);
        self.pos += skipped;
        skipped
    }

    /// True when the current flit is used up and more flits belong to the frame.
    pub fn needs_flit(&self) -> bool {
        self.pos >= self.current.valid_len() && !self.ended
    }

    /// True when the terminating flit has been fed and fully read.
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.current.valid_len() && self.ended
    }

    /// True once the terminating flit has been fed.
    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Supply the next flit of the frame.
    pub fn feed(&mut self, flit: Flit) -> Result<(), WireError> {
        if self.ended {
            return Err(WireError::PastEndOfFrame);
        }
        check_end_marker(&flit)?;
        self.current = flit;
        self.pos = 0;
        self.ended = flit.is_last();
        Ok(())
    }
}

fn check_end_marker(flit: &Flit) -> Result<(), WireError> {
    if flit.eofc as usize > FLIT_BYTES {
        return Err(WireError::BadEndMarker(flit.eofc));
    }
    Ok(())
}

/// Reassemble the byte stream of a complete frame.
pub fn frame_bytes(flits: &[Flit]) -> Result<Vec<u8>, WireError> {
    let (first, rest) = flits.split_first().ok_or(WireError::EmptyFrame)?;
    let mut unpacker = FlitUnpacker::new(*first)?;
    let mut bytes = Vec::with_capacity(flits.len() * FLIT_BYTES);
    let mut rest = rest.iter();
    loop {
        while let Some(b) = unpacker.next_byte() {
            bytes.push(b);
        }
        if unpacker.has_ended() {
            break;
        }
        match rest.next() {
            Some(flit) => unpacker.feed(*flit)?,
            None => return Err(WireError::Unterminated),
        }
    }
    if rest.next().is_some() {
        return Err(WireError::PastEndOfFrame);
    }
    Ok(bytes)
}

/// Flits needed to buffer one complete frame for a given burst size:
/// the header plus a full burst of payload.
pub fn frame_capacity(burst_size: usize) -> usize {
    burst_size.div_ceil(FLIT_BYTES) + 2
}

// ── Burst segmentation ────────────────────────────────────────────────────────

/// One link-level transfer of a segmented burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub address: u64,
    /// Length in bytes.
    pub length: u16,
}

impl Segment {
    /// Address of the last byte.
    pub fn last(&self) -> u64 {
        self.address + (self.length as u64 - 1)
    }

    /// Address one past the last byte. Wraps to 0 for a segment that ends
    /// at the top of the address space.
    pub fn end(&self) -> u64 {
        self.address.wrapping_add(self.length as u64)
    }
}

/// Iterator over the segments of a burst.
///
/// The first segment runs up to the next burst boundary; every later
/// segment is a full burst except possibly the last.
#[derive(Debug, Clone)]
pub struct SegmentPlan {
    address: u64,
    remaining: u64,
    next_size: u64,
    burst_size: u64,
}

/// Plan the segments for `length` bytes starting at `address`.
///
/// `burst_size` must be a power of two no larger than the 16-bit length
/// field allows; configuration validation guarantees it.
pub fn plan_segments(address: u64, length: u64, burst_size: u16) -> SegmentPlan {
    let burst_size = burst_size as u64;
    let burst_offset = address & (burst_size - 1);
    SegmentPlan {
        address,
        remaining: length,
        next_size: burst_size - burst_offset,
        burst_size,
    }
}

impl Iterator for SegmentPlan {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.remaining == 0 {
            return None;
        }
        let size = self.next_size.min(self.remaining);
        let segment = Segment {
            address: self.address,
            length: size as u16,
        };
        self.address = self.address.wrapping_add(size);
        self.remaining -= size;
        self.next_size = self.burst_size;
        Some(segment)
    }
}
