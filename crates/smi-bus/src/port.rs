//! MemoryPort: single-word and burst access over one SMI link.
//!
//! A port owns its link, so requests and responses on it are strictly
//! sequential: every call sends exactly one request frame per segment and
//! consumes exactly one response frame per segment before returning.
//! Share a link between concurrent users with a `TaggedArbiter`.

use tokio::sync::mpsc;
use zerocopy::AsBytes;

use smi_core::frame::{frame_capacity, plan_segments, Segment};
use smi_core::lanes::to_lanes;
use smi_core::wire::{encode_request, Opcode};
use smi_core::{BusConfig, Status, Word};

use crate::buffer::{assemble_frame, forward_frame};
use crate::codec::{send_frame, FrameWriter, ResponseReader};
use crate::{BusError, Link};

/// Value read from memory together with the transaction outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readback<T> {
    pub value: T,
    pub status: Status,
}

pub struct MemoryPort {
    link: Link,
    burst_size: u16,
    frame_capacity: usize,
}

impl MemoryPort {
    /// Wrap a link. Fails if the configured burst size cannot be used to
    /// segment bursts.
    pub fn new(link: Link, config: &BusConfig) -> Result<Self, BusError> {
        if !config.burst_size_valid() {
            return Err(BusError::BurstSize(config.burst_size));
        }
        Ok(Self {
            link,
            burst_size: config.burst_size,
            frame_capacity: config.frame_capacity(),
        })
    }

    // ── Single transfers ──────────────────────────────────────────────────────

    /// Write one value. The address is rounded down to the value's alignment.
    pub async fn write<T: Word>(&mut self, address: u64, options: u8, value: T) -> Result<Status, BusError> {
        let width = T::WIDTH.bytes();
        let address = T::WIDTH.align(address);
        let header = encode_request(Opcode::WriteRequest, options, address, width as u16, 0);

        let mut frame = Vec::with_capacity(header.as_bytes().len() + width);
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&to_lanes(value)[..width]);
        send_frame(&self.link.request, &frame).await?;

        let status = ResponseReader::open(&mut self.link.response).await?.finish().await?;
        tracing::debug!(width = %T::WIDTH, address = format_args!("0x{address:x}"), ?status, "write");
        Ok(status)
    }

    /// Read one value. The address is rounded down to the value's alignment.
    pub async fn read<T: Word>(&mut self, address: u64, options: u8) -> Result<Readback<T>, BusError> {
        let address = T::WIDTH.align(address);
        let header = encode_request(Opcode::ReadRequest, options, address, T::WIDTH.bytes() as u16, 0);
        send_frame(&self.link.request, header.as_bytes()).await?;

        let mut reader = ResponseReader::open(&mut self.link.response).await?;
        let value = reader.read_word::<T>().await?;
        let status = reader.finish().await?;
        tracing::debug!(width = %T::WIDTH, address = format_args!("0x{address:x}"), ?status, "read");
        Ok(Readback { value, status })
    }

    // ── Bursts ────────────────────────────────────────────────────────────────

    /// Write `count` elements taken from `source`, split so that no segment
    /// crosses a burst boundary. Every segment is issued even after one
    /// fails; the result is the AND of all segment statuses.
    pub async fn write_burst<T: Word>(
        &mut self,
        address: u64,
        options: u8,
        count: u32,
        source: &mut mpsc::Receiver<T>,
    ) -> Result<Status, BusError> {
        let address = T::WIDTH.align(address);
        let length = count as u64 * T::WIDTH.bytes() as u64;
        let mut status = Status::Ok;
        for segment in plan_segments(address, length, self.burst_size) {
            tracing::trace!(address = format_args!("0x{:x}", segment.address), length = segment.length, "write segment");
            status = status.and(self.write_segment(segment, options, source).await?);
        }
        Ok(status)
    }

    /// Read `count` elements into `sink`, segmented like `write_burst`.
    /// If the sink is dropped the remaining values are discarded but every
    /// response is still consumed.
    pub async fn read_burst<T: Word>(
        &mut self,
        address: u64,
        options: u8,
        count: u32,
        sink: &mpsc::Sender<T>,
    ) -> Result<Status, BusError> {
        let address = T::WIDTH.align(address);
        let length = count as u64 * T::WIDTH.bytes() as u64;
        let mut status = Status::Ok;
        for segment in plan_segments(address, length, self.burst_size) {
            tracing::trace!(address = format_args!("0x{:x}", segment.address), length = segment.length, "read segment");
            status = status.and(self.read_segment(segment, options, sink).await?);
        }
        Ok(status)
    }

    /// Write `count` elements as one segment. The caller guarantees the span
    /// does not cross a burst boundary.
    pub async fn write_paged_burst<T: Word>(
        &mut self,
        address: u64,
        options: u8,
        count: u16,
        source: &mut mpsc::Receiver<T>,
    ) -> Result<Status, BusError> {
        match paged_segment::<T>(address, count)? {
            Some(segment) => self.write_segment(segment, options, source).await,
            None => Ok(Status::Ok),
        }
    }

    /// Read `count` elements as one segment.
    pub async fn read_paged_burst<T: Word>(
        &mut self,
        address: u64,
        options: u8,
        count: u16,
        sink: &mpsc::Sender<T>,
    ) -> Result<Status, BusError> {
        match paged_segment::<T>(address, count)? {
            Some(segment) => self.read_segment(segment, options, sink).await,
            None => Ok(Status::Ok),
        }
    }

    fn segment_capacity(&self, segment: &Segment) -> usize {
        self.frame_capacity.max(frame_capacity(segment.length as usize))
    }

    /// Frame the segment in a side task and hand it to the link only once it
    /// is complete, then wait for the write response.
    async fn write_segment<T: Word>(
        &mut self,
        segment: Segment,
        options: u8,
        source: &mut mpsc::Receiver<T>,
    ) -> Result<Status, BusError> {
        let capacity = self.segment_capacity(&segment);
        let count = segment.length as usize / T::WIDTH.bytes();
        let (tx, mut rx) = mpsc::channel(capacity);

        let produce = async move {
            let header = encode_request(Opcode::WriteRequest, options, segment.address, segment.length, 0);
            let mut writer = FrameWriter::new(&tx);
            writer.push(header.as_bytes()).await?;
            for _ in 0..count {
                let value = source.recv().await.ok_or(BusError::SourceExhausted)?;
                writer.push(&to_lanes(value)[..T::WIDTH.bytes()]).await?;
            }
            writer.finish().await
        };
        let assemble = assemble_frame(&mut rx, &self.link.request, capacity);

        let (produced, assembled) = tokio::join!(produce, assemble);
        produced?;
        assembled?;

        ResponseReader::open(&mut self.link.response).await?.finish().await
    }

    /// Send the read request, then forward the response through a side
    /// queue while decoding elements into the sink.
    async fn read_segment<T: Word>(
        &mut self,
        segment: Segment,
        options: u8,
        sink: &mpsc::Sender<T>,
    ) -> Result<Status, BusError> {
        let header = encode_request(Opcode::ReadRequest, options, segment.address, segment.length, 0);
        send_frame(&self.link.request, header.as_bytes()).await?;

        let capacity = self.segment_capacity(&segment);
        let count = segment.length as usize / T::WIDTH.bytes();
        let (tx, mut rx) = mpsc::channel(capacity);
        let response = &mut self.link.response;

        let forward = async move { forward_frame(response, &tx, capacity).await };
        let decode = async {
            let mut reader = ResponseReader::open(&mut rx).await?;
            for _ in 0..count {
                let value = reader.read_word::<T>().await?;
                // A dropped sink only loses values; the frame is still consumed.
                let _ = sink.send(value).await;
            }
            reader.finish().await
        };

        let (forwarded, status) = tokio::join!(forward, decode);
        forwarded?;
        status
    }
}

/// Single segment for a paged burst, or None when there is nothing to send.
fn paged_segment<T: Word>(address: u64, count: u16) -> Result<Option<Segment>, BusError> {
    let length = count as u64 * T::WIDTH.bytes() as u64;
    if length == 0 {
        return Ok(None);
    }
    let length = u16::try_from(length).map_err(|_| BusError::BurstTooLong(length))?;
    Ok(Some(Segment {
        address: T::WIDTH.align(address),
        length,
    }))
}

// ── Per-width entry points ────────────────────────────────────────────────────

macro_rules! width_aliases {
    ($ty:ty, $write:ident, $read:ident, $write_burst:ident, $read_burst:ident) => {
        impl MemoryPort {
            pub async fn $write(&mut self, address: u64, options: u8, value: $ty) -> Result<Status, BusError> {
                self.write::<$ty>(address, options, value).await
            }

            pub async fn $read(&mut self, address: u64, options: u8) -> Result<Readback<$ty>, BusError> {
                self.read::<$ty>(address, options).await
            }

            pub async fn $write_burst(
                &mut self,
                address: u64,
                options: u8,
                count: u32,
                source: &mut mpsc::Receiver<$ty>,
            ) -> Result<Status, BusError> {
                self.write_burst::<$ty>(address, options, count, source).await
            }

            pub async fn $read_burst(
                &mut self,
                address: u64,
                options: u8,
                count: u32,
                sink: &mpsc::Sender<$ty>,
            ) -> Result<Status, BusError> {
                self.read_burst::<$ty>(address, options, count, sink).await
            }
        }
    };
}

width_aliases!(u8, write_u8, read_u8, write_burst_u8, read_burst_u8);
width_aliases!(u16, write_u16, read_u16, write_burst_u16, read_burst_u16);
width_aliases!(u32, write_u32, read_u32, write_burst_u32, read_burst_u32);
width_aliases!(u64, write_u64, read_u64, write_burst_u64, read_burst_u64);
