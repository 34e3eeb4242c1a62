//! Per-width byte lane codecs.
//!
//! Payload data travels little-endian. An SMI frame packs elements back to
//! back in the byte stream after the header; a split-channel data beat is a
//! full 64-bit word in which a narrow value occupies the lanes selected by
//! its address offset, with a strobe bit set for each written lane.

use crate::wire::Width;

/// A fixed-width unsigned value that can travel over the bus.
pub trait Word: Copy + Default + PartialEq + Send + Sync + std::fmt::Debug + 'static {
    const WIDTH: Width;

    /// Write the value's little-endian bytes to `out[..WIDTH.bytes()]`.
    fn write_lanes(self, out: &mut [u8]);

    /// Read a value from `lanes[..WIDTH.bytes()]`.
    fn read_lanes(lanes: &[u8]) -> Self;

    /// Low bits of a 64-bit value.
    fn truncate(value: u64) -> Self;

    fn widen(self) -> u64;

    fn wrapping_add(self, rhs: Self) -> Self;
}

macro_rules! impl_word {
    ($ty:ty, $width:expr) => {
        impl Word for $ty {
            const WIDTH: Width = $width;

            fn write_lanes(self, out: &mut [u8]) {
                out[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
            }

            fn read_lanes(lanes: &[u8]) -> Self {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                bytes.copy_from_slice(&lanes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(bytes)
            }

            fn truncate(value: u64) -> Self {
                value as $ty
            }

            fn widen(self) -> u64 {
                self as u64
            }

            fn wrapping_add(self, rhs: Self) -> Self {
                <$ty>::wrapping_add(self, rhs)
            }
        }
    };
}

impl_word!(u8, Width::U8);
impl_word!(u16, Width::U16);
impl_word!(u32, Width::U32);
impl_word!(u64, Width::U64);

/// Little-endian bytes of a value, in an 8-byte scratch buffer.
pub fn to_lanes<T: Word>(value: T) -> [u8; 8] {
    let mut lanes = [0u8; 8];
    value.write_lanes(&mut lanes);
    lanes
}

/// Lane offset of an aligned `T` inside a 64-bit beat.
pub fn beat_offset<T: Word>(address: u64) -> usize {
    (T::WIDTH.align(address) & 0x7) as usize
}

/// Place `value` in a 64-bit beat at the lanes its address selects.
/// Returns (beat data, strobe), one strobe bit per written lane.
pub fn place_in_beat<T: Word>(address: u64, value: T) -> (u64, u8) {
    let offset = beat_offset::<T>(address);
    let width = T::WIDTH.bytes();
    let data = value.widen() << (offset * 8);
    let strobe = (((1u16 << width) - 1) as u8) << offset;
    (data, strobe)
}

/// Extract the `T` at `address` from a 64-bit beat.
pub fn extract_from_beat<T: Word>(address: u64, beat: u64) -> T {
    let offset = beat_offset::<T>(address);
    T::truncate(beat >> (offset * 8))
}

/// Merge the strobed lanes of `data` into `current`.
pub fn apply_strobe(current: u64, data: u64, strobe: u8) -> u64 {
    let mut mask = 0u64;
    for lane in 0..8 {
        if strobe & (1 << lane) != 0 {
            mask |= 0xFF << (lane * 8);
        }
    }
    (current & !mask) | (data & mask)
}
