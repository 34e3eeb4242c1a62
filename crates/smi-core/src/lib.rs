//! smi-core: SMI wire format, lane codecs, frame packing and configuration.
//! All other SMI crates depend on this one.

pub mod config;
pub mod frame;
pub mod lanes;
pub mod wire;

pub use config::{BusConfig, ConfigError, FaultRange, MemoryConfig, MemtestConfig, SmiConfig};
pub use frame::{frame_bytes, frame_flits, plan_segments, FlitPacker, FlitUnpacker, Segment};
pub use lanes::Word;
pub use wire::{Flit, Opcode, Status, WireError, Width};
