//! smi-bus: async runtime for the SMI protocol.
//!
//! Links, single-word and burst primitives, frame buffering, the tagged
//! arbiter, the split-channel bus with its arbiters, and simulated memory
//! servers that terminate both kinds of bus.

pub mod arbiter;
pub mod axi;
pub mod axi_arbiter;
pub mod buffer;
pub mod codec;
pub mod error;
pub mod link;
pub mod memory;
pub mod port;
pub mod select;
pub mod tags;

pub use arbiter::{ArbiterHandle, TaggedArbiter};
pub use axi::{AxiReader, AxiWriter};
pub use axi_arbiter::{ReadArbiter, WriteArbiter};
pub use error::BusError;
pub use link::{link, Link, LinkEndpoint};
pub use memory::{AxiMemoryServer, MemoryServer, SharedMemory, TransactionLog, TransactionRecord};
pub use port::{MemoryPort, Readback};
