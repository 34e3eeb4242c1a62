use crate::*;
use smi_core::wire::{DEFAULT_OPTIONS, MEM_OPT_UNBUFFERED};
use smi_core::{Opcode, Status};

/// A 32-bit write followed by a read of the same address returns the value.
#[tokio::test]
async fn test_write_then_read_u32() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);

    let status = rig.port.write_u32(0x2000, DEFAULT_OPTIONS, 0xDEAD_BEEF).await.unwrap();
    assert_eq!(status, Status::Ok);

    let readback = rig.port.read_u32(0x2000, DEFAULT_OPTIONS).await.unwrap();
    assert_eq!(readback.value, 0xDEAD_BEEF);
    assert_eq!(readback.status, Status::Ok);
    assert_eq!(rig.memory.load::<u32>(0x2000).value, 0xDEAD_BEEF);
}

/// Every width round-trips, including values with the top bit set.
#[tokio::test]
async fn test_round_trip_all_widths() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);
    let p = &mut rig.port;

    assert!(p.write_u8(0x100, DEFAULT_OPTIONS, 0xA5).await.unwrap().is_ok());
    assert!(p.write_u16(0x102, DEFAULT_OPTIONS, 0xBEEF).await.unwrap().is_ok());
    assert!(p.write_u32(0x104, DEFAULT_OPTIONS, 0x8000_0001).await.unwrap().is_ok());
    assert!(p.write_u64(0x108, DEFAULT_OPTIONS, u64::MAX - 1).await.unwrap().is_ok());

    assert_eq!(p.read_u8(0x100, DEFAULT_OPTIONS).await.unwrap().value, 0xA5);
    assert_eq!(p.read_u16(0x102, DEFAULT_OPTIONS).await.unwrap().value, 0xBEEF);
    assert_eq!(p.read_u32(0x104, DEFAULT_OPTIONS).await.unwrap().value, 0x8000_0001);
    assert_eq!(p.read_u64(0x108, DEFAULT_OPTIONS).await.unwrap().value, u64::MAX - 1);
}

/// Addresses are masked to the operand alignment before they hit the wire.
#[tokio::test]
async fn test_unaligned_address_is_masked() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);

    rig.port.write_u64(0x3005, DEFAULT_OPTIONS, 0x0102_0304_0506_0708).await.unwrap();
    assert_eq!(rig.memory.load::<u64>(0x3000).value, 0x0102_0304_0506_0708);

    let records = rig.log.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].address, 0x3000);
    assert_eq!(records[0].length, 8);
    assert_eq!(records[0].opcode, Opcode::WriteRequest);
}

/// Options reach the memory side unchanged.
#[tokio::test]
async fn test_options_forwarded() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);

    rig.port.read_u16(0x40, MEM_OPT_UNBUFFERED).await.unwrap();
    let records = rig.log.snapshot();
    assert_eq!(records[0].options, MEM_OPT_UNBUFFERED);
    assert_eq!(records[0].opcode, Opcode::ReadRequest);
}

/// An access the memory rejects comes back as a failed status, and a failed
/// read still yields a value.
#[tokio::test]
async fn test_failed_access_reports_status() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);
    rig.memory.inject_fault(smi_core::FaultRange { start: 0x5000, end: 0x5008 });

    let status = rig.port.write_u32(0x5004, DEFAULT_OPTIONS, 7).await.unwrap();
    assert_eq!(status, Status::Failed);

    let readback = rig.port.read_u32(0x5004, DEFAULT_OPTIONS).await.unwrap();
    assert_eq!(readback.status, Status::Failed);
    assert_eq!(readback.value, 0);

    // Neighbouring words are unaffected.
    assert!(rig.port.write_u32(0x5008, DEFAULT_OPTIONS, 9).await.unwrap().is_ok());
}

/// Reads beyond the end of memory fail instead of wrapping.
#[tokio::test]
async fn test_out_of_range_read_fails() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);

    let readback = rig.port.read_u64(MEMORY_SIZE, DEFAULT_OPTIONS).await.unwrap();
    assert_eq!(readback.status, Status::Failed);
}
