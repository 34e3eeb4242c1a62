use crate::*;
use smi_core::{FaultRange, Opcode, Status};

/// Four u32 values written as one burst land contiguously.
#[tokio::test]
async fn test_burst_of_four_u32() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);
    let values = [0x1111_1111u32, 0x2222_2222, 0x3333_3333, 0x4444_4444];

    let status = write_values(&mut rig.port, 0x4000, &values).await.unwrap();
    assert_eq!(status, Status::Ok);
    for (i, v) in values.iter().enumerate() {
        assert_eq!(rig.memory.load::<u32>(0x4000 + 4 * i as u64).value, *v);
    }

    let (read, status) = read_values::<u32>(&mut rig.port, 0x4000, 4).await.unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(read, values);

    // One write and one read, 16 bytes each.
    let records = rig.log.snapshot();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.length == 16 && r.address == 0x4000));
}

/// A single 32-bit write is visible as element 0 of a following burst read.
#[tokio::test]
async fn test_single_write_then_burst_read() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);

    let status = rig.port.write_u32(0x1000, 0, 0xDEAD_BEEF).await.unwrap();
    assert_eq!(status, Status::Ok);

    let (read, status) = read_values::<u32>(&mut rig.port, 0x1000, 4).await.unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(read, vec![0xDEAD_BEEF, 0, 0, 0]);
}

/// A burst that straddles a 256-byte boundary is split at the boundary.
#[tokio::test]
async fn test_burst_split_at_boundary() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);
    let values: Vec<u8> = (1..=20).collect();

    let status = write_values(&mut rig.port, 0x10FA, &values).await.unwrap();
    assert_eq!(status, Status::Ok);

    let records = rig.log.snapshot();
    let spans: Vec<(u64, u16)> = records.iter().map(|r| (r.address, r.length)).collect();
    assert_eq!(spans, vec![(0x10FA, 6), (0x1100, 14)]);
    assert!(records.iter().all(|r| r.opcode == Opcode::WriteRequest));

    let (read, status) = read_values::<u8>(&mut rig.port, 0x10FA, 20).await.unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(read, values);
    assert_eq!(rig.log.len(), 4);
}

/// No request emitted for a long burst crosses a boundary, and every segment
/// is within the burst size.
#[tokio::test]
async fn test_long_burst_respects_boundaries() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);
    let values: Vec<u16> = (0..1000u16).map(|i| i.wrapping_mul(31)).collect();

    let status = write_values(&mut rig.port, 0x7F32, &values).await.unwrap();
    assert_eq!(status, Status::Ok);

    let records = rig.log.snapshot();
    let total: u64 = records.iter().map(|r| r.length as u64).sum();
    assert_eq!(total, 2000);
    for r in &records {
        assert!(r.length as u64 <= 256);
        assert_eq!(r.address / 256, (r.address + r.length as u64 - 1) / 256, "{r:?} crosses a boundary");
    }

    let (read, status) = read_values::<u16>(&mut rig.port, 0x7F32, 1000).await.unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(read, values);
}

/// A smaller configured burst size segments accordingly.
#[tokio::test]
async fn test_configured_burst_size() {
    let config = BusConfig {
        burst_size: 64,
        ..BusConfig::default()
    };
    let mut rig = direct_rig(&config);
    let values: Vec<u64> = (0..20).collect();

    write_values(&mut rig.port, 0x9000, &values).await.unwrap();
    let lengths: Vec<u16> = rig.log.snapshot().iter().map(|r| r.length).collect();
    assert_eq!(lengths, vec![64, 64, 32]);
}

/// One failing segment fails the burst, but every segment is still issued
/// and the readback still delivers every element.
#[tokio::test]
async fn test_failed_segment_still_issues_all() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);
    rig.memory.inject_fault(FaultRange { start: 0x2100, end: 0x2108 });
    let values: Vec<u64> = (100..175).collect();

    let status = write_values(&mut rig.port, 0x2000, &values).await.unwrap();
    assert_eq!(status, Status::Failed);
    assert_eq!(rig.log.len(), 3);
    // Segments either side of the fault were written.
    assert_eq!(rig.memory.load::<u64>(0x2000).value, 100);
    assert_eq!(rig.memory.load::<u64>(0x2200).value, 164);

    let (read, status) = read_values::<u64>(&mut rig.port, 0x2000, 75).await.unwrap();
    assert_eq!(status, Status::Failed);
    assert_eq!(read.len(), 75);
    assert_eq!(read[0], 100);
    assert_eq!(read[32], 0);
    assert_eq!(read[74], 174);
    assert_eq!(rig.log.len(), 6);
}

/// A zero-length burst issues nothing and succeeds.
#[tokio::test]
async fn test_zero_length_burst() {
    let config = BusConfig::default();
    let mut rig = direct_rig(&config);

    let status = write_values::<u32>(&mut rig.port, 0x100, &[]).await.unwrap();
    assert_eq!(status, Status::Ok);
    let (read, status) = read_values::<u32>(&mut rig.port, 0x100, 0).await.unwrap();
    assert!(read.is_empty());
    assert_eq!(status, Status::Ok);
    assert!(rig.log.is_empty());
}
