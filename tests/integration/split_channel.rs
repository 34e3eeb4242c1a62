use crate::*;
use smi_bus::axi::{axi_read_bus, axi_write_bus};
use smi_bus::{AxiMemoryServer, AxiReader, AxiWriter, ReadArbiter, WriteArbiter};
use smi_core::{FaultRange, Status};

/// Narrow writes from several ports merge into shared words without
/// clobbering each other's lanes.
#[tokio::test]
async fn test_narrow_writes_merge_through_arbiters() {
    let config = BusConfig::default();
    let memory = SharedMemory::new(MEMORY_SIZE);
    let (write_bus, write_target) = axi_write_bus(config.link_capacity);
    let (read_bus, read_target) = axi_read_bus(config.link_capacity);
    tokio::spawn(AxiMemoryServer::new(memory.clone(), Some(write_target), Some(read_target)).run());

    let (writes, write_ports) = WriteArbiter::spawn(write_bus, 4, &config).unwrap();
    let (reads, read_ports) = ReadArbiter::spawn(read_bus, 4, &config).unwrap();

    let mut tasks = Vec::new();
    for (i, (w, r)) in write_ports.into_iter().zip(read_ports).enumerate() {
        tasks.push(tokio::spawn(async move {
            let mut writer = AxiWriter::new(w);
            let mut reader = AxiReader::new(r);
            // Port i owns bytes 2i and 2i + 1 of every word.
            for word in 0..8u64 {
                let address = 0x6000 + word * 8 + 2 * i as u64;
                let value = (word as u16) << 8 | i as u16;
                assert_eq!(writer.write(address, i % 2 == 0, value).await.unwrap(), Status::Ok);
            }
            for word in 0..8u64 {
                let address = 0x6000 + word * 8 + 2 * i as u64;
                let readback = reader.read::<u16>(address, false).await.unwrap();
                assert_eq!(readback.value, (word as u16) << 8 | i as u16);
            }
        }));
    }
    for task in tasks {
        tokio::time::timeout(STEP_TIMEOUT, task).await.unwrap().unwrap();
    }

    for word in 0..8u64 {
        let lanes = memory.load::<u64>(0x6000 + word * 8).value.to_le_bytes();
        for i in 0..4 {
            assert_eq!(lanes[2 * i], i as u8);
            assert_eq!(lanes[2 * i + 1], word as u8);
        }
    }
    writes.shutdown().await;
    reads.shutdown().await;
}

/// Long split-channel bursts are cut at 64 beats and read back intact.
#[tokio::test]
async fn test_split_channel_burst_round_trip() {
    let config = BusConfig::default();
    let memory = SharedMemory::new(MEMORY_SIZE);
    let (write_bus, write_target) = axi_write_bus(config.link_capacity);
    let (read_bus, read_target) = axi_read_bus(config.link_capacity);
    tokio::spawn(AxiMemoryServer::new(memory.clone(), Some(write_target), Some(read_target)).run());
    let mut writer = AxiWriter::new(write_bus);
    let mut reader = AxiReader::new(read_bus);

    let values: Vec<u64> = (0..150u64).map(|k| k * 0x0101_0101).collect();
    let (tx, mut rx) = mpsc::channel(values.len());
    for v in &values {
        tx.send(*v).await.unwrap();
    }
    let status = writer.write_burst_u64(0xA000, true, 150, &mut rx).await.unwrap();
    assert_eq!(status, Status::Ok);

    let (tx, mut rx) = mpsc::channel(values.len());
    let status = reader.read_burst_u64(0xA000, false, 150, &tx).await.unwrap();
    assert_eq!(status, Status::Ok);
    drop(tx);
    let mut read = Vec::new();
    while let Some(v) = rx.recv().await {
        read.push(v);
    }
    assert_eq!(read, values);
}

/// Narrow split-channel bursts pack one element per lane group and read
/// back in order, for every width.
#[tokio::test]
async fn test_split_channel_narrow_bursts() {
    let config = BusConfig::default();
    let memory = SharedMemory::new(MEMORY_SIZE);
    let (write_bus, write_target) = axi_write_bus(config.link_capacity);
    let (read_bus, read_target) = axi_read_bus(config.link_capacity);
    tokio::spawn(AxiMemoryServer::new(memory.clone(), Some(write_target), Some(read_target)).run());
    let mut writer = AxiWriter::new(write_bus);
    let mut reader = AxiReader::new(read_bus);

    // 70 u16 values from an odd word offset: two bursts, 64 + 6 beats.
    let values: Vec<u16> = (0..70u16).map(|k| 0x1000 + k).collect();
    let (tx, mut rx) = mpsc::channel(values.len());
    for v in &values {
        tx.send(*v).await.unwrap();
    }
    let status = writer.write_burst_u16(0xC006, false, 70, &mut rx).await.unwrap();
    assert_eq!(status, Status::Ok);
    for (k, v) in values.iter().enumerate() {
        assert_eq!(memory.load::<u16>(0xC006 + 2 * k as u64).value, *v);
    }
    // Bytes either side of the burst are untouched.
    assert_eq!(memory.load::<u16>(0xC004).value, 0);
    assert_eq!(memory.load::<u16>(0xC006 + 140).value, 0);

    let (tx, mut rx) = mpsc::channel(values.len());
    let status = reader.read_burst_u16(0xC006, false, 70, &tx).await.unwrap();
    assert_eq!(status, Status::Ok);
    drop(tx);
    let mut read = Vec::new();
    while let Some(v) = rx.recv().await {
        read.push(v);
    }
    assert_eq!(read, values);

    let bytes: Vec<u8> = (1..=9).collect();
    let (tx, mut rx) = mpsc::channel(bytes.len());
    for b in &bytes {
        tx.send(*b).await.unwrap();
    }
    assert!(writer.write_burst_u8(0xD003, true, 9, &mut rx).await.unwrap().is_ok());
    let (tx, mut rx) = mpsc::channel(bytes.len());
    assert!(reader.read_burst_u8(0xD003, true, 9, &tx).await.unwrap().is_ok());
    drop(tx);
    let mut read = Vec::new();
    while let Some(b) = rx.recv().await {
        read.push(b);
    }
    assert_eq!(read, bytes);
}

/// A fault inside one burst fails the transfer but not its neighbours.
#[tokio::test]
async fn test_split_channel_fault_reported() {
    let config = BusConfig::default();
    let memory = SharedMemory::new(MEMORY_SIZE);
    memory.inject_fault(FaultRange { start: 0xB000, end: 0xB004 });
    let (write_bus, write_target) = axi_write_bus(config.link_capacity);
    let (read_bus, read_target) = axi_read_bus(config.link_capacity);
    tokio::spawn(AxiMemoryServer::new(memory.clone(), Some(write_target), Some(read_target)).run());
    let mut writer = AxiWriter::new(write_bus);
    let mut reader = AxiReader::new(read_bus);

    assert_eq!(writer.write(0xB000, false, 1u32).await.unwrap(), Status::Failed);
    assert_eq!(writer.write(0xB008, false, 2u32).await.unwrap(), Status::Ok);
    assert_eq!(reader.read::<u32>(0xB000, false).await.unwrap().status, Status::Failed);
    assert_eq!(reader.read::<u32>(0xB008, false).await.unwrap().value, 2);
}
