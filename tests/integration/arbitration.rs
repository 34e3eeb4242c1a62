use crate::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smi_bus::codec::{recv_frame, send_frame};
use smi_bus::{LinkEndpoint, TaggedArbiter};
use smi_core::wire::{decode_request, encode_request, encode_response, DEFAULT_OPTIONS};
use smi_core::{frame_bytes, Opcode, Status};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use zerocopy::AsBytes;

/// Ports sharing one link through the arbiter all see their own data.
#[tokio::test]
async fn test_ports_share_memory_through_arbiter() {
    let config = BusConfig::default();
    let memory = SharedMemory::new(MEMORY_SIZE);
    let (downstream, log) = serve(&config, &memory);
    let (handle, links) = TaggedArbiter::spawn(downstream, 4, &config).unwrap();

    let mut tasks = Vec::new();
    for (i, l) in links.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            let mut port = MemoryPort::new(l, &config).unwrap();
            let base = 0x10_000 * (i as u64 + 1) + 0xF0;
            let values: Vec<u32> = (0..200).map(|k| (i as u32) << 24 | k).collect();
            assert_eq!(write_values(&mut port, base, &values).await.unwrap(), Status::Ok);
            let (read, status) = read_values::<u32>(&mut port, base, 200).await.unwrap();
            assert_eq!(status, Status::Ok);
            assert_eq!(read, values);
        }));
    }
    for task in tasks {
        tokio::time::timeout(STEP_TIMEOUT, task).await.unwrap().unwrap();
    }

    // Every request reached memory with an arbiter-assigned tag naming a
    // valid port.
    let records = log.snapshot();
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| (1..=4).contains(&(r.tag & 0xFF))));
    handle.shutdown().await;
}

/// Collect `n` requests, check their tags are unique, then answer them in
/// reverse order with each request's address as the read value.
async fn answer_in_reverse(mut endpoint: LinkEndpoint, n: usize) -> Result<Vec<u16>> {
    let mut pending = Vec::with_capacity(n);
    for _ in 0..n {
        let flits = recv_frame(&mut endpoint.request).await?;
        let bytes = frame_bytes(&flits)?;
        let header = decode_request(&bytes)?;
        assert_eq!(header.opcode()?, Opcode::ReadRequest);
        pending.push((header.tag(), header.address()));
    }
    let tags: Vec<u16> = pending.iter().map(|(t, _)| *t).collect();
    let unique: HashSet<u16> = tags.iter().copied().collect();
    assert_eq!(unique.len(), n, "duplicate tags in flight: {tags:?}");

    for (tag, address) in pending.into_iter().rev() {
        let mut frame = encode_response(Opcode::ReadResponse, Status::Ok, tag).as_bytes().to_vec();
        frame.extend_from_slice(&address.to_le_bytes());
        send_frame(&endpoint.response, &frame).await?;
    }
    Ok(tags)
}

/// Responses returning out of order are steered by tag to the port that
/// issued them.
#[tokio::test]
async fn test_out_of_order_responses_reach_their_ports() {
    let config = BusConfig::default();
    let (downstream, endpoint) = link(config.link_capacity);
    let (handle, links) = TaggedArbiter::spawn(downstream, 3, &config).unwrap();
    let responder = tokio::spawn(answer_in_reverse(endpoint, 3));

    let mut tasks = Vec::new();
    for (i, l) in links.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            let mut port = MemoryPort::new(l, &config).unwrap();
            let address = 0x1000 * (i as u64 + 1);
            let readback = port.read_u64(address, DEFAULT_OPTIONS).await.unwrap();
            assert_eq!(readback.value, address, "port {} got another port's data", i + 1);
            assert_eq!(readback.status, Status::Ok);
        }));
    }
    for task in tasks {
        tokio::time::timeout(STEP_TIMEOUT, task).await.unwrap().unwrap();
    }

    let tags = responder.await.unwrap().unwrap();
    let ports: HashSet<u8> = tags.iter().map(|t| (t & 0xFF) as u8).collect();
    assert_eq!(ports, HashSet::from([1, 2, 3]));
    handle.shutdown().await;
}

/// A port hammering the link does not starve another port.
#[tokio::test]
async fn test_busy_port_does_not_starve_another() {
    let config = BusConfig::default();
    let memory = SharedMemory::new(MEMORY_SIZE);
    let (downstream, _log) = serve(&config, &memory);
    let (handle, mut links) = TaggedArbiter::spawn(downstream, 2, &config).unwrap();
    let quiet = links.pop().unwrap();
    let busy = links.pop().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let hammer = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut port = MemoryPort::new(busy, &config).unwrap();
            let values: Vec<u64> = (0..32).collect();
            let mut rounds = 0u32;
            while !stop.load(Ordering::Relaxed) {
                write_values(&mut port, 0x8000, &values).await.unwrap();
                rounds += 1;
            }
            rounds
        })
    };

    let mut port = MemoryPort::new(quiet, &config).unwrap();
    for k in 0..20u64 {
        let status = tokio::time::timeout(STEP_TIMEOUT, port.write_u64(0x100 + 8 * k, DEFAULT_OPTIONS, k))
            .await
            .expect("quiet port starved")
            .unwrap();
        assert!(status.is_ok());
    }
    stop.store(true, Ordering::Relaxed);
    let rounds = tokio::time::timeout(STEP_TIMEOUT, hammer).await.unwrap().unwrap();
    assert!(rounds > 0);

    for k in 0..20u64 {
        assert_eq!(memory.load::<u64>(0x100 + 8 * k).value, k);
    }
    handle.shutdown().await;
}

/// Original tag a port puts on its `k`th request in a round.
fn original_tag(port: usize, round: usize, k: usize) -> u16 {
    0xA000 | (port as u16) << 8 | (round as u16) << 4 | k as u16
}

/// Address a port reads on its `k`th request; doubles as the payload the
/// responder sends back, so a misrouted response is visible.
fn port_address(port: usize, round: usize, k: usize) -> u64 {
    0x10_0000 * (port as u64 + 1) + 0x100 * round as u64 + 8 * k as u64
}

/// Every port fills its in-flight budget with raw requests, the memory side
/// answers them in shuffled order, and each port gets back exactly its own
/// payloads under its own tags. Downstream never sees two live requests
/// with the same (port, local tag).
#[tokio::test]
async fn test_tags_unique_with_full_in_flight_budget() {
    const PORTS: usize = 3;
    const ROUNDS: usize = 2;
    let config = BusConfig::default();
    let limit = config.in_flight_limit as usize;
    let (downstream, mut endpoint) = link(config.link_capacity);
    let (handle, mut links) = TaggedArbiter::spawn(downstream, PORTS, &config).unwrap();

    let responder = tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(5);
        let mut seen = Vec::new();
        for _ in 0..ROUNDS {
            let mut live = Vec::with_capacity(PORTS * limit);
            for _ in 0..PORTS * limit {
                let flits = recv_frame(&mut endpoint.request).await?;
                let header = decode_request(&frame_bytes(&flits)?)?;
                live.push((header.tag(), header.address()));
            }
            let tags: HashSet<u16> = live.iter().map(|(t, _)| *t).collect();
            assert_eq!(tags.len(), live.len(), "live tags collide: {live:x?}");
            seen.extend(live.iter().map(|(t, _)| *t));

            live.shuffle(&mut rng);
            for (tag, address) in live {
                let mut frame = encode_response(Opcode::ReadResponse, Status::Ok, tag).as_bytes().to_vec();
                frame.extend_from_slice(&address.to_le_bytes());
                send_frame(&endpoint.response, &frame).await?;
            }
        }
        Ok::<_, anyhow::Error>(seen)
    });

    for round in 0..ROUNDS {
        for (port, l) in links.iter().enumerate() {
            for k in 0..limit {
                let header = encode_request(
                    Opcode::ReadRequest,
                    DEFAULT_OPTIONS,
                    port_address(port, round, k),
                    8,
                    original_tag(port, round, k),
                );
                send_frame(&l.request, header.as_bytes()).await.unwrap();
            }
        }

        for (port, l) in links.iter_mut().enumerate() {
            let mut received = HashSet::new();
            for _ in 0..limit {
                let flits = tokio::time::timeout(STEP_TIMEOUT, recv_frame(&mut l.response))
                    .await
                    .unwrap()
                    .unwrap();
                let bytes = frame_bytes(&flits).unwrap();
                assert_eq!(bytes[0], u8::from(Opcode::ReadResponse));
                let tag = u16::from_le_bytes([bytes[2], bytes[3]]);
                let mut payload = [0u8; 8];
                payload.copy_from_slice(&bytes[4..12]);
                let address = u64::from_le_bytes(payload);

                let k = (0..limit)
                    .find(|&k| original_tag(port, round, k) == tag)
                    .unwrap_or_else(|| panic!("port {} got foreign tag 0x{tag:04x}", port + 1));
                assert_eq!(address, port_address(port, round, k), "port {} got another port's data", port + 1);
                assert!(received.insert(k), "response {k} delivered twice");
            }
            assert_eq!(received.len(), limit);
        }
    }

    let seen = responder.await.unwrap().unwrap();
    for tag in &seen {
        let port = (tag & 0xFF) as usize;
        let local = (tag >> 8) as usize;
        assert!((1..=PORTS).contains(&port), "bad port id in 0x{tag:04x}");
        assert!(local < limit, "local tag beyond in-flight limit in 0x{tag:04x}");
    }
    handle.shutdown().await;
}
