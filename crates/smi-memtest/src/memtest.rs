//! Burst memory test.
//!
//! The workspace is split per operand width (u64 gets half, u32 a quarter,
//! u16 an eighth, u8 the rest). Each width runs its own sequence of random
//! transfers: write an incrementing pattern as one burst, read it back as
//! another burst and count mismatching elements. Per-width totals are then
//! written back through the bus into a results block at the start of the
//! workspace, where the harness reads them the way a host would.

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::mpsc;

use smi_bus::{link, MemoryPort, MemoryServer, SharedMemory, TaggedArbiter};
use smi_core::wire::DEFAULT_OPTIONS;
use smi_core::{SmiConfig, Width, Word};

/// Bytes reserved at the start of the workspace for per-width results:
/// (bytes, errors) as two u64 per width.
const RESULTS_BYTES: u64 = 4 * 16;

/// Element values in flight between a test and its burst call.
const STREAM_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u64,
    pub size: u64,
}

/// Where each width test works and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub results: u64,
    pub u64: Region,
    pub u32: Region,
    pub u16: Region,
    pub u8: Region,
}

impl WorkspaceLayout {
    pub fn new(base: u64, size: u64) -> Result<Self> {
        let aligned = Width::U64.align(base + 7);
        let usable = size
            .checked_sub(aligned - base)
            .and_then(|s| s.checked_sub(RESULTS_BYTES))
            .filter(|&s| s >= 64)
            .ok_or_else(|| anyhow!("workspace of {size} bytes at 0x{base:x} is too small"))?;

        let start = aligned + RESULTS_BYTES;
        let size64 = (usable / 2) & !0x7;
        let size32 = (usable / 4) & !0x3;
        let size16 = (usable / 8) & !0x1;
        let size8 = usable - size64 - size32 - size16;
        Ok(Self {
            results: aligned,
            u64: Region { base: start, size: size64 },
            u32: Region { base: start + size64, size: size32 },
            u16: Region { base: start + size64 + size32, size: size16 },
            u8: Region { base: start + size64 + size32 + size16, size: size8 },
        })
    }

    /// Result slot for a width: bytes at the returned address, errors 8 after.
    pub fn result_slot(&self, width: Width) -> u64 {
        let index = match width {
            Width::U64 => 0,
            Width::U32 => 1,
            Width::U16 => 2,
            Width::U8 => 3,
        };
        self.results + index * 16
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WidthReport {
    pub width: String,
    pub transfers: u32,
    pub bytes: u64,
    pub errors: u64,
    /// Transfers whose write or read reported a bus failure.
    pub failed_transfers: u32,
    /// Totals read back from the results block matched the local counts.
    pub results_recorded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemtestReport {
    pub seed: u64,
    pub arbitrated: bool,
    pub widths: Vec<WidthReport>,
    pub total_bytes: u64,
    pub total_errors: u64,
}

impl MemtestReport {
    pub fn passed(&self) -> bool {
        self.total_errors == 0
            && self
                .widths
                .iter()
                .all(|w| w.failed_transfers == 0 && w.results_recorded)
    }
}

// ── Orchestration ─────────────────────────────────────────────────────────────

/// Run all four width tests concurrently against simulated memory.
pub async fn run_memtest(config: &SmiConfig) -> Result<MemtestReport> {
    let settings = &config.memtest;
    let layout = WorkspaceLayout::new(settings.workspace_base, settings.workspace_size)?;
    let seed = if settings.seed == 0 { rand::random() } else { settings.seed };
    let memory = SharedMemory::from_config(&config.memory);
    tracing::info!(seed, arbitrated = settings.arbitrated, transfers = settings.transfers, "memtest starting");

    let mut arbiter = None;
    let mut ports = Vec::with_capacity(4);
    if settings.arbitrated {
        let (downstream, endpoint) = link(config.bus.link_capacity);
        tokio::spawn(MemoryServer::new(endpoint, memory.clone()).run());
        let (handle, links) =
            TaggedArbiter::spawn(downstream, 4, &config.bus).context("failed to start arbiter")?;
        arbiter = Some(handle);
        for l in links {
            ports.push(MemoryPort::new(l, &config.bus)?);
        }
    } else {
        for _ in 0..4 {
            let (client, endpoint) = link(config.bus.link_capacity);
            tokio::spawn(MemoryServer::new(endpoint, memory.clone()).run());
            ports.push(MemoryPort::new(client, &config.bus)?);
        }
    }
    let [p64, p32, p16, p8]: [MemoryPort; 4] = ports
        .try_into()
        .map_err(|_| anyhow!("expected four memory ports"))?;

    let transfers = settings.transfers;
    let (r64, r32, r16, r8) = tokio::join!(
        width_test::<u64>(p64, layout, transfers, seed),
        width_test::<u32>(p32, layout, transfers, seed.wrapping_add(1)),
        width_test::<u16>(p16, layout, transfers, seed.wrapping_add(2)),
        width_test::<u8>(p8, layout, transfers, seed.wrapping_add(3)),
    );

    let mut widths = vec![r64?, r32?, r16?, r8?];
    let order = [Width::U64, Width::U32, Width::U16, Width::U8];
    for (report, width) in widths.iter_mut().zip(order) {
        let slot = layout.result_slot(width);
        let bytes = memory.load::<u64>(slot);
        let errors = memory.load::<u64>(slot + 8);
        report.results_recorded = bytes.status.is_ok()
            && errors.status.is_ok()
            && bytes.value == report.bytes
            && errors.value == report.errors;
    }

    if let Some(handle) = arbiter {
        handle.shutdown().await;
    }

    let total_bytes = widths.iter().map(|w| w.bytes).sum();
    let total_errors = widths.iter().map(|w| w.errors).sum();
    tracing::info!(total_bytes, total_errors, "memtest finished");
    Ok(MemtestReport {
        seed,
        arbitrated: settings.arbitrated,
        widths,
        total_bytes,
        total_errors,
    })
}

fn region_for(layout: &WorkspaceLayout, width: Width) -> Region {
    match width {
        Width::U64 => layout.u64,
        Width::U32 => layout.u32,
        Width::U16 => layout.u16,
        Width::U8 => layout.u8,
    }
}

/// Random offset into the lower half of `region` and an element count that
/// stays inside it. Counts are capped to what one burst call accepts.
fn pick_transfer(rng: &mut StdRng, region: Region, width: Width) -> (u64, u32) {
    let offset = width.align(rng.gen::<u64>() % (region.size / 2).max(1));
    let max_count = ((region.size - offset) / width.bytes() as u64).min(u32::MAX as u64);
    let count = if max_count == 0 { 0 } else { rng.gen::<u64>() % max_count };
    (offset, count as u32)
}

// ── Per-width test ────────────────────────────────────────────────────────────

async fn width_test<T: Word>(
    mut port: MemoryPort,
    layout: WorkspaceLayout,
    transfers: u32,
    seed: u64,
) -> Result<WidthReport> {
    let width = T::WIDTH;
    let region = region_for(&layout, width);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = WidthReport {
        width: width.to_string(),
        transfers,
        ..WidthReport::default()
    };

    for _ in 0..transfers {
        let (offset, count) = pick_transfer(&mut rng, region, width);
        let init = T::truncate(rng.gen());
        let incr = T::truncate(rng.gen());
        let address = region.base + offset;

        let write_ok = write_pattern(&mut port, address, count, init, incr)
            .await
            .with_context(|| format!("{width} write burst at 0x{address:x}"))?;
        let (errors, read_ok) = check_pattern(&mut port, address, count, init, incr)
            .await
            .with_context(|| format!("{width} read burst at 0x{address:x}"))?;

        if !(write_ok && read_ok) {
            report.failed_transfers += 1;
        }
        report.bytes += count as u64 * width.bytes() as u64;
        report.errors += errors;
        tracing::debug!(%width, address = format_args!("0x{address:x}"), count, errors, "transfer checked");
    }

    let slot = layout.result_slot(width);
    let stored = port.write_u64(slot, DEFAULT_OPTIONS, report.bytes).await?.and(
        port.write_u64(slot + 8, DEFAULT_OPTIONS, report.errors).await?,
    );
    if !stored.is_ok() {
        tracing::warn!(%width, "failed to record results");
    }
    if report.errors > 0 || report.failed_transfers > 0 {
        tracing::warn!(%width, errors = report.errors, failed = report.failed_transfers, "width test saw errors");
    }
    Ok(report)
}

/// Write `count` elements `init, init + incr, ...` starting at `address`.
async fn write_pattern<T: Word>(port: &mut MemoryPort, address: u64, count: u32, init: T, incr: T) -> Result<bool> {
    let (tx, mut rx) = mpsc::channel(STREAM_DEPTH);
    let produce = async move {
        let mut value = init;
        for _ in 0..count {
            if tx.send(value).await.is_err() {
                break;
            }
            value = value.wrapping_add(incr);
        }
    };
    let (_, status) = tokio::join!(produce, port.write_burst(address, DEFAULT_OPTIONS, count, &mut rx));
    Ok(status?.is_ok())
}

/// Read `count` elements back and count those that differ from the pattern.
/// Elements that never arrive count as errors too.
async fn check_pattern<T: Word>(
    port: &mut MemoryPort,
    address: u64,
    count: u32,
    init: T,
    incr: T,
) -> Result<(u64, bool)> {
    let (tx, mut rx) = mpsc::channel::<T>(STREAM_DEPTH);
    let read = async move {
        let status = port.read_burst(address, DEFAULT_OPTIONS, count, &tx).await;
        drop(tx);
        status
    };
    let check = async move {
        let mut expected = init;
        let mut errors = 0u64;
        let mut seen = 0u64;
        while let Some(value) = rx.recv().await {
            if value != expected {
                errors += 1;
            }
            expected = expected.wrapping_add(incr);
            seen += 1;
        }
        errors + (count as u64).saturating_sub(seen)
    };
    let (status, errors) = tokio::join!(read, check);
    let status = status?;
    if errors > count as u64 {
        bail!("read back more elements than requested");
    }
    Ok((errors, status.is_ok()))
}
