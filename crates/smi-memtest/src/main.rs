//! smi-memtest: burst write/read-back test over simulated SMI memory.

use anyhow::{Context, Result};

use smi_core::SmiConfig;

mod memtest;

use memtest::{run_memtest, MemtestReport};

fn print_usage() {
    println!("Usage: smi-memtest [options]");
    println!();
    println!("Options:");
    println!("  --transfers <n>   Transfers per width (default from config)");
    println!("  --seed <n>        Random seed, 0 picks one (default from config)");
    println!("  --arbitrated      Share one link between all widths through the tagged arbiter");
    println!("  --json            Print the report as JSON");
    println!("  --init-config     Write the default config file if missing and exit");
    println!();
    println!("Config: {}", SmiConfig::file_path().display());
}

fn print_report(report: &MemtestReport) {
    println!(
        "seed {}  {}",
        report.seed,
        if report.arbitrated { "arbitrated link" } else { "dedicated links" }
    );
    println!(
        "  {:<6} {:>10} {:>14} {:>10} {:>8} {:>9}",
        "width", "transfers", "bytes", "errors", "failed", "recorded"
    );
    for w in &report.widths {
        println!(
            "  {:<6} {:>10} {:>14} {:>10} {:>8} {:>9}",
            w.width,
            w.transfers,
            w.bytes,
            w.errors,
            w.failed_transfers,
            if w.results_recorded { "yes" } else { "no" }
        );
    }
    println!(
        "total: {} bytes, {} errors: {}",
        report.total_bytes,
        report.total_errors,
        if report.passed() { "PASS" } else { "FAIL" }
    );
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut config = SmiConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SmiConfig::default()
    });

    let mut json = false;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--transfers" => {
                i += 1;
                config.memtest.transfers = args
                    .get(i)
                    .context("--transfers requires a value")?
                    .parse()
                    .context("invalid transfer count")?;
            }
            "--seed" => {
                i += 1;
                config.memtest.seed = args
                    .get(i)
                    .context("--seed requires a value")?
                    .parse()
                    .context("invalid seed")?;
            }
            "--arbitrated" => config.memtest.arbitrated = true,
            "--json" => json = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        [] => {}
        ["--init-config"] => {
            let path = SmiConfig::write_default_if_missing().context("failed to write config")?;
            println!("{}", path.display());
            return Ok(());
        }
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            return Ok(());
        }
        other => {
            eprintln!("Unknown arguments: {}", other.join(" "));
            print_usage();
            std::process::exit(1);
        }
    }

    config.validate().context("invalid configuration")?;
    let report = run_memtest(&config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if !report.passed() {
        std::process::exit(1);
    }
    Ok(())
}
