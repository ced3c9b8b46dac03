#![forbid(unsafe_code)]

use std::env;
use std::path::Path;
use std::process::ExitCode;

use engine::SimulationSpec;
use ensim_regions::RegionTable;
use hex::encode as hex_encode;
use tracing_subscriber::EnvFilter;

/// Reference time at which the synchronized start is broadcast.
const START_AT_US: u32 = 1000;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let mut args = env::args();
    let _binary = args.next();
    match (args.next().as_deref(), args.next()) {
        (Some("run"), Some(config)) => run_simulation(Path::new(&config)),
        (Some("regions"), Some(table)) => dump_regions(Path::new(&table)),
        _ => {
            eprintln!("usage: ensim run <config.yaml> | ensim regions <table.bin>");
            ExitCode::FAILURE
        }
    }
}

fn run_simulation(config_path: &Path) -> ExitCode {
    let spec = match SimulationSpec::load(config_path) {
        Ok(spec) => spec,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let mut engine = match spec.build(base_dir) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    engine.start_at(START_AT_US);
    // Generous bound: the start offset plus a few grace ticks on top of
    // the configured run length.
    let bound = u64::from(START_AT_US)
        + (u64::from(spec.run_ticks) + 4) * u64::from(engine.max_timestep_us());
    let clean = engine.run_until_exit(bound);

    for (name, digest) in engine.digests() {
        println!("{name}: {}", hex_encode(digest));
    }
    println!("drift: {}", format_drift(engine.controller().correction_range()));
    println!("uplink frames: {}", engine.take_uplink().len());

    if clean {
        ExitCode::SUCCESS
    } else {
        eprintln!("error: not all workers exited by {bound} us");
        ExitCode::FAILURE
    }
}

fn dump_regions(path: &Path) -> ExitCode {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error: failed to read {}: {err}", path.display());
            return ExitCode::FAILURE;
        }
    };
    let table = match RegionTable::decode(&bytes) {
        Ok(table) => table,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    println!("{}", format_table(&table));
    ExitCode::SUCCESS
}

fn format_drift(correction_range: u32) -> String {
    if correction_range == u32::MAX {
        "UNMEASURED".to_string()
    } else {
        format!("{correction_range} us")
    }
}

fn format_table(table: &RegionTable) -> String {
    let mut lines = Vec::new();
    let mut id = 1u32;
    let mut seen = 0usize;
    // Region ids are small; walk them in order.
    while id < 64 {
        if let Some(region) = table.region(id) {
            lines.push(format!("region {id}: {} bytes", region.len()));
            seen += 1;
        }
        id += 1;
    }
    lines.push(format!("regions: {seen}"));
    lines.push(format!("digest: {}", hex_encode(table.digest())));
    lines.join("\n")
}
