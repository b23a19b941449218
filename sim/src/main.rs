//! Cell HARQ simulator
//!
//! Drives a cell HARQ manager slot by slot with synthetic traffic and
//! randomized HARQ-ACK / CRC feedback, then reports the counters.

mod config;
mod traffic;

use anyhow::Result;
use clap::Parser;
use common::time::slot_duration_us;
use config::SimConfig;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use traffic::TrafficSim;

/// Cell HARQ simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML or TOML); defaults are used if omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error), overrides the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    /// Number of slots to simulate
    #[arg(short, long, default_value = "20000")]
    nof_slots: u32,

    /// Seed of the feedback generator
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Pace slots at their air-interface duration
    #[arg(long)]
    realtime: bool,

    /// Write the final statistics as JSON to this file
    #[arg(long)]
    stats_json: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SimConfig::load(path)?,
        None => {
            let config = SimConfig::default();
            config.validate()?;
            config
        }
    };

    // Initialize logging
    let directive = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log.filter_directive());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_line_number(true)
        .init();

    info!("Starting cell HARQ simulator");
    info!(
        "Configuration file: {}",
        args.config.as_deref().unwrap_or("<defaults>")
    );

    let scs = config.scs()?;
    let scs_khz = config.cell.common_scs as u16;
    info!("Cell configuration:");
    info!("  Subcarrier spacing: {} kHz (numerology {})", scs_khz, scs.numerology());
    info!("  Slots per frame: {}", common::time::slots_per_frame(scs_khz));
    info!(
        "  HARQ: max_ues={}, max_ack_wait={} slots, ntn_cs_koffset={}, dl_disabled={}, ul_disabled={}",
        config.harq.max_ues,
        config.harq.max_ack_wait_in_slots,
        config.harq.ntn_cs_koffset,
        config.harq.dl_harq_disabled,
        config.harq.ul_harq_disabled
    );

    let mut sim = TrafficSim::new(config, args.seed)?;
    let started = Instant::now();

    if args.realtime {
        let period = tokio::time::Duration::from_micros(u64::from(slot_duration_us(scs_khz)));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        for _ in 0..args.nof_slots {
            tokio::select! {
                _ = &mut shutdown => {
                    warn!("Received shutdown signal at slot {}", sim.now());
                    break;
                }
                _ = interval.tick() => sim.step()?,
            }
        }
    } else {
        for _ in 0..args.nof_slots {
            sim.step()?;
        }
    }

    let stats = sim.stats();
    info!(
        "Simulated {} slots in {:.3} s (last slot {})",
        stats.slots,
        started.elapsed().as_secs_f64(),
        sim.now()
    );
    info!("DL Statistics:");
    info!(
        "  New txs: {}, retxs: {}, acked: {} ({} bytes), nacked: {}, alloc failures: {}",
        stats.dl_new_txs,
        stats.dl_retxs,
        stats.dl_acked,
        stats.dl_acked_bytes,
        stats.dl_nacked,
        stats.dl_alloc_failures
    );
    info!(
        "  Timeouts: {} ack, {} nack; UCI scheduling failures: {}",
        stats.timeouts.dl_ack, stats.timeouts.dl_nack, stats.uci_sched_failures
    );
    info!("UL Statistics:");
    info!(
        "  New txs: {}, retxs: {}, CRC ok: {} ({} bytes), CRC ko: {}, alloc failures: {}",
        stats.ul_new_txs,
        stats.ul_retxs,
        stats.ul_crc_ok,
        stats.ul_acked_bytes,
        stats.ul_crc_ko,
        stats.ul_alloc_failures
    );
    info!(
        "  Timeouts: {} ack, {} nack",
        stats.timeouts.ul_ack, stats.timeouts.ul_nack
    );
    info!(
        "UE releases: {}, stale reports: {}",
        stats.ue_releases, stats.stale_reports
    );

    if let Some(path) = &args.stats_json {
        std::fs::write(path, serde_json::to_string_pretty(&stats)?)?;
        info!("Statistics written to {}", path);
    }

    info!("Simulator shutdown complete");
    Ok(())
}
