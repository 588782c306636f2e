//! CLI commands for butterfly-access

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::AccessConfig;
use crate::partition::{calc_packet_ranges, DEFAULT_PACKET_SIZE};
use crate::pipeline::{build_accessibilities, RunContext};
use crate::zones::ZoneSystem;

#[derive(Parser)]
#[command(name = "butterfly-access")]
#[command(about = "Zone accessibility builder with parallel and distributed packet execution", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compute the accessibility table and write it to the configured output
    Build {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Load the existing output table instead of recomputing it
        #[arg(long)]
        reuse: bool,
    },
    /// Print the school and work segment maps for a zone file
    Segments {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the packet ranges for a zone count
    Packets {
        /// Number of zones
        #[arg(long)]
        zones: usize,

        /// Zones per packet
        #[arg(long, default_value_t = DEFAULT_PACKET_SIZE)]
        packet_size: usize,
    },
}

fn load_config(path: &PathBuf) -> Result<AccessConfig> {
    AccessConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Build { config, reuse } => {
                println!("\n🦋 Building accessibilities from {}\n", config.display());
                let access_config = load_config(&config)?;
                let result = build_accessibilities(&access_config, reuse)?;

                println!();
                if result.reused {
                    println!("✅ Reused {}", result.output_path.display());
                } else {
                    println!(
                        "✅ {} zones, {} packets ({}), {} cached paths in {} ms",
                        result.n_zones,
                        result.n_packets,
                        result.executor,
                        result.cache_entries,
                        result.build_time_ms
                    );
                }
            }
            Commands::Segments { config } => {
                let access_config = load_config(&config)?;
                let zones = ZoneSystem::read_csv(&access_config.zone_file).with_context(|| {
                    format!("Failed to read {}", access_config.zone_file.display())
                })?;
                let run = RunContext::new(&zones, access_config.cache)?;

                println!("School segments:");
                for segment in run.school().table().segments() {
                    println!("  {:>4}  {}", segment.index, segment.name);
                }
                println!("Work segments:");
                for segment in run.work().table().segments() {
                    let code = segment.code.map(|c| c.to_string()).unwrap_or_default();
                    println!("  {:>4}  {:<14} {}", segment.index, segment.name, code);
                }
            }
            Commands::Packets { zones, packet_size } => {
                let packets = calc_packet_ranges(zones, packet_size)?;
                println!("{} packets", packets.len());
                for packet in packets {
                    println!("  {:>4}  {}..={}", packet.id, packet.start, packet.end);
                }
            }
        }
        Ok(())
    }
}
