use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::warn;
use toml::Table;

use salam::sim::config::SalamConfig;
use salam::sim::top::Sim;
use salam::sim::workload::Workload;
use salam::telemetry::{NullSink, TcpPublisher, TelemetrySink};

#[derive(Parser)]
#[command(version, about)]
struct SalamArgs {
    #[arg(help = "Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help = "Override workload graph path (TOML or JSON)")]
    workload: Option<PathBuf>,
    #[arg(long, help = "Generate a synthetic graph with this many nodes")]
    synthetic: Option<usize>,
    #[arg(long, help = "Seed for the synthetic graph")]
    seed: Option<u64>,
    #[arg(long, help = "Override statistics output file")]
    output: Option<PathBuf>,
    #[arg(long, help = "Pretty-print the JSON report")]
    pretty: Option<bool>,
    #[arg(long, help = "Publish live telemetry")]
    telemetry: Option<bool>,
}

pub fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let argv = SalamArgs::parse();
    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;
    let config_table: Table = toml::from_str(&config).context("cannot parse config toml")?;
    let mut config = SalamConfig::from_table(&config_table);

    // override toml configs with argv
    config.sim.seed = argv.seed.unwrap_or(config.sim.seed);
    config.sim.synthetic_nodes = argv.synthetic.unwrap_or(config.sim.synthetic_nodes);
    if argv.workload.is_some() {
        config.sim.workload = argv.workload;
    }
    if argv.synthetic.is_some() {
        config.sim.workload = None;
    }
    config.stats.output_file = argv.output.unwrap_or(config.stats.output_file);
    config.stats.pretty_print = argv.pretty.unwrap_or(config.stats.pretty_print);
    config.stats.gui_stats_enabled = argv.telemetry.unwrap_or(config.stats.gui_stats_enabled);

    let workload = match &config.sim.workload {
        Some(path) => Workload::load(path)?,
        None => Workload::synthetic(
            config.sim.synthetic_nodes,
            config.sim.seed,
            config.accelerator.memory_base,
            config.accelerator.memory_size as u64,
        ),
    };

    let sink: Box<dyn TelemetrySink> = if config.stats.gui_stats_enabled {
        Box::new(TcpPublisher::bind_or_disabled(&config.telemetry.address))
    } else {
        Box::new(NullSink)
    };

    let mut sim = Sim::new(config, workload, sink)?;
    sim.simulate();

    let accel = sim.accelerator();
    if accel.timed_out() {
        warn!("run timed out; the report covers the cycles simulated so far");
    }
    let stats = accel.stats();
    println!("{}", stats.print_summary());
    stats.write_json_file()
}
