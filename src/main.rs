use std::fs;
use toml::Table;
use std::path::PathBuf;
use clap::Parser;
use pion::network::config::{NetworkConfig, SwitchHold};
use pion::sim::config::{Config, SimConfig};
use pion::sim::top::Sim;
use pion::traffic::config::{TrafficConfig, TrafficPattern};

#[derive(Parser)]
#[command(version, about)]
struct PionArgs {
    #[arg(help="Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help="Override mesh rows")]
    rows: Option<usize>,
    #[arg(long, help="Override mesh columns")]
    cols: Option<usize>,
    #[arg(long, help="Override multicast support")]
    multicast: Option<bool>,
    #[arg(long, help="Override in-network prepush filtering")]
    prepush_filter: Option<bool>,
    #[arg(long, help="Override switch hold policy (all, multicast_only, none)")]
    hold_switch: Option<SwitchHold>,
    #[arg(long, help="Override traffic pattern (coherence, uniform_random, transpose, neighbor, hotspot)")]
    pattern: Option<TrafficPattern>,
    #[arg(long, help="Override traffic seed")]
    seed: Option<u64>,
    #[arg(long, help="Enable log at level (0:none, 1:info, 2:debug)")]
    log: Option<u64>,
    #[arg(long, help="Write run statistics to this JSON file")]
    stats_json: Option<String>,
}

pub fn main() -> anyhow::Result<()> {
    env_logger::init();

    let argv = PionArgs::parse();
    let config = fs::read_to_string(&argv.config_path).unwrap_or_else(|err| {
        eprintln!("failed to read config file: {}", err);
        std::process::exit(1);
    });

    let config_table: Table = toml::from_str(&config).expect("cannot parse config toml");
    let mut sim_config = SimConfig::from_section(config_table.get("sim"));
    let mut net_config = NetworkConfig::from_section(config_table.get("network"));
    let mut traffic_config = TrafficConfig::from_section(config_table.get("traffic"));

    // override toml configs with argv
    sim_config.log_level = argv.log.unwrap_or(sim_config.log_level);
    sim_config.stats_json = argv.stats_json.or(sim_config.stats_json);
    net_config.rows = argv.rows.unwrap_or(net_config.rows);
    net_config.cols = argv.cols.unwrap_or(net_config.cols);
    net_config.multicast = argv.multicast.unwrap_or(net_config.multicast);
    net_config.prepush_filter = argv.prepush_filter.unwrap_or(net_config.prepush_filter);
    net_config.hold_switch = argv.hold_switch.unwrap_or(net_config.hold_switch);
    traffic_config.pattern = argv.pattern.unwrap_or(traffic_config.pattern);
    traffic_config.seed = argv.seed.unwrap_or(traffic_config.seed);

    let mut sim = Sim::new(sim_config, net_config, traffic_config);
    let report = sim.simulate()?;
    println!("{}", report.network.summary());
    Ok(())
}
