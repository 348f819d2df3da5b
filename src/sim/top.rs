/*
Simulation top: builds the network and the traffic driver from their parsed
config sections and runs the cycle loop until the workload drains.
*/

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Serialize;

use crate::eventq::Cycle;
use crate::info;
use crate::network::config::NetworkConfig;
use crate::network::Network;
use crate::sim::config::SimConfig;
use crate::sim::log::Logger;
use crate::sim::stats::NetworkStats;
use crate::traffic::config::TrafficConfig;
use crate::traffic::driver::{TrafficDriver, TrafficStats};

#[derive(Serialize)]
pub struct SimReport {
    pub cycles: Cycle,
    pub network: NetworkStats,
    pub traffic: TrafficStats,
}

pub struct Sim {
    sim_config: SimConfig,
    logger: Arc<Logger>,
    net: Network,
    driver: TrafficDriver,
    now: Cycle,
}

impl Sim {
    pub fn new(
        sim_config: SimConfig,
        net_config: NetworkConfig,
        traffic_config: TrafficConfig,
    ) -> Self {
        let logger = Arc::new(Logger::new(sim_config.log_level));
        let net_config = Arc::new(net_config);
        let net = Network::new(&net_config, &logger);
        let driver = TrafficDriver::new(traffic_config, &net, &logger);
        Self {
            sim_config,
            logger,
            net,
            driver,
            now: 0,
        }
    }

    /// Advance until every core has issued its quota and the network is
    /// empty.  Hitting the timeout wall instead is an error.
    pub fn simulate(&mut self) -> anyhow::Result<SimReport> {
        let timeout = self.sim_config.timeout;
        while self.now < timeout {
            self.net.tick(self.now);
            self.driver.tick(&mut self.net, self.now);
            if self.driver.done() && self.net.is_quiescent() {
                info!(self.logger, self.now, "workload drained");
                let report = self.report();
                self.write_stats(&report)?;
                return Ok(report);
            }
            self.now += 1;
        }
        bail!("simulation timed out after {} cycles", timeout)
    }

    fn report(&self) -> SimReport {
        SimReport {
            cycles: self.now,
            network: self.net.stats(self.now),
            traffic: self.driver.stats.clone(),
        }
    }

    fn write_stats(&self, report: &SimReport) -> anyhow::Result<()> {
        let Some(path) = &self.sim_config.stats_json else {
            return Ok(());
        };
        let file =
            File::create(path).with_context(|| format!("cannot create stats file {}", path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, report).context("cannot serialize stats")?;
        writeln!(&mut writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_run_drains_before_timeout() {
        let mut sim = Sim::new(
            SimConfig {
                log_level: 0,
                timeout: 20_000,
                stats_json: None,
            },
            NetworkConfig {
                rows: 2,
                cols: 2,
                ..NetworkConfig::default()
            },
            TrafficConfig {
                requests_per_core: 10,
                injection_rate: 0.5,
                num_lines: 32,
                seed: 3,
                ..TrafficConfig::default()
            },
        );
        let report = sim.simulate().expect("run should drain");
        assert!(report.cycles < 20_000);
        assert_eq!(
            report.traffic.reads_issued + report.traffic.writes_issued,
            4 * 10
        );
        assert!(report.network.messages_delivered > 0);
    }

    #[test]
    fn starved_timeout_is_an_error() {
        let mut sim = Sim::new(
            SimConfig {
                log_level: 0,
                timeout: 5,
                stats_json: None,
            },
            NetworkConfig {
                rows: 2,
                cols: 2,
                ..NetworkConfig::default()
            },
            TrafficConfig {
                requests_per_core: 1_000_000,
                ..TrafficConfig::default()
            },
        );
        assert!(sim.simulate().is_err());
    }
}
