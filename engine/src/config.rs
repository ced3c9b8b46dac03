//! Simulation description loading.
//!
//! A simulation is described by a YAML file naming every core, the
//! parameter-table blob it boots from, and the multicast routing table.
//! Table paths are resolved relative to the config file's directory.
//!
//! A kernel whose parameter table fails to decode or validate is
//! init-fatal for that core only: the fault is logged with a node-tagged
//! prefix and the core is left out of the simulation (idle), where the
//! controller will observe it through missed pongs. Structural problems
//! with the description itself (unreadable files, unparsable YAML,
//! routes to names that were never declared) fail the build.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use ensim_clock::DisciplinedClock;
use ensim_regions::{RegionTable, RxSystemRegion};
use ensemble_kernel::{EnsembleConfig, EnsembleKernel, EnsembleParams, EnsembleRegions};
use filter_kernel::{FilterKernel, FilterParams, FilterRegions};
use rx_bridge_kernel::{RxBridgeKernel, RxBridgeParams, RxBridgeRegions};
use serde::{Deserialize, Serialize};
use sim_controller::SimController;
use thiserror::Error;
use tracing::error;
use tx_bridge_kernel::{TxBridgeKernel, TxBridgeParams, TxBridgeRegions};
use value_sink_kernel::{ValueSinkKernel, ValueSinkParams, ValueSinkRegions};
use value_source_kernel::{
    ValueSourceKernel, ValueSourceParams, ValueSourceRegions, DEFAULT_SLOT_BUDGET_BYTES,
};

use crate::{Engine, EngineError, Kernel};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("controller failed to initialise: {message}")]
    Controller { message: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationSpec {
    /// Ticks each worker simulates before exiting cleanly.
    pub run_ticks: u32,
    pub controller: ControllerSpec,
    pub nodes: Vec<NodeSpec>,
    pub routes: Vec<RouteSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerSpec {
    pub table: PathBuf,
    #[serde(default)]
    pub p2p_addr: u16,
    #[serde(default)]
    pub core_id: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    pub table: PathBuf,
    #[serde(default)]
    pub output_mode: OutputModeSpec,
    #[serde(default)]
    pub p2p_addr: u16,
    #[serde(default)]
    pub core_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Ensemble,
    Filter,
    ValueSource,
    ValueSink,
    RxBridge,
    TxBridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputModeSpec {
    #[default]
    Interleaved,
    Batched,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    pub key: u32,
    pub mask: u32,
    pub targets: Vec<String>,
}

impl SimulationSpec {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build an engine from this description. `base_dir` anchors the
    /// parameter-table paths.
    pub fn build(&self, base_dir: impl AsRef<Path>) -> Result<Engine, ConfigError> {
        let base_dir = base_dir.as_ref();

        let controller_table = read_table_file(&base_dir.join(&self.controller.table))?;
        let controller_table =
            RegionTable::decode(&controller_table).map_err(|err| ConfigError::Controller {
                message: err.to_string(),
            })?;
        let controller = SimController::from_table(
            &controller_table,
            self.controller.p2p_addr,
            self.controller.core_id,
        )
        .map_err(|err| ConfigError::Controller {
            message: err.to_string(),
        })?;

        let mut engine = Engine::new(controller);
        let mut idle_nodes: HashSet<String> = HashSet::new();

        for node in &self.nodes {
            let bytes = read_table_file(&base_dir.join(&node.table))?;
            match build_worker(node, &bytes, self.run_ticks) {
                Ok((kernel, clock, timestep_us)) => {
                    engine.add_worker(&node.name, kernel, clock, timestep_us)?;
                }
                Err(fault) => {
                    error!(
                        node = node.name.as_str(),
                        kind = ?node.kind,
                        fault = fault.as_str(),
                        "initialisation failed, core left idle"
                    );
                    idle_nodes.insert(node.name.clone());
                }
            }
        }

        for route in &self.routes {
            for target in &route.targets {
                match engine.add_route(route.key, route.mask, target) {
                    Ok(()) => {}
                    Err(EngineError::UnknownRouteTarget { .. })
                        if idle_nodes.contains(target.as_str()) =>
                    {
                        // Routes to an idle core deliver nowhere, exactly
                        // as on the fabric.
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(engine)
    }
}

fn read_table_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn build_worker(
    node: &NodeSpec,
    table_bytes: &[u8],
    run_ticks: u32,
) -> Result<(Kernel, DisciplinedClock, u32), String> {
    let table = RegionTable::decode(table_bytes).map_err(|err| err.to_string())?;

    let (kernel, timestep_us) = match node.kind {
        NodeKind::Ensemble => {
            let regions = EnsembleRegions::from_table(&table).map_err(|err| err.to_string())?;
            let params = EnsembleParams::decode(&regions).map_err(|err| err.to_string())?;
            let timestep = params.system.machine_timestep_us;
            let config = EnsembleConfig {
                output_mode: match node.output_mode {
                    OutputModeSpec::Interleaved => ensemble_kernel::OutputMode::Interleaved,
                    OutputModeSpec::Batched => ensemble_kernel::OutputMode::Batched,
                },
                simulation_ticks: run_ticks,
            };
            let kernel = EnsembleKernel::new(params, config).map_err(|err| err.to_string())?;
            (Kernel::Ensemble(kernel), timestep)
        }
        NodeKind::Filter => {
            let regions = FilterRegions::from_table(&table).map_err(|err| err.to_string())?;
            let params = FilterParams::decode(&regions).map_err(|err| err.to_string())?;
            let timestep = params.system.machine_timestep_us;
            let kernel = FilterKernel::new(params, run_ticks).map_err(|err| err.to_string())?;
            (Kernel::Filter(kernel), timestep)
        }
        NodeKind::ValueSource => {
            let regions = ValueSourceRegions::from_table(&table).map_err(|err| err.to_string())?;
            let params = ValueSourceParams::decode(&regions).map_err(|err| err.to_string())?;
            let timestep = params.system.machine_timestep_us;
            let kernel = ValueSourceKernel::new(params, DEFAULT_SLOT_BUDGET_BYTES, run_ticks)
                .map_err(|err| err.to_string())?;
            (Kernel::ValueSource(kernel), timestep)
        }
        NodeKind::ValueSink => {
            let regions = ValueSinkRegions::from_table(&table).map_err(|err| err.to_string())?;
            let params = ValueSinkParams::decode(&regions).map_err(|err| err.to_string())?;
            let timestep = params.system.machine_timestep_us;
            let kernel = ValueSinkKernel::new(params, run_ticks).map_err(|err| err.to_string())?;
            (Kernel::ValueSink(kernel), timestep)
        }
        NodeKind::RxBridge => {
            let regions = RxBridgeRegions::from_table(&table).map_err(|err| err.to_string())?;
            let system = RxSystemRegion::decode(regions.system).map_err(|err| err.to_string())?;
            let params = RxBridgeParams::decode(&regions).map_err(|err| err.to_string())?;
            let kernel = RxBridgeKernel::new(params);
            (Kernel::RxBridge(kernel), system.output_period_us)
        }
        NodeKind::TxBridge => {
            let regions = TxBridgeRegions::from_table(&table).map_err(|err| err.to_string())?;
            let params = TxBridgeParams::decode(&regions).map_err(|err| err.to_string())?;
            let timestep = params.system.machine_timestep_us;
            let kernel = TxBridgeKernel::new(params, node.p2p_addr, node.core_id, run_ticks)
                .map_err(|err| err.to_string())?;
            (Kernel::TxBridge(kernel), timestep)
        }
    };

    let clock = DisciplinedClock::from_table(&table, timestep_us).map_err(|err| err.to_string())?;
    Ok((kernel, clock, timestep_us))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_round_trips_through_yaml() {
        let spec = SimulationSpec {
            run_ticks: 100,
            controller: ControllerSpec {
                table: PathBuf::from("controller.bin"),
                p2p_addr: 0,
                core_id: 1,
            },
            nodes: vec![NodeSpec {
                name: "src".to_string(),
                kind: NodeKind::ValueSource,
                table: PathBuf::from("src.bin"),
                output_mode: OutputModeSpec::Interleaved,
                p2p_addr: 0,
                core_id: 2,
            }],
            routes: vec![RouteSpec {
                key: 0x1000_0000,
                mask: 0xffff_fff0,
                targets: vec!["src".to_string()],
            }],
        };
        let text = serde_yaml::to_string(&spec).unwrap();
        let parsed: SimulationSpec = serde_yaml::from_str(&text).unwrap();
        assert_eq!(parsed.run_ticks, 100);
        assert_eq!(parsed.nodes[0].kind, NodeKind::ValueSource);
        assert_eq!(parsed.routes[0].targets, vec!["src".to_string()]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = "run_ticks: 1\nbogus: 2\ncontroller: {table: c.bin}\nnodes: []\nroutes: []\n";
        assert!(serde_yaml::from_str::<SimulationSpec>(text).is_err());
    }
}
