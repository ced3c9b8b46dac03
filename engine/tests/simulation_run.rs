mod common;

use std::fs;
use std::path::PathBuf;

use common::*;
use engine::config::{ControllerSpec, NodeKind, NodeSpec, OutputModeSpec, RouteSpec};
use engine::{Engine, Kernel, SimulationSpec};
use ensim_clock::DisciplinedClock;
use ensim_core::Value;
use sim_controller::SimController;

const SRC_KEY: u32 = 0x1000_0000;

fn build_pipeline() -> Engine {
    let controller = SimController::new(controller_region(2), 0, 1);
    let mut engine = Engine::new(controller);

    let sink_table = value_sink_table(0, SRC_KEY);
    let sink = value_sink_kernel::ValueSinkKernel::from_regions(
        &value_sink_kernel::ValueSinkRegions::from_table(&sink_table).unwrap(),
        6,
    )
    .unwrap();
    engine
        .add_worker(
            "sink",
            Kernel::ValueSink(sink),
            DisciplinedClock::from_table(&sink_table, TIMESTEP_US).unwrap(),
            TIMESTEP_US,
        )
        .unwrap();

    let source_table = value_source_table(1, SRC_KEY, &[0.25, 0.5, 0.75, 1.0], true);
    let source = value_source_kernel::ValueSourceKernel::from_regions(
        &value_source_kernel::ValueSourceRegions::from_table(&source_table).unwrap(),
        value_source_kernel::DEFAULT_SLOT_BUDGET_BYTES,
        6,
    )
    .unwrap();
    engine
        .add_worker(
            "source",
            Kernel::ValueSource(source),
            DisciplinedClock::from_table(&source_table, TIMESTEP_US).unwrap(),
            TIMESTEP_US,
        )
        .unwrap();

    engine.add_route(SRC_KEY, 0xffff_fff0, "sink").unwrap();
    wire_discipline(&mut engine, 0, "sink");
    wire_discipline(&mut engine, 1, "source");
    engine
}

#[test]
fn periodic_source_reaches_the_sink_one_tick_later() {
    let mut engine = build_pipeline();
    engine.start_at(1000);
    assert!(engine.run_until_exit(20_000));

    let Some(Kernel::ValueSink(sink)) = engine.worker("sink") else {
        panic!("sink missing");
    };
    assert_eq!(
        sink.region(),
        &[
            Value::ZERO,
            Value::from_f32(0.25),
            Value::from_f32(0.5),
            Value::from_f32(0.75),
            Value::from_f32(1.0),
            Value::from_f32(0.25),
        ]
    );
}

#[test]
fn identical_runs_produce_identical_digests() {
    let mut first = build_pipeline();
    let mut second = build_pipeline();
    first.start_at(1000);
    second.start_at(1000);
    first.run_until_exit(20_000);
    second.run_until_exit(20_000);
    assert_eq!(first.digests(), second.digests());
}

#[test]
fn simulation_builds_and_runs_from_a_config_file() {
    let dir = std::env::temp_dir().join(format!("ensim_config_test_{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();

    fs::write(dir.join("controller.bin"), controller_table(2).encode()).unwrap();
    fs::write(dir.join("sink.bin"), value_sink_table(0, SRC_KEY).encode()).unwrap();
    fs::write(
        dir.join("source.bin"),
        value_source_table(1, SRC_KEY, &[0.5, 1.0], true).encode(),
    )
    .unwrap();

    let mut routes = vec![RouteSpec {
        key: SRC_KEY,
        mask: 0xffff_fff0,
        targets: vec!["sink".to_string()],
    }];
    for (node, name) in ["sink", "source"].iter().enumerate() {
        let keys = discipline_keys(node as u32);
        routes.push(RouteSpec {
            key: keys.ping,
            mask: u32::MAX,
            targets: vec![name.to_string()],
        });
        routes.push(RouteSpec {
            key: keys.pong,
            mask: u32::MAX,
            targets: vec!["controller".to_string()],
        });
        routes.push(RouteSpec {
            key: keys.correction,
            mask: u32::MAX,
            targets: vec![name.to_string()],
        });
        routes.push(RouteSpec {
            key: START_AT_KEY,
            mask: u32::MAX,
            targets: vec![name.to_string()],
        });
        routes.push(RouteSpec {
            key: STOP_AT_KEY,
            mask: u32::MAX,
            targets: vec![name.to_string()],
        });
    }

    let spec = SimulationSpec {
        run_ticks: 4,
        controller: ControllerSpec {
            table: PathBuf::from("controller.bin"),
            p2p_addr: 0,
            core_id: 1,
        },
        nodes: vec![
            NodeSpec {
                name: "sink".to_string(),
                kind: NodeKind::ValueSink,
                table: PathBuf::from("sink.bin"),
                output_mode: OutputModeSpec::Interleaved,
                p2p_addr: 0,
                core_id: 2,
            },
            NodeSpec {
                name: "source".to_string(),
                kind: NodeKind::ValueSource,
                table: PathBuf::from("source.bin"),
                output_mode: OutputModeSpec::Interleaved,
                p2p_addr: 0,
                core_id: 3,
            },
        ],
        routes,
    };

    let config_path = dir.join("sim.yaml");
    fs::write(&config_path, serde_yaml::to_string(&spec).unwrap()).unwrap();

    let loaded = SimulationSpec::load(&config_path).unwrap();
    let mut engine = loaded.build(&dir).unwrap();
    engine.start_at(1000);
    assert!(engine.run_until_exit(20_000));

    let Some(Kernel::ValueSink(sink)) = engine.worker("sink") else {
        panic!("sink missing");
    };
    assert_eq!(
        sink.region(),
        &[
            Value::ZERO,
            Value::from_f32(0.5),
            Value::from_f32(1.0),
            Value::from_f32(0.5),
        ]
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn broken_parameter_table_leaves_the_core_idle() {
    let dir = std::env::temp_dir().join(format!("ensim_idle_test_{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();

    fs::write(dir.join("controller.bin"), controller_table(2).encode()).unwrap();
    fs::write(dir.join("sink.bin"), value_sink_table(0, SRC_KEY).encode()).unwrap();
    // Truncated table: init-fatal for the source core only.
    let broken = value_source_table(1, SRC_KEY, &[0.5, 1.0], true).encode();
    fs::write(dir.join("source.bin"), &broken[..broken.len() - 3]).unwrap();

    let spec = SimulationSpec {
        run_ticks: 3,
        controller: ControllerSpec {
            table: PathBuf::from("controller.bin"),
            p2p_addr: 0,
            core_id: 1,
        },
        nodes: vec![
            NodeSpec {
                name: "sink".to_string(),
                kind: NodeKind::ValueSink,
                table: PathBuf::from("sink.bin"),
                output_mode: OutputModeSpec::Interleaved,
                p2p_addr: 0,
                core_id: 2,
            },
            NodeSpec {
                name: "source".to_string(),
                kind: NodeKind::ValueSource,
                table: PathBuf::from("source.bin"),
                output_mode: OutputModeSpec::Interleaved,
                p2p_addr: 0,
                core_id: 3,
            },
        ],
        routes: vec![RouteSpec {
            key: SRC_KEY,
            mask: 0xffff_fff0,
            targets: vec!["sink".to_string(), "source".to_string()],
        }],
    };

    let mut engine = spec.build(&dir).unwrap();
    assert!(engine.worker("source").is_none());
    assert!(engine.worker("sink").is_some());

    // The rest of the simulation still runs.
    engine.start_at(1000);
    engine.run_for(2000);

    let _ = fs::remove_dir_all(&dir);
}
