mod common;

use common::*;
use engine::{Engine, Kernel};
use ensim_clock::DisciplinedClock;
use ensim_protocol::{SdpFrame, CMD_GET_DRIFT, CMD_GET_TIME, TAG_CONTROLLER_REPLY};
use sim_controller::SimController;

const SRC_KEY: u32 = 0x1000_0000;

fn source_and_sink(periodic: bool, run_ticks: u32) -> Engine {
    let controller = SimController::new(controller_region(2), 0, 1);
    let mut engine = Engine::new(controller);

    let sink_table = value_sink_table(0, SRC_KEY);
    let sink = value_sink_kernel::ValueSinkKernel::from_regions(
        &value_sink_kernel::ValueSinkRegions::from_table(&sink_table).unwrap(),
        run_ticks,
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

    let source_table = value_source_table(1, SRC_KEY, &[0.25, 0.5, 0.75, 1.0], periodic);
    let source = value_source_kernel::ValueSourceKernel::from_regions(
        &value_source_kernel::ValueSourceRegions::from_table(&source_table).unwrap(),
        value_source_kernel::DEFAULT_SLOT_BUDGET_BYTES,
        run_ticks,
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

fn sink_frames(engine: &Engine) -> usize {
    match engine.worker("sink") {
        Some(Kernel::ValueSink(sink)) => sink.region().len(),
        _ => panic!("sink missing"),
    }
}

#[test]
fn zero_drift_round_converges_to_zero_range() {
    let mut engine = source_and_sink(true, u32::MAX);
    // One full round is one controller tick per node plus the wrap tick.
    engine.run_for(u64::from(CONTROLLER_PERIOD_US) * 4);
    assert_eq!(engine.controller().correction_range(), 0);
    assert_eq!(engine.controller().last_correction(), 0);
}

#[test]
fn workers_tick_only_between_start_and_stop() {
    let mut engine = source_and_sink(true, u32::MAX);

    // Never started: no frames.
    engine.run_for(3000);
    assert_eq!(sink_frames(&engine), 0);

    engine.start_at(4000);
    engine.run_for(3500);
    // Ticks at 4, 5 and 6 ms.
    assert_eq!(sink_frames(&engine), 3);

    engine.stop_at(8000);
    engine.run_for(5000);
    // One more tick at 7 ms; the 8 ms tick is disarmed.
    assert_eq!(sink_frames(&engine), 4);
}

#[test]
fn host_queries_report_time_and_drift() {
    let mut engine = source_and_sink(true, u32::MAX);
    engine.run_for(1000);

    let mut frame = SdpFrame::default();
    frame.cmd_rc = CMD_GET_TIME;
    engine.host_frame(&frame);
    frame.cmd_rc = CMD_GET_DRIFT;
    engine.host_frame(&frame);

    let uplink = engine.take_uplink();
    let replies: Vec<&SdpFrame> = uplink
        .iter()
        .filter(|frame| frame.tag == TAG_CONTROLLER_REPLY)
        .collect();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].cmd_rc, CMD_GET_TIME);
    assert_eq!(replies[0].arg1, 1000);
    assert_eq!(replies[1].cmd_rc, CMD_GET_DRIFT);
    assert_eq!(replies[1].arg1, 0);
}

#[test]
fn workers_exit_at_the_configured_end_tick() {
    let mut engine = source_and_sink(true, 5);
    engine.start_at(1000);
    assert!(engine.run_until_exit(20_000));
    assert_eq!(engine.worker_exit_code("sink"), Some(0));
    assert_eq!(engine.worker_exit_code("source"), Some(0));
    assert_eq!(sink_frames(&engine), 5);
}

#[test]
fn aperiodic_source_exits_on_its_own() {
    let mut engine = source_and_sink(false, u32::MAX);
    engine.start_at(1000);
    engine.run_for(6000);
    // Four samples, then the source exits; the sink keeps running.
    assert_eq!(engine.worker_exit_code("source"), Some(0));
    assert_eq!(engine.worker_exit_code("sink"), None);
}
