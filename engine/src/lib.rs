#![forbid(unsafe_code)]

//! Lock-step composition of per-core kernels into one simulation.
//!
//! The engine stands in for the fabric: it owns one simulation controller
//! and any number of worker cores, a multicast routing table, and a
//! microsecond clock that drives every core's timer. Packets are
//! delivered immediately, in node order, which is one legal ordering
//! under the fabric's no-ordering contract. Each core remains
//! single-writer: the engine never overlaps calls into one kernel.

pub mod config;

use std::collections::VecDeque;

use ensim_clock::{ClockEvent, DisciplinedClock};
use ensim_protocol::{HostCommand, McPacket, SdpFrame, TickOutput, TickStatus};
use sim_controller::SimController;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use config::{ConfigError, SimulationSpec};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("route target {name:?} does not exist")]
    UnknownRouteTarget { name: String },
    #[error("worker name {name:?} already in use")]
    DuplicateWorkerName { name: String },
}

/// One worker kernel behind its disciplined clock.
#[derive(Debug)]
pub enum Kernel {
    Ensemble(ensemble_kernel::EnsembleKernel),
    Filter(filter_kernel::FilterKernel),
    ValueSource(value_source_kernel::ValueSourceKernel),
    ValueSink(value_sink_kernel::ValueSinkKernel),
    RxBridge(rx_bridge_kernel::RxBridgeKernel),
    TxBridge(tx_bridge_kernel::TxBridgeKernel),
}

impl Kernel {
    fn on_packet(&mut self, key: u32, payload: u32) {
        match self {
            Kernel::Ensemble(kernel) => kernel.on_packet(key, payload),
            Kernel::Filter(kernel) => kernel.on_packet(key, payload),
            Kernel::ValueSink(kernel) => kernel.on_packet(key, payload),
            Kernel::TxBridge(kernel) => kernel.on_packet(key, payload),
            Kernel::ValueSource(_) | Kernel::RxBridge(_) => {
                warn!(
                    key = format_args!("{key:#010x}"),
                    "packet routed to a transmit-only kernel, dropped"
                );
            }
        }
    }

    fn on_timer_tick(&mut self) -> TickOutput {
        match self {
            Kernel::Ensemble(kernel) => kernel.on_timer_tick(),
            Kernel::Filter(kernel) => kernel.on_timer_tick(),
            Kernel::ValueSource(kernel) => kernel.on_timer_tick(),
            Kernel::ValueSink(kernel) => kernel.on_timer_tick(),
            Kernel::RxBridge(kernel) => kernel.on_timer_tick(),
            Kernel::TxBridge(kernel) => kernel.on_timer_tick(),
        }
    }

    fn on_host_frame(&mut self, frame: &SdpFrame) -> bool {
        match self {
            Kernel::RxBridge(kernel) => {
                kernel.on_host_frame(frame);
                true
            }
            _ => false,
        }
    }

    pub fn snapshot_digest(&self) -> [u8; 32] {
        match self {
            Kernel::Ensemble(kernel) => kernel.snapshot_digest(),
            Kernel::Filter(kernel) => kernel.snapshot_digest(),
            Kernel::ValueSource(kernel) => kernel.snapshot_digest(),
            Kernel::ValueSink(kernel) => kernel.snapshot_digest(),
            Kernel::RxBridge(kernel) => kernel.snapshot_digest(),
            Kernel::TxBridge(kernel) => kernel.snapshot_digest(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Kernel::Ensemble(_) => "ensemble",
            Kernel::Filter(_) => "filter",
            Kernel::ValueSource(_) => "value_source",
            Kernel::ValueSink(_) => "value_sink",
            Kernel::RxBridge(_) => "rx_bridge",
            Kernel::TxBridge(_) => "tx_bridge",
        }
    }
}

#[derive(Debug)]
struct WorkerNode {
    name: String,
    kernel: Kernel,
    clock: DisciplinedClock,
    timestep_us: u32,
    alive: bool,
    exit_code: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Controller,
    Worker(usize),
}

#[derive(Debug)]
struct Route {
    key: u32,
    mask: u32,
    targets: Vec<Target>,
}

pub struct Engine {
    controller: SimController,
    controller_period_us: u32,
    workers: Vec<WorkerNode>,
    routes: Vec<Route>,
    queue: VecDeque<McPacket>,
    uplink: Vec<SdpFrame>,
    now_us: u64,
    resolution_us: u32,
}

impl Engine {
    pub fn new(controller: SimController) -> Self {
        let controller_period_us = controller.machine_timestep_us().max(1);
        Engine {
            controller,
            controller_period_us,
            workers: Vec::new(),
            routes: Vec::new(),
            queue: VecDeque::new(),
            uplink: Vec::new(),
            now_us: 0,
            resolution_us: controller_period_us,
        }
    }

    pub fn add_worker(
        &mut self,
        name: impl Into<String>,
        kernel: Kernel,
        clock: DisciplinedClock,
        timestep_us: u32,
    ) -> Result<(), EngineError> {
        let name = name.into();
        if self.workers.iter().any(|worker| worker.name == name) {
            return Err(EngineError::DuplicateWorkerName { name });
        }
        self.resolution_us = gcd(self.resolution_us, timestep_us.max(1));
        self.workers.push(WorkerNode {
            name,
            kernel,
            clock,
            timestep_us: timestep_us.max(1),
            alive: true,
            exit_code: None,
        });
        Ok(())
    }

    /// Add one multicast routing entry. `target` is a worker name or
    /// `"controller"`. Entries with the same key and mask accumulate
    /// targets.
    pub fn add_route(&mut self, key: u32, mask: u32, target: &str) -> Result<(), EngineError> {
        let target = if target == "controller" {
            Target::Controller
        } else {
            let index = self
                .workers
                .iter()
                .position(|worker| worker.name == target)
                .ok_or_else(|| EngineError::UnknownRouteTarget {
                    name: target.to_string(),
                })?;
            Target::Worker(index)
        };
        if let Some(route) = self
            .routes
            .iter_mut()
            .find(|route| route.key == key && route.mask == mask)
        {
            route.targets.push(target);
        } else {
            self.routes.push(Route {
                key,
                mask,
                targets: vec![target],
            });
        }
        Ok(())
    }

    fn now_raw(&self) -> u32 {
        self.now_us as u32
    }

    /// Inject a host-link frame addressed to the simulation controller.
    /// Replies land in the uplink buffer; broadcasts are routed.
    pub fn host_frame(&mut self, frame: &SdpFrame) {
        let out = self.controller.on_host_frame(frame, self.now_raw());
        self.absorb(out, None);
        self.drain();
    }

    /// Inject a host-link frame addressed to a worker (Rx bridge).
    pub fn host_frame_to(&mut self, name: &str, frame: &SdpFrame) {
        let Some(index) = self.workers.iter().position(|worker| worker.name == name) else {
            warn!(name, "host frame for unknown worker dropped");
            return;
        };
        if !self.workers[index].kernel.on_host_frame(frame) {
            warn!(name, "worker does not accept host frames");
        }
    }

    /// Broadcast a synchronized start command via the controller.
    pub fn start_at(&mut self, reference_time_us: u32) {
        let mut frame = SdpFrame::default();
        frame.cmd_rc = HostCommand::StartAt(reference_time_us).cmd_rc();
        frame.arg1 = reference_time_us;
        self.host_frame(&frame);
    }

    /// Broadcast a synchronized stop command via the controller.
    pub fn stop_at(&mut self, reference_time_us: u32) {
        let mut frame = SdpFrame::default();
        frame.cmd_rc = HostCommand::StopAt(reference_time_us).cmd_rc();
        frame.arg1 = reference_time_us;
        self.host_frame(&frame);
    }

    /// Advance the fabric by one scheduling quantum.
    pub fn step(&mut self) {
        if self.now_us % u64::from(self.controller_period_us) == 0 {
            let now = self.now_raw();
            let out = self.controller.on_timer_tick(now);
            self.absorb(out, None);
            self.drain();
        }

        for index in 0..self.workers.len() {
            if !self.workers[index].alive {
                continue;
            }
            let now = self.now_raw();
            if self.workers[index].clock.tick_due(now) {
                let out = self.workers[index].kernel.on_timer_tick();
                self.absorb(out, Some(index));
                self.drain();
            }
        }

        self.now_us += u64::from(self.resolution_us);
    }

    pub fn run_for(&mut self, duration_us: u64) {
        let end = self.now_us + duration_us;
        while self.now_us < end {
            self.step();
        }
    }

    /// Run until every worker has exited or `max_us` elapses. Returns
    /// true when all workers exited cleanly.
    pub fn run_until_exit(&mut self, max_us: u64) -> bool {
        while self.now_us < max_us {
            if self.workers.iter().all(|worker| !worker.alive) {
                return true;
            }
            self.step();
        }
        self.workers.iter().all(|worker| !worker.alive)
    }

    fn absorb(&mut self, out: TickOutput, worker: Option<usize>) {
        for packet in out.packets {
            self.queue.push_back(packet);
        }
        for frame in out.frames {
            self.uplink.push(frame);
        }
        if let (TickStatus::Exited(code), Some(index)) = (out.status, worker) {
            let node = &mut self.workers[index];
            node.alive = false;
            node.exit_code = Some(code);
            info!(name = node.name.as_str(), code, "worker exited");
        }
    }

    fn drain(&mut self) {
        while let Some(packet) = self.queue.pop_front() {
            let mut targets = Vec::new();
            for route in &self.routes {
                if packet.key & route.mask == route.key {
                    targets.extend_from_slice(&route.targets);
                }
            }
            if targets.is_empty() {
                debug!(
                    key = format_args!("{:#010x}", packet.key),
                    "packet matched no routing entry"
                );
                continue;
            }
            for target in targets {
                self.deliver(target, packet);
            }
        }
    }

    fn deliver(&mut self, target: Target, packet: McPacket) {
        match target {
            Target::Controller => {
                let now = self.now_raw();
                let out = self.controller.on_packet(packet.key, packet.payload, now);
                for emitted in out.packets {
                    self.queue.push_back(emitted);
                }
                for frame in out.frames {
                    self.uplink.push(frame);
                }
            }
            Target::Worker(index) => {
                let node = &mut self.workers[index];
                if !node.alive {
                    return;
                }
                let now = self.now_us as u32;
                match node.clock.on_packet(packet.key, packet.payload, now) {
                    ClockEvent::Pong(pong) => self.queue.push_back(pong),
                    ClockEvent::Handled => {}
                    ClockEvent::Ignored => node.kernel.on_packet(packet.key, packet.payload),
                }
            }
        }
    }

    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    /// Slowest worker timestep, for sizing run bounds.
    pub fn max_timestep_us(&self) -> u32 {
        self.workers
            .iter()
            .map(|worker| worker.timestep_us)
            .max()
            .unwrap_or(self.controller_period_us)
    }

    /// Whether every worker has exited.
    pub fn all_exited(&self) -> bool {
        self.workers.iter().all(|worker| !worker.alive)
    }

    pub fn controller(&self) -> &SimController {
        &self.controller
    }

    pub fn worker(&self, name: &str) -> Option<&Kernel> {
        self.workers
            .iter()
            .find(|worker| worker.name == name)
            .map(|worker| &worker.kernel)
    }

    pub fn worker_exit_code(&self, name: &str) -> Option<u32> {
        self.workers
            .iter()
            .find(|worker| worker.name == name)
            .and_then(|worker| worker.exit_code)
    }

    /// Host-bound frames accumulated so far, oldest first.
    pub fn take_uplink(&mut self) -> Vec<SdpFrame> {
        std::mem::take(&mut self.uplink)
    }

    /// Per-node snapshot digests in node order, controller last.
    pub fn digests(&self) -> Vec<(String, [u8; 32])> {
        let mut digests: Vec<(String, [u8; 32])> = self
            .workers
            .iter()
            .map(|worker| (worker.name.clone(), worker.kernel.snapshot_digest()))
            .collect();
        digests.push(("controller".to_string(), self.controller.snapshot_digest()));
        digests
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcd_of_timer_periods() {
        assert_eq!(gcd(1000, 100), 100);
        assert_eq!(gcd(100, 1000), 100);
        assert_eq!(gcd(300, 200), 100);
        assert_eq!(gcd(7, 5), 1);
        assert_eq!(gcd(0, 5), 5);
    }
}
