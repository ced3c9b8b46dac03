#![forbid(unsafe_code)]

//! Simulation controller kernel.
//!
//! Keeps every worker core's tick schedule locked to one reference clock.
//! Each timer tick the controller pings the next node in its table; the
//! node answers with its raw clock on its pong key, and the controller
//! multicasts back a phase correction compensated for half the measured
//! round trip. Once per full round it publishes `correction_range`, the
//! spread between the smallest and largest correction of the round, which
//! is the primary health metric of the clock discipline. The controller
//! also fields the host command surface: time and drift queries, and
//! synchronized start-at / stop-at broadcasts.
//!
//! Lost pings, pongs and corrections are never retransmitted; the next
//! round supersedes them.

use ensim_core::digest_meta;
use ensim_protocol::{
    HostCommand, McPacket, SdpFrame, TickOutput, TAG_CONTROLLER_REPLY,
};
use ensim_regions::{ControllerRegion, RegionError, RegionTable};
use tracing::warn;

const SNAPSHOT_DIGEST_DOMAIN: &str = "ensim:sim_controller:snapshot";

/// Region numbering within the controller's parameter table.
pub mod region_ids {
    pub const SYSTEM: u32 = 1;
}

#[derive(Debug, Clone)]
pub struct SimController {
    region: ControllerRegion,
    srce_addr: u16,
    srce_port: u8,
    /// Node whose ping round is in flight; `None` before the first tick.
    cur_node: Option<usize>,
    ping_send_time: u32,
    pong_received: bool,
    last_correction: i32,
    min_correction: i32,
    max_correction: i32,
    correction_range: u32,
}

impl SimController {
    pub fn new(region: ControllerRegion, srce_addr: u16, srce_port: u8) -> Self {
        SimController {
            region,
            srce_addr,
            srce_port,
            cur_node: None,
            ping_send_time: 0,
            pong_received: false,
            last_correction: 0,
            min_correction: 0,
            max_correction: 0,
            correction_range: u32::MAX,
        }
    }

    pub fn from_table(
        table: &RegionTable,
        srce_addr: u16,
        srce_port: u8,
    ) -> Result<Self, RegionError> {
        let region = ControllerRegion::decode(table.require(region_ids::SYSTEM)?)?;
        Ok(Self::new(region, srce_addr, srce_port))
    }

    pub fn machine_timestep_us(&self) -> u32 {
        self.region.machine_timestep_us
    }

    pub fn correction_range(&self) -> u32 {
        self.correction_range
    }

    pub fn last_correction(&self) -> i32 {
        self.last_correction
    }

    /// Close out the previous node's round and ping the next node.
    pub fn on_timer_tick(&mut self, now_raw: u32) -> TickOutput {
        if let Some(node) = self.cur_node {
            if !self.pong_received {
                warn!(
                    node,
                    ping_key = format_args!("{:#010x}", self.region.nodes[node].ping),
                    "node did not respond in time to ping"
                );
            } else {
                if self.last_correction < self.min_correction || node == 0 {
                    self.min_correction = self.last_correction;
                }
                if self.last_correction > self.max_correction || node == 0 {
                    self.max_correction = self.last_correction;
                }
            }
        }

        let next = match self.cur_node {
            None => 0,
            Some(node) => node + 1,
        };
        let next = if next >= self.region.nodes.len() {
            self.correction_range = self.max_correction.wrapping_sub(self.min_correction) as u32;
            0
        } else {
            next
        };
        self.cur_node = Some(next);

        self.ping_send_time = now_raw;
        self.pong_received = false;

        let mut out = TickOutput::running();
        out.push_packet(McPacket::new(self.region.nodes[next].ping, 0));
        out
    }

    /// Handle a pong: estimate the node's clock and multicast the error
    /// back on its correction key.
    pub fn on_packet(&mut self, key: u32, remote_time: u32, now_raw: u32) -> TickOutput {
        let mut out = TickOutput::running();
        let Some(node) = self.cur_node else {
            warn!(
                key = format_args!("{key:#010x}"),
                "pong before any ping round"
            );
            return out;
        };
        let expected = self.region.nodes[node].pong;
        if key != expected {
            warn!(
                key = format_args!("{key:#010x}"),
                expected = format_args!("{expected:#010x}"),
                "unexpected pong key"
            );
            return out;
        }

        let latency = now_raw.wrapping_sub(self.ping_send_time) / 2;
        let adjusted_remote = remote_time.wrapping_add(latency);
        let error = now_raw.wrapping_sub(adjusted_remote);

        out.push_packet(McPacket::new(self.region.nodes[node].correction, error));
        self.last_correction = error as i32;
        self.pong_received = true;
        out
    }

    /// Handle a host command frame.
    pub fn on_host_frame(&mut self, frame: &SdpFrame, now_raw: u32) -> TickOutput {
        let mut out = TickOutput::running();
        match HostCommand::from_frame(frame) {
            Some(HostCommand::GetTime) => {
                out.push_frame(self.reply(HostCommand::GetTime, now_raw));
            }
            Some(HostCommand::GetDrift) => {
                out.push_frame(self.reply(HostCommand::GetDrift, self.correction_range));
            }
            Some(HostCommand::StartAt(tick)) => {
                out.push_packet(McPacket::new(self.region.start_at_key, tick));
            }
            Some(HostCommand::StopAt(tick)) => {
                out.push_packet(McPacket::new(self.region.stop_at_key, tick));
            }
            None => {
                warn!(cmd_rc = frame.cmd_rc, "unexpected host command");
            }
        }
        out
    }

    fn reply(&self, command: HostCommand, response: u32) -> SdpFrame {
        let mut frame = SdpFrame::to_host(self.srce_addr, self.srce_port, TAG_CONTROLLER_REPLY);
        frame.cmd_rc = command.cmd_rc();
        frame.arg1 = response;
        frame
    }

    pub fn snapshot_digest(&self) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(
            &(self.cur_node.map(|n| n as u32).unwrap_or(u32::MAX)).to_le_bytes(),
        );
        bytes.extend_from_slice(&self.last_correction.to_le_bytes());
        bytes.extend_from_slice(&self.correction_range.to_le_bytes());
        digest_meta(SNAPSHOT_DIGEST_DOMAIN, &bytes)
    }
}
