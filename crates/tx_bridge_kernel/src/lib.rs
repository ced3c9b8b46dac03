#![forbid(unsafe_code)]

//! Tx bridge: aggregates filtered multicast values and uplinks them to
//! the host as host-link frames.
//!
//! Internally a filter node; instead of re-transmitting on multicast it
//! emits one dimensional-payload frame every `transmission_delay` ticks,
//! addressed to the host with uplink tag 1.

use ensim_core::digest_meta;
use ensim_protocol::{SdpFrame, TickOutput, CMD_DIMENSIONAL, TAG_TX_UPLINK};
use ensim_regions::{
    decode_filters, decode_routes, FilterEntry, FilterSystemRegion, RegionError, RegionTable,
    RouteEntry,
};
use filtered_input::{FilteredInput, InputError};
use thiserror::Error;
use tracing::warn;

const SNAPSHOT_DIGEST_DOMAIN: &str = "ensim:tx_bridge:snapshot";

#[derive(Debug, Error)]
pub enum InitError {
    #[error("region decode failed: {0}")]
    Region(#[from] RegionError),
    #[error("filtered input: {0}")]
    Input(#[from] InputError),
    #[error("system region declares {declared} filters, region holds {found}")]
    FilterCountMismatch { declared: u16, found: usize },
    #[error("system region declares {declared} filter routes, region holds {found}")]
    RouteCountMismatch { declared: u16, found: usize },
}

/// Region numbering within the Tx bridge's parameter table.
pub mod region_ids {
    pub const SYSTEM: u32 = 1;
    pub const FILTERS: u32 = 2;
    pub const ROUTES: u32 = 3;
}

/// Raw parameter regions as read from off-chip memory.
#[derive(Debug, Clone, Copy)]
pub struct TxBridgeRegions<'a> {
    pub system: &'a [u8],
    pub filters: &'a [u8],
    pub routes: &'a [u8],
}

impl<'a> TxBridgeRegions<'a> {
    pub fn from_table(table: &'a RegionTable) -> Result<Self, RegionError> {
        Ok(TxBridgeRegions {
            system: table.require(region_ids::SYSTEM)?,
            filters: table.require(region_ids::FILTERS)?,
            routes: table.require(region_ids::ROUTES)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TxBridgeParams {
    pub system: FilterSystemRegion,
    pub filters: Vec<FilterEntry>,
    pub routes: Vec<RouteEntry>,
}

impl TxBridgeParams {
    pub fn decode(regions: &TxBridgeRegions<'_>) -> Result<Self, InitError> {
        Ok(TxBridgeParams {
            system: FilterSystemRegion::decode(regions.system)?,
            filters: decode_filters(regions.filters)?,
            routes: decode_routes(regions.routes)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TxBridgeKernel {
    input: FilteredInput,
    transmission_delay: u32,
    delay_remaining: u32,
    srce_addr: u16,
    srce_port: u8,
    tick: u32,
    simulation_ticks: u32,
}

impl TxBridgeKernel {
    pub fn new(
        params: TxBridgeParams,
        srce_addr: u16,
        srce_port: u8,
        simulation_ticks: u32,
    ) -> Result<Self, InitError> {
        let system = params.system;
        if params.filters.len() != usize::from(system.n_filters) {
            return Err(InitError::FilterCountMismatch {
                declared: system.n_filters,
                found: params.filters.len(),
            });
        }
        if params.routes.len() != usize::from(system.n_filter_routes) {
            return Err(InitError::RouteCountMismatch {
                declared: system.n_filter_routes,
                found: params.routes.len(),
            });
        }
        let input = FilteredInput::new(system.n_dims, &params.filters, &params.routes)?;
        Ok(TxBridgeKernel {
            input,
            transmission_delay: system.transmission_delay,
            delay_remaining: system.transmission_delay,
            srce_addr,
            srce_port,
            tick: 0,
            simulation_ticks,
        })
    }

    pub fn from_regions(
        regions: &TxBridgeRegions<'_>,
        srce_addr: u16,
        srce_port: u8,
        simulation_ticks: u32,
    ) -> Result<Self, InitError> {
        Self::new(
            TxBridgeParams::decode(regions)?,
            srce_addr,
            srce_port,
            simulation_ticks,
        )
    }

    pub fn on_packet(&mut self, key: u32, payload: u32) {
        if !self.input.on_packet(key, payload) {
            warn!(
                key = format_args!("{key:#010x}"),
                "tx bridge: unrouted multicast packet dropped"
            );
        }
    }

    pub fn on_timer_tick(&mut self) -> TickOutput {
        if self.tick >= self.simulation_ticks {
            return TickOutput::exited(0);
        }
        self.tick += 1;

        let mut out = TickOutput::running();
        self.input.step();

        self.delay_remaining -= 1;
        if self.delay_remaining == 0 {
            self.delay_remaining = self.transmission_delay;

            let mut frame = SdpFrame::to_host(self.srce_addr, self.srce_port, TAG_TX_UPLINK);
            frame.cmd_rc = CMD_DIMENSIONAL;
            frame.set_data_values(self.input.input());
            out.push_frame(frame);
        }
        out
    }

    pub fn snapshot_digest(&self) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(8 + self.input.input().len() * 4);
        bytes.extend_from_slice(&self.tick.to_le_bytes());
        bytes.extend_from_slice(&self.delay_remaining.to_le_bytes());
        for value in self.input.input() {
            bytes.extend_from_slice(&value.to_bits().to_le_bytes());
        }
        digest_meta(SNAPSHOT_DIGEST_DOMAIN, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensim_core::Value;
    use ensim_protocol::{FLAGS_NO_REPLY, HOST_DEST_ADDR, HOST_DEST_PORT};
    use filtered_input::additive_filter;

    const IN_KEY: u32 = 0x2000_0000;

    fn params(n_dims: u16) -> TxBridgeParams {
        TxBridgeParams {
            system: FilterSystemRegion {
                n_dims,
                machine_timestep_us: 1000,
                transmission_delay: 1,
                n_filters: 1,
                n_filter_routes: 1,
            },
            filters: vec![additive_filter(Value::ZERO, Value::ONE)],
            routes: vec![RouteEntry {
                key: IN_KEY,
                mask: 0xffff_fff0,
                filter_id: 0,
                dimension_mask: 0xf,
            }],
        }
    }

    #[test]
    fn uplink_frame_carries_the_filtered_vector() {
        let mut kernel = TxBridgeKernel::new(params(2), 0x0102, 9, u32::MAX).unwrap();
        kernel.on_packet(IN_KEY, Value::from_f32(0.25).to_payload());
        kernel.on_packet(IN_KEY | 1, Value::from_f32(-1.0).to_payload());

        let out = kernel.on_timer_tick();
        assert_eq!(out.frames.len(), 1);
        let frame = &out.frames[0];
        assert_eq!(frame.dest_addr, HOST_DEST_ADDR);
        assert_eq!(frame.dest_port, HOST_DEST_PORT);
        assert_eq!(frame.srce_addr, 0x0102);
        assert_eq!(frame.srce_port, 9);
        assert_eq!(frame.flags, FLAGS_NO_REPLY);
        assert_eq!(frame.tag, TAG_TX_UPLINK);
        assert_eq!(frame.cmd_rc, CMD_DIMENSIONAL);
        assert_eq!(
            frame.data_values(),
            vec![Value::from_f32(0.25), Value::from_f32(-1.0)]
        );
    }

    #[test]
    fn delay_of_two_halves_the_frame_rate() {
        let mut params = params(1);
        params.system.transmission_delay = 2;
        let mut kernel = TxBridgeKernel::new(params, 0, 0, u32::MAX).unwrap();
        assert!(kernel.on_timer_tick().frames.is_empty());
        assert_eq!(kernel.on_timer_tick().frames.len(), 1);
        assert!(kernel.on_timer_tick().frames.is_empty());
        assert_eq!(kernel.on_timer_tick().frames.len(), 1);
    }
}
