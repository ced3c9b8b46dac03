#![forbid(unsafe_code)]

//! Filter kernel: a pure input-filter / relay node.
//!
//! Holds no neuron state. Accumulated multicast input is low-pass
//! filtered each tick and the filtered vector is re-transmitted on the
//! kernel's own output keys every `transmission_delay` ticks.

use ensim_core::digest_meta;
use ensim_protocol::{McPacket, TickOutput};
use ensim_regions::{
    decode_filters, decode_keys, decode_routes, FilterEntry, FilterSystemRegion, RegionError,
    RegionTable, RouteEntry,
};
use filtered_input::{FilteredInput, InputError};
use thiserror::Error;
use tracing::warn;

const SNAPSHOT_DIGEST_DOMAIN: &str = "ensim:filter:snapshot";

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

/// Region numbering within the filter node's parameter table.
pub mod region_ids {
    pub const SYSTEM: u32 = 1;
    pub const OUTPUT_KEYS: u32 = 2;
    pub const FILTERS: u32 = 3;
    pub const ROUTES: u32 = 4;
}

/// Raw parameter regions as read from off-chip memory.
#[derive(Debug, Clone, Copy)]
pub struct FilterRegions<'a> {
    pub system: &'a [u8],
    pub output_keys: &'a [u8],
    pub filters: &'a [u8],
    pub routes: &'a [u8],
}

impl<'a> FilterRegions<'a> {
    pub fn from_table(table: &'a RegionTable) -> Result<Self, RegionError> {
        Ok(FilterRegions {
            system: table.require(region_ids::SYSTEM)?,
            output_keys: table.require(region_ids::OUTPUT_KEYS)?,
            filters: table.require(region_ids::FILTERS)?,
            routes: table.require(region_ids::ROUTES)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FilterParams {
    pub system: FilterSystemRegion,
    pub output_keys: Vec<u32>,
    pub filters: Vec<FilterEntry>,
    pub routes: Vec<RouteEntry>,
}

impl FilterParams {
    pub fn decode(regions: &FilterRegions<'_>) -> Result<Self, InitError> {
        let system = FilterSystemRegion::decode(regions.system)?;
        Ok(FilterParams {
            system,
            output_keys: decode_keys(regions.output_keys, usize::from(system.n_dims))?,
            filters: decode_filters(regions.filters)?,
            routes: decode_routes(regions.routes)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FilterKernel {
    input: FilteredInput,
    output_keys: Vec<u32>,
    transmission_delay: u32,
    delay_remaining: u32,
    tick: u32,
    simulation_ticks: u32,
}

impl FilterKernel {
    pub fn new(params: FilterParams, simulation_ticks: u32) -> Result<Self, InitError> {
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
        Ok(FilterKernel {
            input,
            output_keys: params.output_keys,
            transmission_delay: system.transmission_delay,
            delay_remaining: system.transmission_delay,
            tick: 0,
            simulation_ticks,
        })
    }

    pub fn from_regions(
        regions: &FilterRegions<'_>,
        simulation_ticks: u32,
    ) -> Result<Self, InitError> {
        Self::new(FilterParams::decode(regions)?, simulation_ticks)
    }

    pub fn on_packet(&mut self, key: u32, payload: u32) {
        if !self.input.on_packet(key, payload) {
            warn!(
                key = format_args!("{key:#010x}"),
                "filter: unrouted multicast packet dropped"
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
            for (key, value) in self.output_keys.iter().zip(self.input.input().iter()) {
                out.push_packet(McPacket::with_value(*key, *value));
            }
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
    use ensim_protocol::TickStatus;
    use filtered_input::additive_filter;

    const IN_KEY: u32 = 0x2000_0000;
    const OUT_KEY: u32 = 0x6000_0000;

    fn params(decay: f32, transmission_delay: u32) -> FilterParams {
        FilterParams {
            system: FilterSystemRegion {
                n_dims: 1,
                machine_timestep_us: 1000,
                transmission_delay,
                n_filters: 1,
                n_filter_routes: 1,
            },
            output_keys: vec![OUT_KEY],
            filters: vec![additive_filter(
                Value::from_f32(decay),
                Value::from_f32(1.0 - decay),
            )],
            routes: vec![RouteEntry {
                key: IN_KEY,
                mask: 0xffff_fff0,
                filter_id: 0,
                dimension_mask: 0xf,
            }],
        }
    }

    #[test]
    fn impulse_decays_by_halves() {
        let mut kernel = FilterKernel::new(params(0.5, 1), u32::MAX).unwrap();
        kernel.on_packet(IN_KEY, Value::ONE.to_payload());

        let mut expected = 0.5f32;
        for _ in 0..4 {
            let out = kernel.on_timer_tick();
            assert_eq!(out.packets.len(), 1);
            assert_eq!(out.packets[0].key, OUT_KEY);
            assert_eq!(out.packets[0].value(), Value::from_f32(expected));
            expected /= 2.0;
        }
    }

    #[test]
    fn transmission_delay_gates_output() {
        let mut kernel = FilterKernel::new(params(0.0, 3), u32::MAX).unwrap();
        kernel.on_packet(IN_KEY, Value::ONE.to_payload());
        assert!(kernel.on_timer_tick().packets.is_empty());
        assert!(kernel.on_timer_tick().packets.is_empty());
        assert_eq!(kernel.on_timer_tick().packets.len(), 1);
        assert!(kernel.on_timer_tick().packets.is_empty());
    }

    #[test]
    fn mismatched_route_count_fails_init() {
        let mut bad = params(0.5, 1);
        bad.system.n_filter_routes = 2;
        assert!(matches!(
            FilterKernel::new(bad, u32::MAX),
            Err(InitError::RouteCountMismatch {
                declared: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn finishes_at_the_configured_tick() {
        let mut kernel = FilterKernel::new(params(0.5, 1), 2).unwrap();
        assert_eq!(kernel.on_timer_tick().status, TickStatus::Running);
        assert_eq!(kernel.on_timer_tick().status, TickStatus::Running);
        assert_eq!(kernel.on_timer_tick().status, TickStatus::Exited(0));
    }
}
