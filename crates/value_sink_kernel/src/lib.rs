#![forbid(unsafe_code)]

//! Value-sink kernel: records filtered dimensional values.
//!
//! The mirror image of the value source. Each tick it finalises its
//! filter bank and appends the `n_dims`-value input vector to its
//! off-chip recording region, one frame per tick, until the simulation
//! end tick.

use ensim_core::{digest_meta, Value};
use ensim_protocol::TickOutput;
use ensim_regions::{
    decode_filters, decode_routes, FilterEntry, RegionError, RegionTable, RouteEntry,
    SinkSystemRegion,
};
use filtered_input::{FilteredInput, InputError};
use thiserror::Error;
use tracing::warn;

const SNAPSHOT_DIGEST_DOMAIN: &str = "ensim:value_sink:snapshot";

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

/// Region numbering within the value sink's parameter table.
pub mod region_ids {
    pub const SYSTEM: u32 = 1;
    pub const FILTERS: u32 = 2;
    pub const ROUTES: u32 = 3;
}

/// Raw parameter regions as read from off-chip memory.
#[derive(Debug, Clone, Copy)]
pub struct ValueSinkRegions<'a> {
    pub system: &'a [u8],
    pub filters: &'a [u8],
    pub routes: &'a [u8],
}

impl<'a> ValueSinkRegions<'a> {
    pub fn from_table(table: &'a RegionTable) -> Result<Self, RegionError> {
        Ok(ValueSinkRegions {
            system: table.require(region_ids::SYSTEM)?,
            filters: table.require(region_ids::FILTERS)?,
            routes: table.require(region_ids::ROUTES)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ValueSinkParams {
    pub system: SinkSystemRegion,
    pub filters: Vec<FilterEntry>,
    pub routes: Vec<RouteEntry>,
}

impl ValueSinkParams {
    pub fn decode(regions: &ValueSinkRegions<'_>) -> Result<Self, InitError> {
        Ok(ValueSinkParams {
            system: SinkSystemRegion::decode(regions.system)?,
            filters: decode_filters(regions.filters)?,
            routes: decode_routes(regions.routes)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ValueSinkKernel {
    input: FilteredInput,
    region: Vec<Value>,
    tick: u32,
    simulation_ticks: u32,
}

impl ValueSinkKernel {
    pub fn new(params: ValueSinkParams, simulation_ticks: u32) -> Result<Self, InitError> {
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
        Ok(ValueSinkKernel {
            input,
            region: Vec::new(),
            tick: 0,
            simulation_ticks,
        })
    }

    pub fn from_regions(
        regions: &ValueSinkRegions<'_>,
        simulation_ticks: u32,
    ) -> Result<Self, InitError> {
        Self::new(ValueSinkParams::decode(regions)?, simulation_ticks)
    }

    pub fn on_packet(&mut self, key: u32, payload: u32) {
        if !self.input.on_packet(key, payload) {
            warn!(
                key = format_args!("{key:#010x}"),
                "value sink: unrouted multicast packet dropped"
            );
        }
    }

    pub fn on_timer_tick(&mut self) -> TickOutput {
        if self.tick >= self.simulation_ticks {
            return TickOutput::exited(0);
        }
        self.tick += 1;

        self.input.step();
        self.region.extend_from_slice(self.input.input());
        TickOutput::running()
    }

    /// Recorded frames, one `n_dims`-value frame per elapsed tick.
    pub fn region(&self) -> &[Value] {
        &self.region
    }

    pub fn snapshot_digest(&self) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(4 + self.region.len() * 4);
        bytes.extend_from_slice(&self.tick.to_le_bytes());
        for value in &self.region {
            bytes.extend_from_slice(&value.to_bits().to_le_bytes());
        }
        digest_meta(SNAPSHOT_DIGEST_DOMAIN, &bytes)
    }
}
