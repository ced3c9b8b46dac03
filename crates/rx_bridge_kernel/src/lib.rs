#![forbid(unsafe_code)]

//! Rx bridge: injects host-supplied dimensional values into the
//! multicast domain.
//!
//! The kernel caches up to 64 dimension values and their routing keys.
//! Host frames with `cmd_rc == 1` overwrite a window of the cache
//! (`arg1` = first dimension, `arg2` = count) and mark those dimensions
//! fresh. The timer fires every `dt / n_dims` so one dimension is visited
//! per interrupt; a visited dimension is transmitted only while fresh and
//! the flag is cleared after transmission.

use ensim_core::{digest_meta, Value};
use ensim_protocol::{McPacket, SdpFrame, TickOutput, CMD_DIMENSIONAL};
use ensim_regions::{decode_keys, decode_values, RegionError, RegionTable, RxSystemRegion};
use thiserror::Error;
use tracing::{debug, warn};

const SNAPSHOT_DIGEST_DOMAIN: &str = "ensim:rx_bridge:snapshot";

#[derive(Debug, Error)]
pub enum InitError {
    #[error("region decode failed: {0}")]
    Region(#[from] RegionError),
}

/// Region numbering within the Rx bridge's parameter table.
pub mod region_ids {
    pub const SYSTEM: u32 = 1;
    pub const OUTPUT_KEYS: u32 = 2;
    pub const INITIAL_VALUES: u32 = 3;
}

/// Raw parameter regions as read from off-chip memory.
#[derive(Debug, Clone, Copy)]
pub struct RxBridgeRegions<'a> {
    pub system: &'a [u8],
    pub output_keys: &'a [u8],
    pub initial_values: &'a [u8],
}

impl<'a> RxBridgeRegions<'a> {
    pub fn from_table(table: &'a RegionTable) -> Result<Self, RegionError> {
        Ok(RxBridgeRegions {
            system: table.require(region_ids::SYSTEM)?,
            output_keys: table.require(region_ids::OUTPUT_KEYS)?,
            initial_values: table.require(region_ids::INITIAL_VALUES)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RxBridgeParams {
    pub system: RxSystemRegion,
    pub output_keys: Vec<u32>,
    pub initial_values: Vec<Value>,
}

impl RxBridgeParams {
    pub fn decode(regions: &RxBridgeRegions<'_>) -> Result<Self, InitError> {
        let system = RxSystemRegion::decode(regions.system)?;
        Ok(RxBridgeParams {
            system,
            output_keys: decode_keys(regions.output_keys, usize::from(system.n_dims))?,
            initial_values: decode_values(regions.initial_values, usize::from(system.n_dims))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RxBridgeKernel {
    values: Vec<Value>,
    fresh: Vec<bool>,
    output_keys: Vec<u32>,
    current: usize,
}

impl RxBridgeKernel {
    pub fn new(params: RxBridgeParams) -> Self {
        let n_dims = usize::from(params.system.n_dims);
        RxBridgeKernel {
            values: params.initial_values,
            fresh: vec![false; n_dims],
            output_keys: params.output_keys,
            current: 0,
        }
    }

    pub fn from_regions(regions: &RxBridgeRegions<'_>) -> Result<Self, InitError> {
        Ok(Self::new(RxBridgeParams::decode(regions)?))
    }

    /// Handle a host frame. `cmd_rc == 1` replaces the dimension window
    /// `[arg1, arg1 + arg2)` and marks it fresh; other commands are
    /// reserved and dropped.
    pub fn on_host_frame(&mut self, frame: &SdpFrame) {
        if frame.cmd_rc != CMD_DIMENSIONAL {
            warn!(cmd_rc = frame.cmd_rc, "rx bridge: reserved command dropped");
            return;
        }
        let first = frame.arg1 as usize;
        let count = frame.arg2 as usize;
        let Some(end) = first.checked_add(count).filter(|end| *end <= self.values.len()) else {
            warn!(
                first,
                count,
                n_dims = self.values.len(),
                "rx bridge: update window out of range, frame dropped"
            );
            return;
        };
        let update = frame.data_values();
        if update.len() != count {
            warn!(
                expected = count,
                got = update.len(),
                "rx bridge: frame data length mismatch, frame dropped"
            );
            return;
        }
        self.values[first..end].copy_from_slice(&update);
        for fresh in &mut self.fresh[first..end] {
            *fresh = true;
        }
        debug!(first, count, "rx bridge: dimensions updated");
    }

    /// Visit the next dimension; transmit it if a host update has not yet
    /// been forwarded.
    pub fn on_timer_tick(&mut self) -> TickOutput {
        let mut out = TickOutput::running();
        if self.fresh[self.current] {
            out.push_packet(McPacket::with_value(
                self.output_keys[self.current],
                self.values[self.current],
            ));
            self.fresh[self.current] = false;
        }
        self.current = (self.current + 1) % self.values.len();
        out
    }

    pub fn snapshot_digest(&self) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(8 + self.values.len() * 5);
        bytes.extend_from_slice(&(self.current as u32).to_le_bytes());
        for (value, fresh) in self.values.iter().zip(self.fresh.iter()) {
            bytes.extend_from_slice(&value.to_bits().to_le_bytes());
            bytes.push(u8::from(*fresh));
        }
        digest_meta(SNAPSHOT_DIGEST_DOMAIN, &bytes)
    }
}
