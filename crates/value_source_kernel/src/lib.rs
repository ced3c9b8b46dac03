#![forbid(unsafe_code)]

//! Value-source kernel: plays back a precomputed time-series.
//!
//! The series is stored in off-chip memory as blocks of up to
//! `block_length` frames, each frame holding one value per dimension.
//! Blocks are strided at `block_length` frames; the partial block, if
//! any, sits at index `n_full_blocks` and holds `partial_block` frames.
//! Two local slots are double-buffered: while the current slot is played
//! out, a DMA prefetch fills the next slot. The prefetch is issued when
//! playback enters a slot (frame 0) and completes within the tick, so a
//! transfer never spans the slot swap.

use ensim_core::{digest_meta, Value};
use ensim_protocol::{McPacket, TickOutput};
use ensim_regions::{decode_keys, decode_values, RegionError, RegionTable, ValueSourceSystemRegion};
use thiserror::Error;
use tracing::debug;

const SNAPSHOT_DIGEST_DOMAIN: &str = "ensim:value_source:snapshot";

/// Local buffer budget shared by the two slots, as on the reference
/// configuration.
pub const DEFAULT_SLOT_BUDGET_BYTES: usize = 20 * 1024;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("region decode failed: {0}")]
    Region(#[from] RegionError),
    #[error("slot buffers need {required} bytes, budget is {budget}")]
    AllocationShortage { required: usize, budget: usize },
    #[error("block store holds {found} values, layout requires {expected}")]
    BlockStoreSizeMismatch { expected: usize, found: usize },
}

/// Region numbering within the value source's parameter table.
pub mod region_ids {
    pub const SYSTEM: u32 = 1;
    pub const OUTPUT_KEYS: u32 = 2;
    pub const BLOCKS: u32 = 3;
}

/// Raw parameter regions as read from off-chip memory.
#[derive(Debug, Clone, Copy)]
pub struct ValueSourceRegions<'a> {
    pub system: &'a [u8],
    pub output_keys: &'a [u8],
    pub blocks: &'a [u8],
}

impl<'a> ValueSourceRegions<'a> {
    pub fn from_table(table: &'a RegionTable) -> Result<Self, RegionError> {
        Ok(ValueSourceRegions {
            system: table.require(region_ids::SYSTEM)?,
            output_keys: table.require(region_ids::OUTPUT_KEYS)?,
            blocks: table.require(region_ids::BLOCKS)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ValueSourceParams {
    pub system: ValueSourceSystemRegion,
    pub output_keys: Vec<u32>,
    /// Block store contents: blocks strided at `block_length` frames.
    pub blocks: Vec<Value>,
}

impl ValueSourceParams {
    pub fn decode(regions: &ValueSourceRegions<'_>) -> Result<Self, InitError> {
        let system = ValueSourceSystemRegion::decode(regions.system)?;
        let output_keys = decode_keys(regions.output_keys, usize::from(system.n_dims))?;
        let n_values = block_store_values(&system);
        let blocks = decode_values(regions.blocks, n_values)?;
        Ok(ValueSourceParams {
            system,
            output_keys,
            blocks,
        })
    }
}

/// Number of values the strided block store holds.
fn block_store_values(system: &ValueSourceSystemRegion) -> usize {
    let frames = system.n_full_blocks as usize * system.block_length as usize
        + system.partial_block as usize;
    frames * usize::from(system.n_dims)
}

#[derive(Debug, Clone)]
struct Slot {
    data: Vec<Value>,
    length: u32,
    pos: u32,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        Slot {
            data: vec![Value::ZERO; capacity],
            length: 0,
            pos: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValueSourceKernel {
    n_dims: usize,
    block_length: u32,
    n_full_blocks: u32,
    partial_block: u32,
    n_blocks: u32,
    periodic: bool,
    keys: Vec<u32>,
    dram: Vec<Value>,
    slots: [Slot; 2],
    current: usize,
    current_block: u32,
    tick: u32,
    simulation_ticks: u32,
    exited: bool,
}

impl ValueSourceKernel {
    pub fn new(
        params: ValueSourceParams,
        slot_budget_bytes: usize,
        simulation_ticks: u32,
    ) -> Result<Self, InitError> {
        let system = params.system;
        let n_dims = usize::from(system.n_dims);

        let slot_values = system.block_length as usize * n_dims;
        let required = 2 * slot_values * 4;
        if required > slot_budget_bytes {
            return Err(InitError::AllocationShortage {
                required,
                budget: slot_budget_bytes,
            });
        }

        let expected = block_store_values(&system);
        if params.blocks.len() != expected {
            return Err(InitError::BlockStoreSizeMismatch {
                expected,
                found: params.blocks.len(),
            });
        }

        let mut kernel = ValueSourceKernel {
            n_dims,
            block_length: system.block_length,
            n_full_blocks: system.n_full_blocks,
            partial_block: system.partial_block,
            n_blocks: system.n_blocks(),
            periodic: system.periodic,
            keys: params.output_keys,
            dram: params.blocks,
            slots: [Slot::new(slot_values), Slot::new(slot_values)],
            current: 0,
            current_block: 0,
            tick: 0,
            simulation_ticks,
            exited: false,
        };
        kernel.dma_fetch(0, kernel.current);
        debug!(
            n_dims,
            n_blocks = kernel.n_blocks,
            block_length = kernel.block_length,
            partial_block = kernel.partial_block,
            periodic = kernel.periodic,
            "value source loaded"
        );
        Ok(kernel)
    }

    pub fn from_regions(
        regions: &ValueSourceRegions<'_>,
        slot_budget_bytes: usize,
        simulation_ticks: u32,
    ) -> Result<Self, InitError> {
        Self::new(
            ValueSourceParams::decode(regions)?,
            slot_budget_bytes,
            simulation_ticks,
        )
    }

    fn block_frames(&self, block: u32) -> u32 {
        if block == self.n_full_blocks && self.partial_block > 0 {
            self.partial_block
        } else {
            self.block_length
        }
    }

    /// Copy one block from the off-chip store into a slot. Models the DMA
    /// transfer, which completes before the tick ends.
    fn dma_fetch(&mut self, block: u32, slot: usize) {
        let frames = self.block_frames(block);
        let start = block as usize * self.block_length as usize * self.n_dims;
        let len = frames as usize * self.n_dims;
        self.slots[slot].data[..len].copy_from_slice(&self.dram[start..start + len]);
        self.slots[slot].length = frames;
        self.slots[slot].pos = 0;
    }

    pub fn on_timer_tick(&mut self) -> TickOutput {
        if self.exited || self.tick >= self.simulation_ticks {
            return TickOutput::exited(0);
        }
        self.tick += 1;

        let mut out = TickOutput::running();

        // Transmit the current frame.
        let pos = self.slots[self.current].pos;
        debug_assert!(pos < self.slots[self.current].length);
        let base = pos as usize * self.n_dims;
        for (d, key) in self.keys.iter().enumerate() {
            out.push_packet(McPacket::with_value(
                *key,
                self.slots[self.current].data[base + d],
            ));
        }

        // Entering a slot: prefetch the block after this one, unless this
        // is the last block of an aperiodic series.
        if pos == 0 && self.n_blocks > 1 {
            let last_block = self.current_block == self.n_blocks - 1;
            if !last_block || self.periodic {
                let next_block = (self.current_block + 1) % self.n_blocks;
                self.dma_fetch(next_block, self.current ^ 1);
            }
        }

        // Advance; at the end of the slot wrap, swap or stop.
        self.slots[self.current].pos += 1;
        if self.slots[self.current].pos == self.slots[self.current].length {
            if self.n_blocks == 1 {
                if self.periodic {
                    self.slots[self.current].pos = 0;
                } else {
                    self.exited = true;
                    out.status = ensim_protocol::TickStatus::Exited(0);
                }
            } else if self.current_block == self.n_blocks - 1 && !self.periodic {
                self.exited = true;
                out.status = ensim_protocol::TickStatus::Exited(0);
            } else {
                debug_assert!(
                    self.slots[self.current ^ 1].length > 0,
                    "slot swap before prefetch completed"
                );
                self.current ^= 1;
                self.current_block = (self.current_block + 1) % self.n_blocks;
            }
        }

        out
    }

    pub fn snapshot_digest(&self) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&self.tick.to_le_bytes());
        bytes.extend_from_slice(&self.current_block.to_le_bytes());
        bytes.extend_from_slice(&self.slots[self.current].pos.to_le_bytes());
        bytes.push(u8::from(self.exited));
        digest_meta(SNAPSHOT_DIGEST_DOMAIN, &bytes)
    }
}
