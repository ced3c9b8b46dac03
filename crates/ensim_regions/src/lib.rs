#![forbid(unsafe_code)]

//! Decoding of the off-chip parameter regions each core reads at startup.
//!
//! Every region is a stream of little-endian 32-bit words. Fixed-point
//! words are s16.15 `Value` bits. Decoders consume the whole region and
//! fail on truncation, trailing bytes, or out-of-range fields; any failure
//! is init-fatal for the owning core.

use ensim_core::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("unexpected end of region at byte {at}")]
    UnexpectedEof { at: usize },
    #[error("trailing bytes at end of region")]
    TrailingBytes,
    #[error("invalid region contents: {message}")]
    Invalid { message: String },
}

fn invalid(message: impl Into<String>) -> RegionError {
    RegionError::Invalid {
        message: message.into(),
    }
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, RegionError> {
    let end = cursor
        .checked_add(4)
        .ok_or(RegionError::UnexpectedEof { at: *cursor })?;
    if end > bytes.len() {
        return Err(RegionError::UnexpectedEof { at: *cursor });
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[*cursor..end]);
    *cursor = end;
    Ok(u32::from_le_bytes(buf))
}

fn read_value(bytes: &[u8], cursor: &mut usize) -> Result<Value, RegionError> {
    Ok(Value::from_bits(read_u32(bytes, cursor)? as i32))
}

fn read_bool_word(bytes: &[u8], cursor: &mut usize, field: &str) -> Result<bool, RegionError> {
    match read_u32(bytes, cursor)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(invalid(format!("{field} must be 0 or 1, got {other}"))),
    }
}

fn finish(bytes: &[u8], cursor: usize) -> Result<(), RegionError> {
    if cursor != bytes.len() {
        return Err(RegionError::TrailingBytes);
    }
    Ok(())
}

fn push_u32(bytes: &mut Vec<u8>, word: u32) {
    bytes.extend_from_slice(&word.to_le_bytes());
}

fn push_value(bytes: &mut Vec<u8>, value: Value) {
    push_u32(bytes, value.to_bits() as u32);
}

/// Decode a region holding exactly `count` fixed-point words.
pub fn decode_values(bytes: &[u8], count: usize) -> Result<Vec<Value>, RegionError> {
    let mut cursor = 0usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(read_value(bytes, &mut cursor)?);
    }
    finish(bytes, cursor)?;
    Ok(values)
}

pub fn encode_values(values: &[Value]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        push_value(&mut bytes, *value);
    }
    bytes
}

/// Decode a region holding exactly `count` routing keys.
pub fn decode_keys(bytes: &[u8], count: usize) -> Result<Vec<u32>, RegionError> {
    let mut cursor = 0usize;
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        keys.push(read_u32(bytes, &mut cursor)?);
    }
    finish(bytes, cursor)?;
    Ok(keys)
}

pub fn encode_keys(keys: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(keys.len() * 4);
    for key in keys {
        push_u32(&mut bytes, *key);
    }
    bytes
}

/// System region of the ensemble kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsembleSystemRegion {
    pub n_input_dims: u16,
    pub n_output_dims: u16,
    pub n_neurons: u32,
    pub machine_timestep_us: u32,
    pub t_ref: u8,
    pub dt_over_t_rc: Value,
    pub n_filters: u16,
    pub n_filter_routes: u16,
    pub record_spikes: bool,
    pub n_inhib_dims: u16,
    pub inhib_gain: Value,
}

impl EnsembleSystemRegion {
    pub fn decode(bytes: &[u8]) -> Result<Self, RegionError> {
        let mut cursor = 0usize;
        let n_input_dims = read_dim(bytes, &mut cursor, "n_input_dims")?;
        let n_output_dims = read_dim(bytes, &mut cursor, "n_output_dims")?;
        let n_neurons = read_u32(bytes, &mut cursor)?;
        let machine_timestep_us = read_u32(bytes, &mut cursor)?;
        let t_ref = read_u32(bytes, &mut cursor)?;
        let dt_over_t_rc = read_value(bytes, &mut cursor)?;
        let n_filters = read_dim(bytes, &mut cursor, "n_filters")?;
        let n_filter_routes = read_dim(bytes, &mut cursor, "n_filter_routes")?;
        let record_spikes = read_bool_word(bytes, &mut cursor, "record_spikes")?;
        let n_inhib_dims = read_dim(bytes, &mut cursor, "n_inhib_dims")?;
        let inhib_gain = read_value(bytes, &mut cursor)?;
        finish(bytes, cursor)?;

        if n_neurons == 0 {
            return Err(invalid("ensemble with zero neurons"));
        }
        if n_input_dims == 0 || n_output_dims == 0 {
            return Err(invalid("ensemble with zero input or output dimensions"));
        }
        // The refractory counter is stored in a 4-bit field.
        if t_ref > 0xf {
            return Err(invalid(format!("t_ref {t_ref} does not fit 4 bits")));
        }
        if machine_timestep_us == 0 {
            return Err(invalid("machine timestep of zero"));
        }

        Ok(EnsembleSystemRegion {
            n_input_dims,
            n_output_dims,
            n_neurons,
            machine_timestep_us,
            t_ref: t_ref as u8,
            dt_over_t_rc,
            n_filters,
            n_filter_routes,
            record_spikes,
            n_inhib_dims,
            inhib_gain,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(11 * 4);
        push_u32(&mut bytes, u32::from(self.n_input_dims));
        push_u32(&mut bytes, u32::from(self.n_output_dims));
        push_u32(&mut bytes, self.n_neurons);
        push_u32(&mut bytes, self.machine_timestep_us);
        push_u32(&mut bytes, u32::from(self.t_ref));
        push_value(&mut bytes, self.dt_over_t_rc);
        push_u32(&mut bytes, u32::from(self.n_filters));
        push_u32(&mut bytes, u32::from(self.n_filter_routes));
        push_u32(&mut bytes, u32::from(self.record_spikes));
        push_u32(&mut bytes, u32::from(self.n_inhib_dims));
        push_value(&mut bytes, self.inhib_gain);
        bytes
    }
}

fn read_dim(bytes: &[u8], cursor: &mut usize, field: &str) -> Result<u16, RegionError> {
    let word = read_u32(bytes, cursor)?;
    u16::try_from(word).map_err(|_| invalid(format!("{field} {word} does not fit 16 bits")))
}

/// One filter definition: precomputed decay pair, accumulator mask and
/// accumulation semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterEntry {
    /// IIR decay coefficient `a`.
    pub decay: Value,
    /// Precomputed `1 - a`.
    pub complement: Value,
    pub accumulator_mask: u32,
    /// Replacement (latest wins) rather than additive accumulation.
    pub modulatory: bool,
}

/// Count-prefixed array of filter definitions.
pub fn decode_filters(bytes: &[u8]) -> Result<Vec<FilterEntry>, RegionError> {
    let mut cursor = 0usize;
    let count = read_u32(bytes, &mut cursor)? as usize;
    let mut filters = Vec::with_capacity(count);
    for _ in 0..count {
        let decay = read_value(bytes, &mut cursor)?;
        let complement = read_value(bytes, &mut cursor)?;
        let accumulator_mask = read_u32(bytes, &mut cursor)?;
        let modulatory = read_bool_word(bytes, &mut cursor, "modulatory")?;
        filters.push(FilterEntry {
            decay,
            complement,
            accumulator_mask,
            modulatory,
        });
    }
    finish(bytes, cursor)?;
    Ok(filters)
}

pub fn encode_filters(filters: &[FilterEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + filters.len() * 16);
    push_u32(&mut bytes, filters.len() as u32);
    for filter in filters {
        push_value(&mut bytes, filter.decay);
        push_value(&mut bytes, filter.complement);
        push_u32(&mut bytes, filter.accumulator_mask);
        push_u32(&mut bytes, u32::from(filter.modulatory));
    }
    bytes
}

/// One routing entry: packets with `key & mask == key` feed `filter_id`,
/// and `incoming_key & dimension_mask` is the target dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub key: u32,
    pub mask: u32,
    pub filter_id: u16,
    pub dimension_mask: u32,
}

/// Count-prefixed array of routing entries.
pub fn decode_routes(bytes: &[u8]) -> Result<Vec<RouteEntry>, RegionError> {
    let mut cursor = 0usize;
    let count = read_u32(bytes, &mut cursor)? as usize;
    let mut routes = Vec::with_capacity(count);
    for _ in 0..count {
        let key = read_u32(bytes, &mut cursor)?;
        let mask = read_u32(bytes, &mut cursor)?;
        let filter_word = read_u32(bytes, &mut cursor)?;
        let filter_id = u16::try_from(filter_word)
            .map_err(|_| invalid(format!("filter id {filter_word} does not fit 16 bits")))?;
        let dimension_mask = read_u32(bytes, &mut cursor)?;
        routes.push(RouteEntry {
            key,
            mask,
            filter_id,
            dimension_mask,
        });
    }
    finish(bytes, cursor)?;
    Ok(routes)
}

pub fn encode_routes(routes: &[RouteEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + routes.len() * 16);
    push_u32(&mut bytes, routes.len() as u32);
    for route in routes {
        push_u32(&mut bytes, route.key);
        push_u32(&mut bytes, route.mask);
        push_u32(&mut bytes, u32::from(route.filter_id));
        push_u32(&mut bytes, route.dimension_mask);
    }
    bytes
}

const PES_LAYOUT_ON_SPIKE: u32 = 1;
const PES_LAYOUT_FILTERED_ACTIVITY: u32 = 2;

/// PES learning-rule region. The leading layout tag selects the variant;
/// an unknown tag is init-fatal rather than silently resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PesRegion {
    OnSpike {
        learning_rate: Value,
        error_filter_id: u16,
        decoder_output_offset: u16,
    },
    FilteredActivity {
        learning_rate: Value,
        activity_decay: Value,
        error_filter_id: u16,
        decoder_output_offset: u16,
    },
}

impl PesRegion {
    pub fn decode(bytes: &[u8]) -> Result<Self, RegionError> {
        let mut cursor = 0usize;
        let tag = read_u32(bytes, &mut cursor)?;
        let region = match tag {
            PES_LAYOUT_ON_SPIKE => {
                let learning_rate = read_value(bytes, &mut cursor)?;
                let error_filter_id = read_dim(bytes, &mut cursor, "error_filter_id")?;
                let decoder_output_offset = read_dim(bytes, &mut cursor, "decoder_output_offset")?;
                PesRegion::OnSpike {
                    learning_rate,
                    error_filter_id,
                    decoder_output_offset,
                }
            }
            PES_LAYOUT_FILTERED_ACTIVITY => {
                let learning_rate = read_value(bytes, &mut cursor)?;
                let activity_decay = read_value(bytes, &mut cursor)?;
                let error_filter_id = read_dim(bytes, &mut cursor, "error_filter_id")?;
                let decoder_output_offset = read_dim(bytes, &mut cursor, "decoder_output_offset")?;
                PesRegion::FilteredActivity {
                    learning_rate,
                    activity_decay,
                    error_filter_id,
                    decoder_output_offset,
                }
            }
            other => {
                return Err(invalid(format!("ambiguous PES region layout tag {other}")));
            }
        };
        finish(bytes, cursor)?;
        Ok(region)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        match *self {
            PesRegion::OnSpike {
                learning_rate,
                error_filter_id,
                decoder_output_offset,
            } => {
                push_u32(&mut bytes, PES_LAYOUT_ON_SPIKE);
                push_value(&mut bytes, learning_rate);
                push_u32(&mut bytes, u32::from(error_filter_id));
                push_u32(&mut bytes, u32::from(decoder_output_offset));
            }
            PesRegion::FilteredActivity {
                learning_rate,
                activity_decay,
                error_filter_id,
                decoder_output_offset,
            } => {
                push_u32(&mut bytes, PES_LAYOUT_FILTERED_ACTIVITY);
                push_value(&mut bytes, learning_rate);
                push_value(&mut bytes, activity_decay);
                push_u32(&mut bytes, u32::from(error_filter_id));
                push_u32(&mut bytes, u32::from(decoder_output_offset));
            }
        }
        bytes
    }
}

/// System region of the value-source kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueSourceSystemRegion {
    pub n_dims: u16,
    pub machine_timestep_us: u32,
    pub block_length: u32,
    pub n_full_blocks: u32,
    pub partial_block: u32,
    pub periodic: bool,
}

const VALUE_SOURCE_FLAG_PERIODIC: u32 = 0x1;

impl ValueSourceSystemRegion {
    pub fn decode(bytes: &[u8]) -> Result<Self, RegionError> {
        let mut cursor = 0usize;
        let n_dims = read_dim(bytes, &mut cursor, "n_dims")?;
        let machine_timestep_us = read_u32(bytes, &mut cursor)?;
        let block_length = read_u32(bytes, &mut cursor)?;
        let n_full_blocks = read_u32(bytes, &mut cursor)?;
        let partial_block = read_u32(bytes, &mut cursor)?;
        let flags = read_u32(bytes, &mut cursor)?;
        finish(bytes, cursor)?;

        if n_dims == 0 {
            return Err(invalid("value source with zero dimensions"));
        }
        if block_length == 0 {
            return Err(invalid("value source with zero block length"));
        }
        if partial_block >= block_length {
            return Err(invalid(format!(
                "partial block of {partial_block} frames not shorter than block length {block_length}"
            )));
        }
        if n_full_blocks == 0 && partial_block == 0 {
            return Err(invalid("value source with no frames"));
        }

        Ok(ValueSourceSystemRegion {
            n_dims,
            machine_timestep_us,
            block_length,
            n_full_blocks,
            partial_block,
            periodic: flags & VALUE_SOURCE_FLAG_PERIODIC != 0,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(6 * 4);
        push_u32(&mut bytes, u32::from(self.n_dims));
        push_u32(&mut bytes, self.machine_timestep_us);
        push_u32(&mut bytes, self.block_length);
        push_u32(&mut bytes, self.n_full_blocks);
        push_u32(&mut bytes, self.partial_block);
        push_u32(
            &mut bytes,
            if self.periodic {
                VALUE_SOURCE_FLAG_PERIODIC
            } else {
                0
            },
        );
        bytes
    }

    /// Total number of blocks including the partial block, if any.
    pub fn n_blocks(&self) -> u32 {
        self.n_full_blocks + u32::from(self.partial_block > 0)
    }

    pub fn total_frames(&self) -> u64 {
        u64::from(self.n_full_blocks) * u64::from(self.block_length) + u64::from(self.partial_block)
    }
}

/// System region shared by the filter kernel and the Tx bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSystemRegion {
    pub n_dims: u16,
    pub machine_timestep_us: u32,
    pub transmission_delay: u32,
    pub n_filters: u16,
    pub n_filter_routes: u16,
}

impl FilterSystemRegion {
    pub fn decode(bytes: &[u8]) -> Result<Self, RegionError> {
        let mut cursor = 0usize;
        let n_dims = read_dim(bytes, &mut cursor, "n_dims")?;
        let machine_timestep_us = read_u32(bytes, &mut cursor)?;
        let transmission_delay = read_u32(bytes, &mut cursor)?;
        let n_filters = read_dim(bytes, &mut cursor, "n_filters")?;
        let n_filter_routes = read_dim(bytes, &mut cursor, "n_filter_routes")?;
        finish(bytes, cursor)?;

        if n_dims == 0 {
            return Err(invalid("filter node with zero dimensions"));
        }
        if transmission_delay == 0 {
            return Err(invalid("transmission delay of zero ticks"));
        }

        Ok(FilterSystemRegion {
            n_dims,
            machine_timestep_us,
            transmission_delay,
            n_filters,
            n_filter_routes,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(5 * 4);
        push_u32(&mut bytes, u32::from(self.n_dims));
        push_u32(&mut bytes, self.machine_timestep_us);
        push_u32(&mut bytes, self.transmission_delay);
        push_u32(&mut bytes, u32::from(self.n_filters));
        push_u32(&mut bytes, u32::from(self.n_filter_routes));
        bytes
    }
}

/// System region of the value-sink kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkSystemRegion {
    pub n_dims: u16,
    pub machine_timestep_us: u32,
    pub n_filters: u16,
    pub n_filter_routes: u16,
}

impl SinkSystemRegion {
    pub fn decode(bytes: &[u8]) -> Result<Self, RegionError> {
        let mut cursor = 0usize;
        let n_dims = read_dim(bytes, &mut cursor, "n_dims")?;
        let machine_timestep_us = read_u32(bytes, &mut cursor)?;
        let n_filters = read_dim(bytes, &mut cursor, "n_filters")?;
        let n_filter_routes = read_dim(bytes, &mut cursor, "n_filter_routes")?;
        finish(bytes, cursor)?;

        if n_dims == 0 {
            return Err(invalid("value sink with zero dimensions"));
        }

        Ok(SinkSystemRegion {
            n_dims,
            machine_timestep_us,
            n_filters,
            n_filter_routes,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 * 4);
        push_u32(&mut bytes, u32::from(self.n_dims));
        push_u32(&mut bytes, self.machine_timestep_us);
        push_u32(&mut bytes, u32::from(self.n_filters));
        push_u32(&mut bytes, u32::from(self.n_filter_routes));
        bytes
    }
}

/// System region of the Rx bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxSystemRegion {
    pub n_dims: u16,
    /// Microseconds between successive dimension transmissions; the host
    /// compiler sets this to `dt / n_dims`.
    pub output_period_us: u32,
}

/// The Rx bridge can inject at most this many dimensions.
pub const RX_MAX_DIMS: u16 = 64;

impl RxSystemRegion {
    pub fn decode(bytes: &[u8]) -> Result<Self, RegionError> {
        let mut cursor = 0usize;
        let n_dims = read_dim(bytes, &mut cursor, "n_dims")?;
        let output_period_us = read_u32(bytes, &mut cursor)?;
        finish(bytes, cursor)?;

        if n_dims == 0 || n_dims > RX_MAX_DIMS {
            return Err(invalid(format!(
                "rx bridge dimension count {n_dims} outside 1..={RX_MAX_DIMS}"
            )));
        }

        Ok(RxSystemRegion {
            n_dims,
            output_period_us,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 * 4);
        push_u32(&mut bytes, u32::from(self.n_dims));
        push_u32(&mut bytes, self.output_period_us);
        bytes
    }
}

/// Per-node key triple in the controller's node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeKeys {
    pub ping: u32,
    pub pong: u32,
    pub correction: u32,
}

/// Region holding the controller's node table and broadcast keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerRegion {
    pub machine_timestep_us: u32,
    pub start_at_key: u32,
    pub stop_at_key: u32,
    pub nodes: Vec<NodeKeys>,
}

impl ControllerRegion {
    pub fn decode(bytes: &[u8]) -> Result<Self, RegionError> {
        let mut cursor = 0usize;
        let machine_timestep_us = read_u32(bytes, &mut cursor)?;
        let start_at_key = read_u32(bytes, &mut cursor)?;
        let stop_at_key = read_u32(bytes, &mut cursor)?;
        let count = read_u32(bytes, &mut cursor)? as usize;
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            let ping = read_u32(bytes, &mut cursor)?;
            let pong = read_u32(bytes, &mut cursor)?;
            let correction = read_u32(bytes, &mut cursor)?;
            nodes.push(NodeKeys {
                ping,
                pong,
                correction,
            });
        }
        finish(bytes, cursor)?;

        if nodes.is_empty() {
            return Err(invalid("controller with empty node table"));
        }

        Ok(ControllerRegion {
            machine_timestep_us,
            start_at_key,
            stop_at_key,
            nodes,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16 + self.nodes.len() * 12);
        push_u32(&mut bytes, self.machine_timestep_us);
        push_u32(&mut bytes, self.start_at_key);
        push_u32(&mut bytes, self.stop_at_key);
        push_u32(&mut bytes, self.nodes.len() as u32);
        for node in &self.nodes {
            push_u32(&mut bytes, node.ping);
            push_u32(&mut bytes, node.pong);
            push_u32(&mut bytes, node.correction);
        }
        bytes
    }
}

/// Clock-discipline keys a worker core listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisciplineKeysRegion {
    pub ping: u32,
    pub pong: u32,
    pub correction: u32,
    pub start_at: u32,
    pub stop_at: u32,
}

impl DisciplineKeysRegion {
    pub fn decode(bytes: &[u8]) -> Result<Self, RegionError> {
        let mut cursor = 0usize;
        let ping = read_u32(bytes, &mut cursor)?;
        let pong = read_u32(bytes, &mut cursor)?;
        let correction = read_u32(bytes, &mut cursor)?;
        let start_at = read_u32(bytes, &mut cursor)?;
        let stop_at = read_u32(bytes, &mut cursor)?;
        finish(bytes, cursor)?;
        Ok(DisciplineKeysRegion {
            ping,
            pong,
            correction,
            start_at,
            stop_at,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(5 * 4);
        push_u32(&mut bytes, self.ping);
        push_u32(&mut bytes, self.pong);
        push_u32(&mut bytes, self.correction);
        push_u32(&mut bytes, self.start_at);
        push_u32(&mut bytes, self.stop_at);
        bytes
    }
}

/// The table of parameter regions a core reads at startup.
///
/// Encoded as `count`, then `count` entries of `(region_id, byte_length)`,
/// then the region payloads in entry order. Region ids follow each
/// kernel's numbering; id 0 is reserved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegionTable {
    regions: Vec<(u32, Vec<u8>)>,
}

impl RegionTable {
    pub fn new() -> Self {
        RegionTable::default()
    }

    pub fn insert(&mut self, id: u32, bytes: Vec<u8>) -> &mut Self {
        debug_assert!(id != 0, "region id 0 is reserved");
        self.regions.push((id, bytes));
        self
    }

    pub fn region(&self, id: u32) -> Option<&[u8]> {
        self.regions
            .iter()
            .find(|(region_id, _)| *region_id == id)
            .map(|(_, bytes)| bytes.as_slice())
    }

    /// Like [`RegionTable::region`] but an error when absent, for regions
    /// a kernel cannot start without.
    pub fn require(&self, id: u32) -> Result<&[u8], RegionError> {
        self.region(id)
            .ok_or_else(|| invalid(format!("missing required region {id}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RegionError> {
        let mut cursor = 0usize;
        let count = read_u32(bytes, &mut cursor)? as usize;
        let mut lengths = Vec::with_capacity(count);
        for _ in 0..count {
            let id = read_u32(bytes, &mut cursor)?;
            if id == 0 {
                return Err(invalid("region id 0 is reserved"));
            }
            let length = read_u32(bytes, &mut cursor)? as usize;
            lengths.push((id, length));
        }
        let mut regions = Vec::with_capacity(count);
        for (id, length) in lengths {
            if regions.iter().any(|(existing, _)| *existing == id) {
                return Err(invalid(format!("duplicate region id {id}")));
            }
            let end = cursor
                .checked_add(length)
                .ok_or(RegionError::UnexpectedEof { at: cursor })?;
            if end > bytes.len() {
                return Err(RegionError::UnexpectedEof { at: cursor });
            }
            regions.push((id, bytes[cursor..end].to_vec()));
            cursor = end;
        }
        finish(bytes, cursor)?;
        Ok(RegionTable { regions })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        push_u32(&mut bytes, self.regions.len() as u32);
        for (id, region) in &self.regions {
            push_u32(&mut bytes, *id);
            push_u32(&mut bytes, region.len() as u32);
        }
        for (_, region) in &self.regions {
            bytes.extend_from_slice(region);
        }
        bytes
    }

    /// Integrity digest over the encoded table.
    pub fn digest(&self) -> [u8; 32] {
        ensim_core::digest_meta("ensim:region_table", &self.encode())
    }
}
