#![forbid(unsafe_code)]

//! LIF ensemble kernel.
//!
//! Simulates one population of leaky integrate-and-fire neurons under the
//! Neural Engineering Framework: filtered dimensional input is encoded
//! into per-neuron currents, neurons are integrated with Euler's method,
//! spikes are decoded into dimensional output values, and decoded
//! dimensions are transmitted interleaved with the neuron loop (or batched
//! after it). Optional PES learning adjusts decoder rows on-line from an
//! error-signal filter.

use ensim_core::{digest_meta, Lfsr, NeuronStatus, Value};
use ensim_protocol::{McPacket, TickOutput};
use ensim_recording::RecordingBuffer;
use ensim_regions::{
    decode_filters, decode_keys, decode_routes, decode_values, EnsembleSystemRegion, FilterEntry,
    PesRegion, RegionError, RegionTable, RouteEntry,
};
use filtered_input::{FilteredInput, InputError};
use thiserror::Error;
use tracing::warn;

const SNAPSHOT_DIGEST_DOMAIN: &str = "ensim:ensemble:snapshot";

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
    #[error("{name} region holds {found} words, system region implies {expected}")]
    RegionSizeMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("PES error filter {filter_id} does not exist (have {n_filters})")]
    PesErrorFilterMissing { filter_id: u16, n_filters: usize },
    #[error(
        "PES decoder offset {offset} plus {error_dims} error dimensions exceeds \
         {n_output_dims} output dimensions"
    )]
    PesOffsetOutOfRange {
        offset: u16,
        error_dims: u16,
        n_output_dims: u16,
    },
}

/// How decoded dimensions leave the core within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// One dimension every `floor(N / D_out)` neuron steps. Spreads
    /// packets across the tick so downstream routers are never offered
    /// the whole decoded vector back to back.
    #[default]
    Interleaved,
    /// All dimensions after the neuron loop, nose to tail.
    Batched,
}

/// Init-time configuration that does not live in a parameter region.
#[derive(Debug, Clone, Copy)]
pub struct EnsembleConfig {
    pub output_mode: OutputMode,
    /// Ticks to simulate; `u32::MAX` means run until stopped.
    pub simulation_ticks: u32,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        EnsembleConfig {
            output_mode: OutputMode::Interleaved,
            simulation_ticks: u32::MAX,
        }
    }
}

/// Region numbering within the ensemble's parameter table.
pub mod region_ids {
    pub const SYSTEM: u32 = 1;
    pub const BIAS: u32 = 2;
    pub const ENCODERS: u32 = 3;
    pub const DECODERS: u32 = 4;
    pub const OUTPUT_KEYS: u32 = 5;
    pub const FILTERS: u32 = 6;
    pub const ROUTES: u32 = 7;
    pub const INHIB_FILTERS: u32 = 8;
    pub const INHIB_ROUTES: u32 = 9;
    pub const PES: u32 = 10;
}

/// Raw parameter regions as read from off-chip memory.
#[derive(Debug, Clone, Copy)]
pub struct EnsembleRegions<'a> {
    pub system: &'a [u8],
    pub bias: &'a [u8],
    pub encoders: &'a [u8],
    pub decoders: &'a [u8],
    pub output_keys: &'a [u8],
    pub filters: &'a [u8],
    pub routes: &'a [u8],
    pub inhib_filters: Option<&'a [u8]>,
    pub inhib_routes: Option<&'a [u8]>,
    pub pes: Option<&'a [u8]>,
}

impl<'a> EnsembleRegions<'a> {
    pub fn from_table(table: &'a RegionTable) -> Result<Self, RegionError> {
        Ok(EnsembleRegions {
            system: table.require(region_ids::SYSTEM)?,
            bias: table.require(region_ids::BIAS)?,
            encoders: table.require(region_ids::ENCODERS)?,
            decoders: table.require(region_ids::DECODERS)?,
            output_keys: table.require(region_ids::OUTPUT_KEYS)?,
            filters: table.require(region_ids::FILTERS)?,
            routes: table.require(region_ids::ROUTES)?,
            inhib_filters: table.region(region_ids::INHIB_FILTERS),
            inhib_routes: table.region(region_ids::INHIB_ROUTES),
            pes: table.region(region_ids::PES),
        })
    }
}

/// Decoded parameters, ready to build a kernel from.
#[derive(Debug, Clone)]
pub struct EnsembleParams {
    pub system: EnsembleSystemRegion,
    pub bias: Vec<Value>,
    pub encoders: Vec<Value>,
    pub decoders: Vec<Value>,
    pub output_keys: Vec<u32>,
    pub filters: Vec<FilterEntry>,
    pub routes: Vec<RouteEntry>,
    pub inhib_filters: Vec<FilterEntry>,
    pub inhib_routes: Vec<RouteEntry>,
    pub pes: Option<PesRegion>,
}

impl EnsembleParams {
    pub fn decode(regions: &EnsembleRegions<'_>) -> Result<Self, InitError> {
        let system = EnsembleSystemRegion::decode(regions.system)?;
        let n = system.n_neurons as usize;
        let bias = decode_values(regions.bias, n)?;
        let encoders = decode_values(regions.encoders, n * usize::from(system.n_input_dims))?;
        let decoders = decode_values(regions.decoders, n * usize::from(system.n_output_dims))?;
        let output_keys = decode_keys(regions.output_keys, usize::from(system.n_output_dims))?;
        let filters = decode_filters(regions.filters)?;
        let routes = decode_routes(regions.routes)?;
        let inhib_filters = match regions.inhib_filters {
            Some(bytes) => decode_filters(bytes)?,
            None => Vec::new(),
        };
        let inhib_routes = match regions.inhib_routes {
            Some(bytes) => decode_routes(bytes)?,
            None => Vec::new(),
        };
        let pes = match regions.pes {
            Some(bytes) => Some(PesRegion::decode(bytes)?),
            None => None,
        };
        Ok(EnsembleParams {
            system,
            bias,
            encoders,
            decoders,
            output_keys,
            filters,
            routes,
            inhib_filters,
            inhib_routes,
            pes,
        })
    }
}

#[derive(Debug, Clone)]
struct PesState {
    learning_rate: Value,
    error_filter_id: u16,
    decoder_output_offset: u16,
    /// Present only for the filtered-activity variant.
    activity: Option<ActivityTrace>,
}

#[derive(Debug, Clone)]
struct ActivityTrace {
    decay: Value,
    bump: Value,
    trace: Vec<Value>,
}

#[derive(Debug, Clone)]
struct InhibitoryBank {
    input: FilteredInput,
    gain: Value,
    /// L2 norm of each neuron's encoder row, fixed at init.
    encoder_gain: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct EnsembleKernel {
    n_neurons: u32,
    n_input_dims: u16,
    n_output_dims: u16,
    t_ref: u8,
    dt_over_t_rc: Value,
    i_bias: Vec<Value>,
    status: Vec<NeuronStatus>,
    encoders: Vec<Value>,
    decoders: Vec<Value>,
    input: FilteredInput,
    inhib: Option<InhibitoryBank>,
    output: Vec<Value>,
    output_keys: Vec<u32>,
    output_mode: OutputMode,
    pes: Option<PesState>,
    recording: RecordingBuffer,
    lfsr: Lfsr,
    tick: u32,
    simulation_ticks: u32,
}

impl EnsembleKernel {
    pub fn new(params: EnsembleParams, config: EnsembleConfig) -> Result<Self, InitError> {
        let system = params.system;

        let n = system.n_neurons as usize;
        check_region_size("bias", n, params.bias.len())?;
        check_region_size(
            "encoders",
            n * usize::from(system.n_input_dims),
            params.encoders.len(),
        )?;
        check_region_size(
            "decoders",
            n * usize::from(system.n_output_dims),
            params.decoders.len(),
        )?;
        check_region_size(
            "output keys",
            usize::from(system.n_output_dims),
            params.output_keys.len(),
        )?;
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

        let input = FilteredInput::new(system.n_input_dims, &params.filters, &params.routes)?;

        let inhib = if system.n_inhib_dims > 0 {
            let bank =
                FilteredInput::new(system.n_inhib_dims, &params.inhib_filters, &params.inhib_routes)?;
            let encoder_gain = encoder_row_norms(
                &params.encoders,
                system.n_neurons as usize,
                usize::from(system.n_input_dims),
            );
            Some(InhibitoryBank {
                input: bank,
                gain: system.inhib_gain,
                encoder_gain,
            })
        } else {
            None
        };

        let pes = match params.pes {
            Some(region) => Some(build_pes(region, &system)?),
            None => None,
        };

        let n_record_frames = if config.simulation_ticks == u32::MAX {
            0
        } else {
            config.simulation_ticks as usize
        };
        let recording = RecordingBuffer::new(
            system.n_neurons,
            n_record_frames,
            system.record_spikes && n_record_frames > 0,
        );

        Ok(EnsembleKernel {
            n_neurons: system.n_neurons,
            n_input_dims: system.n_input_dims,
            n_output_dims: system.n_output_dims,
            t_ref: system.t_ref,
            dt_over_t_rc: system.dt_over_t_rc,
            i_bias: params.bias,
            status: vec![NeuronStatus::default(); system.n_neurons as usize],
            encoders: params.encoders,
            decoders: params.decoders,
            input,
            inhib,
            output: vec![Value::ZERO; usize::from(system.n_output_dims)],
            output_keys: params.output_keys,
            output_mode: config.output_mode,
            pes,
            recording,
            lfsr: Lfsr::default(),
            tick: 0,
            simulation_ticks: config.simulation_ticks,
        })
    }

    pub fn from_regions(
        regions: &EnsembleRegions<'_>,
        config: EnsembleConfig,
    ) -> Result<Self, InitError> {
        Self::new(EnsembleParams::decode(regions)?, config)
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn decoders(&self) -> &[Value] {
        &self.decoders
    }

    pub fn recording(&self) -> &RecordingBuffer {
        &self.recording
    }

    pub fn on_packet(&mut self, key: u32, payload: u32) {
        if self.input.on_packet(key, payload) {
            return;
        }
        if let Some(inhib) = self.inhib.as_mut() {
            if inhib.input.on_packet(key, payload) {
                return;
            }
        }
        warn!(
            key = format_args!("{key:#010x}"),
            "ensemble: unrouted multicast packet dropped"
        );
    }

    pub fn on_timer_tick(&mut self) -> TickOutput {
        if self.tick >= self.simulation_ticks {
            return TickOutput::exited(0);
        }
        self.tick += 1;

        let mut out = TickOutput::running();

        self.recording.prepare();
        self.input.step();

        let inhib_drive = match self.inhib.as_mut() {
            Some(inhib) => {
                inhib.input.step();
                let sum = inhib
                    .input
                    .input()
                    .iter()
                    .fold(Value::ZERO, |acc, value| acc + *value);
                inhib.gain * sum
            }
            None => Value::ZERO,
        };

        // Error signal is frozen for the whole tick once the filters have
        // stepped.
        let pes_error = self.pes.as_ref().and_then(|pes| {
            if !pes.learning_rate.is_positive() {
                return None;
            }
            self.input
                .filter(pes.error_filter_id)
                .map(|filter| filter.filtered().to_vec())
        });

        let n_output_dims = usize::from(self.n_output_dims);
        let output_period = (self.n_neurons / u32::from(self.n_output_dims)).max(1);
        let mut next_output = 0usize;

        for n in 0..self.n_neurons as usize {
            if self.output_mode == OutputMode::Interleaved
                && next_output < n_output_dims
                && n as u32 % output_period == 0
            {
                self.emit_dimension(next_output, &mut out);
                next_output += 1;
            }

            let mut status = self.status[n];
            if status.refractory_time() > 0 {
                status.decrement_refractory();
                self.status[n] = status;
                continue;
            }

            let mut j = self.i_bias[n];
            let row = n * usize::from(self.n_input_dims);
            for (d, input) in self.input.input().iter().enumerate() {
                j += self.encoders[row + d] * *input;
            }
            if let Some(inhib) = self.inhib.as_ref() {
                j -= inhib.encoder_gain[n] * inhib_drive;
            }

            let v_prev = status.voltage();
            let dv = (j - v_prev) * self.dt_over_t_rc;
            let v = (v_prev + dv).max(Value::ZERO);

            if v <= Value::ONE {
                status.set_voltage(v);
                self.status[n] = status;
                continue;
            }

            // Spike: refractory, zero voltage, then model the spike having
            // happened part-way through the tick so strongly driven
            // neurons leave refractory one step early.
            status.set_refractory(self.t_ref);
            status.set_voltage(Value::ZERO);
            if self.lfsr.value() * dv < v - Value::ONE && status.refractory_time() > 0 {
                status.decrement_refractory();
            }
            self.lfsr.step();
            self.status[n] = status;

            let decoder_row = n * n_output_dims;
            for d in 0..n_output_dims {
                self.output[d] += self.decoders[decoder_row + d];
            }

            self.recording.mark_spike(n as u32);

            if let (Some(pes), Some(error)) = (self.pes.as_ref(), pes_error.as_deref()) {
                if pes.activity.is_none() {
                    apply_pes_row(
                        &mut self.decoders,
                        decoder_row + usize::from(pes.decoder_output_offset),
                        pes.learning_rate,
                        Value::ONE,
                        error,
                    );
                }
            }
        }

        match self.output_mode {
            OutputMode::Interleaved => {
                // Covers populations smaller than the output dimensionality.
                while next_output < n_output_dims {
                    self.emit_dimension(next_output, &mut out);
                    next_output += 1;
                }
            }
            OutputMode::Batched => {
                for d in 0..n_output_dims {
                    self.emit_dimension(d, &mut out);
                }
            }
        }

        self.step_filtered_activity(pes_error.as_deref());

        self.recording.flush();
        out
    }

    fn emit_dimension(&mut self, dimension: usize, out: &mut TickOutput) {
        out.push_packet(McPacket::with_value(
            self.output_keys[dimension],
            self.output[dimension],
        ));
        self.output[dimension] = Value::ZERO;
    }

    fn step_filtered_activity(&mut self, error: Option<&[Value]>) {
        let Some(pes) = self.pes.as_mut() else {
            return;
        };
        let Some(activity) = pes.activity.as_mut() else {
            return;
        };
        let Some(error) = error else {
            return;
        };

        let n_output_dims = usize::from(self.n_output_dims);
        for n in 0..self.n_neurons as usize {
            let mut trace = activity.decay * activity.trace[n];
            if self.recording.spiked(n as u32) {
                trace += activity.bump;
            }
            activity.trace[n] = trace;

            apply_pes_row(
                &mut self.decoders,
                n * n_output_dims + usize::from(pes.decoder_output_offset),
                pes.learning_rate,
                trace,
                error,
            );
        }
    }

    pub fn snapshot_digest(&self) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(8 + self.status.len() * 4 + self.decoders.len() * 4);
        bytes.extend_from_slice(&self.tick.to_le_bytes());
        for status in &self.status {
            bytes.extend_from_slice(&status.to_word().to_le_bytes());
        }
        for value in self.output.iter().chain(self.decoders.iter()) {
            bytes.extend_from_slice(&value.to_bits().to_le_bytes());
        }
        digest_meta(SNAPSHOT_DIGEST_DOMAIN, &bytes)
    }
}

fn check_region_size(
    name: &'static str,
    expected: usize,
    found: usize,
) -> Result<(), InitError> {
    if expected != found {
        return Err(InitError::RegionSizeMismatch {
            name,
            expected,
            found,
        });
    }
    Ok(())
}

fn build_pes(region: PesRegion, system: &EnsembleSystemRegion) -> Result<PesState, InitError> {
    let (learning_rate, error_filter_id, decoder_output_offset, activity) = match region {
        PesRegion::OnSpike {
            learning_rate,
            error_filter_id,
            decoder_output_offset,
        } => (learning_rate, error_filter_id, decoder_output_offset, None),
        PesRegion::FilteredActivity {
            learning_rate,
            activity_decay,
            error_filter_id,
            decoder_output_offset,
        } => (
            learning_rate,
            error_filter_id,
            decoder_output_offset,
            Some(ActivityTrace {
                decay: activity_decay,
                bump: Value::ONE - activity_decay,
                trace: vec![Value::ZERO; system.n_neurons as usize],
            }),
        ),
    };

    if error_filter_id >= system.n_filters {
        return Err(InitError::PesErrorFilterMissing {
            filter_id: error_filter_id,
            n_filters: usize::from(system.n_filters),
        });
    }
    // The error signal spans the input dimensionality.
    if u32::from(decoder_output_offset) + u32::from(system.n_input_dims)
        > u32::from(system.n_output_dims)
    {
        return Err(InitError::PesOffsetOutOfRange {
            offset: decoder_output_offset,
            error_dims: system.n_input_dims,
            n_output_dims: system.n_output_dims,
        });
    }

    Ok(PesState {
        learning_rate,
        error_filter_id,
        decoder_output_offset,
        activity,
    })
}

fn apply_pes_row(
    decoders: &mut [Value],
    start: usize,
    learning_rate: Value,
    activity: Value,
    error: &[Value],
) {
    for (d, err) in error.iter().enumerate() {
        decoders[start + d] += learning_rate * activity * *err;
    }
}

fn encoder_row_norms(encoders: &[Value], n_neurons: usize, n_input_dims: usize) -> Vec<Value> {
    (0..n_neurons)
        .map(|n| {
            let row = &encoders[n * n_input_dims..(n + 1) * n_input_dims];
            row.iter()
                .fold(Value::ZERO, |acc, e| acc + *e * *e)
                .sqrt()
        })
        .collect()
}
