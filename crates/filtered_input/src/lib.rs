#![forbid(unsafe_code)]

//! The filtered-input subsystem shared by every consuming kernel.
//!
//! Incoming keyed payloads are routed to per-filter dimension accumulators;
//! at each tick boundary `step` applies the first-order IIR decay and
//! rebuilds the consumer-visible `input` vector. `on_packet` only mutates
//! accumulators and `step` is the only writer of the filtered state, which
//! is what lets the packet handler preempt the timer handler on a core.

use ensim_core::Value;
use ensim_regions::{FilterEntry, RouteEntry};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("route {route} references filter {filter_id} but only {n_filters} filters exist")]
    MissingFilter {
        route: usize,
        filter_id: u16,
        n_filters: usize,
    },
    #[error("filter {filter}: accumulator mask {mask:#010x} contradicts modulatory flag")]
    InconsistentAccumulatorMask { filter: usize, mask: u32 },
}

/// One first-order IIR filter over all input dimensions.
#[derive(Debug, Clone)]
pub struct Filter {
    decay: Value,
    complement: Value,
    /// Applied to the previous accumulator word before adding a new
    /// contribution: all-ones for additive filters, zero for modulatory
    /// (latest value wins) filters.
    accumulator_mask: u32,
    accumulator: Vec<Value>,
    filtered: Vec<Value>,
}

impl Filter {
    fn new(entry: &FilterEntry, n_dimensions: usize) -> Self {
        Filter {
            decay: entry.decay,
            complement: entry.complement,
            accumulator_mask: entry.accumulator_mask,
            accumulator: vec![Value::ZERO; n_dimensions],
            filtered: vec![Value::ZERO; n_dimensions],
        }
    }

    pub fn filtered(&self) -> &[Value] {
        &self.filtered
    }

    fn accumulate(&mut self, dimension: usize, value: Value) {
        let kept = self.accumulator[dimension].to_bits() & self.accumulator_mask as i32;
        self.accumulator[dimension] = Value::from_bits(kept) + value;
    }

    fn step(&mut self) {
        for d in 0..self.accumulator.len() {
            self.filtered[d] = self.decay * self.filtered[d] + self.complement * self.accumulator[d];
            self.accumulator[d] = Value::ZERO;
        }
    }
}

/// Routing table, filter bank and resulting input vector for one kernel.
#[derive(Debug, Clone)]
pub struct FilteredInput {
    n_dimensions: u16,
    filters: Vec<Filter>,
    routes: Vec<RouteEntry>,
    input: Vec<Value>,
}

impl FilteredInput {
    pub fn new(
        n_dimensions: u16,
        filter_entries: &[FilterEntry],
        routes: &[RouteEntry],
    ) -> Result<Self, InputError> {
        for (index, entry) in filter_entries.iter().enumerate() {
            let expected = if entry.modulatory { 0 } else { u32::MAX };
            if entry.accumulator_mask != expected {
                return Err(InputError::InconsistentAccumulatorMask {
                    filter: index,
                    mask: entry.accumulator_mask,
                });
            }
        }
        for (index, route) in routes.iter().enumerate() {
            if usize::from(route.filter_id) >= filter_entries.len() {
                return Err(InputError::MissingFilter {
                    route: index,
                    filter_id: route.filter_id,
                    n_filters: filter_entries.len(),
                });
            }
        }

        let filters = filter_entries
            .iter()
            .map(|entry| Filter::new(entry, usize::from(n_dimensions)))
            .collect();

        Ok(FilteredInput {
            n_dimensions,
            filters,
            routes: routes.to_vec(),
            input: vec![Value::ZERO; usize::from(n_dimensions)],
        })
    }

    pub fn n_dimensions(&self) -> u16 {
        self.n_dimensions
    }

    /// Consumer-visible input vector, valid after the last `step`.
    pub fn input(&self) -> &[Value] {
        &self.input
    }

    pub fn filter(&self, filter_id: u16) -> Option<&Filter> {
        self.filters.get(usize::from(filter_id))
    }

    /// Deliver one dimensional contribution. Routes are scanned in
    /// insertion order and the first match wins. Returns `false` if no
    /// route matched so the caller can try another bank before dropping.
    pub fn on_packet(&mut self, key: u32, payload: u32) -> bool {
        for route in &self.routes {
            if key & route.mask != route.key {
                continue;
            }
            let dimension = (key & route.dimension_mask) as usize;
            if dimension >= usize::from(self.n_dimensions) {
                warn!(
                    key = format_args!("{key:#010x}"),
                    dimension, "dimension index outside input vector, packet dropped"
                );
                return true;
            }
            self.filters[usize::from(route.filter_id)]
                .accumulate(dimension, Value::from_payload(payload));
            return true;
        }
        false
    }

    /// Finalise the tick: decay every filter into its filtered vector,
    /// zero the accumulators and rebuild the summed input vector.
    pub fn step(&mut self) {
        for value in self.input.iter_mut() {
            *value = Value::ZERO;
        }
        for filter in self.filters.iter_mut() {
            filter.step();
            for (input, filtered) in self.input.iter_mut().zip(filter.filtered.iter()) {
                *input += *filtered;
            }
        }
    }
}

/// A filter entry with additive semantics and the matching mask.
pub fn additive_filter(decay: Value, complement: Value) -> FilterEntry {
    FilterEntry {
        decay,
        complement,
        accumulator_mask: u32::MAX,
        modulatory: false,
    }
}

/// A filter entry with replacement semantics and the matching mask.
pub fn modulatory_filter(decay: Value, complement: Value) -> FilterEntry {
    FilterEntry {
        decay,
        complement,
        accumulator_mask: 0,
        modulatory: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_route(filter_id: u16) -> RouteEntry {
        RouteEntry {
            key: 0x2000_0000,
            mask: 0xffff_fff0,
            filter_id,
            dimension_mask: 0xf,
        }
    }

    fn unit_input(n_dims: u16) -> FilteredInput {
        // a = 0: the filtered value is exactly the last tick's accumulator.
        FilteredInput::new(
            n_dims,
            &[additive_filter(Value::ZERO, Value::ONE)],
            &[unit_route(0)],
        )
        .unwrap()
    }

    #[test]
    fn route_to_missing_filter_fails_init() {
        let error = FilteredInput::new(
            1,
            &[additive_filter(Value::ZERO, Value::ONE)],
            &[unit_route(1)],
        )
        .unwrap_err();
        assert!(matches!(
            error,
            InputError::MissingFilter {
                route: 0,
                filter_id: 1,
                n_filters: 1
            }
        ));
    }

    #[test]
    fn mask_and_modulatory_flag_must_agree() {
        let mut entry = additive_filter(Value::ZERO, Value::ONE);
        entry.accumulator_mask = 0;
        assert!(matches!(
            FilteredInput::new(1, &[entry], &[]),
            Err(InputError::InconsistentAccumulatorMask { filter: 0, .. })
        ));
    }

    #[test]
    fn unrouted_packets_are_reported() {
        let mut input = unit_input(1);
        assert!(!input.on_packet(0x3000_0000, 0));
        assert!(input.on_packet(0x2000_0000, 0));
    }

    #[test]
    fn contributions_sum_within_a_tick() {
        let mut input = unit_input(2);
        input.on_packet(0x2000_0000, Value::from_f32(0.25).to_payload());
        input.on_packet(0x2000_0000, Value::from_f32(0.25).to_payload());
        input.on_packet(0x2000_0001, Value::from_f32(1.0).to_payload());
        input.step();
        assert_eq!(input.input()[0], Value::from_f32(0.5));
        assert_eq!(input.input()[1], Value::from_f32(1.0));
    }

    #[test]
    fn modulatory_contributions_replace() {
        let mut input = FilteredInput::new(
            1,
            &[modulatory_filter(Value::ZERO, Value::ONE)],
            &[unit_route(0)],
        )
        .unwrap();
        input.on_packet(0x2000_0000, Value::from_f32(0.25).to_payload());
        input.on_packet(0x2000_0000, Value::from_f32(-1.0).to_payload());
        input.step();
        assert_eq!(input.input()[0], Value::from_f32(-1.0));
    }

    #[test]
    fn iir_decay_sequence_is_bit_exact() {
        let half = Value::from_f32(0.5);
        let mut input =
            FilteredInput::new(1, &[additive_filter(half, half)], &[unit_route(0)]).unwrap();
        input.on_packet(0x2000_0000, Value::ONE.to_payload());

        let mut expected = Value::ZERO;
        let mut accumulator = Value::ONE;
        for _ in 0..6 {
            input.step();
            expected = half * expected + half * accumulator;
            accumulator = Value::ZERO;
            assert_eq!(input.input()[0], expected);
        }
        // 1.0 fed once through a = 0.5 decays as 0.5, 0.25, ...
        assert_eq!(expected, Value::from_f32(0.5 * 0.5f32.powi(5)));
    }

    #[test]
    fn accumulators_are_zero_after_step() {
        let mut input = unit_input(1);
        input.on_packet(0x2000_0000, Value::ONE.to_payload());
        input.step();
        input.step();
        assert_eq!(input.input()[0], Value::ZERO);
    }

    #[test]
    fn first_matching_route_wins() {
        let routes = [
            RouteEntry {
                key: 0x2000_0000,
                mask: 0xffff_fff0,
                filter_id: 0,
                dimension_mask: 0xf,
            },
            // Catch-all entry behind the specific one.
            RouteEntry {
                key: 0x0,
                mask: 0x0,
                filter_id: 1,
                dimension_mask: 0xf,
            },
        ];
        let mut input = FilteredInput::new(
            1,
            &[
                additive_filter(Value::ZERO, Value::ONE),
                additive_filter(Value::ZERO, Value::ONE),
            ],
            &routes,
        )
        .unwrap();
        input.on_packet(0x2000_0000, Value::ONE.to_payload());
        input.step();
        assert_eq!(input.filter(0).unwrap().filtered()[0], Value::ONE);
        assert_eq!(input.filter(1).unwrap().filtered()[0], Value::ZERO);
    }

    #[test]
    fn input_is_the_sum_of_all_filters() {
        let routes = [
            RouteEntry {
                key: 0x2000_0000,
                mask: 0xffff_fff0,
                filter_id: 0,
                dimension_mask: 0xf,
            },
            RouteEntry {
                key: 0x3000_0000,
                mask: 0xffff_fff0,
                filter_id: 1,
                dimension_mask: 0xf,
            },
        ];
        let mut input = FilteredInput::new(
            1,
            &[
                additive_filter(Value::ZERO, Value::ONE),
                additive_filter(Value::ZERO, Value::ONE),
            ],
            &routes,
        )
        .unwrap();
        input.on_packet(0x2000_0000, Value::from_f32(0.25).to_payload());
        input.on_packet(0x3000_0000, Value::from_f32(0.5).to_payload());
        input.step();
        assert_eq!(input.input()[0], Value::from_f32(0.75));
    }
}
