#![cfg(test)]
#![allow(dead_code)]

use ensim_core::Value;
use ensim_regions::{
    encode_filters, encode_keys, encode_values, ControllerRegion, DisciplineKeysRegion,
    FilterEntry, FilterSystemRegion, NodeKeys, RegionTable, RouteEntry, RxSystemRegion,
    SinkSystemRegion, ValueSourceSystemRegion,
};
use filtered_input::additive_filter;

pub const START_AT_KEY: u32 = 0xff00_0001;
pub const STOP_AT_KEY: u32 = 0xff00_0002;

pub const TIMESTEP_US: u32 = 1000;
pub const CONTROLLER_PERIOD_US: u32 = 100;

pub fn discipline_keys(node: u32) -> DisciplineKeysRegion {
    let base = 0xd000_0000 + node * 0x10;
    DisciplineKeysRegion {
        ping: base,
        pong: base + 1,
        correction: base + 2,
        start_at: START_AT_KEY,
        stop_at: STOP_AT_KEY,
    }
}

pub fn controller_region(n_nodes: u32) -> ControllerRegion {
    ControllerRegion {
        machine_timestep_us: CONTROLLER_PERIOD_US,
        start_at_key: START_AT_KEY,
        stop_at_key: STOP_AT_KEY,
        nodes: (0..n_nodes)
            .map(|node| {
                let keys = discipline_keys(node);
                NodeKeys {
                    ping: keys.ping,
                    pong: keys.pong,
                    correction: keys.correction,
                }
            })
            .collect(),
    }
}

pub fn controller_table(n_nodes: u32) -> RegionTable {
    let mut table = RegionTable::new();
    table.insert(
        sim_controller::region_ids::SYSTEM,
        controller_region(n_nodes).encode(),
    );
    table
}

pub fn unit_filter() -> FilterEntry {
    additive_filter(Value::ZERO, Value::ONE)
}

pub fn unit_route(key: u32) -> RouteEntry {
    RouteEntry {
        key,
        mask: 0xffff_fff0,
        filter_id: 0,
        dimension_mask: 0xf,
    }
}

pub fn filter_table(node: u32, in_key: u32, out_keys: &[u32]) -> RegionTable {
    let system = FilterSystemRegion {
        n_dims: out_keys.len() as u16,
        machine_timestep_us: TIMESTEP_US,
        transmission_delay: 1,
        n_filters: 1,
        n_filter_routes: 1,
    };
    let mut table = RegionTable::new();
    table.insert(filter_kernel::region_ids::SYSTEM, system.encode());
    table.insert(filter_kernel::region_ids::OUTPUT_KEYS, encode_keys(out_keys));
    table.insert(
        filter_kernel::region_ids::FILTERS,
        encode_filters(&[unit_filter()]),
    );
    table.insert(
        filter_kernel::region_ids::ROUTES,
        ensim_regions::encode_routes(&[unit_route(in_key)]),
    );
    table.insert(
        ensim_clock::REGION_DISCIPLINE_KEYS,
        discipline_keys(node).encode(),
    );
    table
}

pub fn tx_bridge_table(node: u32, in_key: u32, n_dims: u16) -> RegionTable {
    let system = FilterSystemRegion {
        n_dims,
        machine_timestep_us: TIMESTEP_US,
        transmission_delay: 1,
        n_filters: 1,
        n_filter_routes: 1,
    };
    let mut table = RegionTable::new();
    table.insert(tx_bridge_kernel::region_ids::SYSTEM, system.encode());
    table.insert(
        tx_bridge_kernel::region_ids::FILTERS,
        encode_filters(&[unit_filter()]),
    );
    table.insert(
        tx_bridge_kernel::region_ids::ROUTES,
        ensim_regions::encode_routes(&[unit_route(in_key)]),
    );
    table.insert(
        ensim_clock::REGION_DISCIPLINE_KEYS,
        discipline_keys(node).encode(),
    );
    table
}

pub fn rx_bridge_table(node: u32, out_keys: &[u32]) -> RegionTable {
    let n_dims = out_keys.len() as u16;
    let system = RxSystemRegion {
        n_dims,
        output_period_us: TIMESTEP_US / u32::from(n_dims),
    };
    let mut table = RegionTable::new();
    table.insert(rx_bridge_kernel::region_ids::SYSTEM, system.encode());
    table.insert(rx_bridge_kernel::region_ids::OUTPUT_KEYS, encode_keys(out_keys));
    table.insert(
        rx_bridge_kernel::region_ids::INITIAL_VALUES,
        encode_values(&vec![Value::ZERO; usize::from(n_dims)]),
    );
    table.insert(
        ensim_clock::REGION_DISCIPLINE_KEYS,
        discipline_keys(node).encode(),
    );
    table
}

pub fn value_source_table(node: u32, out_key: u32, samples: &[f32], periodic: bool) -> RegionTable {
    let system = ValueSourceSystemRegion {
        n_dims: 1,
        machine_timestep_us: TIMESTEP_US,
        block_length: samples.len() as u32,
        n_full_blocks: 1,
        partial_block: 0,
        periodic,
    };
    let values: Vec<Value> = samples.iter().copied().map(Value::from_f32).collect();
    let mut table = RegionTable::new();
    table.insert(value_source_kernel::region_ids::SYSTEM, system.encode());
    table.insert(
        value_source_kernel::region_ids::OUTPUT_KEYS,
        encode_keys(&[out_key]),
    );
    table.insert(value_source_kernel::region_ids::BLOCKS, encode_values(&values));
    table.insert(
        ensim_clock::REGION_DISCIPLINE_KEYS,
        discipline_keys(node).encode(),
    );
    table
}

pub fn value_sink_table(node: u32, in_key: u32) -> RegionTable {
    let system = SinkSystemRegion {
        n_dims: 1,
        machine_timestep_us: TIMESTEP_US,
        n_filters: 1,
        n_filter_routes: 1,
    };
    let mut table = RegionTable::new();
    table.insert(value_sink_kernel::region_ids::SYSTEM, system.encode());
    table.insert(
        value_sink_kernel::region_ids::FILTERS,
        encode_filters(&[unit_filter()]),
    );
    table.insert(
        value_sink_kernel::region_ids::ROUTES,
        ensim_regions::encode_routes(&[unit_route(in_key)]),
    );
    table.insert(
        ensim_clock::REGION_DISCIPLINE_KEYS,
        discipline_keys(node).encode(),
    );
    table
}

/// Wire the discipline traffic for worker `node` named `name`: ping,
/// correction, start and stop reach the worker; its pong reaches the
/// controller.
pub fn wire_discipline(engine: &mut engine::Engine, node: u32, name: &str) {
    let keys = discipline_keys(node);
    engine.add_route(keys.ping, u32::MAX, name).unwrap();
    engine.add_route(keys.correction, u32::MAX, name).unwrap();
    engine.add_route(keys.pong, u32::MAX, "controller").unwrap();
    engine.add_route(START_AT_KEY, u32::MAX, name).unwrap();
    engine.add_route(STOP_AT_KEY, u32::MAX, name).unwrap();
}
