#![forbid(unsafe_code)]

//! Worker-side disciplined clock.
//!
//! Each worker core keeps its tick schedule locked to the controller's
//! reference clock. The raw timer is a free-running 32-bit counter that
//! wraps; all time arithmetic here is wrapping, with signed differences
//! for ordering. The controller pings each node, measures the round trip
//! and multicasts a phase correction; the first correction sets the phase
//! absolutely, later ones are applied relatively.

use ensim_protocol::McPacket;
use ensim_regions::{DisciplineKeysRegion, RegionError, RegionTable};
use tracing::debug;

/// Region id of the discipline-keys region in every worker's table.
pub const REGION_DISCIPLINE_KEYS: u32 = 14;

/// Outcome of offering a multicast packet to the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    /// Not a clock-discipline key; the kernel should route it.
    Ignored,
    /// Consumed with no reply.
    Handled,
    /// Consumed; the pong reply must be sent.
    Pong(McPacket),
}

#[derive(Debug, Clone)]
pub struct DisciplinedClock {
    keys: DisciplineKeysRegion,
    timestep_us: u32,
    phase: u32,
    first_correction: bool,
    armed: bool,
    next_tick_at: u32,
    stop_at: Option<u32>,
    tick_count: u64,
}

impl DisciplinedClock {
    pub fn new(keys: DisciplineKeysRegion, timestep_us: u32) -> Self {
        DisciplinedClock {
            keys,
            timestep_us,
            phase: 0,
            first_correction: true,
            armed: false,
            next_tick_at: 0,
            stop_at: None,
            tick_count: 0,
        }
    }

    pub fn from_table(table: &RegionTable, timestep_us: u32) -> Result<Self, RegionError> {
        let keys = DisciplineKeysRegion::decode(table.require(REGION_DISCIPLINE_KEYS)?)?;
        Ok(Self::new(keys, timestep_us))
    }

    /// Reference time as seen by this core.
    pub fn time(&self, now_raw: u32) -> u32 {
        now_raw.wrapping_add(self.phase)
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn on_packet(&mut self, key: u32, payload: u32, now_raw: u32) -> ClockEvent {
        if key == self.keys.ping {
            // Respond to pings with the raw (uncorrected) time.
            return ClockEvent::Pong(McPacket::new(self.keys.pong, now_raw));
        }
        if key == self.keys.correction {
            if self.first_correction {
                self.phase = payload;
            } else {
                self.phase = self.phase.wrapping_add(payload);
            }
            self.first_correction = false;
            return ClockEvent::Handled;
        }
        if key == self.keys.start_at {
            self.armed = true;
            self.next_tick_at = payload;
            debug!(start_at = payload, "simulation timer armed");
            return ClockEvent::Handled;
        }
        if key == self.keys.stop_at {
            self.stop_at = Some(payload);
            debug!(stop_at = payload, "simulation timer stop scheduled");
            return ClockEvent::Handled;
        }
        ClockEvent::Ignored
    }

    /// Whether a simulation tick is due at the given raw time. Consumes
    /// the tick if so: the next tick is scheduled one timestep later.
    pub fn tick_due(&mut self, now_raw: u32) -> bool {
        if !self.armed {
            return false;
        }
        let now = self.time(now_raw);
        if let Some(stop_at) = self.stop_at {
            if now.wrapping_sub(stop_at) as i32 >= 0 {
                self.armed = false;
                debug!(stop_at, "simulation timer disarmed");
                return false;
            }
        }
        if now.wrapping_sub(self.next_tick_at) as i32 >= 0 {
            self.next_tick_at = self.next_tick_at.wrapping_add(self.timestep_us);
            self.tick_count += 1;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> DisciplineKeysRegion {
        DisciplineKeysRegion {
            ping: 0xf000_0001,
            pong: 0xf000_0002,
            correction: 0xf000_0003,
            start_at: 0xf000_0004,
            stop_at: 0xf000_0005,
        }
    }

    #[test]
    fn ping_is_answered_with_raw_time() {
        let mut clock = DisciplinedClock::new(keys(), 1000);
        let event = clock.on_packet(keys().ping, 0, 1234);
        assert_eq!(
            event,
            ClockEvent::Pong(McPacket::new(keys().pong, 1234))
        );
    }

    #[test]
    fn first_correction_is_absolute_then_relative() {
        let mut clock = DisciplinedClock::new(keys(), 1000);
        clock.on_packet(keys().correction, 100, 0);
        assert_eq!(clock.time(0), 100);
        clock.on_packet(keys().correction, 0u32.wrapping_sub(30), 0);
        assert_eq!(clock.time(0), 70);
    }

    #[test]
    fn unarmed_clock_never_ticks() {
        let mut clock = DisciplinedClock::new(keys(), 1000);
        assert!(!clock.tick_due(5000));
    }

    #[test]
    fn armed_clock_ticks_on_schedule() {
        let mut clock = DisciplinedClock::new(keys(), 1000);
        clock.on_packet(keys().start_at, 2000, 0);
        assert!(!clock.tick_due(1999));
        assert!(clock.tick_due(2000));
        assert!(!clock.tick_due(2001));
        assert!(clock.tick_due(3000));
        assert_eq!(clock.tick_count(), 2);
    }

    #[test]
    fn stop_at_disarms_the_timer() {
        let mut clock = DisciplinedClock::new(keys(), 1000);
        clock.on_packet(keys().start_at, 0, 0);
        clock.on_packet(keys().stop_at, 2000, 0);
        assert!(clock.tick_due(0));
        assert!(clock.tick_due(1000));
        assert!(!clock.tick_due(2000));
        assert!(!clock.is_armed());
    }

    #[test]
    fn phase_correction_shifts_the_schedule() {
        let mut clock = DisciplinedClock::new(keys(), 1000);
        clock.on_packet(keys().start_at, 1000, 0);
        // Local raw clock is 100 us behind the reference.
        clock.on_packet(keys().correction, 100, 0);
        assert!(!clock.tick_due(899));
        assert!(clock.tick_due(900));
    }

    #[test]
    fn schedule_survives_timer_wrap() {
        let mut clock = DisciplinedClock::new(keys(), 1000);
        clock.on_packet(keys().start_at, u32::MAX - 500, 0);
        assert!(clock.tick_due(u32::MAX - 500));
        assert!(clock.tick_due(500));
        assert_eq!(clock.tick_count(), 2);
    }

    #[test]
    fn foreign_keys_are_ignored() {
        let mut clock = DisciplinedClock::new(keys(), 1000);
        assert_eq!(clock.on_packet(0x1234_0000, 0, 0), ClockEvent::Ignored);
    }
}
