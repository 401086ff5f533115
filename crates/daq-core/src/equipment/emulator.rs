//! Readout-card emulator: synthesizes packet-header framed pages for a
//! configurable number of links, with orbit progression capped by the
//! real orbit rate so the generated stream has physical timing.

use super::{DataSource, EquipmentError};
use crate::block::DataBlock;
use crate::config::{ConfigError, ConfigMap};
use crate::memory::PagePool;
use crate::rdh::{RDH_SIZE, RdhBuilder};
use crate::tfclock::LHC_ORBIT_RATE;
use std::sync::Arc;
use std::time::Instant;

pub struct EmulatorSource {
    number_of_links: usize,
    base_link_id: u8,
    fee_id: u16,
    cru_id: u16,
    system_id: u8,
    /// Size of one packet (header + payload) in bytes.
    packet_size: usize,
    /// Orbits between two heartbeat packets.
    hb_period: u32,
    /// Timeframe length in orbits; pages never span two timeframes.
    tf_period_orbits: u32,
    /// Orbit rate used for pacing; the LHC rate unless overridden for
    /// accelerated replay.
    orbit_rate: f64,

    first_orbit: u32,
    /// Next orbit to emit, per link.
    next_orbit: Vec<u32>,
    packet_counter: Vec<u8>,
    next_link: usize,
    started_at: Instant,
}

impl EmulatorSource {
    pub fn from_config(cfg: &ConfigMap, section: &str) -> Result<Self, ConfigError> {
        let number_of_links = cfg.get_i64_or(section, "numberOfLinks", 1)?.clamp(1, 32) as usize;
        let packet_size = cfg.get_bytes_or(section, "cruBlockSize", 8192)? as usize;
        if packet_size < RDH_SIZE {
            return Err(ConfigError::BadValue {
                section: section.into(),
                key: "cruBlockSize".into(),
                value: packet_size.to_string(),
                expected: "at least one packet header",
            });
        }
        Ok(Self {
            number_of_links,
            base_link_id: cfg.get_i64_or(section, "linkId", 0)?.clamp(0, 31) as u8,
            fee_id: cfg.get_i64_or(section, "feeId", 0)? as u16,
            cru_id: cfg.get_i64_or(section, "cruId", 1)? as u16,
            system_id: cfg.get_i64_or(section, "systemId", 0)? as u8,
            packet_size,
            hb_period: cfg.get_i64_or(section, "HBperiod", 1)?.max(1) as u32,
            tf_period_orbits: cfg.get_i64_or(section, "TFperiod", 128)?.max(1) as u32,
            orbit_rate: cfg.get_f64_or(section, "orbitRate", LHC_ORBIT_RATE as f64)?,
            first_orbit: cfg.get_i64_or(section, "firstOrbit", 0)? as u32,
            next_orbit: Vec::new(),
            packet_counter: Vec::new(),
            next_link: 0,
            started_at: Instant::now(),
        })
    }

    fn link_id(&self, slot: usize) -> u8 {
        self.base_link_id + slot as u8
    }

    /// Orbits emitted so far may not outrun the wall clock.
    fn orbit_budget(&self) -> u64 {
        (self.started_at.elapsed().as_secs_f64() * self.orbit_rate) as u64
    }
}

impl DataSource for EmulatorSource {
    fn start(&mut self) -> Result<(), EquipmentError> {
        self.next_orbit = vec![self.first_orbit; self.number_of_links];
        self.packet_counter = vec![0; self.number_of_links];
        self.next_link = 0;
        self.started_at = Instant::now();
        Ok(())
    }

    fn next_block(&mut self, pool: &Arc<PagePool>) -> Result<Option<DataBlock>, EquipmentError> {
        if self.next_orbit.is_empty() {
            self.start()?;
        }
        let slot = self.next_link;
        let orbit = self.next_orbit[slot];
        let elapsed_orbits = (orbit - self.first_orbit) as u64;
        if elapsed_orbits >= self.orbit_budget() {
            // ahead of real time; wait
            return Ok(None);
        }

        let Some(mut block) = pool.new_data_block(None) else {
            return Ok(None);
        };

        // fill the page with heartbeat packets, stopping at the page end
        // or at the timeframe boundary, whichever comes first
        let capacity = block.capacity();
        let mut offset = 0usize;
        let mut next = orbit;
        let tf_index = (orbit - self.first_orbit) / self.tf_period_orbits;
        let tf_end_orbit = self.first_orbit + (tf_index + 1) * self.tf_period_orbits;
        {
            let page = block.payload_mut();
            while offset + self.packet_size <= capacity && next < tf_end_orbit {
                let counter = self.packet_counter[slot];
                self.packet_counter[slot] = counter.wrapping_add(1);
                RdhBuilder {
                    fee_id: self.fee_id,
                    system_id: self.system_id,
                    link_id: self.link_id(slot),
                    cru_id: self.cru_id,
                    endpoint: 0,
                    orbit: next,
                    packet_counter: counter,
                    offset_next_packet: self.packet_size as u16,
                    memory_size: self.packet_size as u16,
                    stop_bit: 1,
                }
                .write(&mut page[offset..]);
                offset += self.packet_size;
                next += self.hb_period;
            }
        }
        self.next_orbit[slot] = next.max(orbit + 1);
        self.next_link = (self.next_link + 1) % self.number_of_links;
        if offset == 0 {
            // page smaller than one packet; drop it and move on
            return Ok(None);
        }
        block.set_data_size(offset);
        Ok(Some(block))
    }
}
