//! Minimal access to the fixed-layout packet header (RDH) at the start
//! of each physical packet inside a page.
//!
//! Only the fields the pipeline core needs are exposed: link id, orbit,
//! ids, and the offset to the next packet. Full field decoding belongs to
//! an external decoder. Layout: 64-byte header, version 6, little-endian
//! fields at fixed byte offsets.

use crate::block::UNDEFINED_EQUIPMENT_ID;
use std::fmt;

/// Size of one packet header in bytes.
pub const RDH_SIZE: usize = 64;
/// Header version produced and accepted by this implementation.
pub const RDH_VERSION: u8 = 6;
/// Highest valid link id.
pub const RDH_MAX_LINK_ID: u8 = 31;

// byte offsets of the fields the core reads
const OFS_VERSION: usize = 0;
const OFS_HEADER_SIZE: usize = 1;
const OFS_FEE_ID: usize = 2;
const OFS_SYSTEM_ID: usize = 5;
const OFS_OFFSET_NEXT: usize = 8;
const OFS_MEMORY_SIZE: usize = 10;
const OFS_LINK_ID: usize = 12;
const OFS_PACKET_COUNTER: usize = 13;
const OFS_CRU_ID: usize = 14; // 12 bits cru + 4 bits endpoint
const OFS_ORBIT: usize = 20;
const OFS_STOP_BIT: usize = 38;

/// Errors found when validating a packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RdhError {
    Truncated,
    WrongVersion(u8),
    WrongHeaderSize(u8),
    WrongLinkId(u8),
    WrongOffsetNextPacket(u16),
}

impl fmt::Display for RdhError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RdhError::Truncated => write!(f, "truncated packet header"),
            RdhError::WrongVersion(v) => write!(f, "wrong header version {}", v),
            RdhError::WrongHeaderSize(s) => write!(f, "wrong header size {}", s),
            RdhError::WrongLinkId(id) => write!(f, "wrong link id {} > {}", id, RDH_MAX_LINK_ID),
            RdhError::WrongOffsetNextPacket(o) => write!(f, "wrong offset to next packet {}", o),
        }
    }
}

impl std::error::Error for RdhError {}

/// Read-only view over one packet header inside a page.
#[derive(Clone, Copy)]
pub struct RdhView<'a> {
    bytes: &'a [u8],
}

impl<'a> RdhView<'a> {
    /// Wraps the header at the beginning of `bytes`; fails when fewer
    /// than [`RDH_SIZE`] bytes remain.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, RdhError> {
        if bytes.len() < RDH_SIZE {
            return Err(RdhError::Truncated);
        }
        Ok(Self { bytes })
    }

    fn u16_at(&self, ofs: usize) -> u16 {
        u16::from_le_bytes([self.bytes[ofs], self.bytes[ofs + 1]])
    }

    fn u32_at(&self, ofs: usize) -> u32 {
        u32::from_le_bytes([self.bytes[ofs], self.bytes[ofs + 1], self.bytes[ofs + 2], self.bytes[ofs + 3]])
    }

    pub fn version(&self) -> u8 {
        self.bytes[OFS_VERSION]
    }

    pub fn header_size(&self) -> u8 {
        self.bytes[OFS_HEADER_SIZE]
    }

    pub fn fee_id(&self) -> u16 {
        self.u16_at(OFS_FEE_ID)
    }

    pub fn system_id(&self) -> u8 {
        self.bytes[OFS_SYSTEM_ID]
    }

    /// Offset from this header to the next packet; 0 means last packet.
    pub fn offset_next_packet(&self) -> u16 {
        self.u16_at(OFS_OFFSET_NEXT)
    }

    /// Bytes of this packet (header + payload) present in memory.
    pub fn memory_size(&self) -> u16 {
        self.u16_at(OFS_MEMORY_SIZE)
    }

    pub fn link_id(&self) -> u8 {
        self.bytes[OFS_LINK_ID]
    }

    pub fn packet_counter(&self) -> u8 {
        self.bytes[OFS_PACKET_COUNTER]
    }

    pub fn cru_id(&self) -> u16 {
        self.u16_at(OFS_CRU_ID) & 0x0FFF
    }

    pub fn endpoint(&self) -> u8 {
        (self.u16_at(OFS_CRU_ID) >> 12) as u8
    }

    /// Heartbeat orbit of this packet.
    pub fn orbit(&self) -> u32 {
        self.u32_at(OFS_ORBIT)
    }

    pub fn stop_bit(&self) -> u8 {
        self.bytes[OFS_STOP_BIT]
    }

    /// Equipment id derived from CRU id and endpoint; the all-zero value
    /// (unconfigured card) maps to the undefined sentinel.
    pub fn equipment_id(&self) -> u16 {
        let id = self.cru_id() * 10 + self.endpoint() as u16;
        if id == 0 { UNDEFINED_EQUIPMENT_ID } else { id }
    }

    /// Structural checks: version, header size, link id, next-packet
    /// offset plausibility.
    pub fn validate(&self) -> Result<(), RdhError> {
        if self.version() != RDH_VERSION {
            return Err(RdhError::WrongVersion(self.version()));
        }
        if self.header_size() as usize != RDH_SIZE {
            return Err(RdhError::WrongHeaderSize(self.header_size()));
        }
        if self.link_id() > RDH_MAX_LINK_ID {
            return Err(RdhError::WrongLinkId(self.link_id()));
        }
        let next = self.offset_next_packet();
        if next > 0 && (next as usize) < RDH_SIZE {
            return Err(RdhError::WrongOffsetNextPacket(next));
        }
        Ok(())
    }
}

/// Field values for writing one packet header.
#[derive(Debug, Clone)]
pub struct RdhBuilder {
    pub fee_id: u16,
    pub system_id: u8,
    pub link_id: u8,
    pub cru_id: u16,
    pub endpoint: u8,
    pub orbit: u32,
    pub packet_counter: u8,
    pub offset_next_packet: u16,
    pub memory_size: u16,
    pub stop_bit: u8,
}

impl Default for RdhBuilder {
    fn default() -> Self {
        Self {
            fee_id: 0,
            system_id: 0,
            link_id: 0,
            cru_id: 0,
            endpoint: 0,
            orbit: 0,
            packet_counter: 0,
            offset_next_packet: RDH_SIZE as u16,
            memory_size: RDH_SIZE as u16,
            stop_bit: 0,
        }
    }
}

impl RdhBuilder {
    /// Writes the header into the first [`RDH_SIZE`] bytes of `out`.
    /// Panics if `out` is too small (producer bug).
    pub fn write(&self, out: &mut [u8]) {
        assert!(out.len() >= RDH_SIZE, "page too small for a packet header");
        out[..RDH_SIZE].fill(0);
        out[OFS_VERSION] = RDH_VERSION;
        out[OFS_HEADER_SIZE] = RDH_SIZE as u8;
        out[OFS_FEE_ID..OFS_FEE_ID + 2].copy_from_slice(&self.fee_id.to_le_bytes());
        out[OFS_SYSTEM_ID] = self.system_id;
        out[OFS_OFFSET_NEXT..OFS_OFFSET_NEXT + 2].copy_from_slice(&self.offset_next_packet.to_le_bytes());
        out[OFS_MEMORY_SIZE..OFS_MEMORY_SIZE + 2].copy_from_slice(&self.memory_size.to_le_bytes());
        out[OFS_LINK_ID] = self.link_id;
        out[OFS_PACKET_COUNTER] = self.packet_counter;
        let cru = (self.cru_id & 0x0FFF) | ((self.endpoint as u16) << 12);
        out[OFS_CRU_ID..OFS_CRU_ID + 2].copy_from_slice(&cru.to_le_bytes());
        out[OFS_ORBIT..OFS_ORBIT + 4].copy_from_slice(&self.orbit.to_le_bytes());
        out[OFS_STOP_BIT] = self.stop_bit;
    }
}

/// Iterates packet headers in a page payload, following the next-packet
/// offsets. Stops at the first invalid header or at a zero offset.
pub struct RdhPacketIter<'a> {
    payload: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> RdhPacketIter<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { payload, offset: 0, done: false }
    }
}

impl<'a> Iterator for RdhPacketIter<'a> {
    /// (offset in page, header view)
    type Item = (usize, RdhView<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.payload.len() {
            return None;
        }
        let view = RdhView::parse(&self.payload[self.offset..]).ok()?;
        let at = self.offset;
        let next = view.offset_next_packet();
        if next == 0 {
            self.done = true;
        } else {
            self.offset += next as usize;
        }
        Some((at, view))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_builder() -> RdhBuilder {
        RdhBuilder {
            fee_id: 42,
            system_id: 7,
            link_id: 5,
            cru_id: 12,
            endpoint: 1,
            orbit: 0xABCD_1234,
            packet_counter: 3,
            offset_next_packet: 128,
            memory_size: 128,
            stop_bit: 1,
        }
    }

    #[test]
    fn write_then_read() {
        let mut page = vec![0u8; 256];
        sample_builder().write(&mut page);
        let v = RdhView::parse(&page).unwrap();
        assert_eq!(v.version(), RDH_VERSION);
        assert_eq!(v.header_size() as usize, RDH_SIZE);
        assert_eq!(v.fee_id(), 42);
        assert_eq!(v.system_id(), 7);
        assert_eq!(v.link_id(), 5);
        assert_eq!(v.cru_id(), 12);
        assert_eq!(v.endpoint(), 1);
        assert_eq!(v.orbit(), 0xABCD_1234);
        assert_eq!(v.packet_counter(), 3);
        assert_eq!(v.offset_next_packet(), 128);
        assert_eq!(v.stop_bit(), 1);
        assert_eq!(v.equipment_id(), 121);
        v.validate().unwrap();
    }

    #[test]
    fn zero_cru_maps_to_undefined_equipment() {
        let mut page = vec![0u8; RDH_SIZE];
        RdhBuilder::default().write(&mut page);
        let v = RdhView::parse(&page).unwrap();
        assert_eq!(v.equipment_id(), UNDEFINED_EQUIPMENT_ID);
    }

    #[test]
    fn validation_failures() {
        let mut page = vec![0u8; RDH_SIZE];
        sample_builder().write(&mut page);
        page[0] = 9; // bad version
        assert_eq!(RdhView::parse(&page).unwrap().validate(), Err(RdhError::WrongVersion(9)));

        sample_builder().write(&mut page);
        page[12] = 77; // link id out of range
        assert_eq!(RdhView::parse(&page).unwrap().validate(), Err(RdhError::WrongLinkId(77)));

        let mut b = sample_builder();
        b.offset_next_packet = 10; // inside the header itself
        b.write(&mut page);
        assert!(RdhView::parse(&page).unwrap().validate().is_err());

        assert_eq!(RdhView::parse(&page[..10]).err(), Some(RdhError::Truncated));
    }

    #[test]
    fn packet_iteration() {
        let mut page = vec![0u8; 384];
        let mut b = sample_builder();
        b.offset_next_packet = 128;
        b.orbit = 1;
        b.write(&mut page[0..]);
        b.orbit = 2;
        b.write(&mut page[128..]);
        b.orbit = 3;
        b.offset_next_packet = 0; // last packet
        b.write(&mut page[256..]);

        let orbits: Vec<u32> = RdhPacketIter::new(&page).map(|(_, v)| v.orbit()).collect();
        assert_eq!(orbits, vec![1, 2, 3]);
    }
}
