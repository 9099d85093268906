//! ISO/IEC 14496-12 `sidx` (Segment Index) box parsing.

use crate::error::IndexError;
use crate::reader::ByteReader;

/// One reference entry of a `sidx` box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SidxEntry {
    /// True when the reference points at another `sidx` (hierarchical
    /// index). Parsed but rejected by the search engine.
    pub is_reference_type: bool,
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
    pub sap_type: u8,
    pub sap_delta_time: u32,
}

/// Parsed `sidx` box.
#[derive(Clone, Debug, PartialEq)]
pub struct SidxBox {
    pub version: u8,
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    /// Distance from the first byte following the box to the first
    /// referenced byte.
    pub first_offset: u64,
    pub entries: Vec<SidxEntry>,
}

impl SidxBox {
    /// Parse a `sidx` box from `data`, which must start at the box header.
    pub fn parse(data: &[u8]) -> Result<Self, IndexError> {
        let mut r = ByteReader::new(data);
        let size = r.read_u32()? as u64;
        let box_type = r.read_bytes(4)?;
        if box_type != b"sidx" {
            return Err(IndexError::Malformed(format!(
                "expected sidx box, found {:?}",
                String::from_utf8_lossy(box_type)
            )));
        }
        if size == 1 {
            // 64-bit largesize; nobody writes sidx boxes this big but the
            // header layout allows it.
            r.read_u64()?;
        }
        let version = r.read_u8()?;
        r.skip(3)?; // flags
        let reference_id = r.read_u32()?;
        let timescale = r.read_u32()?;
        if timescale == 0 {
            return Err(IndexError::Malformed("sidx timescale is zero".into()));
        }
        let (earliest_presentation_time, first_offset) = if version == 0 {
            (r.read_u32()? as u64, r.read_u32()? as u64)
        } else {
            (r.read_u64()?, r.read_u64()?)
        };
        r.skip(2)?; // reserved
        let reference_count = r.read_u16()? as usize;
        let mut entries = Vec::with_capacity(reference_count);
        for _ in 0..reference_count {
            let chunk = r.read_u32()?;
            let duration = r.read_u32()?;
            let sap = r.read_u32()?;
            entries.push(SidxEntry {
                is_reference_type: chunk & 0x8000_0000 != 0,
                referenced_size: chunk & 0x7FFF_FFFF,
                subsegment_duration: duration,
                starts_with_sap: sap & 0x8000_0000 != 0,
                sap_type: ((sap >> 28) & 0x7) as u8,
                sap_delta_time: sap & 0x0FFF_FFFF,
            });
        }
        Ok(Self {
            version,
            reference_id,
            timescale,
            earliest_presentation_time,
            first_offset,
            entries,
        })
    }

    /// Sum of all referenced segment durations, in timescale units.
    pub fn total_duration(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.subsegment_duration as u64)
            .sum()
    }
}

/// Scan top-level boxes for the first `sidx` and parse it. The fetched
/// `@indexRange` bytes normally start right at the box, but some packagers
/// prepend `styp` or other boxes.
pub fn find_sidx(data: &[u8]) -> Result<SidxBox, IndexError> {
    let mut r = ByteReader::new(data);
    loop {
        if r.remaining() < 8 {
            return Err(IndexError::Malformed("no sidx box in data".into()));
        }
        let start = r.pos();
        let size32 = r.read_u32()?;
        let box_type: [u8; 4] = r.read_bytes(4)?.try_into().expect("len 4");
        let size = match size32 {
            0 => (r.remaining() + 8) as u64, // box extends to end of data
            1 => r.read_u64()?,
            s => s as u64,
        };
        if &box_type == b"sidx" {
            return SidxBox::parse(&data[start..]);
        }
        if size < 8 {
            return Err(IndexError::Malformed(format!(
                "box {:?} with invalid size {size}",
                String::from_utf8_lossy(&box_type)
            )));
        }
        r.seek(start + size as usize);
    }
}

#[cfg(test)]
pub mod testutil {
    /// Assemble a version-0 `sidx` box for tests.
    /// Entries are `(referenced_size, subsegment_duration, sap_type)`.
    pub fn build_sidx(
        timescale: u32,
        earliest_presentation_time: u32,
        first_offset: u32,
        entries: &[(u32, u32, u8)],
    ) -> Vec<u8> {
        let size = 32 + entries.len() * 12;
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&(size as u32).to_be_bytes());
        out.extend_from_slice(b"sidx");
        out.extend_from_slice(&[0, 0, 0, 0]); // version 0, flags
        out.extend_from_slice(&1u32.to_be_bytes()); // reference_ID
        out.extend_from_slice(&timescale.to_be_bytes());
        out.extend_from_slice(&earliest_presentation_time.to_be_bytes());
        out.extend_from_slice(&first_offset.to_be_bytes());
        out.extend_from_slice(&[0, 0]); // reserved
        out.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        for (size, duration, sap_type) in entries {
            out.extend_from_slice(&(size & 0x7FFF_FFFF).to_be_bytes());
            out.extend_from_slice(&duration.to_be_bytes());
            let sap = 0x8000_0000u32 | ((*sap_type as u32) << 28);
            out.extend_from_slice(&sap.to_be_bytes());
        }
        out
    }
}
