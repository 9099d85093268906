//! Minimal Matroska/WebM index: enough EBML to reach the Info, Tracks and
//! Cues elements of a segment and answer cue-point searches.

use tracing::trace;

use crate::error::IndexError;
use crate::reader::ByteReader;

const ID_EBML: u64 = 0x1A45_DFA3;
const ID_SEGMENT: u64 = 0x1853_8067;
const ID_SEEK_HEAD: u64 = 0x114D_9B74;
const ID_INFO: u64 = 0x1549_A966;
const ID_TIMESTAMP_SCALE: u64 = 0x2A_D7B1;
const ID_DURATION: u64 = 0x4489;
const ID_TRACKS: u64 = 0x1654_AE6B;
const ID_TRACK_ENTRY: u64 = 0xAE;
const ID_CUES: u64 = 0x1C53_BB6B;
const ID_CUE_POINT: u64 = 0xBB;
const ID_CUE_TIME: u64 = 0xB3;
const ID_CUE_TRACK_POSITIONS: u64 = 0xB7;
const ID_CUE_CLUSTER_POSITION: u64 = 0xF1;
const ID_CLUSTER: u64 = 0x1F43_B675;

/// 100ns ticks per second, the timescale cue lookups are reported in.
const HNS_PER_SECOND: u64 = 10_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CuePoint {
    /// Cue time in segment ticks (timestamp-scale units).
    pub time: u64,
    /// Absolute file offset of the referenced cluster.
    pub cluster_offset: u64,
}

/// Parsed index portion of a Matroska/WebM file.
#[derive(Clone, Debug, PartialEq)]
pub struct MatroskaIndex {
    /// Nanoseconds per tick (TimestampScale, default 1_000_000).
    pub timestamp_scale: u64,
    /// Segment duration in ticks, when the Info element declares one.
    pub duration_ticks: Option<f64>,
    pub num_tracks: usize,
    /// Absolute file offset where the Segment payload starts; cue cluster
    /// positions are relative to it.
    pub segment_payload_offset: u64,
    pub cues: Vec<CuePoint>,
    /// Total file size, when known (from the Segment element size).
    pub total_size: Option<u64>,
}

/// Cue search mode; maps from the player's segment search types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CueSearchMode {
    Before,
    After,
    Closest,
}

/// One resolved cue lookup: a cluster to fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CueLookup {
    pub index: usize,
    /// Cluster start in HNS.
    pub time_hns: i64,
    /// Cluster duration in HNS (to the next cue, or the segment end).
    pub duration_hns: i64,
    pub cluster_offset: u64,
    /// Byte size of the cluster, when the following cue or the file size
    /// bounds it.
    pub cluster_size: Option<u64>,
    pub is_last: bool,
}

fn read_vint(r: &mut ByteReader<'_>, keep_marker: bool) -> Result<u64, IndexError> {
    let first = r.read_u8()?;
    if first == 0 {
        return Err(IndexError::Malformed("invalid EBML vint".into()));
    }
    let extra = first.leading_zeros() as usize;
    let mut value = if keep_marker {
        first as u64
    } else {
        (first & (0x7F >> extra)) as u64
    };
    for _ in 0..extra {
        value = (value << 8) | r.read_u8()? as u64;
    }
    Ok(value)
}

/// EBML element size; `None` for the "unknown size" marker (all value bits
/// set), used by live-muxed Segments.
fn read_size(r: &mut ByteReader<'_>) -> Result<Option<u64>, IndexError> {
    let first = r.read_u8()?;
    if first == 0 {
        return Err(IndexError::Malformed("invalid EBML size".into()));
    }
    let extra = first.leading_zeros() as usize;
    let mut value = (first & (0x7F >> extra)) as u64;
    let mut all_ones = value == (0x7F >> extra) as u64;
    for _ in 0..extra {
        let b = r.read_u8()?;
        all_ones = all_ones && b == 0xFF;
        value = (value << 8) | b as u64;
    }
    Ok(if all_ones { None } else { Some(value) })
}

impl MatroskaIndex {
    /// Parse the head of a Matroska/WebM file: EBML header, Segment, and the
    /// Info/Tracks/Cues elements. Stops at the first Cluster. `data` must
    /// start at file offset zero and extend past the Cues element (the DASH
    /// `@indexRange` guarantees this).
    pub fn parse(data: &[u8]) -> Result<Self, IndexError> {
        let mut r = ByteReader::new(data);

        // EBML header.
        let id = read_vint(&mut r, true)?;
        if id != ID_EBML {
            return Err(IndexError::Malformed("not an EBML document".into()));
        }
        let header_size = read_size(&mut r)?
            .ok_or_else(|| IndexError::Malformed("EBML header with unknown size".into()))?;
        r.skip(header_size as usize)?;

        // Segment element.
        let id = read_vint(&mut r, true)?;
        if id != ID_SEGMENT {
            return Err(IndexError::Malformed("no Segment element".into()));
        }
        let segment_size = read_size(&mut r)?;
        let segment_payload_offset = r.pos() as u64;

        let mut index = MatroskaIndex {
            timestamp_scale: 1_000_000,
            duration_ticks: None,
            num_tracks: 0,
            segment_payload_offset,
            cues: Vec::new(),
            total_size: segment_size.map(|s| segment_payload_offset + s),
        };

        // Level-1 walk until the first Cluster (or end of available data).
        while r.remaining() > 1 {
            let id = match read_vint(&mut r, true) {
                Ok(id) => id,
                Err(_) => break,
            };
            let size = match read_size(&mut r) {
                Ok(Some(s)) => s as usize,
                // Unknown-size level-1 element: cannot skip, stop here.
                Ok(None) | Err(_) => break,
            };
            if id == ID_CLUSTER {
                break;
            }
            if r.remaining() < size {
                // The index range ends inside this element; only fine if we
                // already have the cues.
                trace!(id, size, "kinema-index: matroska element truncated");
                break;
            }
            let payload_start = r.pos();
            match id {
                ID_INFO => index.parse_info(&data[payload_start..payload_start + size])?,
                ID_TRACKS => index.parse_tracks(&data[payload_start..payload_start + size])?,
                ID_CUES => index.parse_cues(&data[payload_start..payload_start + size])?,
                ID_SEEK_HEAD => {}
                _ => {}
            }
            r.seek(payload_start + size);
        }

        if index.cues.is_empty() {
            return Err(IndexError::Malformed("no Cues element found".into()));
        }
        index.cues.sort_by_key(|c| c.time);
        Ok(index)
    }

    fn parse_info(&mut self, data: &[u8]) -> Result<(), IndexError> {
        let mut r = ByteReader::new(data);
        while r.remaining() > 1 {
            let id = read_vint(&mut r, true)?;
            let size = read_size(&mut r)?.unwrap_or(0) as usize;
            match id {
                ID_TIMESTAMP_SCALE => {
                    self.timestamp_scale = {
                        let mut rr = ByteReader::new(r.read_bytes(size)?);
                        rr.read_uint(size)?
                    };
                }
                ID_DURATION => {
                    let mut rr = ByteReader::new(r.read_bytes(size)?);
                    self.duration_ticks = Some(rr.read_float(size)?);
                }
                _ => r.skip(size)?,
            }
        }
        Ok(())
    }

    fn parse_tracks(&mut self, data: &[u8]) -> Result<(), IndexError> {
        let mut r = ByteReader::new(data);
        while r.remaining() > 1 {
            let id = read_vint(&mut r, true)?;
            let size = read_size(&mut r)?.unwrap_or(0) as usize;
            if id == ID_TRACK_ENTRY {
                self.num_tracks += 1;
            }
            r.skip(size)?;
        }
        Ok(())
    }

    fn parse_cues(&mut self, data: &[u8]) -> Result<(), IndexError> {
        let mut r = ByteReader::new(data);
        while r.remaining() > 1 {
            let id = read_vint(&mut r, true)?;
            let size = read_size(&mut r)?.unwrap_or(0) as usize;
            if id != ID_CUE_POINT {
                r.skip(size)?;
                continue;
            }
            let payload = r.read_bytes(size)?;
            let mut cp = ByteReader::new(payload);
            let mut time = None;
            let mut cluster_pos = None;
            while cp.remaining() > 1 {
                let cid = read_vint(&mut cp, true)?;
                let csize = read_size(&mut cp)?.unwrap_or(0) as usize;
                match cid {
                    ID_CUE_TIME => {
                        let mut rr = ByteReader::new(cp.read_bytes(csize)?);
                        time = Some(rr.read_uint(csize)?);
                    }
                    ID_CUE_TRACK_POSITIONS => {
                        let tp = cp.read_bytes(csize)?;
                        let mut tr = ByteReader::new(tp);
                        while tr.remaining() > 1 {
                            let tid = read_vint(&mut tr, true)?;
                            let tsize = read_size(&mut tr)?.unwrap_or(0) as usize;
                            if tid == ID_CUE_CLUSTER_POSITION {
                                let mut rr = ByteReader::new(tr.read_bytes(tsize)?);
                                cluster_pos = Some(rr.read_uint(tsize)?);
                            } else {
                                tr.skip(tsize)?;
                            }
                        }
                    }
                    _ => cp.skip(csize)?,
                }
            }
            if let (Some(time), Some(pos)) = (time, cluster_pos) {
                self.cues.push(CuePoint {
                    time,
                    cluster_offset: self.segment_payload_offset + pos,
                });
            }
        }
        Ok(())
    }

    fn ticks_to_hns(&self, ticks: u64) -> i64 {
        (ticks as i128 * self.timestamp_scale as i128 / 100) as i64
    }

    /// Duration of the whole segment in HNS, when declared.
    pub fn duration_hns(&self) -> Option<i64> {
        self.duration_ticks.map(|d| {
            (d * self.timestamp_scale as f64 / 100.0) as i64
        })
    }

    fn lookup(&self, index: usize) -> CueLookup {
        let cue = self.cues[index];
        let is_last = index + 1 == self.cues.len();
        let end_hns = if is_last {
            self.duration_hns()
                .unwrap_or_else(|| self.ticks_to_hns(cue.time))
        } else {
            self.ticks_to_hns(self.cues[index + 1].time)
        };
        let start_hns = self.ticks_to_hns(cue.time);
        let cluster_size = if is_last {
            self.total_size
                .and_then(|total| total.checked_sub(cue.cluster_offset))
        } else {
            self.cues[index + 1]
                .cluster_offset
                .checked_sub(cue.cluster_offset)
        };
        CueLookup {
            index,
            time_hns: start_hns,
            duration_hns: (end_hns - start_hns).max(0),
            cluster_offset: cue.cluster_offset,
            cluster_size,
            is_last,
        }
    }

    /// Find the cue for `time_hns` under the given search mode. `Before`
    /// yields the cluster containing the time, `After` the first cluster at
    /// or past it, `Closest` whichever boundary is nearer. Returns `None`
    /// when `After` runs off the end.
    pub fn find_cue(&self, time_hns: i64, mode: CueSearchMode) -> Option<CueLookup> {
        if self.cues.is_empty() {
            return None;
        }
        // Index of the first cue with start >= time.
        let at_or_after = self
            .cues
            .iter()
            .position(|c| self.ticks_to_hns(c.time) >= time_hns);
        match mode {
            CueSearchMode::Before => {
                let idx = match at_or_after {
                    Some(0) => 0,
                    Some(i) if self.ticks_to_hns(self.cues[i].time) == time_hns => i,
                    Some(i) => i - 1,
                    None => self.cues.len() - 1,
                };
                Some(self.lookup(idx))
            }
            CueSearchMode::After => at_or_after.map(|i| self.lookup(i)),
            CueSearchMode::Closest => {
                let idx = match at_or_after {
                    Some(0) | None => at_or_after.unwrap_or(self.cues.len() - 1),
                    Some(i) => {
                        let before = self.ticks_to_hns(self.cues[i - 1].time);
                        let after = self.ticks_to_hns(self.cues[i].time);
                        if time_hns - before < after - time_hns {
                            i - 1
                        } else {
                            i
                        }
                    }
                };
                Some(self.lookup(idx))
            }
        }
    }
}

/// Convert HNS back into cue ticks for a given timestamp scale; used by
/// tests and sanity checks.
pub fn hns_to_ticks(hns: i64, timestamp_scale: u64) -> u64 {
    (hns as i128 * 100 / timestamp_scale as i128).max(0) as u64
}

/// HNS ticks per second as exposed by cue lookups.
pub const fn hns_timescale() -> u32 {
    HNS_PER_SECOND as u32
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    fn encode_size(size: u64) -> Vec<u8> {
        // Two-byte size is plenty for test fixtures.
        assert!(size < 0x3FFF);
        vec![0x40 | (size >> 8) as u8, (size & 0xFF) as u8]
    }

    fn element(id: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut out = id.to_vec();
        out.extend_from_slice(&encode_size(payload.len() as u64));
        out.extend_from_slice(payload);
        out
    }

    fn uint_element(id: &[u8], value: u64) -> Vec<u8> {
        let mut payload = Vec::new();
        let mut v = value;
        if v == 0 {
            payload.push(0);
        }
        while v > 0 {
            payload.insert(0, (v & 0xFF) as u8);
            v >>= 8;
        }
        element(id, &payload)
    }

    /// Build a synthetic WebM head with the given cue points
    /// `(time_ticks, cluster_offset_in_segment)` and a Duration in ticks.
    pub fn build_webm_index(
        timestamp_scale: u64,
        duration_ticks: f64,
        num_tracks: usize,
        cues: &[(u64, u64)],
    ) -> Vec<u8> {
        let mut info = uint_element(&[0x2A, 0xD7, 0xB1], timestamp_scale);
        info.extend_from_slice(&element(
            &[0x44, 0x89],
            &(duration_ticks as f32).to_be_bytes(),
        ));

        let mut tracks = Vec::new();
        for _ in 0..num_tracks {
            tracks.extend_from_slice(&element(&[0xAE], &[0x00]));
        }

        let mut cues_payload = Vec::new();
        for (time, offset) in cues {
            let mut positions = uint_element(&[0xF7], 1);
            positions.extend_from_slice(&uint_element(&[0xF1], *offset));
            let mut point = uint_element(&[0xB3], *time);
            point.extend_from_slice(&element(&[0xB7], &positions));
            cues_payload.extend_from_slice(&element(&[0xBB], &point));
        }

        let mut segment_payload = element(&[0x15, 0x49, 0xA9, 0x66], &info);
        segment_payload.extend_from_slice(&element(&[0x16, 0x54, 0xAE, 0x6B], &tracks));
        segment_payload.extend_from_slice(&element(&[0x1C, 0x53, 0xBB, 0x6B], &cues_payload));

        let mut out = element(&[0x1A, 0x45, 0xDF, 0xA3], &[]);
        out.extend_from_slice(&element(&[0x18, 0x53, 0x80, 0x67], &segment_payload));
        out
    }
}
