//! Header and tail frames around each output unit.
//!
//! ```text
//! header  w0  0x9 << 28 | version << 16 | file index
//!         w1  run number
//!         w2  board id
//!         w3  board serial number
//!         w4  open time (unix seconds)
//! payload encoded events, no length prefix
//! tail    w0  0xA << 28
//!         w1  event count
//!         w2  byte count, low word
//!         w3  byte count, high word
//!         w4  close time (unix seconds)
//! ```
//!
//! All words are little-endian `u32`. The tail byte count covers the header and
//! every payload, but not the tail itself.

use thiserror::Error;
use time::OffsetDateTime;

pub const FORMAT_VERSION: u32 = 3;
pub const HEADER_LEN: usize = 20;
pub const TAIL_LEN: usize = 20;

const HEADER_TAG: u32 = 0x9;
const TAIL_TAG: u32 = 0xA;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("output unit is {0} bytes, too short for header and tail")]
    Truncated(usize),
    #[error("bad {frame} tag 0x{tag:x}")]
    BadTag { frame: &'static str, tag: u32 },
    #[error("unsupported format version {0}")]
    Version(u32),
    #[error("tail claims {claimed} bytes but {actual} precede it")]
    SizeMismatch { claimed: u64, actual: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub file_index: u16,
    pub run_number: i32,
    pub board_id: u32,
    pub board_sn: u32,
    pub open_time: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileTail {
    pub n_events: u32,
    pub total_size: u64,
    pub close_time: u32,
}

/// A finished output unit split back into its parts.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedOutput<'a> {
    pub header: FileHeader,
    pub payload: &'a [u8],
    pub tail: FileTail,
}

/// Frame times are stored as 32 bit unix seconds.
pub fn unix_seconds(t: OffsetDateTime) -> u32 {
    t.unix_timestamp().clamp(0, i64::from(u32::MAX)) as u32
}

impl FileHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let w0 = HEADER_TAG << 28 | (FORMAT_VERSION & 0xFFF) << 16 | u32::from(self.file_index);
        words([
            w0,
            self.run_number as u32,
            self.board_id,
            self.board_sn,
            self.open_time,
        ])
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let w = read_words(bytes).ok_or(FrameError::Truncated(bytes.len()))?;
        if w[0] >> 28 != HEADER_TAG {
            return Err(FrameError::BadTag {
                frame: "header",
                tag: w[0] >> 28,
            });
        }
        let version = (w[0] >> 16) & 0xFFF;
        if version != FORMAT_VERSION {
            return Err(FrameError::Version(version));
        }
        Ok(Self {
            file_index: (w[0] & 0xFFFF) as u16,
            run_number: w[1] as i32,
            board_id: w[2],
            board_sn: w[3],
            open_time: w[4],
        })
    }
}

impl FileTail {
    pub fn encode(&self) -> [u8; TAIL_LEN] {
        words([
            TAIL_TAG << 28,
            self.n_events,
            self.total_size as u32,
            (self.total_size >> 32) as u32,
            self.close_time,
        ])
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let w = read_words(bytes).ok_or(FrameError::Truncated(bytes.len()))?;
        if w[0] >> 28 != TAIL_TAG {
            return Err(FrameError::BadTag {
                frame: "tail",
                tag: w[0] >> 28,
            });
        }
        Ok(Self {
            n_events: w[1],
            total_size: u64::from(w[2]) | u64::from(w[3]) << 32,
            close_time: w[4],
        })
    }
}

/// Split a complete output unit into header, payload bytes and tail.
pub fn parse_output(bytes: &[u8]) -> Result<ParsedOutput<'_>, FrameError> {
    if bytes.len() < HEADER_LEN + TAIL_LEN {
        return Err(FrameError::Truncated(bytes.len()));
    }
    let body_end = bytes.len() - TAIL_LEN;
    let header = FileHeader::decode(&bytes[..HEADER_LEN])?;
    let tail = FileTail::decode(&bytes[body_end..])?;
    if tail.total_size != body_end as u64 {
        return Err(FrameError::SizeMismatch {
            claimed: tail.total_size,
            actual: body_end as u64,
        });
    }
    Ok(ParsedOutput {
        header,
        payload: &bytes[HEADER_LEN..body_end],
        tail,
    })
}

fn words(w: [u32; 5]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for (chunk, word) in out.chunks_exact_mut(4).zip(w) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

fn read_words(bytes: &[u8]) -> Option<[u32; 5]> {
    if bytes.len() < 20 {
        return None;
    }
    let mut w = [0u32; 5];
    for (word, chunk) in w.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Some(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn header_payload_tail_round_trip() {
        let header = FileHeader {
            file_index: 7,
            run_number: -12,
            board_id: 3,
            board_sn: 20117,
            open_time: unix_seconds(datetime!(2026-10-16 08:00:00 UTC)),
        };
        let payloads: [&[u8]; 3] = [&[1, 2, 3, 4], &[5; 12], &[9; 8]];

        let mut bytes = header.encode().to_vec();
        for p in payloads {
            bytes.extend_from_slice(p);
        }
        let tail = FileTail {
            n_events: payloads.len() as u32,
            total_size: bytes.len() as u64,
            close_time: header.open_time + 900,
        };
        bytes.extend_from_slice(&tail.encode());

        let parsed = parse_output(&bytes).unwrap();
        assert_eq!(parsed.header, header);
        assert_eq!(parsed.tail, tail);
        assert_eq!(parsed.tail.n_events, 3);
        assert_eq!(parsed.payload.len(), 24);
    }

    #[test]
    fn large_byte_counts_use_both_words() {
        let tail = FileTail {
            n_events: 1,
            total_size: 5 * 1024 * 1024 * 1024 + 17,
            close_time: 0,
        };
        assert_eq!(FileTail::decode(&tail.encode()).unwrap(), tail);
    }

    #[test]
    fn rejects_damaged_units() {
        assert_eq!(parse_output(&[0; 10]), Err(FrameError::Truncated(10)));

        let header = FileHeader {
            file_index: 0,
            run_number: 1,
            board_id: 0,
            board_sn: 0,
            open_time: 0,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0; 4]);
        let tail = FileTail {
            n_events: 1,
            total_size: 99,
            close_time: 0,
        };
        bytes.extend_from_slice(&tail.encode());
        assert_eq!(
            parse_output(&bytes),
            Err(FrameError::SizeMismatch {
                claimed: 99,
                actual: 24
            })
        );

        let mut swapped = tail.encode().to_vec();
        swapped.extend_from_slice(&header.encode());
        assert!(matches!(
            parse_output(&swapped),
            Err(FrameError::BadTag { frame: "header", .. })
        ));
    }
}
