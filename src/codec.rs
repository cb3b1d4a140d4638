//! Binary layout of orientation logs.
//!
//! ```text
//! header  (8 bytes)   magic "ORLG" | version u16 | reserved u16
//! record  (40 bytes)  offset u32 | heading f32 | pitch f32 | roll f32
//!                     flags u8 | reserved [u8; 3]
//!                     latitude f64 | longitude f64 | crc32 u32
//! ```
//!
//! All fields are little-endian. The CRC covers bytes 0..36 of the record.

use std::io::{self, Read};

use crate::error::{CodecError, SourceError};
use crate::source::OrientationSample;

/// Magic bytes at the start of every log
pub const LOG_MAGIC: [u8; 4] = *b"ORLG";

/// Current format version
pub const LOG_VERSION: u16 = 1;

pub const HEADER_SIZE: usize = 8;

pub const RECORD_SIZE: usize = 40;

const PAYLOAD_SIZE: usize = RECORD_SIZE - 4;

const FLAG_LATITUDE: u8 = 0x01;
const FLAG_LONGITUDE: u8 = 0x02;

pub fn encode_header() -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(&LOG_MAGIC);
    buf[4..6].copy_from_slice(&LOG_VERSION.to_le_bytes());
    buf
}

/// Validate a header, returning its version
pub fn decode_header(bytes: &[u8]) -> Result<u16, CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::TooShort {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    if bytes[0..4] != LOG_MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version == 0 || version > LOG_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    Ok(version)
}

pub fn encode(sample: &OrientationSample) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];

    buf[0..4].copy_from_slice(&sample.offset_millis.to_le_bytes());
    buf[4..8].copy_from_slice(&sample.heading.to_le_bytes());
    buf[8..12].copy_from_slice(&sample.pitch.to_le_bytes());
    buf[12..16].copy_from_slice(&sample.roll.to_le_bytes());

    let mut flags = 0u8;
    if let Some(lat) = sample.latitude {
        flags |= FLAG_LATITUDE;
        buf[20..28].copy_from_slice(&lat.to_le_bytes());
    }
    if let Some(lon) = sample.longitude {
        flags |= FLAG_LONGITUDE;
        buf[28..36].copy_from_slice(&lon.to_le_bytes());
    }
    buf[16] = flags;
    // 17..20 reserved

    let crc = crc32fast::hash(&buf[..PAYLOAD_SIZE]);
    buf[PAYLOAD_SIZE..].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Decode the first record in `bytes`.
pub fn decode(bytes: &[u8]) -> Result<OrientationSample, CodecError> {
    if bytes.len() < RECORD_SIZE {
        return Err(CodecError::TooShort {
            expected: RECORD_SIZE,
            actual: bytes.len(),
        });
    }
    let buf = &bytes[..RECORD_SIZE];

    let expected = u32::from_le_bytes([buf[36], buf[37], buf[38], buf[39]]);
    let actual = crc32fast::hash(&buf[..PAYLOAD_SIZE]);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    let f32_at = |at: usize| f32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let f64_at = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[at..at + 8]);
        f64::from_le_bytes(b)
    };

    let flags = buf[16];
    Ok(OrientationSample {
        offset_millis: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        heading: f32_at(4),
        pitch: f32_at(8),
        roll: f32_at(12),
        latitude: (flags & FLAG_LATITUDE != 0).then(|| f64_at(20)),
        longitude: (flags & FLAG_LONGITUDE != 0).then(|| f64_at(28)),
    })
}

/// Sequential reader over the records of a log.
///
/// Enforces the non-decreasing offset invariant across records.
pub struct SampleReader<R: Read> {
    inner: R,
    last_offset: Option<u32>,
    records_read: u64,
}

impl<R: Read> SampleReader<R> {
    /// Read and validate the header
    pub fn open(mut inner: R) -> Result<Self, SourceError> {
        let mut header = [0u8; HEADER_SIZE];
        let n = fill(&mut inner, &mut header)?;
        decode_header(&header[..n])?;
        Ok(Self {
            inner,
            last_offset: None,
            records_read: 0,
        })
    }

    /// Next record, `Ok(None)` at a clean end of file.
    ///
    /// A trailing partial record, a checksum mismatch and an offset going
    /// backwards are all reported as `CorruptRecord`.
    pub fn next_sample(&mut self) -> Result<Option<OrientationSample>, SourceError> {
        let mut buf = [0u8; RECORD_SIZE];
        let n = fill(&mut self.inner, &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        let sample = decode(&buf[..n])?;
        if let Some(previous) = self.last_offset {
            if sample.offset_millis < previous {
                return Err(CodecError::OutOfOrder {
                    previous,
                    offset: sample.offset_millis,
                }
                .into());
            }
        }
        self.last_offset = Some(sample.offset_millis);
        self.records_read += 1;
        Ok(Some(sample))
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }
}

// Like read_exact, but reports how much was read before EOF.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_bytes(samples: &[OrientationSample]) -> Vec<u8> {
        let mut data = encode_header().to_vec();
        for s in samples {
            data.extend_from_slice(&encode(s));
        }
        data
    }

    #[test]
    fn test_round_trip_with_and_without_location() {
        let samples = [
            OrientationSample::new(0, 0.0, 0.0, 0.0),
            OrientationSample::new(1200, 359.99, -12.5, 4.25).with_location(47.4979, 19.0402),
            OrientationSample {
                latitude: Some(-33.86),
                ..OrientationSample::new(u32::MAX, 180.0, 90.0, -90.0)
            },
        ];
        for s in samples {
            assert_eq!(decode(&encode(&s)), Ok(s));
        }
    }

    #[test]
    fn test_layout_is_little_endian_fixed_width() {
        let bytes = encode(&OrientationSample::new(0x0102_0304, 1.0, 0.0, 0.0).with_location(1.0, 2.0));
        assert_eq!(bytes.len(), RECORD_SIZE);
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &1.0f32.to_le_bytes());
        assert_eq!(bytes[16], FLAG_LATITUDE | FLAG_LONGITUDE);
        assert_eq!(&bytes[17..20], &[0, 0, 0]);
        assert_eq!(&bytes[28..36], &2.0f64.to_le_bytes());
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let bytes = encode(&OrientationSample::new(5, 1.0, 2.0, 3.0));
        assert_eq!(
            decode(&bytes[..RECORD_SIZE - 1]),
            Err(CodecError::TooShort {
                expected: RECORD_SIZE,
                actual: RECORD_SIZE - 1
            })
        );
    }

    #[test]
    fn test_decode_detects_flipped_bit() {
        let mut bytes = encode(&OrientationSample::new(5, 1.0, 2.0, 3.0));
        bytes[6] ^= 0x40;
        assert!(matches!(decode(&bytes), Err(CodecError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_header_validation() {
        assert_eq!(decode_header(&encode_header()), Ok(LOG_VERSION));
        assert_eq!(decode_header(b"NOPE\x01\x00\x00\x00"), Err(CodecError::BadMagic));
        assert_eq!(
            decode_header(b"ORLG\x09\x00\x00\x00"),
            Err(CodecError::UnsupportedVersion(9))
        );
        assert!(matches!(decode_header(b"ORL"), Err(CodecError::TooShort { .. })));
    }

    #[test]
    fn test_reader_yields_records_in_order() {
        let samples = vec![
            OrientationSample::new(0, 10.0, 0.0, 0.0),
            OrientationSample::new(500, 15.0, 0.0, 0.0),
            OrientationSample::new(500, 16.0, 0.0, 0.0),
        ];
        let data = log_bytes(&samples);
        let mut reader = SampleReader::open(&data[..]).unwrap();

        let mut out = Vec::new();
        while let Some(s) = reader.next_sample().unwrap() {
            out.push(s);
        }
        assert_eq!(out, samples);
        assert_eq!(reader.records_read(), 3);
    }

    #[test]
    fn test_reader_flags_ordering_violation() {
        let data = log_bytes(&[
            OrientationSample::new(100, 10.0, 0.0, 0.0),
            OrientationSample::new(50, 15.0, 0.0, 0.0),
        ]);
        let mut reader = SampleReader::open(&data[..]).unwrap();
        assert!(reader.next_sample().unwrap().is_some());
        match reader.next_sample() {
            Err(SourceError::CorruptRecord(CodecError::OutOfOrder { previous, offset })) => {
                assert_eq!((previous, offset), (100, 50));
            }
            other => panic!("expected ordering violation, got {:?}", other),
        }
    }

    #[test]
    fn test_reader_flags_trailing_partial_record() {
        let mut data = log_bytes(&[OrientationSample::new(0, 10.0, 0.0, 0.0)]);
        data.extend_from_slice(&[1, 2, 3]);
        let mut reader = SampleReader::open(&data[..]).unwrap();
        assert!(reader.next_sample().unwrap().is_some());
        assert!(matches!(
            reader.next_sample(),
            Err(SourceError::CorruptRecord(CodecError::TooShort { actual: 3, .. }))
        ));
    }

    #[test]
    fn test_empty_log_has_no_records() {
        let data = encode_header();
        let mut reader = SampleReader::open(&data[..]).unwrap();
        assert!(reader.next_sample().unwrap().is_none());
    }
}
