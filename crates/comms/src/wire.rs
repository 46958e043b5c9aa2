// Copyright 2025-2026 Aurora Radar Group

//! Length-prefixed tagged binary frames.
//!
//! A frame is a little-endian `u32` payload length followed by the payload:
//! a sequence of fields, each `u8` tag, `u16` length, value bytes. Tags are
//! the schema version mechanism: decoders skip fields with tags they do not
//! know, so producers can add fields without breaking older consumers.

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("frame truncated")]
    Truncated,

    #[error("missing required field (tag {0})")]
    MissingField(u8),

    #[error("bad length {len} for tag {tag}")]
    BadLength { tag: u8, len: usize },

    #[error("field is not valid utf-8 (tag {0})")]
    BadUtf8(u8),

    #[error("unknown sequence status {0}")]
    BadStatus(u8),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a sequence, carried in every timing report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SequenceStatus {
    Ok = 0,
    SlotMissing = 1,
    AllocFailure = 2,
    BadLaunchConfig = 3,
    CopyError = 4,
    BadRequest = 5,
}

impl SequenceStatus {
    pub fn from_u8(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(SequenceStatus::Ok),
            1 => Ok(SequenceStatus::SlotMissing),
            2 => Ok(SequenceStatus::AllocFailure),
            3 => Ok(SequenceStatus::BadLaunchConfig),
            4 => Ok(SequenceStatus::CopyError),
            5 => Ok(SequenceStatus::BadRequest),
            other => Err(DecodeError::BadStatus(other)),
        }
    }
}

/// Copy acknowledgement: the raw samples have left the ring buffer and the
/// slot may be reused by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMsg {
    pub sequence_num: u32,
}

/// Timing report sent after decimation; the controller uses `kernel_time_ms`
/// as its back-pressure signal. Failed sequences carry `-1.0` and a
/// non-`Ok` status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingMsg {
    pub sequence_num: u32,
    pub kernel_time_ms: f32,
    pub status: SequenceStatus,
}

/// Start-of-sequence request from radar control.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRequest {
    pub sequence_num: u32,
    /// Receive centre frequencies as offsets from the local oscillator, Hz.
    pub rx_freqs_hz: Vec<f64>,
    /// Per-stage decimation rates.
    pub dm_rates: [u32; 3],
    /// RF sample rate the driver recorded at, Hz.
    pub rx_rate_hz: f64,
    /// Main plus interferometer elements in the sample block.
    pub num_antennas: u32,
    /// Samples recorded per antenna for this sequence.
    pub samples_per_antenna: u32,
    /// Shared-memory slot holding this sequence's samples.
    pub slot_name: String,
}

// Field tags. Shared tag 1 is the sequence number in every message.
const TAG_SEQUENCE_NUM: u8 = 1;
const TAG_KERNEL_TIME_MS: u8 = 2;
const TAG_STATUS: u8 = 3;
const TAG_RX_FREQS: u8 = 4;
const TAG_DM_RATES: u8 = 5;
const TAG_RX_RATE: u8 = 6;
const TAG_NUM_ANTENNAS: u8 = 7;
const TAG_SLOT_NAME: u8 = 8;
const TAG_SAMPLES_PER_ANTENNA: u8 = 9;

fn put_field(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
    debug_assert!(value.len() <= u16::MAX as usize);
    buf.push(tag);
    let mut len = [0u8; 2];
    LittleEndian::write_u16(&mut len, value.len() as u16);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(value);
}

fn put_u32(buf: &mut Vec<u8>, tag: u8, value: u32) {
    let mut v = [0u8; 4];
    LittleEndian::write_u32(&mut v, value);
    put_field(buf, tag, &v);
}

fn put_f32(buf: &mut Vec<u8>, tag: u8, value: f32) {
    let mut v = [0u8; 4];
    LittleEndian::write_f32(&mut v, value);
    put_field(buf, tag, &v);
}

fn put_f64(buf: &mut Vec<u8>, tag: u8, value: f64) {
    let mut v = [0u8; 8];
    LittleEndian::write_f64(&mut v, value);
    put_field(buf, tag, &v);
}

/// Iterate the TLV fields of a payload.
struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<(u8, &'a [u8]), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < 3 {
            self.rest = &[];
            return Some(Err(DecodeError::Truncated));
        }
        let tag = self.rest[0];
        let len = LittleEndian::read_u16(&self.rest[1..3]) as usize;
        if self.rest.len() < 3 + len {
            self.rest = &[];
            return Some(Err(DecodeError::Truncated));
        }
        let value = &self.rest[3..3 + len];
        self.rest = &self.rest[3 + len..];
        Some(Ok((tag, value)))
    }
}

fn fields(payload: &[u8]) -> Fields<'_> {
    Fields { rest: payload }
}

fn field_u32(tag: u8, value: &[u8]) -> Result<u32, DecodeError> {
    if value.len() != 4 {
        return Err(DecodeError::BadLength {
            tag,
            len: value.len(),
        });
    }
    Ok(LittleEndian::read_u32(value))
}

fn field_f32(tag: u8, value: &[u8]) -> Result<f32, DecodeError> {
    if value.len() != 4 {
        return Err(DecodeError::BadLength {
            tag,
            len: value.len(),
        });
    }
    Ok(LittleEndian::read_f32(value))
}

fn field_f64(tag: u8, value: &[u8]) -> Result<f64, DecodeError> {
    if value.len() != 8 {
        return Err(DecodeError::BadLength {
            tag,
            len: value.len(),
        });
    }
    Ok(LittleEndian::read_f64(value))
}

impl AckMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        put_u32(&mut buf, TAG_SEQUENCE_NUM, self.sequence_num);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut sequence_num = None;
        for field in fields(payload) {
            let (tag, value) = field?;
            match tag {
                TAG_SEQUENCE_NUM => sequence_num = Some(field_u32(tag, value)?),
                _ => {} // forward compatibility
            }
        }
        Ok(AckMsg {
            sequence_num: sequence_num.ok_or(DecodeError::MissingField(TAG_SEQUENCE_NUM))?,
        })
    }
}

impl TimingMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        put_u32(&mut buf, TAG_SEQUENCE_NUM, self.sequence_num);
        put_f32(&mut buf, TAG_KERNEL_TIME_MS, self.kernel_time_ms);
        put_field(&mut buf, TAG_STATUS, &[self.status as u8]);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut sequence_num = None;
        let mut kernel_time_ms = None;
        let mut status = None;
        for field in fields(payload) {
            let (tag, value) = field?;
            match tag {
                TAG_SEQUENCE_NUM => sequence_num = Some(field_u32(tag, value)?),
                TAG_KERNEL_TIME_MS => kernel_time_ms = Some(field_f32(tag, value)?),
                TAG_STATUS => {
                    if value.len() != 1 {
                        return Err(DecodeError::BadLength {
                            tag,
                            len: value.len(),
                        });
                    }
                    status = Some(SequenceStatus::from_u8(value[0])?);
                }
                _ => {}
            }
        }
        Ok(TimingMsg {
            sequence_num: sequence_num.ok_or(DecodeError::MissingField(TAG_SEQUENCE_NUM))?,
            kernel_time_ms: kernel_time_ms
                .ok_or(DecodeError::MissingField(TAG_KERNEL_TIME_MS))?,
            status: status.ok_or(DecodeError::MissingField(TAG_STATUS))?,
        })
    }
}

impl SequenceRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.slot_name.len());
        put_u32(&mut buf, TAG_SEQUENCE_NUM, self.sequence_num);

        let mut freqs = Vec::with_capacity(self.rx_freqs_hz.len() * 8);
        for &f in &self.rx_freqs_hz {
            let mut v = [0u8; 8];
            LittleEndian::write_f64(&mut v, f);
            freqs.extend_from_slice(&v);
        }
        put_field(&mut buf, TAG_RX_FREQS, &freqs);

        let mut rates = [0u8; 12];
        for (i, &r) in self.dm_rates.iter().enumerate() {
            LittleEndian::write_u32(&mut rates[i * 4..i * 4 + 4], r);
        }
        put_field(&mut buf, TAG_DM_RATES, &rates);

        put_f64(&mut buf, TAG_RX_RATE, self.rx_rate_hz);
        put_u32(&mut buf, TAG_NUM_ANTENNAS, self.num_antennas);
        put_u32(&mut buf, TAG_SAMPLES_PER_ANTENNA, self.samples_per_antenna);
        put_field(&mut buf, TAG_SLOT_NAME, self.slot_name.as_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut sequence_num = None;
        let mut rx_freqs_hz = None;
        let mut dm_rates = None;
        let mut rx_rate_hz = None;
        let mut num_antennas = None;
        let mut samples_per_antenna = None;
        let mut slot_name = None;

        for field in fields(payload) {
            let (tag, value) = field?;
            match tag {
                TAG_SEQUENCE_NUM => sequence_num = Some(field_u32(tag, value)?),
                TAG_RX_FREQS => {
                    if value.len() % 8 != 0 {
                        return Err(DecodeError::BadLength {
                            tag,
                            len: value.len(),
                        });
                    }
                    let freqs: Vec<f64> = value
                        .chunks_exact(8)
                        .map(LittleEndian::read_f64)
                        .collect();
                    rx_freqs_hz = Some(freqs);
                }
                TAG_DM_RATES => {
                    if value.len() != 12 {
                        return Err(DecodeError::BadLength {
                            tag,
                            len: value.len(),
                        });
                    }
                    let mut rates = [0u32; 3];
                    for (i, chunk) in value.chunks_exact(4).enumerate() {
                        rates[i] = LittleEndian::read_u32(chunk);
                    }
                    dm_rates = Some(rates);
                }
                TAG_RX_RATE => rx_rate_hz = Some(field_f64(tag, value)?),
                TAG_NUM_ANTENNAS => num_antennas = Some(field_u32(tag, value)?),
                TAG_SAMPLES_PER_ANTENNA => {
                    samples_per_antenna = Some(field_u32(tag, value)?)
                }
                TAG_SLOT_NAME => {
                    let name = std::str::from_utf8(value)
                        .map_err(|_| DecodeError::BadUtf8(tag))?;
                    slot_name = Some(name.to_string());
                }
                _ => {}
            }
        }

        Ok(SequenceRequest {
            sequence_num: sequence_num.ok_or(DecodeError::MissingField(TAG_SEQUENCE_NUM))?,
            rx_freqs_hz: rx_freqs_hz.ok_or(DecodeError::MissingField(TAG_RX_FREQS))?,
            dm_rates: dm_rates.ok_or(DecodeError::MissingField(TAG_DM_RATES))?,
            rx_rate_hz: rx_rate_hz.ok_or(DecodeError::MissingField(TAG_RX_RATE))?,
            num_antennas: num_antennas.ok_or(DecodeError::MissingField(TAG_NUM_ANTENNAS))?,
            samples_per_antenna: samples_per_antenna
                .ok_or(DecodeError::MissingField(TAG_SAMPLES_PER_ANTENNA))?,
            slot_name: slot_name.ok_or(DecodeError::MissingField(TAG_SLOT_NAME))?,
        })
    }
}

/// Wrap a payload in a length-prefixed frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, payload.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(payload);
    out
}

/// Strip the length prefix of a frame, checking it against the buffer.
pub fn unframe(buf: &[u8]) -> Result<&[u8], DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Truncated);
    }
    let len = LittleEndian::read_u32(&buf[..4]) as usize;
    if buf.len() < 4 + len {
        return Err(DecodeError::Truncated);
    }
    Ok(&buf[4..4 + len])
}

/// Write a frame to a byte stream.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(payload.len() as u32)?;
    w.write_all(payload)
}

/// Read one frame from a byte stream.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, DecodeError> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(payload)
}
