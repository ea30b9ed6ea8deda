// Copyright 2016-2025 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Serial wire protocol for streaming optical flow vectors from a DVS
//! event-flow pipeline to an embedded receiver.
//!
//! Each accepted flow vector is one fixed-size little-endian frame:
//!
//! ```text
//! x16, y16, t32, u16, v16, 0xFF
//! ```
//!
//! where x,y are the undistorted event coordinates and u,v the flow
//! components, all scaled by 10 and rounded to signed 16-bit, and t is the
//! truncated low 32 bits of the microsecond timestamp. The `0xFF` record
//! separator cannot occur as the high byte of `x16` because coordinates are
//! bounded by the sensor geometry, which receivers rely on to re-synchronize.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Serial line configuration: 921600 baud, 8N1, no flow control.
pub const BAUD_RATE: u32 = 921_600;

/// Size of one flow frame on the wire, terminator included.
pub const FRAME_LEN: usize = 13;

/// Record separator closing every frame.
pub const FRAME_TERMINATOR: u8 = 0xFF;

/// Fixed-point scale applied to coordinates and flow components.
pub const FRAME_SCALE: f32 = 10.0;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("frame too short: got {0} bytes, need {FRAME_LEN}")]
    TooShort(usize),
    #[error("bad frame terminator byte 0x{0:02X}")]
    BadTerminator(u8),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A decoded flow frame.
///
/// Values are in wire units (scaled by [`FRAME_SCALE`]); use the `*_f32`
/// accessors for engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFrame {
    pub x: i16,
    pub y: i16,
    pub t: u32,
    pub u: i16,
    pub v: i16,
}

impl FlowFrame {
    /// Build a frame from engineering units: undistorted pixel coordinates
    /// and flow in pixels per second.
    ///
    /// Flow components are saturated to the signed 16-bit wire range.
    pub fn from_flow(xu: f32, yu: f32, timestamp: i64, u: f32, v: f32) -> Self {
        Self {
            x: (xu * FRAME_SCALE).round() as i16,
            y: (yu * FRAME_SCALE).round() as i16,
            t: timestamp as u32,
            u: clip_i16(u * FRAME_SCALE),
            v: clip_i16(v * FRAME_SCALE),
        }
    }

    #[inline]
    pub fn xu_f32(&self) -> f32 {
        self.x as f32 / FRAME_SCALE
    }

    #[inline]
    pub fn yu_f32(&self) -> f32 {
        self.y as f32 / FRAME_SCALE
    }

    #[inline]
    pub fn u_f32(&self) -> f32 {
        self.u as f32 / FRAME_SCALE
    }

    #[inline]
    pub fn v_f32(&self) -> f32 {
        self.v as f32 / FRAME_SCALE
    }

    /// Serialize into a wire frame.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        LittleEndian::write_i16(&mut buf[0..2], self.x);
        LittleEndian::write_i16(&mut buf[2..4], self.y);
        LittleEndian::write_u32(&mut buf[4..8], self.t);
        LittleEndian::write_i16(&mut buf[8..10], self.u);
        LittleEndian::write_i16(&mut buf[10..12], self.v);
        buf[12] = FRAME_TERMINATOR;
        buf
    }

    /// Deserialize from a wire frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_LEN {
            return Err(Error::TooShort(buf.len()));
        }
        if buf[12] != FRAME_TERMINATOR {
            return Err(Error::BadTerminator(buf[12]));
        }
        Ok(Self {
            x: LittleEndian::read_i16(&buf[0..2]),
            y: LittleEndian::read_i16(&buf[2..4]),
            t: LittleEndian::read_u32(&buf[4..8]),
            u: LittleEndian::read_i16(&buf[8..10]),
            v: LittleEndian::read_i16(&buf[10..12]),
        })
    }
}

#[inline]
fn clip_i16(val: f32) -> i16 {
    val.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
