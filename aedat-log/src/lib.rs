//! Writes and reads AEDAT binary event logs.
//!
//! Two format variants are supported:
//!
//! - **v2**: ASCII header starting with `#!AER-DAT2.0`, then repeating
//!   (address: u32 big-endian, timestamp: i32 microseconds big-endian). The
//!   address packs `p | (x<<1) | (y<<8)` with y inverted relative to the
//!   sensor geometry.
//! - **v3**: ASCII header starting with `#!AER-DAT3.0` and terminated by
//!   `#!END-HEADER`, then repeating (data: u32 little-endian, timestamp:
//!   i32 microseconds little-endian). `data` is the sensor's native polarity
//!   event word (bit 0 valid, bit 1 polarity, y at bits 2..17, x at bits
//!   17..32).

use dvs_flow_types::{Polarity, PolarityEvent, SensorSize};

pub type AedatResult<M> = std::result::Result<M, AedatError>;

#[derive(thiserror::Error, Debug)]
pub enum AedatError {
    #[error("sensor size {0}x{1} does not fit the v2 address layout")]
    SensorTooLargeForV2(u16, u16),
    #[error("unrecognized AEDAT header line {0:?}")]
    UnrecognizedHeader(String),
    #[error("premature file end")]
    PrematureFileEnd,
    #[error("log already closed")]
    AlreadyClosed,
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// AEDAT format variant, selected when a log is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AedatVariant {
    V2,
    V3,
}

/// Bytes one event occupies on disk in either variant.
pub const EVENT_SIZE_BYTES: u64 = 8;

/// Disk headroom left untouched when sizing a new log.
pub const SAFETY_MARGIN_BYTES: u64 = 100 * 1024 * 1024;

mod address;
mod reader;
mod writer;

pub use crate::address::{decode_v2_address, decode_v3_word, encode_v2_address, encode_v3_word};
pub use crate::reader::AedatReader;
pub use crate::writer::AedatWriter;

/// Usable bytes on the filesystem holding `path`, or `None` when the probe
/// is unavailable.
#[cfg(unix)]
pub fn free_disk_bytes(path: &std::path::Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let probe = dir.unwrap_or_else(|| std::path::Path::new("."));
    let cpath = std::ffi::CString::new(probe.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rv = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if rv != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn free_disk_bytes(_path: &std::path::Path) -> Option<u64> {
    None
}

/// Event capacity for a new log on the filesystem holding `path`:
/// `(free - 100 MB) / 8`, or `None` (unbounded) when free space is unknown.
pub fn log_capacity_events(path: &std::path::Path) -> Option<u64> {
    free_disk_bytes(path).map(|free| free.saturating_sub(SAFETY_MARGIN_BYTES) / EVENT_SIZE_BYTES)
}

pub(crate) fn polarity_bit(p: Polarity) -> u32 {
    p.as_u8() as u32
}

pub(crate) fn check_v2_size(size: &SensorSize) -> AedatResult<()> {
    // The v2 address layout leaves 7 bits for x between the polarity bit and
    // the y field.
    if size.width > 128 || size.height > 128 {
        return Err(AedatError::SensorTooLargeForV2(size.width, size.height));
    }
    Ok(())
}
