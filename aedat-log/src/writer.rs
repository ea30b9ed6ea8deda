use std::io::{BufWriter, Write};

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use tracing::{info, warn};

use dvs_flow_types::{PolarityEvent, SensorSize};

use crate::{
    check_v2_size, encode_v2_address, encode_v3_word, log_capacity_events, AedatResult,
    AedatVariant,
};

/// Append-only AEDAT log writer.
///
/// Every event is written immediately on receipt. When the event capacity is
/// reached the underlying file is closed cleanly, one notice is emitted, and
/// subsequent writes are discarded.
pub struct AedatWriter<W: Write> {
    w: Option<W>,
    variant: AedatVariant,
    size: SensorSize,
    capacity: Option<u64>,
    n_written: u64,
}

impl AedatWriter<BufWriter<std::fs::File>> {
    /// Create a log file, sizing its event capacity from the free space on
    /// the target filesystem minus a safety margin.
    pub fn create<P: AsRef<std::path::Path>>(
        path: P,
        variant: AedatVariant,
        size: SensorSize,
    ) -> AedatResult<Self> {
        let path = path.as_ref();
        let capacity = log_capacity_events(path);
        let fd = std::fs::File::create(path)?;
        let wtr = Self::new(BufWriter::new(fd), variant, size, capacity)?;
        info!(
            "raw event log {} opened ({:?}, capacity {} events)",
            path.display(),
            variant,
            wtr.capacity
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unbounded".to_string()),
        );
        Ok(wtr)
    }
}

impl<W: Write> AedatWriter<W> {
    /// Open a writer on `w`, writing the variant's header. `capacity` of
    /// `None` means unbounded.
    pub fn new(
        mut w: W,
        variant: AedatVariant,
        size: SensorSize,
        capacity: Option<u64>,
    ) -> AedatResult<Self> {
        if variant == AedatVariant::V2 {
            check_v2_size(&size)?;
        }
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        match variant {
            AedatVariant::V2 => {
                w.write_all(b"#!AER-DAT2.0\n")?;
                w.write_all(b"# This is a raw AE data file - do not edit\n")?;
                w.write_all(
                    b"# Data format is int32 address, int32 timestamp (8 bytes total), repeated for each event\n",
                )?;
                w.write_all(b"# Timestamps tick is 1 us\n")?;
                writeln!(w, "# created {}", now)?;
            }
            AedatVariant::V3 => {
                w.write_all(b"#!AER-DAT3.0\n")?;
                w.write_all(b"#Format: RAW\r\n")?;
                write!(w, "#Source 0: DVS {}x{}\r\n", size.width, size.height)?;
                write!(w, "#Start-Time: {}\r\n", now)?;
                w.write_all(b"#!END-HEADER\n")?;
            }
        }
        Ok(Self {
            w: Some(w),
            variant,
            size,
            capacity,
            n_written: 0,
        })
    }

    /// Append one event. Discarded silently once the log is closed.
    pub fn write_event(&mut self, e: &PolarityEvent) -> AedatResult<()> {
        let Some(w) = self.w.as_mut() else {
            return Ok(());
        };
        match self.variant {
            AedatVariant::V2 => {
                w.write_u32::<BigEndian>(encode_v2_address(e, &self.size))?;
                w.write_i32::<BigEndian>(e.timestamp as i32)?;
            }
            AedatVariant::V3 => {
                w.write_u32::<LittleEndian>(encode_v3_word(e))?;
                w.write_i32::<LittleEndian>(e.timestamp as i32)?;
            }
        }
        self.n_written += 1;
        if let Some(cap) = self.capacity {
            if self.n_written >= cap {
                self.close()?;
                warn!(
                    "raw event log capacity of {} events reached, log closed; \
                     further events are discarded",
                    cap
                );
            }
        }
        Ok(())
    }

    /// Flush and release the underlying writer. Idempotent.
    pub fn close(&mut self) -> AedatResult<()> {
        if let Some(mut w) = self.w.take() {
            w.flush()?;
        }
        Ok(())
    }

    pub fn n_written(&self) -> u64 {
        self.n_written
    }

    pub fn is_closed(&self) -> bool {
        self.w.is_none()
    }
}
