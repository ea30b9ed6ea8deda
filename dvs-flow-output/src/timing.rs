use std::io::Write;

use tracing::info;

use dvs_flow_types::TimingRow;

use crate::Result;

/// Per-packet timing CSV, written synchronously by the event-processing
/// thread next to the raw logger.
pub struct TimingLog {
    wtr: csv::Writer<Box<dyn Write + Send>>,
}

impl TimingLog {
    pub fn create<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut fd = std::fs::File::create(path)?;
        writeln!(fd, "#t_last,delay_us,flow_rate,wx,wy,d")?;
        info!("logging packet timing to {}", path.display());
        Ok(Self::from_writer(Box::new(fd)))
    }

    pub fn from_writer(w: Box<dyn Write + Send>) -> Self {
        Self {
            wtr: csv::WriterBuilder::new().has_headers(false).from_writer(w),
        }
    }

    pub fn write_row(&mut self, row: &TimingRow) -> Result<()> {
        self.wtr.serialize(row)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_after_preamble() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timing.csv");
        {
            let mut log = TimingLog::create(&path).unwrap();
            log.write_row(&TimingRow {
                t_last: 123_456,
                delay_us: 789,
                flow_rate: 42.5,
                wx: 0.0,
                wy: 0.0,
                d: 0.0,
            })
            .unwrap();
            log.flush().unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "#t_last,delay_us,flow_rate,wx,wy,d");
        assert_eq!(lines[1], "123456,789,42.5,0.0,0.0,0.0");
    }
}
