use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use dvs_flow_comms::FlowFrame;
use dvs_flow_types::{FlowEvent, OutputMode};

use crate::{FlowReceiver, Result};

/// Hard cap on flow CSV rows. At the boundary one notice is emitted and CSV
/// output stops; the serial sink is unaffected.
pub const DEFAULT_MAX_CSV_LINES: u64 = 5_000_000;

const EMPTY_POLL_SLEEP: Duration = Duration::from_micros(100);

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub mode: OutputMode,
    pub max_csv_lines: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::File,
            max_csv_lines: DEFAULT_MAX_CSV_LINES,
        }
    }
}

/// Counters reported by the worker when it stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub frames_sent: u64,
    pub csv_lines: u64,
    pub serial_degraded: bool,
    pub csv_degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Open the serial line for flow frames and verify it accepts writes.
pub fn open_serial(port: &str) -> Result<Box<dyn Write + Send>> {
    let ser = serialport::new(port, dvs_flow_comms::BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(500))
        .open()?;
    let mut ser: Box<dyn Write + Send> = Box::new(ser);
    // A failed greeting write surfaces a dead port at init time instead of
    // degrading the sink at runtime.
    ser.write_all(b"DVS flow stream\n")?;
    info!("streaming flow events to serial port {}", port);
    Ok(ser)
}

/// Create the flow CSV file and write its `#` preamble. `params_line` is a
/// one-line description of the run parameters.
pub fn open_flow_csv<P: AsRef<std::path::Path>>(
    path: P,
    params_line: &str,
) -> Result<Box<dyn Write + Send>> {
    let path = path.as_ref();
    let mut fd = std::fs::File::create(path)?;
    writeln!(fd, "#AER data with optic flow values")?;
    writeln!(fd, "#Date: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(fd, "#{}", params_line)?;
    writeln!(fd, "#x,y,t,p,u,v")?;
    info!("logging flow events to {}", path.display());
    Ok(Box::new(fd))
}

/// Drains the flow ring to the configured sinks on its own thread.
///
/// Lifecycle: `Starting -> Running -> Draining -> Stopped`. On a shutdown
/// request the worker processes every record remaining in the ring before
/// exiting. A failing sink is degraded with one alert and the other sink
/// continues.
pub struct SinkWorker {
    rx: FlowReceiver,
    serial: Option<Box<dyn Write + Send>>,
    csv: Option<csv::Writer<Box<dyn Write + Send>>>,
    max_csv_lines: u64,
    csv_cap_noticed: bool,
    stats: SinkStats,
}

impl SinkWorker {
    /// Assemble a worker from already-opened sink handles. Handles not
    /// matching `config.mode` are discarded.
    pub fn new(
        config: &SinkConfig,
        rx: FlowReceiver,
        serial: Option<Box<dyn Write + Send>>,
        csv_file: Option<Box<dyn Write + Send>>,
    ) -> Self {
        let serial = if config.mode.has_serial() { serial } else { None };
        let csv = if config.mode.has_file() {
            csv_file.map(csv::Writer::from_writer)
        } else {
            None
        };
        Self {
            rx,
            serial,
            csv,
            max_csv_lines: config.max_csv_lines,
            csv_cap_noticed: false,
            stats: SinkStats::default(),
        }
    }

    /// Start the worker thread.
    pub fn spawn(self) -> Result<SinkHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let join = std::thread::Builder::new()
            .name("flow-sink".to_string())
            .spawn(move || self.run(&stop2))?;
        Ok(SinkHandle { stop, join })
    }

    fn run(mut self, stop: &AtomicBool) -> SinkStats {
        let mut state = SinkState::Starting;
        debug!("sink worker {:?}", state);
        state = SinkState::Running;
        debug!("sink worker {:?}", state);
        while !stop.load(Ordering::Relaxed) {
            match self.rx.try_pop() {
                Some(record) => self.handle_record(&record),
                None => std::thread::sleep(EMPTY_POLL_SLEEP),
            }
        }
        state = SinkState::Draining;
        debug!("sink worker {:?}", state);
        while let Some(record) = self.rx.try_pop() {
            self.handle_record(&record);
        }
        if let Some(csv) = self.csv.as_mut() {
            if let Err(e) = csv.flush() {
                warn!("flushing flow CSV failed: {e}");
            }
        }
        if let Some(ser) = self.serial.as_mut() {
            if let Err(e) = ser.flush() {
                warn!("flushing serial sink failed: {e}");
            }
        }
        state = SinkState::Stopped;
        debug!("sink worker {:?}", state);
        self.stats
    }

    fn handle_record(&mut self, record: &FlowEvent) {
        if let Some(ser) = self.serial.as_mut() {
            let frame = FlowFrame::from_flow(
                record.xu,
                record.yu,
                record.timestamp,
                record.u,
                record.v,
            );
            match ser.write_all(&frame.encode()) {
                Ok(()) => self.stats.frames_sent += 1,
                Err(e) => {
                    error!("serial write failed ({e}); serial sink degraded");
                    self.serial = None;
                    self.stats.serial_degraded = true;
                }
            }
        }
        if let Some(csv) = self.csv.as_mut() {
            if self.stats.csv_lines >= self.max_csv_lines {
                if !self.csv_cap_noticed {
                    warn!(
                        "flow CSV reached the {} line cap; no further rows are written",
                        self.max_csv_lines
                    );
                    self.csv_cap_noticed = true;
                }
            } else {
                let row = [
                    record.x.to_string(),
                    record.y.to_string(),
                    record.timestamp.to_string(),
                    record.polarity.as_u8().to_string(),
                    format!("{:.3}", record.u),
                    format!("{:.3}", record.v),
                ];
                match csv.write_record(&row) {
                    Ok(()) => self.stats.csv_lines += 1,
                    Err(e) => {
                        error!("flow CSV write failed ({e}); CSV sink degraded");
                        self.csv = None;
                        self.stats.csv_degraded = true;
                    }
                }
            }
        }
    }
}

/// Shutdown handle to a spawned [`SinkWorker`].
pub struct SinkHandle {
    stop: Arc<AtomicBool>,
    join: std::thread::JoinHandle<SinkStats>,
}

impl SinkHandle {
    /// Request drain-and-exit without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Request drain-and-exit and wait for the worker to stop.
    pub fn stop_and_join(self) -> Result<SinkStats> {
        self.request_stop();
        self.join.join().map_err(|_| crate::Error::WorkerPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_ring;
    use dvs_flow_types::{Polarity, PolarityEvent};
    use std::sync::Mutex;

    /// `Write` into shared memory so tests can inspect sink bytes after the
    /// worker thread exits.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn record(i: i64) -> FlowEvent {
        let mut e: FlowEvent = PolarityEvent {
            x: (i % 100) as u16,
            y: 64,
            timestamp: 1_000 * i,
            polarity: Polarity::On,
        }
        .into();
        e.u = 100.0 + i as f32;
        e.v = -1.0;
        e.xu = e.x as f32;
        e.yu = 64.0;
        e.has_flow = true;
        e
    }

    #[test]
    fn drains_ring_before_stopping() {
        let (tx, rx) = flow_ring(1024);
        for i in 0..50 {
            assert!(tx.try_push(record(i)));
        }
        let serial = SharedBuf::default();
        let csv = SharedBuf::default();
        let cfg = SinkConfig {
            mode: OutputMode::Both,
            ..Default::default()
        };
        let worker = SinkWorker::new(
            &cfg,
            rx,
            Some(Box::new(serial.clone())),
            Some(Box::new(csv.clone())),
        );
        let handle = worker.spawn().unwrap();
        // Stop immediately: everything must still come out in the drain.
        let stats = handle.stop_and_join().unwrap();
        assert_eq!(stats.frames_sent, 50);
        assert_eq!(stats.csv_lines, 50);
        assert!(!stats.serial_degraded);
        assert!(tx.is_empty());

        // Serial bytes decode back in push order.
        let bytes = serial.contents();
        assert_eq!(bytes.len(), 50 * dvs_flow_comms::FRAME_LEN);
        for (i, chunk) in bytes.chunks(dvs_flow_comms::FRAME_LEN).enumerate() {
            let frame = FlowFrame::decode(chunk).unwrap();
            assert_eq!(frame.t, (1_000 * i) as u32);
        }

        let text = String::from_utf8(csv.contents()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 50);
        assert_eq!(lines[0], "0,64,0,1,100.000,-1.000");
    }

    #[test]
    fn csv_line_cap_stops_file_output_only() {
        let (tx, rx) = flow_ring(1024);
        for i in 0..25 {
            assert!(tx.try_push(record(i)));
        }
        let serial = SharedBuf::default();
        let csv = SharedBuf::default();
        let cfg = SinkConfig {
            mode: OutputMode::Both,
            max_csv_lines: 10,
        };
        let worker = SinkWorker::new(
            &cfg,
            rx,
            Some(Box::new(serial.clone())),
            Some(Box::new(csv.clone())),
        );
        let stats = worker.spawn().unwrap().stop_and_join().unwrap();
        assert_eq!(stats.csv_lines, 10);
        assert_eq!(stats.frames_sent, 25);
        assert!(!stats.csv_degraded);
        let text = String::from_utf8(csv.contents()).unwrap();
        assert_eq!(text.lines().count(), 10);
    }

    #[test]
    fn failing_serial_degrades_but_csv_continues() {
        struct FailingWriter;
        impl Write for FailingWriter {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tty gone"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let (tx, rx) = flow_ring(1024);
        for i in 0..20 {
            assert!(tx.try_push(record(i)));
        }
        let csv = SharedBuf::default();
        let cfg = SinkConfig {
            mode: OutputMode::Both,
            ..Default::default()
        };
        let worker = SinkWorker::new(
            &cfg,
            rx,
            Some(Box::new(FailingWriter)),
            Some(Box::new(csv.clone())),
        );
        let stats = worker.spawn().unwrap().stop_and_join().unwrap();
        assert!(stats.serial_degraded);
        assert_eq!(stats.frames_sent, 0);
        assert_eq!(stats.csv_lines, 20);
    }

    #[test]
    fn mode_none_discards_everything() {
        let (tx, rx) = flow_ring(64);
        for i in 0..5 {
            assert!(tx.try_push(record(i)));
        }
        let cfg = SinkConfig {
            mode: OutputMode::None,
            ..Default::default()
        };
        let serial = SharedBuf::default();
        let worker = SinkWorker::new(&cfg, rx, Some(Box::new(serial.clone())), None);
        let stats = worker.spawn().unwrap().stop_and_join().unwrap();
        assert_eq!(stats, SinkStats::default());
        assert!(serial.contents().is_empty());
    }
}
