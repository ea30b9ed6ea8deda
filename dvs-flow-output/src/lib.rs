//! Asynchronous sinks for accepted flow vectors.
//!
//! The estimator pushes annotated events into a bounded single-producer
//! single-consumer ring ([`flow_ring`]); a [`SinkWorker`] on its own thread
//! drains the ring to a serial line and/or a CSV log. The event-processing
//! thread never blocks: on a full ring the new record is dropped and
//! counted.

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("serial port error: {source}")]
    Serial {
        #[from]
        source: serialport::Error,
    },
    #[error("CSV error: {source}")]
    Csv {
        #[from]
        source: csv::Error,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("sink worker thread panicked")]
    WorkerPanicked,
}

mod ring;
mod sink;
mod timing;

pub use crate::ring::{flow_ring, FlowReceiver, FlowSender};
pub use crate::sink::{
    open_flow_csv, open_serial, SinkConfig, SinkHandle, SinkStats, SinkWorker,
    DEFAULT_MAX_CSV_LINES,
};
pub use crate::timing::TimingLog;
