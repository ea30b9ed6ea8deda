use crate::kernel::MAX_KERNEL_DX;

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid kernel half-size {0} (valid range 1-{MAX_KERNEL_DX})")]
    InvalidKernelDx(u8),
    #[error("calibration table has {got} entries, expected {expected}")]
    CalibrationSize { got: usize, expected: usize },
    #[error("calibration table entry ({x},{y}) outside the {width}x{height} sensor")]
    CalibrationEntryOutOfRange {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    },
    #[error("CSV error: {source}")]
    Csv {
        #[from]
        source: csv::Error,
    },
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("raw log error: {source}")]
    RawLog {
        #[from]
        source: aedat_log::AedatError,
    },
    #[error("output error: {source}")]
    Output {
        #[from]
        source: dvs_flow_output::Error,
    },
}
