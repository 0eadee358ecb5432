/// Errors reported by the battery box client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error on the underlying TCP stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A transport level error reported by `tokio-modbus`.
    #[error("Modbus error: {0}")]
    Modbus(#[from] tokio_modbus::Error),
    /// The device answered with a Modbus exception code.
    #[error("Device exception response: {0:?}")]
    Exception(tokio_modbus::ExceptionCode),
    /// A single request did not complete within the I/O timeout.
    #[error("Tokio timeout elapsed: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
    /// The connection could not be (re-)established.
    #[error("Cannot connect to {address} after {attempts} attempts")]
    NotConnected { address: String, attempts: u8 },
    /// All retries of a register transaction failed.
    #[error("Retries exhausted - address={address:#06X} attempts={attempts}")]
    RetriesExhausted { address: u16, attempts: u8 },
    /// The ready register never reported the ready value.
    #[error("Timeout waiting for ready response - address={address:#06X} last={last:#06X}")]
    ReadyTimeout { address: u16, last: u16 },
    /// A register block had an unexpected length.
    #[error("Unexpected number of registers - expected={expected} received={received}")]
    UnexpectedLength { expected: usize, received: usize },
    /// A decoded cell voltage is not physically plausible, the read is corrupt.
    #[error("Unexpected max cell voltage {0} V")]
    CellVoltageOutOfRange(f64),
    /// `initialize()` has to succeed before the device can be polled.
    #[error("initialize() has to be called at least once before")]
    NotInitialized,
    /// The unit id is neither the BMU nor one of the detected towers.
    #[error("Unknown unit id {0}")]
    UnknownUnit(u8),
    /// Bring-up failed; the device layout is unknown.
    #[error("Initialization failed: {0}")]
    Initialization(#[source] Box<Error>),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    pub(crate) fn initialization(err: Error) -> Self {
        match err {
            Error::Initialization(_) => err,
            other => Error::Initialization(Box::new(other)),
        }
    }
}

/// A specialized `Result` type for battery box operations.
pub type Result<T> = std::result::Result<T, Error>;
