//! Error types.

use thiserror::Error;

/// Configuration errors reported by scheduler construction and runtime control.
///
/// Admission rejects and clock faults are not errors: the first is reported through
/// [`Verdict`](crate::scheduler::Verdict), the second triggers a full reset.
#[derive(Debug, Error)]
pub enum CszError {
    #[error("flow table holds at most 16 flows, {0} requested")]
    TooManyFlows(usize),
    #[error("flow table needs at least the default flow")]
    NoFlows,
    #[error("flow {id} is outside the configured table of {flows} flows")]
    FlowOutOfRange { id: u8, flows: usize },
    #[error("flow {0} is configured twice")]
    DuplicateFlow(u8),
    #[error("flow {0} has a zero rate")]
    ZeroRate(u8),
    #[error("link rate must be non-zero")]
    ZeroLinkRate,
    #[error("cell_log {0} is too large")]
    InvalidCellLog(u8),
    #[error("flow {0} rate is too small: its service time overflows virtual time")]
    ServiceTimeOverflow(u8),
    #[error("token-bucket shaping is only available on guaranteed flows")]
    ShapingOnDefaultFlow,
    #[error("shaper for flow {0} needs a non-zero rate and burst")]
    InvalidShaper(u8),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the link driver.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link rate must be non-zero")]
    ZeroLinkRate,
    #[error("egress channel disconnected")]
    EgressClosed,
}
