//! Scheduler configuration.
//!
//! Configuration objects mirror what a traffic-control front end would hand the scheduler at
//! attach time: the flow table size, the packet length quantization, the link bandwidth, and the
//! per-flow guaranteed rates and queue limits. Everything has a `Default` and round-trips through
//! JSON so the binary can load it from a file.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::CszError;
use crate::scheduler::{DEFAULT_FLOW, MAX_FLOWS};

/// Number of fractional bits in a [`Rate`].
pub const RATE_SHIFT: u32 = 16;

/// Largest accepted `cell_log`; a cell of `1 << 20` bytes is already far beyond any MTU.
pub const MAX_CELL_LOG: u8 = 20;

/// Guaranteed share of the link bandwidth, fixed point with [`RATE_SHIFT`] fractional bits.
///
/// `Rate::ONE` is the whole link. Shares of several flows may add up to more than one; the
/// scheduler then splits the link in proportion to the shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Rate(u32);

impl Rate {
    pub const ONE: Rate = Rate(1 << RATE_SHIFT);

    pub const fn from_raw(raw: u32) -> Rate {
        Rate(raw)
    }

    /// `numerator / denominator` of the link, truncated to the fixed-point grid.
    ///
    /// # Panics
    /// Panics if `denominator` is zero.
    pub fn from_ratio(numerator: u32, denominator: u32) -> Rate {
        assert!(denominator != 0, "rate denominator must be non-zero");
        let raw = ((numerator as u64) << RATE_SHIFT) / denominator as u64;
        Rate(raw.min(u32::MAX as u64) as u32)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / (1u64 << RATE_SHIFT) as f64
    }
}

impl TryFrom<f64> for Rate {
    type Error = String;

    fn try_from(share: f64) -> Result<Self, Self::Error> {
        if !share.is_finite() || share < 0.0 {
            return Err(format!("rate share must be a non-negative number, got {share}"));
        }
        let raw = (share * (1u64 << RATE_SHIFT) as f64).round();
        if raw > u32::MAX as f64 {
            return Err(format!("rate share {share} is too large"));
        }
        Ok(Rate(raw as u32))
    }
}

impl From<Rate> for f64 {
    fn from(rate: Rate) -> f64 {
        rate.as_f64()
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.as_f64())
    }
}

/// Optional token bucket limiting how fast a guaranteed flow may be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaperConfig {
    /// Token refill rate in bytes per second.
    pub rate: u64,
    /// Bucket depth in bytes. The bucket starts full.
    pub burst: u64,
}

/// Parameters of one flow slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowParams {
    /// Guaranteed share of the link.
    pub rate: Rate,
    /// Packets are dropped once the flow's queued bytes reach this value.
    pub max_queue_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shaper: Option<ShaperConfig>,
}

impl FlowParams {
    pub fn new(rate: Rate, max_queue_bytes: usize) -> Self {
        Self {
            rate,
            max_queue_bytes,
            shaper: None,
        }
    }

    pub fn with_shaper(mut self, shaper: ShaperConfig) -> Self {
        self.shaper = Some(shaper);
        self
    }
}

/// A guaranteed flow entry in [`CszConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteedFlowConfig {
    pub id: u8,
    #[serde(flatten)]
    pub params: FlowParams,
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CszConfig {
    /// Size of the flow table including the default flow (slot 0). At most [`MAX_FLOWS`].
    pub flows: usize,
    /// Packet lengths are quantized to cells of `1 << cell_log` bytes.
    pub cell_log: u8,
    /// Link bandwidth in bytes per second.
    pub link_rate: u64,
    /// Longest wall-clock gap between two round updates the scheduler will account for. A longer
    /// gap is treated as a clock fault and resets the scheduler.
    #[serde(with = "duration_micros")]
    pub max_delay: Duration,
    /// Parameters of the default flow. Without them default-flow traffic is dropped.
    pub default_flow: Option<FlowParams>,
    /// Guaranteed flows (ids `1..flows`).
    pub guaranteed: Vec<GuaranteedFlowConfig>,
}

impl Default for CszConfig {
    fn default() -> Self {
        Self {
            flows: MAX_FLOWS,
            cell_log: 3,
            // 100 Mbit/s
            link_rate: 12_500_000,
            // ~2.1 s
            max_delay: Duration::from_micros(1 << 21),
            default_flow: Some(FlowParams::new(Rate::from_ratio(1, 10), 64 * 1024)),
            guaranteed: Vec::new(),
        }
    }
}

impl CszConfig {
    /// Empty table of `flows` slots with the given quantization and no configured flow.
    pub fn new(flows: usize, cell_log: u8) -> Self {
        Self {
            flows,
            cell_log,
            default_flow: None,
            ..Self::default()
        }
    }

    pub fn with_link_rate(mut self, link_rate: u64) -> Self {
        self.link_rate = link_rate;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_default_flow(mut self, params: FlowParams) -> Self {
        self.default_flow = Some(params);
        self
    }

    pub fn with_flow(mut self, id: u8, params: FlowParams) -> Self {
        self.guaranteed.push(GuaranteedFlowConfig { id, params });
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, CszError> {
        let config: CszConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CszError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check everything that does not depend on building the service tables.
    pub fn validate(&self) -> Result<(), CszError> {
        if self.flows == 0 {
            return Err(CszError::NoFlows);
        }
        if self.flows > MAX_FLOWS {
            return Err(CszError::TooManyFlows(self.flows));
        }
        if self.link_rate == 0 {
            return Err(CszError::ZeroLinkRate);
        }
        if self.cell_log > MAX_CELL_LOG {
            return Err(CszError::InvalidCellLog(self.cell_log));
        }
        if let Some(params) = &self.default_flow {
            if params.shaper.is_some() {
                return Err(CszError::ShapingOnDefaultFlow);
            }
            validate_params(DEFAULT_FLOW.get(), params)?;
        }

        let mut seen = HashSet::new();
        for flow in &self.guaranteed {
            if flow.id == DEFAULT_FLOW.get() || flow.id as usize >= self.flows {
                return Err(CszError::FlowOutOfRange {
                    id: flow.id,
                    flows: self.flows,
                });
            }
            if !seen.insert(flow.id) {
                return Err(CszError::DuplicateFlow(flow.id));
            }
            validate_params(flow.id, &flow.params)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_params(id: u8, params: &FlowParams) -> Result<(), CszError> {
    if params.rate.raw() == 0 {
        return Err(CszError::ZeroRate(id));
    }
    if let Some(shaper) = params.shaper {
        if shaper.rate == 0 || shaper.burst == 0 {
            return Err(CszError::InvalidShaper(id));
        }
    }
    Ok(())
}

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        serializer.serialize_u64(micros)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = u64::deserialize(deserializer)?;
        Ok(Duration::from_micros(micros))
    }
}
