pub mod band;
pub mod clock;
pub mod config;
pub mod error;
pub mod link;
pub mod packet;
pub mod scheduler;
pub mod stats;

// Re-export for easier testing
pub use config::{CszConfig, FlowParams, Rate, ShaperConfig};
pub use error::{CszError, LinkError};
pub use scheduler::{CszScheduler, FlowId, FlowSelector, Qdisc, Verdict};
