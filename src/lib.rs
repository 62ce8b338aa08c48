pub mod backup;
pub mod cli;
pub mod config;
pub mod convert;
pub mod dedupe;
pub mod error;
pub mod expand;
pub mod load_config;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod prune;
pub mod rename;
pub mod report;
pub mod scan;
pub mod scrub;
pub mod segregate;
pub mod size;
pub mod sniff;
pub mod tools;

pub use config::{ConversionRule, PipelineConfig, SizeRange};
pub use pipeline::Pipeline;
pub use report::{PipelineReport, RunOutcome};
