//! Counts complete user profiles per region from a profile changelog and
//! republishes the regions above a size threshold as a changelog of their own.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` use `{e:#}` or `error = ?e` so the whole cause
//! chain is visible. Build errors with `.context()` rather than formatting the
//! source into a new message.

pub mod codec;
pub mod config;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics_consts;
pub mod partition;
pub mod pipeline;
pub mod profile;
pub mod record;
pub mod restore;
pub mod service;
pub mod sink;
pub mod source;
pub mod stages;
pub mod table;
pub mod test_utils;

pub use partition::PartitionedPipeline;
pub use pipeline::Pipeline;
pub use record::ChangeRecord;
