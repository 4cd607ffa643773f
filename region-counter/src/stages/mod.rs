pub mod filter;
pub mod group_count;

pub use filter::FilterStage;
pub use group_count::{CountStore, GroupAssigner, GroupCountStage};
