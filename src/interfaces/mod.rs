//! Built-in node interfaces.
//!
//! These are the steps the resting-state assemblers wire together: a
//! pass-through, a file selector, a results sink, and the two rs-fMRI
//! preprocessing steps.

mod identity;
mod select;
mod sink;
mod slice_timing;
mod trim;

pub use identity::IdentityInterface;
pub use select::SelectFiles;
pub use sink::DataSink;
pub use slice_timing::{SliceOrder, SliceTimingParams, TimingParams};
pub use trim::Trim;
