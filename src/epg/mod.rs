//! EPG processing: the XMLTV splitter and the URL refresh pipeline.

pub mod fetch;
pub mod splitter;

pub use fetch::FetchError;
pub use splitter::{SplitError, SplitSummary};
