//! Feed sources: epoch-partitioned git archives and lei searches.

mod archive;
pub mod extractor;
mod epoch;
pub mod git;
mod lei;
mod traits;

pub use archive::PiArchive;
pub use epoch::EpochFeed;
pub use lei::LeiFeed;
pub use traits::{FeedError, FeedSource, RefreshOutcome, Result};
