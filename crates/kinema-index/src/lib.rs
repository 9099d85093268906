#![forbid(unsafe_code)]

//! Binary segment indexes consumed by the segment search engine: the
//! ISO-BMFF `sidx` box for fragmented MP4, Matroska/WebM cues, and a
//! thread-safe cache of parsed entities keyed by URL and byte range.

mod cache;
mod error;
pub mod matroska;
mod reader;
pub mod sidx;

pub use cache::{CachedEntity, EntityCache};
pub use error::IndexError;
pub use matroska::{CueLookup, CueSearchMode, MatroskaIndex};
pub use sidx::{find_sidx, SidxBox, SidxEntry};

pub type IndexResult<T> = Result<T, IndexError>;
