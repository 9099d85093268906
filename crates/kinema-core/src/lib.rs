#![forbid(unsafe_code)]

pub mod sequence;
pub mod stream;
pub mod time;

pub use sequence::{SequenceIndex, SequenceState};
pub use stream::{BufferSourceInfo, CodecInfo, ContainerFormat, StreamType, TrackMetadata};
pub use time::{MediaTime, TimeRange};
