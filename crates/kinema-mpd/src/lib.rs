#![forbid(unsafe_code)]

//! DASH MPD document model and URL machinery.
//!
//! The parsed manifest is an arena: periods, adaptation sets and
//! representations are addressed by index, and every parsed document carries
//! a distinct generation. Code holding an address across a manifest update
//! discovers the node is gone when the address no longer resolves, instead
//! of walking weak parent pointers.

mod baseurl;
mod error;
pub mod model;
mod parser;
pub mod steering;
mod template;

pub use baseurl::collect_base_url_candidates;
pub use error::MpdError;
pub use model::{
    AdaptationSet, AdaptationSetAddress, BaseUrl, ContentProtection, EventStreamInfo,
    LowLatencyDescriptor, MpdDocument, Period, PeriodAddress, PresentationType,
    ProducerReferenceTime, Representation, RepresentationAddress, SElement, SegmentBase,
    SegmentTemplate, SegmentTimeline, UrlRange,
};
pub use parser::parse_mpd;
pub use steering::{
    apply_annex_e_byte_range, CandidateUrl, ContentSteering, DefaultSteering, SelectFor,
    SteeringDecision,
};
pub use template::{substitute_template, TemplateVars};

pub type MpdResult<T> = Result<T, MpdError>;
