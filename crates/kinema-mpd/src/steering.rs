//! Content-steering selection: multi-CDN failover without the segment
//! search engine knowing about CDN policy.

use kinema_core::MediaTime;
use url::Url;

/// One resolvable base URL with its CDN identity and DVB selection weights.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateUrl {
    pub url: Url,
    pub cdn: String,
    pub priority: u32,
    pub weight: u32,
}

/// What a steering handler hands back for one chosen candidate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SteeringDecision {
    pub url: Option<Url>,
    pub steering_id: String,
    /// Annex E mode: move the byte range into this URL query parameter
    /// instead of a Range header.
    pub byte_range_query_param: Option<String>,
    /// Additional availability time offset granted by this CDN.
    pub availability_time_offset: MediaTime,
    /// Custom request header line to attach to the request.
    pub custom_header: Option<String>,
}

/// What kind of resource a candidate is being selected for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectFor {
    Manifest,
    Segment,
}

/// Boundary to the content-steering handler. The engine submits the
/// candidate list per request and uses whatever single URL comes back.
pub trait ContentSteering: Send + Sync {
    fn select(&self, select_for: SelectFor, candidates: &[CandidateUrl]) -> SteeringDecision;
}

/// Steering-less default: highest priority (lowest number) wins, document
/// order breaks ties. Weights are ignored without a steering server.
#[derive(Debug, Default)]
pub struct DefaultSteering;

impl ContentSteering for DefaultSteering {
    fn select(&self, _select_for: SelectFor, candidates: &[CandidateUrl]) -> SteeringDecision {
        let chosen = candidates.iter().min_by_key(|c| c.priority);
        SteeringDecision {
            url: chosen.map(|c| c.url.clone()),
            steering_id: chosen.map(|c| c.cdn.clone()).unwrap_or_default(),
            byte_range_query_param: None,
            availability_time_offset: MediaTime::ZERO,
            custom_header: None,
        }
    }
}

/// Annex E byte-range-in-URL: when the steering decision names a query
/// parameter, the byte range moves from the Range header into the URL.
/// `range` uses the manifest `s-e` form.
pub fn apply_annex_e_byte_range(url: &Url, range: &str, query_param: Option<&str>) -> Url {
    match query_param {
        Some(param) if !param.is_empty() && !range.is_empty() => {
            let mut rewritten = url.clone();
            rewritten
                .query_pairs_mut()
                .append_pair(param, range);
            rewritten
        }
        _ => url.clone(),
    }
}
