//! In-memory [`Net`] implementation for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use crate::error::NetError;
use crate::traits::Net;
use crate::types::{Headers, RangeSpec};

enum Response {
    Body(Bytes),
    Fail(fn() -> NetError),
}

/// Serves scripted responses from a URL table, with byte-range slicing and
/// per-URL request counters so tests can assert fetch deduplication and
/// cache hits.
#[derive(Default)]
pub struct StaticNet {
    responses: Mutex<HashMap<String, Response>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl StaticNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, body: impl Into<Bytes>) {
        self.responses
            .lock()
            .insert(url.to_string(), Response::Body(body.into()));
    }

    pub fn insert_failure(&self, url: &str, make_error: fn() -> NetError) {
        self.responses
            .lock()
            .insert(url.to_string(), Response::Fail(make_error));
    }

    /// Number of requests (full or ranged) seen for `url`.
    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().values().sum()
    }

    fn lookup(&self, url: &Url) -> Result<Bytes, NetError> {
        *self.hits.lock().entry(url.to_string()).or_insert(0) += 1;
        match self.responses.lock().get(url.as_str()) {
            Some(Response::Body(b)) => Ok(b.clone()),
            Some(Response::Fail(make_error)) => Err(make_error()),
            None => Err(NetError::NotFound(url.to_string())),
        }
    }
}

#[async_trait]
impl Net for StaticNet {
    async fn get_bytes(&self, url: Url, _headers: Option<Headers>) -> Result<Bytes, NetError> {
        self.lookup(&url)
    }

    async fn get_range(
        &self,
        url: Url,
        range: RangeSpec,
        _headers: Option<Headers>,
    ) -> Result<Bytes, NetError> {
        let body = self.lookup(&url)?;
        let start = range.start.min(body.len() as u64) as usize;
        let end = match range.end {
            Some(e) => ((e + 1).min(body.len() as u64)) as usize,
            None => body.len(),
        };
        Ok(body.slice(start..end.max(start)))
    }
}
