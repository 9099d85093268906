use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::NetError;
use crate::types::{Headers, RangeSpec};

/// Minimal fetch contract the engine depends on. The segment-resolution core
/// never talks HTTP directly; everything goes through an injected `Net`
/// implementation owned by the player session.
#[async_trait]
pub trait Net: Send + Sync {
    /// Fetch the full resource.
    async fn get_bytes(&self, url: Url, headers: Option<Headers>) -> Result<Bytes, NetError>;

    /// Fetch a byte range of a resource.
    async fn get_range(
        &self,
        url: Url,
        range: RangeSpec,
        headers: Option<Headers>,
    ) -> Result<Bytes, NetError>;
}
