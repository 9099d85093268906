use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::error::NetError;
use crate::traits::Net;
use crate::types::{Headers, NetOptions, RangeSpec};

/// reqwest-backed [`Net`] implementation.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(options: &NetOptions) -> Result<Self, NetError> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| NetError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    fn apply_headers(
        mut req: reqwest::RequestBuilder,
        headers: Option<Headers>,
    ) -> reqwest::RequestBuilder {
        if let Some(headers) = headers {
            for (k, v) in headers.iter() {
                req = req.header(k, v);
            }
        }
        req
    }

    async fn execute(&self, req: reqwest::RequestBuilder, url: &Url) -> Result<Bytes, NetError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            debug!(url = %url, status = status.as_u16(), "kinema-net: request failed");
            return Err(NetError::Status(status.as_u16()));
        }
        Ok(resp.bytes().await?)
    }
}

#[async_trait]
impl Net for HttpClient {
    async fn get_bytes(&self, url: Url, headers: Option<Headers>) -> Result<Bytes, NetError> {
        let req = Self::apply_headers(self.client.get(url.clone()), headers);
        self.execute(req, &url).await
    }

    async fn get_range(
        &self,
        url: Url,
        range: RangeSpec,
        headers: Option<Headers>,
    ) -> Result<Bytes, NetError> {
        let req = Self::apply_headers(self.client.get(url.clone()), headers)
            .header("Range", range.to_header_value());
        self.execute(req, &url).await
    }
}
