// =============================================================================
// Matrixon Sync - HTTP Transport
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Authenticated reqwest client for the three endpoints the sync engine
//   needs: the classic long poll, filter registration and the windowed poll.
//   Non-success answers become `Error::Http` carrying the Matrix errcode.
//
// =============================================================================

use std::time::Instant;

use async_trait::async_trait;
use matrixon_sync_core::{
    wire::{INCREMENTAL_REQUEST_TIMEOUT, INITIAL_REQUEST_TIMEOUT},
    Error, Result, SlidingSyncRequest, SlidingSyncResponse, SyncRequest, SyncResponse,
    SyncTransport,
};
use reqwest::{Client, Response, StatusCode};
use ruma::UserId;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

const SYNC_PATH: [&str; 4] = ["_matrix", "client", "v3", "sync"];
const SLIDING_SYNC_PATH: [&str; 5] = ["_matrix", "client", "unstable", "org.matrix.msc3575", "sync"];

#[derive(Debug, Deserialize)]
struct FilterCreated {
    filter_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct MatrixErrorBody {
    #[serde(default)]
    errcode: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Build an [`Error::Http`] from a non-success answer.
pub fn http_error(status: StatusCode, body: &str) -> Error {
    let parsed: MatrixErrorBody = serde_json::from_str(body).unwrap_or_default();
    Error::Http {
        status: status.as_u16(),
        errcode: parsed.errcode.unwrap_or_else(|| "M_UNKNOWN".to_string()),
        message: parsed
            .error
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string()),
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Transport(format!("request timed out: {e}"))
    } else {
        Error::Transport(e.to_string())
    }
}

/// Homeserver client with the access token applied to every request
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// HTTP client
    client: Client,
    /// Base URL of the homeserver
    homeserver: Url,
    /// Bearer token
    access_token: String,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the homeserver URL is not an absolute
    /// http(s) URL.
    pub fn new(homeserver_url: &str, access_token: impl Into<String>) -> Result<Self> {
        let homeserver = Url::parse(homeserver_url)
            .map_err(|e| Error::Config(format!("invalid homeserver URL {homeserver_url}: {e}")))?;
        if homeserver.cannot_be_a_base() || !matches!(homeserver.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "homeserver URL must be http(s): {homeserver_url}"
            )));
        }
        let client = Client::builder().build().map_err(transport_error)?;
        Ok(Self {
            client,
            homeserver,
            access_token: access_token.into(),
        })
    }

    /// Homeserver URL with `segments` appended, each percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config("homeserver URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(http_error(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| Error::BadServerResponse(e.to_string()))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    #[instrument(level = "debug", skip_all, fields(since = ?request.since))]
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse> {
        let start = Instant::now();
        let response = self
            .client
            .get(self.endpoint(&SYNC_PATH)?)
            .bearer_auth(&self.access_token)
            .query(&request.query_pairs())
            .timeout(request.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;
        let sync = Self::decode(response).await?;
        debug!("/sync answered in {:?}", start.elapsed());
        Ok(sync)
    }

    #[instrument(level = "debug", skip(self, filter))]
    async fn create_filter(&self, user_id: &UserId, filter: &Value) -> Result<String> {
        let url = self.endpoint(&["_matrix", "client", "v3", "user", user_id.as_str(), "filter"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(filter)
            .send()
            .await
            .map_err(transport_error)?;
        let created: FilterCreated = Self::decode(response).await?;
        Ok(created.filter_id)
    }

    #[instrument(level = "debug", skip(self, request))]
    async fn sliding_sync(
        &self,
        pos: Option<String>,
        request: &SlidingSyncRequest,
    ) -> Result<SlidingSyncResponse> {
        let start = Instant::now();
        let timeout = if pos.is_some() {
            INCREMENTAL_REQUEST_TIMEOUT
        } else {
            INITIAL_REQUEST_TIMEOUT
        };
        let mut builder = self
            .client
            .post(self.endpoint(&SLIDING_SYNC_PATH)?)
            .bearer_auth(&self.access_token)
            .json(request)
            .timeout(timeout);
        if let Some(pos) = &pos {
            builder = builder.query(&[("pos", pos)]);
        }
        let response = builder.send().await.map_err(transport_error)?;
        let sync = Self::decode(response).await?;
        debug!("windowed sync answered in {:?}", start.elapsed());
        Ok(sync)
    }
}
