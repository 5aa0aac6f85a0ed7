use crate::cache::FileSource;
use crate::model::SoundCommandAbstract;
use crate::session::ChannelSession;
use bytes::Bytes;
use reqwest::{Client, Method, Request, StatusCode, Url};
use std::{fmt, future::Future, time::Duration};

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const API_PREFIX: &str = "api/v2/stream-source";
const API_KEY_HEADER: &str = "X-Api-Key";

/// HTTP client for the stream-source API: channel files and the sound command list.
#[derive(Clone, Debug)]
pub struct StreamSourceApi {
    http: Client,
    base_url: Url,
}

#[derive(Clone, Debug)]
pub struct StreamSourceApiBuilder {
    base_url: String,
    timeout: Duration,
}

impl StreamSourceApiBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<StreamSourceApi, ApiError> {
        let mut parsed =
            Url::parse(self.base_url.trim()).map_err(|err| ApiError::Url(err.to_string()))?;
        if !parsed.path().ends_with('/') {
            let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
            parsed.set_path(&new_path);
        }

        let http = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(ApiError::Http)?;

        Ok(StreamSourceApi {
            http,
            base_url: parsed,
        })
    }
}

impl StreamSourceApi {
    pub fn builder(base_url: impl Into<String>) -> StreamSourceApiBuilder {
        StreamSourceApiBuilder::new(base_url)
    }

    pub async fn sound_commands(
        &self,
        channel: &str,
    ) -> Result<Vec<SoundCommandAbstract>, ApiError> {
        tracing::debug!(channel, "fetching sound commands");
        let req = self.build_sound_commands_request(channel)?;
        let resp = self.http.execute(req).await.map_err(ApiError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ApiError::Http)?;
        parse_sound_commands_response(status, &body)
    }

    pub async fn get_file(
        &self,
        session: &ChannelSession,
        file_name: &str,
    ) -> Result<Bytes, ApiError> {
        tracing::debug!(channel = %session.channel, file_name, "fetching file");
        let req = self.build_file_request(session, file_name)?;
        let resp = self.http.execute(req).await.map_err(ApiError::Http)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Api { status, body });
        }
        resp.bytes().await.map_err(ApiError::Http)
    }

    /// Direct download URL carrying the token as a query parameter, for
    /// consumers that fetch on their own.
    pub fn file_url(&self, session: &ChannelSession, file_name: &str) -> Result<Url, ApiError> {
        let mut url = self.channel_url(&session.channel, "file")?;
        url.query_pairs_mut()
            .append_pair("fileName", file_name)
            .append_pair("apiKey", &session.token);
        Ok(url)
    }

    pub fn build_file_request(
        &self,
        session: &ChannelSession,
        file_name: &str,
    ) -> Result<Request, ApiError> {
        let mut url = self.channel_url(&session.channel, "file")?;
        url.query_pairs_mut().append_pair("fileName", file_name);
        self.http
            .request(Method::GET, url)
            .header(API_KEY_HEADER, session.token.trim())
            .build()
            .map_err(ApiError::Http)
    }

    pub fn build_sound_commands_request(&self, channel: &str) -> Result<Request, ApiError> {
        let url = self.channel_url(channel, "sound-commands")?;
        self.http
            .request(Method::GET, url)
            .build()
            .map_err(ApiError::Http)
    }

    fn channel_url(&self, channel: &str, leaf: &str) -> Result<Url, ApiError> {
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(ApiError::Config("channel must not be empty"));
        }
        let mut url = self
            .base_url
            .join(&format!("{API_PREFIX}/"))
            .map_err(|err| ApiError::Url(err.to_string()))?;
        // Push as segments so a channel name can never escape its path slot.
        url.path_segments_mut()
            .map_err(|_| ApiError::Url("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(channel)
            .push(leaf);
        Ok(url)
    }
}

impl FileSource for StreamSourceApi {
    type Error = ApiError;

    fn fetch(
        &self,
        session: &ChannelSession,
        file_name: &str,
    ) -> impl Future<Output = Result<Bytes, ApiError>> + Send {
        let api = self.clone();
        let session = session.clone();
        let file_name = file_name.to_string();
        async move { api.get_file(&session, &file_name).await }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Config(&'static str),
    Url(String),
    Http(reqwest::Error),
    Json(serde_json::Error),
    Api { status: StatusCode, body: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Url(err) => write!(f, "url error: {err}"),
            Self::Http(err) => write!(f, "http error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::Api { status, body } => write!(f, "api error {}: {}", status.as_u16(), body),
        }
    }
}

impl std::error::Error for ApiError {}

pub fn parse_sound_commands_response(
    status: StatusCode,
    body: &str,
) -> Result<Vec<SoundCommandAbstract>, ApiError> {
    if !status.is_success() {
        return Err(ApiError::Api {
            status,
            body: body.to_string(),
        });
    }
    serde_json::from_str(body).map_err(ApiError::Json)
}
