use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::debug;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{PipelineError, PipelineResult};

const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const USERS_URL: &str = "https://api.twitch.tv/helix/users";
const CLIPS_URL: &str = "https://api.twitch.tv/helix/clips";

/// Page size requested from the clips API. One page only; if upstream
/// truncates, the result set is simply shorter. (Known boundary.)
pub const DEFAULT_QUERY_LIMIT: u32 = 35;

/// Time windows a caller can ask clips for. `bounds_at` derives both ends
/// from the same instant so start/end stay consistent across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    Last24Hours,
    Last7Days,
    Last30Days,
    AllTime,
}

impl TimeWindow {
    /// Parses the loose period strings the front-end sends ("24 hours",
    /// "7", "all time", ...).
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "24 hours" | "24" => Some(TimeWindow::Last24Hours),
            "7 days" | "7" => Some(TimeWindow::Last7Days),
            "30 days" | "30" => Some(TimeWindow::Last30Days),
            "all time" | "all" => Some(TimeWindow::AllTime),
            _ => None,
        }
    }

    /// `(start, end)` with `start = end - duration`, or `None` for all-time.
    pub fn bounds_at(self, end: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let duration = match self {
            TimeWindow::Last24Hours => Duration::days(1),
            TimeWindow::Last7Days => Duration::weeks(1),
            TimeWindow::Last30Days => Duration::days(30),
            TimeWindow::AllTime => return None,
        };
        Some((end - duration, end))
    }
}

/// A resolved broadcaster: the stable id plus the login name used for
/// output file naming.
#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    pub login: String,
}

/// One clip record from the clips API. Upstream order is preserved all the
/// way to the compilation, so this carries no ordering key of its own.
#[derive(Debug, Clone, Deserialize)]
pub struct ClipDescriptor {
    pub id: String,
    /// Canonical clip page URL, used by the rendered-page resolver.
    pub url: String,
    pub thumbnail_url: String,
    pub duration: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct Paged<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Client for the handful of Twitch endpoints the pipeline needs. Bearer
/// tokens are fetched via the client-credentials flow and cached until
/// shortly before expiry.
pub struct TwitchClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl TwitchClient {
    pub fn new(client_id: String, client_secret: String) -> Self {
        TwitchClient {
            http: reqwest::Client::new(),
            client_id,
            client_secret,
            token: Mutex::new(None),
        }
    }

    async fn bearer_token(&self) -> PipelineResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.access_token.clone());
            }
        }

        debug!("requesting fresh app access token");
        let response: TokenResponse = self
            .http
            .post(TOKEN_URL)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // Refresh a minute early rather than racing the expiry.
        let expires_at = Utc::now() + Duration::seconds((response.expires_in - 60).max(0));
        let token = response.access_token.clone();
        *cached = Some(CachedToken {
            access_token: response.access_token,
            expires_at,
        });
        Ok(token)
    }

    /// Resolves a profile URL or bare handle to a channel. Empty result set
    /// and transport/auth failure both reject the request; only the former
    /// carries the attempted handle.
    pub async fn resolve_channel(&self, input: &str) -> PipelineResult<Channel> {
        let handle = extract_handle(input);
        let token = self.bearer_token().await?;

        let page: Paged<Channel> = self
            .http
            .get(USERS_URL)
            .query(&[("login", handle)])
            .header("Client-ID", &self.client_id)
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        page.data
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::ChannelNotFound(handle.to_string()))
    }

    /// Fetches a single page of clips for `channel`, newest-first as upstream
    /// returns them. An empty vec is a normal outcome, not an error.
    pub async fn query_clips(
        &self,
        channel: &Channel,
        window: TimeWindow,
        limit: u32,
    ) -> PipelineResult<Vec<ClipDescriptor>> {
        let token = self.bearer_token().await?;

        let mut params = vec![
            ("broadcaster_id".to_string(), channel.id.clone()),
            ("first".to_string(), limit.to_string()),
        ];
        // Both bounds derive from one instant, captured here and not
        // re-derived anywhere downstream.
        if let Some((start, end)) = window.bounds_at(Utc::now()) {
            params.push((
                "started_at".to_string(),
                start.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
            params.push((
                "ended_at".to_string(),
                end.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }

        let page: Paged<ClipDescriptor> = self
            .http
            .get(CLIPS_URL)
            .query(&params)
            .header("Client-ID", &self.client_id)
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(
            "clips query for {} returned {} record(s)",
            channel.login,
            page.data.len()
        );
        Ok(page.data)
    }
}

/// The upstream surface the pipeline needs: handle resolution and the clips
/// query. Split out so pipeline tests can run against a canned source.
#[async_trait::async_trait]
pub trait ClipSource: Send + Sync {
    async fn resolve_channel(&self, input: &str) -> PipelineResult<Channel>;

    async fn query_clips(
        &self,
        channel: &Channel,
        window: TimeWindow,
        limit: u32,
    ) -> PipelineResult<Vec<ClipDescriptor>>;
}

#[async_trait::async_trait]
impl ClipSource for TwitchClient {
    async fn resolve_channel(&self, input: &str) -> PipelineResult<Channel> {
        TwitchClient::resolve_channel(self, input).await
    }

    async fn query_clips(
        &self,
        channel: &Channel,
        window: TimeWindow,
        limit: u32,
    ) -> PipelineResult<Vec<ClipDescriptor>> {
        TwitchClient::query_clips(self, channel, window, limit).await
    }
}

/// Trailing path segment of a profile URL, or the input itself for a bare
/// handle.
pub fn extract_handle(input: &str) -> &str {
    input.trim().trim_end_matches('/').split('/').next_back().unwrap_or(input)
}
