use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::GoogleConfig;
use crate::db::models::deserialize_expiration;
use crate::error::{AppError, AppResult};

const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Read side of a calendar provider plus push-channel creation.
///
/// Every method fails with `AppError::AccessDenied(calendar_id)` when the
/// provider refuses access to the calendar and with `AppError::Provider` for
/// anything else.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Address users must share their calendars with. With domain-wide
    /// delegation this is the impersonated user, not the service account.
    fn service_account_email(&self) -> &str;

    /// Events starting in `[time_min, time_max)`, recurring events expanded,
    /// ordered by start.
    async fn list_events_in_window(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> AppResult<EventList>;

    /// Events changed since `updated_min`, deleted ones included.
    async fn list_events_updated_since(
        &self,
        calendar_id: &str,
        updated_min: DateTime<Utc>,
    ) -> AppResult<EventList>;

    /// The calendar's display name. Also proves the calendar is readable.
    async fn calendar_summary(&self, calendar_id: &str) -> AppResult<String>;

    /// Open a push-notification channel for the calendar's events.
    async fn watch(&self, calendar_id: &str, request: &WatchRequest) -> AppResult<WatchResponse>;
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub items: Vec<ProviderEvent>,
    #[serde(rename = "nextPageToken", default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start: Option<EventTime>,
    #[serde(default)]
    pub end: Option<EventTime>,
}

/// Either `date` (whole-day events) or `dateTime` is set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventTime {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(rename = "dateTime", default)]
    pub date_time: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    pub address: String,
    pub token: String,
}

impl WatchRequest {
    pub fn web_hook(id: String, address: String, token: String) -> Self {
        Self {
            id,
            channel_type: "web_hook".to_string(),
            address,
            token,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchResponse {
    #[serde(rename = "resourceId")]
    pub resource_id: String,
    #[serde(default, deserialize_with = "deserialize_expiration")]
    pub expiration: Option<i64>,
}

// ============================================================================
// Service account auth types
// ============================================================================

/// The parts of a service account JSON key the client needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

// ============================================================================
// Google Calendar client
// ============================================================================

#[derive(Clone)]
pub struct GoogleCalendarService {
    client: Client,
    client_email: String,
    signing_key: EncodingKey,
    delegated_subject: Option<String>,
    api_base: String,
    token_uri: String,
    access_token: Arc<RwLock<Option<AccessToken>>>,
}

impl GoogleCalendarService {
    /// Build the client from the service account key file named in the config.
    pub fn from_config(config: &GoogleConfig) -> AppResult<Self> {
        let raw = std::fs::read_to_string(&config.service_account_file).map_err(|e| {
            AppError::Config(format!(
                "Failed to read service account file {}: {}",
                config.service_account_file, e
            ))
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!("Invalid service account file: {}", e))
        })?;
        Self::new(key, config)
    }

    pub fn new(key: ServiceAccountKey, config: &GoogleConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| AppError::Config(format!("Invalid service account private key: {}", e)))?;

        Ok(Self {
            client,
            client_email: key.client_email,
            signing_key,
            delegated_subject: config.delegated_subject.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token_uri: config.token_uri.clone(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!(
            "{}/calendars/{}/events",
            self.api_base,
            urlencoding::encode(calendar_id)
        )
    }

    fn rfc3339(instant: DateTime<Utc>) -> String {
        instant.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    // ========================================================================
    // Token handling
    // ========================================================================

    fn build_assertion(&self, now: DateTime<Utc>) -> AppResult<String> {
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: CALENDAR_SCOPE,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
            sub: self.delegated_subject.as_deref(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.signing_key,
        )?)
    }

    /// Exchange a freshly signed assertion for an access token and cache it.
    pub async fn refresh_access_token(&self) -> AppResult<()> {
        let assertion = self.build_assertion(Utc::now())?;

        let response = self
            .send_with_backoff(|| {
                self.client
                    .post(&self.token_uri)
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            })
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Provider(format!(
                "Failed to obtain access token ({}): {}",
                status, error_text
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::Provider(format!("Failed to parse token response: {}", e)))?;

        let expires_at = Utc::now() + Duration::seconds(token_response.expires_in);
        *self.access_token.write().await = Some(AccessToken {
            token: token_response.access_token,
            expires_at,
        });

        tracing::debug!("Refreshed Google access token; expires at {}", expires_at);
        Ok(())
    }

    /// Current access token, refreshed when it expires within a minute.
    async fn valid_access_token(&self) -> AppResult<String> {
        const REFRESH_MARGIN_SECS: i64 = 60;

        {
            let guard = self.access_token.read().await;
            if let Some(ref t) = *guard {
                if t.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now() {
                    return Ok(t.token.clone());
                }
            }
        }

        self.refresh_access_token().await?;

        let guard = self.access_token.read().await;
        guard
            .as_ref()
            .map(|t| t.token.clone())
            .ok_or_else(|| AppError::Provider("No access token available".to_string()))
    }

    // ========================================================================
    // Request helpers
    // ========================================================================

    /// Send a request, retrying rate limits, server errors and network
    /// failures with exponential backoff. Other non-2xx responses are
    /// returned for the caller to classify.
    async fn send_with_backoff<F>(&self, make_request: F) -> AppResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        const MAX_RETRIES: usize = 5;
        let mut backoff_secs: u64 = 1;
        let max_backoff_secs: u64 = 60;

        for attempt in 0..MAX_RETRIES {
            match (make_request)().send().await {
                Ok(resp) => {
                    if resp.status() == StatusCode::TOO_MANY_REQUESTS
                        || resp.status().is_server_error()
                    {
                        let mut wait_secs = backoff_secs;
                        if let Some(h) = resp.headers().get("retry-after") {
                            if let Ok(s) = h.to_str() {
                                if let Ok(parsed) = s.parse::<u64>() {
                                    wait_secs = parsed;
                                }
                            }
                        }

                        if attempt + 1 >= MAX_RETRIES {
                            let status = resp.status();
                            let err_text = resp.text().await.unwrap_or_default();
                            return Err(AppError::Provider(format!(
                                "Failed after {} attempts ({}): {}",
                                attempt + 1,
                                status,
                                err_text
                            )));
                        }

                        tracing::warn!(
                            "Transient Google API error (status: {}). Retrying in {}s (attempt {}/{})",
                            resp.status(),
                            wait_secs,
                            attempt + 1,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(wait_secs)).await;
                        backoff_secs = std::cmp::min(backoff_secs * 2, max_backoff_secs);
                        continue;
                    }

                    return Ok(resp);
                }
                Err(e) => {
                    if attempt + 1 >= MAX_RETRIES {
                        return Err(AppError::Provider(format!("Request failed: {}", e)));
                    }
                    tracing::warn!(
                        "HTTP request failed: {}. Retrying in {}s (attempt {}/{})",
                        e,
                        backoff_secs,
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                    backoff_secs = std::cmp::min(backoff_secs * 2, max_backoff_secs);
                }
            }
        }

        Err(AppError::Provider(
            "Exceeded Google API retry attempts".to_string(),
        ))
    }

    /// Run an authorized request for `calendar_id`. A 401 refreshes the token
    /// and retries once; the final response is classified into access errors
    /// and provider errors.
    async fn send_authorized<F>(&self, calendar_id: &str, make_request: F) -> AppResult<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut refreshed_token = false;
        loop {
            let token = self.valid_access_token().await?;
            let response = self.send_with_backoff(|| make_request(&token)).await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !refreshed_token {
                tracing::warn!("Unauthorized Google API request. Refreshing token and retrying.");
                self.refresh_access_token().await?;
                refreshed_token = true;
                continue;
            }

            if status.is_success() {
                return Ok(response);
            }

            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_failure(calendar_id, status, &error_text));
        }
    }

    async fn list_events(
        &self,
        calendar_id: &str,
        params: &[(&str, String)],
    ) -> AppResult<EventList> {
        let url = self.events_url(calendar_id);
        let mut page_token: Option<String> = None;
        let mut merged = EventList::default();

        loop {
            let response = self
                .send_authorized(calendar_id, |token| {
                    let mut request = self.client.get(&url).bearer_auth(token).query(params);
                    if let Some(ref page) = page_token {
                        request = request.query(&[("pageToken", page.as_str())]);
                    }
                    request
                })
                .await?;

            let page: EventList = response.json().await.map_err(|e| {
                AppError::Provider(format!("Failed to parse events response: {}", e))
            })?;

            merged.summary = page.summary;
            merged.items.extend(page.items);

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(merged)
    }
}

/// 401/403/404 from the provider mean the service account cannot read the
/// calendar (or it does not exist, which looks the same to us).
fn classify_failure(calendar_id: &str, status: StatusCode, body: &str) -> AppError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            tracing::warn!(
                "Google denied access to calendar {} ({}): {}",
                calendar_id,
                status,
                body
            );
            AppError::AccessDenied(calendar_id.to_string())
        }
        _ => AppError::Provider(format!("Google Calendar API error ({}): {}", status, body)),
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendarService {
    fn service_account_email(&self) -> &str {
        self.delegated_subject
            .as_deref()
            .unwrap_or(&self.client_email)
    }

    async fn list_events_in_window(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> AppResult<EventList> {
        self.list_events(
            calendar_id,
            &[
                ("timeMin", Self::rfc3339(time_min)),
                ("timeMax", Self::rfc3339(time_max)),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
            ],
        )
        .await
    }

    async fn list_events_updated_since(
        &self,
        calendar_id: &str,
        updated_min: DateTime<Utc>,
    ) -> AppResult<EventList> {
        self.list_events(calendar_id, &[("updatedMin", Self::rfc3339(updated_min))])
            .await
    }

    async fn calendar_summary(&self, calendar_id: &str) -> AppResult<String> {
        let url = self.events_url(calendar_id);
        let response = self
            .send_authorized(calendar_id, |token| {
                self.client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("maxResults", "2")])
            })
            .await?;

        let list: EventList = response.json().await.map_err(|e| {
            AppError::Provider(format!("Failed to parse events response: {}", e))
        })?;
        Ok(list.summary)
    }

    async fn watch(&self, calendar_id: &str, request: &WatchRequest) -> AppResult<WatchResponse> {
        let url = format!("{}/watch", self.events_url(calendar_id));
        let response = self
            .send_authorized(calendar_id, |token| {
                self.client.post(&url).bearer_auth(token).json(request)
            })
            .await?;

        response
            .json()
            .await
            .map_err(|e| AppError::Provider(format!("Failed to parse watch response: {}", e)))
    }
}
