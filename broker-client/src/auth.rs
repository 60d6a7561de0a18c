// Copyright (c) James Kassemi, SC, US. All rights reserved.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core_types::retry::RetryPolicy;
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

/// Remaining lifetime below which the cached token is refreshed eagerly.
const EXPIRY_MARGIN_SECS: i64 = 60;
/// Broker access tokens default to a 20-minute lifetime.
const DEFAULT_TOKEN_TTL_SECS: i64 = 1200;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("client id, client secret and refresh token are required")]
    MissingCredentials,
    #[error("token endpoint request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint returned status {status}")]
    Rejected { status: u16 },
}

#[derive(Clone, Debug)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > ChronoDuration::seconds(EXPIRY_MARGIN_SECS)
    }
}

/// Holds broker credentials and serves valid bearer tokens, refreshing
/// through the OAuth refresh-token grant before expiry.
///
/// The refresh is single-flighted: the cache mutex is held across the
/// exchange, so concurrent callers arriving mid-refresh await the same
/// result instead of issuing their own.
pub struct TokenSource {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    retry: RetryPolicy,
    cached: Mutex<Option<AccessToken>>,
}

impl TokenSource {
    pub fn new(
        client: Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self, AuthError> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        let refresh_token = refresh_token.into();
        if client_id.is_empty() || client_secret.is_empty() || refresh_token.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        Ok(Self {
            client,
            token_url: token_url.into(),
            client_id,
            client_secret,
            refresh_token,
            retry,
            cached: Mutex::new(None),
        })
    }

    /// Return a valid access token, performing the refresh exchange when the
    /// cache is cold or inside the expiry margin.
    pub async fn token(&self) -> Result<AccessToken, AuthError> {
        let mut guard = self.cached.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.clone());
            }
            debug!("access token inside expiry margin, refreshing");
        }
        let fresh = self
            .retry
            .retry_async(|attempt| {
                if attempt > 0 {
                    debug!("token refresh attempt {}", attempt + 1);
                }
                self.exchange()
            })
            .await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drop the cached token so the next call performs a fresh exchange.
    /// Used after a 401 from the data API.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn exchange(&self) -> Result<AccessToken, AuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", self.refresh_token.as_str()),
        ];
        let resp = self.client.post(&self.token_url).form(&form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }
        let body: TokenResponse = resp.json().await?;
        let ttl = body.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        info!("access token refreshed (expires in {ttl}s)");
        Ok(AccessToken {
            value: body.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(ttl),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}
