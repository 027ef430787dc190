//! Credential acquisition and revocation.
//!
//! The broker prefers a scoped installation token obtained by exchanging the
//! runner's OIDC identity with the devsy backend, and falls back to the ambient
//! CI token when that is unavailable. Acquisition never fails.
//!
//! A [`CredentialLease`] owns the credential for the rest of the run and
//! revokes it exactly once: on explicit [`CredentialLease::release`], or from
//! `Drop` when the lease goes out of scope unreleased (early return, unwind).

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::TokenSource;

pub const OIDC_AUDIENCE: &str = "devsy-action";
pub const DEFAULT_BACKEND_URL: &str = "https://devsy.ai";
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const EXCHANGE_PATH: &str = "/api/github-app/oidc-token-exchange";

/// Token available to the job before any exchange.
#[derive(Clone, Default)]
pub struct AmbientCredential {
    pub github_token: String,
    /// Explicit token that bypasses the exchange entirely.
    pub override_token: Option<String>,
}

impl fmt::Debug for AmbientCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmbientCredential")
            .field("github_token", &"<redacted>")
            .field("override_token", &self.override_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Credential the run operates with.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Installation token issued by the exchange backend.
    Broker {
        token: String,
        expires_at: Option<DateTime<Utc>>,
    },
    /// Ambient or override token. Never revoked.
    Fallback { token: String },
}

impl Credential {
    pub fn token(&self) -> &str {
        match self {
            Credential::Broker { token, .. } | Credential::Fallback { token } => token,
        }
    }

    pub fn source(&self) -> TokenSource {
        match self {
            Credential::Broker { .. } => TokenSource::Broker,
            Credential::Fallback { .. } => TokenSource::Fallback,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Credential::Broker { expires_at, .. } => *expires_at,
            Credential::Fallback { .. } => None,
        }
    }

    pub fn revocable(&self) -> bool {
        matches!(self, Credential::Broker { .. })
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Broker { expires_at, .. } => f
                .debug_struct("Broker")
                .field("token", &"<redacted>")
                .field("expires_at", expires_at)
                .finish(),
            Credential::Fallback { .. } => f
                .debug_struct("Fallback")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Token returned by a successful exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Backend that issues and revokes scoped tokens.
pub trait TokenExchange {
    fn exchange(&self) -> Result<IssuedToken>;
    fn revoke(&self, token: &str) -> Result<()>;
}

/// GitHub Actions OIDC exchange against the devsy backend.
#[derive(Debug, Clone)]
pub struct OidcTokenExchange {
    http: Client,
    request_url: Option<String>,
    request_token: Option<String>,
    backend_url: String,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct OidcTokenResponse {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: Option<String>,
    expires_at: Option<String>,
}

impl OidcTokenExchange {
    pub fn new(
        request_url: Option<String>,
        request_token: Option<String>,
        backend_url: impl Into<String>,
        api_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("devsy-action/1.0")
            .build()
            .context("build token exchange http client")?;
        Ok(Self {
            http,
            request_url,
            request_token,
            backend_url: backend_url.into(),
            api_url: api_url.into(),
        })
    }

    fn oidc_token(&self) -> Result<String> {
        let (Some(url), Some(bearer)) = (
            self.request_url.as_deref().filter(|s| !s.is_empty()),
            self.request_token.as_deref().filter(|s| !s.is_empty()),
        ) else {
            bail!(
                "OIDC token request environment variables not found (is 'id-token: write' granted?)"
            );
        };

        let response = self
            .http
            .get(format!("{url}&audience={OIDC_AUDIENCE}"))
            .bearer_auth(bearer)
            .header("User-Agent", "actions/oidc-client")
            .send()
            .context("request OIDC token")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("OIDC token request failed with status {status}: {}", body.trim());
        }
        let parsed: OidcTokenResponse = response.json().context("decode OIDC token response")?;
        parsed
            .value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("OIDC token response carried no value"))
    }
}

impl TokenExchange for OidcTokenExchange {
    #[instrument(skip_all, fields(backend = %self.backend_url))]
    fn exchange(&self) -> Result<IssuedToken> {
        let oidc = self.oidc_token()?;
        let url = format!("{}{EXCHANGE_PATH}", self.backend_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(oidc)
            .header("Content-Type", "application/json")
            .send()
            .context("connect to devsy backend")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("token exchange failed with status {status}: {}", body.trim());
        }
        let parsed: ExchangeResponse = response.json().context("decode token exchange response")?;
        let token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("token exchange response carried no access_token"))?;
        Ok(IssuedToken {
            token,
            expires_at: parsed.expires_at.as_deref().and_then(parse_expiry),
        })
    }

    #[instrument(skip_all)]
    fn revoke(&self, token: &str) -> Result<()> {
        let url = format!("{}/installation/token", self.api_url.trim_end_matches('/'));
        let response = self
            .http
            .delete(&url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .context("revoke installation token")?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => {
                debug!("token already invalid");
                Ok(())
            }
            s => bail!("token revocation failed with status {s}"),
        }
    }
}

fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(e) => {
            warn!(err = %e, raw, "ignoring unparseable token expiry");
            None
        }
    }
}

/// Outcome of releasing a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revocation {
    NotRevocable,
    Expired,
    Revoked,
    Failed,
}

pub struct TokenBroker<'a> {
    exchange: &'a dyn TokenExchange,
}

impl<'a> TokenBroker<'a> {
    pub fn new(exchange: &'a dyn TokenExchange) -> Self {
        Self { exchange }
    }

    /// Obtain the run credential. Exchange failures degrade to the ambient token.
    #[instrument(skip_all)]
    pub fn acquire(&self, ambient: &AmbientCredential) -> CredentialLease<'a> {
        if let Some(token) = ambient.override_token.as_deref().filter(|t| !t.is_empty()) {
            info!("using override GitHub token");
            return self.lease(Credential::Fallback {
                token: token.to_string(),
            });
        }

        match self.exchange.exchange() {
            Ok(issued) => {
                info!(expires_at = ?issued.expires_at, "exchanged OIDC token for devsy-bot");
                self.lease(Credential::Broker {
                    token: issued.token,
                    expires_at: issued.expires_at,
                })
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "OIDC token exchange failed, falling back to GitHub Actions token");
                self.lease(Credential::Fallback {
                    token: ambient.github_token.clone(),
                })
            }
        }
    }

    fn lease(&self, credential: Credential) -> CredentialLease<'a> {
        CredentialLease {
            exchange: self.exchange,
            credential,
            released: false,
        }
    }
}

/// Owns the run credential until teardown.
pub struct CredentialLease<'a> {
    exchange: &'a dyn TokenExchange,
    credential: Credential,
    released: bool,
}

impl CredentialLease<'_> {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Revoke the credential if it is revocable and unexpired.
    pub fn release(mut self) -> Revocation {
        self.release_once(Utc::now())
    }

    fn release_once(&mut self, now: DateTime<Utc>) -> Revocation {
        self.released = true;
        if !self.credential.revocable() {
            return Revocation::NotRevocable;
        }
        if self.credential.is_expired_at(now) {
            debug!("token already expired, skipping revocation");
            return Revocation::Expired;
        }
        match self.exchange.revoke(self.credential.token()) {
            Ok(()) => {
                info!("revoked installation token");
                Revocation::Revoked
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to revoke installation token");
                Revocation::Failed
            }
        }
    }
}

impl Drop for CredentialLease<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.release_once(Utc::now());
        }
    }
}

impl fmt::Debug for CredentialLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("credential", &self.credential)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct StubExchange {
        issue: Option<IssuedToken>,
        revoked: RefCell<Vec<String>>,
    }

    impl TokenExchange for StubExchange {
        fn exchange(&self) -> Result<IssuedToken> {
            self.issue.clone().ok_or_else(|| anyhow!("backend unreachable"))
        }

        fn revoke(&self, token: &str) -> Result<()> {
            self.revoked.borrow_mut().push(token.to_string());
            Ok(())
        }
    }

    fn ambient() -> AmbientCredential {
        AmbientCredential {
            github_token: "ghs_ambient".to_string(),
            override_token: None,
        }
    }

    fn issued(expires_at: Option<DateTime<Utc>>) -> StubExchange {
        StubExchange {
            issue: Some(IssuedToken {
                token: "ghs_scoped".to_string(),
                expires_at,
            }),
            ..StubExchange::default()
        }
    }

    #[test]
    fn exchange_failure_falls_back_to_ambient() {
        let stub = StubExchange::default();
        let lease = TokenBroker::new(&stub).acquire(&ambient());
        assert_eq!(lease.credential().source(), TokenSource::Fallback);
        assert_eq!(lease.credential().token(), "ghs_ambient");
        assert_eq!(lease.release(), Revocation::NotRevocable);
        assert!(stub.revoked.borrow().is_empty());
    }

    #[test]
    fn override_skips_exchange() {
        let stub = issued(None);
        let mut amb = ambient();
        amb.override_token = Some("ghp_override".to_string());
        let lease = TokenBroker::new(&stub).acquire(&amb);
        assert_eq!(lease.credential().token(), "ghp_override");
        assert!(!lease.credential().revocable());
    }

    #[test]
    fn broker_token_revoked_once_on_release() {
        let stub = issued(None);
        let lease = TokenBroker::new(&stub).acquire(&ambient());
        assert_eq!(lease.credential().source(), TokenSource::Broker);
        assert_eq!(lease.release(), Revocation::Revoked);
        assert_eq!(*stub.revoked.borrow(), vec!["ghs_scoped".to_string()]);
    }

    #[test]
    fn dropped_lease_revokes() {
        let stub = issued(None);
        {
            let _lease = TokenBroker::new(&stub).acquire(&ambient());
        }
        assert_eq!(stub.revoked.borrow().len(), 1);
    }

    #[test]
    fn expired_token_is_not_revoked() {
        let past = Utc::now() - chrono::Duration::minutes(5);
        let stub = issued(Some(past));
        let lease = TokenBroker::new(&stub).acquire(&ambient());
        assert_eq!(lease.release(), Revocation::Expired);
        assert!(stub.revoked.borrow().is_empty());
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let cred = Credential::Broker {
            token: "ghs_secret".to_string(),
            expires_at: None,
        };
        let rendered = format!("{cred:?} {:?}", ambient());
        assert!(!rendered.contains("ghs_secret"));
        assert!(!rendered.contains("ghs_ambient"));
    }

    #[test]
    fn parses_rfc3339_expiry() {
        let at = parse_expiry("2024-05-01T10:00:00Z").expect("parsed");
        assert_eq!(at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert!(parse_expiry("tomorrow").is_none());
    }

    #[test]
    fn missing_oidc_env_is_an_exchange_error() {
        let exchange = OidcTokenExchange::new(
            None,
            None,
            DEFAULT_BACKEND_URL,
            DEFAULT_API_URL,
            Duration::from_secs(1),
        )
        .expect("client");
        let err = exchange.exchange().unwrap_err();
        assert!(err.to_string().contains("OIDC token request environment"));
    }
}
