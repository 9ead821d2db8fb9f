use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::{Client, StatusCode, Url};
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clients::{ClientError, RawTrace, TraceClient};
use crate::db::models::{AuthMethod, Tenant};
use crate::normalize::SourceKind;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const GRAPH_BASE: &str = "https://graph.microsoft.com";
const TRACE_ENDPOINT_PATH: &str = "/beta/admin/exchange/messageTraces";
const DOMAINS_ENDPOINT_PATH: &str = "/v1.0/domains";
const TOKEN_SKEW_SECONDS: i64 = 300;
const ASSERTION_LIFETIME_SECONDS: i64 = 600;
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const REDACTED_BODY_MAX_LEN: usize = 200;

/// Microsoft Graph transport. Authenticates with client credentials (shared
/// secret or certificate assertion) and pages the Exchange message trace
/// endpoint.
pub struct GraphClient {
    http: Client,
    tenant_id: String,
    client_id: String,
    credential: Credential,
    token: Option<CachedAccessToken>,
}

enum Credential {
    Secret(String),
    Certificate(AssertionSigner),
}

/// Key material for signing RS256 client assertions.
struct AssertionSigner {
    key_pair: RsaKeyPair,
    /// base64url SHA-1 certificate thumbprint for the JWT x5t header.
    x5t: String,
}

impl GraphClient {
    pub fn new(tenant: &Tenant) -> Result<Self, ClientError> {
        let credential = match tenant.auth_method {
            AuthMethod::Secret => {
                let secret = tenant
                    .client_secret
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        ClientError::Config(format!(
                            "tenant '{}' uses secret auth but has no client_secret",
                            tenant.name
                        ))
                    })?;
                Credential::Secret(secret.to_string())
            }
            AuthMethod::Certificate => Credential::Certificate(AssertionSigner::load(tenant)?),
        };

        Ok(Self {
            http: Client::new(),
            tenant_id: tenant.tenant_id.clone(),
            client_id: tenant.client_id.clone(),
            credential,
            token: None,
        })
    }

    fn api_base() -> String {
        std::env::var("ETA_GRAPH_BASE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| GRAPH_BASE.to_string())
    }

    fn token_url(&self) -> String {
        std::env::var("ETA_TOKEN_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| {
                format!(
                    "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                    self.tenant_id
                )
            })
    }

    async fn access_token(&mut self) -> Result<String, ClientError> {
        if let Some(cached) = self.token.as_ref().filter(|t| !t.is_expired()) {
            return Ok(cached.access_token.clone());
        }

        let fresh = self.fetch_token().await?;
        let access_token = fresh.access_token.clone();
        self.token = Some(fresh);
        Ok(access_token)
    }

    async fn fetch_token(&self) -> Result<CachedAccessToken, ClientError> {
        let token_url = self.token_url();
        let mut form: Vec<(&str, String)> = vec![
            ("client_id", self.client_id.clone()),
            ("scope", GRAPH_SCOPE.to_string()),
            ("grant_type", "client_credentials".to_string()),
        ];

        match &self.credential {
            Credential::Secret(secret) => {
                form.push(("client_secret", secret.clone()));
            }
            Credential::Certificate(signer) => {
                let assertion = signer.sign_assertion(&self.client_id, &token_url)?;
                form.push((
                    "client_assertion_type",
                    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer".to_string(),
                ));
                form.push(("client_assertion", assertion));
            }
        }

        let response = self
            .http
            .post(&token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ClientError::Auth(format!("token request to {token_url}: {e}")))?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::Auth(format!(
                "token request failed: status={} body={}",
                status,
                redact_response_body(&body)
            )));
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body)
            .map_err(|e| ClientError::Auth(format!("decode token response: {e}")))?;
        let expires_at = Utc::now()
            + Duration::seconds((payload.expires_in as i64).saturating_sub(TOKEN_SKEW_SECONDS));

        Ok(CachedAccessToken {
            access_token: payload.access_token,
            expires_at,
        })
    }

    /// GETs one URL with rate-limit retries and one transparent re-auth when
    /// the token is rejected mid-run.
    async fn get_with_retry(&mut self, url: &str) -> Result<String, ClientError> {
        let mut backoff_seconds = 1u64;
        let mut reauthenticated = false;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let token = self.access_token().await?;
            let response = self
                .http
                .get(url)
                .bearer_auth(&token)
                .header("accept", "application/json")
                .send()
                .await?;

            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                debug!("access token rejected, re-authenticating once");
                self.token = None;
                reauthenticated = true;
                continue;
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response.text().await?;
                    return Err(ClientError::Api(format!(
                        "request exhausted rate-limit retries: {}",
                        redact_response_body(&body)
                    )));
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                warn!(seconds = retry_after_seconds, "rate limited, backing off");
                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let body = response.text().await?;
            if !status.is_success() {
                if is_capability_missing(status, &body) {
                    return Err(ClientError::CapabilityNotAvailable(format!(
                        "status={} body={}",
                        status,
                        redact_response_body(&body)
                    )));
                }
                return Err(ClientError::Api(format!(
                    "request failed: status={} body={}",
                    status,
                    redact_response_body(&body)
                )));
            }

            return Ok(body);
        }

        Err(ClientError::Api("request failed without response".to_string()))
    }

    fn initial_trace_url(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page_size: usize,
    ) -> Result<String, ClientError> {
        let endpoint = format!("{}{}", Self::api_base(), TRACE_ENDPOINT_PATH);
        let mut url = Url::parse(&endpoint)
            .map_err(|e| ClientError::Config(format!("parse graph URL {endpoint}: {e}")))?;
        url.query_pairs_mut()
            .append_pair(
                "startDateTime",
                &start.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .append_pair(
                "endDateTime",
                &end.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .append_pair("$top", &page_size.to_string());
        Ok(url.to_string())
    }
}

#[async_trait(?Send)]
impl TraceClient for GraphClient {
    fn name(&self) -> &str {
        "graph"
    }

    fn source(&self) -> SourceKind {
        SourceKind::Graph
    }

    async fn authenticate(&mut self) -> Result<(), ClientError> {
        self.access_token().await?;
        Ok(())
    }

    async fn fetch_traces(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page_size: usize,
    ) -> Result<Vec<RawTrace>, ClientError> {
        let mut traces = Vec::new();
        let mut next_url = Self::initial_trace_url(start, end, page_size)?;
        let mut page_number = 0u64;

        loop {
            let body = self.get_with_retry(&next_url).await?;
            let page: TracePage = serde_json::from_str(&body)
                .map_err(|e| ClientError::Api(format!("decode trace page: {e}")))?;

            page_number += 1;
            debug!(page = page_number, records = page.value.len(), "fetched trace page");
            traces.extend(page.value);

            match page.next_link {
                Some(url) => next_url = url,
                None => break,
            }
        }

        Ok(traces)
    }

    async fn list_verified_domains(&mut self) -> Result<Vec<String>, ClientError> {
        let url = format!("{}{}", Self::api_base(), DOMAINS_ENDPOINT_PATH);
        let body = match self.get_with_retry(&url).await {
            Ok(body) => body,
            Err(ClientError::Api(message)) if message.contains("Authorization_RequestDenied") => {
                return Err(ClientError::Api(format!(
                    "listing domains was denied; grant the application the \
                     Domain.Read.All permission and retry ({message})"
                )));
            }
            Err(ClientError::CapabilityNotAvailable(message)) => {
                return Err(ClientError::Api(format!(
                    "listing domains was denied; grant the application the \
                     Domain.Read.All permission and retry ({message})"
                )));
            }
            Err(e) => return Err(e),
        };

        let page: DomainPage = serde_json::from_str(&body)
            .map_err(|e| ClientError::Api(format!("decode domains response: {e}")))?;

        Ok(page
            .value
            .into_iter()
            .filter(|d| d.is_verified.unwrap_or(false))
            .map(|d| d.id)
            .collect())
    }
}

impl AssertionSigner {
    fn load(tenant: &Tenant) -> Result<Self, ClientError> {
        let path = tenant
            .certificate_path
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ClientError::Config(format!(
                    "tenant '{}' uses certificate auth but has no certificate_path",
                    tenant.name
                ))
            })?;

        if tenant
            .certificate_password
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty())
        {
            return Err(ClientError::Config(
                "password-protected certificates are not supported; export an \
                 unencrypted PEM (openssl pkcs12 -nodes) and clear the password"
                    .to_string(),
            ));
        }

        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".pfx") || lower.ends_with(".p12") {
            return Err(ClientError::Config(format!(
                "certificate '{path}' is a PKCS#12 bundle; convert it to an \
                 unencrypted PEM with 'openssl pkcs12 -in {path} -nodes -out cert.pem'"
            )));
        }

        let pem = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("read certificate '{path}': {e}")))?;

        if pem_block(&pem, "ENCRYPTED PRIVATE KEY").is_some() {
            return Err(ClientError::Config(
                "the private key is encrypted; export an unencrypted PEM \
                 (openssl pkcs8 -nocrypt) and retry"
                    .to_string(),
            ));
        }

        let key_pair = if let Some(der) = pem_block(&pem, "PRIVATE KEY") {
            RsaKeyPair::from_pkcs8(&der)
                .map_err(|e| ClientError::Config(format!("parse PKCS#8 private key: {e}")))?
        } else if let Some(der) = pem_block(&pem, "RSA PRIVATE KEY") {
            RsaKeyPair::from_der(&der)
                .map_err(|e| ClientError::Config(format!("parse RSA private key: {e}")))?
        } else {
            return Err(ClientError::Config(format!(
                "no private key block found in '{path}'"
            )));
        };

        let x5t = match tenant
            .certificate_thumbprint
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(hex) => x5t_from_thumbprint_hex(hex)?,
            None => {
                let cert_der = pem_block(&pem, "CERTIFICATE").ok_or_else(|| {
                    ClientError::Config(format!(
                        "no certificate block in '{path}' and no certificate_thumbprint configured"
                    ))
                })?;
                let digest =
                    ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, &cert_der);
                URL_SAFE_NO_PAD.encode(digest.as_ref())
            }
        };

        Ok(Self { key_pair, x5t })
    }

    /// Builds and signs the client-credential assertion JWT.
    fn sign_assertion(&self, client_id: &str, audience: &str) -> Result<String, ClientError> {
        let now = Utc::now().timestamp();
        let header = json!({
            "alg": "RS256",
            "typ": "JWT",
            "x5t": self.x5t,
        });
        let claims = json!({
            "aud": audience,
            "iss": client_id,
            "sub": client_id,
            "jti": Uuid::new_v4().to_string(),
            "nbf": now,
            "exp": now + ASSERTION_LIFETIME_SECONDS,
        });

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string()),
        );

        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(
                &RSA_PKCS1_SHA256,
                &SystemRandom::new(),
                signing_input.as_bytes(),
                &mut signature,
            )
            .map_err(|e| ClientError::Config(format!("sign client assertion: {e}")))?;

        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(&signature)
        ))
    }
}

/// The preview trace endpoint is absent (404) or not consented (the 403
/// Authorization_RequestDenied code) on tenants where the capability is not
/// rolled out; those are the fallback triggers.
fn is_capability_missing(status: StatusCode, body: &str) -> bool {
    status == StatusCode::NOT_FOUND
        || (status == StatusCode::FORBIDDEN && body.contains("Authorization_RequestDenied"))
}

fn x5t_from_thumbprint_hex(hex: &str) -> Result<String, ClientError> {
    let cleaned: String = hex.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if cleaned.len() != 40 {
        return Err(ClientError::Config(format!(
            "certificate_thumbprint must be a 40-character SHA-1 hex digest, got {} characters",
            cleaned.len()
        )));
    }

    let mut bytes = Vec::with_capacity(20);
    let raw = cleaned.as_bytes();
    let mut idx = 0usize;
    while idx < raw.len() {
        let pair = std::str::from_utf8(&raw[idx..idx + 2])
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .ok_or_else(|| ClientError::Config("invalid thumbprint hex".to_string()))?;
        bytes.push(pair);
        idx += 2;
    }

    Ok(URL_SAFE_NO_PAD.encode(&bytes))
}

/// Extracts and decodes the first PEM block with the exact label.
fn pem_block(pem: &str, label: &str) -> Option<Vec<u8>> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");

    let start = pem.find(&begin)? + begin.len();
    let stop = pem[start..].find(&end)? + start;
    let body: String = pem[start..stop].chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(body).ok()
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        let cut = trimmed
            .char_indices()
            .take_while(|(i, _)| *i <= REDACTED_BODY_MAX_LEN)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedAccessToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedAccessToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TracePage {
    #[serde(default)]
    value: Vec<RawTrace>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DomainPage {
    #[serde(default)]
    value: Vec<GraphDomain>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphDomain {
    id: String,
    #[serde(rename = "isVerified")]
    is_verified: Option<bool>,
}
