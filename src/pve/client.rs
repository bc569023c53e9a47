//! Proxmox REST client
//!
//! Provides an authenticated HTTP client for the Proxmox VE API.

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE},
    Client,
};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Method, Params, PveApi};
use crate::config::ProxmoxConfig;
use crate::error::ApiError;

/// Tickets are valid for two hours; renew well before that
const TICKET_RENEW_AGE: Duration = Duration::from_secs(3600);

/// How to authenticate against the API
#[derive(Clone)]
pub enum Credentials {
    /// `user@realm` and password, exchanged for a ticket
    Password { user: String, password: String },

    /// API token, `user@realm!tokenid` and its secret
    Token { id: String, secret: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password { user, .. } => {
                f.debug_struct("Password").field("user", user).finish()
            }
            Credentials::Token { id, .. } => f.debug_struct("Token").field("id", id).finish(),
        }
    }
}

#[derive(Clone, Debug)]
struct Ticket {
    ticket: String,
    csrf_token: String,
    issued: Instant,
}

#[derive(Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_prevention_token: String,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
}

/// Authenticated Proxmox VE API client
pub struct ProxmoxClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
    ticket: Mutex<Option<Ticket>>,
}

impl ProxmoxClient {
    /// Create a client and authenticate once so bad credentials fail early
    pub async fn connect(config: &ProxmoxConfig, credentials: Credentials) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| ApiError::Transport {
                path: String::new(),
                source: e,
            })?;

        let this = Self {
            client,
            base_url: base_url(&config.host, config.port),
            credentials,
            ticket: Mutex::new(None),
        };

        if let Credentials::Password { user, .. } = &this.credentials {
            this.auth_headers(Method::Get).await?;
            info!("Authenticated to {} as {}", this.base_url, user);
        }

        Ok(this)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn login(&self, user: &str, password: &str) -> Result<Ticket, ApiError> {
        let path = "/access/ticket";
        let response = self
            .client
            .post(self.url(path))
            .form(&[("username", user), ("password", password)])
            .send()
            .await
            .map_err(|e| ApiError::Transport {
                path: path.to_string(),
                source: e,
            })?;

        if !response.status().is_success() {
            return Err(ApiError::Auth(format!(
                "login as {} rejected with {}",
                user,
                response.status()
            )));
        }

        let envelope: Envelope = response.json().await.map_err(|e| ApiError::Transport {
            path: path.to_string(),
            source: e,
        })?;
        let data: TicketData = serde_json::from_value(envelope.data)
            .map_err(|e| ApiError::malformed(path, e.to_string()))?;

        Ok(Ticket {
            ticket: data.ticket,
            csrf_token: data.csrf_prevention_token,
            issued: Instant::now(),
        })
    }

    async fn auth_headers(&self, method: Method) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();

        match &self.credentials {
            Credentials::Token { id, secret } => {
                headers.insert(AUTHORIZATION, header_value(&token_header(id, secret))?);
            }
            Credentials::Password { user, password } => {
                let mut guard = self.ticket.lock().await;
                let stale = guard
                    .as_ref()
                    .map(|t| t.issued.elapsed() >= TICKET_RENEW_AGE)
                    .unwrap_or(true);
                if stale {
                    debug!("Requesting new API ticket for {}", user);
                    *guard = Some(self.login(user, password).await?);
                }

                if let Some(ticket) = guard.as_ref() {
                    headers.insert(
                        COOKIE,
                        header_value(&format!("PVEAuthCookie={}", ticket.ticket))?,
                    );
                    if method != Method::Get {
                        headers.insert("CSRFPreventionToken", header_value(&ticket.csrf_token)?);
                    }
                }
            }
        }

        Ok(headers)
    }
}

#[async_trait]
impl PveApi for ProxmoxClient {
    async fn request(&self, method: Method, path: &str, params: &Params) -> Result<Value, ApiError> {
        let url = self.url(path);
        debug!("{} {} {:?}", method, url, redact(params));

        let pairs = params.as_pairs();
        let builder = match method {
            Method::Get => self.client.get(&url).query(pairs),
            Method::Delete => self.client.delete(&url).query(pairs),
            Method::Post => self.client.post(&url).form(pairs),
            Method::Put => self.client.put(&url).form(pairs),
        };

        let response = builder
            .headers(self.auth_headers(method).await?)
            .send()
            .await
            .map_err(|e| ApiError::Transport {
                path: path.to_string(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = status.canonical_reason().unwrap_or("");
            return Err(ApiError::Resource {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                message: format!("{} {}", reason, body.trim()).trim().to_string(),
            });
        }

        let envelope: Envelope = response.json().await.map_err(|e| ApiError::Transport {
            path: path.to_string(),
            source: e,
        })?;

        Ok(envelope.data)
    }
}

fn base_url(host: &str, port: u16) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}/api2/json")
    } else {
        format!("https://{host}:{port}/api2/json")
    }
}

fn token_header(id: &str, secret: &str) -> String {
    format!("PVEAPIToken={id}={secret}")
}

fn header_value(s: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(s).map_err(|e| ApiError::Auth(format!("invalid header value: {e}")))
}

/// Hide values that should not end up in logs
fn redact(params: &Params) -> Vec<(&str, &str)> {
    params
        .iter()
        .map(|(k, v)| if k == "password" { (k, "***") } else { (k, v) })
        .collect()
}
