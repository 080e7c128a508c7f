//! Authentication for registry access
//!
//! Registries answer an unauthenticated request with `401` and a
//! `WWW-Authenticate` challenge. A `Bearer` challenge names a token realm that
//! exchanges (optional) basic credentials for a scoped token; a `Basic`
//! challenge expects the credentials on the request itself.

use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Username and password for one registry host
#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Decode the base64 `user:password` form used by Docker config files
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| RegistryError::Parse(format!("Invalid encoded credentials: {}", e)))?;
        let decoded = String::from_utf8(decoded)?;
        let (username, password) = decoded.split_once(':').ok_or_else(|| {
            RegistryError::Parse("Encoded credentials missing ':' separator".to_string())
        })?;
        Ok(Self::new(username, password))
    }
}

impl fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerConfigEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerConfigEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// Host → credentials pairs found in a Docker `config.json`
pub fn read_docker_config(path: &Path) -> Result<Vec<(String, BasicCredentials)>> {
    let raw = std::fs::read(path)?;
    let config: DockerConfigFile = serde_json::from_slice(&raw)?;

    let mut found = Vec::new();
    for (server, entry) in config.auths {
        let credentials = match (entry.auth, entry.username, entry.password) {
            (Some(auth), _, _) if !auth.is_empty() => BasicCredentials::from_encoded(&auth)?,
            (_, Some(username), Some(password)) => BasicCredentials::new(username, password),
            _ => continue,
        };
        found.push((normalize_server(&server), credentials));
    }
    Ok(found)
}

/// `https://index.docker.io/v1/` → `index.docker.io`
fn normalize_server(server: &str) -> String {
    let without_scheme = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    match host {
        "docker.io" | "registry-1.docker.io" => crate::image::reference::DEFAULT_REGISTRY.to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: String,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer(BearerChallenge),
    Basic,
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut values = HashMap::new();
        for param in split_params(params) {
            if let Some((key, value)) = param.split_once('=') {
                values.insert(key.trim().to_ascii_lowercase(), value.trim().trim_matches('"').to_string());
            }
        }

        let realm = values.remove("realm")?;
        Some(Challenge::Bearer(BearerChallenge {
            realm,
            service: values.remove("service").unwrap_or_default(),
            scope: values.remove("scope"),
        }))
    }
}

/// Split on commas outside quotes; scopes such as `repository:a:pull,push`
/// contain commas of their own
fn split_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in params.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Auth {
    client: Client,
    logger: Logger,
}

impl Auth {
    pub fn new(client: Client, logger: Logger) -> Self {
        Self { client, logger }
    }

    /// Exchange `credentials` (or nothing, for anonymous pulls) for a token
    /// valid for every scope in `scopes`
    pub async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        scopes: &[String],
        credentials: Option<&BasicCredentials>,
    ) -> Result<String> {
        let mut url = url::Url::parse(&challenge.realm)?;
        {
            let mut query = url.query_pairs_mut();
            if !challenge.service.is_empty() {
                query.append_pair("service", &challenge.service);
            }
            for scope in scopes {
                query.append_pair("scope", scope);
            }
        }

        self.logger.detail(&format!("Requesting token from: {}", url));
        let mut request = self.client.get(url);
        if let Some(credentials) = credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::Network(format!("Failed to get auth token: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(RegistryError::Auth(format!(
                "Token request failed with status {}: {}",
                status, error_text
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Parse(format!("Failed to parse token response: {}", e)))?;
        let token = token_response
            .token
            .or(token_response.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RegistryError::Auth("Token response contained no token".to_string()))?;

        self.logger
            .detail(&format!("Token obtained (length: {} chars)", token.len()));
        Ok(token)
    }
}
