//! HTTP registry client
//!
//! Implements [`Registry`] against the Docker Registry v2 / OCI distribution API:
//! manifest `GET`/`HEAD`/`PUT`, blob `GET`/`HEAD`, monolithic blob upload and
//! cross-repository blob mount. Authentication challenges are answered on the
//! first `401` and tokens are cached per host and scope.

use crate::concurrency::{Throttle, settle_all};
use crate::error::handlers::HttpErrorHandler;
use crate::error::{RegistryError, Result};
use crate::image::digest::{Digest, SHA256};
use crate::image::manifest::{
    self, ACCEPTED_MANIFEST_TYPES, DOCKER_MANIFEST_V1, DOCKER_MANIFEST_V1_SIGNED, ManifestType,
};
use crate::image::reference::{ImageReference, Repository};
use crate::logging::Logger;
use crate::registry::auth::{Auth, BasicCredentials, Challenge, read_docker_config};
use crate::registry::{
    Artifact, ImageArtifact, IndexArtifact, Registry, RemoteDescriptor, WriteProgress,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Registry credentials by host, with an optional fallback for any host
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    default: Option<BasicCredentials>,
    hosts: HashMap<String, BasicCredentials>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD` as credentials for any host
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();
        match (username, password) {
            (Some(username), Some(password)) => {
                Self::anonymous().with_default(BasicCredentials::new(username, password))
            }
            _ => Self::anonymous(),
        }
    }

    pub fn with_default(mut self, credentials: BasicCredentials) -> Self {
        self.default = Some(credentials);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>, credentials: BasicCredentials) -> Self {
        self.hosts.insert(host.into(), credentials);
        self
    }

    /// Add the entries of a Docker `config.json`; hosts already configured win
    pub fn with_docker_config(mut self, path: &Path) -> Result<Self> {
        for (host, credentials) in read_docker_config(path)? {
            self.hosts.entry(host).or_insert(credentials);
        }
        Ok(self)
    }

    pub fn for_host(&self, host: &str) -> Option<&BasicCredentials> {
        self.hosts.get(host).or(self.default.as_ref())
    }

    /// Credentials usable against `host` and nothing else
    pub fn only_host(&self, host: &str) -> Self {
        match self.for_host(host) {
            Some(credentials) => Self::anonymous().with_host(host, credentials.clone()),
            None => Self::anonymous(),
        }
    }
}

pub struct RegistryClientBuilder {
    credentials: Credentials,
    skip_tls: bool,
    plain_http: bool,
    timeout: Duration,
    logger: Logger,
}

impl RegistryClientBuilder {
    pub fn new() -> Self {
        Self {
            credentials: Credentials::anonymous(),
            skip_tls: false,
            plain_http: false,
            timeout: DEFAULT_TIMEOUT,
            logger: Logger::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_skip_tls(mut self, skip_tls: bool) -> Self {
        self.skip_tls = skip_tls;
        self
    }

    /// Talk plain HTTP instead of HTTPS
    pub fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let mut builder = Client::builder().timeout(self.timeout);
        if self.skip_tls {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let http = builder
            .build()
            .map_err(|e| RegistryError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(RegistryClient {
            auth: Auth::new(http.clone(), self.logger.clone()),
            http,
            credentials: self.credentials,
            tokens: Arc::new(RwLock::new(HashMap::new())),
            plain_http: self.plain_http,
            logger: self.logger,
        })
    }
}

impl Default for RegistryClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct RegistryClient {
    http: Client,
    auth: Auth,
    credentials: Credentials,
    tokens: Arc<RwLock<HashMap<String, String>>>,
    plain_http: bool,
    logger: Logger,
}

fn pull_scope(repository: &Repository) -> String {
    format!("repository:{}:pull", repository.path())
}

fn push_scope(repository: &Repository) -> String {
    format!("repository:{}:pull,push", repository.path())
}

fn header_str(response: &Response, name: impl reqwest::header::AsHeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

impl RegistryClient {
    pub fn builder() -> RegistryClientBuilder {
        RegistryClientBuilder::new()
    }

    fn base_url(&self, registry: &str) -> String {
        let scheme = if self.plain_http { "http" } else { "https" };
        format!("{}://{}", scheme, registry)
    }

    fn manifest_url(&self, reference: &ImageReference) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference.registry()),
            reference.repository().path(),
            reference.reference_str()
        )
    }

    fn blob_url(&self, repository: &Repository, digest: &Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(repository.registry()),
            repository.path(),
            digest
        )
    }

    fn uploads_url(&self, repository: &Repository) -> String {
        format!(
            "{}/v2/{}/blobs/uploads/",
            self.base_url(repository.registry()),
            repository.path()
        )
    }

    fn cached_token(&self, key: &str) -> Result<Option<String>> {
        let guard = self.tokens.read().map_err(|_| {
            RegistryError::Internal("Failed to acquire token read lock".to_string())
        })?;
        Ok(guard.get(key).cloned())
    }

    fn store_token(&self, key: String, token: String) -> Result<()> {
        let mut guard = self.tokens.write().map_err(|_| {
            RegistryError::Internal("Failed to acquire token write lock".to_string())
        })?;
        guard.insert(key, token);
        Ok(())
    }

    /// Send a request, answering an authentication challenge once.
    ///
    /// `build` is called again for the authenticated attempt, so request bodies
    /// must be reproducible.
    async fn send<F>(&self, repository: &Repository, scopes: &[String], build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let cache_key = format!("{}|{}", repository.registry(), scopes.join(" "));
        let mut request = build(&self.http);
        if let Some(token) = self.cached_token(&cache_key)? {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let credentials = self.credentials.for_host(repository.registry());
        let challenge = header_str(&response, WWW_AUTHENTICATE).and_then(|h| Challenge::parse(&h));
        let retry = match challenge {
            Some(Challenge::Bearer(challenge)) => {
                self.logger.debug(&format!(
                    "Auth challenge received: realm={}, service={}",
                    challenge.realm, challenge.service
                ));
                let token = self.auth.fetch_token(&challenge, scopes, credentials).await?;
                self.store_token(cache_key, token.clone())?;
                build(&self.http).bearer_auth(token)
            }
            Some(Challenge::Basic) => match credentials {
                Some(credentials) => build(&self.http)
                    .basic_auth(&credentials.username, Some(&credentials.password)),
                None => return Ok(response),
            },
            None => return Ok(response),
        };
        Ok(retry.send().await?)
    }

    /// Turn a non-success response into an error
    async fn check(response: Response, operation: &str) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        Err(HttpErrorHandler::handle_registry_error(status, &error_text, operation))
    }

    fn accept_header() -> String {
        let mut accepted: Vec<&str> = ACCEPTED_MANIFEST_TYPES.to_vec();
        accepted.push(DOCKER_MANIFEST_V1_SIGNED);
        accepted.push(DOCKER_MANIFEST_V1);
        accepted.join(", ")
    }

    pub async fn blob_exists(&self, repository: &Repository, digest: &Digest) -> Result<bool> {
        let url = self.blob_url(repository, digest);
        let response = self
            .send(repository, &[pull_scope(repository)], |http| http.head(&url))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Self::check(response, "blob check").await.map(|_| false),
        }
    }

    /// Ask the registry to link `digest` from `from` into `repository`.
    /// Returns `false` when the registry declined and opened an upload instead.
    pub async fn mount_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
        from: &Repository,
    ) -> Result<bool> {
        let mut url = url::Url::parse(&self.uploads_url(repository))?;
        url.query_pairs_mut()
            .append_pair("mount", &digest.to_string())
            .append_pair("from", from.path());

        let scopes = [push_scope(repository), pull_scope(from)];
        let response = self
            .send(repository, &scopes, |http| {
                http.post(url.clone()).header("Content-Length", "0")
            })
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::ACCEPTED => Ok(false),
            _ => Self::check(response, "blob mount").await.map(|_| false),
        }
    }

    /// Monolithic upload: open a session, then `PUT` the whole blob
    pub async fn upload_blob(&self, repository: &Repository, digest: &Digest, data: &[u8]) -> Result<()> {
        let scopes = [push_scope(repository)];
        let uploads = self.uploads_url(repository);
        let response = self
            .send(repository, &scopes, |http| {
                http.post(&uploads).header("Content-Length", "0")
            })
            .await?;
        let response = Self::check(response, "upload session").await?;

        let location = header_str(&response, LOCATION).ok_or_else(|| {
            RegistryError::Registry("Missing Location header in upload response".to_string())
        })?;
        let base = url::Url::parse(&self.base_url(repository.registry()))?;
        let mut upload_url = base.join(&location)?;
        upload_url
            .query_pairs_mut()
            .append_pair("digest", &digest.to_string());

        let response = self
            .send(repository, &scopes, |http| {
                http.put(upload_url.clone())
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header("Content-Length", data.len().to_string())
                    .body(data.to_vec())
            })
            .await?;
        Self::check(response, "blob upload").await?;
        Ok(())
    }

    pub async fn put_manifest(
        &self,
        reference: &ImageReference,
        media_type: &str,
        raw: &[u8],
    ) -> Result<()> {
        let url = self.manifest_url(reference);
        let response = self
            .send(reference.repository(), &[push_scope(reference.repository())], |http| {
                http.put(&url)
                    .header(CONTENT_TYPE, media_type)
                    .body(raw.to_vec())
            })
            .await?;
        Self::check(response, "manifest upload").await?;
        Ok(())
    }
}

/// State shared by every upload of one `multi_write` call
struct WriteSession<'a> {
    client: &'a RegistryClient,
    throttle: Throttle,
    progress: Option<UnboundedSender<WriteProgress>>,
}

impl WriteSession<'_> {
    fn report(&self, digest: &Digest, bytes: u64) {
        if let Some(progress) = &self.progress {
            // A dropped receiver only means nobody is listening
            let _ = progress.send(WriteProgress {
                digest: digest.clone(),
                bytes,
            });
        }
    }

    async fn upload(&self, repository: &Repository, digest: &Digest, data: &[u8]) -> Result<()> {
        self.client.upload_blob(repository, digest, data).await?;
        self.report(digest, data.len() as u64);
        Ok(())
    }

    async fn ensure_blob(&self, repository: &Repository, digest: &Digest, data: &[u8]) -> Result<()> {
        let _permit = self.throttle.take().await?;
        if self.client.blob_exists(repository, digest).await? {
            return Ok(());
        }
        self.upload(repository, digest, data).await
    }

    async fn put_manifest(&self, target: &ImageReference, media_type: &str, raw: &[u8]) -> Result<()> {
        let _permit = self.throttle.take().await?;
        self.client.put_manifest(target, media_type, raw).await?;
        self.report(&Digest::sha256(raw), raw.len() as u64);
        Ok(())
    }

    async fn write_image(&self, target: &ImageReference, image: &ImageArtifact) -> Result<()> {
        let repository = target.repository();
        let uploads: Vec<_> = image
            .layers
            .iter()
            .map(|layer| async move {
                let digest = &layer.descriptor.digest;
                let _permit = self.throttle.take().await?;
                if self.client.blob_exists(repository, digest).await? {
                    return Ok(());
                }
                let data = layer.contents.open().await?;
                if digest.algorithm() == SHA256 {
                    digest.verify(&data)?;
                }
                self.upload(repository, digest, &data).await
            })
            .collect();
        settle_all(uploads).await?;

        self.ensure_blob(repository, &image.config.digest, image.config.raw.as_bytes())
            .await?;
        self.put_manifest(target, &image.manifest.media_type, image.manifest.raw.as_bytes())
            .await
    }

    fn write_index<'b>(&'b self, target: &'b ImageReference, index: &'b IndexArtifact) -> BoxFuture<'b, Result<()>> {
        Box::pin(async move {
            for nested in &index.indexes {
                self.write_index(&target.with_digest(&nested.digest), nested).await?;
            }
            let images: Vec<_> = index
                .images
                .iter()
                .map(|image| async move {
                    self.write_image(&target.with_digest(&image.manifest.digest), image)
                        .await
                })
                .collect();
            settle_all(images).await?;
            self.put_manifest(target, &index.media_type, index.raw.as_bytes())
                .await
        })
    }

    /// Recreate an artifact that already lives in the same registry, mounting
    /// blobs instead of re-uploading them
    fn write_mounted<'b>(
        &'b self,
        target: &'b ImageReference,
        from: &'b ImageReference,
        descriptor: &'b RemoteDescriptor,
    ) -> BoxFuture<'b, Result<()>> {
        Box::pin(async move {
            let source = from.repository();
            match descriptor.manifest_type() {
                ManifestType::Index => {
                    let entries = manifest::parse_index_manifest(&descriptor.manifest)?.manifests;
                    for entry in entries {
                        let child_from = from.with_digest(&entry.digest);
                        let child = self.client.get(&child_from).await?;
                        self.write_mounted(&target.with_digest(&entry.digest), &child_from, &child)
                            .await?;
                    }
                }
                ManifestType::Image => {
                    let parsed = manifest::parse_image_manifest(&descriptor.manifest)?;
                    let blobs = std::iter::once(parsed.config).chain(parsed.layers);
                    let copies: Vec<_> = blobs
                        .map(|blob| async move {
                            let _permit = self.throttle.take().await?;
                            let repository = target.repository();
                            if self.client.blob_exists(repository, &blob.digest).await? {
                                return Ok(());
                            }
                            if self.client.mount_blob(repository, &blob.digest, source).await? {
                                return Ok(());
                            }
                            let data = self.client.blob(source, &blob.digest).await?;
                            self.upload(repository, &blob.digest, &data).await
                        })
                        .collect();
                    settle_all(copies).await?;
                }
            }
            self.put_manifest(target, &descriptor.media_type, &descriptor.manifest)
                .await
        })
    }

    async fn write(&self, target: &ImageReference, artifact: &Artifact) -> Result<()> {
        let result = match artifact {
            Artifact::Image(image) => self.write_image(target, image).await,
            Artifact::Index(index) => self.write_index(target, index).await,
            Artifact::Mount { from, descriptor } => self.write_mounted(target, from, descriptor).await,
        };
        result.map_err(|e| e.with_reference(target.to_string()))
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn get(&self, reference: &ImageReference) -> Result<RemoteDescriptor> {
        let url = self.manifest_url(reference);
        let accept = Self::accept_header();
        let response = self
            .send(reference.repository(), &[pull_scope(reference.repository())], |http| {
                http.get(&url).header("Accept", &accept)
            })
            .await?;
        let response = Self::check(response, "manifest fetch").await?;

        let content_type = header_str(&response, CONTENT_TYPE)
            .map(|value| value.split(';').next().unwrap_or_default().trim().to_string());
        let reported_digest = header_str(&response, DOCKER_CONTENT_DIGEST);
        let manifest = response.bytes().await?.to_vec();

        let media_type = match content_type {
            Some(media_type) if media_type.starts_with("application/vnd.") => media_type,
            _ => manifest::detect_media_type(&manifest)?,
        };
        let digest = match reference.digest() {
            Some(expected) if expected.algorithm() == SHA256 => {
                expected.verify(&manifest)?;
                expected.clone()
            }
            Some(expected) => expected.clone(),
            None => match reported_digest {
                Some(value) => Digest::parse(&value)?,
                None => Digest::sha256(&manifest),
            },
        };

        Ok(RemoteDescriptor {
            media_type,
            digest,
            size: manifest.len() as u64,
            manifest,
        })
    }

    async fn digest(&self, reference: &ImageReference) -> Result<Digest> {
        let url = self.manifest_url(reference);
        let accept = Self::accept_header();
        let response = self
            .send(reference.repository(), &[pull_scope(reference.repository())], |http| {
                http.head(&url).header("Accept", &accept)
            })
            .await?;
        let response = Self::check(response, "manifest digest").await?;
        match header_str(&response, DOCKER_CONTENT_DIGEST) {
            Some(value) => Digest::parse(&value),
            None => Ok(self.get(reference).await?.digest),
        }
    }

    async fn blob(&self, repository: &Repository, digest: &Digest) -> Result<Vec<u8>> {
        let url = self.blob_url(repository, digest);
        let response = self
            .send(repository, &[pull_scope(repository)], |http| http.get(&url))
            .await?;
        let response = Self::check(response, "blob fetch").await?;
        let data = response.bytes().await?.to_vec();
        if digest.algorithm() == SHA256 {
            digest.verify(&data)?;
        }
        Ok(data)
    }

    async fn multi_write(
        &self,
        artifacts: BTreeMap<ImageReference, Artifact>,
        concurrency: usize,
        progress: Option<UnboundedSender<WriteProgress>>,
    ) -> Result<()> {
        let session = WriteSession {
            client: self,
            throttle: Throttle::new(concurrency),
            progress,
        };
        let writes: Vec<_> = artifacts
            .iter()
            .map(|(target, artifact)| session.write(target, artifact))
            .collect();
        settle_all(writes).await?;
        Ok(())
    }

    fn clone_with_single_auth(&self, repository: &Repository) -> Result<Arc<dyn Registry>> {
        Ok(Arc::new(RegistryClient {
            http: self.http.clone(),
            auth: self.auth.clone(),
            credentials: self.credentials.only_host(repository.registry()),
            tokens: Arc::new(RwLock::new(HashMap::new())),
            plain_http: self.plain_http,
            logger: self.logger.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(user: &str) -> BasicCredentials {
        BasicCredentials::new(user, "secret")
    }

    #[test]
    fn test_credentials_lookup() {
        let credentials = Credentials::anonymous()
            .with_default(creds("fallback"))
            .with_host("registry.example.com", creds("scoped"));
        assert_eq!(credentials.for_host("registry.example.com").unwrap().username, "scoped");
        assert_eq!(credentials.for_host("other.example.com").unwrap().username, "fallback");
    }

    #[test]
    fn test_only_host_drops_other_hosts() {
        let credentials = Credentials::anonymous()
            .with_host("a.example.com", creds("a"))
            .with_host("b.example.com", creds("b"));
        let single = credentials.only_host("a.example.com");
        assert_eq!(single.for_host("a.example.com").unwrap().username, "a");
        assert!(single.for_host("b.example.com").is_none());

        let fallback_only = Credentials::anonymous().with_default(creds("any"));
        let single = fallback_only.only_host("a.example.com");
        assert!(single.for_host("a.example.com").is_some());
        assert!(single.for_host("b.example.com").is_none());
    }

    #[test]
    fn test_urls() {
        let client = RegistryClient::builder().with_plain_http(true).build().unwrap();
        let reference = ImageReference::parse("localhost:5000/team/app:v1").unwrap();
        assert_eq!(
            client.manifest_url(&reference),
            "http://localhost:5000/v2/team/app/manifests/v1"
        );
        assert_eq!(
            client.uploads_url(reference.repository()),
            "http://localhost:5000/v2/team/app/blobs/uploads/"
        );
        assert!(RegistryClient::accept_header().contains("application/vnd.oci.image.index.v1+json"));
    }

    #[test]
    fn test_write_futures_are_send() {
        fn assert_send<T: Send>(_: T) {}
        let client = RegistryClient::builder().build().unwrap();
        assert_send(client.multi_write(BTreeMap::new(), 2, None));
        let reference = ImageReference::parse("registry.example.com/team/app:v1").unwrap();
        assert_send(client.get(&reference));
    }
}
