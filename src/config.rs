//! Configuration for relocation runs

use crate::error::{RegistryError, Result};
use crate::image::graph::DEFAULT_BUILD_CONCURRENCY;
use crate::image::tag::TagStrategy;
use crate::imageset::DEFAULT_IMPORT_CONCURRENCY;
use crate::registry::RetryPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelocateConfig {
    /// Artifacts imported at once
    pub concurrency: usize,
    /// Registry calls in flight while describing references
    pub build_concurrency: usize,
    pub retry: RetryPolicy,
    pub tag_strategy: TagStrategy,
    /// Reuse verified layers of an existing archive at the output path
    pub resume_archive: bool,
    pub skip_tls: bool,
    pub plain_http: bool,
    pub verbose: bool,
}

impl Default for RelocateConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_IMPORT_CONCURRENCY,
            build_concurrency: DEFAULT_BUILD_CONCURRENCY,
            retry: RetryPolicy::default(),
            tag_strategy: TagStrategy::Default,
            resume_archive: true,
            skip_tls: false,
            plain_http: false,
            verbose: false,
        }
    }
}

impl RelocateConfig {
    /// Defaults overlaid with `IMGRELOC_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Overlay values returned by `lookup`; unset keys keep their current value
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("IMGRELOC_CONCURRENCY") {
            self.concurrency = value.trim().parse().map_err(|_| {
                RegistryError::Validation(format!("IMGRELOC_CONCURRENCY is not a number: {}", value))
            })?;
        }
        if let Some(value) = lookup("IMGRELOC_RETRY_ATTEMPTS") {
            self.retry.attempts = value.trim().parse().map_err(|_| {
                RegistryError::Validation(format!(
                    "IMGRELOC_RETRY_ATTEMPTS is not a number: {}",
                    value
                ))
            })?;
        }
        if let Some(value) = lookup("IMGRELOC_REPO_BASED_TAGS") {
            if matches!(value.trim(), "1" | "true" | "yes") {
                self.tag_strategy = TagStrategy::RepoBased;
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_build_concurrency(mut self, build_concurrency: usize) -> Self {
        self.build_concurrency = build_concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tag_strategy(mut self, tag_strategy: TagStrategy) -> Self {
        self.tag_strategy = tag_strategy;
        self
    }

    pub fn with_resume_archive(mut self, resume_archive: bool) -> Self {
        self.resume_archive = resume_archive;
        self
    }

    pub fn with_skip_tls(mut self, skip_tls: bool) -> Self {
        self.skip_tls = skip_tls;
        self
    }

    pub fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 || self.build_concurrency == 0 {
            return Err(RegistryError::Validation(
                "Concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(RegistryError::Validation(
                "Retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
