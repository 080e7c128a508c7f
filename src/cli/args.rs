//! Command-line argument parsing

use crate::config::RelocateConfig;
use crate::error::{RegistryError, Result};
use crate::image::tag::TagStrategy;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "image-relocator")]
#[command(about = "Relocate OCI images and indexes between registries and tar archives")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy images from a registry into a tar archive
    Export {
        /// Image reference (tag or digest form); repeat for several images
        #[arg(long = "image", short = 'i', required = true)]
        images: Vec<String>,

        /// Archive to write
        #[arg(long = "to-tar")]
        to_tar: PathBuf,

        /// Rewrite the archive from scratch instead of reusing verified layers
        #[arg(long = "no-resume")]
        no_resume: bool,
    },
    /// Copy the images of a tar archive into a repository
    Import {
        #[arg(long = "from-tar")]
        from_tar: PathBuf,

        /// Destination repository, e.g. registry.example.com/team/bundle
        #[arg(long = "to-repo")]
        to_repo: String,
    },
    /// Copy images from one registry to another repository without an archive
    Relocate {
        #[arg(long = "image", short = 'i', required = true)]
        images: Vec<String>,

        #[arg(long = "to-repo")]
        to_repo: String,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CommonArgs {
    /// Registry operations in flight at once
    #[arg(long = "concurrency", short = 'j', global = true)]
    pub concurrency: Option<usize>,

    /// Derive upload tags from the source repository path
    #[arg(long = "repo-based-tags", global = true)]
    pub repo_based_tags: bool,

    /// Skip TLS certificate verification
    #[arg(long = "insecure", short = 'k', global = true)]
    pub insecure: bool,

    /// Use plain HTTP for registries
    #[arg(long = "plain-http", global = true)]
    pub plain_http: bool,

    /// Docker config.json to read registry credentials from
    #[arg(long = "docker-config", global = true)]
    pub docker_config: Option<PathBuf>,

    #[arg(long = "verbose", short = 'v', global = true)]
    pub verbose: bool,

    /// Only print errors and results
    #[arg(long = "quiet", short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        if self.common.concurrency == Some(0) {
            return Err(RegistryError::Validation(
                "Concurrency must be at least 1".to_string(),
            ));
        }
        match &self.command {
            Command::Export { to_tar, .. } if to_tar.is_dir() => Err(RegistryError::Validation(
                format!("{} is a directory", to_tar.display()),
            )),
            Command::Import { from_tar, .. } if !from_tar.is_file() => Err(
                RegistryError::Validation(format!("Archive not found: {}", from_tar.display())),
            ),
            _ => Ok(()),
        }
    }

    /// Environment defaults overridden by the flags given on the command line
    pub fn config(&self) -> Result<RelocateConfig> {
        let mut config = RelocateConfig::from_env()?
            .with_skip_tls(self.common.insecure)
            .with_plain_http(self.common.plain_http)
            .with_verbose(self.common.verbose);
        if let Some(concurrency) = self.common.concurrency {
            config = config
                .with_concurrency(concurrency)
                .with_build_concurrency(concurrency);
        }
        if self.common.repo_based_tags {
            config = config.with_tag_strategy(TagStrategy::RepoBased);
        }
        if let Command::Export { no_resume: true, .. } = self.command {
            config = config.with_resume_archive(false);
        }
        config.validate()?;
        Ok(config)
    }
}
