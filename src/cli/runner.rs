//! Runs one command from parsed arguments

use crate::archive::TarArchive;
use crate::cli::args::{Args, Command};
use crate::config::RelocateConfig;
use crate::error::Result;
use crate::image::reference::Repository;
use crate::imageset::{ImageSet, ProcessedImages};
use crate::logging::Logger;
use crate::registry::{Credentials, Registry, RegistryClient};
use std::path::PathBuf;
use std::sync::Arc;

pub struct Runner {
    args: Args,
    output: Logger,
}

impl Runner {
    pub fn new(args: Args) -> Result<Self> {
        let output = if args.common.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(args.common.verbose)
        };

        Ok(Self { args, output })
    }

    pub fn output(&self) -> &Logger {
        &self.output
    }

    pub async fn run(&self) -> Result<()> {
        self.output.section("Image Relocator");
        self.args.validate()?;
        let config = self.args.config()?;
        self.output.detail(&format!(
            "Concurrency {}, {} attempt(s) per registry call, {:?} tags",
            config.concurrency, config.retry.attempts, config.tag_strategy
        ));

        let registry: Arc<dyn Registry> = Arc::new(self.create_registry_client(&config)?);
        let image_set = ImageSet::from_config(&config, self.output.clone());

        match &self.args.command {
            Command::Export { images, to_tar, .. } => {
                let refs = image_set.resolve(images, Arc::clone(&registry)).await?;
                let archive = TarArchive::new(to_tar, config.concurrency, self.output.clone());
                image_set
                    .export_to_archive(&refs, registry, &archive, config.resume_archive)
                    .await?;
            }
            Command::Import { from_tar, to_repo } => {
                let destination = Repository::parse(to_repo)?;
                let archive = TarArchive::new(from_tar, config.concurrency, self.output.clone());
                let processed = image_set
                    .import_from_archive(&archive, &destination, registry)
                    .await?;
                self.print_processed(&processed)?;
            }
            Command::Relocate { images, to_repo } => {
                let destination = Repository::parse(to_repo)?;
                let refs = image_set.resolve(images, Arc::clone(&registry)).await?;
                let processed = image_set
                    .relocate(&refs, &destination, Arc::clone(&registry), registry)
                    .await?;
                self.print_processed(&processed)?;
            }
        }

        self.output.success(&format!(
            "Operation completed successfully in {}",
            self.output.format_duration(self.output.elapsed())
        ));
        Ok(())
    }

    fn create_registry_client(&self, config: &RelocateConfig) -> Result<RegistryClient> {
        let mut credentials = Credentials::from_env();
        if let Some(path) = self.docker_config_path() {
            self.output
                .detail(&format!("Reading credentials from {}", path.display()));
            credentials = credentials.with_docker_config(&path)?;
        }

        RegistryClient::builder()
            .with_credentials(credentials)
            .with_skip_tls(config.skip_tls)
            .with_plain_http(config.plain_http)
            .with_logger(self.output.clone())
            .build()
    }

    /// The explicit `--docker-config`, else `$DOCKER_CONFIG/config.json` or
    /// `~/.docker/config.json` when one exists
    fn docker_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.args.common.docker_config {
            return Some(path.clone());
        }
        let dir = std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker")))?;
        let path = dir.join("config.json");
        path.is_file().then_some(path)
    }

    /// One `source -> destination` line per processed image, shown even in quiet mode
    fn print_processed(&self, processed: &ProcessedImages) -> Result<()> {
        for image in processed.all()? {
            println!("{} -> {}", image.unprocessed_image_ref.digest_ref, image.digest_ref);
        }
        Ok(())
    }
}
