//! Ordered prep steps and the driver executing them.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::task::Progress;
use super::{PrepSettings, seed, version};
use crate::crd::ImageBasedUpgrade;
use crate::error::IbuError;
use crate::host::{HostPaths, stateroot_certs_dir, stateroot_name};
use crate::ops::PrepOps;
use crate::precache::poller::{StatusPoller, WAITING_FOR};
use crate::precache::wait::poll_until;
use crate::precache::{PrecacheConfig, read_precaching_list, should_override_registry};

/// Progress message of a successful run.
pub const PREP_COMPLETED: &str = "Prep completed successfully";

/// Workspace file receiving the seed image list.
const IMAGE_LIST_FILE: &str = "seed-images.list";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepStep {
    ValidateVersion,
    PullSeedImage,
    CheckCompatibility,
    SetupStateroot,
    LaunchPrecaching,
    WaitPrecaching,
}

impl PrepStep {
    /// Execution order.
    pub const ALL: [Self; 6] = [
        Self::ValidateVersion,
        Self::PullSeedImage,
        Self::CheckCompatibility,
        Self::SetupStateroot,
        Self::LaunchPrecaching,
        Self::WaitPrecaching,
    ];

    /// What the step does, as used in cancellation errors.
    pub const fn action(self) -> &'static str {
        match self {
            Self::ValidateVersion => "validating seed version",
            Self::PullSeedImage => "pulling seed image",
            Self::CheckCompatibility => "checking seed image compatibility",
            Self::SetupStateroot => "setting up stateroot",
            Self::LaunchPrecaching => "launching precaching job",
            Self::WaitPrecaching => "waiting for precaching job",
        }
    }

    /// Progress recorded while the step runs.
    pub const fn running(self) -> &'static str {
        match self {
            Self::ValidateVersion => "Validating seed version",
            Self::PullSeedImage => "Pulling seed image",
            Self::CheckCompatibility => "Checking seed image compatibility",
            Self::SetupStateroot => "Setting up stateroot",
            Self::LaunchPrecaching => "Launching precaching job",
            Self::WaitPrecaching => "Waiting for precaching job to complete",
        }
    }

    /// Progress recorded once the step succeeded.
    pub const fn completed(self) -> &'static str {
        match self {
            Self::ValidateVersion => "Seed version validated",
            Self::PullSeedImage => "Successfully pulled seed image",
            Self::CheckCompatibility => "Seed image is compatible",
            Self::SetupStateroot => "Successfully set up stateroot",
            Self::LaunchPrecaching => "Precaching job launched",
            Self::WaitPrecaching => "Precaching completed",
        }
    }
}

impl std::fmt::Display for PrepStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValidateVersion => write!(f, "ValidateVersion"),
            Self::PullSeedImage => write!(f, "PullSeedImage"),
            Self::CheckCompatibility => write!(f, "CheckCompatibility"),
            Self::SetupStateroot => write!(f, "SetupStateroot"),
            Self::LaunchPrecaching => write!(f, "LaunchPrecaching"),
            Self::WaitPrecaching => write!(f, "WaitPrecaching"),
        }
    }
}

/// Values produced by earlier steps and consumed by later ones.
#[derive(Debug, Default)]
struct RunState {
    stateroot: String,
    image_list_file: PathBuf,
}

/// One run of the prep steps for a resource snapshot.
pub struct Pipeline<'a> {
    pub ops: &'a dyn PrepOps,
    pub paths: &'a HostPaths,
    pub settings: &'a PrepSettings,
    pub progress: &'a Progress,
    pub cancel: &'a CancellationToken,
}

impl Pipeline<'_> {
    /// Execute every step in order and return the final progress message.
    ///
    /// Cancellation is checked before each step; a cancelled run fails with
    /// [`IbuError::Cancelled`] naming the step that did not start.
    pub async fn run(&self, ibu: &ImageBasedUpgrade) -> Result<String> {
        let mut state = RunState::default();

        for step in PrepStep::ALL {
            if self.cancel.is_cancelled() {
                warn!(%step, "Prep cancelled before step");
                return Err(IbuError::Cancelled(step.action().to_string()).into());
            }

            info!(%step, "Running prep step");
            self.progress.set(step.running());
            self.run_step(step, ibu, &mut state).await?;
            self.progress.set(step.completed());
        }

        Ok(self.final_message().await)
    }

    async fn run_step(&self, step: PrepStep, ibu: &ImageBasedUpgrade, state: &mut RunState) -> Result<()> {
        let seed = &ibu.spec.seed_image_ref;

        match step {
            PrepStep::ValidateVersion => {
                let current = self
                    .ops
                    .desired_cluster_version()
                    .await
                    .context("failed to get desired cluster version")?;
                version::check_upgrade(&seed.version, &current)?;
            }
            PrepStep::PullSeedImage => {
                seed::pull_seed_image(self.ops, self.paths, &self.settings.namespace, ibu).await?;
            }
            PrepStep::CheckCompatibility => {
                let labels = self
                    .ops
                    .inspect_image_labels(&seed.image)
                    .await
                    .with_context(|| format!("failed to inspect seed image {}", seed.image))?;
                seed::check_seed_format(&seed.image, &labels)?;
            }
            PrepStep::SetupStateroot => self.setup_stateroot(ibu, state).await?,
            PrepStep::LaunchPrecaching => self.launch_precaching(state).await?,
            PrepStep::WaitPrecaching => {
                let interval = self.settings.precache_poll_interval;
                let poller = StatusPoller::new(self.settings.precache_status_retries, interval);
                poll_until(self.cancel, interval, WAITING_FOR, || {
                    poller.check(self.ops, self.progress, self.cancel)
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn setup_stateroot(&self, ibu: &ImageBasedUpgrade, state: &mut RunState) -> Result<()> {
        let seed = &ibu.spec.seed_image_ref;
        let stateroot = stateroot_name(&seed.version);
        let image_list_file = self.paths.workspace_file(IMAGE_LIST_FILE);

        self.ops
            .cleanup_prior_deployments()
            .await
            .context("failed to clean up prior deployments")?;
        self.ops
            .setup_stateroot(&seed.image, &seed.version, &image_list_file)
            .await
            .with_context(|| format!("failed to set up stateroot {stateroot}"))?;
        self.ops
            .write_rollback_config(ibu)
            .await
            .context("failed to write rollback configuration")?;
        self.ops
            .backup_kubeconfig_crypto(&stateroot_certs_dir(&stateroot))
            .await
            .context("failed to back up kubeconfig crypto")?;

        info!(%stateroot, "Stateroot ready");
        state.stateroot = stateroot;
        state.image_list_file = image_list_file;
        Ok(())
    }

    async fn launch_precaching(&self, state: &RunState) -> Result<()> {
        let seed_info = self
            .ops
            .seed_cluster_info(&state.stateroot)
            .await
            .context("failed to read seed cluster info")?;
        let cluster_registry = self
            .ops
            .release_registry()
            .await
            .context("failed to get cluster release registry")?;

        let override_registry = should_override_registry(&seed_info, &cluster_registry);
        let images = read_precaching_list(
            &self.paths.outside_chroot(&state.image_list_file),
            &cluster_registry,
            &seed_info.release_registry,
            override_registry,
        )
        .await?;
        let env = self
            .ops
            .own_container_env(&self.settings.container_name)
            .await
            .context("failed to read operator container env")?;

        info!(images = images.len(), override_registry, "Launching precaching job");
        let config = PrecacheConfig::new(images, env);
        let accepted = self
            .ops
            .create_precache_job(&config)
            .await
            .context("failed to create precaching job")?;
        if !accepted {
            bail!("precaching job {} was not created", config.job_name);
        }
        Ok(())
    }

    /// Completion message, with the job summary when one can be fetched.
    async fn final_message(&self) -> String {
        match self.ops.query_precache_status().await {
            Ok(Some(status)) if !status.message.is_empty() => {
                format!("{PREP_COMPLETED}: {}", status.message)
            }
            Ok(_) => PREP_COMPLETED.to_string(),
            Err(e) => {
                debug!(error = %e, "Precaching summary unavailable");
                PREP_COMPLETED.to_string()
            }
        }
    }
}
