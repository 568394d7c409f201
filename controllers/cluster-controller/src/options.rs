//! Command-line options.
//!
//! `Options` aggregates the kubeconfig path with one option set per
//! controller. Each option set owns its flags and knows how to validate
//! itself; the aggregate only adds the kubeconfig check and fixes the order.

use crate::error::ConfigError;
use clap::{Args, Parser};

/// Default resources imported from and synced to workload clusters.
const DEFAULT_RESOURCES_TO_SYNC: &str = "deployments.apps";

/// An option set that can check its own values.
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Validates each option set in order and stops at the first failure.
pub fn validate_all(validators: &[&dyn Validate]) -> Result<(), ConfigError> {
    for validator in validators {
        validator.validate()?;
    }
    Ok(())
}

/// Top-level options for the cluster controller.
#[derive(Debug, Clone, Parser)]
#[command(name = "cluster-controller", version, about = "Runs the API importer, API resource and syncer controllers")]
pub struct Options {
    /// Path to kubeconfig
    #[arg(long = "kubeconfig", default_value = "")]
    pub kubeconfig_path: String,

    #[command(flatten)]
    pub api_importer: ApiImporterOptions,

    #[command(flatten)]
    pub api_resource: ApiResourceOptions,

    #[command(flatten)]
    pub syncer: SyncerOptions,
}

impl Options {
    /// Validates the kubeconfig path, then the importer, resource and syncer options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kubeconfig_path.is_empty() {
            return Err(ConfigError::MissingConnectionPath);
        }
        validate_all(&[&self.api_importer, &self.api_resource, &self.syncer])
    }
}

/// Options owned by the API importer controller.
#[derive(Debug, Clone, Args)]
pub struct ApiImporterOptions {
    /// Resources to import from workload clusters (`<plural>.<group>`)
    #[arg(long = "resources-to-sync", value_delimiter = ',', default_value = DEFAULT_RESOURCES_TO_SYNC)]
    pub resources_to_sync: Vec<String>,
}

impl Default for ApiImporterOptions {
    fn default() -> Self {
        Self {
            resources_to_sync: vec![DEFAULT_RESOURCES_TO_SYNC.to_string()],
        }
    }
}

impl Validate for ApiImporterOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_resource_list("--resources-to-sync", &self.resources_to_sync)
    }
}

/// Options owned by the API resource controller.
#[derive(Debug, Clone, Args)]
pub struct ApiResourceOptions {
    /// Publish negotiated APIs as CRDs when no CRD exists yet
    #[arg(long = "auto-publish-apis")]
    pub auto_publish_apis: bool,

    /// Number of concurrent API resource reconciliations
    #[arg(long = "apiresource-workers", default_value_t = 2)]
    pub num_threads: usize,
}

impl Default for ApiResourceOptions {
    fn default() -> Self {
        Self {
            auto_publish_apis: false,
            num_threads: 2,
        }
    }
}

impl Validate for ApiResourceOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::InvalidFlag {
                flag: "--apiresource-workers",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// How the syncer reaches workload clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// No syncer runs
    Disabled,
    /// A syncer image is installed into each workload cluster and pulls from the control plane
    Pull { image: String },
    /// Syncers run in this process and push to each workload cluster
    Push,
}

/// Options owned by the syncer controller.
#[derive(Debug, Clone, Default, Args)]
pub struct SyncerOptions {
    /// Resources to sync to workload clusters (`<plural>.<group>`)
    #[arg(
        id = "syncer_resources_to_sync",
        long = "syncer-resources-to-sync",
        value_delimiter = ',',
        default_value = DEFAULT_RESOURCES_TO_SYNC
    )]
    pub resources_to_sync: Vec<String>,

    /// Syncer image installed into workload clusters in pull mode
    #[arg(long = "syncer-image")]
    pub syncer_image: Option<String>,

    /// Install a syncer into each workload cluster
    #[arg(long = "pull-mode")]
    pub pull_mode: bool,

    /// Run a syncer per workload cluster inside this process
    #[arg(long = "push-mode")]
    pub push_mode: bool,
}

impl SyncerOptions {
    /// The selected sync mode. Only meaningful after `validate` succeeded.
    pub fn mode(&self) -> SyncMode {
        match (self.pull_mode, self.push_mode) {
            (true, _) => SyncMode::Pull {
                image: self.syncer_image.clone().unwrap_or_default(),
            },
            (false, true) => SyncMode::Push,
            (false, false) => SyncMode::Disabled,
        }
    }
}

impl Validate for SyncerOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.pull_mode && self.push_mode {
            return Err(ConfigError::Conflict(
                "can't set both --pull-mode and --push-mode".to_string(),
            ));
        }
        if self.pull_mode && self.syncer_image.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidFlag {
                flag: "--syncer-image",
                reason: "required with --pull-mode".to_string(),
            });
        }
        if self.pull_mode || self.push_mode {
            validate_resource_list("--syncer-resources-to-sync", &self.resources_to_sync)?;
        }
        Ok(())
    }
}

fn validate_resource_list(flag: &'static str, resources: &[String]) -> Result<(), ConfigError> {
    if resources.is_empty() {
        return Err(ConfigError::InvalidFlag {
            flag,
            reason: "at least one resource is required".to_string(),
        });
    }
    if resources.iter().any(|r| r.trim().is_empty()) {
        return Err(ConfigError::InvalidFlag {
            flag,
            reason: "resource names must not be empty".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn valid_options() -> Options {
        Options {
            kubeconfig_path: "valid.kubeconfig".to_string(),
            api_importer: ApiImporterOptions::default(),
            api_resource: ApiResourceOptions::default(),
            syncer: SyncerOptions {
                resources_to_sync: vec!["deployments.apps".to_string()],
                ..Default::default()
            },
        }
    }

    struct CountingValidator<'a> {
        calls: &'a Cell<u32>,
        result: Result<(), ConfigError>,
    }

    impl Validate for CountingValidator<'_> {
        fn validate(&self) -> Result<(), ConfigError> {
            self.calls.set(self.calls.get() + 1);
            self.result.clone()
        }
    }

    #[test]
    fn test_valid_options_pass() {
        assert_eq!(valid_options().validate(), Ok(()));
    }

    #[test]
    fn test_empty_kubeconfig_fails_regardless_of_sub_options() {
        let mut options = valid_options();
        options.kubeconfig_path = String::new();
        assert_eq!(options.validate(), Err(ConfigError::MissingConnectionPath));

        // Broken sub-options must not mask the missing path
        options.api_resource.num_threads = 0;
        options.syncer.pull_mode = true;
        options.syncer.push_mode = true;
        assert_eq!(options.validate(), Err(ConfigError::MissingConnectionPath));
    }

    #[test]
    fn test_validate_all_short_circuits_on_first_failure() {
        let first = Cell::new(0);
        let second = Cell::new(0);
        let third = Cell::new(0);
        let failure = ConfigError::Conflict("second failed".to_string());

        let result = validate_all(&[
            &CountingValidator { calls: &first, result: Ok(()) },
            &CountingValidator { calls: &second, result: Err(failure.clone()) },
            &CountingValidator { calls: &third, result: Err(ConfigError::MissingConnectionPath) },
        ]);

        assert_eq!(result, Err(failure));
        assert_eq!((first.get(), second.get(), third.get()), (1, 1, 0));
    }

    #[test]
    fn test_first_failing_sub_option_error_is_returned_unmodified() {
        let mut options = valid_options();
        options.api_importer.resources_to_sync.clear();
        options.api_resource.num_threads = 0;

        match options.validate() {
            Err(ConfigError::InvalidFlag { flag, .. }) => assert_eq!(flag, "--resources-to-sync"),
            other => panic!("expected importer error, got {:?}", other),
        }
    }

    #[test]
    fn test_syncer_rejects_both_modes() {
        let syncer = SyncerOptions {
            pull_mode: true,
            push_mode: true,
            syncer_image: Some("syncer:latest".to_string()),
            ..valid_options().syncer
        };
        assert!(matches!(syncer.validate(), Err(ConfigError::Conflict(_))));
    }

    #[test]
    fn test_syncer_pull_mode_requires_image() {
        let mut syncer = SyncerOptions {
            pull_mode: true,
            ..valid_options().syncer
        };
        assert!(matches!(
            syncer.validate(),
            Err(ConfigError::InvalidFlag { flag: "--syncer-image", .. })
        ));

        syncer.syncer_image = Some("syncer:latest".to_string());
        assert_eq!(syncer.validate(), Ok(()));
        assert_eq!(syncer.mode(), SyncMode::Pull { image: "syncer:latest".to_string() });
    }

    #[test]
    fn test_sync_mode_selection() {
        let mut syncer = valid_options().syncer;
        assert_eq!(syncer.mode(), SyncMode::Disabled);
        syncer.push_mode = true;
        assert_eq!(syncer.mode(), SyncMode::Push);
    }

    #[test]
    fn test_parse_flags() {
        let options = Options::try_parse_from([
            "cluster-controller",
            "--kubeconfig",
            "admin.kubeconfig",
            "--resources-to-sync",
            "deployments.apps,services",
            "--apiresource-workers",
            "4",
            "--auto-publish-apis",
            "--push-mode",
        ])
        .unwrap();

        assert_eq!(options.kubeconfig_path, "admin.kubeconfig");
        assert_eq!(options.api_importer.resources_to_sync, vec!["deployments.apps", "services"]);
        assert_eq!(options.api_resource.num_threads, 4);
        assert!(options.api_resource.auto_publish_apis);
        assert_eq!(options.syncer.mode(), SyncMode::Push);
        assert_eq!(options.syncer.resources_to_sync, vec!["deployments.apps"]);
        assert_eq!(options.validate(), Ok(()));
    }

    #[test]
    fn test_importer_and_syncer_resource_flags_are_independent() {
        let options = Options::try_parse_from([
            "cluster-controller",
            "--resources-to-sync",
            "services",
            "--syncer-resources-to-sync",
            "deployments.apps,ingresses.networking.k8s.io",
            "--push-mode",
        ])
        .unwrap();

        assert_eq!(options.api_importer.resources_to_sync, vec!["services"]);
        assert_eq!(
            options.syncer.resources_to_sync,
            vec!["deployments.apps", "ingresses.networking.k8s.io"]
        );
    }

    #[test]
    fn test_parse_without_kubeconfig_fails_validation_not_parsing() {
        let options = Options::try_parse_from(["cluster-controller"]).unwrap();
        assert_eq!(options.validate(), Err(ConfigError::MissingConnectionPath));
    }

    #[test]
    fn test_unknown_flag_is_a_parse_error() {
        assert!(Options::try_parse_from(["cluster-controller", "--no-such-flag"]).is_err());
    }
}
