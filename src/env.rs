//! Process identity read from the environment.

use std::env;

/// Port the ingress listens on when `INGRESS_PORT` is unset.
pub const DEFAULT_PORT: u16 = 8080;

/// Namespace holding the configuration objects when `SYSTEM_NAMESPACE` is unset.
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "knative-eventing";

/// Identity and listen port of this ingress replica.
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Name of the pod running this process (`POD_NAME`).
    pub pod_name: String,
    /// Name of the container running this process (`CONTAINER_NAME`).
    pub container_name: String,
    /// Port the ingress serves on (`INGRESS_PORT`).
    pub port: u16,
    /// Namespace of the configuration objects (`SYSTEM_NAMESPACE`).
    pub system_namespace: String,
}

impl EnvironmentConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, EnvError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of a variable if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EnvError> {
        let get = |key: &'static str| lookup(key).filter(|value| !value.is_empty());

        let pod_name = get("POD_NAME").ok_or(EnvError::Missing("POD_NAME"))?;
        let container_name = get("CONTAINER_NAME").ok_or(EnvError::Missing("CONTAINER_NAME"))?;
        let port = match get("INGRESS_PORT") {
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => return Err(EnvError::Malformed { key: "INGRESS_PORT", value: raw }),
            },
            None => DEFAULT_PORT,
        };
        let system_namespace =
            get("SYSTEM_NAMESPACE").unwrap_or_else(|| DEFAULT_SYSTEM_NAMESPACE.to_owned());

        Ok(Self {
            pod_name,
            container_name,
            port,
            system_namespace,
        })
    }
}

/// The error type returned by [`EnvironmentConfig::from_env`].
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("environment variable {key} has malformed value {value:?}")]
    Malformed { key: &'static str, value: String },
}
