//! Resolution of the credentials used to reach the apiserver.

use std::path::PathBuf;

use kube_client::config::{KubeConfigOptions, Kubeconfig};
use kube_client::{Client, Config};

/// Where to find the apiserver and the credentials to talk to it.
///
/// With neither field set, the in-cluster service account (or the default kubeconfig) is used.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Overrides the apiserver URL found in the kubeconfig.
    pub master_url: Option<String>,
    /// Path to a kubeconfig file.
    pub kubeconfig: Option<PathBuf>,
}

impl ClusterConfig {
    /// Resolves the client configuration.
    pub async fn resolve(&self) -> Result<Config, ClusterError> {
        let mut config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig =
                    Kubeconfig::read_from(path).map_err(|err| ClusterError::Kubeconfig {
                    path: path.clone(),
                    reason: err.to_string(),
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|err| ClusterError::Kubeconfig {
                        path: path.clone(),
                        reason: err.to_string(),
                    })?
            }
            None => Config::infer()
                .await
                .map_err(|err| ClusterError::Infer(err.to_string()))?,
        };

        if let Some(master) = &self.master_url {
            config.cluster_url = master.parse().map_err(|err| ClusterError::MasterUrl {
                url: master.clone(),
                reason: format!("{err}"),
            })?;
        }

        log::debug!("Resolved apiserver at {}", config.cluster_url);
        Ok(config)
    }

    /// Resolves the configuration and builds a client from it.
    pub async fn client(&self) -> Result<Client, ClusterError> {
        let config = self.resolve().await?;
        Client::try_from(config).map_err(ClusterError::Client)
    }
}

/// The error type returned by [`ClusterConfig::client`].
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cannot load kubeconfig {path:?}: {reason}")]
    Kubeconfig { path: PathBuf, reason: String },
    #[error("cannot infer cluster configuration: {0}")]
    Infer(String),
    #[error("invalid master URL {url:?}: {reason}")]
    MasterUrl { url: String, reason: String },
    #[error("cannot build cluster client: {0}")]
    Client(#[source] kube_client::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_kubeconfig_is_fatal() {
        let config = ClusterConfig {
            master_url: None,
            kubeconfig: Some(PathBuf::from("/nonexistent/kubeconfig")),
        };

        let err = config.resolve().await.unwrap_err();
        assert!(matches!(err, ClusterError::Kubeconfig { .. }));
    }
}
