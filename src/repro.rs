//! Orchestrator
//! Starts one proxy engine per mapping and reports the first fatal error

use crate::config::Config;
use crate::error::{ReproError, Result};
use crate::proxy::ProxyEngine;
use crate::upstream::UpstreamConnector;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};

/// Owns the configuration shared by every engine
pub struct Repro {
    config: Arc<Config>,
    upstream: UpstreamConnector,
}

impl Repro {
    /// Create an orchestrator; at least one mapping is required
    pub fn new(config: Config) -> Result<Self> {
        if config.count_mappings() == 0 {
            return Err(ReproError::config_invalid("no mappings configured"));
        }

        let upstream = UpstreamConnector::new(config.ssl_allow_insecure());

        Ok(Self {
            config: Arc::new(config),
            upstream,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Launch every engine concurrently.
    ///
    /// Failed listeners are not restarted.
    pub fn start(&self) -> Completion {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        for mapping in self.config.mappings() {
            let engine = ProxyEngine::new(self.config.clone(), mapping.clone(), self.upstream.clone());
            let tx = tx.clone();

            info!("Starting proxy {} -> {}://{}", mapping.local(), mapping.scheme(), mapping.remote());

            tokio::spawn(async move {
                if let Err(e) = engine.run().await {
                    error!("Proxy listener stopped: {}", e);
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(e);
                    }
                }
            });
        }

        Completion { rx }
    }
}

/// Single notification of the first fatal listener error
pub struct Completion {
    rx: oneshot::Receiver<ReproError>,
}

impl Completion {
    /// Resolves with the first fatal error; stays pending while all listeners are up.
    /// Returns `Ok(())` only if every listener went away without reporting.
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_zero_mappings_rejected() {
        let err = Repro::new(Config::new()).err().unwrap();
        assert!(matches!(err, ReproError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut config = Config::new();
        config
            .add_mapping(&format!("127.0.0.1:{}", port), "http", "backend.internal:8080")
            .unwrap();

        let repro = Repro::new(config).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), repro.start().wait())
            .await
            .expect("bind failure should be reported promptly");

        assert!(matches!(result, Err(ReproError::ListenerBindFailure { .. })));
    }

    #[tokio::test]
    async fn test_healthy_listeners_keep_completion_pending() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let mut config = Config::new();
        config
            .add_mapping(&format!("127.0.0.1:{}", port), "http", "backend.internal:8080")
            .unwrap();

        let repro = Repro::new(config).unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(300), repro.start().wait()).await;

        assert!(pending.is_err());
    }
}
