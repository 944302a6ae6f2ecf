use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::{ProviderError, ProviderResult, Verifiable};

/// Everything that shapes a cloud client. Two configs that compare equal
/// must produce interchangeable clients.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub region: String,
    pub endpoint: Option<String>,
    pub max_error_retry: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        // Default SDK clients have no overall timeout; a stalled control plane
        // would hang an allocation forever.
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            max_error_retry: 3,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(20),
        }
    }
}

type Factory<T> = Box<dyn Fn(&ClientConfig) -> ProviderResult<Arc<T>> + Send + Sync>;

/// Lazily builds, memoizes and (once) verifies a client of one type.
///
/// The first successful initialization fixes the configuration for the rest
/// of the process. Asking again with a different configuration is a
/// programming error and fails with [`ProviderError::ConfigurationChanged`].
pub struct ClientProvider<T: ?Sized> {
    name: &'static str,
    factory: Factory<T>,
    client: OnceCell<(ClientConfig, Arc<T>)>,
    verified: OnceCell<()>,
}

impl<T: ?Sized + Verifiable> ClientProvider<T> {
    pub fn new(
        name: &'static str,
        factory: impl Fn(&ClientConfig) -> ProviderResult<Arc<T>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            factory: Box::new(factory),
            client: OnceCell::new(),
            verified: OnceCell::new(),
        }
    }

    pub async fn get_client(&self, config: &ClientConfig, verify: bool) -> ProviderResult<Arc<T>> {
        let (stored, client) = self
            .client
            .get_or_try_init(|| async {
                let client = (self.factory)(config)?;
                info!(
                    client = self.name,
                    region = %config.region,
                    endpoint = ?config.endpoint,
                    "[ClientProvider] client initialized"
                );
                Ok::<_, ProviderError>((config.clone(), client))
            })
            .await?;

        if stored != config {
            error!(
                client = self.name,
                configured_region = %stored.region,
                requested_region = %config.region,
                "[ClientProvider] client requested with a different configuration"
            );
            return Err(ProviderError::ConfigurationChanged);
        }

        if verify {
            self.verified
                .get_or_try_init(|| async {
                    client.verify_access().await?;
                    info!(client = self.name, "[ClientProvider] credentials verified");
                    Ok::<_, ProviderError>(())
                })
                .await?;
        }

        Ok(client.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.client.initialized()
    }

    pub fn is_verified(&self) -> bool {
        self.verified.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        verify_calls: Arc<AtomicUsize>,
        fail_verify: bool,
    }

    #[async_trait]
    impl Verifiable for CountingClient {
        async fn verify_access(&self) -> ProviderResult<()> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_verify {
                return Err(ProviderError::api(crate::codes::UNAUTHORIZED, "bad credentials"));
            }
            Ok(())
        }
    }

    fn provider(
        builds: Arc<AtomicUsize>,
        verify_calls: Arc<AtomicUsize>,
        fail_verify: bool,
    ) -> ClientProvider<CountingClient> {
        ClientProvider::new("compute", move |_cfg| {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingClient {
                verify_calls: verify_calls.clone(),
                fail_verify,
            }))
        })
    }

    #[tokio::test]
    async fn builds_and_verifies_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let verifies = Arc::new(AtomicUsize::new(0));
        let p = provider(builds.clone(), verifies.clone(), false);
        let cfg = ClientConfig::default();

        let a = p.get_client(&cfg, true).await.unwrap();
        let b = p.get_client(&cfg, true).await.unwrap();
        let _c = p.get_client(&cfg, false).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(verifies.load(Ordering::SeqCst), 1);
        assert!(p.is_verified());
    }

    #[tokio::test]
    async fn different_config_is_rejected() {
        let p = provider(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)), false);
        p.get_client(&ClientConfig::default(), false).await.unwrap();

        let other = ClientConfig {
            region: "eu-west-1".to_string(),
            ..ClientConfig::default()
        };
        let err = p.get_client(&other, false).await.err().unwrap();
        assert!(matches!(err, ProviderError::ConfigurationChanged));
    }

    #[tokio::test]
    async fn failed_verification_is_retried_on_next_call() {
        let verifies = Arc::new(AtomicUsize::new(0));
        let p = provider(Arc::new(AtomicUsize::new(0)), verifies.clone(), true);
        let cfg = ClientConfig::default();

        assert!(p.get_client(&cfg, true).await.is_err());
        assert!(p.get_client(&cfg, true).await.is_err());
        assert!(p.is_initialized());
        assert!(!p.is_verified());
        assert_eq!(verifies.load(Ordering::SeqCst), 2);
    }
}
