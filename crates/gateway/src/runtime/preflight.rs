//! Model preflight (§4.6, §5): confirm the target model is loaded on the
//! inference server before a turn is dispatched to the agent, with a short
//! TTL cache so a burst of turns against the same model doesn't hammer the
//! inference server's model-listing endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sd_domain::agent::InferenceClient;
use sd_domain::config::PreflightConfig;
use sd_domain::error::{Error, Result};

struct Cached {
    models: Vec<String>,
    at: Instant,
}

pub struct Preflight {
    client: Arc<dyn InferenceClient>,
    timeout: Duration,
    ttl: Duration,
    cache: Mutex<Option<Cached>>,
}

impl Preflight {
    pub fn new(client: Arc<dyn InferenceClient>, config: &PreflightConfig) -> Self {
        Self {
            client,
            timeout: Duration::from_millis(config.timeout_ms),
            ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: Mutex::new(None),
        }
    }

    async fn loaded_models(&self) -> Result<Vec<String>> {
        if let Some(cached) = self.cache.lock().as_ref() {
            if cached.at.elapsed() < self.ttl {
                return Ok(cached.models.clone());
            }
        }

        let models = tokio::time::timeout(self.timeout, self.client.list_loaded_models())
            .await
            .map_err(|_| Error::LmxTimeout)??;

        *self.cache.lock() = Some(Cached { models: models.clone(), at: Instant::now() });
        Ok(models)
    }

    /// Confirm `model` is loaded, returning the canonical loaded-model ID
    /// it matched (§4.6 "Canonicalize the session's model ID to the
    /// match"). No retries — a single timed attempt per §4.6 "fail fast
    /// with a coded `turn.error`". On failure the TTL cache is dropped so a
    /// closely-following retry (e.g. once the model finishes loading) isn't
    /// stuck behind a stale empty/mismatched result (§7 error table).
    pub async fn check(&self, model: &str) -> Result<String> {
        let models = self.loaded_models().await?;
        if let Some(exact) = models.iter().find(|m| *m == model) {
            return Ok(exact.clone());
        }
        if let Some(ci) = models.iter().find(|m| m.eq_ignore_ascii_case(model)) {
            return Ok(ci.clone());
        }
        *self.cache.lock() = None;
        Err(Error::NoModelLoaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeClient {
        models: Vec<String>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl InferenceClient for FakeClient {
        async fn list_loaded_models(&self) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.models.clone())
        }
    }

    fn config() -> PreflightConfig {
        PreflightConfig { timeout_ms: 1000, cache_ttl_secs: 10 }
    }

    #[tokio::test]
    async fn loaded_model_passes() {
        let client = Arc::new(FakeClient { models: vec!["llama".into()], calls: AtomicU64::new(0) });
        let pf = Preflight::new(client, &config());
        assert_eq!(pf.check("llama").await.unwrap(), "llama");
    }

    #[tokio::test]
    async fn case_insensitive_match_canonicalizes() {
        let client = Arc::new(FakeClient { models: vec!["Llama-3".into()], calls: AtomicU64::new(0) });
        let pf = Preflight::new(client, &config());
        assert_eq!(pf.check("llama-3").await.unwrap(), "Llama-3");
    }

    #[tokio::test]
    async fn missing_model_fails_with_no_model_loaded() {
        let client = Arc::new(FakeClient { models: vec!["llama".into()], calls: AtomicU64::new(0) });
        let pf = Preflight::new(client, &config());
        let err = pf.check("other").await.unwrap_err();
        assert!(matches!(err, Error::NoModelLoaded));
    }

    #[tokio::test]
    async fn second_check_within_ttl_does_not_requery() {
        let client = Arc::new(FakeClient { models: vec!["llama".into()], calls: AtomicU64::new(0) });
        let pf = Preflight::new(client.clone(), &config());
        pf.check("llama").await.unwrap();
        pf.check("llama").await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_surfaces_as_lmx_timeout() {
        struct SlowClient;
        #[async_trait]
        impl InferenceClient for SlowClient {
            async fn list_loaded_models(&self) -> Result<Vec<String>> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(vec![])
            }
        }
        let pf = Preflight::new(
            Arc::new(SlowClient),
            &PreflightConfig { timeout_ms: 10, cache_ttl_secs: 10 },
        );
        let err = pf.check("llama").await.unwrap_err();
        assert!(matches!(err, Error::LmxTimeout));
    }
}
