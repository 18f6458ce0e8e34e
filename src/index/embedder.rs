use crate::config::Settings;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum EmbedderError {
    #[error("transient embedder failure: {0}")]
    Transient(String),
    #[error("permanent embedder failure: {0}")]
    Permanent(String),
    #[error("embedder returned {returned} vectors for {requested} inputs")]
    CountMismatch { requested: usize, returned: usize },
}

impl EmbedderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedderError::Transient(_))
    }
}

/// Black-box embedding capability: one vector per input text, or a
/// transient/permanent failure classification.
pub trait EmbedderClient {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.embed_retry_attempts,
            base_backoff: Duration::from_millis(settings.embed_backoff_base_ms),
        }
    }

    /// Delay before retry number `retry` (1-based): base doubling each
    /// attempt.
    pub fn backoff_before(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(250),
        }
    }
}

/// Wraps a client with the retry/backoff policy. Transient failures
/// are retried up to `max_retries` times; permanent failures and
/// exhausted retries surface to the caller.
pub struct EmbedderGateway<C> {
    client: C,
    policy: RetryPolicy,
    sleeper: fn(Duration),
}

impl<C: EmbedderClient> EmbedderGateway<C> {
    pub fn new(client: C, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            sleeper: std::thread::sleep,
        }
    }

    pub fn with_sleeper(mut self, sleeper: fn(Duration)) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut retry = 0u32;
        loop {
            match self.client.embed_batch(texts) {
                Ok(vectors) => {
                    if vectors.len() != texts.len() {
                        return Err(EmbedderError::CountMismatch {
                            requested: texts.len(),
                            returned: vectors.len(),
                        });
                    }
                    return Ok(vectors);
                }
                Err(err) if err.is_transient() && retry < self.policy.max_retries => {
                    retry += 1;
                    (self.sleeper)(self.policy.backoff_before(retry));
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut vectors = self.embed_batch(&[text.to_string()])?;
        vectors.pop().ok_or(EmbedderError::CountMismatch {
            requested: 1,
            returned: 0,
        })
    }
}

const HASH_EMBEDDING_DIM: usize = 64;

/// Deterministic token-hash embedding. No external service; serves
/// tests and offline deployments. Vectors are L2-normalized.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedderClient {
    dim: usize,
}

impl HashEmbedderClient {
    pub fn new() -> Self {
        Self {
            dim: HASH_EMBEDDING_DIM,
        }
    }

    pub fn with_dim(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashEmbedderClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbedderClient for HashEmbedderClient {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(texts.iter().map(|text| hash_embed(text, self.dim)).collect())
    }
}

fn hash_embed(text: &str, dim: usize) -> Vec<f32> {
    let mut out = vec![0.0_f32; dim];
    for token in text
        .split_whitespace()
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
    {
        let hash = stable_hash(token.as_bytes());
        let idx = (hash as usize) % dim;
        let sign = if hash & 1 == 0 { 1.0_f32 } else { -1.0_f32 };
        let mag = 1.0_f32 + (token.len() as f32 / 32.0_f32);
        out[idx] += sign * mag;
    }

    let norm = out.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in &mut out {
            *value /= norm;
        }
    }
    out
}

fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325_u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3_u64);
    }
    hash
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embeddings: Vec<Vec<f32>>,
}

/// JSON-over-HTTP embedding client: POST `{"inputs": [...]}` to the
/// configured endpoint, expect `{"embeddings": [[...], ...]}`.
#[derive(Debug, Clone)]
pub struct HttpEmbedderClient {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpEmbedderClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Option<Self> {
        settings.embedder_endpoint.as_ref().map(|endpoint| {
            Self::new(
                endpoint.clone(),
                Duration::from_secs(settings.embedder_timeout_seconds),
            )
        })
    }
}

impl EmbedderClient for HttpEmbedderClient {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(serde_json::json!({ "inputs": texts }));

        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                let message = format!("embedder endpoint returned {code}: {body}");
                // Rate limits and server-side errors are worth retrying;
                // everything else in the 4xx range is a caller bug.
                if code == 429 || (500..600).contains(&code) {
                    return Err(EmbedderError::Transient(message));
                }
                return Err(EmbedderError::Permanent(message));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(EmbedderError::Transient(format!(
                    "embedder transport failure: {transport}"
                )));
            }
        };

        let parsed: EmbeddingsResponse = response
            .into_json()
            .map_err(|err| EmbedderError::Permanent(format!("embedder response parse: {err}")))?;
        Ok(parsed.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FlakyClient {
        failures_before_success: Cell<u32>,
        calls: Cell<u32>,
    }

    impl EmbedderClient for FlakyClient {
        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
            self.calls.set(self.calls.get() + 1);
            if self.failures_before_success.get() > 0 {
                self.failures_before_success
                    .set(self.failures_before_success.get() - 1);
                return Err(EmbedderError::Transient("upstream timeout".to_string()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn no_sleep(_: Duration) {}

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff_before(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_before(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_before(3), Duration::from_millis(400));
    }

    #[test]
    fn transient_failures_retry_up_to_policy() {
        let client = FlakyClient {
            failures_before_success: Cell::new(2),
            calls: Cell::new(0),
        };
        let gateway = EmbedderGateway::new(client, RetryPolicy::default()).with_sleeper(no_sleep);
        let vectors = gateway
            .embed_batch(&["a".to_string(), "b".to_string()])
            .expect("succeeds after retries");
        assert_eq!(vectors.len(), 2);
        assert_eq!(gateway.client.calls.get(), 3);
    }

    #[test]
    fn exhausted_retries_surface_the_transient_error() {
        let client = FlakyClient {
            failures_before_success: Cell::new(10),
            calls: Cell::new(0),
        };
        let gateway = EmbedderGateway::new(client, RetryPolicy::default()).with_sleeper(no_sleep);
        let err = gateway
            .embed_batch(&["a".to_string()])
            .expect_err("must fail");
        assert!(err.is_transient());
        // 1 initial attempt + 3 retries.
        assert_eq!(gateway.client.calls.get(), 4);
    }

    #[test]
    fn permanent_failures_do_not_retry() {
        struct PermanentClient {
            calls: Cell<u32>,
        }
        impl EmbedderClient for PermanentClient {
            fn embed_batch(&self, _: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
                self.calls.set(self.calls.get() + 1);
                Err(EmbedderError::Permanent("bad request".to_string()))
            }
        }
        let gateway = EmbedderGateway::new(
            PermanentClient {
                calls: Cell::new(0),
            },
            RetryPolicy::default(),
        )
        .with_sleeper(no_sleep);
        let err = gateway
            .embed_batch(&["a".to_string()])
            .expect_err("must fail");
        assert!(!err.is_transient());
        assert_eq!(gateway.client.calls.get(), 1);
    }

    #[test]
    fn hash_embedder_is_deterministic_and_normalized() {
        let client = HashEmbedderClient::new();
        let first = client
            .embed_batch(&["the quick brown fox".to_string()])
            .expect("embed");
        let second = client
            .embed_batch(&["the quick brown fox".to_string()])
            .expect("embed");
        assert_eq!(first, second);
        let norm: f32 = first[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_batch_short_circuits() {
        let gateway =
            EmbedderGateway::new(HashEmbedderClient::new(), RetryPolicy::default());
        assert!(gateway.embed_batch(&[]).expect("ok").is_empty());
    }
}
