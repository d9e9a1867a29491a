use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use docvault_contracts::{QueryOutcome, SourceCandidate, SourceCitation, validate_principal_id};
use docvault_policy::AccessDecision;
use futures::StreamExt;
use tracing::Instrument;

mod content;
pub mod metrics;
mod policy_source;

pub use content::{BlobContentLoader, ContentError, ContentLoader};
pub use policy_source::{HttpPolicySource, MemoryPolicySource, PolicyFetchError, PolicySource};

pub const DEFAULT_MAX_FANOUT: usize = 20;
pub const DEFAULT_MAX_PARALLELISM: usize = 8;
pub const MAX_QUERY_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorError {
    message: String,
}

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CollaboratorError {}

#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    async fn search(&self, query: &str, k: usize)
    -> Result<Vec<SourceCandidate>, CollaboratorError>;
}

/// An authorized candidate together with its loaded text.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizedSource {
    pub candidate: SourceCandidate,
    pub content: String,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        query: &str,
        sources: &[AuthorizedSource],
    ) -> Result<String, CollaboratorError>;
}

#[derive(Debug)]
pub enum QueryError {
    InvalidInput(&'static str),
    Generation(CollaboratorError),
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::InvalidInput(reason) => write!(f, "invalid input: {}", reason),
            QueryError::Generation(err) => write!(f, "generation failed: {}", err),
        }
    }
}

impl std::error::Error for QueryError {}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub max_fanout: usize,
    pub max_parallelism: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_fanout: DEFAULT_MAX_FANOUT,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
        }
    }
}

pub struct AccessGatedPipeline {
    search: Arc<dyn SimilaritySearch>,
    policies: Arc<dyn PolicySource>,
    content: Arc<dyn ContentLoader>,
    generator: Arc<dyn Generator>,
    config: PipelineConfig,
}

impl AccessGatedPipeline {
    pub fn new(
        search: Arc<dyn SimilaritySearch>,
        policies: Arc<dyn PolicySource>,
        content: Arc<dyn ContentLoader>,
        generator: Arc<dyn Generator>,
        config: PipelineConfig,
    ) -> Self {
        metrics::register();
        Self {
            search,
            policies,
            content,
            generator,
            config: PipelineConfig {
                max_fanout: config.max_fanout.max(1),
                max_parallelism: config.max_parallelism.max(1),
            },
        }
    }

    /// Searches, authorizes every candidate for `principal_id`, and generates
    /// over the authorized subset only. Generation is never invoked when no
    /// candidate survives authorization and loading.
    pub async fn answer(
        &self,
        principal_id: &str,
        query: &str,
        k: usize,
    ) -> Result<QueryOutcome, QueryError> {
        let principal_id = principal_id.trim();
        validate_principal_id(principal_id).map_err(QueryError::InvalidInput)?;
        let query = query.trim();
        if query.is_empty() {
            return Err(QueryError::InvalidInput("query is required"));
        }
        if query.len() > MAX_QUERY_BYTES {
            return Err(QueryError::InvalidInput("query too long"));
        }
        if k == 0 {
            return Err(QueryError::InvalidInput("k must be at least 1"));
        }
        let k = k.min(self.config.max_fanout);

        let span = tracing::info_span!(
            "query.answer",
            principal_id = %principal_id,
            k,
            outcome = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        );
        let started = Instant::now();
        let result = self
            .answer_inner(principal_id, query, k)
            .instrument(span.clone())
            .await;

        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "ERROR",
        };
        let elapsed = started.elapsed();
        span.record("outcome", outcome);
        span.record("latency_ms", elapsed.as_millis() as u64);
        metrics::observe_outcome(outcome, elapsed);
        result
    }

    async fn answer_inner(
        &self,
        principal_id: &str,
        query: &str,
        k: usize,
    ) -> Result<QueryOutcome, QueryError> {
        let candidates = self.search_candidates(query, k).await;
        let candidate_count = candidates.len();

        let decisions = futures::stream::iter(candidates)
            .map(|candidate| async move {
                let decision = self.authorize(principal_id, &candidate).await;
                (candidate, decision)
            })
            .buffered(self.config.max_parallelism)
            .collect::<Vec<_>>()
            .await;

        let mut denied_count = 0usize;
        let mut authorized = Vec::with_capacity(decisions.len());
        for (candidate, decision) in decisions {
            if decision.allow {
                authorized.push(candidate);
            } else {
                denied_count += 1;
                metrics::observe_dropped("denied");
            }
        }

        let loaded = futures::stream::iter(authorized)
            .map(|candidate| async move {
                let loaded = self.content.load(&candidate).await;
                match loaded {
                    Ok(content) => Some(AuthorizedSource { candidate, content }),
                    Err(err) => {
                        metrics::observe_dropped("unavailable");
                        tracing::warn!(
                            event = "source_content_unavailable",
                            resource_id = %candidate.resource_id,
                            content_ref = %candidate.content_ref,
                            error = %err,
                            "dropping authorized source whose content could not be loaded"
                        );
                        None
                    }
                }
            })
            .buffered(self.config.max_parallelism)
            .collect::<Vec<_>>()
            .await;

        let unavailable_count = loaded.iter().filter(|s| s.is_none()).count();
        let sources = loaded.into_iter().flatten().collect::<Vec<_>>();

        tracing::debug!(
            candidate_count,
            denied_count,
            unavailable_count,
            authorized = sources.len(),
            "authorization complete"
        );

        if sources.is_empty() {
            return Ok(QueryOutcome::NoAccessibleSources {
                candidate_count,
                denied_count,
                unavailable_count,
            });
        }

        let answer = self
            .generator
            .generate(query, &sources)
            .await
            .map_err(QueryError::Generation)?;

        Ok(QueryOutcome::Answered {
            answer,
            sources: sources
                .iter()
                .map(|s| SourceCitation::from(&s.candidate))
                .collect(),
            candidate_count,
            denied_count,
            unavailable_count,
        })
    }

    async fn search_candidates(&self, query: &str, k: usize) -> Vec<SourceCandidate> {
        let mut candidates = match self.search.search(query, k).await {
            Ok(candidates) => candidates,
            Err(err) => {
                metrics::observe_dropped("search_failed");
                tracing::warn!(
                    event = "similarity_search_failed",
                    error = %err,
                    "similarity search failed; continuing with no candidates"
                );
                return Vec::new();
            }
        };

        candidates.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        candidates.truncate(k);
        candidates
    }

    async fn authorize(&self, principal_id: &str, candidate: &SourceCandidate) -> AccessDecision {
        let decision = match self.policies.fetch_policy(&candidate.resource_id).await {
            Ok(policy) => docvault_policy::evaluate(principal_id, policy.as_ref()),
            Err(err) => {
                tracing::warn!(
                    event = "policy_fetch_failed",
                    resource_id = %candidate.resource_id,
                    error = %err,
                    "access policy unavailable; denying candidate"
                );
                AccessDecision::unavailable()
            }
        };

        metrics::observe_authorization(decision.allow, decision.reason.as_str());
        tracing::debug!(
            resource_id = %candidate.resource_id,
            allow = decision.allow,
            reason = decision.reason.as_str(),
            "candidate authorization"
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use docvault_blobstore::MemoryBlobStore;
    use docvault_contracts::AccessPolicy;

    struct FixedSearch {
        candidates: Vec<SourceCandidate>,
        fail: bool,
    }

    #[async_trait]
    impl SimilaritySearch for FixedSearch {
        async fn search(
            &self,
            _query: &str,
            k: usize,
        ) -> Result<Vec<SourceCandidate>, CollaboratorError> {
            if self.fail {
                return Err(CollaboratorError::new("index offline"));
            }
            Ok(self.candidates.iter().take(k).cloned().collect())
        }
    }

    #[derive(Default)]
    struct RecordingGenerator {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for RecordingGenerator {
        async fn generate(
            &self,
            _query: &str,
            sources: &[AuthorizedSource],
        ) -> Result<String, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut seen = self.seen.lock().expect("seen lock");
            for source in sources {
                seen.push(source.content.clone());
            }
            Ok(format!("answer from {} sources", sources.len()))
        }
    }

    fn candidate(resource_id: &str, score: f64) -> SourceCandidate {
        SourceCandidate {
            content_ref: format!("blob-{resource_id}"),
            resource_id: resource_id.to_string(),
            owner_hint: None,
            title: Some(format!("{resource_id}.pdf")),
            relevance_score: score,
            preview_text: format!("preview of {resource_id}"),
        }
    }

    fn policy(resource_id: &str, owner: &str, is_public: bool, allowed: &[&str]) -> AccessPolicy {
        AccessPolicy {
            resource_id: resource_id.to_string(),
            owner: owner.to_string(),
            is_public,
            allowed_principals: allowed.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    struct Fixture {
        blobs: Arc<MemoryBlobStore>,
        policies: Arc<MemoryPolicySource>,
        generator: Arc<RecordingGenerator>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                blobs: Arc::new(MemoryBlobStore::new()),
                policies: Arc::new(MemoryPolicySource::new()),
                generator: Arc::new(RecordingGenerator::default()),
            }
        }

        fn with_content(self, resource_id: &str, text: &str) -> Self {
            self.blobs.insert(&format!("blob-{resource_id}"), text);
            self
        }

        fn pipeline(&self, search: FixedSearch) -> AccessGatedPipeline {
            AccessGatedPipeline::new(
                Arc::new(search),
                self.policies.clone(),
                Arc::new(BlobContentLoader::new(self.blobs.clone())),
                self.generator.clone(),
                PipelineConfig {
                    max_fanout: 10,
                    max_parallelism: 2,
                },
            )
        }
    }

    fn search_of(candidates: Vec<SourceCandidate>) -> FixedSearch {
        FixedSearch {
            candidates,
            fail: false,
        }
    }

    #[tokio::test]
    async fn allow_listed_principal_sees_private_document_and_outsider_does_not() {
        let fx = Fixture::new().with_content("doc-d", "quarterly numbers");
        fx.policies.insert(policy("doc-d", "0xp1", false, &["0xp2"]));
        let pipeline = fx.pipeline(search_of(vec![candidate("doc-d", 0.9)]));

        let allowed = pipeline.answer("0xp2", "numbers?", 5).await.expect("answer");
        match allowed {
            QueryOutcome::Answered {
                sources,
                denied_count,
                ..
            } => {
                assert_eq!(sources.len(), 1);
                assert_eq!(sources[0].resource_id, "doc-d");
                assert_eq!(denied_count, 0);
            }
            other => panic!("expected answer, got {:?}", other),
        }
        assert_eq!(
            fx.generator.seen.lock().expect("seen").clone(),
            vec!["quarterly numbers".to_string()]
        );

        let denied = pipeline.answer("0xp3", "numbers?", 5).await.expect("answer");
        assert_eq!(
            denied,
            QueryOutcome::NoAccessibleSources {
                candidate_count: 1,
                denied_count: 1,
                unavailable_count: 0,
            }
        );
        assert_eq!(fx.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn generator_only_sees_authorized_content() {
        let fx = Fixture::new()
            .with_content("doc-own", "mine")
            .with_content("doc-public", "everyone")
            .with_content("doc-legacy", "old upload")
            .with_content("doc-secret", "not yours");
        fx.policies.insert(policy("doc-own", "0xp1", false, &[]));
        fx.policies.insert(policy("doc-public", "0xother", true, &[]));
        fx.policies.insert(policy("doc-secret", "0xother", false, &["0xp9"]));
        let pipeline = fx.pipeline(search_of(vec![
            candidate("doc-secret", 0.99),
            candidate("doc-own", 0.5),
            candidate("doc-public", 0.7),
            candidate("doc-legacy", 0.6),
        ]));

        let outcome = pipeline.answer("0xp1", "anything", 10).await.expect("answer");
        let QueryOutcome::Answered {
            sources,
            candidate_count,
            denied_count,
            ..
        } = outcome
        else {
            panic!("expected an answer");
        };
        assert_eq!(candidate_count, 4);
        assert_eq!(denied_count, 1);
        let cited = sources.iter().map(|s| s.resource_id.as_str()).collect::<Vec<_>>();
        assert_eq!(cited, vec!["doc-public", "doc-legacy", "doc-own"]);

        let seen = fx.generator.seen.lock().expect("seen").clone();
        assert!(!seen.iter().any(|c| c.contains("not yours")));
    }

    #[tokio::test]
    async fn policy_lookup_failure_denies_and_skips_generation() {
        let fx = Fixture::new().with_content("doc-x", "text");
        fx.policies.set_unavailable("doc-x");
        let pipeline = fx.pipeline(search_of(vec![candidate("doc-x", 0.4)]));

        let outcome = pipeline.answer("0xp1", "q", 3).await.expect("answer");
        assert_eq!(outcome.denied_count(), 1);
        assert_eq!(outcome.as_str(), "NO_ACCESSIBLE_SOURCES");
        assert_eq!(fx.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unloadable_source_is_dropped_and_counted() {
        let fx = Fixture::new().with_content("doc-ok", "fine");
        let pipeline = fx.pipeline(search_of(vec![
            candidate("doc-ok", 0.8),
            candidate("doc-gone", 0.9),
        ]));

        let outcome = pipeline.answer("0xp1", "q", 5).await.expect("answer");
        match outcome {
            QueryOutcome::Answered {
                sources,
                unavailable_count,
                denied_count,
                ..
            } => {
                assert_eq!(sources.len(), 1);
                assert_eq!(sources[0].resource_id, "doc-ok");
                assert_eq!(unavailable_count, 1);
                assert_eq!(denied_count, 0);
            }
            other => panic!("expected answer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn search_failure_is_zero_candidates() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(FixedSearch {
            candidates: Vec::new(),
            fail: true,
        });

        let outcome = pipeline.answer("0xp1", "q", 5).await.expect("answer");
        assert_eq!(
            outcome,
            QueryOutcome::NoAccessibleSources {
                candidate_count: 0,
                denied_count: 0,
                unavailable_count: 0,
            }
        );
        assert_eq!(fx.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fanout_is_clamped_to_configured_maximum() {
        let fx = Fixture::new();
        let many = (0..15)
            .map(|i| {
                let id = format!("doc-{i}");
                fx.blobs.insert(&format!("blob-{id}"), "text");
                candidate(&id, i as f64)
            })
            .collect::<Vec<_>>();
        let pipeline = fx.pipeline(search_of(many));

        let outcome = pipeline.answer("0xp1", "q", 100).await.expect("answer");
        let QueryOutcome::Answered { candidate_count, .. } = outcome else {
            panic!("expected an answer");
        };
        assert_eq!(candidate_count, 10);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_search() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(search_of(vec![candidate("doc-a", 1.0)]));

        for (principal, query, k) in [("", "q", 1), ("0xp1", "   ", 1), ("0xp1", "q", 0)] {
            assert!(matches!(
                pipeline.answer(principal, query, k).await,
                Err(QueryError::InvalidInput(_))
            ));
        }
        assert_eq!(fx.generator.calls.load(Ordering::SeqCst), 0);
    }
}
