//! Public entry points for the classification and coaching pipelines.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStore, Flight, InMemoryCache, SingleFlight, cache_key};
use crate::config::{BridgeConfig, PipelineConfig};
use crate::error::{BridgeError, ProcessingError};
use crate::fallback;
use crate::invoker::{Invoker, ScriptInvoker};
use crate::metrics::{self, InMemoryMetrics, MetricsSink};
use crate::model::AnalysisResponse;
use crate::pool::WorkerPool;
use crate::request::AnalysisRequest;
use crate::retry::RetryCoordinator;

/// Metric names and log wording for one pipeline variant
struct PipelineLabels {
    name: &'static str,
    success: &'static str,
    failure: &'static str,
    duration: &'static str,
    error_context: &'static str,
}

const FEEDBACK: PipelineLabels = PipelineLabels {
    name: "feedback",
    success: metrics::FEEDBACK_SUCCESS,
    failure: metrics::FEEDBACK_FAILURE,
    duration: metrics::FEEDBACK_DURATION,
    error_context: "feedback processing failed",
};

const COACHING: PipelineLabels = PipelineLabels {
    name: "coaching",
    success: metrics::COACHING_SUCCESS,
    failure: metrics::COACHING_FAILURE,
    duration: metrics::COACHING_DURATION,
    error_context: "coaching generation failed",
};

pub struct AnalysisService {
    config: BridgeConfig,
    retry: RetryCoordinator,
    cache: Arc<dyn CacheStore>,
    metrics: Arc<dyn MetricsSink>,
    inflight: SingleFlight<AnalysisResponse>,
    pool: WorkerPool,
}

impl AnalysisService {
    pub fn new(config: BridgeConfig) -> Self {
        let invoker = Arc::new(ScriptInvoker::from_config(&config.process));
        let cache = Arc::new(InMemoryCache::new(config.cache.max_entries));
        Self::with_parts(config, invoker, cache, Arc::new(InMemoryMetrics::new()))
    }

    /// Assemble a service from explicit collaborators.
    pub fn with_parts(
        config: BridgeConfig,
        invoker: Arc<dyn Invoker>,
        cache: Arc<dyn CacheStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let retry = RetryCoordinator::new(invoker, config.retry.base_delay());
        let pool = WorkerPool::from_config(&config.pool);
        Self {
            config,
            retry,
            cache,
            metrics,
            inflight: SingleFlight::new(),
            pool,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// `prefix_` followed by 8 random hex characters.
    pub fn correlation_id(prefix: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        format!("{}_{}", prefix, &token[..8])
    }

    fn request_for(
        pipeline: &PipelineConfig,
        payload: impl Into<String>,
        correlation_id: &str,
    ) -> AnalysisRequest {
        AnalysisRequest::new(&pipeline.script, payload)
            .with_correlation_id(correlation_id)
            .with_max_retries(pipeline.max_retries)
            .with_timeout_secs(pipeline.timeout_secs)
    }

    pub async fn process_feedback(&self, text: &str, context: Option<&str>) -> AnalysisResponse {
        self.process_feedback_with_cancel(text, context, &CancellationToken::new())
            .await
    }

    /// Classify feedback text. Short texts are served from the cache, and
    /// identical concurrent calls launch at most one process.
    pub async fn process_feedback_with_cancel(
        &self,
        text: &str,
        context: Option<&str>,
        cancel: &CancellationToken,
    ) -> AnalysisResponse {
        let cid = Self::correlation_id(FEEDBACK.name);
        let request = Self::request_for(&self.config.pipelines.feedback, text, &cid)
            .with_context(context);

        if text.chars().count() >= self.config.cache.max_text_chars {
            debug!("Feedback text too long for cache (correlation_id: {})", cid);
            return self.run(&request, &FEEDBACK, cancel).await;
        }

        let key = cache_key(text, context);
        if let Some(hit) = self.cache.get(&key).await {
            debug!("Cache hit {} (correlation_id: {})", key, cid);
            return hit;
        }

        let leader = loop {
            let follower = match self.inflight.join(&key) {
                Flight::Leader(leader) => break leader,
                Flight::Follower(follower) => follower,
            };
            let shared = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let err = ProcessingError::cancelled(&cid).with_pipeline(&request.script_id);
                    self.metrics.increment(FEEDBACK.failure);
                    return AnalysisResponse::from_error(FEEDBACK.error_context, &err);
                }
                shared = follower.outcome() => shared,
            };
            // No value means the leader was dropped mid-run; try to lead.
            if let Some(response) = shared {
                debug!(
                    "Reusing in-flight result for {} (correlation_id: {})",
                    key, cid
                );
                return response;
            }
        };

        // A previous leader may have filled the entry before we joined.
        if let Some(hit) = self.cache.get(&key).await {
            debug!("Cache hit after join {} (correlation_id: {})", key, cid);
            leader.complete(hit.clone());
            return hit;
        }

        let response = self.run(&request, &FEEDBACK, cancel).await;
        if response.success {
            self.cache
                .put(&key, response.clone(), self.config.cache.ttl())
                .await;
        }
        // A cancelled leader publishes nothing so waiters run for themselves.
        if !cancel.is_cancelled() {
            leader.complete(response.clone());
        }
        response
    }

    pub async fn generate_coaching<T: Serialize + ?Sized>(&self, packet: &T) -> AnalysisResponse {
        self.generate_coaching_with_cancel(packet, &CancellationToken::new())
            .await
    }

    /// Run the coaching pipeline on a serialized context packet.
    pub async fn generate_coaching_with_cancel<T: Serialize + ?Sized>(
        &self,
        packet: &T,
        cancel: &CancellationToken,
    ) -> AnalysisResponse {
        let cid = Self::correlation_id(COACHING.name);
        let payload = match serde_json::to_string(packet) {
            Ok(json) => json,
            Err(e) => {
                let err = BridgeError::from(e);
                error!("{} (correlation_id: {}): {}", COACHING.error_context, cid, err);
                self.metrics.increment(COACHING.failure);
                return AnalysisResponse::failure(
                    format!("{}: {}", COACHING.error_context, err),
                    cid,
                )
                .with_error_type("Serialization");
            }
        };

        let request = Self::request_for(&self.config.pipelines.coaching, payload, &cid);
        self.run(&request, &COACHING, cancel).await
    }

    async fn run(
        &self,
        request: &AnalysisRequest,
        labels: &PipelineLabels,
        cancel: &CancellationToken,
    ) -> AnalysisResponse {
        let cid = request.correlation_id();
        let started = Instant::now();
        info!("{} pipeline started (correlation_id: {})", labels.name, cid);

        let response = match self.retry.execute_with_retry(request, cancel).await {
            Ok(response) if response.success => {
                self.metrics.increment(labels.success);
                info!(
                    "{} pipeline completed: {} entries, {} tags, card={} (correlation_id: {})",
                    labels.name,
                    response.classification_entries().len(),
                    response.legacy_tags().len(),
                    response
                        .coaching_card()
                        .map(|c| format!("{:.2}", c.confidence_score))
                        .unwrap_or_else(|| "n/a".to_string()),
                    cid
                );
                response
            }
            Ok(response) => {
                self.metrics.increment(labels.failure);
                warn!(
                    "{} pipeline reported failure: {} (correlation_id: {})",
                    labels.name,
                    response.error_message.as_deref().unwrap_or("unknown error"),
                    cid
                );
                response
            }
            Err(err) => {
                self.metrics.increment(labels.failure);
                error!(
                    "{} pipeline error [{}] (correlation_id: {}): {}",
                    labels.name, err.kind, cid, err
                );
                AnalysisResponse::from_error(labels.error_context, &err)
            }
        };

        self.metrics
            .record_duration(labels.duration, started.elapsed().as_millis() as u64);
        response
    }

    /// Run feedback classification on the worker pool.
    pub async fn process_feedback_async(
        self: &Arc<Self>,
        text: String,
        context: Option<String>,
    ) -> AnalysisResponse {
        let service = Arc::clone(self);
        let submitted = self.pool.submit(move |cancel| async move {
            service
                .process_feedback_with_cancel(&text, context.as_deref(), &cancel)
                .await
        });
        Self::join(submitted, FEEDBACK.name).await
    }

    /// Run coaching generation on the worker pool.
    pub async fn generate_coaching_async(
        self: &Arc<Self>,
        packet: serde_json::Value,
    ) -> AnalysisResponse {
        let service = Arc::clone(self);
        let submitted = self.pool.submit(move |cancel| async move {
            service.generate_coaching_with_cancel(&packet, &cancel).await
        });
        Self::join(submitted, COACHING.name).await
    }

    async fn join(
        submitted: crate::error::Result<tokio::task::JoinHandle<AnalysisResponse>>,
        prefix: &str,
    ) -> AnalysisResponse {
        let handle = match submitted {
            Ok(handle) => handle,
            Err(e) => {
                let cid = Self::correlation_id(prefix);
                warn!("{} submission rejected (correlation_id: {}): {}", prefix, cid, e);
                let error_type = match e {
                    BridgeError::PoolSaturated { .. } => "PoolSaturated",
                    BridgeError::PoolClosed => "PoolClosed",
                    _ => "Internal",
                };
                return AnalysisResponse::failure(e.to_string(), cid).with_error_type(error_type);
            }
        };

        match handle.await {
            Ok(response) => response,
            Err(e) => {
                let cid = Self::correlation_id(prefix);
                error!("{} worker task failed (correlation_id: {}): {}", prefix, cid, e);
                AnalysisResponse::failure(format!("worker task failed: {e}"), cid)
                    .with_error_type("Internal")
            }
        }
    }

    /// Classification with the keyword fallback when the pipeline fails.
    pub async fn process_feedback_or_fallback(
        &self,
        text: &str,
        context: Option<&str>,
    ) -> AnalysisResponse {
        let response = self.process_feedback(text, context).await;
        if response.success {
            return response;
        }
        warn!(
            "Falling back to keyword extraction: {} (correlation_id: {})",
            response.error_message.as_deref().unwrap_or("unknown error"),
            response.correlation_id
        );
        self.fallback_keyword_extraction(text, &response.correlation_id)
    }

    pub fn validate_feedback_result(&self, response: &AnalysisResponse) -> bool {
        if !response.success {
            return false;
        }
        let entries = response.classification_entries();
        if entries.is_empty() {
            warn!(
                "Feedback result has no classification entries (correlation_id: {})",
                response.correlation_id
            );
            return false;
        }
        if let Some(bad) = entries.iter().find(|e| !e.is_valid()) {
            warn!(
                "Invalid classification entry {:?} (correlation_id: {})",
                bad.keyword, response.correlation_id
            );
            return false;
        }
        true
    }

    /// Low confidence is logged, not rejected.
    pub fn validate_coaching_result(&self, response: &AnalysisResponse) -> bool {
        if !response.success {
            return false;
        }
        let Some(card) = response.coaching_card() else {
            warn!(
                "Coaching result has no card (correlation_id: {})",
                response.correlation_id
            );
            return false;
        };
        if !card.is_valid() {
            warn!(
                "Invalid coaching card (correlation_id: {})",
                response.correlation_id
            );
            return false;
        }
        if !card.is_high_confidence() {
            warn!(
                "Low-confidence coaching card: {:.2} (correlation_id: {})",
                card.confidence_score, response.correlation_id
            );
        }
        true
    }

    pub fn fallback_keyword_extraction(&self, text: &str, correlation_id: &str) -> AnalysisResponse {
        info!(
            "Using fallback keyword extraction (correlation_id: {})",
            correlation_id
        );
        fallback::basic_analysis(text, correlation_id)
    }

    /// Run the reserved health-check script against the pipeline host.
    pub async fn is_healthy(&self) -> bool {
        let health = &self.config.pipelines.health;
        let cid = Self::correlation_id("health");
        let request = AnalysisRequest::new(&health.script, &health.input)
            .with_correlation_id(&cid)
            .with_timeout_secs(health.timeout_secs)
            .without_retries();

        match self
            .retry
            .execute_with_retry(&request, &CancellationToken::new())
            .await
        {
            Ok(response) if response.success => {
                debug!("Health check passed (correlation_id: {})", cid);
                true
            }
            Ok(response) => {
                warn!(
                    "Health check failed: {} (correlation_id: {})",
                    response.error_message.as_deref().unwrap_or("unknown error"),
                    cid
                );
                false
            }
            Err(err) => {
                error!("Health check error (correlation_id: {}): {}", cid, err);
                false
            }
        }
    }

    /// Drain the worker pool within the configured grace period.
    pub async fn shutdown(&self) -> bool {
        self.pool.shutdown(self.config.pool.shutdown_grace()).await
    }
}
