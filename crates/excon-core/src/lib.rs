//! The `ExternalSource` reconciliation state machine: one designed-level
//! tick per call.
//!
//! This crate has no Kubernetes API client of its own — the surrounding
//! control-plane harness is out of scope. [`Reconciler::tick`]
//! is a pure function of its [`TickInput`], returning a [`TickOutput`] the
//! caller (an operator loop, or `excon-cli reconcile-once`) is responsible
//! for persisting back onto the real resource.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use excon_generator::{Generator, SecretResolver, build_generator};
use excon_hooks::{HookError, HookExecutorClient, dispatch_hook};
use excon_retry::{BackoffConfig, ErrorClass, RetryAnnotations, calculate_delay, classify_error, is_stalled};
use excon_storage::StorageBackend;
use excon_types::{
    ArtifactRef, ConditionStatus, ConditionType, Conditions, ExternalArtifactSpec, ExternalSourceSpec,
    ExternalSourceStatus, GeneratorSpec, Hook, RetryPolicy,
};
use excon_whitelist::Whitelist;
use serde::Serialize;

/// An error classified by [`classify_error`], carrying the rendered message
/// that drove the classification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    /// Retried under exponential backoff.
    #[error("{0}")]
    Transient(String),
    /// Not retried until `spec.generation` changes.
    #[error("{0}")]
    Configuration(String),
    /// Not retried; scheduled again at the regular interval.
    #[error("{0}")]
    Permanent(String),
}

impl ReconcileError {
    fn message(&self) -> &str {
        match self {
            ReconcileError::Transient(m) | ReconcileError::Configuration(m) | ReconcileError::Permanent(m) => m,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Transient(_) => "Failed",
            ReconcileError::Configuration(_) => "ConfigurationError",
            ReconcileError::Permanent(_) => "PermanentError",
        }
    }

    /// Classify a rendered error message by the shared substring rules.
    fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_error(&message) {
            ErrorClass::Transient => ReconcileError::Transient(message),
            ErrorClass::Configuration => ReconcileError::Configuration(message),
            ErrorClass::Permanent => ReconcileError::Permanent(message),
        }
    }
}

fn classify_hook_error(err: HookError, retry_policy: RetryPolicy) -> ReconcileError {
    match err {
        HookError::NotAllowed { .. } => ReconcileError::Permanent(err.to_string()),
        HookError::ExecutorUnavailable(_) => ReconcileError::Transient(err.to_string()),
        HookError::HookFailed { .. } => match retry_policy {
            RetryPolicy::Fail => ReconcileError::Permanent(err.to_string()),
            RetryPolicy::Retry => ReconcileError::Transient(err.to_string()),
        },
    }
}

/// One reconciliation's input: the resource's desired/observed state plus
/// whatever the control-plane harness tracks outside the spec/status pair.
#[derive(Debug, Clone)]
pub struct TickInput {
    /// Stable identity used to scope storage keys, typically `namespace/name`.
    pub source_id: String,
    /// `metadata.generation` of the resource being reconciled.
    pub generation: i64,
    /// Whether a deletion timestamp is set.
    pub deleting: bool,
    /// Whether the reconciler's finalizer is currently present.
    pub finalizer_present: bool,
    pub spec: ExternalSourceSpec,
    pub status: ExternalSourceStatus,
    /// Resource annotations, carrying retry bookkeeping under
    /// [`excon_retry::annotation_keys`].
    pub annotations: BTreeMap<String, String>,
}

/// One reconciliation's output: everything the caller should write back.
#[derive(Debug, Clone)]
pub struct TickOutput {
    pub status: ExternalSourceStatus,
    pub annotations: BTreeMap<String, String>,
    /// Set when the finalizer should be added (first observation).
    pub add_finalizer: bool,
    /// Set when the finalizer should be released (deletion complete).
    pub remove_finalizer: bool,
    /// The sibling `ExternalArtifact` to upsert, if any work was done.
    pub upsert_external_artifact: Option<ExternalArtifactSpec>,
    /// Set when the sibling `ExternalArtifact` should be deleted (deletion
    /// complete).
    pub delete_external_artifact: bool,
    /// When to schedule the next tick. `None` means "do not requeue"
    /// (suspended, or deletion complete).
    pub requeue_after: Option<Duration>,
}

/// Canonical byte representation of a resolved `HTTPGeneratorSpec` handed to
/// pre-request hooks, secrets already inlined into the headers map.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalHttpConfig {
    method: String,
    url: String,
    headers: BTreeMap<String, String>,
    insecure_skip_verify: bool,
}

/// Wires together every collaborator needed to drive one reconcile tick.
pub struct Reconciler {
    storage: Arc<dyn StorageBackend>,
    secrets: Arc<dyn SecretResolver>,
    generator_user_agent: String,
    whitelist: Whitelist,
    hook_client: HookExecutorClient,
    default_hook_timeout: Duration,
    backoff: BackoffConfig,
}

impl Reconciler {
    /// Assemble a reconciler from its collaborators.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        secrets: Arc<dyn SecretResolver>,
        generator_user_agent: impl Into<String>,
        whitelist: Whitelist,
        hook_client: HookExecutorClient,
        default_hook_timeout: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            storage,
            secrets,
            generator_user_agent: generator_user_agent.into(),
            whitelist,
            hook_client,
            default_hook_timeout,
            backoff,
        }
    }

    /// Run one reconcile tick.
    pub fn tick(&self, input: TickInput, now: DateTime<Utc>, deadline: Instant) -> TickOutput {
        let source_id = input.source_id.as_str();

        // 1. Deletion: GC owned storage keys, drop the sibling artifact,
        // release the finalizer.
        if input.deleting {
            self.gc_all(source_id);
            return TickOutput {
                status: input.status,
                annotations: input.annotations,
                add_finalizer: false,
                remove_finalizer: true,
                upsert_external_artifact: None,
                delete_external_artifact: true,
                requeue_after: None,
            };
        }

        // 2. Ensure finalizer present; requeue immediately if it was just
        // added, mirroring the controller-runtime idiom of not doing
        // further work in the same tick as an API-visible finalizer patch.
        if !input.finalizer_present {
            return TickOutput {
                status: input.status,
                annotations: input.annotations,
                add_finalizer: true,
                remove_finalizer: false,
                upsert_external_artifact: None,
                delete_external_artifact: false,
                requeue_after: Some(Duration::ZERO),
            };
        }

        let mut status = input.status;
        let mut annotations = input.annotations;

        // 3. Suspension: no side effects, no requeue.
        if input.spec.suspend {
            status.conditions.set(
                ConditionType::Ready,
                ConditionStatus::False,
                "Suspended",
                "spec.suspend is true",
                input.generation,
                now,
            );
            return TickOutput {
                status,
                annotations,
                add_finalizer: false,
                remove_finalizer: false,
                upsert_external_artifact: None,
                delete_external_artifact: false,
                requeue_after: None,
            };
        }

        // 5. Spec changed since last observation: fresh retry budget.
        if status.observed_generation != Some(input.generation) {
            RetryAnnotations::clear(&mut annotations);
        }

        // 6. Recovery from a prior stall.
        if status.conditions.is_true(ConditionType::Stalled) {
            if status.artifact.is_some() {
                status.conditions.set(
                    ConditionType::Ready,
                    ConditionStatus::True,
                    "Succeeded",
                    "retrying after a prior stall; a published artifact is still available",
                    input.generation,
                    now,
                );
            } else {
                status.conditions.set(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    "Progressing",
                    "retrying after a prior stall; no artifact published yet",
                    input.generation,
                    now,
                );
            }
            status.conditions.clear(ConditionType::Stalled);
        }

        match self.attempt(&input.spec, &mut status, source_id, input.generation, now, deadline) {
            Ok(outcome) => {
                RetryAnnotations::clear(&mut annotations);
                status.conditions.clear(ConditionType::Stalled);
                status.conditions.set(
                    ConditionType::Fetching,
                    ConditionStatus::False,
                    "Succeeded",
                    "",
                    input.generation,
                    now,
                );
                status.conditions.set(
                    ConditionType::Transforming,
                    ConditionStatus::False,
                    "Succeeded",
                    "",
                    input.generation,
                    now,
                );
                status.conditions.set(
                    ConditionType::Storing,
                    ConditionStatus::False,
                    "Succeeded",
                    "",
                    input.generation,
                    now,
                );
                status.conditions.set(
                    ConditionType::Ready,
                    ConditionStatus::True,
                    "Succeeded",
                    "reconcile succeeded",
                    input.generation,
                    now,
                );
                status.observed_generation = Some(input.generation);
                status.last_handled_etag = outcome.last_handled_etag.or(status.last_handled_etag);
                let external_artifact = Some(ExternalArtifactSpec::from(&outcome.artifact));
                status.artifact = Some(outcome.artifact);

                let interval = input
                    .spec
                    .polling_interval()
                    .unwrap_or(excon_duration::MINIMUM_INTERVAL);

                TickOutput {
                    status,
                    annotations,
                    add_finalizer: false,
                    remove_finalizer: false,
                    upsert_external_artifact: external_artifact,
                    delete_external_artifact: false,
                    requeue_after: Some(interval),
                }
            }
            Err(err) => {
                let interval = input
                    .spec
                    .polling_interval()
                    .unwrap_or(excon_duration::MINIMUM_INTERVAL);

                status.conditions.set(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    err.reason(),
                    err.message(),
                    input.generation,
                    now,
                );

                let backoff = BackoffConfig {
                    max_retries: input.spec.max_retries.or(self.backoff.max_retries),
                    ..self.backoff.clone()
                };

                let requeue_after = match &err {
                    ReconcileError::Transient(message) => {
                        let mut retry = RetryAnnotations::decode(&annotations);
                        retry.record_failure(message.clone(), now);

                        if is_stalled(&backoff, retry.retry_count) {
                            status.conditions.set(
                                ConditionType::Stalled,
                                ConditionStatus::True,
                                "Failed",
                                message,
                                input.generation,
                                now,
                            );
                            retry.encode_into(&mut annotations);
                            interval
                        } else {
                            let delay = calculate_delay(&backoff, retry.retry_count.saturating_sub(1));
                            retry.encode_into(&mut annotations);
                            delay
                        }
                    }
                    ReconcileError::Configuration(_) | ReconcileError::Permanent(_) => interval,
                };

                TickOutput {
                    status,
                    annotations,
                    add_finalizer: false,
                    remove_finalizer: false,
                    upsert_external_artifact: None,
                    delete_external_artifact: false,
                    requeue_after: Some(requeue_after),
                }
            }
        }
    }

    /// Steps 4, 7–17: the actual fetch/transform/package/store pipeline.
    /// Flips `Fetching`/`Transforming`/`Storing` to `True`/"Progressing" on
    /// entry to their stage and back to `False`/"Succeeded" on that stage's
    /// completion, so a caller that sees this return `Err` finds the stage
    /// in flight when the failure happened left `True` and every earlier
    /// stage already `False`. Annotations are never touched here — the
    /// caller applies whatever this returns for those.
    fn attempt(
        &self,
        spec: &ExternalSourceSpec,
        status: &mut ExternalSourceStatus,
        source_id: &str,
        generation: i64,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<AttemptOutcome, ReconcileError> {
        // 4. Parse interval.
        spec.polling_interval()
            .map_err(|e| ReconcileError::Configuration(format!("invalid duration: {e}")))?;

        // 7. Build the generator.
        let generator = build_generator(&spec.generator, &self.generator_user_agent)
            .map_err(|e| ReconcileError::from_message(e.to_string()))?;
        let GeneratorSpec::Http { http: generator_config } = &spec.generator;

        let hooks_present = spec
            .hooks
            .as_ref()
            .is_some_and(|h| !h.pre_request.is_empty() || !h.post_request.is_empty());

        // 8. Conditional-fetch short-circuit.
        if generator.supports_conditional_fetch()
            && spec.transform.is_none()
            && !hooks_present
            && status.last_handled_etag.as_deref().is_some_and(|e| !e.is_empty())
            && status.artifact.is_some()
        {
            let probe = generator
                .get_last_modified(generator_config, self.secrets.as_ref(), deadline)
                .map_err(|e| ReconcileError::from_message(e.to_string()))?;
            if Some(probe.as_str()) == status.last_handled_etag.as_deref() {
                return Ok(AttemptOutcome {
                    artifact: status.artifact.clone().expect("checked above"),
                    last_handled_etag: status.last_handled_etag.clone(),
                });
            }
        }

        // 9. Pre-request hooks, over a canonical byte form of the resolved
        // generator config. This revision's generator contract has no
        // reconfiguration hook, so the chained output is exercised for its
        // side effects (and failure/retry semantics) but not applied back.
        if let Some(hooks) = spec.hooks.as_ref().filter(|h| !h.pre_request.is_empty()) {
            let headers = match &generator_config.headers_secret_ref {
                Some(secret_name) => self
                    .secrets
                    .resolve_headers(secret_name)
                    .map_err(|e| ReconcileError::from_message(e.to_string()))?,
                None => BTreeMap::new(),
            };
            let canonical = serde_json::to_vec(&CanonicalHttpConfig {
                method: generator_config.method.clone(),
                url: generator_config.url.clone(),
                headers,
                insecure_skip_verify: generator_config.insecure_skip_verify,
            })
            .map_err(|e| ReconcileError::Configuration(format!("failed to serialize canonical hook config: {e}")))?;
            self.run_hook_chain(&hooks.pre_request, canonical, deadline)?;
        }

        // 10. Fetch.
        status
            .conditions
            .set(ConditionType::Fetching, ConditionStatus::True, "Progressing", "", generation, now);
        let generated = generator
            .generate(generator_config, self.secrets.as_ref(), deadline)
            .map_err(|e| ReconcileError::from_message(e.to_string()))?;
        status
            .conditions
            .set(ConditionType::Fetching, ConditionStatus::False, "Succeeded", "", generation, now);
        let last_modified = generated.last_modified.clone();

        // 11. Post-request hooks, chaining the fetched bytes.
        let mut data = generated.data;
        if let Some(hooks) = spec.hooks.as_ref().filter(|h| !h.post_request.is_empty()) {
            data = self.run_hook_chain(&hooks.post_request, data, deadline)?;
        }

        // 12. Transform.
        if let Some(transform_spec) = &spec.transform {
            status.conditions.set(
                ConditionType::Transforming,
                ConditionStatus::True,
                "Progressing",
                "",
                generation,
                now,
            );
            data = self.apply_transform(transform_spec, &data)?;
            status.conditions.set(
                ConditionType::Transforming,
                ConditionStatus::False,
                "Succeeded",
                "",
                generation,
                now,
            );
        }

        // 13. Package.
        let package = excon_package::package(&data, &spec.destination_path)
            .map_err(|e| ReconcileError::Configuration(e.to_string()))?;

        let key = storage_key(source_id, &package.revision);
        let current_revision = status.artifact.as_ref().map(|a| a.revision.as_str());

        let url = if current_revision == Some(package.revision.as_str()) {
            // 14. Unchanged revision: skip the store.
            status
                .artifact
                .as_ref()
                .map(|a| a.url.clone())
                .unwrap_or_else(|| self.storage.url_for(&key))
        } else {
            status
                .conditions
                .set(ConditionType::Storing, ConditionStatus::True, "Progressing", "", generation, now);
            let url = self
                .storage
                .put(&key, &package.data)
                .map_err(|e| ReconcileError::from_message(e.to_string()))?;
            status
                .conditions
                .set(ConditionType::Storing, ConditionStatus::False, "Succeeded", "", generation, now);
            url
        };

        // 15. Best-effort GC of superseded revisions.
        self.gc_superseded(source_id, &package.revision);

        let artifact = ArtifactRef {
            url,
            revision: package.revision,
            last_update_time: now,
            metadata: package.metadata,
        };

        Ok(AttemptOutcome {
            artifact,
            last_handled_etag: (!last_modified.is_empty()).then_some(last_modified),
        })
    }

    fn run_hook_chain(&self, hooks: &[Hook], mut input: Vec<u8>, deadline: Instant) -> Result<Vec<u8>, ReconcileError> {
        for hook in hooks {
            input = dispatch_hook(&self.whitelist, &self.hook_client, hook, &input, self.default_hook_timeout)
                .map_err(|e| classify_hook_error(e, hook.retry_policy))?;
            let _ = deadline; // honoured inside dispatch_hook's own request timeout
        }
        Ok(input)
    }

    fn apply_transform(
        &self,
        transform_spec: &excon_types::TransformSpec,
        data: &[u8],
    ) -> Result<Vec<u8>, ReconcileError> {
        match transform_spec {
            excon_types::TransformSpec::Cel { expression } => {
                excon_transform::transform(data, expression, self.default_hook_timeout).map_err(|e| match e {
                    excon_transform::TransformError::ConfigurationError(m) => {
                        ReconcileError::Configuration(format!("compile error: {m}"))
                    }
                    excon_transform::TransformError::Timeout => {
                        ReconcileError::Transient("timeout: expression evaluation exceeded its deadline".to_string())
                    }
                    excon_transform::TransformError::EvaluationError(m) => ReconcileError::Transient(m),
                    excon_transform::TransformError::UnsupportedResultType => {
                        ReconcileError::Transient("unsupported result type from expression".to_string())
                    }
                })
            }
        }
    }

    fn gc_superseded(&self, source_id: &str, keep_revision: &str) {
        let prefix = storage_prefix(source_id);
        let keep_key = storage_key(source_id, keep_revision);
        match self.storage.list(&prefix) {
            Ok(keys) => {
                for key in keys.into_iter().filter(|k| k != &keep_key) {
                    if let Err(e) = self.storage.delete(&key) {
                        log::warn!("GC: failed to delete superseded key {key}: {e}");
                    }
                }
            }
            Err(e) => log::warn!("GC: failed to list {prefix}: {e}"),
        }
    }

    fn gc_all(&self, source_id: &str) {
        let prefix = storage_prefix(source_id);
        match self.storage.list(&prefix) {
            Ok(keys) => {
                for key in keys {
                    if let Err(e) = self.storage.delete(&key) {
                        log::warn!("deletion GC: failed to delete {key}: {e}");
                    }
                }
            }
            Err(e) => log::warn!("deletion GC: failed to list {prefix}: {e}"),
        }
    }
}

struct AttemptOutcome {
    artifact: ArtifactRef,
    last_handled_etag: Option<String>,
}

fn storage_prefix(source_id: &str) -> String {
    format!("artifacts/{source_id}/")
}

fn storage_key(source_id: &str, revision: &str) -> String {
    format!("artifacts/{source_id}/{revision}.tar.gz")
}

