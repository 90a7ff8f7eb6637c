//! Resource types for `ExternalSource` / `ExternalArtifact` and the
//! condition/status bookkeeping the reconciler maintains on them.
//!
//! Field names use `camelCase` on the wire (Kubernetes convention); Rust
//! field names stay `snake_case` via `#[serde(rename_all = "camelCase")]`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use excon_duration::Interval;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------
// ExternalSource: desired state
// ---------------------------------------------------------------------

/// Desired state of an `ExternalSource`: where to fetch data, how to shape
/// it, and where to publish it.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "excon.io",
    version = "v1alpha1",
    kind = "ExternalSource",
    plural = "externalsources",
    namespaced,
    status = "ExternalSourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSourceSpec {
    /// Polling interval, e.g. `"5m"`, `"1h30m"`. Floored to one minute at
    /// runtime; see [`excon_duration`].
    pub interval: String,
    /// When true, the reconciler performs no side effects and reports
    /// `Ready=False/Suspended`.
    #[serde(default)]
    pub suspend: bool,
    /// Relative POSIX path of the single file packaged inside the tarball.
    /// `""` or `"."` normalizes to `"data"`; `..` is rejected at package time.
    #[serde(default)]
    pub destination_path: String,
    /// Where to fetch source bytes from.
    pub generator: GeneratorSpec,
    /// Optional expression-language reshaping of fetched bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformSpec>,
    /// Optional pre/post-request hook pipelines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HooksSpec>,
    /// Cap on classified-transient-error retries before this generation is
    /// marked `Stalled`. `None` means unbounded retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl ExternalSourceSpec {
    /// Parse [`Self::interval`], applying the runtime floor.
    pub fn polling_interval(&self) -> Result<std::time::Duration, excon_duration::IntervalError> {
        Interval::parse(&self.interval).map(|i| i.floor_to_minute())
    }
}

/// Tagged union of source generators. Only the HTTP variant is specified in
/// this revision; the tag makes adding further variants non-breaking.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GeneratorSpec {
    /// Fetch source bytes over HTTP(S).
    Http {
        /// The HTTP generator's own configuration.
        http: HttpGeneratorSpec,
    },
}

impl GeneratorSpec {
    /// The generator type tag, used for error classification and factory
    /// dispatch (`"unsupported generator type: <kind>"`).
    pub fn kind(&self) -> &'static str {
        match self {
            GeneratorSpec::Http { .. } => "http",
        }
    }
}

/// Configuration for the HTTP generator variant.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpGeneratorSpec {
    /// The URL to fetch.
    pub url: String,
    /// HTTP method; defaults to `GET`.
    #[serde(default = "default_http_method")]
    pub method: String,
    /// Name of a secret yielding a `string -> string` header map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers_secret_ref: Option<String>,
    /// Reference to a secret key yielding PEM-encoded CA bundle bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_secret_ref: Option<SecretKeyRef>,
    /// Skip TLS certificate verification. Dangerous; off by default.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_http_method() -> String {
    "GET".to_string()
}

/// Reference to a single key within a named secret.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Name of the secret.
    pub name: String,
    /// Key within the secret.
    pub key: String,
}

/// Tagged union of transform variants. Only `cel` is specified.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransformSpec {
    /// CEL-style expression, evaluated against the fetched bytes.
    Cel {
        /// The expression source, e.g.
        /// `"input.users.filter(u, u.active).map(u, u.name)"`.
        expression: String,
    },
}

impl TransformSpec {
    /// The transform type tag, used for `"unsupported transform type: <kind>"`
    /// classification.
    pub fn kind(&self) -> &'static str {
        match self {
            TransformSpec::Cel { .. } => "cel",
        }
    }
}

/// Pre- and post-request hook pipelines.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HooksSpec {
    /// Hooks run before the generator request, over a canonical byte
    /// representation of the resolved generator config.
    #[serde(default)]
    pub pre_request: Vec<Hook>,
    /// Hooks run after the generator request, chaining the fetched bytes.
    #[serde(default)]
    pub post_request: Vec<Hook>,
}

/// A single hook invocation: a command dispatched via the hook-executor
/// sidecar, receiving `input` on stdin and emitting `output` on stdout.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    /// Human-readable name, used in logs and error messages.
    pub name: String,
    /// Command to execute (no shell is involved).
    pub command: String,
    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-hook execution deadline, e.g. `"30s"`.
    pub timeout: String,
    /// What to do when this hook fails.
    pub retry_policy: RetryPolicy,
    /// Extra environment variables passed to the command.
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// What a `HookFailed` error should do to the enclosing reconcile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Abort the reconcile immediately; classify per the normal error rules.
    Fail,
    /// Let the reconciler's backoff policy retry this generation.
    Retry,
}

/// A single environment variable passed to a hook command.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

// ---------------------------------------------------------------------
// ExternalSource: observed state
// ---------------------------------------------------------------------

/// Observed state of an `ExternalSource`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSourceStatus {
    /// Current condition set, keyed by [`ConditionType`].
    #[serde(default)]
    pub conditions: Conditions,
    /// The currently published artifact, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    /// The `ETag` (or equivalent) observed on the last successful fetch,
    /// used to short-circuit unchanged sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_etag: Option<String>,
    /// The spec generation whose observation produced the current
    /// conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// A reference to the currently published artifact blob.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    /// URL at which the blob can be downloaded.
    pub url: String,
    /// Content-addressed revision (`hex(sha256(data))`).
    pub revision: String,
    /// When this artifact was published.
    pub last_update_time: DateTime<Utc>,
    /// Free-form metadata (`created`, `size`, `contentHash`).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------
// ExternalArtifact: sibling resource
// ---------------------------------------------------------------------

/// `ExternalArtifact` is named identically to, owned by, and lifetime-bound
/// to its `ExternalSource`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "excon.io",
    version = "v1alpha1",
    kind = "ExternalArtifact",
    plural = "externalartifacts",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalArtifactSpec {
    /// URL at which the blob can be downloaded.
    pub url: String,
    /// Content-addressed revision.
    pub revision: String,
    /// Free-form metadata, mirrored from [`ArtifactRef::metadata`].
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl From<&ArtifactRef> for ExternalArtifactSpec {
    fn from(artifact: &ArtifactRef) -> Self {
        Self {
            url: artifact.url.clone(),
            revision: artifact.revision.clone(),
            metadata: artifact.metadata.clone(),
        }
    }
}

// ---------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------

/// The condition types this reconciler reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// Overall health for the currently published revision.
    Ready,
    /// Transient progress marker: a fetch is underway.
    Fetching,
    /// Transient progress marker: a transform is underway.
    Transforming,
    /// Transient progress marker: a store is underway.
    Storing,
    /// Terminal for the current spec generation: retry budget exhausted, or
    /// a `PermanentError`/`ConfigurationError` was hit.
    Stalled,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConditionType::Ready => "Ready",
            ConditionType::Fetching => "Fetching",
            ConditionType::Transforming => "Transforming",
            ConditionType::Storing => "Storing",
            ConditionType::Stalled => "Stalled",
        };
        write!(f, "{s}")
    }
}

/// Tri-state condition status, matching Kubernetes' own convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A single observed condition.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
}

/// An ordered collection of [`Condition`]s keyed by [`ConditionType`].
///
/// `set` only stamps a new `lastTransitionTime` when the condition is new or
/// its `status` actually changed, matching how real controllers avoid
/// needless status churn on every observation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    /// An empty condition set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a condition by type.
    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Insert or update a condition, stamping `last_transition_time = now`
    /// only if the condition is new or its status changed.
    pub fn set(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: i64,
        now: DateTime<Utc>,
    ) {
        if let Some(existing) = self.0.iter_mut().find(|c| c.type_ == type_) {
            let status_changed = existing.status != status;
            existing.status = status;
            existing.reason = reason.into();
            existing.message = message.into();
            existing.observed_generation = observed_generation;
            if status_changed {
                existing.last_transition_time = now;
            }
            return;
        }

        self.0.push(Condition {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation,
            last_transition_time: now,
        });
    }

    /// Remove a condition entirely, if present.
    pub fn clear(&mut self, type_: ConditionType) {
        self.0.retain(|c| c.type_ != type_);
    }

    /// Whether a condition is present with `status == True`.
    pub fn is_true(&self, type_: ConditionType) -> bool {
        matches!(
            self.get(type_),
            Some(Condition {
                status: ConditionStatus::True,
                ..
            })
        )
    }

    /// Iterate over all conditions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }
}
