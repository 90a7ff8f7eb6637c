//! Error classification, exponential backoff, and retry-annotation
//! bookkeeping for the `ExternalSource` reconciler.
//!
//! Classification is `Transient`/`Configuration`/`Permanent`. `Stalled` is
//! not a classification an error can carry — it's synthesized by the
//! reconciler once `retry_count >= max_retries`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an error surfaced during one reconcile attempt should drive retry
/// behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retried under exponential backoff; previous artifact stays published.
    Transient,
    /// No retries until `spec.generation` changes.
    Configuration,
    /// No retries; scheduled at the regular interval for eventual recovery.
    Permanent,
}

/// Classify an error by substring match against its rendered message.
///
/// Order matters: configuration and permanent markers are checked before
/// transient ones, since e.g. a 4xx status code's digits could otherwise be
/// mistaken for an unrelated transient signal.
pub fn classify_error(message: &str) -> ErrorClass {
    let hay = message.to_ascii_lowercase();

    const CONFIGURATION_MARKERS: &[&str] = &[
        "invalid duration",
        "unsupported generator type",
        "unsupported transform type",
        "compile error",
        "configurationerror",
    ];
    const PERMANENT_MARKERS: &[&str] = &[
        "404",
        "401",
        "403",
        "not found",
        "unauthorized",
        "forbidden",
        "tls verification failed",
        "certificate verify failed",
        "whitelist denial",
        "not allowed",
        "notallowed",
    ];
    const TRANSIENT_MARKERS: &[&str] = &[
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "network",
        "temporary failure",
        "500",
        "502",
        "503",
        "504",
        "408",
        "429",
    ];

    if CONFIGURATION_MARKERS.iter().any(|m| hay.contains(m)) {
        return ErrorClass::Configuration;
    }
    if PERMANENT_MARKERS.iter().any(|m| hay.contains(m)) {
        return ErrorClass::Permanent;
    }
    if TRANSIENT_MARKERS.iter().any(|m| hay.contains(m)) {
        return ErrorClass::Transient;
    }

    // Unclassified errors default to transient: they get retried under
    // backoff rather than silently stalling a source forever.
    ErrorClass::Transient
}

/// Exponential backoff configuration.
///
/// `Delay = clamp(base_delay * 2^retry_count, _, max_delay) * (1 ± jitter)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Base delay for the first retry (`retry_count == 0`).
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor in `[0.0, 1.0]`; 0.5 means delay is scaled by a random
    /// factor in `[0.5, 1.5]`.
    pub jitter: f64,
    /// Cap on retries before the source is marked `Stalled`. `None` means
    /// no cap (`maxRetries` is optional).
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
            max_retries: Some(10),
        }
    }
}

/// Compute the delay before the next retry attempt.
///
/// `retry_count` is zero-indexed: the first retry after an initial failure
/// passes `retry_count = 0`.
pub fn calculate_delay(config: &BackoffConfig, retry_count: u32) -> Duration {
    let pow = retry_count.min(32);
    let unjittered = config
        .base_delay
        .saturating_mul(2_u32.saturating_pow(pow))
        .min(config.max_delay);

    if config.jitter <= 0.0 {
        return unjittered;
    }

    apply_jitter(unjittered, config.jitter)
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let jitter = jitter.clamp(0.0, 1.0);
    let mut rng = rand::rng();
    let random_value: f64 = rng.random();
    let factor = 1.0 - jitter + (random_value * 2.0 * jitter);
    let millis = (delay.as_millis() as f64 * factor).round().max(0.0) as u64;
    Duration::from_millis(millis)
}

/// Whether the retry budget for the current spec generation is exhausted.
pub fn is_stalled(config: &BackoffConfig, retry_count: u32) -> bool {
    match config.max_retries {
        Some(max) => retry_count >= max,
        None => false,
    }
}

/// Annotation keys the reconciler persists retry bookkeeping under, per
/// ("retry-count", "last-failure", "backoff-start").
pub mod annotation_keys {
    /// Number of consecutive classified-transient failures for the current
    /// spec generation.
    pub const RETRY_COUNT: &str = "excon.io/retry-count";
    /// The most recent failure message.
    pub const LAST_FAILURE: &str = "excon.io/last-failure";
    /// RFC3339 timestamp of when the current backoff sequence began.
    pub const BACKOFF_START: &str = "excon.io/backoff-start";
}

/// Retry bookkeeping persisted on the `ExternalSource` resource so a
/// reconciler restart doesn't lose backoff progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryAnnotations {
    /// Count of consecutive transient failures since the last success or
    /// spec-generation change.
    pub retry_count: u32,
    /// The most recently recorded failure message, if any.
    pub last_failure: Option<String>,
    /// When the current backoff sequence started, if any.
    pub backoff_start: Option<DateTime<Utc>>,
}

impl RetryAnnotations {
    /// Decode from a resource's annotation map. Missing or malformed keys
    /// default to empty bookkeeping rather than erroring — annotations are
    /// best-effort bookkeeping, not authoritative state.
    pub fn decode(annotations: &BTreeMap<String, String>) -> Self {
        let retry_count = annotations
            .get(annotation_keys::RETRY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_failure = annotations.get(annotation_keys::LAST_FAILURE).cloned();
        let backoff_start = annotations
            .get(annotation_keys::BACKOFF_START)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Self {
            retry_count,
            last_failure,
            backoff_start,
        }
    }

    /// Write this bookkeeping into a resource's annotation map.
    pub fn encode_into(&self, annotations: &mut BTreeMap<String, String>) {
        annotations.insert(annotation_keys::RETRY_COUNT.to_string(), self.retry_count.to_string());
        match &self.last_failure {
            Some(msg) => {
                annotations.insert(annotation_keys::LAST_FAILURE.to_string(), msg.clone());
            }
            None => {
                annotations.remove(annotation_keys::LAST_FAILURE);
            }
        }
        match self.backoff_start {
            Some(ts) => {
                annotations.insert(
                    annotation_keys::BACKOFF_START.to_string(),
                    ts.to_rfc3339(),
                );
            }
            None => {
                annotations.remove(annotation_keys::BACKOFF_START);
            }
        }
    }

    /// Clear all retry bookkeeping from a resource's annotation map (spec
    /// generation changed, or the reconcile succeeded).
    pub fn clear(annotations: &mut BTreeMap<String, String>) {
        annotations.remove(annotation_keys::RETRY_COUNT);
        annotations.remove(annotation_keys::LAST_FAILURE);
        annotations.remove(annotation_keys::BACKOFF_START);
    }

    /// Record a new failure: bump `retry_count`, stamp `last_failure`, and
    /// set `backoff_start` if this is the first failure in the sequence.
    pub fn record_failure(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_failure = Some(message.into());
        if self.backoff_start.is_none() {
            self.backoff_start = Some(now);
        }
    }
}
