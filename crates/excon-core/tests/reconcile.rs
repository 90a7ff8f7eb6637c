//! Full reconcile-tick scenarios, driven entirely through `excon-core`'s
//! public API against an in-memory storage backend and real-but-local
//! origins. No Kubernetes API server involved.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use excon_core::{Reconciler, TickInput};
use excon_generator::NullSecretResolver;
use excon_hooks::HookExecutorClient;
use excon_retry::BackoffConfig;
use excon_storage::MemoryStorage;
use excon_types::{
    ArtifactRef, ConditionStatus, ConditionType, ExternalSourceSpec, ExternalSourceStatus, GeneratorSpec, Hook,
    HooksSpec, HttpGeneratorSpec, RetryPolicy, TransformSpec,
};
use excon_whitelist::Whitelist;

fn far_future_deadline() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

fn spawn_origin(body: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tiny_http::Server::from_listener(listener, None).unwrap();
    let url = format!("http://{addr}");
    std::thread::spawn(move || {
        loop {
            match server.recv() {
                Ok(request) => {
                    let response = tiny_http::Response::from_data(body.to_vec())
                        .with_header(tiny_http::Header::from_bytes(&b"ETag"[..], &b"rev-a"[..]).unwrap());
                    let _ = request.respond(response);
                }
                Err(_) => break,
            }
        }
    });
    url
}

fn reconciler() -> Reconciler {
    reconciler_with_whitelist(Whitelist::empty(true))
}

fn reconciler_with_whitelist(whitelist: Whitelist) -> Reconciler {
    Reconciler::new(
        Arc::new(MemoryStorage::default()),
        Arc::new(NullSecretResolver),
        "excon-test/0.1",
        whitelist,
        HookExecutorClient::new("http://127.0.0.1:1"),
        Duration::from_secs(5),
        BackoffConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: 0.0,
            max_retries: Some(2),
        },
    )
}

fn whitelist_denying_rm() -> Whitelist {
    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("wl.yaml");
    std::fs::write(&path, "commands:\n  rm:\n    allowed: false\n").unwrap();
    // Leak the tempdir: the whitelist only reads the file at load time,
    // and the test process is short-lived.
    std::mem::forget(td);
    Whitelist::load(&path, true).unwrap()
}

fn base_spec(url: String) -> ExternalSourceSpec {
    ExternalSourceSpec {
        interval: "5m".to_string(),
        suspend: false,
        destination_path: "data.json".to_string(),
        generator: GeneratorSpec::Http {
            http: HttpGeneratorSpec {
                url,
                method: "GET".to_string(),
                headers_secret_ref: None,
                ca_bundle_secret_ref: None,
                insecure_skip_verify: false,
            },
        },
        transform: None,
        hooks: None,
        max_retries: None,
    }
}

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

#[test]
fn first_tick_publishes_artifact_when_finalizer_absent() {
    let reconciler = reconciler();
    let input = TickInput {
        source_id: "default/src".to_string(),
        generation: 1,
        deleting: false,
        finalizer_present: false,
        spec: base_spec("http://unused.invalid".to_string()),
        status: ExternalSourceStatus::default(),
        annotations: BTreeMap::new(),
    };
    let output = reconciler.tick(input, t(0), far_future_deadline());
    assert!(output.add_finalizer);
    assert_eq!(output.requeue_after, Some(Duration::ZERO));
    assert!(output.upsert_external_artifact.is_none());
}

#[test]
fn suspended_source_sets_ready_false_and_does_not_requeue() {
    let reconciler = reconciler();
    let input = TickInput {
        source_id: "default/src".to_string(),
        generation: 1,
        deleting: false,
        finalizer_present: true,
        spec: {
            let mut spec = base_spec("http://unused.invalid".to_string());
            spec.suspend = true;
            spec
        },
        status: ExternalSourceStatus::default(),
        annotations: BTreeMap::new(),
    };
    let output = reconciler.tick(input, t(0), far_future_deadline());
    assert!(output.requeue_after.is_none());
    let ready = output.status.conditions.get(ConditionType::Ready).unwrap();
    assert_eq!(ready.reason, "Suspended");
}

#[test]
fn successful_fetch_publishes_artifact_and_requeues_at_interval() {
    let url = spawn_origin(br#"{"users":[{"name":"A","active":true},{"name":"B","active":false}]}"#);
    let reconciler = reconciler();
    let input = TickInput {
        source_id: "default/src".to_string(),
        generation: 1,
        deleting: false,
        finalizer_present: true,
        spec: base_spec(url),
        status: ExternalSourceStatus::default(),
        annotations: BTreeMap::new(),
    };
    let output = reconciler.tick(input, t(0), far_future_deadline());
    let ready = output.status.conditions.get(ConditionType::Ready).unwrap();
    assert_eq!(ready.status, ConditionStatus::True);
    assert!(output.status.artifact.is_some());
    assert!(output.upsert_external_artifact.is_some());
    assert_eq!(output.requeue_after, Some(Duration::from_secs(300)));

    // The stages ran to completion this tick, so their progress markers are
    // cleared rather than left `True`.
    assert_eq!(
        output.status.conditions.get(ConditionType::Fetching).unwrap().status,
        ConditionStatus::False
    );
    assert_eq!(
        output.status.conditions.get(ConditionType::Storing).unwrap().status,
        ConditionStatus::False
    );
}

#[test]
fn cel_transform_filters_active_users() {
    let url = spawn_origin(br#"{"users":[{"name":"A","active":true},{"name":"B","active":false}]}"#);
    let reconciler = reconciler();
    let mut spec = base_spec(url);
    spec.transform = Some(TransformSpec::Cel {
        expression: "input.users.filter(u, u.active).map(u, u.name)".to_string(),
    });
    let input = TickInput {
        source_id: "default/src".to_string(),
        generation: 1,
        deleting: false,
        finalizer_present: true,
        spec,
        status: ExternalSourceStatus::default(),
        annotations: BTreeMap::new(),
    };
    let output = reconciler.tick(input, t(0), far_future_deadline());
    let artifact = output.status.artifact.unwrap();
    let expected_revision = {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(br#"["A"]"#))
    };
    assert_eq!(artifact.revision, expected_revision);
    assert_eq!(
        output.status.conditions.get(ConditionType::Transforming).unwrap().status,
        ConditionStatus::False
    );
}

#[test]
fn unreachable_origin_is_transient_and_records_retry() {
    let reconciler = reconciler();
    let input = TickInput {
        source_id: "default/src".to_string(),
        generation: 1,
        deleting: false,
        finalizer_present: true,
        spec: base_spec("http://127.0.0.1:1".to_string()),
        status: ExternalSourceStatus::default(),
        annotations: BTreeMap::new(),
    };
    let output = reconciler.tick(input, t(0), far_future_deadline());
    let ready = output.status.conditions.get(ConditionType::Ready).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(output.annotations.get(excon_retry::annotation_keys::RETRY_COUNT).unwrap(), "1");
}

#[test]
fn fetch_failure_after_a_prior_success_leaves_fetching_true_in_progress() {
    // Mirrors a post-request hook failing after the fetch itself succeeded:
    // `Fetching` should read back `False`/"Succeeded" even though the
    // overall tick errors out on a later stage.
    let url = spawn_origin(b"raw-bytes");
    let reconciler = reconciler_with_whitelist(whitelist_denying_rm());
    let mut spec = base_spec(url);
    spec.hooks = Some(HooksSpec {
        pre_request: vec![],
        post_request: vec![Hook {
            name: "denied".to_string(),
            command: "rm".to_string(),
            args: vec![],
            timeout: "1s".to_string(),
            retry_policy: RetryPolicy::Fail,
            env: vec![],
        }],
    });
    let input = TickInput {
        source_id: "default/src".to_string(),
        generation: 1,
        deleting: false,
        finalizer_present: true,
        spec,
        status: ExternalSourceStatus::default(),
        annotations: BTreeMap::new(),
    };
    let output = reconciler.tick(input, t(0), far_future_deadline());
    let ready = output.status.conditions.get(ConditionType::Ready).unwrap();
    assert_eq!(ready.reason, "PermanentError");
    assert_eq!(
        output.status.conditions.get(ConditionType::Fetching).unwrap().status,
        ConditionStatus::False
    );
}

#[test]
fn retry_budget_exhaustion_sets_stalled() {
    let reconciler = reconciler();
    let mut annotations = BTreeMap::new();
    annotations.insert(excon_retry::annotation_keys::RETRY_COUNT.to_string(), "2".to_string());
    let input = TickInput {
        source_id: "default/src".to_string(),
        generation: 1,
        deleting: false,
        finalizer_present: true,
        spec: base_spec("http://127.0.0.1:1".to_string()),
        status: {
            let mut status = ExternalSourceStatus::default();
            status.observed_generation = Some(1);
            status
        },
        annotations,
    };
    let output = reconciler.tick(input, t(0), far_future_deadline());
    assert!(output.status.conditions.is_true(ConditionType::Stalled));
    // Stalled sources still requeue at the regular interval to observe
    // future spec changes.
    assert_eq!(output.requeue_after, Some(Duration::from_secs(300)));
}

#[test]
fn graceful_degradation_keeps_prior_artifact_on_failure() {
    let reconciler = reconciler();
    let prior = ArtifactRef {
        url: "memory://artifacts/default/src/abc.tar.gz".to_string(),
        revision: "abc".to_string(),
        last_update_time: t(0),
        metadata: BTreeMap::new(),
    };
    let mut status = ExternalSourceStatus::default();
    status.artifact = Some(prior.clone());
    status.observed_generation = Some(1);

    let input = TickInput {
        source_id: "default/src".to_string(),
        generation: 1,
        deleting: false,
        finalizer_present: true,
        spec: base_spec("http://127.0.0.1:1".to_string()),
        status,
        annotations: BTreeMap::new(),
    };
    let output = reconciler.tick(input, t(0), far_future_deadline());
    assert_eq!(output.status.artifact.unwrap().revision, prior.revision);
    assert!(output.upsert_external_artifact.is_none());
}

#[test]
fn deletion_removes_finalizer_and_drops_sibling_artifact() {
    let reconciler = reconciler();
    let input = TickInput {
        source_id: "default/src".to_string(),
        generation: 1,
        deleting: true,
        finalizer_present: true,
        spec: base_spec("http://unused.invalid".to_string()),
        status: ExternalSourceStatus::default(),
        annotations: BTreeMap::new(),
    };
    let output = reconciler.tick(input, t(0), far_future_deadline());
    assert!(output.remove_finalizer);
    assert!(output.delete_external_artifact);
    assert!(output.requeue_after.is_none());
}

#[test]
fn whitelist_denial_on_post_request_hook_is_permanent() {
    let url = spawn_origin(b"raw-bytes");
    let reconciler = reconciler_with_whitelist(whitelist_denying_rm());
    let mut spec = base_spec(url);
    spec.hooks = Some(HooksSpec {
        pre_request: vec![],
        post_request: vec![Hook {
            name: "denied".to_string(),
            command: "rm".to_string(),
            args: vec![],
            timeout: "1s".to_string(),
            retry_policy: RetryPolicy::Fail,
            env: vec![],
        }],
    });
    let input = TickInput {
        source_id: "default/src".to_string(),
        generation: 1,
        deleting: false,
        finalizer_present: true,
        spec,
        status: ExternalSourceStatus::default(),
        annotations: BTreeMap::new(),
    };
    let output = reconciler.tick(input, t(0), far_future_deadline());
    let ready = output.status.conditions.get(ConditionType::Ready).unwrap();
    assert_eq!(ready.reason, "PermanentError");
    assert!(output.annotations.get(excon_retry::annotation_keys::RETRY_COUNT).is_none());
}
