//! # excon
//!
//! A Kubernetes controller that materializes external HTTP data into
//! content-addressed, gzip-compressed tarball artifacts for a GitOps
//! delivery engine to pick up alongside `GitRepository`/`OCIRepository`
//! sources.
//!
//! ## Pipeline
//!
//! One reconcile tick (see [`core::Reconciler::tick`]) walks:
//!
//! 1. [`generator`] fetches source bytes over HTTP, honouring conditional
//!    requests where the origin supports them.
//! 2. [`hooks`] optionally shells out to a whitelisted pre/post-request
//!    pipeline through a sidecar process.
//! 3. [`transform`] optionally reshapes the bytes with a CEL expression.
//! 4. [`package`] wraps the result in a single-entry gzip tar, keyed by the
//!    SHA-256 digest of the pre-archive bytes.
//! 5. [`storage`] persists the archive under
//!    `artifacts/<source-id>/<digest>.tar.gz` and [`artifact_server`] serves
//!    it back out over plain HTTP.
//!
//! ## Modules
//!
//! - [`types`] — `ExternalSource`/`ExternalArtifact` resource and status types
//! - [`duration`] — interval string parsing with the one-minute runtime floor
//! - [`retry`] — error classification, backoff, and retry-annotation codec
//! - [`config`] — `.excon.toml` + `EXCON_*` environment configuration
//! - [`storage`] — pluggable artifact storage backends
//! - [`generator`] — pluggable source generators (HTTP today)
//! - [`whitelist`] — declarative allowlist for hook commands
//! - [`hooks`] — hook-executor sidecar client and server
//! - [`transform`] — CEL-based byte reshaping
//! - [`package`] — content-addressed tar/gzip packaging
//! - [`artifact_server`] — HTTP plane serving packaged artifacts
//! - [`core`] — the reconciliation state machine tying everything together

pub use excon_artifact_server as artifact_server;
pub use excon_config as config;
pub use excon_core as core;
pub use excon_duration as duration;
pub use excon_generator as generator;
pub use excon_hooks as hooks;
pub use excon_package as package;
pub use excon_retry as retry;
pub use excon_storage as storage;
pub use excon_transform as transform;
pub use excon_types as types;
pub use excon_whitelist as whitelist;
