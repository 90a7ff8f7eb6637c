use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use excon_config::{Config, StorageBackendKind, load_config};
use excon_core::{Reconciler, TickInput};
use excon_generator::NullSecretResolver;
use excon_hooks::HookExecutorClient;
use excon_retry::BackoffConfig;
use excon_storage::{FilesystemStorage, MemoryStorage, ObjectStoreStorage, StorageBackend};
use excon_types::ExternalSource;
use excon_whitelist::Whitelist;

#[derive(Parser, Debug)]
#[command(name = "excon-cli", version)]
#[command(about = "Materializes external HTTP data into content-addressed tarball artifacts")]
struct Cli {
    /// Directory to look for `.excon.toml` in.
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single reconcile tick against an `ExternalSource` manifest and
    /// print the resulting status.
    ReconcileOnce {
        /// Path to a YAML `ExternalSource` manifest.
        source: PathBuf,
        /// Write the reconciled status back onto the manifest file.
        #[arg(long)]
        write_back: bool,
    },
    /// Serve packaged artifacts over HTTP from the configured storage backend.
    ServeArtifacts,
    /// Run the hook-executor sidecar, enforcing the configured whitelist.
    ServeHooks {
        /// Bind address, overriding `hooks.sidecarEndpoint`'s host:port.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the resolved configuration as TOML.
    ShowConfig,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = load_config(&cli.config_dir).context("loading configuration")?;

    match cli.cmd {
        Commands::ReconcileOnce { source, write_back } => reconcile_once(&config, &source, write_back),
        Commands::ServeArtifacts => serve_artifacts(&config),
        Commands::ServeHooks { bind } => serve_hooks(&config, bind.as_deref()),
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config).context("rendering configuration")?);
            Ok(())
        }
    }
}

fn build_storage(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let storage: Arc<dyn StorageBackend> = match config.storage.backend {
        StorageBackendKind::Memory => Arc::new(MemoryStorage::default()),
        StorageBackendKind::Filesystem => Arc::new(FilesystemStorage::new(
            config.storage.base_path.clone(),
            format!("file://{}", config.storage.base_path),
        )),
        StorageBackendKind::ObjectStore => {
            let endpoint = config
                .storage
                .endpoint
                .clone()
                .context("storage.endpoint is required for the object-store backend")?;
            Arc::new(ObjectStoreStorage::new(
                endpoint,
                config.storage.bucket.clone(),
                config.storage.credential.clone(),
                config.http_timeout(),
            )?)
        }
    };
    Ok(storage)
}

fn build_reconciler(config: &Config) -> Result<Reconciler> {
    let storage = build_storage(config)?;
    let whitelist = Whitelist::load(Path::new(&config.hooks.whitelist_path), false)
        .with_context(|| format!("loading whitelist from {}", config.hooks.whitelist_path))?;
    let hook_client = HookExecutorClient::new(config.hooks.sidecar_endpoint.clone());
    let backoff = BackoffConfig {
        base_delay: config.retry_base_delay(),
        max_delay: config.retry_max_delay(),
        jitter: config.retry.jitter_factor,
        max_retries: Some(config.retry.max_attempts),
    };

    Ok(Reconciler::new(
        storage,
        Arc::new(NullSecretResolver),
        config.http_client.user_agent.clone(),
        whitelist,
        hook_client,
        Duration::from_secs(config.hooks.default_timeout_secs),
        backoff,
    ))
}

fn reconcile_once(config: &Config, source_path: &Path, write_back: bool) -> Result<()> {
    let raw = std::fs::read_to_string(source_path)
        .with_context(|| format!("reading {}", source_path.display()))?;
    let mut resource: ExternalSource = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing {} as an ExternalSource", source_path.display()))?;

    let source_id = match (&resource.metadata.namespace, &resource.metadata.name) {
        (Some(ns), Some(name)) => format!("{ns}/{name}"),
        (None, Some(name)) => name.clone(),
        _ => bail!("manifest is missing metadata.name"),
    };

    let annotations = resource.metadata.annotations.clone().unwrap_or_default();
    let finalizer_present = resource
        .metadata
        .finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|f| f == FINALIZER);

    let reconciler = build_reconciler(config)?;
    let input = TickInput {
        source_id: source_id.clone(),
        generation: resource.metadata.generation.unwrap_or(1),
        deleting: resource.metadata.deletion_timestamp.is_some(),
        finalizer_present,
        spec: resource.spec.clone(),
        status: resource.status.clone().unwrap_or_default(),
        annotations,
    };

    let deadline = Instant::now() + Duration::from_secs(config.hooks.default_timeout_secs * 4);
    let output = reconciler.tick(input, chrono::Utc::now(), deadline);

    println!("source: {source_id}");
    for condition in output.status.conditions.iter() {
        println!(
            "  {:<12} {:<8?} {} {}",
            condition.type_, condition.status, condition.reason, condition.message
        );
    }
    if let Some(artifact) = &output.status.artifact {
        println!("  artifact: {} @ {}", artifact.url, artifact.revision);
    }
    match output.requeue_after {
        Some(after) => println!("  requeue after: {after:?}"),
        None => println!("  requeue: none"),
    }

    if write_back {
        resource.status = Some(output.status);
        resource.metadata.annotations = Some(output.annotations);
        if output.add_finalizer {
            let finalizers = resource.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == FINALIZER) {
                finalizers.push(FINALIZER.to_string());
            }
        }
        if output.remove_finalizer {
            if let Some(finalizers) = resource.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != FINALIZER);
            }
        }
        let rendered = serde_yaml::to_string(&resource).context("rendering updated manifest")?;
        std::fs::write(source_path, rendered)
            .with_context(|| format!("writing {}", source_path.display()))?;
    }

    Ok(())
}

const FINALIZER: &str = "excon.io/finalizer";

fn serve_artifacts(config: &Config) -> Result<()> {
    if !config.artifact_server.enabled {
        log::info!("artifact server disabled by configuration");
        return Ok(());
    }

    let storage = build_storage(config)?;
    let bind = format!("0.0.0.0:{}", config.artifact_server.port);
    let server = tiny_http::Server::http(&bind)
        .map_err(|e| anyhow::anyhow!("binding artifact server to {bind}: {e}"))?;
    log::info!("artifact server listening on {bind}");

    let shutdown = install_shutdown_handler()?;
    excon_artifact_server::run_artifact_server(&server, storage.as_ref(), shutdown);
    Ok(())
}

fn serve_hooks(config: &Config, bind_override: Option<&str>) -> Result<()> {
    let whitelist = Whitelist::load(Path::new(&config.hooks.whitelist_path), false)
        .with_context(|| format!("loading whitelist from {}", config.hooks.whitelist_path))?;

    let bind = match bind_override {
        Some(b) => b.to_string(),
        None => config
            .hooks
            .sidecar_endpoint
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .to_string(),
    };
    let server = tiny_http::Server::http(&bind)
        .map_err(|e| anyhow::anyhow!("binding hook sidecar to {bind}: {e}"))?;
    log::info!("hook sidecar listening on {bind}");

    let shutdown = install_shutdown_handler()?;
    excon_hooks::run_sidecar_server(&server, &whitelist, shutdown);
    Ok(())
}

fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("installing SIGINT handler")?;
    Ok(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use excon_types::{GeneratorSpec, HttpGeneratorSpec};
    use tempfile::tempdir;

    fn sample_manifest(url: &str) -> String {
        format!(
            r#"
apiVersion: excon.io/v1alpha1
kind: ExternalSource
metadata:
  name: demo
  namespace: default
spec:
  interval: 5m
  generator:
    type: http
    http:
      url: "{url}"
      method: GET
"#
        )
    }

    /// A [`Config`] pointed at a scratch, empty-but-valid whitelist file so
    /// tests don't depend on `/etc/excon/whitelist.yaml` existing.
    fn config_with_empty_whitelist(dir: &Path) -> Config {
        let whitelist_path = dir.join("whitelist.yaml");
        std::fs::write(&whitelist_path, "commands: {}\n").unwrap();
        let mut config = Config::default();
        config.hooks.whitelist_path = whitelist_path.to_str().unwrap().to_string();
        config
    }

    #[test]
    fn reconcile_once_parses_and_ticks_against_an_unreachable_origin() {
        let dir = tempdir().unwrap();
        let manifest_path = dir.path().join("source.yaml");
        std::fs::write(&manifest_path, sample_manifest("http://127.0.0.1:1/data")).unwrap();

        let config = config_with_empty_whitelist(dir.path());
        // First tick only adds the finalizer and requeues immediately,
        // mirroring the controller-runtime idiom of not doing further work
        // in the same tick as an API-visible finalizer patch.
        reconcile_once(&config, &manifest_path, true).unwrap();
        reconcile_once(&config, &manifest_path, true).unwrap();

        let updated = std::fs::read_to_string(&manifest_path).unwrap();
        let resource: ExternalSource = serde_yaml::from_str(&updated).unwrap();
        let status = resource.status.expect("status written back");
        assert!(
            status
                .conditions
                .get(excon_types::ConditionType::Ready)
                .is_some()
        );
        assert!(
            resource
                .metadata
                .finalizers
                .unwrap_or_default()
                .contains(&FINALIZER.to_string())
        );
    }

    #[test]
    fn build_reconciler_with_default_config_succeeds() {
        let dir = tempdir().unwrap();
        let config = config_with_empty_whitelist(dir.path());
        build_reconciler(&config).unwrap();
    }

    #[test]
    fn build_storage_rejects_object_store_without_endpoint() {
        let mut config = Config::default();
        config.storage.backend = StorageBackendKind::ObjectStore;
        assert!(build_storage(&config).is_err());
    }

    #[test]
    fn sample_manifest_round_trips_through_generator_spec() {
        let raw = sample_manifest("http://example.invalid/data");
        let resource: ExternalSource = serde_yaml::from_str(&raw).unwrap();
        match resource.spec.generator {
            GeneratorSpec::Http {
                http: HttpGeneratorSpec { url, .. },
            } => assert_eq!(url, "http://example.invalid/data"),
        }
    }
}
