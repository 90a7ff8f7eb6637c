//! Hook-executor client and sidecar server.
//!
//! A hook application is a single command invocation receiving `input` on
//! stdin and emitting `output` on stdout. Dispatch is delegated to a
//! sidecar process over a small JSON-over-HTTP protocol so the reconciler
//! never spawns arbitrary subprocesses itself.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use excon_types::Hook;
use excon_whitelist::Whitelist;
use serde::{Deserialize, Serialize};

/// Wire request sent to the sidecar's `/execute` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Command to run (no shell is involved).
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Human-readable timeout, e.g. `"30s"`.
    pub timeout: String,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Base64-encoded stdin payload.
    pub stdin: String,
}

/// Wire response from the sidecar's `/execute` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Base64-encoded stdout.
    pub stdout: String,
    /// Base64-encoded stderr.
    pub stderr: String,
    /// Process exit code (`-1` if the process was killed for timeout).
    pub exit_code: i32,
}

/// Errors from dispatching a single hook.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The whitelist denied this command before the sidecar was contacted.
    #[error("whitelist denial: command {command:?} not allowed")]
    NotAllowed {
        /// The denied command.
        command: String,
    },
    /// The sidecar could not be reached, or returned a non-200 status.
    #[error("hook executor unavailable: {0}")]
    ExecutorUnavailable(String),
    /// The command ran but exited non-zero.
    #[error("hook failed: {stderr}")]
    HookFailed {
        /// Decoded stderr from the failed invocation.
        stderr: String,
    },
}

/// Client for the hook-executor sidecar's wire protocol.
pub struct HookExecutorClient {
    http: reqwest::blocking::Client,
    endpoint: String,
}

impl HookExecutorClient {
    /// Build a client against `endpoint` (e.g. `http://127.0.0.1:9095`).
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Send one `/execute` request with `deadline` as the overall HTTP
    /// timeout.
    pub fn execute(
        &self,
        request: &ExecuteRequest,
        deadline: Instant,
    ) -> Result<ExecuteResponse, HookError> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        let url = format!("{}/execute", self.endpoint.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .map_err(|e| HookError::ExecutorUnavailable(e.to_string()))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(HookError::ExecutorUnavailable(format!(
                "sidecar returned {}",
                response.status()
            )));
        }

        response
            .json::<ExecuteResponse>()
            .map_err(|e| HookError::ExecutorUnavailable(format!("invalid sidecar response: {e}")))
    }
}

/// Dispatch a single hook: recheck the whitelist, send one request, decode
/// the result.
///
/// `default_timeout` is used when `hook.timeout` fails to parse.
pub fn dispatch_hook(
    whitelist: &Whitelist,
    client: &HookExecutorClient,
    hook: &Hook,
    input: &[u8],
    default_timeout: Duration,
) -> Result<Vec<u8>, HookError> {
    if !whitelist.is_allowed(&hook.command, &hook.args) {
        return Err(HookError::NotAllowed {
            command: hook.command.clone(),
        });
    }

    let timeout = excon_duration::parse_duration(&hook.timeout).unwrap_or(default_timeout);
    let env = hook
        .env
        .iter()
        .map(|e| (e.name.clone(), e.value.clone()))
        .collect();

    let request = ExecuteRequest {
        command: hook.command.clone(),
        args: hook.args.clone(),
        timeout: humantime::format_duration(timeout).to_string(),
        env,
        stdin: BASE64.encode(input),
    };

    let deadline = Instant::now() + timeout + Duration::from_secs(1);
    let response = client.execute(&request, deadline)?;

    if response.exit_code != 0 {
        let stderr = BASE64
            .decode(&response.stderr)
            .map(|b| String::from_utf8_lossy(&b).to_string())
            .unwrap_or(response.stderr);
        return Err(HookError::HookFailed { stderr });
    }

    BASE64
        .decode(&response.stdout)
        .map_err(|e| HookError::ExecutorUnavailable(format!("invalid base64 stdout: {e}")))
}

// ---------------------------------------------------------------------
// Sidecar server
// ---------------------------------------------------------------------

/// Run the hook-executor sidecar, serving `/execute` (POST) and `/health`
/// (GET) until `shutdown` is set.
///
/// Every incoming `/execute` request is revalidated against `whitelist`
/// before the process is spawned, independent of any client-side check.
pub fn run_sidecar_server(
    server: &tiny_http::Server,
    whitelist: &Whitelist,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            log::info!("hook sidecar shutting down");
            return;
        }

        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, whitelist),
            Ok(None) => continue,
            Err(e) => {
                log::error!("sidecar accept error: {e}");
                return;
            }
        }
    }
}

fn handle_request(mut request: tiny_http::Request, whitelist: &Whitelist) {
    let method = request.method().clone();
    let url = request.url().to_string();

    let response = match (method, url.as_str()) {
        (tiny_http::Method::Get, "/health") => {
            json_response(200, r#"{"status":"healthy"}"#)
        }
        (tiny_http::Method::Post, "/execute") => {
            let mut body = String::new();
            if request.as_reader().read_to_string(&mut body).is_err() {
                json_response(400, r#"{"error":"failed to read request body"}"#)
            } else {
                match serde_json::from_str::<ExecuteRequest>(&body) {
                    Ok(exec_request) => execute_and_respond(exec_request, whitelist),
                    Err(e) => json_response(400, &format!(r#"{{"error":"{e}"}}"#)),
                }
            }
        }
        _ => json_response(405, r#"{"error":"method not allowed"}"#),
    };

    let _ = request.respond(response);
}

fn execute_and_respond(exec_request: ExecuteRequest, whitelist: &Whitelist) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    if !whitelist.is_allowed(&exec_request.command, &exec_request.args) {
        return json_response(403, r#"{"error":"whitelist denial"}"#);
    }

    let stdin_bytes = match BASE64.decode(&exec_request.stdin) {
        Ok(b) => b,
        Err(_) => return json_response(400, r#"{"error":"invalid base64 stdin"}"#),
    };

    let timeout = excon_duration::parse_duration(&exec_request.timeout)
        .unwrap_or(Duration::from_secs(30));

    let output = run_with_timeout(
        &exec_request.command,
        &exec_request.args,
        &exec_request.env,
        &stdin_bytes,
        timeout,
    );

    let body = ExecuteResponse {
        stdout: BASE64.encode(&output.stdout),
        stderr: BASE64.encode(&output.stderr),
        exit_code: output.exit_code,
    };
    let json = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
    json_response(200, &json)
}

struct RawOutput {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Spawn `command` without a shell, write `stdin_bytes`, poll for
/// completion, and terminate on `timeout`.
fn run_with_timeout(
    command: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    stdin_bytes: &[u8],
    timeout: Duration,
) -> RawOutput {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return RawOutput {
                exit_code: -1,
                stdout: Vec::new(),
                stderr: format!("failed to spawn {command}: {e}").into_bytes(),
            };
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(stdin_bytes);
    }

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return RawOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                };
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let mut stderr = read_pipe(child.stderr.take());
                    stderr.extend_from_slice(
                        format!("\n{command} timed out after {}", humantime::format_duration(timeout))
                            .as_bytes(),
                    );
                    return RawOutput {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr,
                    };
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                return RawOutput {
                    exit_code: -1,
                    stdout: Vec::new(),
                    stderr: format!("failed to poll {command}: {e}").into_bytes(),
                };
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    buffer
}

fn json_response(status: u16, body: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap();
    tiny_http::Response::from_data(body.as_bytes().to_vec())
        .with_status_code(tiny_http::StatusCode(status))
        .with_header(header)
}
