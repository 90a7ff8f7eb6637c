//! HTTP plane serving `GET /<key>` from a [`StorageBackend`], independent
//! of the reconciler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use excon_storage::{StorageBackend, StorageError};

/// Run the artifact server until `shutdown` is set.
pub fn run_artifact_server(
    server: &tiny_http::Server,
    storage: &dyn StorageBackend,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            log::info!("artifact server shutting down");
            return;
        }

        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, storage),
            Ok(None) => continue,
            Err(e) => {
                log::error!("artifact server accept error: {e}");
                return;
            }
        }
    }
}

fn handle_request(request: tiny_http::Request, storage: &dyn StorageBackend) {
    if *request.method() != tiny_http::Method::Get {
        let _ = request.respond(text_response(405, "method not allowed"));
        return;
    }

    let key = request.url().trim_start_matches('/').to_string();
    if key.is_empty() {
        let _ = request.respond(text_response(400, "empty key"));
        return;
    }

    match storage.get(&key) {
        Ok(data) => {
            let response = tiny_http::Response::from_data(data)
                .with_status_code(tiny_http::StatusCode(200))
                .with_header(header("Content-Type", "application/gzip"))
                .with_header(header(
                    "Content-Disposition",
                    &format!("attachment; filename=\"{key}\""),
                ))
                .with_header(header("Cache-Control", "public, max-age=31536000, immutable"));
            let _ = request.respond(response);
        }
        Err(StorageError::NotFound { .. }) => {
            let _ = request.respond(text_response(404, "not found"));
        }
        Err(StorageError::InvalidKey { reason, .. }) => {
            let _ = request.respond(text_response(400, &reason));
        }
        Err(StorageError::Unavailable(message)) => {
            log::error!("storage backend unavailable serving {key}: {message}");
            let _ = request.respond(text_response(503, "storage backend unavailable"));
        }
    }
}

fn header(field: &str, value: &str) -> tiny_http::Header {
    tiny_http::Header::from_bytes(field.as_bytes(), value.as_bytes())
        .expect("static header names/values are always valid")
}

fn text_response(status: u16, body: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    tiny_http::Response::from_data(body.as_bytes().to_vec())
        .with_status_code(tiny_http::StatusCode(status))
        .with_header(header("Content-Type", "text/plain"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use excon_storage::MemoryStorage;
    use std::net::TcpListener;

    fn spawn_server(storage: Arc<dyn StorageBackend>) -> (String, Arc<AtomicBool>, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tiny_http::Server::from_listener(listener, None).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = std::thread::spawn(move || {
            run_artifact_server(&server, storage.as_ref(), shutdown_clone);
        });

        (format!("http://{addr}"), shutdown, handle)
    }

    #[test]
    fn serves_stored_artifact_with_expected_headers() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::default());
        storage.put("artifacts/src/deadbeef.tar.gz", b"blob").unwrap();
        let (base_url, shutdown, handle) = spawn_server(storage);

        let client = reqwest::blocking::Client::new();
        let response = client
            .get(format!("{base_url}/artifacts/src/deadbeef.tar.gz"))
            .send()
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/gzip"
        );
        assert!(response
            .headers()
            .get("Cache-Control")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("immutable"));
        assert_eq!(response.bytes().unwrap().as_ref(), b"blob");

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn missing_key_is_not_found() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::default());
        let (base_url, shutdown, handle) = spawn_server(storage);

        let client = reqwest::blocking::Client::new();
        let response = client.get(format!("{base_url}/nope")).send().unwrap();
        assert_eq!(response.status(), 404);

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn non_get_method_is_rejected() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::default());
        let (base_url, shutdown, handle) = spawn_server(storage);

        let client = reqwest::blocking::Client::new();
        let response = client.post(format!("{base_url}/key")).send().unwrap();
        assert_eq!(response.status(), 405);

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn empty_path_is_bad_request() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::default());
        let (base_url, shutdown, handle) = spawn_server(storage);

        let client = reqwest::blocking::Client::new();
        let response = client.get(&base_url).send().unwrap();
        assert_eq!(response.status(), 400);

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
