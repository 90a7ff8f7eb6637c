//! Expression-language transformation of fetched bytes.
//!
//! The only variant today is `cel`: a CEL-style expression evaluated once
//! per call against the fetched payload, bound as both `input` and `data`.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use cel_interpreter::{Context, Program, Value as CelValue};
use cel_interpreter::objects::Key as CelKey;

/// Errors from [`transform`].
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The expression failed to compile. Not retryable; the resource is
    /// misconfigured until its generation changes.
    #[error("failed to compile expression: {0}")]
    ConfigurationError(String),
    /// Evaluation exceeded its deadline.
    #[error("expression evaluation exceeded its deadline")]
    Timeout,
    /// Evaluation itself failed (e.g. a runtime type error in the
    /// expression). Treated as transient: a future retry may see different
    /// input.
    #[error("expression evaluation failed: {0}")]
    EvaluationError(String),
    /// The expression produced a value this transformer cannot serialise.
    #[error("unsupported result type from expression")]
    UnsupportedResultType,
}

/// Evaluate `expression` over `input`, returning the serialised result.
///
/// `input` is parsed as JSON if possible; otherwise it is bound as a raw
/// string. `timeout` bounds evaluation via a watchdog thread — on expiry
/// the caller gets [`TransformError::Timeout`] immediately, though the
/// spawned evaluation thread is not forcibly killed (CEL exposes no
/// cooperative cancellation hook) and is left to finish and be dropped.
pub fn transform(input: &[u8], expression: &str, timeout: Duration) -> Result<Vec<u8>, TransformError> {
    let program = Program::compile(expression)
        .map_err(|e| TransformError::ConfigurationError(e.to_string()))?;

    let bound = bind_input(input);

    let mut context = Context::default();
    context
        .add_variable("input", bound.clone())
        .map_err(|e| TransformError::ConfigurationError(e.to_string()))?;
    context
        .add_variable("data", bound)
        .map_err(|e| TransformError::ConfigurationError(e.to_string()))?;

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = program
            .execute(&context)
            .map_err(|e| e.to_string());
        let _ = tx.send(result);
    });

    let result = rx
        .recv_timeout(timeout)
        .map_err(|_| TransformError::Timeout)?
        .map_err(TransformError::EvaluationError)?;

    render_result(result)
}

/// Parse `input` as JSON; on failure, bind it as a UTF-8 (lossy) string.
fn bind_input(input: &[u8]) -> CelValue {
    match serde_json::from_slice::<serde_json::Value>(input) {
        Ok(json) => json_to_cel(&json),
        Err(_) => CelValue::String(String::from_utf8_lossy(input).into_owned().into()),
    }
}

fn json_to_cel(value: &serde_json::Value) -> CelValue {
    match value {
        serde_json::Value::Null => CelValue::Null,
        serde_json::Value::Bool(b) => CelValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                CelValue::UInt(u)
            } else {
                CelValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => CelValue::String(s.clone().into()),
        serde_json::Value::Array(items) => {
            CelValue::List(items.iter().map(json_to_cel).collect::<Vec<_>>().into())
        }
        serde_json::Value::Object(map) => {
            let converted = map
                .iter()
                .map(|(k, v)| (CelKey::String(k.clone().into()), json_to_cel(v)))
                .collect();
            CelValue::Map(cel_interpreter::objects::Map { map: converted })
        }
    }
}

/// Serialise the evaluation result per the spec's rules: string/bytes pass
/// through raw; everything else is JSON-encoded (lists/maps recursively).
fn render_result(value: CelValue) -> Result<Vec<u8>, TransformError> {
    match value {
        CelValue::String(s) => Ok(s.as_bytes().to_vec()),
        CelValue::Bytes(b) => Ok((*b).clone()),
        other => {
            let json = cel_to_json(&other)?;
            serde_json::to_vec(&json).map_err(|e| TransformError::EvaluationError(e.to_string()))
        }
    }
}

fn cel_to_json(value: &CelValue) -> Result<serde_json::Value, TransformError> {
    match value {
        CelValue::Null => Ok(serde_json::Value::Null),
        CelValue::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        CelValue::Int(i) => Ok(serde_json::json!(i)),
        CelValue::UInt(u) => Ok(serde_json::json!(u)),
        CelValue::Float(f) => Ok(serde_json::json!(f)),
        CelValue::String(s) => Ok(serde_json::Value::String(s.to_string())),
        // JSON has no byte-string type; nested bytes inside a list/map are
        // encoded as a plain UTF-8-lossy string rather than pulling in a
        // base64 round-trip contract nothing downstream expects.
        CelValue::Bytes(b) => Ok(serde_json::Value::String(String::from_utf8_lossy(b).into_owned())),
        CelValue::List(items) => {
            let converted = items
                .iter()
                .map(cel_to_json)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(serde_json::Value::Array(converted))
        }
        CelValue::Map(map) => {
            let mut object = serde_json::Map::new();
            for (key, val) in map.map.iter() {
                object.insert(key_to_string(key), cel_to_json(val)?);
            }
            Ok(serde_json::Value::Object(object))
        }
        _ => Err(TransformError::UnsupportedResultType),
    }
}

fn key_to_string(key: &CelKey) -> String {
    match key {
        CelKey::Int(i) => i.to_string(),
        CelKey::Uint(u) => u.to_string(),
        CelKey::Bool(b) => b.to_string(),
        CelKey::String(s) => s.to_string(),
    }
}
