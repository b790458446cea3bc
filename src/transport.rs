//! Request surface for Shapley computations.
//!
//! Transport-agnostic handlers for the six external operations. Each handler
//! takes the raw request (content type and body bytes), validates it, calls
//! into the estimator or the config store, and returns a status code with a
//! JSON body. The HTTP server in `server` is a thin adapter over this module.
//!
//! Errors are reported as `{"error": {"kind": ..., "message": ...}}`. Full
//! diagnostics go to the log only; messages returned to callers are bounded
//! and never carry internal state.

use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, error, warn};

use crate::config::SamplingParams;
use crate::error::{ErrorKind, ExecutorError, NormshapError, NormshapResult, ParameterError, ValidationError};
use crate::model::{ModelFactory, ValueFunction};
use crate::norms::{NormPatch, NormativeSystem};
use crate::shapley::ShapleyEstimator;
use crate::store::NormativeConfigStore;

/// Maximum accepted request body size.
pub const MAX_BODY_BYTES: usize = 1024 * 1024; // 1 MiB

/// Status code and JSON body produced by a handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceResponse {
    /// HTTP-style status code.
    pub status: u16,
    /// JSON response body.
    pub body: JsonValue,
}

impl ServiceResponse {
    fn ok(body: JsonValue) -> Self {
        Self { status: 200, body }
    }

    /// Builds the error response for `err`.
    #[must_use]
    pub fn from_error(err: &NormshapError) -> Self {
        Self {
            status: status_for(err),
            body: json!({
                "error": {
                    "kind": err.kind(),
                    "message": err.public_message(),
                }
            }),
        }
    }

    /// True for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// HTTP-style status for an error.
#[must_use]
pub fn status_for(err: &NormshapError) -> u16 {
    match err {
        NormshapError::Validation(ValidationError::UnsupportedContentType) => 415,
        NormshapError::Validation(ValidationError::BodyTooLarge { .. }) => 413,
        NormshapError::Validation(_) | NormshapError::InvalidParameter(_) => 400,
        NormshapError::ConfigMismatch(_) => 422,
        NormshapError::Executor(ExecutorError::Cancelled) => 503,
        NormshapError::Executor(_) | NormshapError::Internal { .. } => 500,
    }
}

/// Parsed self-contained computation request.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineRequest {
    /// Baseline norms.
    pub baseline_norms: NormativeSystem,
    /// Current norms.
    pub normative_system: NormativeSystem,
    /// Target norm.
    pub norm: String,
    /// Defaults to the stored value when absent.
    pub path_length: Option<usize>,
    /// Defaults to the stored value when absent.
    pub path_sample: Option<usize>,
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

fn check_size(body: &[u8]) -> Result<(), ValidationError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(ValidationError::BodyTooLarge {
            max_bytes: MAX_BODY_BYTES,
        });
    }
    Ok(())
}

fn raw_text(body: &[u8]) -> Result<&str, ValidationError> {
    check_size(body)?;
    std::str::from_utf8(body)
        .map(str::trim)
        .map_err(|_| ValidationError::MalformedBody {
            reason: "body must be UTF-8 text".to_string(),
        })
}

fn json_object(content_type: Option<&str>, body: &[u8]) -> Result<Map<String, JsonValue>, ValidationError> {
    if !is_json(content_type) {
        return Err(ValidationError::UnsupportedContentType);
    }
    check_size(body)?;
    let value: JsonValue = serde_json::from_slice(body).map_err(|e| ValidationError::MalformedBody {
        reason: format!("invalid JSON at line {} column {}", e.line(), e.column()),
    })?;
    match value {
        JsonValue::Object(map) => Ok(map),
        _ => Err(ValidationError::MalformedBody {
            reason: "params must be passed as a JSON object".to_string(),
        }),
    }
}

fn wrong_type(field: &str, expected: &str) -> ValidationError {
    ValidationError::WrongType {
        field: field.to_string(),
        expected: expected.to_string(),
    }
}

/// Decodes a `{norm_id: {param: value}}` object.
fn normative_system(field: &str, value: JsonValue) -> Result<NormativeSystem, ValidationError> {
    let JsonValue::Object(norms) = &value else {
        return Err(wrong_type(field, "object"));
    };
    if let Some((id, _)) = norms.iter().find(|(_, params)| !params.is_object()) {
        return Err(wrong_type(&format!("{field}.{id}"), "object"));
    }
    serde_json::from_value(value).map_err(|_| wrong_type(field, "object of objects"))
}

/// Parses a raw norm identifier.
pub fn parse_norm_id(body: &[u8]) -> Result<String, ValidationError> {
    let text = raw_text(body)?;
    if text.is_empty() {
        return Err(ValidationError::EmptyNormId);
    }
    Ok(text.to_string())
}

/// Parses a raw positive integer parameter.
pub fn parse_positive(field: &str, body: &[u8]) -> NormshapResult<usize> {
    let text = raw_text(body)?;
    let value: i64 = text.parse().map_err(|_| wrong_type(field, "integer"))?;
    if value <= 0 {
        return Err(ParameterError::NotPositive {
            name: field.to_string(),
        }
        .into());
    }
    usize::try_from(value).map_err(|_| wrong_type(field, "integer").into())
}

/// Parses a norm patch (`{norm_id: {param: value}}`).
pub fn parse_patch(content_type: Option<&str>, body: &[u8]) -> Result<NormPatch, ValidationError> {
    let map = json_object(content_type, body)?;
    normative_system("patch", JsonValue::Object(map))
}

/// Parses and validates a self-contained computation request.
///
/// Field names are accepted in snake_case and in camelCase.
pub fn parse_inline(content_type: Option<&str>, body: &[u8]) -> Result<InlineRequest, ValidationError> {
    let mut map = json_object(content_type, body)?;
    let mut take = |snake: &str, camel: &str| match map.remove(snake) {
        Some(value) => Some(value),
        None => map.remove(camel),
    };

    let baseline = take("baseline_norms", "baselineNorms");
    let current = take("normative_system", "normativeSystem");
    let norm = take("norm", "norm");
    let path_length = take("path_length", "pathLength");
    let path_sample = take("path_sample", "pathSample");

    if let Some(unknown) = map.keys().next() {
        return Err(ValidationError::MalformedBody {
            reason: format!("unknown field '{unknown}'"),
        });
    }

    let baseline = baseline.ok_or_else(|| missing("baseline_norms"))?;
    let current = current.ok_or_else(|| missing("normative_system"))?;
    let norm = match norm.ok_or_else(|| missing("norm"))? {
        JsonValue::String(norm) if norm.trim().is_empty() => return Err(ValidationError::EmptyNormId),
        JsonValue::String(norm) => norm,
        _ => return Err(wrong_type("norm", "string")),
    };

    Ok(InlineRequest {
        baseline_norms: normative_system("baseline_norms", baseline)?,
        normative_system: normative_system("normative_system", current)?,
        norm,
        path_length: optional_count("path_length", path_length)?,
        path_sample: optional_count("path_sample", path_sample)?,
    })
}

fn missing(field: &str) -> ValidationError {
    ValidationError::MissingField {
        field: field.to_string(),
    }
}

fn optional_count(field: &str, value: Option<JsonValue>) -> Result<Option<usize>, ValidationError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| wrong_type(field, "non-negative integer")),
    }
}

/// Handlers for the external operations over one estimator and one store.
pub struct ShapleyService<F, V> {
    estimator: ShapleyEstimator<F, V>,
    store: NormativeConfigStore,
}

impl<F, V> ShapleyService<F, V>
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    /// Serves `estimator` over `store`.
    pub fn new(estimator: ShapleyEstimator<F, V>, store: NormativeConfigStore) -> Self {
        Self { estimator, store }
    }

    /// The estimator used for every computation.
    #[must_use]
    pub const fn estimator(&self) -> &ShapleyEstimator<F, V> {
        &self.estimator
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &NormativeConfigStore {
        &self.store
    }

    /// Shapley value of a norm (raw id body) over the stored configuration.
    pub fn compute_stored(&self, body: &[u8]) -> ServiceResponse {
        respond("compute_stored", || {
            let norm = parse_norm_id(body)?;
            let shapley = self.estimator.compute_from_store(&norm, &self.store)?;
            Ok(json!({ "shapley": shapley }))
        })
    }

    /// Shallow merge into the stored baseline norms.
    pub fn patch_baseline(&self, content_type: Option<&str>, body: &[u8]) -> ServiceResponse {
        respond("patch_baseline", || {
            let patch = parse_patch(content_type, body)?;
            self.store.patch_baseline(&patch)?;
            Ok(json!({}))
        })
    }

    /// Shallow merge into the stored current norms.
    pub fn patch_current(&self, content_type: Option<&str>, body: &[u8]) -> ServiceResponse {
        respond("patch_current", || {
            let patch = parse_patch(content_type, body)?;
            self.store.patch_current(&patch)?;
            Ok(json!({}))
        })
    }

    /// `PATCH /path_length`: body is a positive integer.
    pub fn patch_path_length(&self, body: &[u8]) -> ServiceResponse {
        respond("patch_path_length", || {
            self.store.set_path_length(parse_positive("path_length", body)?)?;
            Ok(json!({}))
        })
    }

    /// `PATCH /path_sample`: body is a positive integer.
    pub fn patch_path_sample(&self, body: &[u8]) -> ServiceResponse {
        respond("patch_path_sample", || {
            self.store.set_path_sample(parse_positive("path_sample", body)?)?;
            Ok(json!({}))
        })
    }

    /// Self-contained computation; the stored configuration is not used.
    pub fn compute_inline(&self, content_type: Option<&str>, body: &[u8]) -> ServiceResponse {
        respond("compute_inline", || {
            let request = parse_inline(content_type, body)?;
            let defaults = self.estimator.config().sampling;
            let params = SamplingParams::new(
                request.path_length.unwrap_or(defaults.path_length),
                request.path_sample.unwrap_or(defaults.path_sample),
            );
            let shapley = self.estimator.compute(
                &request.norm,
                &request.baseline_norms,
                &request.normative_system,
                params,
            )?;
            Ok(json!({ "shapley": shapley }))
        })
    }
}

fn respond(operation: &'static str, handler: impl FnOnce() -> NormshapResult<JsonValue>) -> ServiceResponse {
    match handler() {
        Ok(body) => ServiceResponse::ok(body),
        Err(err) => {
            match err.kind() {
                ErrorKind::ExecutorError | ErrorKind::Internal => {
                    error!(operation, error = %err, "request failed");
                }
                ErrorKind::ConfigMismatch => warn!(operation, error = %err, "request rejected"),
                ErrorKind::InvalidParameter | ErrorKind::ValidationError => {
                    debug!(operation, error = %err, "request rejected");
                }
            }
            ServiceResponse::from_error(&err)
        }
    }
}
