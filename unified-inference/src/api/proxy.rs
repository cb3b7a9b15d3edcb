//! Generic proxy: every unmatched path is forwarded to a model backend.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use serde_json::Value;

use crate::error::Result;
use crate::router::ForwardRequest;
use crate::state::AppState;

/// ANY /{path}
///
/// Model from the JSON body or `?model=`, then validate, start if needed,
/// apply offload and forward.
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let query: HashMap<String, String> = Query::try_from_uri(&uri)
        .map(|Query(query)| query)
        .unwrap_or_default();
    // Bodies that are not JSON simply carry no model.
    let json: Option<Value> = if body.is_empty() {
        None
    } else {
        serde_json::from_slice(&body).ok()
    };

    let path = uri.path().to_string();
    let name = state
        .selector
        .model_for_request(json.as_ref(), &query, &path)?;
    state.selector.validate_model(&name)?;

    let backend = state.selector.select_backend(&name).await?;
    let backend = state
        .offload
        .select_backend_with_offload(&name, backend)
        .await?;

    let request = ForwardRequest {
        method,
        path,
        query: uri.query().map(str::to_string),
        headers,
        body,
    };
    state.proxy.forward(backend.as_ref(), request).await
}
