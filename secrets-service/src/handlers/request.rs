//! Client API: every `/v1/<path>` call becomes one pipeline request.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use service_core::error::AppError;
use service_core::middleware::tracing::RequestId;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use crate::models::{Operation, ReplicationState, Request};
use crate::AppState;

pub const TOKEN_HEADER: &str = "x-secrets-token";
pub const CONTROL_GROUP_TOKEN_HEADER: &str = "x-control-group-token";
pub const REPLICATION_INDEX_HEADER: &str = "x-replication-index";

#[derive(Debug, Default, Deserialize)]
pub struct RequestQuery {
    #[serde(default)]
    pub list: bool,
}

pub async fn handle(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<RequestQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let operation = match (&method, query.list) {
        (&Method::GET, true) => Operation::List,
        (&Method::GET, false) => Operation::Read,
        (&Method::POST, _) | (&Method::PUT, _) => Operation::Update,
        (&Method::DELETE, _) => Operation::Delete,
        _ => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "unsupported method {}",
                method
            )))
        }
    };

    let mut request = Request::new(operation, path).with_data(parse_body(&body)?);
    if let Some(Extension(RequestId(id))) = request_id {
        request.id = id;
    }
    if let Some(ConnectInfo(addr)) = connect_info {
        request = request.with_remote_addr(addr.ip().to_string());
    }
    if let Some(token) = client_token(&headers) {
        request = request.with_client_token(token);
    }
    if let Some(token) = header_str(&headers, CONTROL_GROUP_TOKEN_HEADER) {
        request = request.with_control_group_token(token);
    }
    if let Some(raw) = header_str(&headers, REPLICATION_INDEX_HEADER) {
        let index = raw.parse::<u64>().map_err(|_| {
            AppError::BadRequest(anyhow::anyhow!("invalid {} header", REPLICATION_INDEX_HEADER))
        })?;
        request = request.with_required_state(ReplicationState::new(index));
    }

    // Dropping the guard when the client disconnects cancels any wait in progress
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let response = state.core.handle_request(request, cancel).await?;
    let status = if response.is_control_group_pending() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

fn parse_body(body: &Bytes) -> Result<Map<String, Value>, AppError> {
    if body.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(_) => Err(AppError::BadRequest(anyhow::anyhow!(
            "request body must be a JSON object"
        ))),
        Err(e) => Err(AppError::BadRequest(anyhow::anyhow!("invalid JSON body: {}", e))),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn client_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, TOKEN_HEADER).or_else(|| {
        header_str(headers, AUTHORIZATION.as_str()).and_then(|v| v.strip_prefix("Bearer "))
    })
}
