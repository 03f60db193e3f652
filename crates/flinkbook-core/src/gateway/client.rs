use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::error::GatewayError;
use super::types::{
    Column, OpenSessionRequest, OperationHandle, OperationStatus, ResultKind, ResultPage, Row,
    SessionHandle,
};
use super::GatewayApi;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Version information reported by `/v1/info`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfo {
    pub product_name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenSessionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_name: Option<&'a str>,
    properties: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenSessionResponse {
    session_handle: String,
}

#[derive(Debug, Serialize)]
struct ExecuteStatementBody<'a> {
    statement: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteStatementResponse {
    operation_handle: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchResultsResponse {
    result_type: String,
    #[serde(rename = "jobID", default)]
    job_id: Option<String>,
    #[serde(default)]
    results: Option<ResultSetWire>,
    #[serde(default)]
    next_result_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultSetWire {
    #[serde(default)]
    columns: Vec<ColumnWire>,
    #[serde(default)]
    data: Vec<Row>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColumnWire {
    name: String,
    #[serde(default)]
    logical_type: Option<LogicalTypeWire>,
}

#[derive(Debug, Deserialize)]
struct LogicalTypeWire {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default = "nullable_default")]
    nullable: bool,
}

fn nullable_default() -> bool {
    true
}

impl From<ColumnWire> for Column {
    fn from(column: ColumnWire) -> Self {
        let (data_type, nullable) = match column.logical_type {
            Some(t) => (t.type_name, t.nullable),
            None => ("UNKNOWN".to_string(), true),
        };
        Column {
            name: column.name,
            data_type,
            nullable,
        }
    }
}

/// REST client for the Flink SQL Gateway v1 API.
#[derive(Debug, Clone)]
pub struct SqlGatewayClient {
    http: reqwest::Client,
    base: Url,
}

impl SqlGatewayClient {
    pub fn new(base_url: &str) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Self::with_http_client(http, base_url)
    }

    pub fn with_http_client(http: reqwest::Client, base_url: &str) -> Result<Self, GatewayError> {
        // Url::join drops the last path segment unless it ends with a slash.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized)
            .map_err(|e| GatewayError::InvalidUrl(format!("{base_url}: {e}")))?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url, GatewayError> {
        self.base
            .join(path)
            .map_err(|e| GatewayError::InvalidUrl(format!("{path}: {e}")))
    }

    fn operation_path(session: &SessionHandle, operation: &OperationHandle) -> String {
        format!("v1/sessions/{session}/operations/{operation}")
    }

    pub async fn info(&self) -> Result<GatewayInfo, GatewayError> {
        self.send_json(self.http.get(self.url("v1/info")?)).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, GatewayError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await?;
        let details = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(parsed) if !parsed.errors.is_empty() => parsed.errors.join("\n"),
            _ => body,
        };
        debug!(status = %status, details = %details, "SQL Gateway request failed");

        if status == StatusCode::NOT_FOUND || reports_missing_handle(&details) {
            Err(GatewayError::NotFound { details })
        } else {
            Err(GatewayError::Server {
                status_code: status.as_u16(),
                details,
            })
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, GatewayError> {
        let body = self.send(request).await?.text().await?;
        serde_json::from_str(&body).map_err(|e| GatewayError::ResponseParsing {
            details: format!("{e}: {body}"),
        })
    }

    fn page_from(&self, response: FetchResultsResponse) -> ResultPage {
        let (columns, rows) = match response.results {
            Some(results) => (
                results.columns.into_iter().map(Column::from).collect(),
                results.data,
            ),
            None => (Vec::new(), Vec::new()),
        };
        ResultPage {
            kind: ResultKind::from_gateway(&response.result_type),
            columns,
            rows,
            next_cursor: response
                .next_result_uri
                .as_deref()
                .and_then(|uri| next_cursor(&self.base, uri)),
            job_id: response.job_id,
        }
    }
}

/// The gateway reports unknown sessions and operations as internal errors.
fn reports_missing_handle(details: &str) -> bool {
    details.contains("does not exist") || details.contains("Can not find")
}

/// Extract the result token from a `nextResultUri` such as
/// `/v1/sessions/s/operations/o/result/3?rowFormat=JSON`.
fn next_cursor(base: &Url, uri: &str) -> Option<u64> {
    let url = base.join(uri).ok()?;
    let mut segments = url.path_segments()?;
    let token = segments.next_back()?;
    match segments.next_back() {
        Some("result") => token.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl GatewayApi for SqlGatewayClient {
    async fn open_session(
        &self,
        request: &OpenSessionRequest,
    ) -> Result<SessionHandle, GatewayError> {
        let body = OpenSessionBody {
            session_name: request.name.as_deref(),
            properties: &request.properties,
        };
        let response: OpenSessionResponse = self
            .send_json(self.http.post(self.url("v1/sessions")?).json(&body))
            .await?;
        Ok(SessionHandle::new(response.session_handle))
    }

    async fn session_exists(&self, session: &SessionHandle) -> Result<bool, GatewayError> {
        let url = self.url(&format!("v1/sessions/{session}"))?;
        match self.send(self.http.get(url)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn close_session(&self, session: &SessionHandle) -> Result<(), GatewayError> {
        let url = self.url(&format!("v1/sessions/{session}"))?;
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn submit_statement(
        &self,
        session: &SessionHandle,
        sql: &str,
    ) -> Result<OperationHandle, GatewayError> {
        let url = self.url(&format!("v1/sessions/{session}/statements"))?;
        let body = ExecuteStatementBody { statement: sql };
        let response: ExecuteStatementResponse =
            self.send_json(self.http.post(url).json(&body)).await?;
        Ok(OperationHandle::new(response.operation_handle))
    }

    async fn operation_status(
        &self,
        session: &SessionHandle,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, GatewayError> {
        let url = self.url(&format!(
            "{}/status",
            Self::operation_path(session, operation)
        ))?;
        let response: StatusResponse = self.send_json(self.http.get(url)).await?;
        Ok(OperationStatus::from_gateway(&response.status))
    }

    async fn fetch_results(
        &self,
        session: &SessionHandle,
        operation: &OperationHandle,
        cursor: u64,
    ) -> Result<ResultPage, GatewayError> {
        let mut url = self.url(&format!(
            "{}/result/{cursor}",
            Self::operation_path(session, operation)
        ))?;
        url.query_pairs_mut().append_pair("rowFormat", "JSON");
        let response: FetchResultsResponse = self.send_json(self.http.get(url)).await?;
        Ok(self.page_from(response))
    }

    async fn cancel_operation(
        &self,
        session: &SessionHandle,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, GatewayError> {
        let url = self.url(&format!(
            "{}/cancel",
            Self::operation_path(session, operation)
        ))?;
        let response: StatusResponse = self.send_json(self.http.post(url)).await?;
        Ok(OperationStatus::from_gateway(&response.status))
    }

    async fn close_operation(
        &self,
        session: &SessionHandle,
        operation: &OperationHandle,
    ) -> Result<(), GatewayError> {
        let url = self.url(&format!(
            "{}/close",
            Self::operation_path(session, operation)
        ))?;
        self.send(self.http.delete(url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::collections::HashMap;

    async fn serve(router: Router) -> SqlGatewayClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        SqlGatewayClient::new(&format!("http://{addr}")).unwrap()
    }

    #[test]
    fn test_next_cursor_parsing() {
        let base = Url::parse("http://localhost:8083/").unwrap();
        assert_eq!(
            next_cursor(&base, "/v1/sessions/s/operations/o/result/3?rowFormat=JSON"),
            Some(3)
        );
        assert_eq!(next_cursor(&base, "/v1/sessions/s/operations/o/status"), None);
        assert_eq!(next_cursor(&base, "/v1/sessions/s/operations/o/result/x"), None);
    }

    #[test]
    fn test_fetch_response_parsing() {
        let raw = json!({
            "resultType": "PAYLOAD",
            "isQueryResult": true,
            "jobID": "a1b2",
            "resultKind": "SUCCESS_WITH_CONTENT",
            "results": {
                "columns": [
                    {"name": "id", "logicalType": {"type": "INTEGER", "nullable": false}},
                    {"name": "name", "logicalType": {"type": "VARCHAR", "nullable": true, "length": 10}}
                ],
                "rowFormat": "JSON",
                "data": [
                    {"kind": "INSERT", "fields": [1, "a"]},
                    {"kind": "DELETE", "fields": [2, null]}
                ]
            },
            "nextResultUri": "/v1/sessions/s/operations/o/result/1?rowFormat=JSON"
        });
        let response: FetchResultsResponse = serde_json::from_value(raw).unwrap();
        let client = SqlGatewayClient::new("http://localhost:8083").unwrap();
        let page = client.page_from(response);

        assert_eq!(page.kind, ResultKind::Payload);
        assert_eq!(page.job_id.as_deref(), Some("a1b2"));
        assert_eq!(page.next_cursor, Some(1));
        assert_eq!(page.columns[0].data_type, "INTEGER");
        assert!(!page.columns[0].nullable);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[1].kind, crate::gateway::RowKind::Delete);
    }

    #[test]
    fn test_end_of_stream_without_results() {
        let response: FetchResultsResponse =
            serde_json::from_value(json!({"resultType": "EOS"})).unwrap();
        let client = SqlGatewayClient::new("http://localhost:8083").unwrap();
        let page = client.page_from(response);
        assert_eq!(page.kind, ResultKind::EndOfStream);
        assert!(page.rows.is_empty());
        assert_eq!(page.next_cursor, None);
    }

    #[tokio::test]
    async fn test_session_lifecycle_round_trip() {
        let router = Router::new()
            .route(
                "/v1/sessions",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["properties"]["execution.runtime-mode"], "streaming");
                    Json(json!({"sessionHandle": "sess-1"}))
                }),
            )
            .route(
                "/v1/sessions/{session}",
                get(|Path(session): Path<String>| async move {
                    if session == "sess-1" {
                        (AxumStatus::OK, Json(json!({"properties": {}})))
                    } else {
                        (
                            AxumStatus::INTERNAL_SERVER_ERROR,
                            Json(json!({"errors": [format!("Session '{session}' does not exist.")]})),
                        )
                    }
                }),
            );
        let client = serve(router).await;

        let mut properties = BTreeMap::new();
        properties.insert("execution.runtime-mode".to_string(), "streaming".to_string());
        let session = client
            .open_session(&OpenSessionRequest {
                name: None,
                properties,
            })
            .await
            .unwrap();
        assert_eq!(session.as_str(), "sess-1");
        assert!(client.session_exists(&session).await.unwrap());
        assert!(
            !client
                .session_exists(&SessionHandle::new("gone"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_statement_submission_and_fetch() {
        let router = Router::new()
            .route(
                "/v1/sessions/{session}/statements",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["statement"], "SELECT 1");
                    Json(json!({"operationHandle": "op-1"}))
                }),
            )
            .route(
                "/v1/sessions/{session}/operations/{op}/status",
                get(|| async { Json(json!({"status": "RUNNING"})) }),
            )
            .route(
                "/v1/sessions/{session}/operations/{op}/result/{token}",
                get(
                    |Path((_, _, token)): Path<(String, String, u64)>,
                     Query(query): Query<HashMap<String, String>>| async move {
                        assert_eq!(query.get("rowFormat").map(String::as_str), Some("JSON"));
                        Json(json!({
                            "resultType": "PAYLOAD",
                            "results": {"columns": [], "data": [{"kind": "INSERT", "fields": [token]}]},
                            "nextResultUri": format!("/v1/sessions/s/operations/o/result/{}", token + 1)
                        }))
                    },
                ),
            );
        let client = serve(router).await;

        let session = SessionHandle::new("s");
        let op = client.submit_statement(&session, "SELECT 1").await.unwrap();
        assert_eq!(op.as_str(), "op-1");
        assert_eq!(
            client.operation_status(&session, &op).await.unwrap(),
            OperationStatus::Running
        );

        let page = client.fetch_results(&session, &op, 4).await.unwrap();
        assert_eq!(page.rows[0].fields, vec![json!(4)]);
        assert_eq!(page.next_cursor, Some(5));
    }

    #[tokio::test]
    async fn test_error_classification() {
        let router = Router::new().route(
            "/v1/sessions/{session}/operations/{op}/status",
            get(|Path((_, op)): Path<(String, String)>| async move {
                match op.as_str() {
                    "missing" => (
                        AxumStatus::INTERNAL_SERVER_ERROR,
                        Json(json!({"errors": ["Can not find the submitted operation"]})),
                    ),
                    "bad" => (
                        AxumStatus::BAD_REQUEST,
                        Json(json!({"errors": ["Invalid statement"]})),
                    ),
                    _ => (
                        AxumStatus::SERVICE_UNAVAILABLE,
                        Json(json!({"errors": ["busy"]})),
                    ),
                }
            }),
        );
        let client = serve(router).await;
        let session = SessionHandle::new("s");

        let missing = client
            .operation_status(&session, &OperationHandle::new("missing"))
            .await
            .unwrap_err();
        assert!(missing.is_not_found());

        let bad = client
            .operation_status(&session, &OperationHandle::new("bad"))
            .await
            .unwrap_err();
        assert!(matches!(bad, GatewayError::Server { status_code: 400, .. }));
        assert!(!bad.is_transient());
        assert_eq!(bad.details(), "Invalid statement");

        let busy = client
            .operation_status(&session, &OperationHandle::new("busy"))
            .await
            .unwrap_err();
        assert!(busy.is_transient());
    }
}
