//! HTTP implementation of [`RemoteSource`] against the dashboard backend.

use crate::config::SyncConfig;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use safespace_core::{
    AuthGrant, AuthProof, Credential, DatasetKind, DatasetPayload, FeedbackOutcome,
    FeedbackRecord, Identity, QueryParams, RemoteError, RemoteSource, Tenant, TenantId,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const API_PREFIX: &str = "/api/v1";

#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Config error: {0}")]
    Config(String),
}

/// `/auth/me` answers either `{ "user": {...} }` or the identity itself.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdentityBody {
    Wrapped { user: Identity },
    Bare(Identity),
}

/// `/servers` answers either `{ "servers": [...] }` or a bare list.
#[derive(Deserialize)]
#[serde(untagged)]
enum TenantsBody {
    Wrapped { servers: Vec<Tenant> },
    Bare(Vec<Tenant>),
}

#[derive(Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRemote {
    pub fn new(config: &SyncConfig) -> Result<Self, ApiClientError> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        let base_url = config.api_base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ApiClientError::Config(format!(
                "api_base_url must be an http(s) URL, got {:?}",
                config.api_base_url
            )));
        }
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        credential: &Credential,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, RemoteError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(credential.token())
            .query(query)
            .send()
            .await
            .map_err(|err| transport_error(err, self.timeout))?;
        parse_response(response, false).await
    }

    async fn post_json<T, B>(
        &self,
        credential: Option<&Credential>,
        path: &str,
        body: &B,
        rejectable: bool,
    ) -> Result<T, RemoteError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(credential) = credential {
            request = request.bearer_auth(credential.token());
        }
        let response = request
            .send()
            .await
            .map_err(|err| transport_error(err, self.timeout))?;
        parse_response(response, rejectable).await
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn exchange(&self, proof: &AuthProof) -> Result<AuthGrant, RemoteError> {
        debug!("Exchanging auth proof");
        self.post_json(None, "/auth/google", &json!({ "token": proof.as_str() }), true)
            .await
    }

    async fn verify(&self, credential: &Credential) -> Result<Identity, RemoteError> {
        let body: IdentityBody = self.get_json(credential, "/auth/me", &[]).await?;
        Ok(match body {
            IdentityBody::Wrapped { user } => user,
            IdentityBody::Bare(identity) => identity,
        })
    }

    async fn logout(&self, credential: &Credential) -> Result<(), RemoteError> {
        let _: Value = self
            .post_json(Some(credential), "/auth/logout", &json!({}), false)
            .await?;
        Ok(())
    }

    async fn list_tenants(&self, credential: &Credential) -> Result<Vec<Tenant>, RemoteError> {
        let body: TenantsBody = self.get_json(credential, "/servers", &[]).await?;
        Ok(match body {
            TenantsBody::Wrapped { servers } => servers,
            TenantsBody::Bare(servers) => servers,
        })
    }

    async fn fetch_dataset(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
        kind: DatasetKind,
        params: QueryParams,
    ) -> Result<DatasetPayload, RemoteError> {
        let params = params.normalized_for(kind);
        let path = dataset_path(tenant_id, kind);
        let body: Value = self
            .get_json(credential, &path, &query_pairs(params))
            .await?;
        decode_dataset(kind, params, body)
    }

    async fn submit_feedback(
        &self,
        credential: &Credential,
        record: &FeedbackRecord,
    ) -> Result<FeedbackOutcome, RemoteError> {
        let path = format!(
            "/servers/{}/violations/{}/feedback",
            record.tenant_id, record.violation_id
        );
        let body = json!({ "is_false_positive": record.label.is_false_positive() });
        let response: Value = self
            .post_json(Some(credential), &path, &body, true)
            .await?;
        Ok(feedback_outcome(&response))
    }
}

fn dataset_path(tenant_id: &TenantId, kind: DatasetKind) -> String {
    format!("/servers/{}/{}", tenant_id, kind.path_segment())
}

fn query_pairs(params: QueryParams) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();
    if let Some(days) = params.days {
        pairs.push(("days", days.to_string()));
    }
    if let Some(limit) = params.limit {
        pairs.push(("limit", limit.to_string()));
    }
    pairs
}

/// The backend returns bare lists for analytics and violations.
fn decode_dataset(
    kind: DatasetKind,
    params: QueryParams,
    body: Value,
) -> Result<DatasetPayload, RemoteError> {
    let body = match (kind, body) {
        (DatasetKind::Analytics, Value::Array(points)) => {
            json!({ "days": params.days.unwrap_or_default(), "points": points })
        }
        (DatasetKind::Violations, Value::Array(violations)) => {
            json!({ "violations": violations })
        }
        (_, body) => body,
    };
    DatasetPayload::decode(kind, body).map_err(|err| RemoteError::Decode {
        reason: format!("{} payload: {}", kind, err),
    })
}

/// Feedback responses carry `accepted`, or `success`, or only a message.
fn feedback_outcome(body: &Value) -> FeedbackOutcome {
    let accepted = body
        .get("accepted")
        .or_else(|| body.get("success"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    FeedbackOutcome {
        accepted,
        reason: if accepted { None } else { error_detail(body) },
    }
}

fn error_detail(body: &Value) -> Option<String> {
    ["detail", "reason", "message", "error"]
        .iter()
        .find_map(|field| body.get(*field).and_then(Value::as_str))
        .map(str::to_string)
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout { after: timeout }
    } else if err.is_connect() || err.is_request() {
        RemoteError::Unavailable {
            reason: err.to_string(),
        }
    } else if err.is_decode() {
        RemoteError::Decode {
            reason: err.to_string(),
        }
    } else {
        RemoteError::Unavailable {
            reason: err.to_string(),
        }
    }
}

fn status_error(status: StatusCode, text: String, rejectable: bool) -> RemoteError {
    match status.as_u16() {
        401 | 403 => RemoteError::Unauthorized,
        400 | 404 | 409 | 422 if rejectable => {
            let reason = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|body| error_detail(&body))
                .unwrap_or_else(|| text.trim().to_string());
            RemoteError::Rejected { reason }
        }
        code => RemoteError::Status { code, body: text },
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    rejectable: bool,
) -> Result<T, RemoteError> {
    let status = response.status();
    if status.is_success() {
        if status == StatusCode::NO_CONTENT {
            return serde_json::from_value(Value::Null).map_err(|err| RemoteError::Decode {
                reason: err.to_string(),
            });
        }
        response.json::<T>().await.map_err(|err| RemoteError::Decode {
            reason: err.to_string(),
        })
    } else {
        let text = response.text().await.unwrap_or_default();
        Err(status_error(status, text, rejectable))
    }
}
