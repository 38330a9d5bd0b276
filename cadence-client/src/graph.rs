//! Remote graph API access.
//!
//! Every operation is one POST of `{operationName, query, variables}` to a
//! single endpoint, answered by `{data, errors}`. The [`GraphClient`] turns
//! catalogue operations into query and mutation descriptors whose keys are
//! `[operation, variables]`.

use async_trait::async_trait;
use cadence_core::{FetchError, KeyError, QueryKey, RemoteErrorDetail};
use cadence_query::{AbortSignal, MutationDescriptor, QueryDescriptor};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::{ClientConfig, ConfigLoadError};
use crate::error::{ClientError, ClientResult};
use crate::operations::OperationCatalog;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRequest {
    pub operation_name: String,
    pub query: String,
    pub variables: Value,
}

/// One error as the graph API reports it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default)]
    pub path: Vec<Value>,
    #[serde(default)]
    pub extensions: Option<Value>,
}

impl From<WireError> for RemoteErrorDetail {
    fn from(wire: WireError) -> Self {
        let path = wire
            .path
            .into_iter()
            .map(|segment| match segment {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
        let code = wire
            .extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(Value::as_str)
            .map(str::to_string);
        RemoteErrorDetail {
            message: wire.message,
            path,
            code,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GraphResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<WireError>,
}

impl GraphResponse {
    pub fn with_data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn with_errors(errors: Vec<WireError>) -> Self {
        Self { data: None, errors }
    }

    /// Extract `data[root_field]`, turning a reported error list into
    /// [`FetchError::Remote`].
    pub fn into_result(self, root_field: &str) -> Result<Value, FetchError> {
        if !self.errors.is_empty() {
            return Err(FetchError::Remote {
                errors: self.errors.into_iter().map(Into::into).collect(),
            });
        }
        let mut data = self.data.ok_or_else(|| FetchError::Decode {
            key: root_field.to_string(),
            reason: "response carried neither data nor errors".to_string(),
        })?;
        data.get_mut(root_field)
            .map(Value::take)
            .ok_or_else(|| FetchError::Decode {
                key: root_field.to_string(),
                reason: format!("response data has no field '{root_field}'"),
            })
    }
}

/// Something that can execute graph requests.
#[async_trait]
pub trait GraphTransport: Send + Sync + fmt::Debug {
    async fn execute(
        &self,
        request: GraphRequest,
        signal: AbortSignal,
    ) -> Result<GraphResponse, FetchError>;
}

/// HTTP transport over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim().to_string(),
            headers: build_headers(config)?,
        })
    }
}

fn build_headers(config: &ClientConfig) -> ClientResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let invalid = |reason: String| {
            ClientError::Config(ConfigLoadError::Invalid(
                cadence_core::ConfigError::InvalidValue {
                    field: format!("headers.{name}"),
                    value: value.clone(),
                    reason,
                },
            ))
        };
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

fn transport_failure(err: reqwest::Error) -> FetchError {
    FetchError::transient(err.to_string())
}

/// Map a non-success HTTP status onto the fetch error taxonomy.
///
/// Server errors, throttling and request timeouts are transient. Other
/// client errors are remote failures, using the body's error list if any.
pub fn classify_status(operation: &str, status: StatusCode, body: &[u8]) -> FetchError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return FetchError::transient(format!("{operation} returned {status}"));
    }
    let errors: Vec<RemoteErrorDetail> = serde_json::from_slice::<GraphResponse>(body)
        .map(|response| response.errors.into_iter().map(Into::into).collect())
        .unwrap_or_default();
    if errors.is_empty() {
        return FetchError::Remote {
            errors: vec![RemoteErrorDetail::new(format!("{operation} returned {status}"))
                .with_code(status.as_u16().to_string())],
        };
    }
    FetchError::Remote { errors }
}

#[async_trait]
impl GraphTransport for HttpTransport {
    async fn execute(
        &self,
        request: GraphRequest,
        signal: AbortSignal,
    ) -> Result<GraphResponse, FetchError> {
        let operation = request.operation_name.clone();
        trace!(operation = %operation, "sending graph request");
        let call = async {
            let response = self
                .client
                .post(&self.endpoint)
                .headers(self.headers.clone())
                .json(&request)
                .send()
                .await
                .map_err(transport_failure)?;
            let status = response.status();
            let body = response.bytes().await.map_err(transport_failure)?;
            debug!(operation = %operation, %status, bytes = body.len(), "graph response");
            if !status.is_success() {
                return Err(classify_status(&operation, status, &body));
            }
            serde_json::from_slice::<GraphResponse>(&body).map_err(|e| FetchError::Decode {
                key: operation.clone(),
                reason: e.to_string(),
            })
        };
        tokio::select! {
            biased;
            _ = signal.aborted() => Err(FetchError::Cancelled),
            result = call => result,
        }
    }
}

/// Cache identity of an operation call: `[operation]` or `[operation, variables]`.
pub fn operation_key(operation: &str, variables: &Value) -> Result<QueryKey, KeyError> {
    let key = QueryKey::new(operation)?;
    match variables {
        Value::Null => Ok(key),
        Value::Object(map) if map.is_empty() => Ok(key),
        other => key.arg_json(other.clone()),
    }
}

/// Builds descriptors for catalogue operations.
#[derive(Debug, Clone)]
pub struct GraphClient {
    transport: Arc<dyn GraphTransport>,
    catalog: Arc<OperationCatalog>,
}

impl GraphClient {
    pub fn new(transport: Arc<dyn GraphTransport>, catalog: Arc<OperationCatalog>) -> Self {
        Self { transport, catalog }
    }

    pub fn catalog(&self) -> &Arc<OperationCatalog> {
        &self.catalog
    }

    /// Descriptor for a catalogue query, using the catalogue's stale time.
    pub fn query<T>(&self, operation: &str, variables: Value) -> ClientResult<QueryDescriptor<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let op = self
            .catalog
            .query(operation)
            .ok_or_else(|| ClientError::UnknownOperation(operation.to_string()))?
            .clone();
        let key = operation_key(op.name, &variables)?;
        let label = key.to_string();
        let transport = Arc::clone(&self.transport);
        let stale_time = op.stale_time;

        let descriptor = QueryDescriptor::new(key, move |signal: AbortSignal| {
            let transport = Arc::clone(&transport);
            let request = GraphRequest {
                operation_name: op.name.to_string(),
                query: op.document.to_string(),
                variables: variables.clone(),
            };
            let root_field = op.root_field;
            let label = label.clone();
            async move {
                let data = transport.execute(request, signal).await?.into_result(root_field)?;
                serde_json::from_value::<T>(data).map_err(|e| FetchError::Decode {
                    key: label,
                    reason: e.to_string(),
                })
            }
        })
        .with_stale_time(stale_time);
        Ok(descriptor)
    }

    /// Descriptor for a catalogue mutation. Variables are serialized per call.
    pub fn mutation<V, O>(&self, operation: &str) -> ClientResult<MutationDescriptor<V, O>>
    where
        V: Serialize + Send + 'static,
        O: DeserializeOwned + Send + 'static,
    {
        let op = self
            .catalog
            .mutation(operation)
            .ok_or_else(|| ClientError::UnknownOperation(operation.to_string()))?
            .clone();
        let transport = Arc::clone(&self.transport);
        let name = op.name;

        Ok(MutationDescriptor::new(name, move |variables: V, signal: AbortSignal| {
            let transport = Arc::clone(&transport);
            let variables = serde_json::to_value(&variables);
            let document = op.document;
            let root_field = op.root_field;
            async move {
                let variables = variables.map_err(|e| FetchError::Decode {
                    key: name.to_string(),
                    reason: e.to_string(),
                })?;
                let request = GraphRequest {
                    operation_name: name.to_string(),
                    query: document.to_string(),
                    variables,
                };
                let data = transport.execute(request, signal).await?.into_result(root_field)?;
                serde_json::from_value::<O>(data).map_err(|e| FetchError::Decode {
                    key: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }))
    }
}
