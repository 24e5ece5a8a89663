//! HTTP transport to a search datastore.
//!
//! [`HttpTransport`] issues one blocking `reqwest` request per
//! [`Transport`] call. Status codes and bulk item results are translated
//! into [`TransportError`]s; nothing is retried here.

use std::fmt;

use benchmark_metrics::{BulkItemFailure, ConfigError, Endpoint, StoreError, StoreResult};
use reqwest::{
    Method, StatusCode,
    blocking::{Client, RequestBuilder, Response},
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::{
    config::{Credentials, ResolvedDatastore},
    error::{TransportError, TransportResult},
    transport::{SearchResponse, Transport},
};

const NDJSON: &str = "application/x-ndjson";

/// Longest body excerpt carried into an error reason.
const MAX_REASON_LEN: usize = 256;

/// Blocking HTTP client for one datastore.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    endpoint: Endpoint,
    credentials: Credentials,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Builds the HTTP client for the resolved datastore settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the CA bundle cannot be read and
    /// [`StoreError::Config`] if it is not valid PEM or the client cannot be
    /// built.
    pub fn new(datastore: &ResolvedDatastore) -> StoreResult<Self> {
        let mut builder = Client::builder()
            .timeout(datastore.request_timeout())
            .danger_accept_invalid_certs(!datastore.verify_certs());
        if let Some(path) = datastore.ca_path() {
            let pem = std::fs::read(path).map_err(|e| {
                StoreError::io_with_source(format!("failed to read CA bundle [{}]", path.display()), e)
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ConfigError::Conflicting { message: format!("invalid CA bundle [{}]: {e}", path.display()) }
            })?;
            builder = builder.add_root_certificate(certificate);
        }
        if !datastore.verify_certs() {
            tracing::warn!(endpoint = %datastore.endpoint(), "certificate verification is disabled");
        }
        let client = builder.build().map_err(|e| ConfigError::Conflicting {
            message: format!("cannot build HTTP client: {e}"),
        })?;
        Ok(Self {
            client,
            base_url: datastore.base_url(),
            endpoint: datastore.endpoint().clone(),
            credentials: datastore.credentials().clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}/{path}", self.base_url));
        match &self.credentials {
            Credentials::None => builder,
            Credentials::Basic { user, password } => builder.basic_auth(user, Some(password.as_str())),
            Credentials::ApiKey(key) => {
                let header = Zeroizing::new(format!("ApiKey {}", key.as_str()));
                builder.header(AUTHORIZATION, header.as_str())
            },
        }
    }

    fn send(&self, builder: RequestBuilder) -> TransportResult<Response> {
        builder.send().map_err(from_reqwest)
    }

    /// Sends the request and decodes a successful JSON answer.
    fn send_json(&self, builder: RequestBuilder) -> TransportResult<Value> {
        let response = self.send(builder)?;
        let response = check_status(response)?;
        response.json().map_err(|e| TransportError::other(format!("cannot decode response: {e}")))
    }
}

fn from_reqwest(error: reqwest::Error) -> TransportError {
    let message = error.to_string();
    if error.is_timeout() {
        TransportError::Timeout { message }
    } else if error.is_connect() {
        TransportError::Connection { message }
    } else {
        TransportError::Other { message }
    }
}

/// Error type reported in a datastore error body, or a body excerpt.
fn error_reason(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error_type = parsed.as_ref().and_then(|v| {
        let error = v.get("error")?;
        error.get("type").and_then(Value::as_str).or_else(|| error.as_str()).map(str::to_owned)
    });
    error_type.unwrap_or_else(|| body.chars().take(MAX_REASON_LEN).collect())
}

fn check_status(response: Response) -> TransportResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(TransportError::from_status(status.as_u16(), error_reason(&body)))
}

/// Failed items of a bulk response, in request order.
fn bulk_failures(response: &Value) -> Vec<BulkItemFailure> {
    if response.get("errors").and_then(Value::as_bool) != Some(true) {
        return Vec::new();
    }
    response
        .get("items")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.as_object()?.values().next())
        .filter_map(|result| {
            let status = result.get("status").and_then(Value::as_u64)?;
            if status < 300 {
                return None;
            }
            let error = result.get("error");
            Some(BulkItemFailure {
                status: u16::try_from(status).unwrap_or(u16::MAX),
                error_type: error
                    .and_then(|e| e.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_owned(),
                reason: error.and_then(|e| e.get("reason")).and_then(Value::as_str).map(str::to_owned),
            })
        })
        .collect()
}

fn ndjson_bulk_body(docs: &[Value]) -> TransportResult<String> {
    let mut body = String::new();
    for doc in docs {
        body.push_str("{\"index\":{}}\n");
        let line = serde_json::to_string(doc)
            .map_err(|e| TransportError::other(format!("cannot encode document: {e}")))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}

impl Transport for HttpTransport {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn get_template(&self, name: &str) -> TransportResult<Option<Value>> {
        let response = self.send(self.request(Method::GET, &format!("_index_template/{name}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = check_status(response)?
            .json()
            .map_err(|e| TransportError::other(format!("cannot decode template: {e}")))?;
        Ok(body
            .get("index_templates")
            .and_then(Value::as_array)
            .and_then(|templates| templates.first())
            .and_then(|t| t.get("index_template"))
            .cloned())
    }

    fn put_template(&self, name: &str, template: &Value) -> TransportResult<()> {
        self.send_json(self.request(Method::PUT, &format!("_index_template/{name}")).json(template))?;
        Ok(())
    }

    fn index_exists(&self, index: &str) -> TransportResult<bool> {
        let response = self.send(self.request(Method::HEAD, index))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => check_status(response).map(|_| true),
        }
    }

    fn create_index(&self, index: &str) -> TransportResult<()> {
        match self.send_json(self.request(Method::PUT, index)) {
            // resource_already_exists_exception
            Err(TransportError::Api { status: 400, reason }) if reason.contains("already_exists") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn refresh(&self, index: &str) -> TransportResult<()> {
        self.send_json(self.request(Method::POST, &format!("{index}/_refresh")))?;
        Ok(())
    }

    fn bulk_index(&self, index: &str, docs: &[Value]) -> TransportResult<()> {
        let body = ndjson_bulk_body(docs)?;
        let response = self.send_json(
            self.request(Method::POST, &format!("{index}/_bulk")).header(CONTENT_TYPE, NDJSON).body(body),
        )?;
        let items = bulk_failures(&response);
        if items.is_empty() { Ok(()) } else { Err(TransportError::Bulk { items }) }
    }

    fn index_doc(&self, index: &str, id: Option<&str>, doc: &Value) -> TransportResult<()> {
        let builder = match id {
            Some(id) => self.request(Method::PUT, &format!("{index}/_doc/{id}")),
            None => self.request(Method::POST, &format!("{index}/_doc")),
        };
        self.send_json(builder.json(doc))?;
        Ok(())
    }

    fn search(&self, index: &str, body: &Value) -> TransportResult<SearchResponse> {
        let response = self.send_json(self.request(Method::POST, &format!("{index}/_search")).json(body))?;
        serde_json::from_value(response)
            .map_err(|e| TransportError::other(format!("cannot decode search response: {e}")))
    }

    fn delete_by_query(&self, index: &str, body: &Value) -> TransportResult<u64> {
        let response =
            self.send_json(self.request(Method::POST, &format!("{index}/_delete_by_query")).json(body))?;
        Ok(response.get("deleted").and_then(Value::as_u64).unwrap_or(0))
    }

    fn delete(&self, index: &str, id: &str) -> TransportResult<bool> {
        let response = self.send(self.request(Method::DELETE, &format!("{index}/_doc/{id}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body: Value = check_status(response)?
            .json()
            .map_err(|e| TransportError::other(format!("cannot decode response: {e}")))?;
        Ok(body.get("result").and_then(Value::as_str) == Some("deleted"))
    }
}
