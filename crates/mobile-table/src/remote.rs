//! Remote table client
//!
//! Builds table-service requests from [`Query`] values and hands them to a
//! [`Transport`]. The transport is the only piece that touches the network,
//! so tests and embedders can substitute their own.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::query::{Query, QueryError};
use crate::render::form_encode;

const APPLICATION_HEADER: &str = "X-ZUMO-APPLICATION";
const JSON: &str = "application/json";

// ============ Errors ============

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("table name cannot be empty")]
    EmptyTableName,

    #[error("no id property is mapped")]
    MissingIdProperty,

    #[error("more than one id property is mapped: {}", .0.join(", "))]
    AmbiguousIdProperty(Vec<String>),
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("item has no '{0}' property")]
    MissingId(String),

    #[error("incomplete query: {0}")]
    Query(#[from] QueryError),
}

// ============ Wire types ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl ServiceRequest {
    /// First header value with the given name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ServiceResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one request and resolves to the service's response.
///
/// Only transport-level failures are errors here; HTTP error statuses come
/// back as ordinary responses.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: ServiceRequest,
    ) -> impl Future<Output = Result<ServiceResponse, ServiceError>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn send(
        &self,
        request: ServiceRequest,
    ) -> impl Future<Output = Result<ServiceResponse, ServiceError>> + Send {
        (**self).send(request)
    }
}

// ============ Configuration ============

/// Where the mobile service lives and how to identify the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub app_url: String,
    #[serde(default)]
    pub application_key: Option<String>,
}

impl ClientConfig {
    pub fn new(app_url: impl Into<String>) -> Self {
        Self {
            app_url: app_url.into(),
            application_key: None,
        }
    }

    pub fn with_application_key(mut self, key: impl Into<String>) -> Self {
        self.application_key = Some(key.into());
        self
    }

    fn tables_root(&self) -> String {
        let base = self.app_url.trim_end_matches('/');
        format!("{base}/tables/")
    }

    /// Request URL for reading `table` with `query`.
    ///
    /// `{app_url}tables/{table}?$filter={filter}{modifiers}`; without a
    /// filter the modifiers alone form the query string, and with neither
    /// there is no `?`.
    pub fn table_url(&self, table: &str, query: &Query) -> Result<String, QueryError> {
        let mut url = self.tables_root();
        url.push_str(&form_encode(table));

        let modifiers = query.row_set_modifiers();
        match query.filter()? {
            Some(filter) => {
                url.push_str("?$filter=");
                url.push_str(&form_encode(&filter.to_string()));
                url.push_str(&modifiers);
            }
            None if !modifiers.is_empty() => {
                url.push('?');
                url.push_str(modifiers.trim_start_matches('&'));
            }
            None => {}
        }
        Ok(url)
    }
}

/// One field of a client-side type and its name on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field: String,
    pub wire_name: String,
}

/// Per-type mapping between client field names and wire property names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeMapping {
    pub fields: Vec<FieldMapping>,
    /// Field explicitly designated as the id, overriding name matching
    #[serde(default)]
    pub id_field: Option<String>,
}

impl TypeMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: impl Into<String>, wire_name: impl Into<String>) -> Self {
        self.fields.push(FieldMapping {
            field: field.into(),
            wire_name: wire_name.into(),
        });
        self
    }

    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    /// Wire name of the id property
    pub fn id_property(&self) -> Result<&str, ConfigError> {
        if let Some(designated) = &self.id_field {
            let wire = self
                .fields
                .iter()
                .find(|m| &m.field == designated)
                .map_or(designated.as_str(), |m| m.wire_name.as_str());
            return Ok(wire);
        }
        let candidates: Vec<&str> = self
            .fields
            .iter()
            .map(|m| m.wire_name.as_str())
            .filter(|name| name.eq_ignore_ascii_case("id"))
            .collect();
        match candidates.as_slice() {
            [] => Err(ConfigError::MissingIdProperty),
            [only] => Ok(*only),
            many => Err(ConfigError::AmbiguousIdProperty(
                many.iter().map(|s| s.to_string()).collect(),
            )),
        }
    }
}

// ============ Client ============

/// Client for one table of the remote service
pub struct RemoteTable<T> {
    config: ClientConfig,
    transport: T,
    table: String,
    id_property: String,
}

impl<T: Transport> RemoteTable<T> {
    pub fn new(
        config: ClientConfig,
        transport: T,
        table: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let table = table.into();
        if table.trim().is_empty() {
            return Err(ConfigError::EmptyTableName);
        }
        Ok(Self {
            config,
            transport,
            table,
            id_property: "id".to_string(),
        })
    }

    /// Use a type mapping to find the id property of items
    pub fn with_mapping(mut self, mapping: &TypeMapping) -> Result<Self, ConfigError> {
        self.id_property = mapping.id_property()?.to_string();
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn url_for(&self, query: &Query) -> Result<String, QueryError> {
        self.config.table_url(&self.table, query)
    }

    fn item_url(&self, id: &str) -> String {
        format!(
            "{}{}/{}",
            self.config.tables_root(),
            form_encode(&self.table),
            form_encode(id)
        )
    }

    fn request(&self, method: Method, url: String, body: Option<&Value>) -> ServiceRequest {
        let mut headers = vec![("Accept".to_string(), JSON.to_string())];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), JSON.to_string()));
        }
        if let Some(key) = &self.config.application_key {
            headers.push((APPLICATION_HEADER.to_string(), key.clone()));
        }
        ServiceRequest {
            method,
            url,
            headers,
            body: body.map(Value::to_string),
        }
    }

    async fn execute(&self, request: ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        log::debug!("{:?} {}", request.method, request.url);
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            log::warn!("Table {} request failed with status {}", self.table, response.status);
            return Err(ServiceError::Status {
                status: response.status,
                body: response.body,
            });
        }
        Ok(response)
    }

    async fn execute_json(&self, request: ServiceRequest) -> Result<Value, ServiceError> {
        let response = self.execute(request).await?;
        serde_json::from_str(&response.body)
            .map_err(|e| ServiceError::MalformedResponse(e.to_string()))
    }

    fn item_id(&self, item: &Value) -> Result<String, ServiceError> {
        match item.get(&self.id_property) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(ServiceError::MissingId(self.id_property.clone())),
        }
    }

    // ============ Operations ============

    /// Run a query remotely; the table the query names is ignored
    pub async fn read(&self, query: &Query) -> Result<Value, ServiceError> {
        let url = self.url_for(query)?;
        self.execute_json(self.request(Method::Get, url, None)).await
    }

    pub async fn lookup(&self, id: &str) -> Result<Value, ServiceError> {
        let url = self.item_url(id);
        self.execute_json(self.request(Method::Get, url, None)).await
    }

    /// Insert an item; resolves to the item as stored by the service
    pub async fn insert(&self, item: &Value) -> Result<Value, ServiceError> {
        let url = format!("{}{}", self.config.tables_root(), form_encode(&self.table));
        self.execute_json(self.request(Method::Post, url, Some(item)))
            .await
    }

    pub async fn update(&self, item: &Value) -> Result<Value, ServiceError> {
        let url = self.item_url(&self.item_id(item)?);
        self.execute_json(self.request(Method::Patch, url, Some(item)))
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let url = self.item_url(id);
        self.execute(self.request(Method::Delete, url, None)).await?;
        Ok(())
    }
}

// ============ HTTP transport ============

#[cfg(feature = "http")]
mod http {
    use super::*;

    /// [`Transport`] backed by a shared `reqwest` client
    #[derive(Debug, Clone, Default)]
    pub struct HttpTransport {
        client: reqwest::Client,
    }

    impl HttpTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    impl Transport for HttpTransport {
        fn send(
            &self,
            request: ServiceRequest,
        ) -> impl Future<Output = Result<ServiceResponse, ServiceError>> + Send {
            let client = self.client.clone();
            async move {
                let method = match request.method {
                    Method::Get => reqwest::Method::GET,
                    Method::Post => reqwest::Method::POST,
                    Method::Patch => reqwest::Method::PATCH,
                    Method::Delete => reqwest::Method::DELETE,
                };
                let mut builder = client.request(method, &request.url);
                for (name, value) in &request.headers {
                    builder = builder.header(name, value);
                }
                if let Some(body) = request.body {
                    builder = builder.body(body);
                }
                let response = builder
                    .send()
                    .await
                    .map_err(|e| ServiceError::Transport(e.to_string()))?;

                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
                    .collect();
                let body = response
                    .text()
                    .await
                    .map_err(|e| ServiceError::Transport(e.to_string()))?;
                Ok(ServiceResponse {
                    status,
                    headers,
                    body,
                })
            }
        }
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_property_matches_case_insensitively() {
        let mapping = TypeMapping::new().field("key", "ID").field("text", "text");
        assert_eq!(mapping.id_property().unwrap(), "ID");
    }

    #[test]
    fn id_property_errors() {
        let none = TypeMapping::new().field("text", "text");
        assert_eq!(none.id_property(), Err(ConfigError::MissingIdProperty));

        let two = TypeMapping::new().field("a", "id").field("b", "Id");
        assert_eq!(
            two.id_property(),
            Err(ConfigError::AmbiguousIdProperty(vec![
                "id".to_string(),
                "Id".to_string()
            ]))
        );
    }

    #[test]
    fn designated_id_field_wins() {
        let mapping = TypeMapping::new()
            .field("a", "id")
            .field("b", "Id")
            .field("key", "itemKey")
            .id_field("key");
        assert_eq!(mapping.id_property().unwrap(), "itemKey");
    }

    #[test]
    fn table_urls() {
        let config = ClientConfig::new("https://app.example.net");
        let q = Query::new();
        assert_eq!(
            config.table_url("todo", &q).unwrap(),
            "https://app.example.net/tables/todo"
        );

        let q = Query::new().top(3);
        assert_eq!(
            config.table_url("todo", &q).unwrap(),
            "https://app.example.net/tables/todo?$top=3"
        );

        let q = Query::new().field("age").gt().val(3).top(3);
        assert_eq!(
            config.table_url("todo", &q).unwrap(),
            "https://app.example.net/tables/todo?$filter=age+gt+3&$top=3"
        );
    }

    #[test]
    fn incomplete_query_has_no_url() {
        let config = ClientConfig::new("https://app.example.net/");
        let q = Query::new().field("age").gt();
        assert!(config.table_url("todo", &q).is_err());
    }
}
