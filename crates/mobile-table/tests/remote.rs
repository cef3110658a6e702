//! Remote table client tests against a recording mock transport

use std::future::{Future, ready};
use std::sync::{Arc, Mutex};

use mobile_table::{
    ClientConfig, ConfigError, Method, Query, QueryOrder, RemoteTable, ServiceError,
    ServiceRequest, ServiceResponse, Transport, TypeMapping,
};
use serde_json::json;

/// Records requests and answers each with the same canned response
struct MockTransport {
    status: u16,
    body: String,
    requests: Mutex<Vec<ServiceRequest>>,
}

impl MockTransport {
    fn new(status: u16, body: &str) -> Arc<Self> {
        Arc::new(Self {
            status,
            body: body.to_string(),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn last(&self) -> ServiceRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

impl Transport for MockTransport {
    fn send(
        &self,
        request: ServiceRequest,
    ) -> impl Future<Output = Result<ServiceResponse, ServiceError>> + Send {
        self.requests.lock().unwrap().push(request);
        ready(Ok(ServiceResponse {
            status: self.status,
            headers: Vec::new(),
            body: self.body.clone(),
        }))
    }
}

/// Fails every request before it reaches a server
struct Unreachable;

impl Transport for Unreachable {
    fn send(
        &self,
        _request: ServiceRequest,
    ) -> impl Future<Output = Result<ServiceResponse, ServiceError>> + Send {
        futures::future::err(ServiceError::Transport("connection refused".to_string()))
    }
}

fn config() -> ClientConfig {
    ClientConfig::new("http://myapp.com/").with_application_key("secret")
}

#[tokio::test]
async fn read_builds_the_request_url() {
    let mock = MockTransport::new(200, r#"[{"id": "1"}]"#);
    let table = RemoteTable::new(config(), Arc::clone(&mock), "TodoItem").unwrap();

    let query = Query::table("TodoItem")
        .field("complete")
        .eq()
        .val(false)
        .order_by("text", QueryOrder::Ascending)
        .top(10);
    let result = table.read(&query).await.unwrap();
    assert_eq!(result, json!([{"id": "1"}]));

    let request = mock.last();
    assert_eq!(request.method, Method::Get);
    assert_eq!(
        request.url,
        "http://myapp.com/tables/TodoItem?$filter=complete+eq+false&$top=10&$orderby=text+asc"
    );
    assert_eq!(request.header("accept"), Some("application/json"));
    assert_eq!(request.header("X-ZUMO-APPLICATION"), Some("secret"));
    assert_eq!(request.header("content-type"), None);
    assert!(request.body.is_none());
}

#[tokio::test]
async fn read_without_filter() {
    let mock = MockTransport::new(200, "[]");
    let table = RemoteTable::new(config(), Arc::clone(&mock), "TodoItem").unwrap();

    table.read(&Query::new()).await.unwrap();
    assert_eq!(mock.last().url, "http://myapp.com/tables/TodoItem");

    table
        .read(&Query::new().skip(5).include_inline_count())
        .await
        .unwrap();
    assert_eq!(
        mock.last().url,
        "http://myapp.com/tables/TodoItem?$inlinecount=allpages&$skip=5"
    );
}

#[tokio::test]
async fn item_operations() {
    let mock = MockTransport::new(200, r#"{"id": "abc", "text": "milk"}"#);
    let table = RemoteTable::new(config(), Arc::clone(&mock), "stringidtype").unwrap();

    let found = table.lookup("abc").await.unwrap();
    assert_eq!(found["text"], json!("milk"));
    assert_eq!(mock.last().url, "http://myapp.com/tables/stringidtype/abc");

    let item = json!({"id": "abc", "text": "milk"});
    table.insert(&item).await.unwrap();
    let request = mock.last();
    assert_eq!(request.method, Method::Post);
    assert_eq!(request.url, "http://myapp.com/tables/stringidtype");
    assert_eq!(request.header("Content-Type"), Some("application/json"));
    assert_eq!(request.body.as_deref(), Some(item.to_string().as_str()));

    table.update(&item).await.unwrap();
    let request = mock.last();
    assert_eq!(request.method, Method::Patch);
    assert_eq!(request.url, "http://myapp.com/tables/stringidtype/abc");

    table.delete("a b").await.unwrap();
    let request = mock.last();
    assert_eq!(request.method, Method::Delete);
    assert_eq!(request.url, "http://myapp.com/tables/stringidtype/a+b");
}

#[tokio::test]
async fn update_uses_the_mapped_id_property() {
    let mock = MockTransport::new(200, "{}");
    let mapping = TypeMapping::new().field("key", "Id").field("text", "text");
    let table = RemoteTable::new(config(), Arc::clone(&mock), "todo")
        .unwrap()
        .with_mapping(&mapping)
        .unwrap();

    table.update(&json!({"Id": 7, "text": "x"})).await.unwrap();
    assert_eq!(mock.last().url, "http://myapp.com/tables/todo/7");

    let err = table.update(&json!({"text": "x"})).await.unwrap_err();
    assert!(matches!(err, ServiceError::MissingId(ref p) if p == "Id"));
}

#[tokio::test]
async fn error_statuses_carry_the_body() {
    let mock = MockTransport::new(404, "not here");
    let table = RemoteTable::new(config(), Arc::clone(&mock), "todo").unwrap();
    match table.lookup("1").await {
        Err(ServiceError::Status { status, body }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "not here");
        }
        other => panic!("expected a status error, got {other:?}"),
    }
}

#[tokio::test]
async fn non_json_bodies_are_malformed() {
    let mock = MockTransport::new(200, "<html>");
    let table = RemoteTable::new(config(), Arc::clone(&mock), "todo").unwrap();
    let err = table.read(&Query::new()).await.unwrap_err();
    assert!(matches!(err, ServiceError::MalformedResponse(_)));

    // Deletes do not read the body
    table.delete("1").await.unwrap();
}

#[tokio::test]
async fn transport_failures_propagate() {
    let table = RemoteTable::new(config(), Unreachable, "todo").unwrap();
    let err = table.lookup("1").await.unwrap_err();
    assert!(matches!(err, ServiceError::Transport(_)));
}

#[tokio::test]
async fn incomplete_queries_are_not_sent() {
    let mock = MockTransport::new(200, "[]");
    let table = RemoteTable::new(config(), Arc::clone(&mock), "todo").unwrap();
    let err = table
        .read(&Query::new().field("age").gt())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Query(_)));
    assert!(mock.requests.lock().unwrap().is_empty());
}

#[test]
fn empty_table_names_are_rejected() {
    let err = RemoteTable::new(config(), Unreachable, " ").err();
    assert_eq!(err, Some(ConfigError::EmptyTableName));
}

#[test]
fn app_url_without_trailing_slash() {
    let url = ClientConfig::new("http://myapp.com")
        .table_url("todo", &Query::new().top(1))
        .unwrap();
    assert_eq!(url, "http://myapp.com/tables/todo?$top=1");
}
