use portkey_gateway::{
    CompositionError, FederationGateway, GatewayConfig, GatewayError, GraphQLRequest,
    RequestContext, SubgraphEntry,
    config::{GatewaySettings, ServerConfig},
    server,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string_contains, header, method, path},
};

const BOOKMARKS_SDL: &str = r#"
type Bookmark @key(fields: "id") {
  id: ID!
  storyId: ID!
}

type Query {
  bookmarks: [Bookmark!]!
}
"#;

const CATEGORIES_SDL: &str = r#"
type Category {
  id: ID!
  name: String!
}

type Query {
  categories: [Category!]!
}
"#;

// Start a mock subgraph answering the `_service { sdl }` request.
async fn subgraph(sdl: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("_service"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "_service": { "sdl": sdl } } })),
        )
        .mount(&server)
        .await;
    server
}

fn settings(subgraphs: &[(&str, &MockServer)]) -> GatewaySettings {
    GatewayConfig::with_subgraphs(
        subgraphs
            .iter()
            .map(|(name, server)| SubgraphEntry::new(*name, format!("{}/graphql", server.uri())))
            .collect(),
    )
    .gateway
}

async fn started_gateway(settings: GatewaySettings) -> FederationGateway {
    let gateway = FederationGateway::builder(settings).build().unwrap();
    gateway.start().await.unwrap();
    gateway
}

fn inbound_context() -> RequestContext {
    let mut headers = http::HeaderMap::new();
    headers.insert("authorization", "Bearer abc".parse().unwrap());
    headers.insert("x-trace-id", "123".parse().unwrap());
    headers.insert("accept", "application/graphql-response+json".parse().unwrap());
    headers.insert("x-empty", http::HeaderValue::from_static(""));
    RequestContext::from_headers(headers)
}

#[tokio::test]
async fn query_touching_one_subgraph_never_calls_the_other() {
    let bookmarks = subgraph(BOOKMARKS_SDL).await;
    let categories = subgraph(CATEGORIES_SDL).await;

    Mock::given(method("POST"))
        .and(body_string_contains("bookmarks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "bookmarks": [{ "id": "1" }] }
        })))
        .expect(1)
        .mount(&bookmarks)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("categories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
        .expect(0)
        .mount(&categories)
        .await;

    let gateway = started_gateway(settings(&[
        ("bookmarks", &bookmarks),
        ("categories", &categories),
    ]))
    .await;

    let schema = gateway.schema().await.unwrap();
    assert_eq!(schema.owners("Query.bookmarks"), ["bookmarks"]);
    assert_eq!(schema.owners("Query.categories"), ["categories"]);

    let response = gateway
        .process_request(
            GraphQLRequest::new("{ bookmarks { id } }"),
            &RequestContext::default(),
        )
        .await
        .unwrap();

    assert_eq!(response, json!({ "data": { "bookmarks": [{ "id": "1" }] } }));
}

#[tokio::test]
async fn combined_query_merges_both_subgraphs() {
    let bookmarks = subgraph(BOOKMARKS_SDL).await;
    let categories = subgraph(CATEGORIES_SDL).await;

    Mock::given(method("POST"))
        .and(body_string_contains("bookmarks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "bookmarks": [] }
        })))
        .expect(1)
        .mount(&bookmarks)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("categories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "categories": [{ "name": "Fantasy" }] }
        })))
        .expect(1)
        .mount(&categories)
        .await;

    let gateway = started_gateway(settings(&[
        ("bookmarks", &bookmarks),
        ("categories", &categories),
    ]))
    .await;

    let response = gateway
        .process_request(
            GraphQLRequest::new("{ bookmarks { id } categories { name } }"),
            &RequestContext::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        response,
        json!({ "data": { "bookmarks": [], "categories": [{ "name": "Fantasy" }] } })
    );
}

#[tokio::test]
async fn inbound_headers_reach_every_subgraph_call() {
    let bookmarks = subgraph(BOOKMARKS_SDL).await;
    let categories = subgraph(CATEGORIES_SDL).await;

    for server in [&bookmarks, &categories] {
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer abc"))
            .and(header("x-trace-id", "123"))
            .and(header("accept", "application/graphql-response+json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
            .expect(1)
            .mount(server)
            .await;
    }

    let gateway = started_gateway(settings(&[
        ("bookmarks", &bookmarks),
        ("categories", &categories),
    ]))
    .await;

    gateway
        .process_request(
            GraphQLRequest::new("{ bookmarks { id } categories { id } }"),
            &inbound_context(),
        )
        .await
        .unwrap();

    for server in [&bookmarks, &categories] {
        let requests = server.received_requests().await.unwrap();
        let query_call = requests
            .iter()
            .find(|request| request.headers.contains_key("authorization"))
            .unwrap();
        assert!(!query_call.headers.contains_key("x-empty"));
        assert_eq!(query_call.headers["content-type"], "application/json");
    }
}

#[tokio::test]
async fn introspection_covers_every_subgraph() {
    let bookmarks = subgraph(BOOKMARKS_SDL).await;
    let categories = subgraph(CATEGORIES_SDL).await;

    for (server, field) in [(&bookmarks, "bookmarks"), (&categories, "categories")] {
        Mock::given(method("POST"))
            .and(body_string_contains("__schema"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "__schema": { "queryType": {
                    "name": "Query",
                    "fields": [{ "name": field }]
                } } }
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    let gateway = started_gateway(settings(&[
        ("bookmarks", &bookmarks),
        ("categories", &categories),
    ]))
    .await;

    let response = gateway
        .process_request(
            GraphQLRequest::new("{ __schema { queryType { name fields { name } } } }"),
            &RequestContext::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        response,
        json!({ "data": { "__schema": { "queryType": {
            "name": "Query",
            "fields": [{ "name": "bookmarks" }, { "name": "categories" }]
        } } } })
    );
}

#[tokio::test]
async fn unreachable_subgraph_fails_startup() {
    let bookmarks = subgraph(BOOKMARKS_SDL).await;
    let settings = GatewayConfig::with_subgraphs(vec![
        SubgraphEntry::new("bookmarks", format!("{}/graphql", bookmarks.uri())),
        SubgraphEntry::new("stories", "http://127.0.0.1:1/graphql"),
    ])
    .gateway;

    let gateway = FederationGateway::builder(settings).build().unwrap();
    let err = gateway.start().await.unwrap_err();

    assert!(matches!(
        err,
        GatewayError::Composition(CompositionError::Unreachable { ref name, .. }) if name == "stories"
    ));
    assert!(gateway.schema().await.is_none());
}

#[tokio::test]
async fn introspection_errors_fail_startup() {
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{ "message": "Cannot query field \"_service\" on type \"Query\"." }]
        })))
        .mount(&broken)
        .await;

    let gateway = FederationGateway::builder(settings(&[("chapters", &broken)]))
        .build()
        .unwrap();
    let err = gateway.start().await.unwrap_err();

    assert!(matches!(
        err,
        GatewayError::Composition(CompositionError::InvalidResponse { .. })
    ));
}

#[tokio::test]
async fn conflicting_subgraphs_fail_startup() {
    let users = subgraph("type Query { me: String }").await;
    let accounts = subgraph("type Query { me: String }").await;

    let gateway = FederationGateway::builder(settings(&[("users", &users), ("accounts", &accounts)]))
        .build()
        .unwrap();
    let err = gateway.start().await.unwrap_err();

    assert!(matches!(
        err,
        GatewayError::Composition(CompositionError::FieldConflict { .. })
    ));
}

#[tokio::test]
async fn duplicate_subgraph_names_are_rejected() {
    let users = subgraph("type Query { me: String }").await;

    let result = FederationGateway::builder(settings(&[("users", &users), ("users", &users)])).build();

    assert!(matches!(result, Err(GatewayError::Config(_))));
}

#[tokio::test]
async fn failing_subgraph_returns_partial_results() {
    let bookmarks = subgraph(BOOKMARKS_SDL).await;
    let categories = subgraph(CATEGORIES_SDL).await;

    Mock::given(method("POST"))
        .and(body_string_contains("bookmarks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "bookmarks": [{ "id": "1" }] }
        })))
        .mount(&bookmarks)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("categories"))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .mount(&categories)
        .await;

    let gateway = started_gateway(settings(&[
        ("bookmarks", &bookmarks),
        ("categories", &categories),
    ]))
    .await;

    let response = gateway
        .process_request(
            GraphQLRequest::new("{ bookmarks { id } categories { id } }"),
            &RequestContext::default(),
        )
        .await
        .unwrap();

    assert_eq!(response["data"], json!({ "bookmarks": [{ "id": "1" }] }));
    assert_eq!(
        response["errors"][0]["extensions"],
        json!({ "code": "SUBGRAPH_REQUEST_FAILED", "serviceName": "categories" })
    );
}

#[tokio::test]
async fn http_endpoint_serves_the_composed_schema() {
    let bookmarks = subgraph(BOOKMARKS_SDL).await;
    Mock::given(method("POST"))
        .and(body_string_contains("bookmarks"))
        .and(header("x-trace-id", "123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "bookmarks": [{ "id": "9" }] }
        })))
        .expect(1)
        .mount(&bookmarks)
        .await;

    let gateway = Arc::new(started_gateway(settings(&[("bookmarks", &bookmarks)])).await);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_config = ServerConfig {
        listen: addr,
        ..ServerConfig::default()
    };
    tokio::spawn(server::serve(listener, gateway, server_config));

    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/graphql", addr))
        .header("x-trace-id", "123")
        .json(&json!({ "query": "{ bookmarks { id } }" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "*"
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "data": { "bookmarks": [{ "id": "9" }] } }));

    let response = client
        .post(format!("http://{}/graphql", addr))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .post(format!("http://{}/graphql", addr))
        .json(&json!({ "query": "{ chapters { id } }" }))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["errors"][0]["extensions"]["code"],
        "GRAPHQL_VALIDATION_FAILED"
    );

    let health: Value = client
        .get(format!("http://{}/.well-known/apollo/server-health", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({ "status": "pass" }));

    let landing = client
        .get(format!("http://{}/graphql", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(landing.status(), 200);
    assert!(landing.text().await.unwrap().contains("fetch('/graphql'"));

    let missing = client
        .get(format!("http://{}/nowhere", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[test]
fn missing_config_file_is_reported() {
    let err = GatewayConfig::from_file(std::path::Path::new("does/not/exist.yaml")).unwrap_err();
    assert!(err.to_string().contains("does/not/exist.yaml"));
}
