use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_TYPE, LOCATION,
};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::{
    FederationGateway, GraphQLRequest, RequestContext, config::ServerConfig, error::GatewayError,
};

const HEALTH_CHECK_PATH: &str = "/.well-known/apollo/server-health";

type ResponseBody = BoxBody<Bytes, hyper::Error>;

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

const LANDING_PAGE_HTML: &str = r#"
<!DOCTYPE html>
<html>
<head>
  <title>GraphiQL - Portkey Federation Gateway</title>
  <link href="https://unpkg.com/graphiql@1.5.0/graphiql.min.css" rel="stylesheet" />
  <style>
    body { margin: 0; padding: 0; height: 100vh; }
    #graphiql { height: 100vh; }
  </style>
</head>
<body>
  <div id="graphiql"></div>

  <script src="https://unpkg.com/react@17.0.2/umd/react.production.min.js"></script>
  <script src="https://unpkg.com/react-dom@17.0.2/umd/react-dom.production.min.js"></script>
  <script src="https://unpkg.com/graphiql@1.5.0/graphiql.min.js"></script>
  <script>
    function graphQLFetcher(graphQLParams, options) {
      const headers = Object.assign(
        { 'Content-Type': 'application/json' },
        (options && options.headers) || {}
      );
      return fetch('__GRAPHQL_PATH__', {
        method: 'post',
        headers: headers,
        body: JSON.stringify(graphQLParams),
      }).then(response => response.json());
    }

    ReactDOM.render(
      React.createElement(GraphiQL, { fetcher: graphQLFetcher, headerEditorEnabled: true }),
      document.getElementById('graphiql')
    );
  </script>
</body>
</html>
"#;

/// Per-server state shared by every connection.
pub struct ServerState {
    pub gateway: Arc<FederationGateway>,
    pub config: ServerConfig,
}

fn json_response(status: StatusCode, body: &Value) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(serde_json::to_string(body).unwrap_or_default()))
        .unwrap_or_else(|_| internal_server_error())
}

// Create a standard internal server error response
fn internal_server_error() -> Response<ResponseBody> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain
}

/// Render a request level error as a GraphQL error response body.
fn error_body(error: &GatewayError, debug: bool) -> Value {
    let mut extensions = json!({ "code": error.code() });
    if debug {
        extensions["exception"] = json!({ "detail": error_chain(error) });
    }
    json!({
        "errors": [{
            "message": error.to_string(),
            "extensions": extensions,
        }]
    })
}

fn error_status(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::MutationOverGet => StatusCode::METHOD_NOT_ALLOWED,
        GatewayError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Config(_)
        | GatewayError::Composition(_)
        | GatewayError::Client(_)
        | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        GatewayError::InvalidRequest(_) | GatewayError::UnknownField { .. } => StatusCode::OK,
    }
}

fn bad_request(message: String, debug: bool) -> Response<ResponseBody> {
    json_response(
        StatusCode::BAD_REQUEST,
        &error_body(&GatewayError::InvalidRequest(message), debug),
    )
}

async fn execute(
    state: &ServerState,
    request: GraphQLRequest,
    context: RequestContext,
) -> Response<ResponseBody> {
    match state.gateway.process_request(request, &context).await {
        Ok(result) => json_response(StatusCode::OK, &result),
        Err(e) => {
            tracing::debug!("Request failed: {}", e);
            let debug = state.config.debug || state.gateway.debug();
            json_response(error_status(&e), &error_body(&e, debug))
        }
    }
}

/// Extract a GraphQL request from the query string of a GET request.
fn request_from_query(uri: &hyper::Uri) -> Result<Option<GraphQLRequest>, String> {
    let Some(query_string) = uri.query() else {
        return Ok(None);
    };
    let url = reqwest::Url::parse(&format!("http://gateway/?{}", query_string))
        .map_err(|e| format!("Invalid query string: {}", e))?;

    let mut request = GraphQLRequest::default();
    let mut has_query = false;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "query" => {
                request.query = value.into_owned();
                has_query = true;
            }
            "operationName" => request.operation_name = Some(value.into_owned()),
            "variables" => {
                let variables = serde_json::from_str(&value)
                    .map_err(|e| format!("Variables are invalid JSON: {}", e))?;
                request.variables = Some(variables);
            }
            _ => {}
        }
    }

    Ok(has_query.then_some(request))
}

async fn route(req: Request<Incoming>, state: &ServerState) -> Response<ResponseBody> {
    let config = &state.config;
    let debug = config.debug || state.gateway.debug();
    let path = req.uri().path().to_string();

    match (req.method().clone(), path.as_str()) {
        (Method::OPTIONS, _) if config.cors => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
            .header(
                ACCESS_CONTROL_ALLOW_HEADERS,
                req.headers()
                    .get(hyper::header::ACCESS_CONTROL_REQUEST_HEADERS)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("Content-Type, Authorization"),
            )
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        (Method::GET, HEALTH_CHECK_PATH) => {
            json_response(StatusCode::OK, &json!({ "status": "pass" }))
        }

        (Method::POST, p) if p == config.path => {
            let (parts, body) = req.into_parts();
            let body_bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => return bad_request("Failed to read request body".to_string(), debug),
            };

            match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
                Ok(request) => {
                    execute(state, request, RequestContext::new(parts.method, parts.headers)).await
                }
                Err(e) => bad_request(format!("Invalid JSON request: {}", e), debug),
            }
        }

        (Method::GET, p) if p == config.path => match request_from_query(req.uri()) {
            Ok(Some(request)) => {
                let (parts, _) = req.into_parts();
                execute(state, request, RequestContext::new(parts.method, parts.headers)).await
            }
            Ok(None) if config.landing_page => Response::builder()
                .header(CONTENT_TYPE, "text/html")
                .body(full(LANDING_PAGE_HTML.replace("__GRAPHQL_PATH__", &config.path)))
                .unwrap_or_else(|_| internal_server_error()),
            Ok(None) => bad_request("GET query missing.".to_string(), debug),
            Err(message) => bad_request(message, debug),
        },

        (Method::GET, "/") if config.landing_page => Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, config.path.as_str())
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    }
}

pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<ResponseBody>, Infallible> {
    let mut response = route(req, &state).await;
    if state.config.cors {
        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, hyper::header::HeaderValue::from_static("*"));
    }
    Ok(response)
}

/// Accept connections on `listener` until the task is dropped.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<FederationGateway>,
    config: ServerConfig,
) -> Result<(), GatewayError> {
    let state = Arc::new(ServerState { gateway, config });

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                tracing::warn!("Error serving connection from {}: {}", remote_addr, e);
            }
        });
    }
}
