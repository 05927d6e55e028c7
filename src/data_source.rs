use http::{
    HeaderMap, HeaderName, HeaderValue, Method,
    header::{
        ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
        PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
    },
};
use serde_json::Value;
use std::{fmt, sync::Arc};

use crate::{GraphQLRequest, SubgraphEntry, error::FetchError};

/// Hook run on every outbound request before it is sent.
pub type BeforeSend = Arc<dyn Fn(&mut SubgraphRequest, &RequestContext) + Send + Sync>;

// Connection-level and framing headers. The http client sets its own; copying
// the inbound values would describe the wrong hop. `accept-encoding` stays
// here since the client does not decompress responses.
static TRANSPORT_HEADERS: [HeaderName; 13] = [
    CONNECTION,
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
    CONTENT_LENGTH,
    CONTENT_TYPE,
    CONTENT_ENCODING,
    HOST,
    ACCEPT_ENCODING,
    HeaderName::from_static("keep-alive"),
];

/// What the gateway knows about the inbound client request.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub method: Method,
    pub headers: HeaderMap,
}

impl Default for RequestContext {
    fn default() -> Self {
        RequestContext {
            method: Method::POST,
            headers: HeaderMap::new(),
        }
    }
}

impl RequestContext {
    pub fn new(method: Method, headers: HeaderMap) -> Self {
        RequestContext { method, headers }
    }

    pub fn from_headers(headers: HeaderMap) -> Self {
        RequestContext {
            headers,
            ..Default::default()
        }
    }
}

/// An outbound request to a single subgraph.
#[derive(Clone, Debug)]
pub struct SubgraphRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: GraphQLRequest,
}

/// Copies every inbound header with a non-empty value onto the outbound
/// request. Repeated headers are joined with `", "`. Existing outbound
/// headers are overwritten, never removed.
pub fn forward_headers(request: &mut SubgraphRequest, context: &RequestContext) {
    for name in context.headers.keys() {
        let values: Vec<&HeaderValue> = context
            .headers
            .get_all(name)
            .iter()
            .filter(|value| !value.is_empty())
            .collect();

        let value = match values.as_slice() {
            [] => continue,
            [single] => (*single).clone(),
            many => {
                let joined = many
                    .iter()
                    .map(|value| value.as_bytes())
                    .collect::<Vec<_>>()
                    .join(&b", "[..]);
                match HeaderValue::from_bytes(&joined) {
                    Ok(value) => value,
                    Err(_) => continue,
                }
            }
        };

        request.headers.insert(name.clone(), value);
    }
}

/// Dispatch strategy for one subgraph.
#[derive(Clone)]
pub struct RemoteDataSource {
    name: String,
    url: String,
    client: reqwest::Client,
    before_send: Option<BeforeSend>,
}

impl fmt::Debug for RemoteDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDataSource")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("before_send", &self.before_send.is_some())
            .finish()
    }
}

impl RemoteDataSource {
    pub fn new(subgraph: &SubgraphEntry, client: reqwest::Client) -> Self {
        RemoteDataSource {
            name: subgraph.name.clone(),
            url: subgraph.url.clone(),
            client,
            before_send: None,
        }
    }

    /// The data source used by default: forwards inbound headers.
    pub fn forwarding_headers(subgraph: &SubgraphEntry, client: reqwest::Client) -> Self {
        Self::new(subgraph, client).with_before_send(forward_headers)
    }

    pub fn with_before_send<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut SubgraphRequest, &RequestContext) + Send + Sync + 'static,
    {
        self.before_send = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Build the outbound request and run the before-send hook on it.
    pub fn build_request(&self, body: GraphQLRequest, context: &RequestContext) -> SubgraphRequest {
        let mut request = SubgraphRequest {
            url: self.url.clone(),
            headers: HeaderMap::new(),
            body,
        };
        if let Some(hook) = &self.before_send {
            hook(&mut request, context);
        }
        request
    }

    /// Send `body` to the subgraph and return its GraphQL response.
    pub async fn process(
        &self,
        body: GraphQLRequest,
        context: &RequestContext,
    ) -> Result<Value, FetchError> {
        let request = self.build_request(body, context);
        self.send(request).await
    }

    async fn send(&self, request: SubgraphRequest) -> Result<Value, FetchError> {
        let mut headers = request.headers;
        for name in TRANSPORT_HEADERS.iter() {
            headers.remove(name);
        }

        let response = self
            .client
            .post(&request.url)
            .headers(headers)
            .json(&request.body)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                name: self.name.clone(),
                source,
            })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|source| FetchError::Request {
            name: self.name.clone(),
            source,
        })?;

        // A GraphQL body is accepted even on error statuses so its errors reach the client.
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(body)
                if body.is_object()
                    && (status.is_success()
                        || body.get("data").is_some()
                        || body.get("errors").is_some()) =>
            {
                Ok(body)
            }
            _ if !status.is_success() => Err(FetchError::Status {
                name: self.name.clone(),
                status,
            }),
            Ok(_) => Err(FetchError::InvalidBody {
                name: self.name.clone(),
                message: "expected a JSON object".to_string(),
            }),
            Err(e) => Err(FetchError::InvalidBody {
                name: self.name.clone(),
                message: e.to_string(),
            }),
        }
    }
}
