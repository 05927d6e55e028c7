//! Error types for configuration, schema composition and request handling.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating the startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("subgraph `{0}` is registered more than once")]
    DuplicateSubgraph(String),

    #[error("subgraph `{name}` has an invalid url `{url}`")]
    InvalidUrl { name: String, url: String },

    #[error("no subgraphs configured")]
    NoSubgraphs,

    #[error("server path `{0}` must start with `/`")]
    InvalidPath(String),
}

/// Errors raised while fetching subgraph schemas or merging them.
///
/// Any of these is fatal at startup: the gateway never serves a partial
/// schema.
#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("subgraph `{0}` is registered more than once")]
    DuplicateSubgraph(String),

    #[error("subgraph `{name}` is unreachable: {source}")]
    Unreachable {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("subgraph `{name}` answered the schema request with status {status}")]
    BadStatus {
        name: String,
        status: reqwest::StatusCode,
    },

    #[error("subgraph `{name}` returned an invalid schema response: {message}")]
    InvalidResponse { name: String, message: String },

    #[error("subgraph `{name}` has an invalid schema: {message}")]
    InvalidSchema { name: String, message: String },

    #[error("field `{coordinate}` is defined by several subgraphs: {}", .subgraphs.join(", "))]
    FieldConflict {
        coordinate: String,
        subgraphs: Vec<String>,
    },
}

/// Errors raised by a data source while talking to its subgraph.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to subgraph `{name}` failed: {source}")]
    Request {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("subgraph `{name}` responded with status {status}")]
    Status {
        name: String,
        status: reqwest::StatusCode,
    },

    #[error("subgraph `{name}` returned an invalid response: {message}")]
    InvalidBody { name: String, message: String },
}

/// Top level gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("schema composition failed: {0}")]
    Composition(#[from] CompositionError),

    #[error("failed to build the subgraph http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("the gateway has no composed schema yet")]
    NotReady,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("mutations can only be sent over POST")]
    MutationOverGet,

    #[error("cannot query field `{field}` on type `{type_name}`")]
    UnknownField { type_name: String, field: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// GraphQL error code reported in `extensions.code`.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) | GatewayError::Client(_) | GatewayError::Io(_) => {
                "INTERNAL_SERVER_ERROR"
            }
            GatewayError::Composition(_) | GatewayError::NotReady => "SUPERGRAPH_UNAVAILABLE",
            GatewayError::InvalidRequest(_) => "GRAPHQL_PARSE_FAILED",
            GatewayError::MutationOverGet => "BAD_REQUEST",
            GatewayError::UnknownField { .. } => "GRAPHQL_VALIDATION_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_conflict_lists_every_subgraph() {
        let err = CompositionError::FieldConflict {
            coordinate: "Query.me".to_string(),
            subgraphs: vec!["users".to_string(), "accounts".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "field `Query.me` is defined by several subgraphs: users, accounts"
        );
    }

    #[test]
    fn composition_errors_convert_into_gateway_errors() {
        let err: GatewayError = CompositionError::DuplicateSubgraph("users".to_string()).into();
        assert_eq!(err.code(), "SUPERGRAPH_UNAVAILABLE");
        assert!(err.to_string().starts_with("schema composition failed"));
    }
}
