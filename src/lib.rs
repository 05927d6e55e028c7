pub mod composition;
pub mod config;
pub mod data_source;
pub mod error;
pub mod federation_gateway;
pub mod query_executor;
pub mod query_planner;
pub mod server;

pub use composition::IntrospectAndCompose;
pub use config::GatewayConfig;
pub use data_source::{RemoteDataSource, RequestContext, SubgraphRequest, forward_headers};
pub use error::{CompositionError, ConfigError, GatewayError};
pub use federation_gateway::FederationGateway;
pub use query_executor::HttpQueryExecutor;
pub use query_planner::SimpleQueryPlanner;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc};

/// Data sources keyed by subgraph name.
pub type ServiceMap = HashMap<String, Arc<RemoteDataSource>>;

/// A subgraph registration: unique name plus the url it is served at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgraphEntry {
    pub name: String,
    pub url: String,
}

impl SubgraphEntry {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        SubgraphEntry {
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        GraphQLRequest {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// The composed schema served by the gateway.
#[derive(Clone, Debug)]
pub struct FederatedSchema {
    /// Subgraphs in registry order.
    pub subgraphs: Vec<SubgraphEntry>,
    /// `Type` and `Type.field` coordinates to the subgraphs defining them,
    /// in registry order. Root types are normalised to `Query`, `Mutation`
    /// and `Subscription`.
    pub type_to_service_map: HashMap<String, Vec<String>>,
}

impl FederatedSchema {
    pub fn owners(&self, coordinate: &str) -> &[String] {
        self.type_to_service_map
            .get(coordinate)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether any subgraph defines or extends `type_name`.
    pub fn has_type(&self, type_name: &str) -> bool {
        self.type_to_service_map.contains_key(type_name)
    }
}

/// One request to one subgraph.
#[derive(Clone, Debug, PartialEq)]
pub struct SubgraphFetch {
    pub service: String,
    pub request: GraphQLRequest,
}

#[derive(Clone, Debug, Default)]
pub struct QueryPlan {
    /// Fetches in registry order of the subgraphs involved.
    pub fetches: Vec<SubgraphFetch>,
    /// Root fields answered by the gateway itself, such as `__typename`.
    pub local_data: Map<String, Value>,
    pub is_mutation: bool,
}
