use http::Method;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::RwLock, task::JoinHandle};

use crate::{
    FederatedSchema, GraphQLRequest, RemoteDataSource, RequestContext, ServiceMap, SubgraphEntry,
    composition::{IntrospectAndCompose, SupergraphSource},
    config::{GatewaySettings, validate_subgraphs},
    error::{CompositionError, GatewayError},
    query_executor::{HttpQueryExecutor, QueryExecutor},
    query_planner::{QueryPlanner, SimpleQueryPlanner},
};

type BuildService = Box<dyn Fn(&SubgraphEntry, &reqwest::Client) -> RemoteDataSource + Send + Sync>;

pub struct FederationGateway {
    settings: GatewaySettings,
    data_sources: Vec<Arc<RemoteDataSource>>,
    services: ServiceMap,
    schema: RwLock<Option<Arc<FederatedSchema>>>,
    supergraph_source: Box<dyn SupergraphSource + Send + Sync>,
    query_planner: Box<dyn QueryPlanner + Send + Sync>,
    query_executor: Box<dyn QueryExecutor + Send + Sync>,
}

pub struct GatewayBuilder {
    settings: GatewaySettings,
    build_service: BuildService,
    supergraph_source: Box<dyn SupergraphSource + Send + Sync>,
    query_planner: Box<dyn QueryPlanner + Send + Sync>,
    query_executor: Box<dyn QueryExecutor + Send + Sync>,
}

impl GatewayBuilder {
    /// Factory turning a subgraph registration into its data source. The
    /// default forwards inbound headers.
    pub fn build_service<F>(mut self, build_service: F) -> Self
    where
        F: Fn(&SubgraphEntry, &reqwest::Client) -> RemoteDataSource + Send + Sync + 'static,
    {
        self.build_service = Box::new(build_service);
        self
    }

    pub fn supergraph_source(mut self, source: impl SupergraphSource + Send + Sync + 'static) -> Self {
        self.supergraph_source = Box::new(source);
        self
    }

    pub fn query_planner(mut self, planner: impl QueryPlanner + Send + Sync + 'static) -> Self {
        self.query_planner = Box::new(planner);
        self
    }

    pub fn query_executor(mut self, executor: impl QueryExecutor + Send + Sync + 'static) -> Self {
        self.query_executor = Box::new(executor);
        self
    }

    pub fn build(self) -> Result<FederationGateway, GatewayError> {
        validate_subgraphs(&self.settings.subgraphs)?;

        let client = reqwest::Client::builder()
            .timeout(self.settings.request_timeout())
            .build()?;

        let data_sources: Vec<Arc<RemoteDataSource>> = self
            .settings
            .subgraphs
            .iter()
            .map(|subgraph| Arc::new((self.build_service)(subgraph, &client)))
            .collect();
        let services: HashMap<_, _> = data_sources
            .iter()
            .map(|source| (source.name().to_string(), Arc::clone(source)))
            .collect();

        Ok(FederationGateway {
            settings: self.settings,
            data_sources,
            services,
            schema: RwLock::new(None),
            supergraph_source: self.supergraph_source,
            query_planner: self.query_planner,
            query_executor: self.query_executor,
        })
    }
}

impl FederationGateway {
    pub fn builder(settings: GatewaySettings) -> GatewayBuilder {
        GatewayBuilder {
            settings,
            build_service: Box::new(|subgraph: &SubgraphEntry, client: &reqwest::Client| {
                RemoteDataSource::forwarding_headers(subgraph, client.clone())
            }),
            supergraph_source: Box::new(IntrospectAndCompose::new()),
            query_planner: Box::new(SimpleQueryPlanner::new()),
            query_executor: Box::new(HttpQueryExecutor::new()),
        }
    }

    pub fn debug(&self) -> bool {
        self.settings.debug
    }

    pub fn data_source(&self, name: &str) -> Option<&Arc<RemoteDataSource>> {
        self.services.get(name)
    }

    pub async fn schema(&self) -> Option<Arc<FederatedSchema>> {
        self.schema.read().await.clone()
    }

    /// Compose the schema for the first time. Any failure is fatal: the
    /// caller must not start serving.
    pub async fn start(&self) -> Result<(), GatewayError> {
        tracing::info!(
            "Composing schema from {} subgraph(s)",
            self.data_sources.len()
        );
        self.refresh().await?;
        Ok(())
    }

    /// Recompose and swap the served schema. On failure the previous schema
    /// stays in place.
    pub async fn refresh(&self) -> Result<(), CompositionError> {
        let schema = self.supergraph_source.load(&self.data_sources).await?;
        tracing::info!(
            "Schema composed: {} types and fields across {} subgraph(s)",
            schema.type_to_service_map.len(),
            schema.subgraphs.len()
        );
        *self.schema.write().await = Some(Arc::new(schema));
        Ok(())
    }

    /// Spawn the background recomposition loop if a poll interval is set.
    pub fn spawn_polling(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.settings.poll_interval()?;
        let gateway = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately and startup already composed.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = gateway.refresh().await {
                    tracing::warn!("Schema refresh failed, keeping previous schema: {}", e);
                }
            }
        }))
    }

    pub async fn process_request(
        &self,
        request: GraphQLRequest,
        context: &RequestContext,
    ) -> Result<Value, GatewayError> {
        tracing::debug!("Processing request: {:?}", request.operation_name);

        let schema = self.schema().await.ok_or(GatewayError::NotReady)?;

        let plan = self.query_planner.plan_query(&request, &schema).await?;
        if plan.is_mutation && context.method == Method::GET {
            return Err(GatewayError::MutationOverGet);
        }

        Ok(self
            .query_executor
            .execute_plan(plan, &self.services, context)
            .await)
    }
}
