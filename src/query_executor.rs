use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value, json};

use crate::{QueryPlan, RequestContext, ServiceMap, SubgraphFetch, error::FetchError};

#[async_trait]
pub trait QueryExecutor {
    /// Run every fetch of `plan` and merge the responses. Subgraph failures
    /// become entries in `errors`; whatever data did arrive is kept.
    async fn execute_plan(
        &self,
        plan: QueryPlan,
        services: &ServiceMap,
        context: &RequestContext,
    ) -> Value;
}

#[derive(Clone, Debug, Default)]
pub struct HttpQueryExecutor;

impl HttpQueryExecutor {
    pub fn new() -> Self {
        HttpQueryExecutor
    }

    async fn fetch(
        fetch: SubgraphFetch,
        services: &ServiceMap,
        context: &RequestContext,
    ) -> (String, Result<Value, FetchError>) {
        let Some(source) = services.get(&fetch.service) else {
            let message = format!("no data source registered for `{}`", fetch.service);
            return (
                fetch.service.clone(),
                Err(FetchError::InvalidBody {
                    name: fetch.service,
                    message,
                }),
            );
        };

        let result = source.process(fetch.request, context).await;
        if let Err(e) = &result {
            tracing::warn!("Subgraph {} failed: {}", fetch.service, e);
        }
        (fetch.service, result)
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute_plan(
        &self,
        plan: QueryPlan,
        services: &ServiceMap,
        context: &RequestContext,
    ) -> Value {
        // Mutation root fields run one subgraph at a time, queries fan out.
        let results = if plan.is_mutation {
            let mut results = Vec::with_capacity(plan.fetches.len());
            for fetch in plan.fetches {
                results.push(Self::fetch(fetch, services, context).await);
            }
            results
        } else {
            join_all(
                plan.fetches
                    .into_iter()
                    .map(|fetch| Self::fetch(fetch, services, context)),
            )
            .await
        };

        let mut response = ResponseMerger::new(plan.local_data);
        for (service_name, result) in results {
            match result {
                Ok(body) => response.merge(&service_name, body),
                Err(e) => response.fetch_failed(&service_name, &e),
            }
        }
        response.finish()
    }
}

/// Accumulates subgraph responses into one GraphQL response.
struct ResponseMerger {
    data: Option<Map<String, Value>>,
    errors: Vec<Value>,
}

impl ResponseMerger {
    fn new(local_data: Map<String, Value>) -> Self {
        ResponseMerger {
            data: (!local_data.is_empty()).then_some(local_data),
            errors: Vec::new(),
        }
    }

    fn merge(&mut self, service_name: &str, mut body: Value) {
        if let Some(Value::Object(fields)) = body.get_mut("data").map(Value::take) {
            let data = self.data.get_or_insert_with(Map::new);
            for (key, value) in fields {
                match data.get_mut(&key) {
                    Some(existing) => merge_by_name(existing, value),
                    None => {
                        data.insert(key, value);
                    }
                }
            }
        }

        if let Some(Value::Array(errors)) = body.get_mut("errors").map(Value::take) {
            for mut error in errors {
                if let Value::Object(error_obj) = &mut error {
                    let extensions = error_obj
                        .entry("extensions")
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(extensions) = extensions {
                        extensions.insert(
                            "serviceName".to_string(),
                            Value::String(service_name.to_string()),
                        );
                    }
                }
                self.errors.push(error);
            }
        }
    }

    fn fetch_failed(&mut self, service_name: &str, error: &FetchError) {
        self.errors.push(json!({
            "message": format!("HTTP fetch failed from '{}': {}", service_name, error),
            "extensions": {
                "code": "SUBGRAPH_REQUEST_FAILED",
                "serviceName": service_name,
            }
        }));
    }

    fn finish(self) -> Value {
        let mut response = Map::new();
        response.insert(
            "data".to_string(),
            self.data.map(Value::Object).unwrap_or(Value::Null),
        );
        if !self.errors.is_empty() {
            response.insert("errors".to_string(), Value::Array(self.errors));
        }
        Value::Object(response)
    }
}

/// Fold `incoming` into `existing`. Only introspection fields are fetched
/// from more than one subgraph, so this is where their answers combine:
/// objects merge key by key, list entries sharing a `name` merge into one and
/// other list entries are added once.
fn merge_by_name(existing: &mut Value, incoming: Value) {
    if existing.is_null() {
        *existing = incoming;
        return;
    }

    match (existing, incoming) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(current) => merge_by_name(current, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(source)) => {
            for item in source {
                let same_name = item.get("name").and_then(Value::as_str).and_then(|name| {
                    target
                        .iter()
                        .position(|current| current.get("name").and_then(Value::as_str) == Some(name))
                });
                match same_name {
                    Some(index) => merge_by_name(&mut target[index], item),
                    None if !target.contains(&item) => target.push(item),
                    None => {}
                }
            }
        }
        _ => {}
    }
}
