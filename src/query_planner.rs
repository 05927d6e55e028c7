use async_trait::async_trait;
use graphql_parser::{Pos, query as ast, query::parse_query};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{FederatedSchema, GraphQLRequest, QueryPlan, SubgraphFetch, error::GatewayError};

type Fragments<'a> = HashMap<String, ast::FragmentDefinition<'a, String>>;

#[async_trait]
pub trait QueryPlanner {
    async fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &FederatedSchema,
    ) -> Result<QueryPlan, GatewayError>;
}

/// Routes every root field to the subgraph that owns it and sends each
/// subgraph one operation with only its own root fields.
#[derive(Clone, Debug, Default)]
pub struct SimpleQueryPlanner;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    fn root_type(self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
        }
    }
}

struct Operation<'a> {
    kind: OperationKind,
    position: Pos,
    name: Option<String>,
    variable_definitions: Vec<ast::VariableDefinition<'a, String>>,
    directives: Vec<ast::Directive<'a, String>>,
    selection_set: ast::SelectionSet<'a, String>,
}

impl SimpleQueryPlanner {
    pub fn new() -> Self {
        SimpleQueryPlanner
    }

    fn select_operation<'a>(
        operations: Vec<ast::OperationDefinition<'a, String>>,
        operation_name: Option<&str>,
    ) -> Result<Operation<'a>, GatewayError> {
        let definition = match operation_name {
            Some(wanted) => operations
                .into_iter()
                .find(|op| Self::name_of(op) == Some(wanted))
                .ok_or_else(|| {
                    GatewayError::InvalidRequest(format!("Unknown operation named \"{}\".", wanted))
                })?,
            None if operations.len() > 1 => {
                return Err(GatewayError::InvalidRequest(
                    "Must provide operation name if query contains multiple operations."
                        .to_string(),
                ));
            }
            None => operations.into_iter().next().ok_or_else(|| {
                GatewayError::InvalidRequest("Query document contains no operation.".to_string())
            })?,
        };

        match definition {
            ast::OperationDefinition::SelectionSet(selection_set) => Ok(Operation {
                kind: OperationKind::Query,
                position: selection_set.span.0,
                name: None,
                variable_definitions: Vec::new(),
                directives: Vec::new(),
                selection_set,
            }),
            ast::OperationDefinition::Query(q) => Ok(Operation {
                kind: OperationKind::Query,
                position: q.position,
                name: q.name,
                variable_definitions: q.variable_definitions,
                directives: q.directives,
                selection_set: q.selection_set,
            }),
            ast::OperationDefinition::Mutation(m) => Ok(Operation {
                kind: OperationKind::Mutation,
                position: m.position,
                name: m.name,
                variable_definitions: m.variable_definitions,
                directives: m.directives,
                selection_set: m.selection_set,
            }),
            ast::OperationDefinition::Subscription(_) => Err(GatewayError::InvalidRequest(
                "Subscriptions are not supported by this gateway.".to_string(),
            )),
        }
    }

    fn name_of<'b>(operation: &'b ast::OperationDefinition<'_, String>) -> Option<&'b str> {
        match operation {
            ast::OperationDefinition::SelectionSet(_) => None,
            ast::OperationDefinition::Query(q) => q.name.as_deref(),
            ast::OperationDefinition::Mutation(m) => m.name.as_deref(),
            ast::OperationDefinition::Subscription(s) => s.name.as_deref(),
        }
    }

    /// Flatten root level fragment spreads and inline fragments into plain
    /// fields, pushing their directives down onto each field.
    fn root_fields<'a>(
        selection_set: &ast::SelectionSet<'a, String>,
        fragments: &Fragments<'a>,
        inherited: &[ast::Directive<'a, String>],
        visiting: &mut HashSet<String>,
        out: &mut Vec<ast::Field<'a, String>>,
    ) -> Result<(), GatewayError> {
        for item in &selection_set.items {
            match item {
                ast::Selection::Field(field) => {
                    let mut field = field.clone();
                    field.directives.extend(inherited.iter().cloned());
                    out.push(field);
                }
                ast::Selection::FragmentSpread(spread) => {
                    let fragment = fragments.get(&spread.fragment_name).ok_or_else(|| {
                        GatewayError::InvalidRequest(format!(
                            "Unknown fragment \"{}\".",
                            spread.fragment_name
                        ))
                    })?;
                    if !visiting.insert(spread.fragment_name.clone()) {
                        return Err(GatewayError::InvalidRequest(format!(
                            "Cannot spread fragment \"{}\" within itself.",
                            spread.fragment_name
                        )));
                    }
                    let mut directives = inherited.to_vec();
                    directives.extend(spread.directives.iter().cloned());
                    Self::root_fields(&fragment.selection_set, fragments, &directives, visiting, out)?;
                    visiting.remove(&spread.fragment_name);
                }
                ast::Selection::InlineFragment(inline) => {
                    let mut directives = inherited.to_vec();
                    directives.extend(inline.directives.iter().cloned());
                    Self::root_fields(&inline.selection_set, fragments, &directives, visiting, out)?;
                }
            }
        }
        Ok(())
    }

    /// Subgraphs asked to answer an introspection field. A `__type` lookup
    /// of a composed type goes to the subgraphs defining it, anything else to
    /// every subgraph. The executor merges the answers by name.
    fn introspection_targets(field: &ast::Field<'_, String>, schema: &FederatedSchema) -> Vec<usize> {
        let type_name = field
            .arguments
            .iter()
            .find_map(|(name, value)| match value {
                ast::Value::String(type_name) if field.name == "__type" && name == "name" => {
                    Some(type_name.as_str())
                }
                _ => None,
            })
            .filter(|type_name| schema.has_type(type_name));

        schema
            .subgraphs
            .iter()
            .enumerate()
            .filter(|(_, subgraph)| match type_name {
                Some(type_name) => schema.owners(type_name).contains(&subgraph.name),
                None => true,
            })
            .map(|(index, _)| index)
            .collect()
    }

    fn render_fetch<'a>(
        service: String,
        operation: &Operation<'a>,
        fields: Vec<ast::Field<'a, String>>,
        fragments: &Fragments<'a>,
        variables: Option<&Map<String, Value>>,
    ) -> Result<SubgraphFetch, GatewayError> {
        let selection_set = ast::SelectionSet {
            span: operation.selection_set.span,
            items: fields.into_iter().map(ast::Selection::Field).collect(),
        };

        let mut usage = Usage::default();
        usage.directives(&operation.directives);
        usage.selection_set(&selection_set, fragments)?;

        let variable_definitions: Vec<_> = operation
            .variable_definitions
            .iter()
            .filter(|definition| usage.variables.contains(&definition.name))
            .cloned()
            .collect();

        let definition = match operation.kind {
            OperationKind::Query => ast::OperationDefinition::Query(ast::Query {
                position: operation.position,
                name: operation.name.clone(),
                variable_definitions,
                directives: operation.directives.clone(),
                selection_set,
            }),
            OperationKind::Mutation => ast::OperationDefinition::Mutation(ast::Mutation {
                position: operation.position,
                name: operation.name.clone(),
                variable_definitions,
                directives: operation.directives.clone(),
                selection_set,
            }),
        };

        let mut definitions = vec![ast::Definition::Operation(definition)];
        definitions.extend(
            usage
                .fragments
                .iter()
                .filter_map(|name| fragments.get(name).cloned())
                .map(ast::Definition::Fragment),
        );
        let document = ast::Document { definitions };

        let variables = variables
            .map(|provided| {
                provided
                    .iter()
                    .filter(|(name, _)| usage.variables.contains(*name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect::<Map<String, Value>>()
            })
            .filter(|selected| !selected.is_empty())
            .map(Value::Object);

        Ok(SubgraphFetch {
            service,
            request: GraphQLRequest {
                query: document.to_string(),
                variables,
                operation_name: operation.name.clone(),
            },
        })
    }
}

/// Whether `@skip` or `@include` removes a field answered by the gateway.
fn is_skipped(
    directives: &[ast::Directive<'_, String>],
    variables: Option<&Map<String, Value>>,
) -> bool {
    directives.iter().any(|directive| {
        let condition = directive
            .arguments
            .iter()
            .find(|(name, _)| name == "if")
            .map(|(_, value)| match value {
                ast::Value::Boolean(value) => *value,
                ast::Value::Variable(name) => variables
                    .and_then(|provided| provided.get(name))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                _ => false,
            });
        matches!(
            (directive.name.as_str(), condition),
            ("skip", Some(true)) | ("include", Some(false))
        )
    })
}

/// Variables and fragments referenced by a selection set.
#[derive(Default)]
struct Usage {
    variables: HashSet<String>,
    fragments: Vec<String>,
}

impl Usage {
    fn value(&mut self, value: &ast::Value<'_, String>) {
        match value {
            ast::Value::Variable(name) => {
                self.variables.insert(name.clone());
            }
            ast::Value::List(items) => items.iter().for_each(|item| self.value(item)),
            ast::Value::Object(fields) => fields.values().for_each(|item| self.value(item)),
            _ => {}
        }
    }

    fn directives(&mut self, directives: &[ast::Directive<'_, String>]) {
        for directive in directives {
            for (_, value) in &directive.arguments {
                self.value(value);
            }
        }
    }

    fn selection_set<'a>(
        &mut self,
        selection_set: &ast::SelectionSet<'a, String>,
        fragments: &Fragments<'a>,
    ) -> Result<(), GatewayError> {
        for item in &selection_set.items {
            match item {
                ast::Selection::Field(field) => {
                    for (_, value) in &field.arguments {
                        self.value(value);
                    }
                    self.directives(&field.directives);
                    self.selection_set(&field.selection_set, fragments)?;
                }
                ast::Selection::FragmentSpread(spread) => {
                    self.directives(&spread.directives);
                    if self.fragments.contains(&spread.fragment_name) {
                        continue;
                    }
                    let fragment = fragments.get(&spread.fragment_name).ok_or_else(|| {
                        GatewayError::InvalidRequest(format!(
                            "Unknown fragment \"{}\".",
                            spread.fragment_name
                        ))
                    })?;
                    self.fragments.push(spread.fragment_name.clone());
                    self.directives(&fragment.directives);
                    self.selection_set(&fragment.selection_set, fragments)?;
                }
                ast::Selection::InlineFragment(inline) => {
                    self.directives(&inline.directives);
                    self.selection_set(&inline.selection_set, fragments)?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueryPlanner for SimpleQueryPlanner {
    async fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &FederatedSchema,
    ) -> Result<QueryPlan, GatewayError> {
        let document = parse_query::<String>(&request.query)
            .map_err(|e| GatewayError::InvalidRequest(format!("Syntax Error: {}", e)))?;

        let mut operations = Vec::new();
        let mut fragments = Fragments::new();
        for definition in document.definitions {
            match definition {
                ast::Definition::Operation(operation) => operations.push(operation),
                ast::Definition::Fragment(fragment) => {
                    fragments.insert(fragment.name.clone(), fragment);
                }
            }
        }

        let operation = Self::select_operation(operations, request.operation_name.as_deref())?;
        let root_type = operation.kind.root_type();

        let mut fields = Vec::new();
        Self::root_fields(
            &operation.selection_set,
            &fragments,
            &[],
            &mut HashSet::new(),
            &mut fields,
        )?;

        let variables = request.variables.as_ref().and_then(Value::as_object);
        let mut local_data = Map::new();
        // Keyed by registry position so fetches follow registry order.
        let mut groups: BTreeMap<usize, Vec<ast::Field<'_, String>>> = BTreeMap::new();

        for field in fields {
            let index = match field.name.as_str() {
                "__typename" => {
                    if !is_skipped(&field.directives, variables) {
                        let key = field.alias.clone().unwrap_or_else(|| field.name.clone());
                        local_data.insert(key, Value::String(root_type.to_string()));
                    }
                    continue;
                }
                "__schema" | "__type" => {
                    for index in Self::introspection_targets(&field, schema) {
                        groups.entry(index).or_default().push(field.clone());
                    }
                    continue;
                }
                name => schema
                    .owners(&format!("{}.{}", root_type, name))
                    .first()
                    .and_then(|owner| schema.subgraphs.iter().position(|s| &s.name == owner))
                    .ok_or_else(|| GatewayError::UnknownField {
                        type_name: root_type.to_string(),
                        field: field.name.clone(),
                    })?,
            };
            groups.entry(index).or_default().push(field);
        }

        let mut fetches = Vec::with_capacity(groups.len());
        for (index, fields) in groups {
            let service = schema.subgraphs[index].name.clone();
            tracing::debug!("Planned {} root field(s) for subgraph {}", fields.len(), service);
            fetches.push(Self::render_fetch(
                service, &operation, fields, &fragments, variables,
            )?);
        }

        Ok(QueryPlan {
            fetches,
            local_data,
            is_mutation: operation.kind == OperationKind::Mutation,
        })
    }
}
