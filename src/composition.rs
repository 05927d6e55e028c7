use apollo_parser::cst::{self, CstNode};
use async_trait::async_trait;
use futures::future::join_all;
use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, Directive, Field, TypeDefinition, TypeExtension};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::{
    FederatedSchema, GraphQLRequest, RemoteDataSource, RequestContext, SubgraphEntry,
    error::{CompositionError, FetchError},
};

const SERVICE_SDL_QUERY: &str = "query __ApolloGetServiceDefinition__ { _service { sdl } }";

// Fields every federated subgraph adds to its query type.
const FEDERATION_ROOT_FIELDS: [&str; 2] = ["_service", "_entities"];

/// Produces the federated schema for a set of subgraph data sources.
#[async_trait]
pub trait SupergraphSource {
    async fn load(
        &self,
        services: &[Arc<RemoteDataSource>],
    ) -> Result<FederatedSchema, CompositionError>;
}

/// Asks every subgraph for its SDL through `_service { sdl }` and composes
/// the answers.
#[derive(Clone, Debug, Default)]
pub struct IntrospectAndCompose;

impl IntrospectAndCompose {
    pub fn new() -> Self {
        IntrospectAndCompose
    }

    async fn fetch_sdl(source: &RemoteDataSource) -> Result<String, CompositionError> {
        tracing::debug!("Fetching SDL from subgraph {} at {}", source.name(), source.url());

        let response = source
            .process(
                GraphQLRequest::new(SERVICE_SDL_QUERY)
                    .with_operation_name("__ApolloGetServiceDefinition__"),
                &RequestContext::default(),
            )
            .await
            .map_err(|e| match e {
                FetchError::Request { name, source } => {
                    CompositionError::Unreachable { name, source }
                }
                FetchError::Status { name, status } => CompositionError::BadStatus { name, status },
                FetchError::InvalidBody { name, message } => {
                    CompositionError::InvalidResponse { name, message }
                }
            })?;

        if let Some(errors) = response
            .get("errors")
            .and_then(Value::as_array)
            .filter(|errors| !errors.is_empty())
        {
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|error| error.get("message").and_then(Value::as_str))
                .collect();
            return Err(CompositionError::InvalidResponse {
                name: source.name().to_string(),
                message: messages.join("; "),
            });
        }

        response
            .pointer("/data/_service/sdl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CompositionError::InvalidResponse {
                name: source.name().to_string(),
                message: "missing `data._service.sdl`".to_string(),
            })
    }
}

#[async_trait]
impl SupergraphSource for IntrospectAndCompose {
    async fn load(
        &self,
        services: &[Arc<RemoteDataSource>],
    ) -> Result<FederatedSchema, CompositionError> {
        let entries: Vec<SubgraphEntry> = services
            .iter()
            .map(|source| SubgraphEntry::new(source.name(), source.url()))
            .collect();
        check_unique_names(&entries)?;

        let results = join_all(services.iter().map(|source| Self::fetch_sdl(source))).await;

        let mut subgraphs = Vec::with_capacity(entries.len());
        for (entry, result) in entries.into_iter().zip(results) {
            let sdl = result?;
            tracing::info!("Loaded schema of subgraph {} ({} bytes)", entry.name, sdl.len());
            subgraphs.push((entry, sdl));
        }

        compose_subgraphs(subgraphs)
    }
}

fn check_unique_names(subgraphs: &[SubgraphEntry]) -> Result<(), CompositionError> {
    let mut seen = HashSet::new();
    for subgraph in subgraphs {
        if !seen.insert(subgraph.name.as_str()) {
            return Err(CompositionError::DuplicateSubgraph(subgraph.name.clone()));
        }
    }
    Ok(())
}

fn has_directive(directives: &[Directive<'_, String>], name: &str) -> bool {
    directives.iter().any(|directive| directive.name == name)
}

fn record(map: &mut HashMap<String, Vec<String>>, key: String, service: &str) {
    let owners = map.entry(key).or_default();
    if !owners.iter().any(|owner| owner == service) {
        owners.push(service.to_string());
    }
}

#[derive(Default)]
struct Composer {
    type_to_service_map: HashMap<String, Vec<String>>,
    // Root coordinate to (subgraph, marked shareable).
    root_fields: HashMap<String, Vec<(String, bool)>>,
}

impl Composer {
    fn add_subgraph(
        &mut self,
        service: &str,
        definitions: &[Definition<'_, String>],
    ) {
        let roots = root_type_names(definitions);

        for definition in definitions {
            match definition {
                Definition::TypeDefinition(TypeDefinition::Object(obj)) => {
                    let shareable = has_directive(&obj.directives, "shareable");
                    self.add_fields(service, &roots, &obj.name, shareable, &obj.fields);
                }
                Definition::TypeExtension(TypeExtension::Object(ext)) => {
                    let shareable = has_directive(&ext.directives, "shareable");
                    self.add_fields(service, &roots, &ext.name, shareable, &ext.fields);
                }
                Definition::TypeDefinition(TypeDefinition::Interface(iface)) => {
                    self.add_fields(service, &roots, &iface.name, false, &iface.fields);
                }
                Definition::TypeExtension(TypeExtension::Interface(ext)) => {
                    self.add_fields(service, &roots, &ext.name, false, &ext.fields);
                }
                Definition::TypeDefinition(typedef) => {
                    let type_name = match typedef {
                        TypeDefinition::Scalar(scalar) => &scalar.name,
                        TypeDefinition::Union(union_type) => &union_type.name,
                        TypeDefinition::Enum(enum_type) => &enum_type.name,
                        TypeDefinition::InputObject(input) => &input.name,
                        TypeDefinition::Object(obj) => &obj.name,
                        TypeDefinition::Interface(iface) => &iface.name,
                    };
                    record(&mut self.type_to_service_map, type_name.clone(), service);
                }
                Definition::TypeExtension(ext) => {
                    let type_name = match ext {
                        TypeExtension::Scalar(scalar) => &scalar.name,
                        TypeExtension::Union(union_type) => &union_type.name,
                        TypeExtension::Enum(enum_type) => &enum_type.name,
                        TypeExtension::InputObject(input) => &input.name,
                        TypeExtension::Object(obj) => &obj.name,
                        TypeExtension::Interface(iface) => &iface.name,
                    };
                    record(&mut self.type_to_service_map, type_name.clone(), service);
                }
                Definition::SchemaDefinition(_) | Definition::DirectiveDefinition(_) => {}
            }
        }
    }

    fn add_fields(
        &mut self,
        service: &str,
        roots: &HashMap<String, &'static str>,
        type_name: &str,
        type_shareable: bool,
        fields: &[Field<'_, String>],
    ) {
        let root = roots.get(type_name).copied();
        let type_name = root.unwrap_or(type_name);
        record(&mut self.type_to_service_map, type_name.to_string(), service);

        for field in fields {
            if has_directive(&field.directives, "external") {
                continue;
            }
            if root.is_some() && FEDERATION_ROOT_FIELDS.contains(&field.name.as_str()) {
                continue;
            }

            let coordinate = format!("{}.{}", type_name, field.name);
            record(&mut self.type_to_service_map, coordinate.clone(), service);

            if root.is_some() {
                let shareable = type_shareable || has_directive(&field.directives, "shareable");
                self.root_fields
                    .entry(coordinate)
                    .or_default()
                    .push((service.to_string(), shareable));
            }
        }
    }

    fn check_root_conflicts(&mut self) -> Result<(), CompositionError> {
        let mut coordinates: Vec<_> = self.root_fields.drain().collect();
        coordinates.sort_by(|a, b| a.0.cmp(&b.0));
        for (coordinate, owners) in coordinates {
            if owners.len() > 1 && !owners.iter().all(|(_, shareable)| *shareable) {
                return Err(CompositionError::FieldConflict {
                    coordinate,
                    subgraphs: owners.into_iter().map(|(name, _)| name).collect(),
                });
            }
        }
        Ok(())
    }
}

/// Merge subgraph SDLs into one federated schema.
///
/// Every type and field coordinate is mapped to the subgraphs defining it.
/// A root operation field defined by more than one subgraph is a conflict
/// unless each definition is marked `@shareable`.
pub fn compose_subgraphs(
    subgraphs: Vec<(SubgraphEntry, String)>,
) -> Result<FederatedSchema, CompositionError> {
    let entries: Vec<SubgraphEntry> = subgraphs.iter().map(|(entry, _)| entry.clone()).collect();
    check_unique_names(&entries)?;

    let mut composer = Composer::default();

    for (entry, sdl) in subgraphs {
        let invalid = |message: String| CompositionError::InvalidSchema {
            name: entry.name.clone(),
            message,
        };
        let cleaned = strip_schema_extensions(&sdl).map_err(invalid)?;
        let document = parse_schema::<String>(&cleaned).map_err(|e| invalid(e.to_string()))?;
        composer.add_subgraph(&entry.name, &document.definitions);
    }

    composer.check_root_conflicts()?;

    tracing::debug!("Type to service map: {:?}", composer.type_to_service_map);
    Ok(FederatedSchema {
        subgraphs: entries,
        type_to_service_map: composer.type_to_service_map,
    })
}

/// Subgraph root type names mapped to the canonical `Query`, `Mutation` and
/// `Subscription`.
fn root_type_names(definitions: &[Definition<'_, String>]) -> HashMap<String, &'static str> {
    let mut roots: HashMap<String, &'static str> = [
        ("Query".to_string(), "Query"),
        ("Mutation".to_string(), "Mutation"),
        ("Subscription".to_string(), "Subscription"),
    ]
    .into_iter()
    .collect();

    for definition in definitions {
        if let Definition::SchemaDefinition(schema) = definition {
            for (declared, canonical) in [
                (&schema.query, "Query"),
                (&schema.mutation, "Mutation"),
                (&schema.subscription, "Subscription"),
            ] {
                if let Some(declared) = declared {
                    roots.retain(|_, root| *root != canonical);
                    roots.insert(declared.clone(), canonical);
                }
            }
        }
    }
    roots
}

/// Remove `extend schema ...` definitions, which carry federation `@link`
/// imports that graphql-parser does not accept. The SDL is parsed with
/// apollo-parser first, so syntax errors are reported from there.
fn strip_schema_extensions(sdl: &str) -> Result<String, String> {
    let tree = apollo_parser::Parser::new(sdl).parse();

    let errors = tree
        .errors()
        .map(|err| format!("{} at offset {}", err.message(), err.index()))
        .collect::<Vec<_>>();
    if !errors.is_empty() {
        return Err(errors.join(", "));
    }

    let mut out = String::with_capacity(sdl.len());
    let mut copy_from = 0;
    for definition in tree.document().definitions() {
        if let cst::Definition::SchemaExtension(extension) = definition {
            let range = extension.syntax().text_range();
            out.push_str(&sdl[copy_from..usize::from(range.start())]);
            copy_from = usize::from(range.end());
        }
    }
    out.push_str(&sdl[copy_from..]);
    Ok(out)
}
