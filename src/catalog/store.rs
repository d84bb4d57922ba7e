//! In-memory metadata repository with denormalized snapshot caching.
//!
//! Writes take the table lock, apply one transactional mutation, and drop
//! the affected project's cached snapshot. Reads resolve through
//! `Arc<ProjectSnapshot>` so planners and executors work on immutable
//! views while the healer mutates underneath.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use super::model::{
    Endpoint, FieldLink, HttpMethod, NewEndpoint, NewParameter, NewProject, Project,
    RequestParameter, ResponseField, ResponseMessage,
};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("project {0} not found")]
    ProjectNotFound(u64),
    #[error("endpoint {0} not found")]
    EndpointNotFound(u64),
    #[error("duplicate route {method} {path}")]
    DuplicateRoute { method: HttpMethod, path: String },
    #[error("parameter '{0}' already declared on endpoint")]
    DuplicateParameter(String),
    #[error("embedding dimension mismatch: project uses {expected}, got {got}")]
    EmbeddingDimension { expected: usize, got: usize },
}

/// Immutable, denormalized view of one project, endpoints sorted by
/// `(method, path)` for deterministic iteration.
#[derive(Clone, Debug)]
pub struct ProjectSnapshot {
    pub project: Project,
    pub endpoints: Vec<EndpointDetail>,
}

impl ProjectSnapshot {
    /// Lookup by route: method comparison is case-insensitive (the enum
    /// already guarantees that), path comparison is case-sensitive.
    pub fn endpoint_by_route(&self, method: HttpMethod, path: &str) -> Option<&EndpointDetail> {
        self.endpoints
            .iter()
            .find(|detail| detail.endpoint.method == method && detail.endpoint.path == path)
    }

    /// Parse a `METHOD PATH` label and resolve it.
    pub fn endpoint_by_label(&self, label: &str) -> Option<&EndpointDetail> {
        let (method, path) = label.trim().split_once(' ')?;
        let method: HttpMethod = method.parse().ok()?;
        self.endpoint_by_route(method, path.trim())
    }

    /// Embedding dimension in use, if any endpoint has one.
    pub fn embedding_dimension(&self) -> Option<usize> {
        self.endpoints
            .iter()
            .map(|d| d.endpoint.embedding.len())
            .find(|len| *len > 0)
    }
}

/// One endpoint with its parameters, response fields, outgoing field links
/// and response messages eager-loaded.
#[derive(Clone, Debug)]
pub struct EndpointDetail {
    pub endpoint: Endpoint,
    pub parameters: Vec<RequestParameter>,
    pub response_fields: Vec<ResponseField>,
    pub field_links: Vec<FieldLink>,
    pub messages: Vec<ResponseMessage>,
}

impl EndpointDetail {
    pub fn parameter(&self, name: &str) -> Option<&RequestParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &RequestParameter> {
        self.parameters.iter().filter(|p| p.required)
    }

    pub fn has_path_parameters(&self) -> bool {
        self.parameters
            .iter()
            .any(|p| matches!(p.location, super::model::ParamLocation::Path))
    }

    pub fn message_for_status(&self, status: u16) -> Option<&ResponseMessage> {
        self.messages.iter().find(|m| m.status_code == status)
    }
}

#[derive(Default)]
struct Tables {
    projects: HashMap<u64, Project>,
    endpoints: HashMap<u64, Endpoint>,
    parameters: HashMap<u64, RequestParameter>,
    response_fields: HashMap<u64, ResponseField>,
    field_links: HashMap<u64, FieldLink>,
    response_messages: HashMap<u64, ResponseMessage>,
}

/// Thread-safe catalog store. Created once at startup; shared via `Arc`.
#[derive(Default)]
pub struct CatalogStore {
    tables: RwLock<Tables>,
    snapshots: DashMap<u64, Arc<ProjectSnapshot>>,
    next_id: AtomicU64,
}

impl CatalogStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshots: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop the cached snapshot for a project. Also called internally after
    /// every write that touches the project.
    pub fn invalidate(&self, project_id: u64) {
        self.snapshots.remove(&project_id);
    }

    pub fn create_project(&self, spec: NewProject) -> Project {
        let project = Project {
            id: self.allocate_id(),
            name: spec.name,
            version: spec.version,
            base_url: spec.base_url,
            domain: spec.domain,
            description: spec.description,
            created_at: Utc::now(),
        };
        self.tables
            .write()
            .projects
            .insert(project.id, project.clone());
        project
    }

    pub fn project(&self, project_id: u64) -> Result<Project, CatalogError> {
        self.tables
            .read()
            .projects
            .get(&project_id)
            .cloned()
            .ok_or(CatalogError::ProjectNotFound(project_id))
    }

    pub fn remove_project(&self, project_id: u64) {
        let mut tables = self.tables.write();
        tables.projects.remove(&project_id);
        let endpoint_ids: Vec<u64> = tables
            .endpoints
            .values()
            .filter(|e| e.project_id == project_id)
            .map(|e| e.id)
            .collect();
        tables.endpoints.retain(|_, e| e.project_id != project_id);
        tables
            .parameters
            .retain(|_, p| !endpoint_ids.contains(&p.endpoint_id));
        tables
            .response_fields
            .retain(|_, f| !endpoint_ids.contains(&f.endpoint_id));
        tables
            .field_links
            .retain(|_, l| !endpoint_ids.contains(&l.to_endpoint_id));
        tables
            .response_messages
            .retain(|_, m| !endpoint_ids.contains(&m.endpoint_id));
        drop(tables);
        self.invalidate(project_id);
    }

    pub fn add_endpoint(
        &self,
        project_id: u64,
        spec: NewEndpoint,
    ) -> Result<Endpoint, CatalogError> {
        let mut tables = self.tables.write();
        if !tables.projects.contains_key(&project_id) {
            return Err(CatalogError::ProjectNotFound(project_id));
        }
        let duplicate = tables.endpoints.values().any(|e| {
            e.project_id == project_id && e.method == spec.method && e.path == spec.path
        });
        if duplicate {
            return Err(CatalogError::DuplicateRoute {
                method: spec.method,
                path: spec.path,
            });
        }
        if !spec.embedding.is_empty() {
            if let Some(expected) = project_embedding_dimension(&tables, project_id) {
                if spec.embedding.len() != expected {
                    return Err(CatalogError::EmbeddingDimension {
                        expected,
                        got: spec.embedding.len(),
                    });
                }
            }
        }
        let endpoint = Endpoint {
            id: self.allocate_id(),
            project_id,
            method: spec.method,
            path: spec.path,
            summary: spec.summary,
            prompt_text: spec.prompt_text,
            keywords: spec.keywords,
            intent_patterns: spec.intent_patterns,
            embedding: spec.embedding,
        };
        tables.endpoints.insert(endpoint.id, endpoint.clone());
        drop(tables);
        self.invalidate(project_id);
        Ok(endpoint)
    }

    pub fn add_parameter(
        &self,
        endpoint_id: u64,
        spec: NewParameter,
    ) -> Result<RequestParameter, CatalogError> {
        let mut tables = self.tables.write();
        let project_id = tables
            .endpoints
            .get(&endpoint_id)
            .map(|e| e.project_id)
            .ok_or(CatalogError::EndpointNotFound(endpoint_id))?;
        let duplicate = tables
            .parameters
            .values()
            .any(|p| p.endpoint_id == endpoint_id && p.name == spec.name);
        if duplicate {
            return Err(CatalogError::DuplicateParameter(spec.name));
        }
        let parameter = RequestParameter {
            id: self.allocate_id(),
            endpoint_id,
            name: spec.name,
            location: spec.location,
            param_type: spec.param_type,
            required: spec.required,
            description: spec.description,
        };
        tables.parameters.insert(parameter.id, parameter.clone());
        drop(tables);
        self.invalidate(project_id);
        Ok(parameter)
    }

    /// Insert or update a parameter keyed on `(endpoint, name)`. Existing
    /// rows keep their id; `required`, `param_type` and `location` are
    /// overwritten. Applying the same spec twice is a no-op.
    pub fn upsert_parameter(
        &self,
        endpoint_id: u64,
        spec: NewParameter,
    ) -> Result<RequestParameter, CatalogError> {
        let mut tables = self.tables.write();
        let project_id = tables
            .endpoints
            .get(&endpoint_id)
            .map(|e| e.project_id)
            .ok_or(CatalogError::EndpointNotFound(endpoint_id))?;
        let existing_id = tables
            .parameters
            .values()
            .find(|p| p.endpoint_id == endpoint_id && p.name == spec.name)
            .map(|p| p.id);
        let parameter = if let Some(id) = existing_id {
            let row = tables
                .parameters
                .get_mut(&id)
                .expect("parameter row present");
            row.required = spec.required;
            row.param_type = spec.param_type;
            row.location = spec.location;
            if !spec.description.is_empty() {
                row.description = spec.description;
            }
            row.clone()
        } else {
            let parameter = RequestParameter {
                id: self.allocate_id(),
                endpoint_id,
                name: spec.name,
                location: spec.location,
                param_type: spec.param_type,
                required: spec.required,
                description: spec.description,
            };
            tables.parameters.insert(parameter.id, parameter.clone());
            parameter
        };
        drop(tables);
        self.invalidate(project_id);
        Ok(parameter)
    }

    /// Rename a parameter. Returns `false` (a no-op) when the old name does
    /// not exist or the new name would conflict.
    pub fn rename_parameter(
        &self,
        endpoint_id: u64,
        old_name: &str,
        new_name: &str,
    ) -> Result<bool, CatalogError> {
        let mut tables = self.tables.write();
        let project_id = tables
            .endpoints
            .get(&endpoint_id)
            .map(|e| e.project_id)
            .ok_or(CatalogError::EndpointNotFound(endpoint_id))?;
        let conflict = tables
            .parameters
            .values()
            .any(|p| p.endpoint_id == endpoint_id && p.name == new_name);
        if conflict {
            return Ok(false);
        }
        let target = tables
            .parameters
            .values_mut()
            .find(|p| p.endpoint_id == endpoint_id && p.name == old_name);
        let renamed = match target {
            Some(row) => {
                row.name = new_name.to_string();
                true
            }
            None => false,
        };
        drop(tables);
        if renamed {
            self.invalidate(project_id);
        }
        Ok(renamed)
    }

    pub fn add_response_field(
        &self,
        endpoint_id: u64,
        json_path: impl Into<String>,
        field_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<ResponseField, CatalogError> {
        let mut tables = self.tables.write();
        let project_id = tables
            .endpoints
            .get(&endpoint_id)
            .map(|e| e.project_id)
            .ok_or(CatalogError::EndpointNotFound(endpoint_id))?;
        let field = ResponseField {
            id: self.allocate_id(),
            endpoint_id,
            json_path: json_path.into(),
            field_type: field_type.into(),
            description: description.into(),
        };
        tables.response_fields.insert(field.id, field.clone());
        drop(tables);
        self.invalidate(project_id);
        Ok(field)
    }

    pub fn add_field_link(
        &self,
        from_field_id: u64,
        to_endpoint_id: u64,
        to_param_name: impl Into<String>,
        relation_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<FieldLink, CatalogError> {
        let mut tables = self.tables.write();
        if !tables.response_fields.contains_key(&from_field_id) {
            return Err(CatalogError::EndpointNotFound(from_field_id));
        }
        let project_id = tables
            .endpoints
            .get(&to_endpoint_id)
            .map(|e| e.project_id)
            .ok_or(CatalogError::EndpointNotFound(to_endpoint_id))?;
        let link = FieldLink {
            id: self.allocate_id(),
            from_field_id,
            to_endpoint_id,
            to_param_name: to_param_name.into(),
            relation_type: relation_type.into(),
            description: description.into(),
        };
        tables.field_links.insert(link.id, link.clone());
        drop(tables);
        self.invalidate(project_id);
        Ok(link)
    }

    /// Insert a response message unless `(endpoint, status)` already has
    /// one. Returns whether a row was inserted.
    pub fn upsert_response_message(
        &self,
        endpoint_id: u64,
        status_code: u16,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Result<bool, CatalogError> {
        let mut tables = self.tables.write();
        let project_id = tables
            .endpoints
            .get(&endpoint_id)
            .map(|e| e.project_id)
            .ok_or(CatalogError::EndpointNotFound(endpoint_id))?;
        let occupied = tables
            .response_messages
            .values()
            .any(|m| m.endpoint_id == endpoint_id && m.status_code == status_code);
        if occupied {
            return Ok(false);
        }
        let row = ResponseMessage {
            id: self.allocate_id(),
            endpoint_id,
            status_code,
            message: message.into(),
            suggestion: suggestion.into(),
        };
        tables.response_messages.insert(row.id, row);
        drop(tables);
        self.invalidate(project_id);
        Ok(true)
    }

    /// Replace an endpoint's embedding vector, enforcing the project-wide
    /// dimension.
    pub fn set_embedding(
        &self,
        endpoint_id: u64,
        embedding: Vec<f32>,
    ) -> Result<(), CatalogError> {
        let mut tables = self.tables.write();
        let project_id = tables
            .endpoints
            .get(&endpoint_id)
            .map(|e| e.project_id)
            .ok_or(CatalogError::EndpointNotFound(endpoint_id))?;
        if !embedding.is_empty() {
            if let Some(expected) = project_embedding_dimension_excluding(
                &tables,
                project_id,
                endpoint_id,
            ) {
                if embedding.len() != expected {
                    return Err(CatalogError::EmbeddingDimension {
                        expected,
                        got: embedding.len(),
                    });
                }
            }
        }
        if let Some(row) = tables.endpoints.get_mut(&endpoint_id) {
            row.embedding = embedding;
        }
        drop(tables);
        self.invalidate(project_id);
        Ok(())
    }

    /// Denormalized, cached view of a project.
    pub fn snapshot(&self, project_id: u64) -> Result<Arc<ProjectSnapshot>, CatalogError> {
        if let Some(cached) = self.snapshots.get(&project_id) {
            return Ok(Arc::clone(cached.value()));
        }
        let built = Arc::new(self.build_snapshot(project_id)?);
        debug!(project_id, endpoints = built.endpoints.len(), "catalog snapshot built");
        self.snapshots.insert(project_id, Arc::clone(&built));
        Ok(built)
    }

    fn build_snapshot(&self, project_id: u64) -> Result<ProjectSnapshot, CatalogError> {
        let tables = self.tables.read();
        let project = tables
            .projects
            .get(&project_id)
            .cloned()
            .ok_or(CatalogError::ProjectNotFound(project_id))?;

        let mut endpoints: Vec<EndpointDetail> = tables
            .endpoints
            .values()
            .filter(|e| e.project_id == project_id)
            .map(|endpoint| {
                let mut parameters: Vec<RequestParameter> = tables
                    .parameters
                    .values()
                    .filter(|p| p.endpoint_id == endpoint.id)
                    .cloned()
                    .collect();
                parameters.sort_by(|a, b| a.name.cmp(&b.name));

                let mut response_fields: Vec<ResponseField> = tables
                    .response_fields
                    .values()
                    .filter(|f| f.endpoint_id == endpoint.id)
                    .cloned()
                    .collect();
                response_fields.sort_by_key(|f| f.id);

                let field_ids: Vec<u64> = response_fields.iter().map(|f| f.id).collect();
                let mut field_links: Vec<FieldLink> = tables
                    .field_links
                    .values()
                    .filter(|l| field_ids.contains(&l.from_field_id))
                    .cloned()
                    .collect();
                field_links.sort_by_key(|l| l.id);

                let mut messages: Vec<ResponseMessage> = tables
                    .response_messages
                    .values()
                    .filter(|m| m.endpoint_id == endpoint.id)
                    .cloned()
                    .collect();
                messages.sort_by_key(|m| m.id);

                EndpointDetail {
                    endpoint: endpoint.clone(),
                    parameters,
                    response_fields,
                    field_links,
                    messages,
                }
            })
            .collect();

        endpoints.sort_by(|a, b| {
            (a.endpoint.method, a.endpoint.path.as_str())
                .cmp(&(b.endpoint.method, b.endpoint.path.as_str()))
        });

        Ok(ProjectSnapshot { project, endpoints })
    }

    /// User-facing message for a status: the specific endpoint's row wins,
    /// else any project-wide row for the status (lowest id first).
    pub fn message_for(
        &self,
        project_id: u64,
        endpoint_id: u64,
        status_code: u16,
    ) -> Option<ResponseMessage> {
        let tables = self.tables.read();
        let endpoint_ids: Vec<u64> = tables
            .endpoints
            .values()
            .filter(|e| e.project_id == project_id)
            .map(|e| e.id)
            .collect();
        let mut candidates: Vec<&ResponseMessage> = tables
            .response_messages
            .values()
            .filter(|m| m.status_code == status_code && endpoint_ids.contains(&m.endpoint_id))
            .collect();
        candidates.sort_by_key(|m| m.id);
        candidates
            .iter()
            .find(|m| m.endpoint_id == endpoint_id)
            .or_else(|| candidates.first())
            .map(|m| (*m).clone())
    }
}

fn project_embedding_dimension(tables: &Tables, project_id: u64) -> Option<usize> {
    tables
        .endpoints
        .values()
        .filter(|e| e.project_id == project_id && !e.embedding.is_empty())
        .map(|e| e.embedding.len())
        .next()
}

fn project_embedding_dimension_excluding(
    tables: &Tables,
    project_id: u64,
    endpoint_id: u64,
) -> Option<usize> {
    tables
        .endpoints
        .values()
        .filter(|e| {
            e.project_id == project_id && e.id != endpoint_id && !e.embedding.is_empty()
        })
        .map(|e| e.embedding.len())
        .next()
}
