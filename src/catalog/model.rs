//! Normalized catalog entities.
//!
//! Entities reference each other through integer ids only; the store hands
//! out denormalized read snapshots so nothing here ever embeds a sibling.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// HTTP methods an endpoint may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Methods that carry a JSON body.
    pub fn has_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(format!("unknown HTTP method '{other}'")),
        }
    }
}

/// Where a request parameter is injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Body,
}

impl FromStr for ParamLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "path" => Ok(ParamLocation::Path),
            "query" => Ok(ParamLocation::Query),
            "header" => Ok(ParamLocation::Header),
            "body" => Ok(ParamLocation::Body),
            other => Err(format!("unknown parameter location '{other}'")),
        }
    }
}

impl fmt::Display for ParamLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ParamLocation::Path => "path",
            ParamLocation::Query => "query",
            ParamLocation::Header => "header",
            ParamLocation::Body => "body",
        };
        f.write_str(label)
    }
}

/// A registered API project. Owns endpoints; destroyed when its spec is
/// replaced by the (external) ingestion pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub name: String,
    pub version: String,
    pub base_url: String,
    pub domain: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Spec for creating a project.
#[derive(Clone, Debug, Default)]
pub struct NewProject {
    pub name: String,
    pub version: String,
    pub base_url: String,
    pub domain: String,
    pub description: String,
}

impl NewProject {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// One `(method, path)` of a project's API. The route key is immutable and
/// unique within the project; the retrieval fields (`prompt_text`,
/// `keywords`, `intent_patterns`, `embedding`) are produced by ingestion and
/// may be updated idempotently by the healer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: u64,
    pub project_id: u64,
    pub method: HttpMethod,
    pub path: String,
    pub summary: String,
    pub prompt_text: String,
    pub keywords: BTreeSet<String>,
    pub intent_patterns: Vec<String>,
    /// Empty when no embedding has been ingested yet.
    pub embedding: Vec<f32>,
}

impl Endpoint {
    /// Canonical `METHOD PATH` label used in plans and prompts.
    pub fn route_label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Spec for registering an endpoint.
#[derive(Clone, Debug)]
pub struct NewEndpoint {
    pub method: HttpMethod,
    pub path: String,
    pub summary: String,
    pub prompt_text: String,
    pub keywords: BTreeSet<String>,
    pub intent_patterns: Vec<String>,
    pub embedding: Vec<f32>,
}

impl NewEndpoint {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            summary: String::new(),
            prompt_text: String::new(),
            keywords: BTreeSet::new(),
            intent_patterns: Vec::new(),
            embedding: Vec::new(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_prompt_text(mut self, prompt_text: impl Into<String>) -> Self {
        self.prompt_text = prompt_text.into();
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_intent_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.intent_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }
}

/// A declared request parameter, unique on `(endpoint, name)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestParameter {
    pub id: u64,
    pub endpoint_id: u64,
    pub name: String,
    pub location: ParamLocation,
    pub param_type: String,
    pub required: bool,
    pub description: String,
}

/// Spec for declaring (or upserting) a parameter.
#[derive(Clone, Debug)]
pub struct NewParameter {
    pub name: String,
    pub location: ParamLocation,
    pub param_type: String,
    pub required: bool,
    pub description: String,
}

impl NewParameter {
    pub fn new(name: impl Into<String>, location: ParamLocation) -> Self {
        Self {
            name: name.into(),
            location,
            param_type: "string".to_string(),
            required: false,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_type(mut self, param_type: impl Into<String>) -> Self {
        self.param_type = param_type.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A field of an endpoint's JSON response, addressed by JSONPath.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseField {
    pub id: u64,
    pub endpoint_id: u64,
    pub json_path: String,
    pub field_type: String,
    pub description: String,
}

/// Declared data-flow hint: the value at `from_field.json_path` of one
/// endpoint may feed `to_param_name` of another.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldLink {
    pub id: u64,
    pub from_field_id: u64,
    pub to_endpoint_id: u64,
    pub to_param_name: String,
    pub relation_type: String,
    pub description: String,
}

/// User-visible text for an HTTP status returned by an endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: u64,
    pub endpoint_id: u64,
    pub status_code: u16,
    pub message: String,
    pub suggestion: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parse_is_case_insensitive() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!(" Post ".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert!("FETCH".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn route_label_is_method_space_path() {
        let ep = Endpoint {
            id: 1,
            project_id: 1,
            method: HttpMethod::Get,
            path: "/pet/{petId}".into(),
            summary: String::new(),
            prompt_text: String::new(),
            keywords: BTreeSet::new(),
            intent_patterns: Vec::new(),
            embedding: Vec::new(),
        };
        assert_eq!(ep.route_label(), "GET /pet/{petId}");
    }

    #[test]
    fn only_write_methods_carry_bodies() {
        assert!(HttpMethod::Post.has_body());
        assert!(HttpMethod::Patch.has_body());
        assert!(!HttpMethod::Get.has_body());
        assert!(!HttpMethod::Delete.has_body());
    }
}
