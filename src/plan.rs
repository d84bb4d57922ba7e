//! Execution plans: ordered HTTP call descriptions with literal or
//! cross-step parameter values, plus the validator that checks a plan
//! against a project snapshot.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::catalog::ProjectSnapshot;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan JSON was invalid: {0}")]
    InvalidJson(String),
    #[error("plan has no steps")]
    EmptyPlan,
    #[error("plan references unknown endpoint '{0}'")]
    UnknownEndpoint(String),
    #[error("required parameter '{name}' missing for {endpoint}")]
    MissingParameter { endpoint: String, name: String },
    #[error("step {step} references step {referenced}, which has not run yet")]
    ForwardReference { step: usize, referenced: usize },
    #[error("malformed step reference '{0}'")]
    MalformedReference(String),
    #[error("no suitable plan for this project")]
    NoSuitablePlan,
}

/// A cross-step reference: data at `path` inside the response of an
/// earlier step. Serialized as `$.steps[i].response.<path>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepRef {
    pub step: usize,
    /// JSONPath rooted at the referenced step's response (`$` = whole body).
    pub path: String,
}

impl StepRef {
    const PREFIX: &'static str = "$.steps[";

    /// Parse `$.steps[i].response` / `$.steps[i].response.<path>` /
    /// `$.steps[i].response[...]`.
    pub fn parse(raw: &str) -> Result<Self, PlanError> {
        let malformed = || PlanError::MalformedReference(raw.to_string());
        let after_prefix = raw.strip_prefix(Self::PREFIX).ok_or_else(malformed)?;
        let close = after_prefix.find(']').ok_or_else(malformed)?;
        let step: usize = after_prefix[..close].parse().map_err(|_| malformed())?;
        let rest = after_prefix[close + 1..]
            .strip_prefix(".response")
            .ok_or_else(malformed)?;

        let path = if rest.is_empty() {
            "$".to_string()
        } else if rest.starts_with('.') || rest.starts_with('[') {
            format!("${rest}")
        } else {
            return Err(malformed());
        };
        Ok(Self { step, path })
    }

    /// Whether a raw string value denotes a step reference at all.
    pub fn looks_like_reference(raw: &str) -> bool {
        raw.starts_with(Self::PREFIX)
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path == "$" {
            write!(f, "$.steps[{}].response", self.step)
        } else {
            write!(f, "$.steps[{}].response{}", self.step, &self.path[1..])
        }
    }
}

/// A parameter value: either a literal or a reference into a prior step's
/// response.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Literal(Value),
    Reference(StepRef),
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParamValue::Literal(value) => value.serialize(serializer),
            ParamValue::Reference(step_ref) => serializer.serialize_str(&step_ref.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if let Value::String(raw) = &value {
            if StepRef::looks_like_reference(raw) {
                let step_ref = StepRef::parse(raw).map_err(D::Error::custom)?;
                return Ok(ParamValue::Reference(step_ref));
            }
        }
        Ok(ParamValue::Literal(value))
    }
}

/// One HTTP call in a plan. `endpoint` is the canonical `METHOD PATH`
/// label; params are sorted by name so serialization is stable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub endpoint: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

impl PlanStep {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_literal(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), ParamValue::Literal(value));
        self
    }

    pub fn with_reference(mut self, name: impl Into<String>, step: usize, path: &str) -> Self {
        self.params.insert(
            name.into(),
            ParamValue::Reference(StepRef {
                step,
                path: path.to_string(),
            }),
        );
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn single(step: PlanStep) -> Self {
        Self { steps: vec![step] }
    }

    /// Decode a plan from an LLM JSON reply.
    pub fn from_json(value: &Value) -> Result<Self, PlanError> {
        serde_json::from_value(value.clone()).map_err(|err| PlanError::InvalidJson(err.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Checks a plan against a project snapshot: non-empty, all endpoints
/// known, all required parameters present, all references strictly
/// backward. Validation is read-only, so a plan that passes once passes
/// again after a JSON round trip.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlanValidator;

impl PlanValidator {
    pub fn validate(
        &self,
        plan: &ExecutionPlan,
        snapshot: &ProjectSnapshot,
    ) -> Result<(), PlanError> {
        if plan.steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        for (index, step) in plan.steps.iter().enumerate() {
            let detail = snapshot
                .endpoint_by_label(&step.endpoint)
                .ok_or_else(|| PlanError::UnknownEndpoint(step.endpoint.clone()))?;

            for required in detail.required_parameters() {
                if !step.params.contains_key(&required.name) {
                    return Err(PlanError::MissingParameter {
                        endpoint: step.endpoint.clone(),
                        name: required.name.clone(),
                    });
                }
            }

            for value in step.params.values() {
                if let ParamValue::Reference(step_ref) = value {
                    if step_ref.step >= index {
                        return Err(PlanError::ForwardReference {
                            step: index,
                            referenced: step_ref.step,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        CatalogStore, HttpMethod, NewEndpoint, NewParameter, NewProject, ParamLocation,
    };
    use serde_json::json;

    fn snapshot_with_user_orders() -> (CatalogStore, u64) {
        let store = CatalogStore::new();
        let project = store.create_project(NewProject::new("shop", "https://api.example.com"));
        let user_ep = store
            .add_endpoint(project.id, NewEndpoint::new(HttpMethod::Get, "/user/{username}"))
            .unwrap();
        store
            .add_parameter(
                user_ep.id,
                NewParameter::new("username", ParamLocation::Path).required(),
            )
            .unwrap();
        let orders_ep = store
            .add_endpoint(project.id, NewEndpoint::new(HttpMethod::Get, "/orders"))
            .unwrap();
        store
            .add_parameter(
                orders_ep.id,
                NewParameter::new("userId", ParamLocation::Query).required(),
            )
            .unwrap();
        (store, project.id)
    }

    #[test]
    fn step_reference_parses_and_displays() {
        let parsed = StepRef::parse("$.steps[0].response.id").unwrap();
        assert_eq!(parsed.step, 0);
        assert_eq!(parsed.path, "$.id");
        assert_eq!(parsed.to_string(), "$.steps[0].response.id");

        let whole = StepRef::parse("$.steps[2].response").unwrap();
        assert_eq!(whole.path, "$");
        assert_eq!(whole.to_string(), "$.steps[2].response");

        let indexed = StepRef::parse("$.steps[1].response[0].name").unwrap();
        assert_eq!(indexed.path, "$[0].name");
    }

    #[test]
    fn malformed_references_are_rejected() {
        for raw in [
            "$.steps[x].response.id",
            "$.steps[0].request.id",
            "$.steps[0].responseid",
        ] {
            assert!(StepRef::parse(raw).is_err(), "expected rejection for {raw}");
        }
    }

    #[test]
    fn plan_json_round_trip_is_identity() {
        let plan_json = json!({
            "steps": [
                {"endpoint": "GET /user/{username}", "params": {"username": "john_doe"}},
                {"endpoint": "GET /orders", "params": {"userId": "$.steps[0].response.id"}}
            ]
        });
        let plan = ExecutionPlan::from_json(&plan_json).unwrap();
        assert_eq!(
            plan.steps[1].params["userId"],
            ParamValue::Reference(StepRef {
                step: 0,
                path: "$.id".into()
            })
        );

        let encoded = serde_json::to_value(&plan).unwrap();
        assert_eq!(encoded, plan_json);
        let decoded = ExecutionPlan::from_json(&encoded).unwrap();
        assert_eq!(decoded, plan);
    }

    #[test]
    fn validator_accepts_backward_reference_plan() {
        let (store, project_id) = snapshot_with_user_orders();
        let snapshot = store.snapshot(project_id).unwrap();
        let plan = ExecutionPlan {
            steps: vec![
                PlanStep::new("GET /user/{username}").with_literal("username", json!("john_doe")),
                PlanStep::new("GET /orders").with_reference("userId", 0, "$.id"),
            ],
        };
        assert!(PlanValidator.validate(&plan, &snapshot).is_ok());
    }

    #[test]
    fn validator_rejects_unknown_endpoint_and_missing_param() {
        let (store, project_id) = snapshot_with_user_orders();
        let snapshot = store.snapshot(project_id).unwrap();

        let unknown = ExecutionPlan::single(PlanStep::new("GET /nope"));
        assert!(matches!(
            PlanValidator.validate(&unknown, &snapshot),
            Err(PlanError::UnknownEndpoint(_))
        ));

        let missing = ExecutionPlan::single(PlanStep::new("GET /orders"));
        assert!(matches!(
            PlanValidator.validate(&missing, &snapshot),
            Err(PlanError::MissingParameter { .. })
        ));
    }

    #[test]
    fn validator_rejects_forward_and_self_references() {
        let (store, project_id) = snapshot_with_user_orders();
        let snapshot = store.snapshot(project_id).unwrap();

        let forward = ExecutionPlan {
            steps: vec![
                PlanStep::new("GET /orders").with_reference("userId", 1, "$.id"),
                PlanStep::new("GET /user/{username}").with_literal("username", json!("a")),
            ],
        };
        assert!(matches!(
            PlanValidator.validate(&forward, &snapshot),
            Err(PlanError::ForwardReference { step: 0, referenced: 1 })
        ));

        let self_ref = ExecutionPlan::single(
            PlanStep::new("GET /orders").with_reference("userId", 0, "$.id"),
        );
        assert!(matches!(
            PlanValidator.validate(&self_ref, &snapshot),
            Err(PlanError::ForwardReference { .. })
        ));
    }

    #[test]
    fn empty_plan_is_rejected() {
        let (store, project_id) = snapshot_with_user_orders();
        let snapshot = store.snapshot(project_id).unwrap();
        assert!(matches!(
            PlanValidator.validate(&ExecutionPlan::default(), &snapshot),
            Err(PlanError::EmptyPlan)
        ));
    }
}
