//! Error analyzer and schema healer: after a failed pipeline pass, one
//! LLM role decides whether to retry with a corrected query, and another
//! proposes metadata deltas (missing parameters, renames, error messages)
//! that are applied idempotently to the catalog.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, HttpMethod, NewParameter, ParamLocation};
use crate::llm::LlmGateway;
use crate::plan::ExecutionPlan;
use crate::types::StepResult;

const HEAL_TEMPERATURE: f32 = 0.1;

const RETRY_SYSTEM_PROMPT: &str = "You analyze failed API orchestrations. Decide whether \
retrying with a corrected query could succeed. Reply with JSON only: \
{\"shouldRetry\": bool, \"correctedQuery\": string or null, \"analysis\": string}.";

const DELTA_SYSTEM_PROMPT: &str = "You extract API schema corrections from failures. Reply \
with JSON only: {\"missingParameters\": [{\"endpointPath\", \"method\", \"parameterName\", \
\"parameterType\", \"isRequired\", \"location\"}], \"parameterCorrections\": \
[{\"endpointPath\", \"method\", \"oldParameterName\", \"newParameterName\"}], \
\"errorMessages\": [{\"endpointPath\", \"method\", \"statusCode\", \"message\", \
\"suggestion\"}]}. Emit empty arrays when nothing applies.";

/// Outcome of the retry-analyst role.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryAdvice {
    pub should_retry: bool,
    pub corrected_query: Option<String>,
    pub analysis: String,
}

/// Structural deltas proposed by the metadata-extractor role.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataDeltas {
    pub missing_parameters: Vec<MissingParameter>,
    pub parameter_corrections: Vec<ParameterCorrection>,
    pub error_messages: Vec<ErrorMessageDelta>,
}

impl MetadataDeltas {
    pub fn is_empty(&self) -> bool {
        self.missing_parameters.is_empty()
            && self.parameter_corrections.is_empty()
            && self.error_messages.is_empty()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingParameter {
    pub endpoint_path: String,
    pub method: String,
    pub parameter_name: String,
    #[serde(default)]
    pub parameter_type: Option<String>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterCorrection {
    pub endpoint_path: String,
    pub method: String,
    pub old_parameter_name: String,
    pub new_parameter_name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessageDelta {
    pub endpoint_path: String,
    pub method: String,
    pub status_code: u16,
    pub message: String,
    #[serde(default)]
    pub suggestion: String,
}

pub struct Healer {
    gateway: Arc<dyn LlmGateway>,
    catalog: Arc<CatalogStore>,
}

impl Healer {
    pub fn new(gateway: Arc<dyn LlmGateway>, catalog: Arc<CatalogStore>) -> Self {
        Self { gateway, catalog }
    }

    /// Full healing pass: apply whatever metadata deltas the extractor
    /// proposes, then return the corrected query when the analyst advises
    /// a retry. Gateway failures degrade to "no deltas, no retry".
    pub async fn heal(
        &self,
        project_id: u64,
        query: &str,
        error: &str,
        plan: Option<&ExecutionPlan>,
        results: &[StepResult],
    ) -> Option<String> {
        let failure_context = render_failure_context(query, error, plan, results);

        match self.extract_deltas(&failure_context).await {
            Ok(deltas) if !deltas.is_empty() => {
                self.apply_deltas(project_id, &deltas);
                self.catalog.invalidate(project_id);
            }
            Ok(_) => debug!("healer proposed no metadata deltas"),
            Err(err) => warn!(error = %err, "metadata extraction failed, skipping deltas"),
        }

        let advice = match self.analyze_retry(&failure_context).await {
            Ok(advice) => advice,
            Err(err) => {
                warn!(error = %err, "retry analysis failed, declining retry");
                return None;
            }
        };
        if !advice.analysis.is_empty() {
            debug!(analysis = %advice.analysis, "retry analyst verdict");
        }
        match (advice.should_retry, advice.corrected_query) {
            (true, Some(corrected)) if !corrected.trim().is_empty() => {
                info!("healer proposed corrected query");
                Some(corrected)
            }
            _ => None,
        }
    }

    pub async fn analyze_retry(
        &self,
        failure_context: &str,
    ) -> Result<RetryAdvice, crate::llm::LlmError> {
        let reply = self
            .gateway
            .json(RETRY_SYSTEM_PROMPT, failure_context, HEAL_TEMPERATURE)
            .await?;
        Ok(decode_lenient(&reply))
    }

    pub async fn extract_deltas(
        &self,
        failure_context: &str,
    ) -> Result<MetadataDeltas, crate::llm::LlmError> {
        let prompt = format!(
            "{failure_context}\n\nPropose schema corrections for the metadata store."
        );
        let reply = self
            .gateway
            .json(DELTA_SYSTEM_PROMPT, &prompt, HEAL_TEMPERATURE)
            .await?;
        Ok(decode_lenient(&reply))
    }

    /// Apply deltas with upsert semantics. Individual failures are logged
    /// and skipped; partial progress is acceptable.
    pub fn apply_deltas(&self, project_id: u64, deltas: &MetadataDeltas) {
        for missing in &deltas.missing_parameters {
            let Some(endpoint_id) =
                self.endpoint_id(project_id, &missing.method, &missing.endpoint_path)
            else {
                warn!(path = %missing.endpoint_path, method = %missing.method,
                    "missing-parameter delta names unknown endpoint, skipping");
                continue;
            };
            let location = missing
                .location
                .as_deref()
                .and_then(|l| ParamLocation::from_str(l).ok())
                .unwrap_or(ParamLocation::Query);
            let mut spec = NewParameter::new(&missing.parameter_name, location)
                .with_type(missing.parameter_type.clone().unwrap_or_else(|| "string".into()));
            if missing.is_required {
                spec = spec.required();
            }
            match self.catalog.upsert_parameter(endpoint_id, spec) {
                Ok(parameter) => info!(
                    endpoint = %missing.endpoint_path,
                    parameter = %parameter.name,
                    required = parameter.required,
                    "healed missing parameter"
                ),
                Err(err) => warn!(error = %err, "parameter upsert failed, skipping"),
            }
        }

        for correction in &deltas.parameter_corrections {
            let Some(endpoint_id) =
                self.endpoint_id(project_id, &correction.method, &correction.endpoint_path)
            else {
                warn!(path = %correction.endpoint_path, "rename delta names unknown endpoint, skipping");
                continue;
            };
            match self.catalog.rename_parameter(
                endpoint_id,
                &correction.old_parameter_name,
                &correction.new_parameter_name,
            ) {
                Ok(true) => info!(
                    from = %correction.old_parameter_name,
                    to = %correction.new_parameter_name,
                    "healed parameter name"
                ),
                Ok(false) => debug!(
                    from = %correction.old_parameter_name,
                    to = %correction.new_parameter_name,
                    "rename skipped (missing source or conflicting target)"
                ),
                Err(err) => warn!(error = %err, "parameter rename failed, skipping"),
            }
        }

        for message in &deltas.error_messages {
            let Some(endpoint_id) =
                self.endpoint_id(project_id, &message.method, &message.endpoint_path)
            else {
                warn!(path = %message.endpoint_path, "error-message delta names unknown endpoint, skipping");
                continue;
            };
            match self.catalog.upsert_response_message(
                endpoint_id,
                message.status_code,
                &message.message,
                &message.suggestion,
            ) {
                Ok(true) => info!(status = message.status_code, "recorded error message"),
                Ok(false) => debug!(status = message.status_code, "error message already present"),
                Err(err) => warn!(error = %err, "error-message insert failed, skipping"),
            }
        }
    }

    fn endpoint_id(&self, project_id: u64, method: &str, path: &str) -> Option<u64> {
        let method = HttpMethod::from_str(method).ok()?;
        let snapshot = self.catalog.snapshot(project_id).ok()?;
        snapshot
            .endpoint_by_route(method, path)
            .map(|d| d.endpoint.id)
    }
}

/// Decode a JSON value into `T`, substituting defaults when the shape is
/// off. LLM-returned structures never get trusted field presence.
fn decode_lenient<T: Default + for<'de> Deserialize<'de>>(value: &Value) -> T {
    serde_json::from_value(value.clone()).unwrap_or_else(|err| {
        warn!(error = %err, "healer reply had unexpected shape, using defaults");
        T::default()
    })
}

fn render_failure_context(
    query: &str,
    error: &str,
    plan: Option<&ExecutionPlan>,
    results: &[StepResult],
) -> String {
    let mut context = format!("Original query: {query}\nFailure: {error}\n");
    if let Some(plan) = plan {
        let steps: Vec<&str> = plan.steps.iter().map(|s| s.endpoint.as_str()).collect();
        context.push_str(&format!("Plan: {}\n", steps.join(" -> ")));
    }
    for result in results {
        context.push_str(&format!(
            "Step {} {}: {}{}\n",
            result.index + 1,
            result.endpoint,
            if result.success { "ok" } else { "failed" },
            result
                .error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default(),
        ));
    }
    context
}
