//! Early-termination judge: after a non-final step, asks the LLM whether
//! the accumulated response already satisfies the user's request.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::LlmGateway;

const JUDGE_TEMPERATURE: f32 = 0.0;
const JUDGE_MAX_TOKENS: u32 = 8;
const RESPONSE_SNIPPET_LEN: usize = 2000;

const SYSTEM_PROMPT: &str = "You judge whether an API response already fulfils a user \
request. Reply with a single token: YES or NO.";

pub struct TerminationJudge {
    gateway: Arc<dyn LlmGateway>,
}

impl TerminationJudge {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }

    /// Returns a human-readable reason when the step's response already
    /// satisfies the request. Gateway failures are non-fatal: execution
    /// continues as if the judge had said NO.
    pub async fn satisfied(
        &self,
        query: &str,
        endpoint_label: &str,
        step_index: usize,
        total_steps: usize,
        response: &Value,
    ) -> Option<String> {
        let snippet = render_snippet(response);
        let prompt = format!(
            "User request: {query}\n\
Step {} of {total_steps} called {endpoint_label} and returned:\n{snippet}\n\
Does this response already fully satisfy the user request? Answer YES or NO.",
            step_index + 1,
        );

        match self
            .gateway
            .chat(SYSTEM_PROMPT, &prompt, JUDGE_TEMPERATURE, JUDGE_MAX_TOKENS)
            .await
        {
            Ok(reply) => {
                let verdict = reply.trim().to_ascii_uppercase();
                if verdict.starts_with("YES") {
                    debug!(step = step_index, "judge reported early satisfaction");
                    Some(format!(
                        "request satisfied after step {} of {total_steps} ({endpoint_label})",
                        step_index + 1,
                    ))
                } else {
                    None
                }
            }
            Err(err) => {
                warn!(error = %err, step = step_index, "termination judge unavailable, continuing");
                None
            }
        }
    }
}

fn render_snippet(response: &Value) -> String {
    let rendered = match response {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };
    if rendered.chars().count() <= RESPONSE_SNIPPET_LEN {
        rendered
    } else {
        rendered.chars().take(RESPONSE_SNIPPET_LEN).collect()
    }
}
