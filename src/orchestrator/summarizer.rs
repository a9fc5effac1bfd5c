//! Result Summarizer
//!
//! Condenses the step results into the final answer via the verification
//! worker. If that fails, a basic summary built from the first and last step
//! results is returned instead; summarization never fails outward.

use super::context::ExecutionContext;
use super::registry::{CapabilityRegistry, WorkerRequest};
use super::role::WorkerRole;

pub const NO_RESULTS_MESSAGE: &str = "No results were produced for this request.";

fn summary_prompt(request: Option<&str>) -> String {
    let mut prompt = String::from(
        "Summarize the step results below into the final answer for the user. \
         Be terse: at most 4 lines unless the user explicitly asked for detail. \
         Mention failed steps only if they affect the answer.",
    );
    if let Some(request) = request {
        prompt.push_str("\n\nUser request:\n");
        prompt.push_str(request);
    }
    prompt
}

/// Body of a `Step N (agent): description\n\nresult` string
fn result_body(result: &str) -> &str {
    if result.starts_with("Step ") {
        if let Some((_, body)) = result.split_once("\n\n") {
            return body.trim();
        }
    }
    result.trim()
}

/// Summary built without any model call
pub fn basic_summary(results: &[String]) -> String {
    match results {
        [] => NO_RESULTS_MESSAGE.to_string(),
        [only] => format!("Completed 1 step.\n\n{}", result_body(only)),
        [first, .., last] => format!(
            "Completed {} steps.\n\nFirst result:\n{}\n\nFinal result:\n{}",
            results.len(),
            result_body(first),
            result_body(last)
        ),
    }
}

/// Ask the verification worker for the final answer
pub async fn summarize_results(
    ctx: &mut ExecutionContext,
    registry: &CapabilityRegistry,
    request: Option<&str>,
    results: &[String],
) -> String {
    if results.is_empty() {
        return NO_RESULTS_MESSAGE.to_string();
    }

    let worker = match registry.resolve(WorkerRole::Verification) {
        Ok(worker) => worker,
        Err(e) => {
            tracing::warn!("Falling back to basic summary: {}", e);
            return basic_summary(results);
        }
    };

    let request = WorkerRequest::new(summary_prompt(request))
        .with_additional_context(results.join("\n\n---\n\n"));

    match worker.execute(request).await {
        Ok(output) => {
            if let Some(usage) = output.usage {
                ctx.record_token_usage(WorkerRole::Verification.as_str(), &usage.usage, &usage.model);
            }
            let answer = output.value.to_string();
            if answer.trim().is_empty() {
                basic_summary(results)
            } else {
                answer
            }
        }
        Err(e) => {
            tracing::warn!("Summarization failed, using basic summary: {:#}", e);
            basic_summary(results)
        }
    }
}
