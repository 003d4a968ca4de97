use std::time::Duration;

use gateway_protocol::{AgentRecord, GatewayError};
use serde_json::Value;

use crate::metrics::Metrics;

const AI_DEADLINE: Duration = Duration::from_secs(60);

/// Outcome of a successful `execute_run` call.
pub struct RunOutcome {
    pub reply: Option<String>,
    pub raw: Value,
}

/// Calls the AI backend on behalf of `agent_record` and extracts its reply
/// (spec.md §4.3). The only operation this module exposes.
pub async fn execute_run(
    client: &reqwest::Client,
    metrics: &Metrics,
    agent_record: &AgentRecord,
    ai_backend_url: &str,
    payload: &Value,
    trace_id: &str,
) -> Result<RunOutcome, GatewayError> {
    let url = resolve_endpoint(agent_record, ai_backend_url);

    let started = tokio::time::Instant::now();
    let result = tokio::time::timeout(
        AI_DEADLINE,
        client
            .post(&url)
            .bearer_auth(&agent_record.api_key)
            .header("Content-Type", "application/json")
            .header("X-Trace-Id", trace_id)
            .json(payload)
            .send(),
    )
    .await;

    let response = match result {
        Err(_) => {
            metrics
                .errors_total
                .with_label_values(&[&agent_record.agent_id, "AI_TIMEOUT"])
                .inc();
            return Err(GatewayError::ai_timeout(format!(
                "AI backend did not respond within {:?}",
                AI_DEADLINE
            )));
        }
        Ok(Err(e)) => {
            metrics
                .errors_total
                .with_label_values(&[&agent_record.agent_id, "AI_DOWNSTREAM_ERROR"])
                .inc();
            return Err(GatewayError::ai_downstream_error(format!(
                "AI backend request failed: {e}"
            )));
        }
        Ok(Ok(response)) => response,
    };

    if !response.status().is_success() {
        let status = response.status();
        metrics
            .errors_total
            .with_label_values(&[&agent_record.agent_id, "AI_DOWNSTREAM_ERROR"])
            .inc();
        return Err(GatewayError::ai_downstream_error(format!(
            "AI backend returned {status}"
        )));
    }

    let raw: Value = response.json().await.map_err(|e| {
        metrics
            .errors_total
            .with_label_values(&[&agent_record.agent_id, "AI_DOWNSTREAM_ERROR"])
            .inc();
        GatewayError::ai_downstream_error(format!("AI backend returned non-JSON body: {e}"))
    })?;

    metrics
        .ai_latency_seconds
        .with_label_values(&[&agent_record.agent_id])
        .observe(started.elapsed().as_secs_f64());

    Ok(RunOutcome {
        reply: extract_reply(&raw),
        raw,
    })
}

fn resolve_endpoint(agent_record: &AgentRecord, ai_backend_url: &str) -> String {
    if let Some(ref override_url) = agent_record.endpoint_url_run {
        return override_url.clone();
    }

    default_endpoint(ai_backend_url, &agent_record.agent_id)
}

/// Derives `{AI_BACKEND_URL}/agents/{agent_id}/execute`, appending `/agents`
/// only if the backend URL doesn't already end with it (spec.md §4.3). Also
/// used by the supervisor to persist a default `endpoint_url_run` at
/// creation time when the caller didn't supply an override.
pub fn default_endpoint(ai_backend_url: &str, agent_id: &str) -> String {
    let base = ai_backend_url.trim_end_matches('/');
    let base = if base.ends_with("/agents") {
        base.to_string()
    } else {
        format!("{base}/agents")
    };

    format!("{base}/{agent_id}/execute")
}

/// Reply extraction probes, in order: `data.reply`, `data.response`,
/// `data.result.reply`, `data.result.response`, `data.output`. The first
/// non-empty trimmed string wins.
fn extract_reply(data: &Value) -> Option<String> {
    let probes: [&[&str]; 5] = [
        &["reply"],
        &["response"],
        &["result", "reply"],
        &["result", "response"],
        &["output"],
    ];

    for path in probes {
        let mut cursor = data;
        let mut found = true;
        for key in path {
            match cursor.get(key) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found
            && let Some(s) = cursor.as_str()
        {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record(endpoint: Option<&str>) -> AgentRecord {
        AgentRecord {
            user_id: 1,
            agent_id: "a1".to_string(),
            agent_name: "A".to_string(),
            api_key: "k1".to_string(),
            endpoint_url_run: endpoint.map(|s| s.to_string()),
            status: gateway_protocol::SessionStatus::Connected,
            last_connected_at: None,
            last_disconnected_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn resolves_endpoint_override_when_present() {
        let record = sample_record(Some("https://custom.example/run"));
        assert_eq!(
            resolve_endpoint(&record, "https://ai.example.com"),
            "https://custom.example/run"
        );
    }

    #[test]
    fn derives_default_endpoint_from_backend_url() {
        let record = sample_record(None);
        assert_eq!(
            resolve_endpoint(&record, "https://ai.example.com/"),
            "https://ai.example.com/agents/a1/execute"
        );
    }

    #[test]
    fn backend_url_already_ending_in_agents_is_not_duplicated() {
        let record = sample_record(None);
        assert_eq!(
            resolve_endpoint(&record, "https://ai.example.com/agents"),
            "https://ai.example.com/agents/a1/execute"
        );
    }

    #[test]
    fn extract_reply_prefers_top_level_reply() {
        let data = json!({"reply": "hi", "response": "bye"});
        assert_eq!(extract_reply(&data), Some("hi".to_string()));
    }

    #[test]
    fn extract_reply_falls_back_through_probes() {
        let data = json!({"result": {"response": "  nested  "}});
        assert_eq!(extract_reply(&data), Some("nested".to_string()));
    }

    #[test]
    fn extract_reply_none_when_nothing_matches() {
        let data = json!({"unrelated": "value"});
        assert_eq!(extract_reply(&data), None);
    }

    #[test]
    fn extract_reply_skips_blank_strings() {
        let data = json!({"reply": "   ", "output": "fallback"});
        assert_eq!(extract_reply(&data), Some("fallback".to_string()));
    }
}
