use std::sync::Arc;

use chrono::Utc;
use gateway_protocol::AgentRecord;
use serde_json::json;
use uuid::Uuid;

use crate::ai_proxy;
use crate::chat_client::{ChatClient, InboundMessage};
use crate::metrics::Metrics;
use crate::scheduler::Scheduler;
use crate::session::Supervisor;

/// Fixed JID that receives a fallback notification whenever an inbound
/// AI call fails (spec.md glossary: "developer fallback").
const DEVELOPER_JID: &str = "developer@c.us";

/// Routes one inbound client `message` event through filtering, group
/// gating, the AI proxy, and reply delivery (spec.md §4.5).
pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<Metrics>,
    ai_http: reqwest::Client,
    ai_backend_url: String,
    bot_digits: String,
}

impl Dispatcher {
    pub fn new(
        supervisor: Arc<Supervisor>,
        scheduler: Arc<Scheduler>,
        metrics: Arc<Metrics>,
        ai_http: reqwest::Client,
        ai_backend_url: String,
        bot_digits: String,
    ) -> Self {
        Self {
            supervisor,
            scheduler,
            metrics,
            ai_http,
            ai_backend_url,
            bot_digits,
        }
    }

    pub async fn handle_message(&self, agent_id: &str, client: Arc<dyn ChatClient>, message: InboundMessage) {
        if !self.should_process(&message) {
            return;
        }

        let record = match self.supervisor.refresh_record_if_stale(agent_id).await {
            Some(record) => record,
            None => {
                tracing::warn!(agent_id, "dropping inbound message: no live session");
                return;
            }
        };

        let payload = build_ai_payload(&message);

        self.metrics
            .messages_received_total
            .with_label_values(&[agent_id])
            .inc();

        let agent_id = agent_id.to_string();
        let scheduler = Arc::clone(&self.scheduler);
        let metrics = Arc::clone(&self.metrics);
        let ai_http = self.ai_http.clone();
        let ai_backend_url = self.ai_backend_url.clone();
        let from = message.from.clone();
        let body = message.body.clone();

        let _ = scheduler
            .enqueue(&agent_id, async move {
                run_inbound_job(
                    &ai_http,
                    &metrics,
                    &record,
                    &ai_backend_url,
                    client,
                    &from,
                    &body,
                    payload,
                )
                .await
            })
            .await;
    }

    /// Filter: drop `from_me`, statuses/channels, and anything that isn't a
    /// plain chat; then apply group gating on `@g.us` chats.
    fn should_process(&self, message: &InboundMessage) -> bool {
        should_process_message(message, &self.bot_digits)
    }
}

/// Drop `from_me`, statuses/channels, and anything that isn't a plain chat.
/// For `@g.us` chats, additionally require either an explicit mention or the
/// bot's digits appearing somewhere in the message body (spec.md §4.5,
/// acknowledged as a fuzzy match per spec.md §9's open questions).
fn should_process_message(message: &InboundMessage, bot_digits: &str) -> bool {
    if message.from_me || message.message_type != "chat" {
        return false;
    }

    if message.from.ends_with("@g.us") {
        let mentioned = message.mentioned_ids.iter().any(|id| id.contains(bot_digits));
        let body_digits: String = message.body.chars().filter(|c| c.is_ascii_digit()).collect();
        let body_mentions = body_digits.contains(bot_digits);
        return mentioned || body_mentions;
    }

    true
}

fn build_ai_payload(message: &InboundMessage) -> serde_json::Value {
    json!({
        "input": message.body,
        "parameters": {
            "max_steps": 5,
            "metadata": {
                "whatsapp_name": message.whatsapp_name,
                "chat_name": message.chat_name,
            }
        },
        "session_id": message.from,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_inbound_job(
    ai_http: &reqwest::Client,
    metrics: &Metrics,
    record: &AgentRecord,
    ai_backend_url: &str,
    client: Arc<dyn ChatClient>,
    from: &str,
    body: &str,
    payload: serde_json::Value,
) -> Result<(), gateway_protocol::GatewayError> {
    let trace_id = Uuid::new_v4().to_string();

    let _ = client.set_typing(from, true).await;
    let outcome = ai_proxy::execute_run(ai_http, metrics, record, ai_backend_url, &payload, &trace_id).await;
    let _ = client.set_typing(from, false).await;

    match outcome {
        Ok(run) => {
            if let Some(reply) = run.reply {
                if let Err(e) = client.send_message(from, &reply, None).await {
                    tracing::error!(agent_id = %record.agent_id, "failed to deliver AI reply: {e}");
                } else {
                    metrics
                        .messages_sent_total
                        .with_label_values(&[&record.agent_id])
                        .inc();
                }
            }
            Ok(())
        }
        Err(err) => {
            tracing::error!(
                agent_id = %record.agent_id,
                from,
                trace_id,
                "AI call failed: {}",
                err.message
            );

            let notification = json!({
                "agent_id": record.agent_id,
                "from": from,
                "reason": err.message,
                "trace_id": trace_id,
                "body": body,
                "timestamp": Utc::now().to_rfc3339(),
            })
            .to_string();

            if let Err(e) = client.send_message(DEVELOPER_JID, &notification, None).await {
                tracing::warn!(agent_id = %record.agent_id, "developer notification failed: {e}");
            }

            // Never surfaced to the user; the dispatcher stops here.
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_client::InboundMessage;

    fn message(from: &str, body: &str, from_me: bool, mentioned_ids: Vec<String>) -> InboundMessage {
        InboundMessage {
            from: from.to_string(),
            body: body.to_string(),
            message_type: "chat".to_string(),
            from_me,
            mentioned_ids,
            whatsapp_name: None,
            chat_name: None,
        }
    }

    const BOT_DIGITS: &str = "628111";

    #[test]
    fn drops_from_me_messages() {
        let msg = message("628999@c.us", "hi", true, vec![]);
        assert!(!should_process_message(&msg, BOT_DIGITS));
    }

    #[test]
    fn drops_non_chat_types() {
        let mut msg = message("628999@c.us", "hi", false, vec![]);
        msg.message_type = "status".to_string();
        assert!(!should_process_message(&msg, BOT_DIGITS));
    }

    #[test]
    fn accepts_plain_direct_chat() {
        let msg = message("628999@c.us", "hi", false, vec![]);
        assert!(should_process_message(&msg, BOT_DIGITS));
    }

    #[test]
    fn drops_group_message_without_mention() {
        let msg = message("g@g.us", "hi", false, vec![]);
        assert!(!should_process_message(&msg, BOT_DIGITS));
    }

    #[test]
    fn accepts_group_message_with_mentioned_id() {
        let msg = message("g@g.us", "hi", false, vec!["628111@c.us".to_string()]);
        assert!(should_process_message(&msg, BOT_DIGITS));
    }

    #[test]
    fn accepts_group_message_with_digits_in_body() {
        let msg = message("g@g.us", "hi @628111", false, vec![]);
        assert!(should_process_message(&msg, BOT_DIGITS));
    }
}
