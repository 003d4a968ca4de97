use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Event stream emitted by a [`ChatClient`]. The chat-network library this
/// abstracts is external to the core: a browser-driven client exposing
/// `qr|ready|auth_failure|disconnected|message` and `sendMessage|destroy|initialize`.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Qr(String),
    Ready,
    AuthFailure(String),
    Disconnected(String),
    Message(InboundMessage),
}

/// A single inbound chat message, already deserialised from whatever wire
/// shape the underlying client library emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub from: String,
    pub body: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub from_me: bool,
    #[serde(default)]
    pub mentioned_ids: Vec<String>,
    #[serde(default)]
    pub whatsapp_name: Option<String>,
    #[serde(default)]
    pub chat_name: Option<String>,
}

/// An opaque handle representing a prepared media attachment, ready to hand
/// to [`ChatClient::send_media`].
#[derive(Debug, Clone)]
pub struct MediaHandle {
    pub mime_type: String,
    pub base64: String,
    pub filename: String,
}

/// The chat-network client boundary. Implementations own a browser-driven
/// WhatsApp Web session; this trait is the only surface the supervisor and
/// scheduler depend on, so a test double can stand in without a browser.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Begin authentication/connection. Must be idempotent: calling it on an
    /// already-initialising or already-ready client is a no-op.
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Send a plain text message to `to`, optionally quoting `quoted_id`.
    async fn send_message(&self, to: &str, body: &str, quoted_id: Option<&str>) -> anyhow::Result<()>;

    /// Send a prepared media attachment to `to`.
    async fn send_media(&self, to: &str, media: &MediaHandle, caption: Option<&str>) -> anyhow::Result<()>;

    /// Set or clear the "typing…" indicator for a chat.
    async fn set_typing(&self, to: &str, typing: bool) -> anyhow::Result<()>;

    /// Tear down the underlying browser session. Best-effort: callers log
    /// failures but never propagate them.
    async fn destroy(&self) -> anyhow::Result<()>;
}

/// Drives the chat-network session through a child process that speaks
/// newline-delimited JSON over stdio: one `{"type":"qr"|"ready"|...}` line
/// per event, one command object per line written back to its stdin. The
/// embedded browser automation itself lives entirely in that child; this
/// struct only owns the pipe.
pub struct ProcessChatClient {
    stdin: tokio::sync::Mutex<tokio::process::ChildStdin>,
    child: tokio::sync::Mutex<tokio::process::Child>,
}

impl ProcessChatClient {
    /// Spawns `command agent_id auth_dir`, wiring its stdout into `events`
    /// until the process exits or the pipe closes.
    pub fn spawn(
        command: &str,
        agent_id: &str,
        auth_dir: &str,
        events: tokio::sync::mpsc::UnboundedSender<ClientEvent>,
    ) -> anyhow::Result<Self> {
        use std::process::Stdio;
        use tokio::io::{AsyncBufReadExt, BufReader};

        let mut child = tokio::process::Command::new(command)
            .arg(agent_id)
            .arg(auth_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let agent_id = agent_id.to_string();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_event_line(&line) {
                            if events.send(event).is_err() {
                                break;
                            }
                        } else {
                            tracing::warn!(agent_id, "unrecognised client event: {line}");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(agent_id, "client stdout read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(child),
        })
    }

    async fn write_line(&self, value: serde_json::Value) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut line = serde_json::to_vec(&value)?;
        line.push(b'\n');
        self.stdin.lock().await.write_all(&line).await?;
        Ok(())
    }
}

fn parse_event_line(line: &str) -> Option<ClientEvent> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    match value.get("type")?.as_str()? {
        "qr" => Some(ClientEvent::Qr(value.get("qr")?.as_str()?.to_string())),
        "ready" => Some(ClientEvent::Ready),
        "auth_failure" => Some(ClientEvent::AuthFailure(
            value.get("message").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        )),
        "disconnected" => Some(ClientEvent::Disconnected(
            value.get("reason").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        )),
        "message" => serde_json::from_value(value.get("message")?.clone())
            .ok()
            .map(ClientEvent::Message),
        _ => None,
    }
}

#[async_trait]
impl ChatClient for ProcessChatClient {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.write_line(serde_json::json!({"cmd": "initialize"})).await
    }

    async fn send_message(&self, to: &str, body: &str, quoted_id: Option<&str>) -> anyhow::Result<()> {
        self.write_line(serde_json::json!({
            "cmd": "send_message",
            "to": to,
            "body": body,
            "quotedId": quoted_id,
        }))
        .await
    }

    async fn send_media(&self, to: &str, media: &MediaHandle, caption: Option<&str>) -> anyhow::Result<()> {
        self.write_line(serde_json::json!({
            "cmd": "send_media",
            "to": to,
            "mimeType": media.mime_type,
            "base64": media.base64,
            "filename": media.filename,
            "caption": caption,
        }))
        .await
    }

    async fn set_typing(&self, to: &str, typing: bool) -> anyhow::Result<()> {
        self.write_line(serde_json::json!({"cmd": "set_typing", "to": to, "typing": typing}))
            .await
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        let _ = self.write_line(serde_json::json!({"cmd": "destroy"})).await;
        self.child.lock().await.start_kill().ok();
        Ok(())
    }
}

/// Stand-in client used when spawning the real driver process fails. Every
/// operation returns an error so the session stays visibly broken rather
/// than silently swallowing sends.
pub struct UnavailableChatClient {
    reason: String,
}

impl UnavailableChatClient {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl ChatClient for UnavailableChatClient {
    async fn initialize(&self) -> anyhow::Result<()> {
        anyhow::bail!("chat client unavailable: {}", self.reason)
    }

    async fn send_message(&self, _to: &str, _body: &str, _quoted_id: Option<&str>) -> anyhow::Result<()> {
        anyhow::bail!("chat client unavailable: {}", self.reason)
    }

    async fn send_media(&self, _to: &str, _media: &MediaHandle, _caption: Option<&str>) -> anyhow::Result<()> {
        anyhow::bail!("chat client unavailable: {}", self.reason)
    }

    async fn set_typing(&self, _to: &str, _typing: bool) -> anyhow::Result<()> {
        anyhow::bail!("chat client unavailable: {}", self.reason)
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub mod test_double {
    use super::*;
    use tokio::sync::Mutex;

    /// In-memory [`ChatClient`] used by supervisor/dispatcher tests. Records
    /// every call so assertions can inspect ordering without a real browser.
    #[derive(Default)]
    pub struct RecordingClient {
        pub sent: Mutex<Vec<(String, String)>>,
        pub destroyed: Mutex<bool>,
    }

    #[async_trait]
    impl ChatClient for RecordingClient {
        async fn initialize(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_message(
            &self,
            to: &str,
            body: &str,
            _quoted_id: Option<&str>,
        ) -> anyhow::Result<()> {
            self.sent.lock().await.push((to.to_string(), body.to_string()));
            Ok(())
        }

        async fn send_media(
            &self,
            to: &str,
            media: &MediaHandle,
            _caption: Option<&str>,
        ) -> anyhow::Result<()> {
            self.sent
                .lock()
                .await
                .push((to.to_string(), format!("<media:{}>", media.filename)));
            Ok(())
        }

        async fn set_typing(&self, _to: &str, _typing: bool) -> anyhow::Result<()> {
            Ok(())
        }

        async fn destroy(&self) -> anyhow::Result<()> {
            *self.destroyed.lock().await = true;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qr_event() {
        let event = parse_event_line(r#"{"type":"qr","qr":"otp-string"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Qr(s) if s == "otp-string"));
    }

    #[test]
    fn parses_message_event() {
        let line = r#"{"type":"message","message":{"from":"a@c.us","body":"hi","type":"chat","from_me":false}}"#;
        let event = parse_event_line(line).unwrap();
        assert!(matches!(event, ClientEvent::Message(m) if m.from == "a@c.us" && m.body == "hi"));
    }

    #[test]
    fn unknown_event_type_is_none() {
        assert!(parse_event_line(r#"{"type":"bogus"}"#).is_none());
    }

    #[test]
    fn malformed_json_is_none() {
        assert!(parse_event_line("not json").is_none());
    }
}
