use std::{collections::VecDeque, sync::Arc};

use tokio::sync::broadcast;

const RING_CAPACITY: usize = 500;

/// Mirrors every tracing event as a JSON line onto a broadcast channel and a
/// bounded ring buffer, for `/api/logs`.
pub(crate) struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

struct MessageVisitor<'a> {
    message: &'a mut String,
    session_id: &'a mut Option<String>,
}

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => *self.message = value.to_string(),
            "session_id" => *self.session_id = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let mut rendered = format!("{value:?}");
        // Strip surrounding quotes added by Debug on &str
        if rendered.len() >= 2 && rendered.starts_with('"') && rendered.ends_with('"') {
            rendered = rendered[1..rendered.len() - 1].to_string();
        }
        match field.name() {
            "message" => *self.message = rendered,
            "session_id" => *self.session_id = Some(rendered),
            _ => {}
        }
    }
}

pub(crate) fn category(target: &str) -> &'static str {
    if target.contains("pipeline") || target.contains("extraction") || target.contains("jurisdiction")
    {
        "pipeline"
    } else if target.contains("agent") || target.contains("chat") || target.contains("tools") {
        "agent"
    } else {
        "system"
    }
}

impl BroadcastLayer {
    pub fn push(&self, line: String) {
        let _ = self.tx.send(line.clone());
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(line);
            while ring.len() > RING_CAPACITY {
                ring.pop_front();
            }
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let mut message = String::new();
        let mut session_id = None;
        event.record(&mut MessageVisitor {
            message: &mut message,
            session_id: &mut session_id,
        });

        let mut json = serde_json::json!({
            "ts": chrono::Utc::now().timestamp(),
            "level": level,
            "message": message,
            "category": category(event.metadata().target()),
        });
        if let Some(id) = session_id {
            json["session_id"] = serde_json::Value::String(id);
        }

        self.push(json.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_target() {
        assert_eq!(category("colex_core::pipeline"), "pipeline");
        assert_eq!(category("colex_core::extraction"), "pipeline");
        assert_eq!(category("colex_core::chat"), "agent");
        assert_eq!(category("colex_agent::openai"), "agent");
        assert_eq!(category("tower_http::trace"), "system");
    }

    #[test]
    fn ring_is_bounded() {
        let (tx, _rx) = broadcast::channel(16);
        let layer = BroadcastLayer {
            tx,
            ring: Arc::new(std::sync::Mutex::new(VecDeque::new())),
        };
        for i in 0..RING_CAPACITY + 10 {
            layer.push(i.to_string());
        }
        let ring = layer.ring.lock().unwrap();
        assert_eq!(ring.len(), RING_CAPACITY);
        assert_eq!(ring.front().map(String::as_str), Some("10"));
    }
}
