use clap::ValueEnum;
use famsync_core::Payload;

mod config_cmd;
mod conflict;
mod mutation;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use conflict::ConflictCommand;
pub use mutation::{EnqueueCommand, QueueCommand};
pub use sync_cmd::SyncCommand;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Parses a JSON object given on the command line.
fn parse_payload(data: &str) -> Result<Payload, Box<dyn std::error::Error>> {
    match serde_json::from_str::<serde_json::Value>(data)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err("payload must be a JSON object".into()),
    }
}

/// Shortens `s` to `width` characters for table output.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() > width {
        let head: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_requires_object() {
        let payload = parse_payload(r#"{"id": "t1", "title": "Dishes"}"#).unwrap();
        assert_eq!(payload["title"], "Dishes");

        assert!(parse_payload("[1, 2]").is_err());
        assert!(parse_payload("not json").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer value", 10), "a much ...");
    }
}
