use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of record a mutation targets.
///
/// The well-known family-app types get their own variant; anything else the
/// host registers travels as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    User,
    Task,
    TaskCompletion,
    Redemption,
    Family,
    NotificationRead,
    Other(String),
}

impl EntityType {
    /// Canonical snake_case name, also used as the local store table name.
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::User => "user",
            EntityType::Task => "task",
            EntityType::TaskCompletion => "task_completion",
            EntityType::Redemption => "redemption",
            EntityType::Family => "family",
            EntityType::NotificationRead => "notification_read",
            EntityType::Other(name) => name,
        }
    }

    /// Parse from string name. Unknown names become `Other`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "user" => EntityType::User,
            "task" => EntityType::Task,
            "task_completion" | "taskcompletion" => EntityType::TaskCompletion,
            "redemption" => EntityType::Redemption,
            "family" => EntityType::Family,
            "notification_read" | "notificationread" => EntityType::NotificationRead,
            other => EntityType::Other(other.to_string()),
        }
    }

    /// The well-known entity types, in a stable order.
    pub fn known() -> [EntityType; 6] {
        [
            EntityType::User,
            EntityType::Task,
            EntityType::TaskCompletion,
            EntityType::Redemption,
            EntityType::Family,
            EntityType::NotificationRead,
        ]
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        EntityType::parse(&s)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        EntityType::parse(s)
    }
}

impl From<EntityType> for String {
    fn from(entity_type: EntityType) -> Self {
        entity_type.as_str().to_string()
    }
}

/// What a mutation does to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "insert" | "create" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" | "remove" => Ok(Operation::Delete),
            _ => Err(format!(
                "Invalid operation: '{}'. Valid values: insert, update, delete",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_parse() {
        assert_eq!(EntityType::parse("task"), EntityType::Task);
        assert_eq!(EntityType::parse("Task-Completion"), EntityType::TaskCompletion);
        assert_eq!(EntityType::parse("notificationRead"), EntityType::NotificationRead);
        assert_eq!(
            EntityType::parse("reward"),
            EntityType::Other("reward".to_string())
        );
    }

    #[test]
    fn test_entity_type_serializes_as_string() {
        let json = serde_json::to_string(&EntityType::TaskCompletion).unwrap();
        assert_eq!(json, "\"task_completion\"");

        let parsed: EntityType = serde_json::from_str("\"reward\"").unwrap();
        assert_eq!(parsed, EntityType::Other("reward".to_string()));
        assert_eq!(parsed.to_string(), "reward");
    }

    #[test]
    fn test_operation_from_str() {
        assert_eq!("insert".parse::<Operation>().unwrap(), Operation::Insert);
        assert_eq!("UPDATE".parse::<Operation>().unwrap(), Operation::Update);
        assert_eq!("remove".parse::<Operation>().unwrap(), Operation::Delete);

        let err = "upsert".parse::<Operation>().unwrap_err();
        assert!(err.contains("Invalid operation"));
    }
}
