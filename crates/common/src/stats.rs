// # -----------------------------
// # crates/common/src/stats.rs
// # -----------------------------
//! Telemetry documents pushed by managed services and the in-memory
//! stat lists they update.

use serde::{Deserialize, Serialize};

/// One telemetry connection delivers exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryDoc {
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(default)]
    pub stats: Vec<StatUpdate>,
}

/// A single stat mutation. A missing or null `value` removes the stat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// A stat as kept per service (and for the host itself).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub id: String,
    pub description: String,
    pub value: String,
}

/// Applies one update to a stat list: upsert keyed by `id`, remove when
/// the value is absent. Returns whether the list changed.
pub fn apply_stat_update(list: &mut Vec<Stat>, update: StatUpdate) -> bool {
    let StatUpdate {
        id,
        description,
        value,
    } = update;

    let existing = list.iter().position(|stat| stat.id == id);
    match value {
        None => match existing {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        },
        Some(value) => {
            let value = render_value(value);
            match existing {
                Some(index) => {
                    let stat = &mut list[index];
                    if let Some(description) = description {
                        stat.description = description;
                    }
                    stat.value = value;
                }
                None => list.push(Stat {
                    description: description.unwrap_or_else(|| id.clone()),
                    id,
                    value,
                }),
            }
            true
        }
    }
}

fn render_value(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(id: &str, description: Option<&str>, value: Option<serde_json::Value>) -> StatUpdate {
        StatUpdate {
            id: id.into(),
            description: description.map(Into::into),
            value,
        }
    }

    #[test]
    fn upsert_inserts_then_overwrites() {
        let mut list = Vec::new();
        assert!(apply_stat_update(
            &mut list,
            update("queueDepth", Some("Queue depth"), Some(json!(17)))
        ));
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].value, "17");

        assert!(apply_stat_update(&mut list, update("queueDepth", None, Some(json!(3)))));
        assert_eq!(list.len(), 1, "same id must not duplicate");
        assert_eq!(list[0].value, "3");
        assert_eq!(list[0].description, "Queue depth", "description survives partial update");
    }

    #[test]
    fn absent_value_removes_and_missing_id_is_a_noop() {
        let mut list = Vec::new();
        apply_stat_update(&mut list, update("queueDepth", None, Some(json!(17))));

        assert!(apply_stat_update(&mut list, update("queueDepth", None, None)));
        assert!(list.is_empty());

        assert!(!apply_stat_update(&mut list, update("queueDepth", None, None)));
    }

    #[test]
    fn null_value_counts_as_removal() {
        let doc: TelemetryDoc = serde_json::from_str(
            r#"{"serviceName":"api","stats":[{"id":"queueDepth","value":null}]}"#,
        )
        .unwrap();
        assert!(doc.stats[0].value.is_none());
    }

    #[test]
    fn description_falls_back_to_id() {
        let mut list = Vec::new();
        apply_stat_update(&mut list, update("queueDepth", None, Some(json!("17"))));
        assert_eq!(list[0].description, "queueDepth");
    }

    #[test]
    fn telemetry_doc_parses_wire_shape() {
        let doc: TelemetryDoc = serde_json::from_str(
            r#"{"serviceName":"api","stats":[{"id":"queueDepth","description":"Queue depth","value":17}]}"#,
        )
        .unwrap();
        assert_eq!(doc.service_name, "api");
        assert_eq!(doc.stats.len(), 1);
        assert_eq!(doc.stats[0].description.as_deref(), Some("Queue depth"));
    }
}
