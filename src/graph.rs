use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

/// Person in the rolodex
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct Person {
    /// Canonical ID (normalized name, e.g. `daniel_lomolino`)
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,

    /// Display name as it was told
    #[serde(deserialize_with = "lenient_string")]
    pub name: String,
}

impl Person {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into() }
    }
}

/// Event that persons took part in
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Event {
    /// Canonical ID (e.g. `visit_to_state_street_pub`)
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,

    /// Short description of the event
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,

    /// Person IDs that attended, in the order they were mentioned
    #[serde(default, deserialize_with = "lenient_strings")]
    pub attendees: Vec<String>,
}

/// Directed, typed edge between two nodes (person or event)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Relationship {
    /// Source node ID
    #[serde(default, deserialize_with = "lenient_string")]
    pub source: String,

    /// Target node ID
    #[serde(default, deserialize_with = "lenient_string")]
    pub target: String,

    /// Relationship label (KNOWS, ATTENDED, DATING, ...)
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub rel_type: String,

    /// Free-text annotation taken from the story
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub context: Option<String>,
}

/// Identity of a relationship: `(source, target, type)`
pub type RelationshipKey = (String, String, String);

impl Relationship {
    pub fn key(&self) -> RelationshipKey {
        (self.source.clone(), self.target.clone(), self.rel_type.clone())
    }
}

/// Complete knowledge graph.
///
/// Also the shape of a candidate graph produced by extraction, in which
/// case every ID is advisory and gets re-derived before merging.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct KnowledgeGraph {
    #[serde(default, deserialize_with = "lenient_vec")]
    pub persons: Vec<Person>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub events: Vec<Event>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub relationships: Vec<Relationship>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the graph holds no nodes and no edges
    pub fn is_empty(&self) -> bool {
        self.persons.is_empty() && self.events.is_empty() && self.relationships.is_empty()
    }

    pub fn person_ids(&self) -> HashSet<String> {
        self.persons.iter().map(|p| p.id.clone()).collect()
    }

    pub fn event_ids(&self) -> HashSet<String> {
        self.events.iter().map(|e| e.id.clone()).collect()
    }

    /// Every addressable node ID (persons and events)
    pub fn node_ids(&self) -> HashSet<String> {
        let mut ids = self.person_ids();
        ids.extend(self.events.iter().map(|e| e.id.clone()));
        ids
    }

    pub fn relationship_keys(&self) -> HashSet<RelationshipKey> {
        self.relationships.iter().map(Relationship::key).collect()
    }

    pub fn person(&self, id: &str) -> Option<&Person> {
        self.persons.iter().find(|p| p.id == id)
    }

    pub fn event(&self, id: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.id == id)
    }

    /// One-line summary used in tool responses
    pub fn summary(&self) -> String {
        format!(
            "{} persons, {} events and {} relationships",
            self.persons.len(),
            self.events.len(),
            self.relationships.len()
        )
    }
}

// Extractor output is not always well-typed: numbers or booleans show up
// where text is expected, and `null` where a list is expected. Text fields
// take the string form of any scalar; null becomes empty.

fn scalar_to_string(value: serde_json::Value) -> Result<String, String> {
    match value {
        serde_json::Value::Null => Ok(String::new()),
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(format!("expected text, found {}", other)),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    scalar_to_string(value).map_err(serde::de::Error::custom)
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        value => scalar_to_string(value).map(Some).map_err(serde::de::Error::custom),
    }
}

fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(scalar_to_string)
            .collect::<Result<_, _>>()
            .map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("expected a list, found {}", other))),
    }
}

fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> KnowledgeGraph {
        KnowledgeGraph {
            persons: vec![Person::new("alice", "Alice"), Person::new("bob", "Bob")],
            events: vec![Event {
                id: "met_at_the_blue_bottle_cafe_on".into(),
                description: "Met at the Blue Bottle Cafe on Sunday".into(),
                attendees: vec!["alice".into(), "bob".into()],
            }],
            relationships: vec![Relationship {
                source: "alice".into(),
                target: "bob".into(),
                rel_type: "KNOWS".into(),
                context: None,
            }],
        }
    }

    #[test]
    fn structural_queries() {
        let graph = sample();
        assert_eq!(graph.person_ids().len(), 2);
        assert!(graph.event_ids().contains("met_at_the_blue_bottle_cafe_on"));
        assert_eq!(graph.node_ids().len(), 3);
        assert!(graph
            .relationship_keys()
            .contains(&("alice".into(), "bob".into(), "KNOWS".into())));
        assert_eq!(graph.person("bob").map(|p| p.name.as_str()), Some("Bob"));
        assert!(graph.event("nope").is_none());
    }

    #[test]
    fn serializes_relationship_type_field() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["relationships"][0]["type"], "KNOWS");
        assert_eq!(value["relationships"][0]["context"], serde_json::Value::Null);
        assert_eq!(value["events"][0]["attendees"], json!(["alice", "bob"]));
    }

    #[test]
    fn snapshot_round_trip_preserves_order() {
        let graph = sample();
        let text = serde_json::to_string_pretty(&graph).unwrap();
        let back: KnowledgeGraph = serde_json::from_str(&text).unwrap();
        assert_eq!(back, graph);
        assert_eq!(serde_json::to_string_pretty(&back).unwrap(), text);
    }

    #[test]
    fn candidate_fields_are_optional() {
        let candidate: KnowledgeGraph = serde_json::from_value(json!({
            "persons": [{"name": "Alice"}],
            "events": [{"description": "Dinner", "attendees": null}],
            "relationships": [{"source": "Alice", "target": "Dinner", "type": "attended"}]
        }))
        .unwrap();
        assert_eq!(candidate.persons[0].id, "");
        assert!(candidate.events[0].attendees.is_empty());
        assert_eq!(candidate.relationships[0].context, None);
    }

    #[test]
    fn scalars_are_coerced_to_text() {
        let candidate: KnowledgeGraph = serde_json::from_value(json!({
            "persons": [{"name": 42}],
            "events": [{"id": null, "description": true, "attendees": [7]}],
            "relationships": [{"source": 1, "target": 2, "type": "X", "context": 3.5}],
            "extra": "ignored"
        }))
        .unwrap();
        assert_eq!(candidate.persons[0].name, "42");
        assert_eq!(candidate.events[0].id, "");
        assert_eq!(candidate.events[0].description, "true");
        assert_eq!(candidate.events[0].attendees, vec!["7".to_string()]);
        assert_eq!(candidate.relationships[0].context.as_deref(), Some("3.5"));
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let graph: KnowledgeGraph = serde_json::from_value(json!({"persons": null})).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn nested_values_are_rejected() {
        let result: Result<KnowledgeGraph, _> =
            serde_json::from_value(json!({"persons": [{"name": {"first": "A"}}]}));
        assert!(result.is_err());
    }
}
