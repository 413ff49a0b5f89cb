use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::graph::{Event, KnowledgeGraph, Person, Relationship};
use crate::normalize::{normalize_id, prefix_chars};

/// Characters of the description used when an event comes without an ID
pub const EVENT_ID_PREFIX_CHARS: usize = 30;

/// Why a candidate relationship was left out of the merged graph
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Source ID resolves to no person or event
    MissingSource { id: String },
    /// Target ID resolves to no person or event
    MissingTarget { id: String },
    /// Same `(source, target, type)` is already in the graph
    Duplicate,
}

/// Candidate relationship that was not added, after normalization
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SkippedRelationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// What a merge appended and what it left out
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MergeReport {
    #[serde(rename = "addedPersons")]
    pub added_persons: Vec<Person>,
    #[serde(rename = "addedEvents")]
    pub added_events: Vec<Event>,
    #[serde(rename = "addedRelationships")]
    pub added_relationships: Vec<Relationship>,
    pub skipped: Vec<SkippedRelationship>,
}

impl MergeReport {
    /// True when the merge appended anything
    pub fn changed(&self) -> bool {
        !(self.added_persons.is_empty()
            && self.added_events.is_empty()
            && self.added_relationships.is_empty())
    }

    /// Relationships dropped for a dangling endpoint
    pub fn dangling(&self) -> impl Iterator<Item = &SkippedRelationship> {
        self.skipped
            .iter()
            .filter(|s| !matches!(s.reason, SkipReason::Duplicate))
    }
}

/// Next graph version plus the report of how it was reached
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub graph: KnowledgeGraph,
    pub report: MergeReport,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.report.changed()
    }
}

/// Candidate persons that are not in `current` yet.
///
/// IDs are always re-derived from the name; whatever ID the extractor
/// supplied is ignored. Empty IDs and repeats within the batch are dropped.
/// Returned in first-seen order.
pub fn find_new_persons(current: &KnowledgeGraph, candidates: &[Person]) -> Vec<Person> {
    let known = current.person_ids();
    let mut seen = HashSet::new();
    let mut new_persons = Vec::new();

    for candidate in candidates {
        let id = normalize_id(&candidate.name);
        if id.is_empty() || known.contains(&id) || seen.contains(&id) {
            continue;
        }
        seen.insert(id.clone());
        new_persons.push(Person::new(id, candidate.name.clone()));
    }

    if !new_persons.is_empty() {
        let names: Vec<&str> = new_persons.iter().map(|p| p.name.as_str()).collect();
        tracing::info!(count = new_persons.len(), ?names, "Identified potential new persons");
    }
    new_persons
}

/// Canonical ID of a candidate event: its own ID when it has one, otherwise
/// the first [`EVENT_ID_PREFIX_CHARS`] characters of its description.
pub fn event_id(event: &Event) -> String {
    if event.id.is_empty() {
        normalize_id(prefix_chars(&event.description, EVENT_ID_PREFIX_CHARS))
    } else {
        normalize_id(&event.id)
    }
}

/// Merge confirmed persons plus candidate events and relationships into
/// `current`, returning a new graph. `current` is left untouched.
///
/// Existing nodes are never overwritten. Relationships whose endpoints do
/// not resolve to a node of the resulting graph are skipped and reported.
pub fn merge(
    current: &KnowledgeGraph,
    confirmed_persons: &[Person],
    candidate_events: &[Event],
    candidate_relationships: &[Relationship],
) -> MergeOutcome {
    let mut graph = current.clone();
    let mut added_persons = Vec::new();
    let mut added_events = Vec::new();
    let mut added_relationships = Vec::new();
    let mut skipped = Vec::new();

    // Persons: already normalized by find_new_persons
    let mut person_ids = graph.person_ids();
    for person in confirmed_persons {
        if person.id.is_empty() || person_ids.contains(&person.id) {
            continue;
        }
        person_ids.insert(person.id.clone());
        graph.persons.push(person.clone());
        added_persons.push(person.clone());
        tracing::info!(id = %person.id, name = %person.name, "Adding confirmed person");
    }

    // Events
    let mut event_ids = graph.event_ids();
    for candidate in candidate_events {
        let id = event_id(candidate);
        if id.is_empty() || event_ids.contains(&id) {
            continue;
        }
        event_ids.insert(id.clone());
        let event = Event {
            id,
            description: candidate.description.clone(),
            attendees: candidate.attendees.clone(),
        };
        tracing::info!(id = %event.id, "Adding event");
        graph.events.push(event.clone());
        added_events.push(event);
    }

    // Relationships: endpoints must be pre-existing nodes or nodes added above
    let mut addressable = current.node_ids();
    addressable.extend(added_persons.iter().map(|p| p.id.clone()));
    addressable.extend(added_events.iter().map(|e| e.id.clone()));

    let mut keys = graph.relationship_keys();
    for candidate in candidate_relationships {
        let source = normalize_id(&candidate.source);
        let target = normalize_id(&candidate.target);
        let rel_type = candidate.rel_type.to_uppercase();

        let reason = if !addressable.contains(&source) {
            Some(SkipReason::MissingSource { id: source.clone() })
        } else if !addressable.contains(&target) {
            Some(SkipReason::MissingTarget { id: target.clone() })
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::warn!(%source, %target, %rel_type, ?reason, "Skipping relationship with dangling endpoint");
            skipped.push(SkippedRelationship { source, target, rel_type, reason });
            continue;
        }

        let key = (source, target, rel_type);
        if keys.contains(&key) {
            tracing::debug!(source = %key.0, target = %key.1, rel_type = %key.2, "Skipping duplicate relationship");
            let (source, target, rel_type) = key;
            skipped.push(SkippedRelationship {
                source,
                target,
                rel_type,
                reason: SkipReason::Duplicate,
            });
            continue;
        }
        keys.insert(key.clone());

        let (source, target, rel_type) = key;
        let relationship = Relationship {
            source,
            target,
            rel_type,
            context: candidate.context.clone(),
        };
        tracing::info!(
            source = %relationship.source,
            target = %relationship.target,
            rel_type = %relationship.rel_type,
            "Adding relationship"
        );
        graph.relationships.push(relationship.clone());
        added_relationships.push(relationship);
    }

    MergeOutcome {
        graph,
        report: MergeReport {
            added_persons,
            added_events,
            added_relationships,
            skipped,
        },
    }
}
