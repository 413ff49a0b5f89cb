//! Story-processing state machine.
//!
//! One story moves through
//! `Idle -> [Transcribing ->] Extracting -> [AwaitingConfirmation ->] Merging -> Responding -> Idle`.
//! Every transition is a plain method call; the async gateway calls and
//! persistence happen outside (see `manager`). The session owns the graph
//! the merge engine reads from and commits to.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extract::ExtractionError;
use crate::graph::{KnowledgeGraph, Person};
use crate::merge::{find_new_persons, merge, MergeOutcome, MergeReport};
use crate::normalize::normalize_id;
use crate::transcribe::TranscriptionError;

pub const TRANSCRIPTION_FAILED: &str =
    "Transcription failed. Please check the logs or try a different file or recording.";
pub const EXTRACTION_FAILED: &str =
    "I understood the story, but encountered an error trying to extract structured information.";
pub const NOTHING_FOUND: &str =
    "I understood the story, but didn't find any people, events, or relationships to add.";
pub const NO_NEW_INFORMATION: &str =
    "Okay, I processed the story. No new information was added to the knowledge graph.";
pub const SAVE_FAILED: &str =
    "Warning: the knowledge graph could not be saved, changes are kept for this session only.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot handle '{trigger}' while {state}")]
    InvalidTransition {
        state: &'static str,
        trigger: &'static str,
    },

    /// A newer story (or a reset) replaced this one while its gateway call
    /// was in flight
    #[error("story was superseded before it finished")]
    Superseded,
}

/// Identifies one story from `text_received`/`audio_received` until its
/// gateway results come back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoryId(u64);

/// Who said a chat message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown chat role '{0}'")]
pub struct UnknownRole(String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the conversation transcript
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// What the user hears back about one story
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoryReply {
    /// New persons found; nothing merged until they are confirmed
    AwaitingConfirmation { proposals: Vec<Person> },
    /// The graph grew
    Updated {
        response: String,
        report: MergeReport,
        persisted: bool,
    },
    /// Merge ran but everything was already known
    Unchanged { response: String, report: MergeReport },
    /// Extraction succeeded with nothing in it
    NothingFound { response: String },
    /// Transcription or extraction failed; the graph is untouched
    Failed { response: String, error: String },
}

impl StoryReply {
    /// Text to show (or speak) to the user
    pub fn response(&self) -> String {
        match self {
            StoryReply::AwaitingConfirmation { proposals } => {
                let names: Vec<String> = proposals
                    .iter()
                    .map(|p| format!("{} ({})", p.name, p.id))
                    .collect();
                format!(
                    "I found {} new person(s) in the story: {}. Please confirm who to add.",
                    proposals.len(),
                    names.join(", ")
                )
            }
            StoryReply::Updated { response, .. }
            | StoryReply::Unchanged { response, .. }
            | StoryReply::NothingFound { response }
            | StoryReply::Failed { response, .. } => response.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Transcribing,
    Extracting,
    AwaitingConfirmation {
        proposals: Vec<Person>,
        candidate: KnowledgeGraph,
    },
    Merging {
        confirmed: Vec<Person>,
        candidate: KnowledgeGraph,
    },
    Responding { reply: StoryReply },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Transcribing => "transcribing",
            SessionState::Extracting => "extracting",
            SessionState::AwaitingConfirmation { .. } => "awaiting_confirmation",
            SessionState::Merging { .. } => "merging",
            SessionState::Responding { .. } => "responding",
        }
    }
}

/// What the driver has to do after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Stop and ask the user about these persons
    AwaitConfirmation(Vec<Person>),
    /// Call [`StorySession::run_merge`]
    Merge,
    /// Call [`StorySession::response_delivered`]
    Respond,
}

#[derive(Debug, Clone)]
pub struct StorySession {
    state: SessionState,
    graph: KnowledgeGraph,
    history: Vec<ChatMessage>,
    story: u64,
}

impl StorySession {
    pub fn new(graph: KnowledgeGraph, history: Vec<ChatMessage>) -> Self {
        Self { state: SessionState::Idle, graph, history, story: 0 }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Persons waiting for confirmation, if any
    pub fn proposals(&self) -> &[Person] {
        match &self.state {
            SessionState::AwaitingConfirmation { proposals, .. } => proposals,
            _ => &[],
        }
    }

    fn invalid(&self, trigger: &'static str) -> SessionError {
        SessionError::InvalidTransition { state: self.state.name(), trigger }
    }

    /// A new story may start when idle. A pending confirmation is dropped,
    /// and a story still waiting on a gateway is abandoned: its caller may
    /// have given up on it, and its late result is rejected as superseded.
    fn start(&mut self, trigger: &'static str, next: SessionState) -> Result<StoryId, SessionError> {
        match &self.state {
            SessionState::Idle => {}
            SessionState::AwaitingConfirmation { proposals, .. } => {
                tracing::info!(pending = proposals.len(), "Discarding unconfirmed persons for a new story");
            }
            SessionState::Transcribing | SessionState::Extracting => {
                tracing::warn!(state = self.state.name(), "Abandoning unfinished story");
            }
            _ => return Err(self.invalid(trigger)),
        }
        self.story += 1;
        self.state = next;
        Ok(StoryId(self.story))
    }

    /// Gateway results only count for the story that is still current
    fn check_current(&self, story: StoryId) -> Result<(), SessionError> {
        if story.0 != self.story {
            tracing::info!(story = story.0, current = self.story, "Dropping result of a superseded story");
            return Err(SessionError::Superseded);
        }
        Ok(())
    }

    fn respond(&mut self, reply: StoryReply) -> Step {
        self.state = SessionState::Responding { reply };
        Step::Respond
    }

    pub fn audio_received(&mut self) -> Result<StoryId, SessionError> {
        self.start("audio received", SessionState::Transcribing)
    }

    pub fn transcription_done(
        &mut self,
        story: StoryId,
        result: Result<String, TranscriptionError>,
    ) -> Result<Option<Step>, SessionError> {
        self.check_current(story)?;
        if self.state != SessionState::Transcribing {
            return Err(self.invalid("transcription done"));
        }
        match result {
            Ok(text) => {
                self.history.push(ChatMessage::new(Role::User, text));
                self.state = SessionState::Extracting;
                Ok(None)
            }
            Err(err) => {
                tracing::error!(error = %err, "Transcription failed");
                Ok(Some(self.respond(StoryReply::Failed {
                    response: TRANSCRIPTION_FAILED.to_string(),
                    error: err.to_string(),
                })))
            }
        }
    }

    pub fn text_received(&mut self, text: &str) -> Result<StoryId, SessionError> {
        let story = self.start("text received", SessionState::Extracting)?;
        self.history.push(ChatMessage::new(Role::User, text));
        Ok(story)
    }

    pub fn extraction_done(
        &mut self,
        story: StoryId,
        result: Result<KnowledgeGraph, ExtractionError>,
    ) -> Result<Step, SessionError> {
        self.check_current(story)?;
        if self.state != SessionState::Extracting {
            return Err(self.invalid("extraction done"));
        }
        let candidate = match result {
            Ok(candidate) => candidate,
            Err(err) => {
                tracing::error!(error = %err, "Extraction failed");
                return Ok(self.respond(StoryReply::Failed {
                    response: EXTRACTION_FAILED.to_string(),
                    error: err.to_string(),
                }));
            }
        };
        if candidate.is_empty() {
            return Ok(self.respond(StoryReply::NothingFound {
                response: NOTHING_FOUND.to_string(),
            }));
        }

        let proposals = find_new_persons(&self.graph, &candidate.persons);
        if proposals.is_empty() {
            tracing::info!("No new persons found, merging events and relationships directly");
            self.state = SessionState::Merging { confirmed: Vec::new(), candidate };
            return Ok(Step::Merge);
        }

        tracing::info!(count = proposals.len(), "Pausing for user confirmation");
        self.state = SessionState::AwaitingConfirmation {
            proposals: proposals.clone(),
            candidate,
        };
        Ok(Step::AwaitConfirmation(proposals))
    }

    /// Accept the proposals whose IDs are listed; unknown IDs are ignored
    pub fn confirmation_submitted(&mut self, person_ids: &[String]) -> Result<Step, SessionError> {
        let (proposals, candidate) = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::AwaitingConfirmation { proposals, candidate } => (proposals, candidate),
            other => {
                self.state = other;
                return Err(self.invalid("confirmation submitted"));
            }
        };

        let wanted: HashSet<String> = person_ids.iter().map(normalize_id).collect();
        let confirmed: Vec<Person> = proposals
            .into_iter()
            .filter(|p| wanted.contains(&p.id))
            .collect();
        tracing::info!(confirmed = confirmed.len(), "User confirmed new persons");

        self.state = SessionState::Merging { confirmed, candidate };
        Ok(Step::Merge)
    }

    /// Compute the next graph version. The session graph is not replaced
    /// until [`StorySession::merge_committed`].
    pub fn run_merge(&self) -> Result<MergeOutcome, SessionError> {
        match &self.state {
            SessionState::Merging { confirmed, candidate } => Ok(merge(
                &self.graph,
                confirmed,
                &candidate.events,
                &candidate.relationships,
            )),
            _ => Err(self.invalid("merge")),
        }
    }

    /// Adopt a merge result. `save_error` is set when persisting it failed;
    /// the new graph is kept either way.
    pub fn merge_committed(
        &mut self,
        outcome: MergeOutcome,
        save_error: Option<String>,
    ) -> Result<Step, SessionError> {
        if !matches!(self.state, SessionState::Merging { .. }) {
            return Err(self.invalid("merge committed"));
        }

        let MergeOutcome { graph, report } = outcome;
        let reply = if report.changed() {
            self.graph = graph;
            let mut response = format!(
                "Okay, I processed the story and added {} person(s), {} event(s) and {} relationship(s) to the knowledge graph.",
                report.added_persons.len(),
                report.added_events.len(),
                report.added_relationships.len()
            );
            if let Some(err) = &save_error {
                tracing::warn!(error = %err, "Knowledge graph kept in memory only");
                response.push(' ');
                response.push_str(SAVE_FAILED);
            }
            StoryReply::Updated { response, report, persisted: save_error.is_none() }
        } else {
            StoryReply::Unchanged { response: NO_NEW_INFORMATION.to_string(), report }
        };
        Ok(self.respond(reply))
    }

    /// Record the assistant's answer and go back to idle
    pub fn response_delivered(&mut self) -> Result<StoryReply, SessionError> {
        let reply = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Responding { reply } => reply,
            other => {
                self.state = other;
                return Err(self.invalid("response delivered"));
            }
        };
        self.history.push(ChatMessage::new(Role::Assistant, reply.response()));
        Ok(reply)
    }

    /// Adopt a graph produced outside the story flow (direct merges)
    pub fn replace_graph(&mut self, graph: KnowledgeGraph) {
        self.graph = graph;
    }

    /// Forget everything: empty graph, empty transcript, idle. A story in
    /// flight is superseded.
    pub fn reset(&mut self) {
        self.story += 1;
        self.state = SessionState::Idle;
        self.graph = KnowledgeGraph::default();
        self.history.clear();
    }
}
