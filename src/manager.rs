use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::extract::Extractor;
use crate::graph::{Event, KnowledgeGraph, Person, Relationship};
use crate::merge::{find_new_persons, merge, MergeReport};
use crate::session::{ChatMessage, SessionError, Step, StoryId, StoryReply, StorySession};
use crate::storage::GraphStore;
use crate::transcribe::Transcriber;

/// Result of a merge requested directly, outside the story flow
#[derive(Debug, Clone, Serialize)]
pub struct DirectMerge {
    pub report: MergeReport,
    /// False when the graph changed but could not be saved
    pub persisted: bool,
}

/// Session snapshot for status queries
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: &'static str,
    pub proposals: Vec<Person>,
    pub persons: usize,
    pub events: usize,
    pub relationships: usize,
}

/// Manager for rolodex operations.
///
/// Owns the one session; the mutex serializes `load -> merge -> save` so at
/// most one merge is in flight against the graph. Gateway calls run outside
/// the lock.
pub struct RolodexManager {
    store: Arc<dyn GraphStore>,
    extractor: Extractor,
    transcriber: Transcriber,
    session: Mutex<StorySession>,
}

impl RolodexManager {
    /// Create manager, loading the graph and transcript from `store`
    pub fn new(store: Arc<dyn GraphStore>, extractor: Extractor, transcriber: Transcriber) -> Self {
        let graph = store.load();
        let history = store.load_history();
        tracing::info!(
            path = %store.location().display(),
            graph = %graph.summary(),
            "Rolodex loaded"
        );
        Self {
            store,
            extractor,
            transcriber,
            session: Mutex::new(StorySession::new(graph, history)),
        }
    }

    /// Read entire knowledge graph
    pub async fn read_graph(&self) -> KnowledgeGraph {
        self.session.lock().await.graph().clone()
    }

    /// Which candidate persons would be new (nothing is stored)
    pub async fn identify_new_persons(&self, candidates: Vec<Person>) -> Vec<Person> {
        let session = self.session.lock().await;
        find_new_persons(session.graph(), &candidates)
    }

    /// Merge already-confirmed data and persist it if anything changed
    pub async fn merge_confirmed(
        &self,
        confirmed_persons: Vec<Person>,
        events: Vec<Event>,
        relationships: Vec<Relationship>,
    ) -> DirectMerge {
        let mut session = self.session.lock().await;
        let outcome = merge(session.graph(), &confirmed_persons, &events, &relationships);
        if !outcome.changed() {
            return DirectMerge { report: outcome.report, persisted: true };
        }

        let persisted = match self.store.save(&outcome.graph) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "Knowledge graph kept in memory only");
                false
            }
        };
        session.replace_graph(outcome.graph);
        DirectMerge { report: outcome.report, persisted }
    }

    /// Process a story told as text.
    ///
    /// The session is only locked around transitions, never across the
    /// gateway call. If this future is dropped mid-extraction the story is
    /// abandoned and the next one replaces it.
    pub async fn process_story(&self, text: &str) -> Result<StoryReply, SessionError> {
        let story = self.session.lock().await.text_received(text)?;
        self.extract_and_drive(story, text).await
    }

    /// Process a recorded story: transcribe, then continue like text
    pub async fn process_audio(&self, audio: &[u8], mime_type: &str) -> Result<StoryReply, SessionError> {
        let story = self.session.lock().await.audio_received()?;
        let transcribed = self.transcriber.transcribe(audio, mime_type).await;
        let text = transcribed.as_ref().ok().cloned();
        {
            let mut session = self.session.lock().await;
            if let Some(step) = session.transcription_done(story, transcribed)? {
                return self.drive(&mut session, step);
            }
            self.save_history(&session);
        }

        self.extract_and_drive(story, &text.unwrap_or_default()).await
    }

    /// Submit the subset of proposed persons the user accepted
    pub async fn confirm_persons(&self, person_ids: &[String]) -> Result<StoryReply, SessionError> {
        let mut session = self.session.lock().await;
        let step = session.confirmation_submitted(person_ids)?;
        self.drive(&mut session, step)
    }

    pub async fn status(&self) -> SessionStatus {
        let session = self.session.lock().await;
        let graph = session.graph();
        SessionStatus {
            state: session.state().name(),
            proposals: session.proposals().to_vec(),
            persons: graph.persons.len(),
            events: graph.events.len(),
            relationships: graph.relationships.len(),
        }
    }

    pub async fn chat_history(&self) -> Vec<ChatMessage> {
        self.session.lock().await.history().to_vec()
    }

    /// Delete everything: graph, transcript and any pending story
    pub async fn clear_all(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        session.reset();
        self.store.reset()
    }

    async fn extract_and_drive(&self, story: StoryId, text: &str) -> Result<StoryReply, SessionError> {
        let extracted = self.extractor.extract(text).await;
        let mut session = self.session.lock().await;
        let step = session.extraction_done(story, extracted)?;
        self.drive(&mut session, step)
    }

    /// Run the session from `step` until it stops for the user
    fn drive(&self, session: &mut StorySession, step: Step) -> Result<StoryReply, SessionError> {
        match step {
            Step::AwaitConfirmation(proposals) => {
                self.save_history(session);
                return Ok(StoryReply::AwaitingConfirmation { proposals });
            }
            Step::Merge => {
                let outcome = session.run_merge()?;
                let save_error = if outcome.changed() {
                    self.store.save(&outcome.graph).err().map(|err| format!("{err:#}"))
                } else {
                    None
                };
                session.merge_committed(outcome, save_error)?;
            }
            Step::Respond => {}
        }

        let reply = session.response_delivered()?;
        self.save_history(session);
        Ok(reply)
    }

    fn save_history(&self, session: &StorySession) {
        if let Err(err) = self.store.save_history(session.history()) {
            tracing::warn!(error = %format!("{err:#}"), "Could not save chat history");
        }
    }
}
