//! Extraction gateway: narrative text in, candidate graph out.
//!
//! Extraction never touches the stored graph. `Ok` with an empty graph and
//! `Err` are different outcomes and are reported differently to the user.

use std::time::Duration;

use thiserror::Error;

use crate::config::OpenAiConfig;
use crate::graph::KnowledgeGraph;
use crate::normalize::prefix_chars;

const SYSTEM_PROMPT: &str = r#"You are an expert at extracting information about people, events, and their relationships from text narratives.

Extract all people mentioned in the text, events they participated in, and relationships between people.

For each person:
- Create a unique ID (normalized name with underscores)
- Include their full name

For each event:
- Create a unique ID
- Include a brief description
- List the IDs of the people who attended

For relationships:
- Identify connections between people (KNOWS, FRIENDS_WITH, etc.)
- Identify connections between people and events (ATTENDED, ORGANIZED, etc.)
- Include context about the relationship when available

Even if the text is brief, extract as much information as possible.

Example input: "I went with Daniel Lomolino to State Street Pub this weekend. We met Sarah there who introduced us to her boyfriend Mike."

Example output:
{
  "persons": [
    {"id": "daniel_lomolino", "name": "Daniel Lomolino"},
    {"id": "sarah", "name": "Sarah"},
    {"id": "mike", "name": "Mike"}
  ],
  "events": [
    {"id": "visit_to_state_street_pub", "description": "Visit to State Street Pub this weekend", "attendees": ["daniel_lomolino", "sarah"]}
  ],
  "relationships": [
    {"source": "daniel_lomolino", "target": "visit_to_state_street_pub", "type": "ATTENDED", "context": "Went to the pub"},
    {"source": "sarah", "target": "visit_to_state_street_pub", "type": "ATTENDED", "context": "Was at the pub"},
    {"source": "daniel_lomolino", "target": "sarah", "type": "KNOWS", "context": "Met at the pub"},
    {"source": "sarah", "target": "mike", "type": "DATING", "context": "Mike is Sarah's boyfriend"}
  ]
}

Respond only with a JSON object with the keys "persons", "events" and "relationships"."#;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction gateway is not configured (set OPENAI_API_KEY)")]
    NotConfigured,

    #[error("no text provided")]
    EmptyInput,

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExtractionError {
    /// Worth another attempt: transport trouble, rate limits, server errors
    /// and malformed model output
    fn is_retryable(&self) -> bool {
        match self {
            ExtractionError::Http(_)
            | ExtractionError::InvalidResponse(_)
            | ExtractionError::Json(_) => true,
            ExtractionError::Api { status, .. } => *status == 429 || *status >= 500,
            ExtractionError::NotConfigured | ExtractionError::EmptyInput => false,
        }
    }
}

/// Available extraction backends.
///
/// Enum dispatch keeps `extract` a plain `async fn`.
#[derive(Debug, Clone)]
pub enum Extractor {
    OpenAi(OpenAiExtractor),
    /// Returns the same candidate graph for any text
    Canned(KnowledgeGraph),
    Disabled,
}

impl Extractor {
    pub fn from_config(config: &OpenAiConfig) -> Result<Self, ExtractionError> {
        match &config.api_key {
            Some(_) => Ok(Extractor::OpenAi(OpenAiExtractor::new(config)?)),
            None => {
                tracing::warn!("OPENAI_API_KEY missing, story extraction disabled");
                Ok(Extractor::Disabled)
            }
        }
    }

    pub async fn extract(&self, text: &str) -> Result<KnowledgeGraph, ExtractionError> {
        if text.trim().is_empty() {
            return Err(ExtractionError::EmptyInput);
        }
        let graph = match self {
            Extractor::OpenAi(e) => e.extract(text).await?,
            Extractor::Canned(graph) => graph.clone(),
            Extractor::Disabled => return Err(ExtractionError::NotConfigured),
        };

        tracing::info!(
            persons = graph.persons.len(),
            events = graph.events.len(),
            relationships = graph.relationships.len(),
            "Extraction finished"
        );
        if graph.is_empty() {
            tracing::warn!("Extraction returned an empty knowledge graph");
        }
        Ok(graph)
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiExtractor {
    api_key: String,
    model: String,
    base_url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiExtractor {
    pub fn new(config: &OpenAiConfig) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn extract(&self, text: &str) -> Result<KnowledgeGraph, ExtractionError> {
        let mut attempt = 0;
        loop {
            match self.request(text).await {
                Ok(graph) => return Ok(graph),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %err, "Extraction attempt failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        text = %prefix_chars(text, 200),
                        "Extraction failed"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn request(&self, text: &str) -> Result<KnowledgeGraph, ExtractionError> {
        let user_prompt = format!(
            "Please extract a knowledge graph from the following text, identifying all people, events, and relationships:\n\n{}\n\nReturn a structured knowledge graph with persons, events, and relationships following the exact format from the example.",
            text
        );
        let request = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt }
            ],
            "temperature": 0.0,
            "response_format": { "type": "json_object" }
        });

        tracing::info!(model = %self.model, text = %prefix_chars(text, 50), "Sending text for extraction");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await?;
            return Err(ExtractionError::Api { status, body });
        }

        let body: serde_json::Value = response.json().await?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ExtractionError::InvalidResponse("missing message content".to_string()))?;
        parse_candidate(content)
    }
}

/// Parse model output into a candidate graph, tolerating a Markdown code fence
pub fn parse_candidate(content: &str) -> Result<KnowledgeGraph, ExtractionError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);

    let value: serde_json::Value = serde_json::from_str(body.trim())?;
    if !value.is_object() {
        return Err(ExtractionError::InvalidResponse(format!(
            "expected a JSON object, got {}",
            prefix_chars(&value.to_string(), 80)
        )));
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Person;

    #[test]
    fn parses_plain_json() {
        let graph = parse_candidate(
            r#"{"persons": [{"id": "sarah", "name": "Sarah"}], "events": [], "relationships": []}"#,
        )
        .unwrap();
        assert_eq!(graph.persons, vec![Person::new("sarah", "Sarah")]);
    }

    #[test]
    fn parses_fenced_json() {
        let content = "```json\n{\"persons\": [{\"name\": \"Mike\"}]}\n```";
        let graph = parse_candidate(content).unwrap();
        assert_eq!(graph.persons[0].name, "Mike");
        assert!(graph.events.is_empty());
    }

    #[test]
    fn empty_object_is_an_empty_graph() {
        assert!(parse_candidate("{}").unwrap().is_empty());
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(parse_candidate("[1, 2]"), Err(ExtractionError::InvalidResponse(_))));
        assert!(matches!(parse_candidate("Sure! Here it is"), Err(ExtractionError::Json(_))));
    }

    #[test]
    fn retry_policy() {
        assert!(ExtractionError::Api { status: 429, body: String::new() }.is_retryable());
        assert!(ExtractionError::Api { status: 503, body: String::new() }.is_retryable());
        assert!(!ExtractionError::Api { status: 401, body: String::new() }.is_retryable());
        assert!(!ExtractionError::NotConfigured.is_retryable());
    }

    #[tokio::test]
    async fn canned_disabled_and_empty_input() {
        let candidate = KnowledgeGraph {
            persons: vec![Person::new("", "Alice")],
            ..Default::default()
        };
        let canned = Extractor::Canned(candidate.clone());
        assert_eq!(canned.extract("Alice went home").await.unwrap(), candidate);
        assert!(matches!(canned.extract("   ").await, Err(ExtractionError::EmptyInput)));
        assert!(matches!(
            Extractor::Disabled.extract("Alice went home").await,
            Err(ExtractionError::NotConfigured)
        ));
    }

    fn openai_config(base_url: String, max_retries: u32) -> OpenAiConfig {
        OpenAiConfig {
            api_key: Some("sk-test".into()),
            base_url,
            model: "gpt-4o".into(),
            timeout_seconds: 5,
            max_retries,
        }
    }

    fn completion(content: &str) -> String {
        serde_json::json!({
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn openai_fenced_reply() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "gpt-4o",
                "response_format": { "type": "json_object" }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion(
                "```json\n{\"persons\": [{\"id\": \"sarah\", \"name\": \"Sarah\"}], \"events\": null}\n```",
            ))
            .expect(1)
            .create_async()
            .await;

        let extractor = Extractor::from_config(&openai_config(server.url(), 3)).unwrap();
        let graph = extractor.extract("Sarah came over").await.unwrap();
        assert_eq!(graph.persons, vec![Person::new("sarah", "Sarah")]);
        assert!(graph.events.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn openai_rate_limit_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body(r#"{"error": {"message": "Rate limit reached"}}"#)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion(r#"{"persons": [{"name": "Mike"}]}"#))
            .expect(1)
            .create_async()
            .await;

        let extractor = Extractor::from_config(&openai_config(server.url(), 3)).unwrap();
        let graph = extractor.extract("Mike called").await.unwrap();
        assert_eq!(graph.persons[0].name, "Mike");
        limited.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn openai_auth_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body("invalid api key")
            .expect(1)
            .create_async()
            .await;

        let extractor = Extractor::from_config(&openai_config(server.url(), 3)).unwrap();
        let err = extractor.extract("Mike called").await.unwrap_err();
        assert!(
            matches!(&err, ExtractionError::Api { status: 401, body } if body == "invalid api key"),
            "got {err:?}"
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn openai_reply_without_content() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices": []}"#)
            .create_async()
            .await;

        let extractor = Extractor::from_config(&openai_config(server.url(), 0)).unwrap();
        assert!(matches!(
            extractor.extract("Mike called").await,
            Err(ExtractionError::InvalidResponse(_))
        ));
    }

    #[test]
    fn missing_key_disables_extraction() {
        let config = OpenAiConfig {
            api_key: None,
            base_url: "http://localhost".into(),
            model: "gpt-4o".into(),
            timeout_seconds: 1,
            max_retries: 0,
        };
        assert!(matches!(Extractor::from_config(&config), Ok(Extractor::Disabled)));
    }
}
