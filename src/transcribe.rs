//! Speech-to-text gateway.
//!
//! `Transcriber` is an enum over the available backends; Deepgram's
//! pre-recorded endpoint is the only remote one.

use std::time::Duration;

use thiserror::Error;

use crate::config::DeepgramConfig;

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("transcription gateway is not configured (set DEEPGRAM_API_KEY)")]
    NotConfigured,

    #[error("no audio data provided")]
    EmptyAudio,

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub enum Transcriber {
    Deepgram(DeepgramTranscriber),
    /// Returns a fixed transcript for any non-empty audio
    Canned(String),
    Disabled,
}

impl Transcriber {
    pub fn from_config(config: &DeepgramConfig) -> Result<Self, TranscriptionError> {
        match &config.api_key {
            Some(_) => Ok(Transcriber::Deepgram(DeepgramTranscriber::new(config)?)),
            None => {
                tracing::warn!("DEEPGRAM_API_KEY missing, audio transcription disabled");
                Ok(Transcriber::Disabled)
            }
        }
    }

    /// Turn an audio buffer into text. `mime_type` is passed to the backend as-is.
    pub async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String, TranscriptionError> {
        if audio.is_empty() {
            return Err(TranscriptionError::EmptyAudio);
        }
        match self {
            Transcriber::Deepgram(t) => t.transcribe(audio, mime_type).await,
            Transcriber::Canned(text) => Ok(text.clone()),
            Transcriber::Disabled => Err(TranscriptionError::NotConfigured),
        }
    }
}

/// Guess the audio MIME type from a file extension (WAV when unknown)
pub fn mime_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        Some("webm") => "audio/webm",
        Some("flac") => "audio/flac",
        _ => "audio/wav",
    }
}

#[derive(Debug, Clone)]
pub struct DeepgramTranscriber {
    api_key: String,
    base_url: String,
    model: String,
    language: String,
    client: reqwest::Client,
}

impl DeepgramTranscriber {
    pub fn new(config: &DeepgramConfig) -> Result<Self, TranscriptionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            api_key: config.api_key.clone().unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            language: config.language.clone(),
            client,
        })
    }

    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String, TranscriptionError> {
        tracing::info!(bytes = audio.len(), model = %self.model, "Sending audio for transcription");

        let response = self
            .client
            .post(format!("{}/listen", self.base_url))
            .query(&[
                ("punctuate", "true"),
                ("model", self.model.as_str()),
                ("language", self.language.as_str()),
            ])
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", mime_type)
            .body(audio.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await?;
            return Err(TranscriptionError::Api { status, body });
        }

        let body: serde_json::Value = response.json().await?;
        let transcript = transcript_from(&body)?;
        tracing::info!(preview = %crate::normalize::prefix_chars(&transcript, 50), "Transcription received");
        Ok(transcript)
    }
}

/// Pull `results.channels[0].alternatives[0].transcript` out of a response
fn transcript_from(body: &serde_json::Value) -> Result<String, TranscriptionError> {
    let transcript = body["results"]["channels"][0]["alternatives"][0]["transcript"]
        .as_str()
        .ok_or_else(|| TranscriptionError::InvalidResponse("missing transcript".to_string()))?
        .trim();
    if transcript.is_empty() {
        return Err(TranscriptionError::InvalidResponse("empty transcript".to_string()));
    }
    Ok(transcript.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    #[test]
    fn reads_first_alternative() {
        let body = json!({
            "results": {"channels": [{"alternatives": [
                {"transcript": " Alice met Bob. ", "confidence": 0.98},
                {"transcript": "Alice met Rob."}
            ]}]}
        });
        assert_eq!(transcript_from(&body).unwrap(), "Alice met Bob.");
    }

    #[test]
    fn missing_or_blank_transcript_is_an_error() {
        assert!(matches!(
            transcript_from(&json!({"results": {}})),
            Err(TranscriptionError::InvalidResponse(_))
        ));
        let blank = json!({"results": {"channels": [{"alternatives": [{"transcript": "  "}]}]}});
        assert!(transcript_from(&blank).is_err());
    }

    #[test]
    fn mime_type_from_extension() {
        assert_eq!(mime_type_for(Path::new("story.MP3")), "audio/mpeg");
        assert_eq!(mime_type_for(Path::new("story.m4a")), "audio/mp4");
        assert_eq!(mime_type_for(Path::new("story")), "audio/wav");
    }

    fn deepgram_config(base_url: String) -> DeepgramConfig {
        DeepgramConfig {
            api_key: Some("dg-test".into()),
            base_url,
            model: "nova-2".into(),
            language: "en-US".into(),
            timeout_seconds: 5,
        }
    }

    fn listen_mock(server: &mut mockito::Server) -> mockito::Mock {
        server
            .mock("POST", "/listen")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("punctuate".into(), "true".into()),
                mockito::Matcher::UrlEncoded("model".into(), "nova-2".into()),
                mockito::Matcher::UrlEncoded("language".into(), "en-US".into()),
            ]))
            .match_header("authorization", "Token dg-test")
            .match_header("content-type", "audio/mpeg")
            .match_body("ID3audio")
    }

    #[tokio::test]
    async fn deepgram_transcribes() {
        let mut server = mockito::Server::new_async().await;
        let mock = listen_mock(&mut server)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"results": {"channels": [{"alternatives": [{"transcript": "Sarah met Mike."}]}]}})
                    .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let transcriber = Transcriber::from_config(&deepgram_config(server.url())).unwrap();
        let text = transcriber.transcribe(b"ID3audio", "audio/mpeg").await.unwrap();
        assert_eq!(text, "Sarah met Mike.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn deepgram_empty_transcript_fails() {
        let mut server = mockito::Server::new_async().await;
        let mock = listen_mock(&mut server)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"results": {"channels": [{"alternatives": [{"transcript": ""}]}]}}).to_string())
            .create_async()
            .await;

        let transcriber = Transcriber::from_config(&deepgram_config(server.url())).unwrap();
        assert!(matches!(
            transcriber.transcribe(b"ID3audio", "audio/mpeg").await,
            Err(TranscriptionError::InvalidResponse(_))
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn deepgram_error_status() {
        let mut server = mockito::Server::new_async().await;
        listen_mock(&mut server)
            .with_status(402)
            .with_body("insufficient credits")
            .create_async()
            .await;

        let transcriber = Transcriber::from_config(&deepgram_config(server.url())).unwrap();
        assert!(matches!(
            transcriber.transcribe(b"ID3audio", "audio/mpeg").await,
            Err(TranscriptionError::Api { status: 402, .. })
        ));
    }

    #[tokio::test]
    async fn canned_and_disabled() {
        let canned = Transcriber::Canned("hello".into());
        assert_eq!(canned.transcribe(b"RIFF", "audio/wav").await.unwrap(), "hello");
        assert!(matches!(
            canned.transcribe(b"", "audio/wav").await,
            Err(TranscriptionError::EmptyAudio)
        ));
        assert!(matches!(
            Transcriber::Disabled.transcribe(b"RIFF", "audio/wav").await,
            Err(TranscriptionError::NotConfigured)
        ));
    }
}
