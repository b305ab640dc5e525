//! Text generation for replies and moderation notices.
//!
//! Callers never look inside the generated text. Anything that goes wrong
//! ends in a fixed fallback string chosen by the caller, see [`respond_or`].

use crate::config::AiConfig;
use crate::error::GenerationError;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the AI for the Apex Project, a secret organization that works in shadows.
Your name is Apex, not Gemini or any other AI.
You were made by Apex for members only.

When talking:
- Use simple words but keep a wisdom, all knowing and smart, and be engaging and funny
- Keep everything easy to understand

Remember: simple and mysterious, wisdom, knowledge, fast.";

pub const OFFLINE_PRIVATE: &str =
    "I'm Apex. My systems are offline right now. Ask an admin to turn me on.";
pub const OFFLINE_GROUP: &str =
    "Apex is sleeping. The shadows will return when the admin wakes me up.";
pub const REPLY_FAILED: &str = "The shadows are too thick right now. Try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Private,
    Group,
    Warning,
    Welcome,
    Banned,
}

impl Tone {
    fn instructions(self) -> &'static str {
        match self {
            Tone::Warning => {
                "You are warning a user who broke the rules. Be short and direct but keep a dark, \
                 mysterious tone. Mention shadows, watching, or secrets in your warning. Keep it \
                 under 3 sentences and use simple words."
            }
            Tone::Welcome => {
                "You are welcoming a new member to a secret group. Be mysterious but friendly. \
                 Keep it short and simple. Make them feel special for being chosen. Mention \
                 shadows or secrets in a casual way."
            }
            Tone::Banned => {
                "You are responding to someone who posted something bad. Be sarcastic but keep it \
                 simple and easy to understand. Make a dark joke about it. Keep it very short. \
                 Don't use hard words or long sentences."
            }
            Tone::Private => {
                "This is a private chat with a user. Be helpful but mysterious. Use simple words. \
                 Keep your answer under 3 sentences. Add a short mention of shadows or secrets."
            }
            Tone::Group => {
                "You are responding in a group chat. Keep it very short and simple. Use easy words \
                 everyone understands. Add a brief dark or mysterious element."
            }
        }
    }
}

#[async_trait]
pub trait Responder: Send + Sync {
    async fn generate(&self, prompt: &str, tone: Tone) -> Result<String, GenerationError>;
}

/// Generated text, or `fallback` when generation fails or comes back blank.
pub async fn respond_or(
    responder: &dyn Responder,
    prompt: &str,
    tone: Tone,
    fallback: impl Into<String>,
) -> String {
    match responder.generate(prompt, tone).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => fallback.into(),
        Err(GenerationError::Unavailable) => fallback.into(),
        Err(e) => {
            warn!("ai generation failed ({:?}): {}", tone, e);
            fallback.into()
        }
    }
}

pub fn welcome_prompt(name: &str) -> String {
    format!("Generate a personalized welcome message for new user {name}")
}

pub fn warning_prompt(name: &str, reason: &str) -> String {
    format!("Generate a warning message for user {name} who was warned for {reason}")
}

pub fn banned_prompt(name: &str, what: &str) -> String {
    format!("Generate a sarcastic response to user {name} who posted inappropriate {what}")
}

pub fn build_prompt(system: &str, tone: Tone, user: &str) -> String {
    format!(
        "{}\n\n{}\n\nUser query/context: {}",
        system.trim(),
        tone.instructions(),
        user
    )
}

const DISCLAIMERS: &[&str] = &[
    r"As an AI",
    r"As an assistant",
    r"As a language model",
    r"I'm an AI",
    r"I'm just an AI",
    r"I am an AI",
    r"I am just an AI",
    r"as an artificial intelligence",
    r"as a virtual assistant",
];

const ALTERNATIVES: &[&str] = &[
    "As Apex",
    "From the shadows",
    "The Council says",
    "Apex knows",
    "The secret keepers say",
    "Our hidden watchers report",
];

/// Keeps the persona intact: vendor names and assistant disclaimers are
/// swapped for in-theme wording.
pub struct Sanitizer {
    vendor_model: Regex,
    vendor: Regex,
    disclaimers: Vec<Regex>,
    persona: String,
}

impl Sanitizer {
    pub fn new(persona: &str) -> Result<Self, regex::Error> {
        let disclaimers = DISCLAIMERS
            .iter()
            .map(|d| Regex::new(&format!(r"(?i)\b{}\b", regex::escape(d))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            vendor_model: Regex::new(r"(?i)\bGemini\b")?,
            vendor: Regex::new(r"(?i)\bGoogle\b")?,
            disclaimers,
            persona: persona.to_string(),
        })
    }

    pub fn clean(&self, text: &str) -> String {
        let mut out = self
            .vendor_model
            .replace_all(text, self.persona.as_str())
            .into_owned();
        out = self.vendor.replace_all(&out, "The Apex Project").into_owned();

        let mut rng = rand::thread_rng();
        for re in &self.disclaimers {
            let alt = ALTERNATIVES.choose(&mut rng).copied().unwrap_or("As Apex");
            out = re.replace_all(&out, alt).into_owned();
        }
        out
    }
}

/// Used when no AI key is configured. Conversational tones get a fixed
/// "offline" line; notices fall through to their caller's fallback.
pub struct StubResponder;

#[async_trait]
impl Responder for StubResponder {
    async fn generate(&self, _prompt: &str, tone: Tone) -> Result<String, GenerationError> {
        match tone {
            Tone::Private => Ok(OFFLINE_PRIVATE.to_string()),
            Tone::Group => Ok(OFFLINE_GROUP.to_string()),
            Tone::Warning | Tone::Welcome | Tone::Banned => Err(GenerationError::Unavailable),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<PartOut<'a>>,
}

#[derive(Serialize)]
struct PartOut<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    top_p: f32,
    top_k: u32,
}

#[derive(Serialize)]
struct SafetySetting<'a> {
    category: &'a str,
    threshold: &'a str,
}

#[derive(Deserialize, Default)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<PartIn>,
}

#[derive(Deserialize)]
struct PartIn {
    text: Option<String>,
}

fn first_candidate_text(resp: GenerateResponse) -> Option<String> {
    let content = resp.candidates.into_iter().next()?.content?;
    let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

pub struct GeminiResponder {
    http: reqwest::Client,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    system_prompt: String,
    sanitizer: Sanitizer,
}

impl GeminiResponder {
    pub fn new(cfg: &AiConfig, api_key: &str, persona: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_output_tokens: cfg.max_output_tokens,
            system_prompt: cfg
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            sanitizer: Sanitizer::new(persona)?,
        })
    }
}

#[async_trait]
impl Responder for GeminiResponder {
    async fn generate(&self, prompt: &str, tone: Tone) -> Result<String, GenerationError> {
        let full = build_prompt(&self.system_prompt, tone, prompt);
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![PartOut { text: &full }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
                top_p: 0.9,
                top_k: 40,
            },
            safety_settings: [
                "HARM_CATEGORY_HARASSMENT",
                "HARM_CATEGORY_HATE_SPEECH",
                "HARM_CATEGORY_SEXUALLY_EXPLICIT",
                "HARM_CATEGORY_DANGEROUS_CONTENT",
            ]
            .into_iter()
            .map(|category| SafetySetting {
                category,
                threshold: "BLOCK_MEDIUM_AND_ABOVE",
            })
            .collect(),
        };

        let url = format!("{}/{}:generateContent", GEMINI_ENDPOINT, self.model);
        let resp = self
            .http
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = resp.json().await?;
        let text = first_candidate_text(parsed).ok_or(GenerationError::Empty)?;
        info!(
            "generated ai response ({:?}) for prompt: {}",
            tone,
            prompt.chars().take(50).collect::<String>()
        );
        Ok(self.sanitizer.clean(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<&'static str, ()>);

    #[async_trait]
    impl Responder for Fixed {
        async fn generate(&self, _p: &str, _t: Tone) -> Result<String, GenerationError> {
            self.0
                .map(str::to_string)
                .map_err(|_| GenerationError::Empty)
        }
    }

    #[tokio::test]
    async fn fallback_used_on_error_and_blank_text() {
        let fb = "fallback";
        assert_eq!(respond_or(&Fixed(Err(())), "p", Tone::Warning, fb).await, fb);
        assert_eq!(respond_or(&Fixed(Ok("   ")), "p", Tone::Warning, fb).await, fb);
        assert_eq!(respond_or(&Fixed(Ok("real")), "p", Tone::Warning, fb).await, "real");
    }

    #[tokio::test]
    async fn stub_answers_conversation_but_not_notices() {
        let stub = StubResponder;
        assert_eq!(stub.generate("hi", Tone::Private).await.unwrap(), OFFLINE_PRIVATE);
        assert_eq!(stub.generate("hi", Tone::Group).await.unwrap(), OFFLINE_GROUP);
        assert_eq!(respond_or(&stub, "x", Tone::Welcome, "welcome!").await, "welcome!");
    }

    #[test]
    fn prompt_carries_system_tone_and_query() {
        let p = build_prompt("SYSTEM", Tone::Warning, "who was warned for flooding");
        assert!(p.starts_with("SYSTEM\n\n"));
        assert!(p.contains("You are warning a user"));
        assert!(p.ends_with("User query/context: who was warned for flooding"));
    }

    #[test]
    fn sanitizer_rewrites_vendor_names() {
        let s = Sanitizer::new("Apex").unwrap();
        assert_eq!(
            s.clean("I am Gemini, built by google."),
            "I am Apex, built by The Apex Project."
        );
        // word boundary: no rewrite inside other words
        assert_eq!(s.clean("Geminids"), "Geminids");
    }

    #[test]
    fn sanitizer_replaces_disclaimers() {
        let s = Sanitizer::new("Apex").unwrap();
        let out = s.clean("As an AI, I cannot know that.");
        assert!(!out.contains("As an AI"));
        assert!(ALTERNATIVES.iter().any(|a| out.starts_with(a)), "{out}");
    }

    #[test]
    fn candidate_text_joins_parts() {
        let resp: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"The shadows "},{"text":"see you."}]}}]}"#,
        )
        .unwrap();
        assert_eq!(first_candidate_text(resp).as_deref(), Some("The shadows see you."));

        let empty: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert_eq!(first_candidate_text(empty), None);
    }
}
