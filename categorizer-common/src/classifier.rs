use std::time;

use metrics::{counter, histogram};
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::category::{Category, ClassificationResult};
use crate::metrics_consts::{
    CLASSIFICATION_DURATION, CLASSIFICATION_FALLBACKS, CLASSIFICATION_REPAIRED,
};

const SYSTEM_INSTRUCTION: &str = "Eres un asistente que responde únicamente en formato JSON válido.";

/// Enumeration of the ways a classification call can fail. None of them reach the
/// caller of [`Classifier::classify`], they select the fallback result instead.
#[derive(Error, Debug)]
pub enum ClassificationError {
    #[error("classification request could not be completed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classification backend answered with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("classification backend reply is not a chat completion: {0}")]
    InvalidReply(String),
    #[error("classification content has an unexpected format: {0}")]
    InvalidFormat(String),
}

impl ClassificationError {
    /// Label used when counting fallbacks.
    pub fn cause(&self) -> &'static str {
        match self {
            ClassificationError::Transport(e) if e.is_timeout() => "timeout",
            ClassificationError::Transport(_) => "transport",
            ClassificationError::Status { .. } => "status",
            ClassificationError::InvalidReply(_) => "invalid_reply",
            ClassificationError::InvalidFormat(_) => "invalid_format",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: time::Duration,
}

#[derive(Serialize, Debug, PartialEq)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize, Debug, PartialEq)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f64,
    messages: Vec<ChatMessage>,
}

impl<'a> ChatCompletionRequest<'a> {
    fn for_project(model: &'a str, title: &str, description: &str) -> Self {
        Self {
            model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_INSTRUCTION.to_owned(),
                },
                ChatMessage {
                    role: "user",
                    content: build_prompt(title, description),
                },
            ],
        }
    }
}

#[derive(Deserialize, Debug)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Deserialize, Debug)]
struct ChatReplyMessage {
    content: Option<String>,
}

/// The JSON object the model is instructed to answer with. The category is kept
/// untyped so that a `null` or a number is repaired like any unknown label.
#[derive(Deserialize, Debug)]
struct RawClassification {
    main_category: serde_json::Value,
    tags: Vec<String>,
}

/// Escape the characters that would break out of the quoted project fields in the prompt.
fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn build_prompt(title: &str, description: &str) -> String {
    format!(
        r#"Eres un asistente experto en clasificación para una plataforma de freelancers.
Tu trabajo es analizar el siguiente proyecto y devolver dos cosas en formato JSON:
1. "main_category": Clasifica el proyecto en UNA de las siguientes categorías: {categories}.
2. "tags": Extrae un máximo de 5 habilidades o tecnologías clave mencionadas en el texto.

Texto del Proyecto:
Título: "{title}"
Descripción: "{description}"

Responde ÚNICAMENTE con un objeto JSON válido con las claves "main_category" y "tags"."#,
        categories = Category::prompt_list(),
        title = escape(title),
        description = escape(description),
    )
}

/// Extract the assistant text from a chat completion body.
fn extract_content(body: &str) -> Result<String, ClassificationError> {
    let reply: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|e| ClassificationError::InvalidReply(e.to_string()))?;

    reply
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ClassificationError::InvalidReply("no assistant content".to_owned()))
}

/// Parse and validate the assistant text. A category outside the set is not an
/// error: it is rewritten to [`Category::Other`].
fn parse_classification(content: &str) -> Result<ClassificationResult, ClassificationError> {
    let raw: RawClassification = serde_json::from_str(content.trim())
        .map_err(|e| ClassificationError::InvalidFormat(e.to_string()))?;

    let label = raw.main_category.as_str();
    let main_category = match label.and_then(Category::from_label) {
        Some(category) => category,
        None => {
            warn!(
                category = %raw.main_category,
                "classification returned a category outside the set, using {}",
                Category::Other
            );
            counter!(CLASSIFICATION_REPAIRED).increment(1);
            Category::Other
        }
    };

    Ok(ClassificationResult::new(main_category, raw.tags))
}

/// Client for the chat-completion backend that assigns categories and tags to projects.
#[derive(Clone)]
pub struct Classifier {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("categorization-worker")
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url,
            api_key: config.api_key,
            model: config.model,
        })
    }

    /// Classify a project. Never fails: any error is logged and the fallback
    /// `{Other, []}` is returned, so classification trouble never blocks the pipeline.
    pub async fn classify(&self, title: &str, description: &str) -> ClassificationResult {
        let start = time::Instant::now();

        let result = match self.try_classify(title, description).await {
            Ok(result) => result,
            Err(e) => {
                match &e {
                    ClassificationError::InvalidFormat(_) => {
                        warn!("falling back to default classification: {}", e)
                    }
                    _ => error!("falling back to default classification: {}", e),
                }
                counter!(CLASSIFICATION_FALLBACKS, "cause" => e.cause()).increment(1);

                ClassificationResult::fallback()
            }
        };

        histogram!(CLASSIFICATION_DURATION).record(start.elapsed().as_secs_f64());

        result
    }

    /// Make the classification request, surfacing every failure.
    pub async fn try_classify(
        &self,
        title: &str,
        description: &str,
    ) -> Result<ClassificationResult, ClassificationError> {
        let request = ChatCompletionRequest::for_project(&self.model, title, description);

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassificationError::Status { status, body });
        }

        let body = response.text().await?;
        let content = extract_content(&body)?;

        parse_classification(&content)
    }
}
