use std::env;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use study_core::model::{Day, PlanDraft, PlanError, Session, UserId};

use crate::error::SummarizerError;

/// How the learner wants the material spread out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyPreferences {
    pub days: u32,
    pub minutes_per_day: u32,
    /// First study day, `YYYY-MM-DD`.
    pub start_date: Option<String>,
}

impl Default for StudyPreferences {
    fn default() -> Self {
        Self {
            days: 7,
            minutes_per_day: 60,
            start_date: None,
        }
    }
}

/// Plan outline returned by a summarizer, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSkeleton {
    #[serde(default)]
    pub overview: String,
    pub days: Vec<DaySkeleton>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySkeleton {
    pub day_number: u32,
    #[serde(default)]
    pub date: String,
    pub sessions: Vec<SessionSkeleton>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSkeleton {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub duration_minutes: u32,
}

impl PlanSkeleton {
    /// Turn the outline into an unsaved plan owned by `user_id`.
    ///
    /// # Errors
    ///
    /// Returns `PlanError` if a session has no title or no duration.
    pub fn into_draft(
        self,
        user_id: UserId,
        title: impl Into<String>,
    ) -> Result<PlanDraft, PlanError> {
        let days = self
            .days
            .into_iter()
            .map(|day| {
                let sessions = day
                    .sessions
                    .into_iter()
                    .map(|s| Session::new(s.title, s.description, s.duration_minutes))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Day::new(day.day_number, day.date, sessions))
            })
            .collect::<Result<Vec<_>, PlanError>>()?;
        Ok(PlanDraft {
            user_id,
            title: title.into(),
            overview: self.overview,
            days,
        })
    }
}

/// Turns study material into a plan outline.
#[async_trait]
pub trait ContentSummarizer: Send + Sync {
    /// Summarize `content` into a day-by-day outline.
    ///
    /// # Errors
    ///
    /// Returns `SummarizerError` on any failure. Callers do not retry.
    async fn summarize(
        &self,
        content: &str,
        preferences: &StudyPreferences,
    ) -> Result<PlanSkeleton, SummarizerError>;
}

#[derive(Clone, Debug)]
pub struct SummarizerConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl SummarizerConfig {
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let api_key = env::var("STUDY_AI_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        let base_url =
            env::var("STUDY_AI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
        let model = env::var("STUDY_AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        Some(Self {
            base_url,
            api_key,
            model,
        })
    }
}

/// `ContentSummarizer` backed by an OpenAI-compatible chat completions API.
#[derive(Clone)]
pub struct ChatSummarizer {
    client: Client,
    config: Option<SummarizerConfig>,
}

impl ChatSummarizer {
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(SummarizerConfig::from_env())
    }

    #[must_use]
    pub fn new(config: Option<SummarizerConfig>) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.is_some()
    }
}

#[async_trait]
impl ContentSummarizer for ChatSummarizer {
    async fn summarize(
        &self,
        content: &str,
        preferences: &StudyPreferences,
    ) -> Result<PlanSkeleton, SummarizerError> {
        let config = self
            .config
            .as_ref()
            .ok_or(SummarizerError::Disabled)?;

        let url = format!(
            "{}/chat/completions",
            config.base_url.trim_end_matches('/')
        );
        let payload = ChatRequest {
            model: config.model.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content: build_prompt(content, preferences),
            }],
            temperature: 0.2,
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&config.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SummarizerError::HttpStatus(response.status()));
        }

        let body: ChatResponse = response.json().await?;
        let reply = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|reply| !reply.trim().is_empty())
            .ok_or(SummarizerError::EmptyResponse)?;

        parse_skeleton(&reply)
    }
}

fn build_prompt(content: &str, preferences: &StudyPreferences) -> String {
    let start = preferences
        .start_date
        .as_deref()
        .map_or_else(String::new, |date| format!(" starting on {date}"));
    format!(
        "Split the material below into a {days}-day study plan{start} with about \
         {minutes} minutes of sessions per day. Reply with JSON only, shaped as \
         {{\"overview\": string, \"days\": [{{\"dayNumber\": number, \"date\": \"YYYY-MM-DD\", \
         \"sessions\": [{{\"title\": string, \"description\": string, \"durationMinutes\": number}}]}}]}}.\n\n{content}",
        days = preferences.days,
        minutes = preferences.minutes_per_day,
    )
}

/// Parse a model reply, tolerating a surrounding markdown code fence.
fn parse_skeleton(reply: &str) -> Result<PlanSkeleton, SummarizerError> {
    let trimmed = reply.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    let skeleton: PlanSkeleton = serde_json::from_str(json.trim())
        .map_err(|err| SummarizerError::InvalidSkeleton(err.to_string()))?;
    if skeleton.days.is_empty() {
        return Err(SummarizerError::InvalidSkeleton("no study days".into()));
    }
    Ok(skeleton)
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = r#"```json
{
  "overview": "Cells, then genetics",
  "days": [
    {"dayNumber": 1, "date": "2024-03-01", "sessions": [
      {"title": "Cell structure", "description": "Organelles", "durationMinutes": 30},
      {"title": "Quiz", "durationMinutes": 10}
    ]},
    {"dayNumber": 2, "date": "2024-03-02", "sessions": [
      {"title": "Mendel", "durationMinutes": 45}
    ]}
  ]
}
```"#;

    #[test]
    fn parses_fenced_reply() {
        let skeleton = parse_skeleton(REPLY).unwrap();
        assert_eq!(skeleton.overview, "Cells, then genetics");
        assert_eq!(skeleton.days.len(), 2);
        assert_eq!(skeleton.days[0].sessions[1].description, "");
        assert_eq!(skeleton.days[1].sessions[0].duration_minutes, 45);
    }

    #[test]
    fn rejects_unusable_replies() {
        assert!(matches!(
            parse_skeleton("Sure! Here is your plan."),
            Err(SummarizerError::InvalidSkeleton(_))
        ));
        assert!(matches!(
            parse_skeleton(r#"{"overview": "x", "days": []}"#),
            Err(SummarizerError::InvalidSkeleton(_))
        ));
    }

    #[test]
    fn skeleton_becomes_draft() {
        let draft = parse_skeleton(REPLY)
            .unwrap()
            .into_draft(UserId::new("u1"), "Biology")
            .unwrap();
        assert_eq!(draft.title, "Biology");
        assert_eq!(draft.days[0].sessions().len(), 2);
        assert_eq!(draft.days[1].date(), "2024-03-02");
    }

    #[test]
    fn zero_minute_session_is_rejected() {
        let skeleton: PlanSkeleton = serde_json::from_str(
            r#"{"days": [{"dayNumber": 1, "sessions": [{"title": "x", "durationMinutes": 0}]}]}"#,
        )
        .unwrap();
        assert_eq!(
            skeleton.into_draft(UserId::new("u1"), "t").unwrap_err(),
            PlanError::InvalidDuration
        );
    }

    #[test]
    fn prompt_mentions_preferences() {
        let prefs = StudyPreferences {
            days: 3,
            minutes_per_day: 45,
            start_date: Some("2024-03-01".into()),
        };
        let prompt = build_prompt("Photosynthesis", &prefs);
        assert!(prompt.contains("3-day"));
        assert!(prompt.contains("45 minutes"));
        assert!(prompt.contains("starting on 2024-03-01"));
        assert!(prompt.ends_with("Photosynthesis"));
    }

    #[tokio::test]
    async fn disabled_summarizer_fails_fast() {
        let summarizer = ChatSummarizer::new(None);
        assert!(!summarizer.enabled());
        let err = summarizer
            .summarize("text", &StudyPreferences::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SummarizerError::Disabled));
    }
}
