use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Catalog entry, as served by `GET /api/ejercicios`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Exercise {
    #[serde(rename = "_id", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "titulo", default)]
    pub title: String,
    #[serde(rename = "asignatura", default)]
    pub subject: String,
    #[serde(rename = "concepto", default)]
    pub concept: String,
    /// 1..=5; anything the backend sends that is not a number becomes 0.
    #[serde(rename = "nivel", default, deserialize_with = "lenient_level")]
    pub level: u8,
    #[serde(rename = "enunciado", default)]
    pub statement: String,
    #[serde(rename = "imagen", default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Full conversation returned by `GET /api/interacciones/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    #[serde(rename = "_id", default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "ejercicio_id", default, deserialize_with = "string_or_number")]
    pub exercise_id: String,
    #[serde(rename = "conversacion", default)]
    pub transcript: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    #[serde(rename = "_id", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "ejercicio_id", default, deserialize_with = "string_or_number")]
    pub exercise_id: String,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The conversation currently open in a controller. `id` stays `None` until
/// the backend assigns one mid-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interaction {
    pub id: Option<String>,
    pub exercise_id: Option<String>,
    pub transcript: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Interaction {
    pub fn new(exercise_id: Option<String>) -> Self {
        let now = Utc::now();
        Self { id: None, exercise_id, transcript: Vec::new(), created_at: now, updated_at: now }
    }

    pub fn from_conversation(conversation: Conversation) -> Self {
        let mut interaction = Self::new(Some(conversation.exercise_id).filter(|id| !id.is_empty()));
        interaction.id = Some(conversation.id).filter(|id| !id.is_empty());
        interaction.transcript = conversation.transcript;
        interaction
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
}

/// Answer of the "who am I" check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Identity {
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user_id(&self) -> Option<&str> {
        if !self.authenticated {
            return None;
        }
        self.user.as_ref().map(|u| u.id.as_str()).filter(|id| !id.is_empty())
    }
}

/// Body of `POST /api/ollama/chat/stream`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamRequest {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "exerciseId")]
    pub exercise_id: String,
    #[serde(rename = "interaccionId", alias = "interactionId", default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    #[serde(rename = "userMessage")]
    pub user_message: String,
    #[serde(rename = "llmMode", default, skip_serializing_if = "Option::is_none")]
    pub llm_mode: Option<String>,
}

/// Body of `POST /api/resultados/finalizar`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultRecord {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "exerciseId")]
    pub exercise_id: String,
    #[serde(rename = "interaccionId", alias = "interactionId")]
    pub interaction_id: String,
    #[serde(rename = "resueltoALaPrimera")]
    pub first_attempt: bool,
}

fn string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(de)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!("expected string id, got {}", other))),
    }
}

fn lenient_level<'de, D: Deserializer<'de>>(de: D) -> Result<u8, D::Error> {
    let level = match serde_json::Value::deserialize(de)? {
        serde_json::Value::Number(n) => n.as_u64().and_then(|v| u8::try_from(v).ok()).unwrap_or(0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    };
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exercise_accepts_backend_field_names_and_loose_level() {
        let raw = r#"[
            {"_id": "e1", "titulo": "Sumas", "asignatura": "Mates", "concepto": "suma", "nivel": "3", "enunciado": "2+2", "imagen": "sumas.png"},
            {"_id": 7, "titulo": "Restas", "nivel": "hard"}
        ]"#;
        let exercises: Vec<Exercise> = serde_json::from_str(raw).unwrap();
        assert_eq!(exercises[0].id, "e1");
        assert_eq!(exercises[0].level, 3);
        assert_eq!(exercises[0].image.as_deref(), Some("sumas.png"));
        assert_eq!(exercises[1].id, "7");
        assert_eq!(exercises[1].level, 0);
        assert_eq!(exercises[1].concept, "");
    }

    #[test]
    fn conversation_maps_to_interaction() {
        let raw = r#"{"_id": "i1", "ejercicio_id": "e1", "conversacion": [
            {"role": "user", "content": "hola"},
            {"role": "assistant", "content": "hola, empecemos"}
        ]}"#;
        let conv: Conversation = serde_json::from_str(raw).unwrap();
        let interaction = Interaction::from_conversation(conv);
        assert_eq!(interaction.id.as_deref(), Some("i1"));
        assert_eq!(interaction.exercise_id.as_deref(), Some("e1"));
        assert_eq!(interaction.transcript.len(), 2);
        assert_eq!(interaction.transcript[1], ChatMessage::assistant("hola, empecemos"));
    }

    #[test]
    fn identity_requires_authenticated_flag() {
        let me: Identity = serde_json::from_str(r#"{"authenticated": true, "user": {"id": 42}}"#).unwrap();
        assert_eq!(me.user_id(), Some("42"));
        let stale: Identity = serde_json::from_str(r#"{"authenticated": false, "user": {"id": "u1"}}"#).unwrap();
        assert_eq!(stale.user_id(), None);
        assert_eq!(Identity::anonymous().user_id(), None);
    }

    #[test]
    fn stream_request_omits_missing_interaction_id() {
        let req = StreamRequest {
            user_id: "u1".into(),
            exercise_id: "e1".into(),
            interaction_id: None,
            user_message: "hola".into(),
            llm_mode: Some("upv".into()),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["userId"], "u1");
        assert_eq!(v["userMessage"], "hola");
        assert!(v.get("interaccionId").is_none());
    }
}
