//! In-memory tutoring backend for local runs and end-to-end tests.
//!
//! Serves the same routes the chat client talks to: cookie sessions through
//! demo login, the exercise catalog, stored conversations, result recording
//! and the streamed chat endpoint. The tutor replies are canned.

use std::collections::HashMap;
use std::convert::Infallible;
use std::{net::SocketAddr, sync::Arc};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::LLM_MODE_HEADER;
use crate::protocol::{DONE_SENTINEL, FINISH_TOKEN, strip_finish_token};
use crate::session::{ChatMessage, Conversation, ConversationSummary, Exercise, Identity, ResultRecord, Role, StreamRequest, User};

pub const SESSION_COOKIE: &str = "tutor_session";

struct StoredConversation {
    user_id: String,
    conversation: Conversation,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StoredConversation {
    fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.conversation.id.clone(),
            exercise_id: self.conversation.exercise_id.clone(),
            created_at: Some(self.created_at),
            updated_at: Some(self.updated_at),
        }
    }
}

#[derive(Default)]
struct DemoData {
    exercises: Vec<Exercise>,
    conversations: Vec<StoredConversation>,
    /// session token -> user id
    sessions: HashMap<String, String>,
    /// demo key -> user id
    demo_users: HashMap<String, String>,
    results: Vec<ResultRecord>,
}

#[derive(Clone, Default)]
pub struct AppState {
    data: Arc<RwLock<DemoData>>,
}

impl AppState {
    pub fn with_exercises(exercises: Vec<Exercise>) -> Self {
        let data = DemoData { exercises, ..Default::default() };
        Self { data: Arc::new(RwLock::new(data)) }
    }

    /// A small electrical-circuits catalog.
    pub fn demo() -> Self {
        let exercise = |id: &str, title: &str, concept: &str, level: u8, statement: &str| Exercise {
            id: id.into(),
            title: title.into(),
            subject: "Circuitos".into(),
            concept: concept.into(),
            level,
            statement: statement.into(),
            image: None,
        };
        Self::with_exercises(vec![
            exercise("ex-ohm", "Ley de Ohm", "resistencia", 1, "A 10 V source drives a 5 ohm resistor. What current flows?"),
            exercise("ex-divider", "Divisor de tension", "tension", 2, "Two 1 kohm resistors in series across 12 V. What is the voltage at the midpoint?"),
            exercise("ex-kirchhoff", "Leyes de Kirchhoff", "kirchhoff", 3, "Three branches meet at a node carrying 2 A, 3 A and I. Find I."),
        ])
    }

    pub async fn results(&self) -> Vec<ResultRecord> {
        self.data.read().await.results.clone()
    }
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

async fn session_user(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let token = session_token(headers)?;
    state.data.read().await.sessions.get(&token).cloned()
}

async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<String, StatusCode> {
    session_user(state, headers).await.ok_or(StatusCode::UNAUTHORIZED)
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Json<Identity> {
    let identity = match session_user(&state, &headers).await {
        Some(id) => Identity { authenticated: true, user: Some(User { id }) },
        None => Identity::anonymous(),
    };
    Json(identity)
}

#[derive(Debug, Deserialize)]
struct DevLoginBody {
    #[serde(rename = "demoKey", default)]
    demo_key: Option<String>,
}

async fn dev_login(State(state): State<AppState>, Json(body): Json<DevLoginBody>) -> impl IntoResponse {
    let token = Uuid::new_v4().simple().to_string();
    let mut data = state.data.write().await;
    let user_id = match body.demo_key.filter(|k| !k.is_empty()) {
        Some(key) => data
            .demo_users
            .entry(key)
            .or_insert_with(|| format!("demo-{}", Uuid::new_v4().simple()))
            .clone(),
        None => format!("demo-{}", Uuid::new_v4().simple()),
    };
    data.sessions.insert(token.clone(), user_id.clone());
    tracing::info!(%user_id, "demo login");

    let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, token);
    let identity = Identity { authenticated: true, user: Some(User { id: user_id }) };
    ([(SET_COOKIE, cookie)], Json(identity))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = session_token(&headers) {
        if let Some(user_id) = state.data.write().await.sessions.remove(&token) {
            tracing::info!(%user_id, "logout");
        }
    }
    let cookie = format!("{}=; Path=/; Max-Age=0", SESSION_COOKIE);
    ([(SET_COOKIE, cookie)], Json(json!({ "ok": true })))
}

async fn list_exercises(State(state): State<AppState>) -> Json<Vec<Exercise>> {
    Json(state.data.read().await.exercises.clone())
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ConversationSummary>>, StatusCode> {
    let caller = require_user(&state, &headers).await?;
    if caller != user_id {
        return Err(StatusCode::FORBIDDEN);
    }
    let data = state.data.read().await;
    let mut rows: Vec<_> = data.conversations.iter().filter(|c| c.user_id == user_id).collect();
    rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(Json(rows.into_iter().map(StoredConversation::summary).collect()))
}

async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, StatusCode> {
    let caller = require_user(&state, &headers).await?;
    let data = state.data.read().await;
    data.conversations
        .iter()
        .find(|c| c.conversation.id == id && c.user_id == caller)
        .map(|c| Json(c.conversation.clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let caller = require_user(&state, &headers).await?;
    let mut data = state.data.write().await;
    let before = data.conversations.len();
    data.conversations.retain(|c| !(c.conversation.id == id && c.user_id == caller));
    if data.conversations.len() == before {
        return Err(StatusCode::NOT_FOUND);
    }
    tracing::info!(interaction_id = %id, "conversation deleted");
    Ok(Json(json!({ "ok": true })))
}

async fn finalize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(record): Json<ResultRecord>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let caller = require_user(&state, &headers).await?;
    if caller != record.user_id {
        return Err(StatusCode::FORBIDDEN);
    }
    tracing::info!(exercise_id = %record.exercise_id, interaction_id = %record.interaction_id, "result recorded");
    state.data.write().await.results.push(record);
    Ok(Json(json!({ "ok": true })))
}

fn solved(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("solution") || m.contains("solucion") || m.contains("solución")
}

fn tutor_reply(exercise: &Exercise, message: &str, turn: usize) -> String {
    if solved(message) {
        return format!("Well done, that solves \"{}\". {}", exercise.title, FINISH_TOKEN);
    }
    if turn == 0 {
        return format!("Let's work on \"{}\". {} Which quantity do you know already?", exercise.title, exercise.statement);
    }
    format!("Good. How does {} relate to what you wrote: \"{}\"?", exercise.concept, message.trim())
}

fn data_frame(payload: serde_json::Value) -> String {
    format!("data: {}\n\n", payload)
}

async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StreamRequest>,
) -> Result<Response, StatusCode> {
    let caller = require_user(&state, &headers).await?;
    if caller != req.user_id {
        return Err(StatusCode::FORBIDDEN);
    }
    let mode = headers.get(LLM_MODE_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("upv");
    tracing::debug!(exercise_id = %req.exercise_id, llm_mode = mode, "chat stream");

    let mut frames = Vec::new();
    {
        let mut data = state.data.write().await;
        let exercise = data.exercises.iter().find(|e| e.id == req.exercise_id).cloned();
        match exercise {
            None => frames.push(data_frame(json!({ "error": format!("unknown exercise {}", req.exercise_id) }))),
            Some(exercise) => {
                let existing = req.interaction_id.as_deref().and_then(|iid| {
                    data.conversations
                        .iter()
                        .position(|c| c.conversation.id == iid && c.user_id == caller)
                });
                let idx = match existing {
                    Some(idx) => idx,
                    None => {
                        let now = Utc::now();
                        let id = Uuid::new_v4().simple().to_string();
                        frames.push(data_frame(json!({ "interaccionId": id })));
                        data.conversations.push(StoredConversation {
                            user_id: caller.clone(),
                            conversation: Conversation { id, exercise_id: exercise.id.clone(), transcript: Vec::new() },
                            created_at: now,
                            updated_at: now,
                        });
                        data.conversations.len() - 1
                    }
                };

                let stored = &mut data.conversations[idx];
                let turn = stored.conversation.transcript.iter().filter(|m| m.role == Role::Assistant).count();
                let reply = tutor_reply(&exercise, &req.user_message, turn);
                stored.conversation.transcript.push(ChatMessage::user(req.user_message.clone()));
                stored.conversation.transcript.push(ChatMessage::assistant(strip_finish_token(&reply).trim_end()));
                stored.updated_at = Utc::now();

                frames.extend(reply.split_inclusive(' ').map(|piece| data_frame(json!({ "chunk": piece }))));
            }
        }
    }
    frames.push(format!("data: {}\n\n", DONE_SENTINEL));

    let body = Body::from_stream(futures_util::stream::iter(frames.into_iter().map(Ok::<_, Infallible>)));
    Ok(([(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")], body).into_response())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/me", get(me))
        .route("/api/auth/dev-login", post(dev_login))
        .route("/api/auth/logout", get(logout))
        .route("/api/ejercicios", get(list_exercises))
        .route("/api/interacciones/user/:user_id", get(list_conversations))
        .route("/api/interacciones/:id", get(get_conversation).delete(delete_conversation))
        .route("/api/resultados/finalizar", post(finalize))
        .route("/api/ollama/chat/stream", post(chat_stream))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "demo backend listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatTransport, ConversationStore, ExerciseCatalog, HttpBackend, IdentityProvider};
    use crate::controller::{ChatController, Collaborators, ExchangeOutcome};
    use crate::error::ClientError;
    use crate::navigation::{HistoryNavigator, Location, Navigator};
    use crate::storage::MemorySessionStore;
    use std::time::Duration;

    async fn spawn(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "theme=dark; tutor_session=abc".parse().unwrap());
        assert_eq!(session_token(&headers).as_deref(), Some("abc"));
        assert_eq!(session_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn demo_login_sets_a_session_cookie_and_logout_drops_it() {
        let base = spawn(AppState::demo()).await;
        let backend = HttpBackend::new(&base, "upv", None).unwrap();
        assert_eq!(backend.current_user().await.user_id(), None);

        let me = backend.demo_login("key-1").await.unwrap();
        let user_id = me.user_id().unwrap().to_string();
        assert!(backend.cookies().unwrap().contains(SESSION_COOKIE));
        assert_eq!(backend.current_user().await.user_id(), Some(user_id.as_str()));
        assert_eq!(backend.list_exercises().await.unwrap().len(), 3);

        // same demo key, fresh client: same user
        let other = HttpBackend::new(&base, "upv", None).unwrap();
        assert_eq!(other.demo_login("key-1").await.unwrap().user_id(), Some(user_id.as_str()));

        backend.logout().await.unwrap();
        assert_eq!(backend.current_user().await.user_id(), None);
    }

    #[tokio::test]
    async fn saved_cookie_restores_the_session() {
        let base = spawn(AppState::demo()).await;
        let first = HttpBackend::new(&base, "upv", None).unwrap();
        let me = first.demo_login("k").await.unwrap();

        let resumed = HttpBackend::new(&base, "upv", first.cookies().as_deref()).unwrap();
        assert_eq!(resumed.current_user().await, me);
    }

    #[tokio::test]
    async fn stream_without_session_is_refused() {
        let base = spawn(AppState::demo()).await;
        let backend = HttpBackend::new(&base, "upv", None).unwrap();
        let req = StreamRequest {
            user_id: "u1".into(),
            exercise_id: "ex-ohm".into(),
            interaction_id: None,
            user_message: "hola".into(),
            llm_mode: None,
        };
        let err = backend.open_stream(&req).await.err().unwrap();
        assert!(matches!(err, ClientError::Status { status: 401, .. }));
        assert!(matches!(backend.get_conversation("nope").await, Err(ClientError::Status { status: 401, .. })));
    }

    #[tokio::test]
    async fn full_exchange_through_the_controller() {
        let state = AppState::demo();
        let base = spawn(state.clone()).await;
        let backend = Arc::new(HttpBackend::new(&base, "upv", None).unwrap());
        let user_id = backend.demo_login("k").await.unwrap().user_id().unwrap().to_string();

        let nav = Arc::new(HistoryNavigator::new(Location::chat("ex-divider", None)));
        let deps = Collaborators::over_http(backend.clone(), Arc::new(MemorySessionStore::new()), nav.clone());
        let controller = ChatController::new(deps, Duration::from_secs(30));
        let snap = controller.initialize().await.unwrap();
        assert_eq!(snap.user_id.as_deref(), Some(user_id.as_str()));
        assert_eq!(snap.exercise_id.as_deref(), Some("ex-divider"));

        let outcome = controller.send_message("hola").await.unwrap();
        let iid = match outcome {
            ExchangeOutcome::Completed { interaction_id: Some(iid), finished: false } => iid,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(nav.current(), Location::chat("ex-divider", Some(iid.as_str())));
        let reply = controller.snapshot().transcript[1].content.clone();
        assert!(reply.starts_with("Let's work on \"Divisor de tension\""));

        let outcome = controller.send_message("my solution: 6 V").await.unwrap();
        assert_eq!(outcome, ExchangeOutcome::Completed { interaction_id: Some(iid.clone()), finished: true });
        assert_eq!(nav.current(), Location::dashboard());
        let snap = controller.snapshot();
        assert!(!snap.transcript[3].content.contains(FINISH_TOKEN));

        let results = state.results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].interaction_id, iid);
        assert_eq!(results[0].user_id, user_id);
        assert!(!results[0].first_attempt);

        let stored = backend.get_conversation(&iid).await.unwrap();
        assert_eq!(stored.transcript.len(), 4);
        assert_eq!(stored.transcript[3].content, snap.transcript[3].content.trim_end());

        let rows = controller.sidebar().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Divisor de tension");

        controller.delete_interaction(&iid).await.unwrap();
        assert!(controller.sidebar().await.unwrap().is_empty());
        assert!(controller.snapshot().transcript.is_empty());
    }

    #[tokio::test]
    async fn odd_ids_address_only_their_own_conversation() {
        let base = spawn(AppState::demo()).await;
        let backend = HttpBackend::new(&base, "upv", None).unwrap();
        backend.demo_login("k").await.unwrap();

        for id in ["../ejercicios", "abc?x=1", "abc#frag"] {
            assert!(matches!(backend.delete_conversation(id).await, Err(ClientError::Status { status: 404, .. })));
            assert!(matches!(backend.get_conversation(id).await, Err(ClientError::Status { status: 404, .. })));
        }
        assert!(matches!(backend.delete_conversation("..").await, Err(ClientError::InvalidId(_))));
        assert_eq!(backend.list_exercises().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_exercise_comes_back_as_an_error_frame() {
        let state = AppState::with_exercises(Vec::new());
        let base = spawn(state).await;
        let backend = HttpBackend::new(&base, "upv", None).unwrap();
        let user_id = backend.demo_login("k").await.unwrap().user_id().unwrap().to_string();
        let req = StreamRequest {
            user_id,
            exercise_id: "missing".into(),
            interaction_id: None,
            user_message: "hola".into(),
            llm_mode: None,
        };
        let mut stream = backend.open_stream(&req).await.unwrap();
        let mut decoder = crate::protocol::FrameDecoder::new();
        let mut frames = Vec::new();
        while let Some(bytes) = futures_util::StreamExt::next(&mut stream).await {
            frames.extend(decoder.push(&bytes.unwrap()));
        }
        frames.extend(decoder.finish());
        assert_eq!(
            frames,
            vec![crate::protocol::Frame::Error("unknown exercise missing".into()), crate::protocol::Frame::Done]
        );
    }
}
