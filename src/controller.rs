//! Session controller for one tutoring chat.
//!
//! Owns the visible transcript of the open conversation, drives the streamed
//! reply of each user message and keeps the open exercise / interaction in
//! agreement with the address and the persisted resume pointers.
//!
//! At most one exchange is live at a time. Every exchange carries a
//! generation number and a cancellation token; state updates coming from the
//! stream are applied only while both are still current, and both are checked
//! under the same lock that cancellation takes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::{ChatTransport, ConversationStore, ExerciseCatalog, HttpBackend, IdentityProvider, ResultRecorder};
use crate::catalog::{SidebarEntry, sidebar_entries};
use crate::error::{ClientError, Result};
use crate::navigation::{Location, Navigator, replace_if_changed};
use crate::protocol::{Frame, FrameDecoder, contains_finish_token, display_text};
use crate::session::{ChatMessage, Conversation, Exercise, Interaction, ResultRecord, Role, StreamRequest};
use crate::storage::{CURRENT_EXERCISE_KEY, CURRENT_INTERACTION_KEY, SessionStore};

pub const STREAM_ERROR_TEXT: &str = "Error: could not reach the tutor.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Request sent, nothing received yet.
    AwaitingFirstToken,
    Streaming,
    /// Stream over; address update and result recording in progress.
    Completing,
    /// Last exchange failed. Behaves like `Idle` for new input.
    Error,
}

impl Phase {
    pub fn is_sending(self) -> bool {
        matches!(self, Phase::AwaitingFirstToken | Phase::Streaming | Phase::Completing)
    }

    pub fn is_thinking(self) -> bool {
        self == Phase::AwaitingFirstToken
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchTarget {
    Interaction(String),
    Exercise(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed { interaction_id: Option<String>, finished: bool },
    Failed(String),
    Cancelled,
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub user_id: Option<String>,
    pub exercise_id: Option<String>,
    pub interaction_id: Option<String>,
    pub transcript: Vec<ChatMessage>,
    pub phase: Phase,
    /// Bumped whenever the transcript is replaced wholesale.
    pub epoch: u64,
}

#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub catalog: Arc<dyn ExerciseCatalog>,
    pub conversations: Arc<dyn ConversationStore>,
    pub results: Arc<dyn ResultRecorder>,
    pub transport: Arc<dyn ChatTransport>,
    pub store: Arc<dyn SessionStore>,
    pub navigator: Arc<dyn Navigator>,
}

impl Collaborators {
    pub fn over_http(backend: Arc<HttpBackend>, store: Arc<dyn SessionStore>, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            identity: backend.clone(),
            catalog: backend.clone(),
            conversations: backend.clone(),
            results: backend.clone(),
            transport: backend,
            store,
            navigator,
        }
    }
}

struct ActiveExchange {
    generation: u64,
    token: CancellationToken,
}

struct State {
    user_id: Option<String>,
    exercises: Vec<Exercise>,
    interaction: Interaction,
    phase: Phase,
    generation: u64,
    epoch: u64,
    active: Option<ActiveExchange>,
}

impl State {
    fn cancel_active(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                tracing::debug!(generation = active.generation, "cancelling in-flight exchange");
                active.token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    fn knows_exercise(&self, id: &str) -> bool {
        self.exercises.iter().any(|e| e.id == id)
    }

    /// Stops whatever is running and starts an empty transcript.
    fn reset_to(&mut self, exercise_id: Option<String>) {
        self.cancel_active();
        self.generation += 1;
        self.phase = Phase::Idle;
        self.interaction = Interaction::new(exercise_id);
        self.epoch += 1;
    }

    fn load(&mut self, conversation: Conversation, requested_id: &str) {
        let mut interaction = Interaction::from_conversation(conversation);
        if interaction.id.is_none() {
            interaction.id = Some(requested_id.to_string());
        }
        if !interaction.exercise_id.as_deref().is_some_and(|id| self.knows_exercise(id)) {
            interaction.exercise_id = self.interaction.exercise_id.clone();
        }
        self.interaction = interaction;
        self.phase = Phase::Idle;
        self.epoch += 1;
    }
}

/// Per-send bookkeeping that lives only inside `send_message`.
struct Exchange {
    generation: u64,
    token: CancellationToken,
    user_id: String,
    exercise_id: String,
    previous_id: Option<String>,
    assigned_id: Option<String>,
    /// Transcript epoch and position of this exchange's assistant reply.
    epoch: u64,
    reply_index: usize,
    raw: String,
}

enum StreamEnd {
    Finished,
    Failed(String),
    Cancelled,
    Stalled,
}

struct Inner {
    deps: Collaborators,
    idle_timeout: Duration,
    state: Mutex<State>,
    changes: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct ChatController {
    inner: Arc<Inner>,
}

impl ChatController {
    pub fn new(deps: Collaborators, idle_timeout: Duration) -> Self {
        let (changes, _) = watch::channel(0);
        let state = State {
            user_id: None,
            exercises: Vec::new(),
            interaction: Interaction::new(None),
            phase: Phase::Idle,
            generation: 0,
            epoch: 0,
            active: None,
        };
        Self { inner: Arc::new(Inner { deps, idle_timeout, state: Mutex::new(state), changes }) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let out = {
            let mut st = self.lock();
            f(&mut st)
        };
        self.inner.changes.send_modify(|v| *v = v.wrapping_add(1));
        out
    }

    fn navigator(&self) -> &dyn Navigator {
        self.inner.deps.navigator.as_ref()
    }

    /// Ticks on every state change; pair with `snapshot()`.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        let st = self.lock();
        Snapshot {
            user_id: st.user_id.clone(),
            exercise_id: st.interaction.exercise_id.clone(),
            interaction_id: st.interaction.id.clone(),
            transcript: st.interaction.transcript.clone(),
            phase: st.phase,
            epoch: st.epoch,
        }
    }

    pub fn exercises(&self) -> Vec<Exercise> {
        self.lock().exercises.clone()
    }

    pub fn current_exercise(&self) -> Option<Exercise> {
        let st = self.lock();
        let id = st.interaction.exercise_id.as_deref()?;
        st.exercises.iter().find(|e| e.id == id).cloned()
    }

    /// Resolves the user and the catalog, then reopens whatever the address or
    /// the persisted pointers say was open last.
    pub async fn initialize(&self) -> Result<Snapshot> {
        let identity = self.inner.deps.identity.current_user().await;
        let user_id = identity.user_id().map(str::to_string);
        if user_id.is_none() {
            tracing::info!("no active session, sending is disabled until login");
        }
        let exercises = self.inner.deps.catalog.list_exercises().await?;
        tracing::debug!(exercises = exercises.len(), "catalog loaded");
        self.update(|st| {
            st.user_id = user_id;
            st.exercises = exercises;
        });

        let location = self.navigator().current();
        let store = &self.inner.deps.store;
        let stored_interaction = store.get(CURRENT_INTERACTION_KEY).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not read persisted interaction pointer");
            None
        });
        let stored_exercise = store.get(CURRENT_EXERCISE_KEY).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not read persisted exercise pointer");
            None
        });

        if let Some(iid) = location.interaction_id() {
            match self.restore(iid).await {
                Ok(()) => {
                    self.sync_identity(true).await;
                    return Ok(self.snapshot());
                }
                Err(e) => tracing::warn!(interaction_id = %iid, error = %e, "could not reopen conversation from address"),
            }
        } else if let Some(iid) = stored_interaction.as_deref() {
            match self.restore(iid).await {
                Ok(()) => {
                    self.sync_identity(true).await;
                    return Ok(self.snapshot());
                }
                Err(e) => {
                    tracing::warn!(interaction_id = %iid, error = %e, "dropping stale interaction pointer");
                    if let Err(e) = store.clear(CURRENT_INTERACTION_KEY).await {
                        tracing::warn!(error = %e, "could not clear interaction pointer");
                    }
                }
            }
        }

        self.update(|st| {
            let pick = [location.exercise_id(), stored_exercise.as_deref()]
                .into_iter()
                .flatten()
                .find(|id| st.knows_exercise(id))
                .map(str::to_string)
                .or_else(|| st.exercises.first().map(|e| e.id.clone()));
            st.reset_to(pick);
        });
        self.sync_identity(true).await;
        Ok(self.snapshot())
    }

    async fn restore(&self, id: &str) -> Result<()> {
        let conversation = self.inner.deps.conversations.get_conversation(id).await?;
        self.update(|st| st.load(conversation, id));
        Ok(())
    }

    /// Sends one user message and drives its streamed reply to the end.
    ///
    /// Resolves once the stream has finished, failed, stalled or been
    /// cancelled. Whatever happens, the controller is no longer sending when
    /// this returns (or when the future is dropped).
    pub async fn send_message(&self, text: &str) -> Result<ExchangeOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }

        let (request, mut exchange) = self.update(|st| -> Result<_> {
            if st.phase.is_sending() {
                return Err(ClientError::Busy);
            }
            let user_id = st.user_id.clone().ok_or(ClientError::Unauthenticated)?;
            let exercise_id = st
                .interaction
                .exercise_id
                .clone()
                .filter(|id| st.knows_exercise(id))
                .ok_or(ClientError::NoExercise)?;

            st.cancel_active();
            st.generation += 1;
            let token = CancellationToken::new();
            st.active = Some(ActiveExchange { generation: st.generation, token: token.clone() });
            st.interaction.transcript.push(ChatMessage::user(text));
            st.interaction.transcript.push(ChatMessage::assistant(""));
            let reply_index = st.interaction.transcript.len() - 1;
            st.interaction.touch();
            st.phase = Phase::AwaitingFirstToken;

            let request = StreamRequest {
                user_id: user_id.clone(),
                exercise_id: exercise_id.clone(),
                interaction_id: st.interaction.id.clone(),
                user_message: text.to_string(),
                llm_mode: None,
            };
            let exchange = Exchange {
                generation: st.generation,
                token,
                user_id,
                exercise_id,
                previous_id: st.interaction.id.clone(),
                assigned_id: None,
                epoch: st.epoch,
                reply_index,
                raw: String::new(),
            };
            Ok((request, exchange))
        })?;

        let _guard = ExchangeGuard { controller: self.clone(), generation: exchange.generation };
        metrics::counter!("tutor_client_streams_started").increment(1);
        tracing::info!(
            exercise_id = %exchange.exercise_id,
            interaction_id = ?request.interaction_id,
            generation = exchange.generation,
            "sending message"
        );

        let end = self.stream_reply(&request, &mut exchange).await;
        Ok(self.settle(end, &exchange).await)
    }

    async fn stream_reply(&self, request: &StreamRequest, ex: &mut Exchange) -> StreamEnd {
        let token = ex.token.clone();
        let idle = self.inner.idle_timeout;

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return StreamEnd::Cancelled,
            opened = tokio::time::timeout(idle, self.inner.deps.transport.open_stream(request)) => opened,
        };
        let mut stream = match opened {
            Err(_) => return StreamEnd::Stalled,
            Ok(Err(e)) => return StreamEnd::Failed(e.to_string()),
            Ok(Ok(stream)) => stream,
        };

        let mut decoder = FrameDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return StreamEnd::Cancelled,
                next = tokio::time::timeout(idle, stream.next()) => next,
            };
            let (frames, ended) = match next {
                Err(_) => return StreamEnd::Stalled,
                Ok(None) => {
                    if !decoder.buffered().is_empty() {
                        tracing::debug!(generation = ex.generation, "body ended inside a frame, flushing it");
                    }
                    (decoder.finish(), true)
                }
                Ok(Some(Err(e))) => return StreamEnd::Failed(e.to_string()),
                Ok(Some(Ok(bytes))) => (decoder.push(&bytes), false),
            };

            for frame in frames {
                match frame {
                    Frame::Done => return StreamEnd::Finished,
                    Frame::Error(message) => return StreamEnd::Failed(message),
                    Frame::InteractionId(id) => {
                        if ex.assigned_id.is_some() {
                            continue;
                        }
                        if !self.adopt_interaction_id(ex, id) {
                            return StreamEnd::Cancelled;
                        }
                        // pointer only; the address waits for the end of the stream
                        self.sync_identity(false).await;
                    }
                    Frame::Chunk(piece) => {
                        let applied_len = ex.raw.len();
                        ex.raw.push_str(&piece);
                        if !self.apply_chunk(ex) {
                            ex.raw.truncate(applied_len);
                            return StreamEnd::Cancelled;
                        }
                    }
                }
            }
            if ended {
                return StreamEnd::Finished;
            }
        }
    }

    fn adopt_interaction_id(&self, ex: &mut Exchange, id: String) -> bool {
        let adopted = self.update(|st| {
            if !st.is_current(ex.generation) || ex.token.is_cancelled() {
                return false;
            }
            st.interaction.id = Some(id.clone());
            true
        });
        if adopted {
            tracing::debug!(interaction_id = %id, generation = ex.generation, "interaction id assigned");
            ex.assigned_id = Some(id);
        }
        adopted
    }

    fn apply_chunk(&self, ex: &Exchange) -> bool {
        let shown = display_text(&ex.raw, true);
        self.update(|st| {
            if !st.is_current(ex.generation) || ex.token.is_cancelled() {
                return false;
            }
            set_reply(&mut st.interaction.transcript, shown);
            st.phase = Phase::Streaming;
            true
        })
    }

    async fn settle(&self, end: StreamEnd, ex: &Exchange) -> ExchangeOutcome {
        match end {
            StreamEnd::Finished => self.complete(ex).await,
            StreamEnd::Failed(_) if ex.token.is_cancelled() => self.cancelled(ex),
            StreamEnd::Failed(message) => self.fail(ex, message).await,
            StreamEnd::Cancelled => self.cancelled(ex),
            StreamEnd::Stalled => {
                ex.token.cancel();
                metrics::counter!("tutor_client_streams_stalled").increment(1);
                tracing::warn!(
                    generation = ex.generation,
                    idle_secs = self.inner.idle_timeout.as_secs(),
                    "stream stalled, aborting"
                );
                self.reveal_partial(ex);
                ExchangeOutcome::Stalled
            }
        }
    }

    async fn complete(&self, ex: &Exchange) -> ExchangeOutcome {
        let final_text = display_text(&ex.raw, false);
        let current = self.update(|st| {
            if !st.is_current(ex.generation) || ex.token.is_cancelled() {
                return None;
            }
            place_reply(&mut st.interaction.transcript, ex.reply_index, final_text);
            st.interaction.touch();
            st.phase = Phase::Completing;
            Some(st.interaction.id.clone())
        });
        let Some(interaction_id) = current else {
            return self.cancelled(ex);
        };
        metrics::counter!("tutor_client_streams_completed").increment(1);

        if let Some(iid) = interaction_id.as_deref() {
            replace_if_changed(self.navigator(), Location::chat(&ex.exercise_id, Some(iid)));
        }

        let finished = contains_finish_token(&ex.raw);
        if finished {
            match interaction_id.as_deref() {
                Some(iid) => self.finish_exercise(ex, iid).await,
                None => tracing::warn!(exercise_id = %ex.exercise_id, "exercise finished without an interaction id, result not recorded"),
            }
        }
        ExchangeOutcome::Completed { interaction_id, finished }
    }

    async fn finish_exercise(&self, ex: &Exchange, interaction_id: &str) {
        let record = ResultRecord {
            user_id: ex.user_id.clone(),
            exercise_id: ex.exercise_id.clone(),
            interaction_id: interaction_id.to_string(),
            first_attempt: false,
        };
        match self.inner.deps.results.record_result(&record).await {
            Ok(()) => tracing::info!(exercise_id = %ex.exercise_id, interaction_id, "exercise completed"),
            Err(e) => tracing::error!(error = %e, interaction_id, "could not record exercise result"),
        }
        self.navigator().replace(Location::dashboard());
    }

    async fn fail(&self, ex: &Exchange, message: String) -> ExchangeOutcome {
        metrics::counter!("tutor_client_streams_failed").increment(1);
        tracing::error!(error = %message, generation = ex.generation, "stream error");
        let received = display_text(&ex.raw, false);
        let reverted = self.update(|st| {
            if !st.is_current(ex.generation) {
                return false;
            }
            let text = if received.is_empty() { STREAM_ERROR_TEXT.to_string() } else { received };
            place_reply(&mut st.interaction.transcript, ex.reply_index, text);
            st.phase = Phase::Error;
            if ex.assigned_id.is_some() {
                st.interaction.id = ex.previous_id.clone();
                return true;
            }
            false
        });
        if reverted {
            self.sync_identity(false).await;
        }
        ExchangeOutcome::Failed(message)
    }

    fn cancelled(&self, ex: &Exchange) -> ExchangeOutcome {
        metrics::counter!("tutor_client_streams_aborted").increment(1);
        tracing::debug!(generation = ex.generation, "exchange cancelled");
        self.reveal_partial(ex);
        ExchangeOutcome::Cancelled
    }

    /// Shows everything received before an abort, including a held-back
    /// prefix of the finish token. Nothing is touched once the transcript
    /// has been replaced.
    fn reveal_partial(&self, ex: &Exchange) {
        let text = display_text(&ex.raw, false);
        self.update(|st| {
            if st.epoch == ex.epoch {
                place_reply(&mut st.interaction.transcript, ex.reply_index, text);
            }
        });
    }

    /// Cancels the in-flight exchange, if any. Text received so far stays and
    /// no error is shown.
    pub fn cancel(&self) {
        self.update(|st| {
            if st.cancel_active() {
                st.generation += 1;
                st.phase = Phase::Idle;
            }
        });
    }

    pub async fn switch_to(&self, target: SwitchTarget) -> Result<()> {
        match target {
            SwitchTarget::Exercise(exercise_id) => {
                let known = self.update(|st| {
                    if !st.knows_exercise(&exercise_id) {
                        return false;
                    }
                    st.reset_to(Some(exercise_id.clone()));
                    true
                });
                if !known {
                    tracing::warn!(%exercise_id, "not in the catalog, keeping the current chat");
                    return Err(ClientError::NoExercise);
                }
                tracing::info!(%exercise_id, "starting new chat");
                self.sync_identity(true).await;
                Ok(())
            }
            SwitchTarget::Interaction(id) => self.open_interaction(&id).await,
        }
    }

    async fn open_interaction(&self, id: &str) -> Result<()> {
        let generation = self.update(|st| {
            st.cancel_active();
            st.generation += 1;
            st.phase = Phase::Idle;
            st.generation
        });

        match self.inner.deps.conversations.get_conversation(id).await {
            Ok(conversation) => {
                let applied = self.update(|st| {
                    if !st.is_current(generation) {
                        return false;
                    }
                    st.load(conversation, id);
                    true
                });
                if applied {
                    tracing::info!(interaction_id = %id, "conversation opened");
                    self.sync_identity(true).await;
                } else {
                    tracing::debug!(interaction_id = %id, "conversation load superseded");
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(interaction_id = %id, error = %e, "could not load conversation");
                self.update(|st| {
                    if st.is_current(generation) {
                        let exercise_id = st.interaction.exercise_id.clone();
                        st.reset_to(exercise_id);
                    }
                });
                self.sync_identity(true).await;
                Err(ClientError::ConversationLoad { id: id.to_string(), message: e.to_string() })
            }
        }
    }

    pub async fn delete_interaction(&self, id: &str) -> Result<()> {
        self.inner.deps.conversations.delete_conversation(id).await?;
        tracing::info!(interaction_id = %id, "conversation deleted");
        let was_open = self.update(|st| {
            if st.interaction.id.as_deref() != Some(id) {
                return false;
            }
            let exercise_id = st.interaction.exercise_id.clone();
            st.reset_to(exercise_id);
            true
        });
        if was_open {
            self.sync_identity(true).await;
        }
        Ok(())
    }

    /// The user's past conversations joined with the catalog.
    pub async fn sidebar(&self) -> Result<Vec<SidebarEntry>> {
        let (user_id, exercises) = {
            let st = self.lock();
            (st.user_id.clone(), st.exercises.clone())
        };
        let Some(user_id) = user_id else {
            return Ok(Vec::new());
        };
        let summaries = self.inner.deps.conversations.list_conversations(&user_id).await?;
        Ok(sidebar_entries(&summaries, &exercises))
    }

    async fn persist_pointers(&self, exercise_id: Option<&str>, interaction_id: Option<&str>) -> Result<()> {
        let store = &self.inner.deps.store;
        if let Some(id) = exercise_id {
            store.set(CURRENT_EXERCISE_KEY, id).await?;
        }
        match interaction_id {
            Some(id) => store.set(CURRENT_INTERACTION_KEY, id).await,
            None => store.clear(CURRENT_INTERACTION_KEY).await,
        }
    }

    /// Mirrors the open exercise / interaction into the persisted pointers and,
    /// when `navigate` is set, into the address.
    async fn sync_identity(&self, navigate: bool) {
        let (exercise_id, interaction_id) = {
            let st = self.lock();
            (st.interaction.exercise_id.clone(), st.interaction.id.clone())
        };

        if let Err(e) = self.persist_pointers(exercise_id.as_deref(), interaction_id.as_deref()).await {
            tracing::warn!(error = %e, "could not persist session pointers");
        }

        if navigate {
            if let Some(exercise_id) = exercise_id {
                replace_if_changed(self.navigator(), Location::chat(&exercise_id, interaction_id.as_deref()));
            }
        }
    }
}

fn set_reply(transcript: &mut Vec<ChatMessage>, text: String) {
    match transcript.last_mut() {
        Some(last) if last.role == Role::Assistant => last.content = text,
        _ => transcript.push(ChatMessage::assistant(text)),
    }
}

/// Final text of one exchange's reply slot. An empty reply removes the
/// placeholder when it is still the last message.
fn place_reply(transcript: &mut Vec<ChatMessage>, index: usize, text: String) {
    if !transcript.get(index).is_some_and(|m| m.role == Role::Assistant) {
        return;
    }
    if !text.is_empty() {
        transcript[index].content = text;
    } else if transcript[index].content.is_empty() && index + 1 == transcript.len() {
        transcript.remove(index);
    }
}

/// Leaves the sending phases when `send_message` returns or is dropped.
struct ExchangeGuard {
    controller: ChatController,
    generation: u64,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        let generation = self.generation;
        self.controller.update(|st| {
            if !st.is_current(generation) {
                return;
            }
            if st.active.as_ref().is_some_and(|a| a.generation == generation) {
                st.cancel_active();
            }
            if st.phase.is_sending() {
                st.phase = Phase::Idle;
            }
        });
    }
}
