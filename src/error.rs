use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no active session, log in again (demo or CAS)")]
    Unauthenticated,

    #[error("message is empty")]
    EmptyMessage,

    #[error("a message is still being answered")]
    Busy,

    #[error("no exercise selected")]
    NoExercise,

    #[error("not a usable id: {0:?}")]
    InvalidId(String),

    /// Non-2xx answer from the backend; `body` is whatever text came with it.
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("could not load conversation {id}: {message}")]
    ConversationLoad { id: String, message: String },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
