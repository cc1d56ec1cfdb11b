use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

mod backend;
mod catalog;
mod controller;
mod error;
mod navigation;
mod protocol;
mod repl;
mod server;
mod session;
mod settings;
mod storage;

use backend::{ConversationStore, ExerciseCatalog, HttpBackend, IdentityProvider};
use catalog::{ExerciseFilter, filter_exercises, quick_search, sort_exercises};
use controller::{ChatController, Collaborators};
use navigation::{CHAT_PATH, EXERCISE_PARAM, HistoryNavigator, INTERACTION_PARAM, Location, Navigator};
use settings::{ClientSettings, resolve_effective_settings};
use storage::{DEMO_KEY, SESSION_COOKIE_KEY, SessionStore, SqliteSessionStore};

#[derive(Debug, Parser)]
#[command(name = "tutor_client")]
#[command(about = "Terminal client for the Socratic tutoring chat", long_about = None)]
struct Cli {
    /// Backend root, e.g. http://127.0.0.1:7171
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// SQLite URL of the local session store
    #[arg(long, global = true)]
    store: Option<String>,
    /// Abort a reply after this many seconds without data
    #[arg(long, global = true)]
    idle_timeout_secs: Option<u64>,
    #[arg(long, global = true)]
    llm_mode: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a demo session
    Login {
        /// Reuse the demo user bound to this key
        #[arg(long)]
        demo_key: Option<String>,
    },
    Logout,
    Whoami,
    /// List the exercise catalog
    Exercises {
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long = "concept")]
        concepts: Vec<String>,
        #[arg(long, default_value_t = 0)]
        level: u8,
    },
    /// Past conversations of the logged-in user
    History,
    /// Chat with the tutor
    Chat {
        /// Exercise to open
        #[arg(long)]
        id: Option<String>,
        /// Past conversation to reopen
        #[arg(long)]
        interaction_id: Option<String>,
        /// Start from a saved address such as `/interacciones?id=e1&interactionId=i1`
        #[arg(long, conflicts_with_all = ["id", "interaction_id"])]
        address: Option<String>,
    },
    /// Run the in-memory backend
    DemoBackend {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
    },
}

async fn persist_cookies(backend: &HttpBackend, store: &dyn SessionStore) -> anyhow::Result<()> {
    match backend.cookies() {
        Some(cookies) => store.set(SESSION_COOKIE_KEY, &cookies).await?,
        None => store.clear(SESSION_COOKIE_KEY).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let overrides = ClientSettings {
        base_url: cli.base_url,
        store_url: cli.store,
        idle_timeout_secs: cli.idle_timeout_secs,
        llm_mode: cli.llm_mode,
    };
    let settings = resolve_effective_settings(&ClientSettings::from_env(), &overrides);

    if let Commands::DemoBackend { listen } = &cli.command {
        let addr: SocketAddr = listen.parse()?;
        server::serve(addr, server::AppState::demo()).await?;
        return Ok(());
    }

    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::initialize(settings.store_url.clone()).await?);
    let cookies = store.get(SESSION_COOKIE_KEY).await?;
    let backend = Arc::new(HttpBackend::new(&settings.base_url, &settings.llm_mode, cookies.as_deref())?);
    tracing::debug!(base_url = %backend.base_url(), llm_mode = %settings.llm_mode, "client ready");

    match cli.command {
        Commands::Login { demo_key } => {
            let key = match demo_key {
                Some(k) => k,
                None => match store.get(DEMO_KEY).await? {
                    Some(k) => k,
                    None => Uuid::new_v4().simple().to_string(),
                },
            };
            store.set(DEMO_KEY, &key).await?;
            let me = backend.demo_login(&key).await?;
            persist_cookies(&backend, store.as_ref()).await?;
            println!("logged in as {}", me.user_id().unwrap_or("?"));
        }
        Commands::Logout => {
            if let Err(e) = backend.logout().await {
                tracing::warn!(error = %e, "server logout failed, clearing local session anyway");
            }
            storage::clear_session(store.as_ref()).await?;
            println!("logged out");
            return Ok(());
        }
        Commands::Whoami => match backend.current_user().await.user_id() {
            Some(id) => println!("{}", id),
            None => println!("not logged in"),
        },
        Commands::Exercises { query, subject, concepts, level } => {
            let all = backend.list_exercises().await?;
            let searched: Vec<_> = quick_search(&all, query.as_deref().unwrap_or_default()).into_iter().cloned().collect();
            let filter = ExerciseFilter { subject, concepts, level };
            let mut shown = filter_exercises(&searched, &filter);
            sort_exercises(&mut shown);
            for e in shown {
                println!("{}  {} ({}, {}, level {})", e.id, e.title, e.subject, e.concept, e.level);
            }
        }
        Commands::History => {
            let Some(user_id) = backend.current_user().await.user_id().map(str::to_string) else {
                return Err(error::ClientError::Unauthenticated.into());
            };
            let exercises = backend.list_exercises().await?;
            let summaries = backend.list_conversations(&user_id).await?;
            for row in catalog::sidebar_entries(&summaries, &exercises) {
                let level = row.level.map(|l| l.to_string()).unwrap_or_else(|| "-".into());
                println!("{}  {} [{}, level {}]", row.id, row.title, row.concept, level);
            }
        }
        Commands::Chat { id, interaction_id, address } => {
            let start = match address {
                Some(address) => Location::parse(&address)?,
                None => {
                    let mut start = Location::new(CHAT_PATH);
                    if let Some(id) = &id {
                        start = start.with_param(EXERCISE_PARAM, id);
                    }
                    if let Some(iid) = &interaction_id {
                        start = start.with_param(INTERACTION_PARAM, iid);
                    }
                    start
                }
            };
            let navigator = Arc::new(HistoryNavigator::new(start));
            let deps = Collaborators::over_http(backend.clone(), store.clone(), navigator.clone());
            let controller = ChatController::new(deps, settings.idle_timeout);
            let snap = controller.initialize().await?;
            if snap.user_id.is_none() {
                println!("not logged in: run `tutor_client login` to chat");
            }
            repl::run(controller).await?;
            tracing::debug!(
                location = %navigator.current(),
                navigations = navigator.replacements().len(),
                "chat closed"
            );
        }
        Commands::DemoBackend { .. } => {}
    }

    persist_cookies(&backend, store.as_ref()).await?;
    Ok(())
}
