use std::sync::Arc;

use rentdesk::backend::RestBackend;
use rentdesk::clock::SystemClock;
use rentdesk::config::AppConfig;
use rentdesk::routes::{Decision, RouteTable};
use rentdesk::store::{FileStore, KeyValueStore};
use rentdesk::SessionStore;
use tracing::Level;

const DEFAULT_LOCATION: &str = "/dashboard";

/// Hydrate the stored session once and print the navigation decision for
/// the location given on the command line.
#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = AppConfig::from_env().expect("invalid configuration");

    let level = if config.environment.is_development() { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let location = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_LOCATION.to_owned());

    let store = FileStore::open(&config.store_path).expect("session store open failed");
    tracing::debug!(path = %store.path().display(), "session store opened");
    let store: Arc<dyn KeyValueStore> = Arc::new(store);
    let backend = RestBackend::new(config.backend.clone(), store.clone()).expect("backend client init failed");
    let sessions = SessionStore::new(Arc::new(backend), store, Arc::new(SystemClock), config.timeouts);

    sessions.init().await;
    let auth = sessions.snapshot();
    let decision = RouteTable::default().guard(&auth, &location);
    match &decision {
        Decision::Render => {
            tracing::info!(%location, user_id = ?auth.user.as_ref().map(|u| u.id.as_str()), "render");
        }
        Decision::Redirect { to, .. } => tracing::info!(%location, %to, "redirect"),
        Decision::Loading => tracing::info!(%location, "still loading"),
    }
    match serde_json::to_string(&decision) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "decision encode failed"),
    }
    sessions.dispose();
}
