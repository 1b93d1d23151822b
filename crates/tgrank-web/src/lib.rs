//! Axum + Askama presentation of the ranked channel snapshot.
//!
//! Rendering always succeeds with whatever ranked sequence was computed:
//! the page is served from the SQLite snapshot when a database is
//! reachable, from the latest run report otherwise, and as an empty table
//! when neither exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tgrank_storage::SnapshotStore;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "tgrank-web";

#[derive(Clone)]
pub struct AppState {
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }
}

/// One display row: position, avatar, name+link, category, engagement
/// percentage, subscriber count, citation index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebChannel {
    pub name: String,
    pub url: String,
    pub image: String,
    pub category: String,
    pub er: f64,
    pub subscribers: i64,
    pub ci: i64,
}

#[derive(Debug, Deserialize)]
struct RankingReport {
    channels: Vec<ReportChannel>,
}

#[derive(Debug, Deserialize)]
struct ReportChannel {
    name: String,
    url: String,
    image: String,
    category: String,
    er: f64,
    subscribers: u64,
    ci: u64,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    channels: Vec<WebChannel>,
    total: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/channels", get(channels_json_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TGRANK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::new(".");
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let channels = load_channels(&state.workspace_root).await;
    let total = channels.len();
    render_html(IndexTemplate { channels, total })
}

async fn channels_json_handler(State(state): State<Arc<AppState>>) -> Response {
    let channels = load_channels(&state.workspace_root).await;
    Json(channels).into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {err}")),
        )
            .into_response(),
    }
}

/// Snapshot rows in display order, falling back from database to the latest
/// run report to an empty list. Never errors.
async fn load_channels(workspace_root: &Path) -> Vec<WebChannel> {
    if let Some(rows) = load_channels_from_db().await {
        if !rows.is_empty() {
            return rows;
        }
    }
    load_channels_from_reports(workspace_root).unwrap_or_default()
}

async fn load_channels_from_db() -> Option<Vec<WebChannel>> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    let store = SnapshotStore::connect(&database_url).await.ok()?;
    let rows = store.load_all().await.ok()?;
    Some(
        rows.into_iter()
            .map(|row| WebChannel {
                name: row.name,
                url: row.url,
                image: row.image,
                category: row.category,
                er: row.er,
                subscribers: row.subscribers,
                ci: row.ci,
            })
            .collect(),
    )
}

fn load_channels_from_reports(workspace_root: &Path) -> Option<Vec<WebChannel>> {
    let reports_root = workspace_root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    for dir in dirs {
        let ranking_path = dir.path().join("ranking.json");
        let Ok(text) = std::fs::read_to_string(&ranking_path) else {
            continue;
        };
        let Ok(report) = serde_json::from_str::<RankingReport>(&text) else {
            continue;
        };
        return Some(
            report
                .channels
                .into_iter()
                .map(|c| WebChannel {
                    name: c.name,
                    url: c.url,
                    image: c.image,
                    category: c.category,
                    er: c.er,
                    subscribers: c.subscribers as i64,
                    ci: c.ci as i64,
                })
                .collect(),
        );
    }
    None
}
