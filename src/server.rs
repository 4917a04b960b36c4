//! REST API for fragdb.
//!
//! Provides a JSON server over fragment stores. Each request names its store
//! with a `db` field holding the SQLite file path; the store is opened per
//! request. The `vec_dist` decode cache and counters live in [`AppState`] and
//! are shared by every store the server opens.
//!
//! The server opens any path a client sends, creating missing parent
//! directories, and has no authentication. Bind it to a local address and
//! only expose it to trusted clients.
//!
//! ## Endpoints
//!
//! - `POST /add` - Store fragments with their embedding vectors
//! - `POST /dirty` - Check which fragments need to be embedded again
//! - `POST /search` - Merge the nearest fragments for a list of label limits
//! - `POST /stats` - Cumulative `vec_dist` timings
//!
//! ## Usage
//!
//! ```rust,no_run
//! use actix_web::{web, App, HttpServer};
//! use fragdb::server::AppState;
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let state = AppState::default();
//!     HttpServer::new(move || {
//!         App::new()
//!             .app_data(web::Data::new(state.clone()))
//!             .configure(fragdb::server::config)
//!     })
//!     .bind("127.0.0.1:7878")?
//!     .run()
//!     .await
//! }
//! ```

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::distance::{StatsSnapshot, VecDist};
use crate::error::{Error, Result};
use crate::search::{parse_limits, search};
use crate::store::{Fragment, FragmentStore, DEFAULT_LABEL};
use crate::vector::parse_json_floats;

/// State shared by every request handler.
#[derive(Clone, Default)]
pub struct AppState {
    distance: VecDist,
}

impl AppState {
    pub fn new(distance: VecDist) -> Self {
        Self { distance }
    }

    pub fn distance(&self) -> &VecDist {
        &self.distance
    }

    fn open(&self, path: &str) -> Result<FragmentStore> {
        FragmentStore::open_with(path, self.distance.clone())
    }
}

// --- Request structs ---

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

fn default_limits() -> Vec<String> {
    vec![crate::search::DEFAULT_LIMIT.to_string()]
}

/// A vector given either as numbers or as a JSON array in a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum VectorInput {
    Values(Vec<f64>),
    Text(String),
}

impl VectorInput {
    fn into_values(self) -> Result<Vec<f64>> {
        match self {
            VectorInput::Values(values) => Ok(values),
            VectorInput::Text(text) => Ok(parse_json_floats(&text)?),
        }
    }
}

#[derive(Deserialize)]
struct FragmentEntry {
    #[serde(default = "default_label")]
    label: String,
    name: String,
    content: String,
    model: String,
    vector: VectorInput,
}

#[derive(Deserialize)]
struct AddRequest {
    db: String,
    fragments: Vec<FragmentEntry>,
}

#[derive(Deserialize)]
struct DirtyEntry {
    #[serde(default = "default_label")]
    label: String,
    name: String,
    content: String,
}

#[derive(Deserialize)]
struct DirtyRequest {
    db: String,
    fragments: Vec<DirtyEntry>,
}

#[derive(Deserialize)]
struct SearchRequest {
    db: String,
    vector: VectorInput,
    #[serde(default = "default_limits")]
    limits: Vec<String>,
}

// --- Response structs ---

#[derive(Serialize)]
struct AddResponse {
    added: usize,
    results: Vec<AddResult>,
}

#[derive(Serialize)]
struct AddResult {
    label: String,
    name: String,
    status: &'static str,
    id: Option<i64>,
    message: String,
}

#[derive(Serialize)]
struct DirtyResponse {
    results: Vec<DirtyResult>,
}

#[derive(Serialize)]
struct DirtyResult {
    label: String,
    name: String,
    dirty: bool,
}

#[derive(Serialize)]
struct SearchResponse {
    fragments: Vec<Fragment>,
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: StatsSnapshot,
    average_ns: Option<u64>,
    cache_entries: usize,
}

fn error_response(err: &Error) -> HttpResponse {
    let body = serde_json::json!({ "error": err.to_string() });
    match err {
        Error::Codec(_) | Error::LengthMismatch { .. } | Error::InvalidLimit(_) => {
            HttpResponse::BadRequest().json(body)
        }
        _ => HttpResponse::InternalServerError().json(body),
    }
}

// --- Handlers ---

fn add_one(store: &FragmentStore, entry: FragmentEntry) -> Result<Option<Fragment>> {
    if !store.is_dirty(&entry.label, &entry.name, &entry.content)? {
        return Ok(None);
    }
    let vector = entry.vector.into_values()?;
    let fragment = store.upsert(&entry.label, &entry.name, &entry.content, &entry.model, &vector)?;
    Ok(Some(fragment))
}

async fn add_handler(state: web::Data<AppState>, body: web::Json<AddRequest>) -> impl Responder {
    let AddRequest { db, fragments } = body.into_inner();
    let store = match state.open(&db) {
        Ok(store) => store,
        Err(e) => return error_response(&e),
    };

    let mut results = Vec::with_capacity(fragments.len());
    let mut added = 0;

    for entry in fragments {
        let (label, name) = (entry.label.clone(), entry.name.clone());
        let result = match add_one(&store, entry) {
            Ok(Some(fragment)) => {
                added += 1;
                AddResult {
                    label,
                    name,
                    status: "ok",
                    id: Some(fragment.id),
                    message: "Stored".to_string(),
                }
            }
            Ok(None) => AddResult {
                label,
                name,
                status: "unchanged",
                id: None,
                message: "Content already stored".to_string(),
            },
            Err(e) => {
                warn!(db = %db, %label, %name, error = %e, "failed to add fragment");
                AddResult {
                    label,
                    name,
                    status: "error",
                    id: None,
                    message: e.to_string(),
                }
            }
        };
        results.push(result);
    }

    HttpResponse::Ok().json(AddResponse { added, results })
}

async fn dirty_handler(state: web::Data<AppState>, body: web::Json<DirtyRequest>) -> impl Responder {
    let store = match state.open(&body.db) {
        Ok(store) => store,
        Err(e) => return error_response(&e),
    };

    let mut results = Vec::with_capacity(body.fragments.len());
    for entry in &body.fragments {
        match store.is_dirty(&entry.label, &entry.name, &entry.content) {
            Ok(dirty) => results.push(DirtyResult {
                label: entry.label.clone(),
                name: entry.name.clone(),
                dirty,
            }),
            Err(e) => return error_response(&e),
        }
    }

    HttpResponse::Ok().json(DirtyResponse { results })
}

fn search_one(state: &AppState, request: SearchRequest) -> Result<Vec<Fragment>> {
    let limits = parse_limits(&request.limits)?;
    let vector = request.vector.into_values()?;
    let store = state.open(&request.db)?;
    search(&store, &vector, &limits)
}

async fn search_handler(state: web::Data<AppState>, body: web::Json<SearchRequest>) -> impl Responder {
    match search_one(&state, body.into_inner()) {
        Ok(fragments) => HttpResponse::Ok().json(SearchResponse { fragments }),
        Err(e) => error_response(&e),
    }
}

async fn stats_handler(state: web::Data<AppState>) -> impl Responder {
    let stats = state.distance.stats().snapshot();
    let average_ns = stats
        .average()
        .map(|avg| u64::try_from(avg.as_nanos()).unwrap_or(u64::MAX));

    HttpResponse::Ok().json(StatsResponse {
        stats,
        average_ns,
        cache_entries: state.distance.cache().len(),
    })
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/add").route(web::post().to(add_handler)))
       .service(web::resource("/dirty").route(web::post().to(dirty_handler)))
       .service(web::resource("/search").route(web::post().to(search_handler)))
       .service(web::resource("/stats").route(web::post().to(stats_handler)));
}

/// Runs the server on `bind` until it is stopped, on its own actix system.
pub fn serve(bind: &str, state: AppState) -> std::io::Result<()> {
    info!(%bind, "starting http server");
    actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(config)
        })
        .bind(bind)?
        .run()
        .await
    })
}
