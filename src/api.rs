//! Film and rating handlers
//!
//! Framework-independent versions of the three routes of the rating
//! service (`GET /film`, `POST /note`, `GET /note/{id}`). Each returns an
//! [`ApiResponse`]; mounting them on an HTTP server is left to the caller.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};

use crate::connection::Connection;
use crate::database::Database;
use crate::types::{Cell, FieldFormat, Value};

/// Largest numeric part of a generated IMDb id
pub const MAX_IMDB_NUMBER: u32 = 9_916_880;

pub const MIN_RATING: f64 = 0.5;
pub const MAX_RATING: f64 = 10.0;

/// Status code and JSON body of a handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Json,
}

impl ApiResponse {
    pub fn ok(body: Json) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "erreur": message }),
        }
    }

    fn message(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "message": message }),
        }
    }
}

pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// Movie metadata source (OMDb-compatible JSON)
#[async_trait]
pub trait FilmProvider: Send + Sync {
    /// Fetch the record for an IMDb id
    async fn fetch(&self, imdb_id: &str, api_key: &str) -> Result<Json, ProviderError>;
}

/// Random IMDb title id, `tt` followed by seven digits
pub fn random_imdb_id() -> String {
    let number = rand::thread_rng().gen_range(1..=MAX_IMDB_NUMBER);
    format!("tt{:07}", number)
}

/// Fetch a random film
pub async fn get_film(provider: &dyn FilmProvider, api_key: Option<&str>) -> ApiResponse {
    let Some(api_key) = api_key.filter(|k| !k.is_empty()) else {
        return ApiResponse::error(500, "Clé API OMDb manquante.");
    };

    let imdb_id = random_imdb_id();
    match provider.fetch(&imdb_id, api_key).await {
        Ok(data) if data.get("Response").and_then(Json::as_str) == Some("False") => {
            tracing::debug!(imdb_id = %imdb_id, "film not found");
            ApiResponse::error(404, "Film non trouvé. Veuillez réessayer.")
        }
        Ok(data) => ApiResponse::ok(data),
        Err(e) => {
            tracing::error!(imdb_id = %imdb_id, error = %e, "film provider failed");
            ApiResponse::error(500, "Erreur lors de la récupération du film.")
        }
    }
}

/// Store a rating from a `{tconst, rating}` body
pub async fn post_note<C: Connection>(db: &mut Database<C>, body: &Json) -> ApiResponse {
    const MISSING: &str = "Les champs tconst et rating sont obligatoires.";

    let tconst = match body.get("tconst") {
        Some(Json::String(s)) if !s.is_empty() => s.clone(),
        Some(Json::Number(n)) => n.to_string(),
        _ => return ApiResponse::error(400, MISSING),
    };
    let Some(rating) = body.get("rating").and_then(parse_rating) else {
        return ApiResponse::error(400, MISSING);
    };

    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return ApiResponse::error(400, "La note doit être entre 0.5 et 10.0.");
    }

    let data = [("tconst", Value::from(tconst)), ("rating", Value::from(rating))];
    match db
        .insert("ratings", &data, &[FieldFormat::Str, FieldFormat::Float])
        .await
    {
        Ok(_) => ApiResponse::message(200, "Note enregistrée avec succès."),
        Err(e) => {
            tracing::error!(error = %e, "could not store rating");
            ApiResponse::error(500, "Erreur lors de l'enregistrement de la note.")
        }
    }
}

/// Vote count and average rating of a film
pub async fn get_note<C: Connection>(db: &mut Database<C>, tconst: &str) -> ApiResponse {
    let rows = match db.prepare(
        "SELECT COUNT(*) AS votes, AVG(rating) AS moyenne FROM ratings WHERE tconst = %s",
        &[Value::from(tconst)],
    ) {
        Ok(sql) => db.get_results(&sql).await,
        Err(e) => Err(e),
    };

    let rows = match rows {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(tconst, error = %e, "could not read ratings");
            return ApiResponse::error(500, "Erreur de base de données.");
        }
    };

    let votes = rows
        .first()
        .and_then(|row| row.get("votes"))
        .and_then(Cell::as_i64)
        .unwrap_or(0);
    if votes == 0 {
        return ApiResponse::message(404, "Aucune note trouvée pour ce film.");
    }

    let average = rows
        .first()
        .and_then(|row| row.get("moyenne"))
        .and_then(Cell::as_f64)
        .unwrap_or(0.0);

    ApiResponse::ok(json!({
        "tconst": tconst,
        "votes": votes,
        "moyenne": (average * 100.0).round() / 100.0,
    }))
}

fn parse_rating(value: &Json) -> Option<f64> {
    match value {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
