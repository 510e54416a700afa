//! Image description endpoints: single upload, SSE batch, and history.

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::{ApiError, ErrorCode};
use crate::db::{find_user_description, list_user_descriptions, ImageDescription, PageQuery, Paginated, User};
use crate::processor::batch::{BatchMode, BatchOrchestrator};
use crate::processor::UploadedFile;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct DescribeResponse {
    pub description: ImageDescription,
    pub credits_remaining: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchQuery {
    pub mode: Option<String>,
}

fn parse_mode(mode: Option<&str>) -> Result<BatchMode, ApiError> {
    match mode.map(str::trim) {
        None | Some("") | Some("sequential") => Ok(BatchMode::Sequential),
        Some("concurrent") => Ok(BatchMode::Concurrent),
        Some(other) => Err(ApiError::validation_field(
            "mode",
            format!("Unknown mode '{}', expected 'sequential' or 'concurrent'", other),
        )),
    }
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::new(ErrorCode::PayloadTooLarge, "Upload exceeds the request size limit")
    } else {
        ApiError::bad_request(format!("Invalid multipart body: {}", e.body_text()))
    }
}

/// Collect every file part whose field name is in `names`. Fails as soon as
/// part `max + 1` arrives, before its body is buffered.
async fn read_files(
    multipart: &mut Multipart,
    names: &[&str],
    max: usize,
) -> Result<Vec<UploadedFile>, ApiError> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(name) = field.name() else { continue };
        if !names.contains(&name) {
            continue;
        }
        if files.len() == max {
            return Err(ApiError::validation_field(
                names[0],
                format!("At most {} file(s) may be uploaded per request", max),
            ));
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.map_err(multipart_error)?;
        files.push(UploadedFile {
            filename,
            content_type,
            data,
        });
    }
    Ok(files)
}

/// POST /api/describe - describe one image (multipart field `file`)
pub async fn describe_single(
    State(state): State<Arc<AppState>>,
    user: User,
    mut multipart: Multipart,
) -> Result<Json<DescribeResponse>, ApiError> {
    let mut files = read_files(&mut multipart, &["file"], 1).await?;
    if files.len() != 1 {
        return Err(ApiError::validation_field(
            "file",
            "Exactly one file must be uploaded in the 'file' field",
        ));
    }
    let file = files.remove(0);

    let processed = state.processor().process_one(&user.id, &file).await?;
    Ok(Json(DescribeResponse {
        description: processed.record,
        credits_remaining: processed.credits_remaining,
    }))
}

/// POST /api/describe/batch?mode=sequential|concurrent
///
/// Files come in multipart field `files`. Count and balance are checked
/// before the stream opens, so those failures are ordinary JSON errors.
/// Everything after that is reported as events.
pub async fn describe_batch(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(query): Query<BatchQuery>,
    mut multipart: Multipart,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mode = parse_mode(query.mode.as_deref())?;
    let max_files = state.config.batch.max_files_per_batch;
    let files = read_files(&mut multipart, &["files", "files[]"], max_files).await?;

    let orchestrator = BatchOrchestrator::new(state.processor(), state.config.batch.clone());
    orchestrator.preflight(&user.id, files.len()).await?;

    let (tx, mut rx) = mpsc::channel(32);
    tokio::spawn(orchestrator.run(user.id.clone(), files, mode, tx));

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => yield Ok(Event::default().event(event.name()).data(json)),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize batch event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

/// GET /api/descriptions
pub async fn list_descriptions(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(page): Query<PageQuery>,
) -> Result<Json<Paginated<ImageDescription>>, ApiError> {
    Ok(Json(list_user_descriptions(&state.db, &user.id, &page).await?))
}

/// GET /api/descriptions/:id
pub async fn get_description(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<ImageDescription>, ApiError> {
    find_user_description(&state.db, &user.id, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Description not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode(None).unwrap(), BatchMode::Sequential);
        assert_eq!(parse_mode(Some("")).unwrap(), BatchMode::Sequential);
        assert_eq!(parse_mode(Some("concurrent")).unwrap(), BatchMode::Concurrent);

        let err = parse_mode(Some("parallel")).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
