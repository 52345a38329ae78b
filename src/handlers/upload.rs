//! Upload, delete, fetch and listing handlers.
//!
//! These are thin adapters: they pull fields out of the request, call the
//! matching [`SubmissionUploadSession`](crate::session::SubmissionUploadSession)
//! operation, and shape the response. All validation of ids and names
//! happens in the session.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        multipart::MultipartError,
        rejection::{FormRejection, QueryRejection},
        Form, Multipart, Path, Query, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::errors::UploadError;
use crate::session::{ChunkUpload, UploadStatus};
use crate::AppState;

/// Form body of `POST /delete/{submission_id}`.
#[derive(Debug, Deserialize)]
pub struct DeleteForm {
    pub filename: Option<String>,
}

/// Query of `GET /get_file/{submission_id}`.
#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    pub filename: Option<String>,
}

/// `POST /upload/{submission_id}` -- stage one chunk or a whole file.
#[utoipa::path(
    post,
    path = "/upload/{submission_id}",
    tag = "Upload",
    operation_id = "UploadChunk",
    params(("submission_id" = String, Path, description = "Submission identifier")),
    request_body(content = inline(Object), content_type = "multipart/form-data",
        description = "Fields: name, chunk, chunks, file"),
    responses(
        (status = 200, description = "Chunk staged or file assembled", body = UploadStatus),
        (status = 400, description = "Invalid submission id or form fields"),
        (status = 413, description = "Chunk exceeds the body limit"),
        (status = 422, description = "Assembly size mismatch; restart the upload"),
        (status = 500, description = "Storage failure")
    )
)]
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
    multipart: Multipart,
) -> Result<Json<UploadStatus>, UploadError> {
    let upload = read_upload_form(multipart, state.config.server.max_chunk_size).await?;
    debug!(
        submission_id = %submission_id,
        file = %upload.name,
        chunk = ?upload.chunk,
        chunks = ?upload.chunks,
        bytes = upload.data.len(),
        "upload request"
    );
    let outcome = state.session.receive_chunk(&submission_id, upload).await?;
    Ok(Json(UploadStatus::from(&outcome)))
}

/// `POST /delete/{submission_id}` -- remove one stored file.
#[utoipa::path(
    post,
    path = "/delete/{submission_id}",
    tag = "Upload",
    operation_id = "DeleteFile",
    params(("submission_id" = String, Path, description = "Submission identifier")),
    request_body(content = inline(Object), content_type = "application/x-www-form-urlencoded",
        description = "Field: filename"),
    responses(
        (status = 200, description = "File deleted", body = String),
        (status = 400, description = "Missing or malformed filename"),
        (status = 403, description = "Name resolves outside the submission"),
        (status = 404, description = "File not found")
    )
)]
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
    form: Result<Form<DeleteForm>, FormRejection>,
) -> Result<Response, UploadError> {
    let Form(form) = form.map_err(|rejection| UploadError::invalid(rejection.body_text()))?;
    let filename = required_filename(form.filename)?;
    let message = state.session.delete_file(&submission_id, &filename).await?;
    Ok((StatusCode::OK, message).into_response())
}

/// `GET /get_file/{submission_id}?filename=` -- stream a stored file.
#[utoipa::path(
    get,
    path = "/get_file/{submission_id}",
    tag = "Upload",
    operation_id = "GetFile",
    params(
        ("submission_id" = String, Path, description = "Submission identifier"),
        ("filename" = String, Query, description = "Stored file name")
    ),
    responses(
        (status = 200, description = "File content as an attachment"),
        (status = 400, description = "Missing or malformed filename"),
        (status = 403, description = "Name resolves outside the submission"),
        (status = 404, description = "File not found")
    )
)]
pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
    query: Result<Query<FetchQuery>, QueryRejection>,
) -> Result<Response, UploadError> {
    let Query(query) = query.map_err(|rejection| UploadError::invalid(rejection.body_text()))?;
    let filename = required_filename(query.filename)?;
    let fetched = state.session.fetch_file(&submission_id, &filename).await?;

    let mut response = Body::from_stream(ReaderStream::new(fetched.file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(fetched.size));
    if let Ok(disposition) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", fetched.name))
    {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    Ok(response)
}

/// `GET /uploads/{submission_id}` -- sidecars of the assembled files.
#[utoipa::path(
    get,
    path = "/uploads/{submission_id}",
    tag = "Upload",
    operation_id = "ListUploads",
    params(("submission_id" = String, Path, description = "Submission identifier")),
    responses(
        (status = 200, description = "JSON array of upload metadata sidecars"),
        (status = 400, description = "Invalid submission id")
    )
)]
pub async fn list_uploads(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
) -> Result<Response, UploadError> {
    let sidecars = state.session.list_files(&submission_id).await?;
    Ok(Json(sidecars).into_response())
}

/// `DELETE /uploads/{submission_id}` -- drop everything stored for a
/// submission.
#[utoipa::path(
    delete,
    path = "/uploads/{submission_id}",
    tag = "Upload",
    operation_id = "PurgeSubmission",
    params(("submission_id" = String, Path, description = "Submission identifier")),
    responses(
        (status = 204, description = "Submission purged (or already absent)"),
        (status = 400, description = "Invalid submission id")
    )
)]
pub async fn purge_submission(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
) -> Result<StatusCode, UploadError> {
    state.session.purge_submission(&submission_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Multipart parsing --------------------------------------------------------

/// Collect the `name`, `chunk`, `chunks` and `file` fields of an upload.
///
/// Exactly one `file` field is accepted. When `name` is absent the file
/// part's own file name is used.
async fn read_upload_form(mut multipart: Multipart, limit: usize) -> Result<ChunkUpload, UploadError> {
    let mut name: Option<String> = None;
    let mut chunk: Option<u32> = None;
    let mut chunks: Option<u32> = None;
    let mut data: Option<Bytes> = None;
    let mut part_file_name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        let field_name = field.name().map(|s| s.to_string()).unwrap_or_default();
        match field_name.as_str() {
            "file" => {
                if data.is_some() {
                    return Err(UploadError::invalid(
                        "Multiple file fields are not allowed; send exactly one field named 'file'",
                    ));
                }
                part_file_name = field.file_name().map(|s| s.to_string());
                data = Some(field.bytes().await.map_err(|e| multipart_error(e, limit))?);
            }
            "name" => name = Some(field.text().await.map_err(|e| multipart_error(e, limit))?),
            "chunk" => {
                let text = field.text().await.map_err(|e| multipart_error(e, limit))?;
                chunk = parse_count("chunk", &text)?;
            }
            "chunks" => {
                let text = field.text().await.map_err(|e| multipart_error(e, limit))?;
                chunks = parse_count("chunks", &text)?;
            }
            _ => {}
        }
    }

    let data = data.ok_or_else(|| UploadError::invalid("No file provided"))?;
    let name = name
        .filter(|n| !n.trim().is_empty())
        .or(part_file_name)
        .ok_or_else(|| UploadError::invalid("Missing required field 'name'"))?;

    Ok(ChunkUpload {
        name,
        chunk,
        chunks,
        data,
    })
}

fn required_filename(filename: Option<String>) -> Result<String, UploadError> {
    filename
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| UploadError::invalid("Missing required field 'filename'"))
}

/// Parse a numeric form field; blank means absent.
fn parse_count(field: &str, text: &str) -> Result<Option<u32>, UploadError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse::<u32>()
        .map(Some)
        .map_err(|_| UploadError::invalid(format!("Field '{field}' must be a non-negative integer, got {text:?}")))
}

fn multipart_error(err: MultipartError, limit: usize) -> UploadError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::PayloadTooLarge { limit }
    } else {
        UploadError::invalid(format!("Failed to read multipart body: {}", err.body_text()))
    }
}
