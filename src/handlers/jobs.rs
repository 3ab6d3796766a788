//! # Job Handlers
//!
//! Upload, status, result and cancellation endpoints for transcription jobs.
//!
//! ## Upload Form (`multipart/form-data`):
//! - `file`: the audio file (mp3, wav, m4a, flac, ogg)
//! - `priority`: optional integer, higher runs first (default 0)
//! - `model_size`: optional `tiny|base|small|medium|large`, defaults to the
//!   configured size
//!
//! The upload is validated and stored before the job is admitted. If
//! admission fails (queue full, shutting down) the stored file is removed
//! and no job exists.

use actix_multipart::{Field, Multipart};
use actix_web::web::{self, BytesMut};
use actix_web::HttpResponse;
use futures_util::TryStreamExt;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::jobs::JobId;
use crate::state::AppState;
use crate::transcription::ModelSize;
use crate::upload::{StoredUpload, UploadError, UploadPolicy};

/// Text fields are tiny; anything bigger is not a priority or a size.
const MAX_TEXT_FIELD_BYTES: usize = 64;

#[derive(Debug)]
struct SubmitFields {
    priority: i32,
    model_size: Option<ModelSize>,
}

pub async fn submit_job(state: web::Data<AppState>, mut payload: Multipart) -> AppResult<HttpResponse> {
    let mut upload = None;
    let fields = match read_form(&state.uploads, &mut payload, &mut upload).await {
        Ok(fields) => fields,
        Err(e) => {
            if let Some(upload) = upload {
                upload.discard().await;
            }
            return Err(e);
        }
    };
    let upload = upload.ok_or(UploadError::MissingFile)?;
    let model_size = fields.model_size.unwrap_or(state.config.models.default_size);

    let job_id = match state.service.submit(upload.input_ref(), fields.priority, model_size).await {
        Ok(id) => id,
        Err(e) => {
            upload.discard().await;
            return Err(e.into());
        }
    };

    tracing::info!(
        job_id = %job_id,
        file_name = %upload.file_name,
        format = upload.format.extension(),
        size_bytes = upload.size_bytes,
        "Audio upload accepted"
    );

    let view = state.service.status(job_id).await?;
    Ok(HttpResponse::Accepted().json(json!({
        "job_id": job_id,
        "status": view.status,
        "created_at": view.created_at,
        "message": "Audio file uploaded successfully and transcription job queued"
    })))
}

/// Walk the multipart stream. A stored file is handed back through `upload`
/// even when a later field fails, so the caller can remove it.
async fn read_form(
    uploads: &UploadPolicy,
    payload: &mut Multipart,
    upload: &mut Option<StoredUpload>,
) -> AppResult<SubmitFields> {
    let mut fields = SubmitFields {
        priority: 0,
        model_size: None,
    };

    while let Some(field) = payload.try_next().await.map_err(|e| UploadError::Stream(e.to_string()))? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if upload.is_some() {
                    return Err(invalid_field("file", "only one file may be uploaded per job"));
                }
                *upload = Some(store_file(uploads, field).await?);
            }
            "priority" => {
                let value = read_text(field, "priority").await?;
                fields.priority = value
                    .parse()
                    .map_err(|_| invalid_field("priority", format!("'{}' is not an integer", value)))?;
            }
            "model_size" => {
                let value = read_text(field, "model_size").await?;
                if !value.is_empty() {
                    fields.model_size = Some(value.parse().map_err(|e| invalid_field("model_size", e))?);
                }
            }
            other => {
                tracing::debug!(field = other, "Ignoring unknown form field");
            }
        }
    }

    Ok(fields)
}

async fn store_file(uploads: &UploadPolicy, field: Field) -> AppResult<StoredUpload> {
    let file_name = field
        .content_disposition()
        .and_then(|cd| cd.get_filename())
        .map(str::to_string);
    uploads.validate_name(file_name.as_deref())?;
    uploads.validate_content_type(field.content_type().map(|mime| mime.essence_str()))?;

    let file_name = file_name.unwrap_or_default();
    Ok(uploads.persist(&file_name, field).await?)
}

async fn read_text(mut field: Field, name: &'static str) -> AppResult<String> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field.try_next().await.map_err(|e| UploadError::Stream(e.to_string()))? {
        if buf.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
            return Err(invalid_field(name, "value is too long"));
        }
        buf.extend_from_slice(&chunk);
    }
    let text = std::str::from_utf8(&buf).map_err(|_| invalid_field(name, "value is not valid UTF-8"))?;
    Ok(text.trim().to_string())
}

fn invalid_field(field: &str, message: impl ToString) -> AppError {
    UploadError::InvalidField {
        field: field.to_string(),
        message: message.to_string(),
    }
    .into()
}

fn parse_job_id(raw: &str) -> AppResult<JobId> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("'{}' is not a valid job id", raw)))
}

pub async fn job_status(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let id = parse_job_id(&path)?;
    Ok(HttpResponse::Ok().json(state.service.status(id).await?))
}

pub async fn job_result(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let id = parse_job_id(&path)?;
    Ok(HttpResponse::Ok().json(state.service.result(id).await?))
}

pub async fn cancel_job(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let id = parse_job_id(&path)?;
    let job = state.service.cancel(id).await?;

    Ok(HttpResponse::Ok().json(json!({
        "job_id": job.id,
        "status": job.state,
        "message": "Transcription job was cancelled",
        "completed_at": job.completed_at,
        "version": job.version
    })))
}
