/// Upload handler - stores the file in the upload bucket tagged with a session
use crate::error::{AppError, Result};
use crate::hub::MAX_SESSION_TOKEN_LEN;
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use bytes::BytesMut;
use event_schema::SESSION_TOKEN_METADATA_KEY;
use futures::StreamExt;
use object_store::StoredObject;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub key: String,
    pub session: String,
}

struct UploadedFile {
    filename: String,
    content_type: String,
    data: BytesMut,
}

/// Reduce a client-supplied filename to a safe, flat object name
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);

    let cleaned: String = base
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();

    cleaned.trim_start_matches(['.', '_']).to_string()
}

/// Use the caller's session token, or mint one
pub fn resolve_session(requested: Option<&str>) -> Result<String> {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(token) if token.len() > MAX_SESSION_TOKEN_LEN => Err(AppError::BadRequest(
            "session token is too long".to_string(),
        )),
        Some(token) => Ok(token.to_string()),
        None => Ok(Uuid::new_v4().to_string()),
    }
}

async fn read_file_field(mut payload: Multipart, max_bytes: usize) -> Result<Option<UploadedFile>> {
    let mut file = None;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| AppError::BadRequest(format!("invalid multipart body: {e}")))?;
        let is_file = field.name() == Some("file") && file.is_none();

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .unwrap_or_default()
            .to_string();
        let content_type = field
            .content_type()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let mut data = BytesMut::new();
        while let Some(chunk) = field.next().await {
            let chunk =
                chunk.map_err(|e| AppError::BadRequest(format!("error reading upload: {e}")))?;
            if !is_file {
                continue;
            }
            if data.len() + chunk.len() > max_bytes {
                return Err(AppError::PayloadTooLarge(format!(
                    "upload exceeds {max_bytes} bytes"
                )));
            }
            data.extend_from_slice(&chunk);
        }

        if is_file {
            file = Some(UploadedFile {
                filename,
                content_type,
                data,
            });
        }
    }

    Ok(file)
}

/// `<unix-secs>-<8 hex>-<name>`; the random part keeps same-second uploads of one name apart
fn upload_key(filename: &str) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        chrono::Utc::now().timestamp(),
        &nonce[..8],
        filename
    )
}

pub async fn upload(
    state: web::Data<AppState>,
    query: web::Query<SessionQuery>,
    payload: Multipart,
) -> Result<HttpResponse> {
    let session = resolve_session(query.session.as_deref())?;

    let file = read_file_field(payload, state.config.http.max_upload_bytes)
        .await?
        .ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;
    if file.filename.trim().is_empty() {
        return Err(AppError::BadRequest("Empty filename".to_string()));
    }

    let filename = sanitize_filename(&file.filename);
    if filename.is_empty() {
        return Err(AppError::BadRequest("Invalid filename".to_string()));
    }

    let key = upload_key(&filename);
    let bucket = &state.config.storage.upload_bucket;
    let size = file.data.len();
    let object = StoredObject::new(file.data.freeze())
        .with_content_type(file.content_type)
        .with_metadata(SESSION_TOKEN_METADATA_KEY, session.clone());

    if let Err(e) = state.store.put(bucket, &key, object).await {
        error!(bucket = %bucket, key = %key, error = %e, "Upload failed");
        return Err(AppError::Storage(e));
    }

    info!(bucket = %bucket, key = %key, size, session = %session, "Stored upload");
    Ok(HttpResponse::Created().json(UploadResponse {
        message: "Uploaded".to_string(),
        key,
        session,
    }))
}
