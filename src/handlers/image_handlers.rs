//! HTTP handlers for image operations.
//! Streams image bodies in both directions to avoid buffering in memory and
//! delegates storage concerns to `StorageService`.

use crate::{
    errors::AppError,
    models::{FileInfo, FileObject},
    services::{StorageService, content_type::OCTET_STREAM},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::io;

/// Multipart field carrying the image.
const FILE_FIELD: &str = "file";
/// Optional multipart field naming the uploader. Must precede `file`, since
/// the image is streamed straight into the store as soon as it arrives.
const UPLOADED_BY_FIELD: &str = "uploadedBy";

/// `POST /v1/images/upload` (multipart form).
pub async fn upload_image(
    State(service): State<StorageService>,
    mut multipart: Multipart,
) -> Result<Json<FileObject>, AppError> {
    let mut uploaded_by: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.body_text()))?
    {
        match field.name() {
            Some(UPLOADED_BY_FIELD) => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(err.body_text()))?;
                uploaded_by = Some(value);
            }
            Some(FILE_FIELD) => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let declared = field.content_type().map(str::to_string);
                let body = field.map(|chunk| chunk.map_err(io::Error::other));

                let file = service
                    .upload(body, &file_name, declared.as_deref(), uploaded_by.as_deref())
                    .await?;
                tracing::info!(id = %file.id, size = file.size, "image uploaded");
                return Ok(Json(file));
            }
            _ => {}
        }
    }

    Err(AppError::bad_request("No files were uploaded"))
}

/// `GET /v1/images/list` — metadata of every image as a JSON array.
///
/// The array is written entry by entry while the catalog is walked.
pub async fn list_images(State(service): State<StorageService>) -> Result<Response, AppError> {
    let mut listing = service.list_all()?;

    let first = match listing.next().await {
        Some(entry) => entry?,
        None => {
            if listing.skipped() > 0 {
                tracing::warn!(
                    skipped = listing.skipped(),
                    "catalog has entries but none could be decoded"
                );
            }
            return Err(AppError::not_found("No files found"));
        }
    };

    let head = stream::once(async move { encode_entry(b"[", &first) });
    let rest = listing.map(|entry| {
        entry
            .map_err(io::Error::other)
            .and_then(|info| encode_entry(b",", &info))
    });
    let tail = stream::once(async { Ok::<_, io::Error>(Bytes::from_static(b"]")) });

    let mut response = Response::new(Body::from_stream(head.chain(rest).chain(tail)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

/// `GET /v1/images/view/{id}` — image bytes as a streaming response.
pub async fn view_image(
    State(service): State<StorageService>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (meta, body) = service.download(&id).await?;

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::OK;
    set_image_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `GET /v1/images/metadata/{id}`
pub async fn image_metadata(
    State(service): State<StorageService>,
    Path(id): Path<String>,
) -> Result<Json<FileObject>, AppError> {
    Ok(Json(service.get_metadata(&id).await?))
}

/// `DELETE /v1/images/remove/{id}`
pub async fn delete_image(
    State(service): State<StorageService>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete(&id).await?;
    tracing::info!(%id, "image deleted");
    Ok(StatusCode::NO_CONTENT)
}

fn set_image_headers(headers: &mut HeaderMap, meta: &FileObject) {
    let content_type = if meta.content_type.is_empty() {
        OCTET_STREAM
    } else {
        meta.content_type.as_str()
    };
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(OCTET_STREAM)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));

    let quoted = format!("\"{}\"", meta.md5);
    if let Ok(value) = HeaderValue::from_str(&quoted) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.upload_date.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

fn encode_entry(prefix: &[u8], info: &FileInfo) -> io::Result<Bytes> {
    let mut buf = prefix.to_vec();
    serde_json::to_writer(&mut buf, info)?;
    Ok(Bytes::from(buf))
}
