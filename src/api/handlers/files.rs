use crate::AppState;
use crate::api::error::AppError;
use crate::services::ingress::{IngressError, UploadRequest};
use crate::utils::validation::{FALLBACK_FILENAME, attachment_disposition, sanitize_filename};
use axum::{
    body::Body,
    extract::{Multipart, State, multipart::MultipartError},
    http::{StatusCode, header},
    response::Response,
};
use futures::TryStreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

pub const FILE_ID_HEADER: &str = "x-file-id";

/// Multipart body accepted by the upload endpoint
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct UploadForm {
    #[schema(value_type = String, format = Binary)]
    file: Vec<u8>,
}

const TOO_LARGE_MSG: &str = "Request body exceeds the maximum allowed limit";

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(TOO_LARGE_MSG.to_string())
    } else {
        AppError::BadRequest(e.body_text())
    }
}

/// Stores the upload, hands it to the processing worker and streams the
/// processed artifact back.
#[utoipa::path(
    post,
    path = "/files/upload_file",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Processed file stream"),
        (status = 400, description = "No file in the request"),
        (status = 404, description = "Metadata record missing"),
        (status = 413, description = "Upload exceeds the body limit"),
        (status = 500, description = "Storage, broker or integrity failure"),
        (status = 504, description = "Processing did not reply in time")
    ),
    tag = "files"
)]
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    // Cancels the reply wait if this future is dropped (client disconnect).
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();

    let result: Result<Response, AppError> = async {
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            if field.name() != Some("file") {
                continue;
            }

            let filename = field
                .file_name()
                .map(sanitize_filename)
                .unwrap_or_else(|| FALLBACK_FILENAME.to_string());
            let request = UploadRequest::new(filename, None);
            tracing::info!(
                "📥 Upload received: {} -> {}",
                request.original_filename,
                request.object_key
            );

            // The body limit can trip while the blob store is reading the field
            let over_limit = Arc::new(AtomicBool::new(false));
            let tripped = over_limit.clone();
            let reader = StreamReader::new(field.map_err(move |e| {
                if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    tripped.store(true, Ordering::Relaxed);
                }
                std::io::Error::other(e)
            }));
            let processed = state
                .ingress
                .handle_upload(request, Box::new(reader), cancel.clone())
                .await
                .map_err(|e| {
                    if over_limit.load(Ordering::Relaxed) {
                        AppError::PayloadTooLarge(TOO_LARGE_MSG.to_string())
                    } else {
                        AppError::from(e)
                    }
                })?;

            tracing::info!(
                "📤 Streaming {} ({} bytes) for file {}",
                processed.object_key,
                processed.size,
                processed.file_id
            );

            return Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(
                    header::CONTENT_DISPOSITION,
                    attachment_disposition(&processed.filename),
                )
                .header(header::CONTENT_LENGTH, processed.size)
                .header(FILE_ID_HEADER, processed.file_id)
                .body(Body::from_stream(ReaderStream::new(processed.reader)))
                .map_err(|e| AppError::Internal(e.to_string()));
        }

        Err(IngressError::NoFileReceived.into())
    }
    .await;

    match result {
        Ok(response) => Ok(response),
        Err(e) => {
            // Drain what is left so the client is not cut off mid-send
            tracing::warn!("Upload failed: {}. Consuming remaining stream...", e);
            while let Ok(Some(mut field)) = multipart.next_field().await {
                while let Ok(Some(_)) = field.chunk().await {}
            }
            Err(e)
        }
    }
}
