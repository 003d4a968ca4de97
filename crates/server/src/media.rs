use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use gateway_protocol::GatewayError;

use crate::chat_client::MediaHandle;

const MAX_MEDIA_BYTES: u64 = 10 * 1024 * 1024;

pub struct MediaRequest<'a> {
    pub data: Option<&'a str>,
    pub url: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub mime_type: Option<&'a str>,
    pub save_to_temp: Option<bool>,
}

pub struct PreparedMedia {
    pub handle: MediaHandle,
    pub preview_path: Option<String>,
}

/// Prepares a media attachment for handoff to the chat client (spec.md
/// §4.4). Exactly one of `data`/`url` must be supplied.
pub async fn prepare_media(
    client: &reqwest::Client,
    temp_dir: &str,
    request: MediaRequest<'_>,
) -> Result<PreparedMedia, GatewayError> {
    match (request.data, request.url) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(GatewayError::invalid_payload(
                "exactly one of `data` or `url` must be present",
            ));
        }
        _ => {}
    }

    let (bytes, mime_type, filename) = if let Some(data) = request.data {
        let raw = match data.split_once(',') {
            Some((_, payload)) => payload,
            None => data,
        };
        let decoded = BASE64
            .decode(raw)
            .map_err(|e| GatewayError::invalid_payload(format!("invalid base64 media data: {e}")))?;

        if decoded.len() as u64 > MAX_MEDIA_BYTES {
            return Err(GatewayError::media_too_large(format!(
                "media is {} bytes, limit is {MAX_MEDIA_BYTES}",
                decoded.len()
            )));
        }

        let mime_type = request.mime_type.unwrap_or("image/jpeg").to_string();
        let filename = request.filename.unwrap_or("image.jpg").to_string();
        (decoded, mime_type, filename)
    } else {
        let url = request.url.unwrap();

        let head = client
            .head(url)
            .send()
            .await
            .map_err(|e| GatewayError::bad_gateway(format!("HEAD {url} failed: {e}")))?;

        let content_length = head
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        match content_length {
            Some(len) if len <= MAX_MEDIA_BYTES => {}
            _ => {
                return Err(GatewayError::media_too_large(
                    "remote media size unknown or exceeds 10 MiB",
                ));
            }
        }

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::bad_gateway(format!("GET {url} failed: {e}")))?;

        let mime_type = request
            .mime_type
            .map(|s| s.to_string())
            .or_else(|| {
                response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string())
            })
            .unwrap_or_else(|| "image/jpeg".to_string());

        let filename = request
            .filename
            .map(|s| s.to_string())
            .or_else(|| filename_from_url(url))
            .unwrap_or_else(|| "image.jpg".to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::bad_gateway(format!("failed reading media body: {e}")))?
            .to_vec();

        if bytes.len() as u64 > MAX_MEDIA_BYTES {
            return Err(GatewayError::media_too_large(format!(
                "media is {} bytes, limit is {MAX_MEDIA_BYTES}",
                bytes.len()
            )));
        }

        (bytes, mime_type, filename)
    };

    let preview_path = if request.save_to_temp != Some(false) {
        let epoch_ms = chrono::Utc::now().timestamp_millis();
        let path = format!("{temp_dir}/{epoch_ms}-{filename}");
        if let Some(parent) = std::path::Path::new(&path).parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| GatewayError::bad_gateway(format!("failed writing media preview: {e}")))?;
        Some(path)
    } else {
        None
    };

    Ok(PreparedMedia {
        handle: MediaHandle {
            mime_type,
            base64: BASE64.encode(&bytes),
            filename,
        },
        preview_path,
    })
}

fn filename_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_when_neither_data_nor_url_present() {
        let client = reqwest::Client::new();
        let err = prepare_media(
            &client,
            "/tmp",
            MediaRequest {
                data: None,
                url: None,
                filename: None,
                mime_type: None,
                save_to_temp: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, gateway_protocol::ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn rejects_when_both_data_and_url_present() {
        let client = reqwest::Client::new();
        let err = prepare_media(
            &client,
            "/tmp",
            MediaRequest {
                data: Some("aGVsbG8="),
                url: Some("https://example.com/x.jpg"),
                filename: None,
                mime_type: None,
                save_to_temp: Some(false),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, gateway_protocol::ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn decodes_raw_base64_without_data_url_prefix() {
        let client = reqwest::Client::new();
        let prepared = prepare_media(
            &client,
            "/tmp",
            MediaRequest {
                data: Some("aGVsbG8="),
                url: None,
                filename: Some("hello.txt"),
                mime_type: None,
                save_to_temp: Some(false),
            },
        )
        .await
        .unwrap();
        assert_eq!(prepared.handle.base64, "aGVsbG8=");
        assert!(prepared.preview_path.is_none());
    }

    #[tokio::test]
    async fn decodes_data_url_with_comma_delimiter() {
        let client = reqwest::Client::new();
        let prepared = prepare_media(
            &client,
            "/tmp",
            MediaRequest {
                data: Some("data:image/png;base64,aGVsbG8="),
                url: None,
                filename: None,
                mime_type: None,
                save_to_temp: Some(false),
            },
        )
        .await
        .unwrap();
        assert_eq!(prepared.handle.base64, "aGVsbG8=");
    }

    #[tokio::test]
    async fn oversized_data_payload_is_rejected() {
        let client = reqwest::Client::new();
        let huge = BASE64.encode(vec![0u8; (MAX_MEDIA_BYTES + 1) as usize]);
        let err = prepare_media(
            &client,
            "/tmp",
            MediaRequest {
                data: Some(&huge),
                url: None,
                filename: None,
                mime_type: None,
                save_to_temp: Some(false),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, gateway_protocol::ErrorCode::MediaTooLarge);
    }

    #[test]
    fn filename_from_url_strips_query_string() {
        assert_eq!(
            filename_from_url("https://example.com/path/photo.jpg?x=1"),
            Some("photo.jpg".to_string())
        );
    }
}
