//! Photo fetching over GetObject.
//!
//! Property photo parts are emitted verbatim as bounded by the multipart
//! framing. Agent and Office photos arrive with extra vendor framing ahead
//! of the image, so those are cut down to the JPEG start-of-image marker.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::error::RetsError;
use crate::rets::multipart::{self, RawPart};
use crate::rets::{RetsClient, Session};

/// Bodies shorter than this are "no photos" responses (error envelopes or
/// empty payloads), never images.
pub const MIN_PHOTO_RESPONSE_BYTES: usize = 100;

/// Named part headers surfaced to the pipeline sidecar.
const NAMED_HEADERS: [&str; 5] = [
    "last-modified",
    "content-sub-description",
    "content-label",
    "accessibility",
    "photo-timestamp",
];

/// One photo pulled from a GetObject response.
#[derive(Debug, Clone)]
pub struct FetchedPhoto {
    pub object_id: String,
    /// Named part headers plus every `X-` prefixed one, original casing
    /// normalized to lowercase keys.
    pub source_headers: BTreeMap<String, String>,
    pub data: Bytes,
}

pub struct PhotoFetcher {
    client: Arc<RetsClient>,
}

impl PhotoFetcher {
    pub fn new(client: Arc<RetsClient>) -> Self {
        Self { client }
    }

    /// Fetch every photo of a property listing. Part bodies are preserved
    /// verbatim.
    pub async fn property_photos(
        &self,
        session: &Session,
        listing_id: &str,
    ) -> Result<Vec<FetchedPhoto>, RetsError> {
        let (body, headers) = self
            .get_object(
                session,
                &[
                    ("Resource", "Property".to_string()),
                    ("Type", "Photo".to_string()),
                    ("ID", format!("{}:*", listing_id)),
                ],
            )
            .await?;

        if body.len() < MIN_PHOTO_RESPONSE_BYTES {
            debug!(listing_id, bytes = body.len(), "GetObject body too small, treating as no photos");
            return Ok(Vec::new());
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let Some(boundary) = multipart::boundary_from_content_type(content_type) else {
            // Single-image response: the whole body is the photo.
            return Ok(vec![FetchedPhoto {
                object_id: listing_id.to_string(),
                source_headers: BTreeMap::new(),
                data: body,
            }]);
        };

        Ok(multipart::split_parts(&body, &boundary)
            .iter()
            .filter_map(|part| extract_photo(part, listing_id, false))
            .collect())
    }

    /// Fetch Agent or Office photos. These responses prepend vendor framing
    /// inside each part, so payloads are trimmed to the JPEG magic.
    pub async fn roster_photos(
        &self,
        session: &Session,
        resource: &str,
        object_key: &str,
    ) -> Result<Vec<FetchedPhoto>, RetsError> {
        let (body, headers) = self
            .get_object(
                session,
                &[
                    ("Resource", resource.to_string()),
                    ("Type", "Photo".to_string()),
                    ("ID", format!("{}:*", object_key)),
                    ("Location", "0".to_string()),
                ],
            )
            .await?;

        if body.len() < MIN_PHOTO_RESPONSE_BYTES {
            return Ok(Vec::new());
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let Some(boundary) = multipart::boundary_from_content_type(content_type) else {
            return Ok(multipart::find_jpeg_start(&body)
                .map(|start| FetchedPhoto {
                    object_id: object_key.to_string(),
                    source_headers: BTreeMap::new(),
                    data: body.slice(start..),
                })
                .into_iter()
                .collect());
        };

        Ok(multipart::split_parts(&body, &boundary)
            .iter()
            .filter_map(|part| extract_photo(part, object_key, true))
            .collect())
    }

    async fn get_object(
        &self,
        session: &Session,
        params: &[(&str, String)],
    ) -> Result<(Bytes, reqwest::header::HeaderMap), RetsError> {
        let capability = session.capability("GetObject")?;
        self.client.request(session, capability, params).await
    }
}

/// Turn one multipart part into a photo. Non-image parts are dropped; when
/// `trim_to_jpeg` is set the payload starts at the JPEG magic.
fn extract_photo(
    part: &RawPart,
    fallback_object_id: &str,
    trim_to_jpeg: bool,
) -> Option<FetchedPhoto> {
    if !part.content_type().starts_with("image/") {
        return None;
    }

    let object_id = part
        .header("object-id")
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback_object_id)
        .to_string();

    let mut source_headers = BTreeMap::new();
    for name in NAMED_HEADERS {
        if let Some(value) = part.header(name) {
            source_headers.insert(name.to_string(), value.to_string());
        }
    }
    for (name, value) in &part.headers {
        if name.starts_with("x-") {
            source_headers.insert(name.clone(), value.clone());
        }
    }

    let data = if trim_to_jpeg {
        match multipart::find_jpeg_start(&part.body) {
            Some(start) => part.body.slice(start..),
            None => {
                warn!(object_id = %object_id, "image part without JPEG magic, dropping");
                return None;
            }
        }
    } else {
        part.body.clone()
    };

    if data.is_empty() {
        return None;
    }
    Some(FetchedPhoto {
        object_id,
        source_headers,
        data,
    })
}
