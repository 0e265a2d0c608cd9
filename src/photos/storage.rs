//! Object storage uploads: SigV4-signed PUTs against an S3-compatible
//! endpoint with bounded exponential backoff, plus the per-listing variant
//! completeness tracker that drives staging cleanup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ObjectStorageConfig;
use crate::error::PhotoError;

/// Upload attempts per key.
pub const MAX_ATTEMPTS: u32 = 5;
/// Backoff base.
pub const BASE_DELAY: Duration = Duration::from_secs(1);
/// Backoff ceiling.
pub const MAX_DELAY: Duration = Duration::from_secs(30);
/// Jitter fraction upper bound.
pub const JITTER_MAX: f64 = 0.1;

/// Files at or above this size stream from disk instead of buffering.
pub const STREAM_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;

const REGION: &str = "us-east-1";
const SERVICE: &str = "s3";

/// The variant set a listing must cover before its staging directory can go.
pub const VARIANT_NAMES: [&str; 5] = ["original", "large", "medium", "small", "thumb"];

/// Backoff before retry `n` (1-based count of failures so far):
/// `min(base * 2^(n-1) * (1 + jitter), max)`.
pub fn backoff_delay(failures: u32, jitter: f64) -> Duration {
    let exp = BASE_DELAY.as_secs_f64() * 2_f64.powi(failures.saturating_sub(1) as i32);
    let with_jitter = exp * (1.0 + jitter);
    Duration::from_secs_f64(with_jitter.min(MAX_DELAY.as_secs_f64()))
}

/// Content type by file extension.
pub fn content_type_for(file_name: &str) -> &'static str {
    match file_name.rsplit('.').next() {
        Some("webp") => "image/webp",
        Some("json") => "application/json",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn signing_key(secret_key: &str, date: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, REGION.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn uri_encode_path(path: &str) -> String {
    use std::fmt::Write;
    let mut result = String::with_capacity(path.len() * 3);
    for c in path.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' | '/' => result.push(c),
            _ => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).as_bytes() {
                    let _ = write!(result, "%{:02X}", b);
                }
            }
        }
    }
    result
}

/// Signed header set for one PUT.
#[derive(Debug)]
struct SignedRequest {
    url: String,
    headers: Vec<(&'static str, String)>,
}

pub struct ObjectStore {
    http: reqwest::Client,
    config: ObjectStorageConfig,
}

impl ObjectStore {
    pub fn new(config: ObjectStorageConfig) -> Result<Self, PhotoError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| PhotoError::Storage {
                attempts: 0,
                message: e.to_string(),
            })?;
        Ok(Self { http, config })
    }

    /// Public URL of an uploaded key.
    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket,
            key
        )
    }

    /// Upload a file: buffered below the streaming threshold, streamed with
    /// an unsigned payload above it. Retries with exponential backoff.
    pub async fn put_file(&self, key: &str, path: &Path) -> Result<(), PhotoError> {
        let size = tokio::fs::metadata(path).await?.len();
        if size < STREAM_THRESHOLD_BYTES {
            let bytes = Bytes::from(tokio::fs::read(path).await?);
            return self.put_object(key, bytes).await;
        }
        self.retrying(key, |attempt| {
            let path = path.to_path_buf();
            let key = key.to_string();
            async move {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| e.to_string())?;
                let stream = tokio_util::io::ReaderStream::new(file);
                let body = reqwest::Body::wrap_stream(stream);
                debug!(key = %key, attempt, size, "streaming upload");
                self.send(&key, body, "UNSIGNED-PAYLOAD", Some(size)).await
            }
        })
        .await
    }

    /// Upload a buffered object with a signed payload hash.
    pub async fn put_object(&self, key: &str, bytes: Bytes) -> Result<(), PhotoError> {
        let payload_hash = hex_sha256(&bytes);
        self.retrying(key, |attempt| {
            let bytes = bytes.clone();
            let payload_hash = payload_hash.clone();
            let key = key.to_string();
            async move {
                debug!(key = %key, attempt, size = bytes.len(), "buffered upload");
                let size = bytes.len() as u64;
                self.send(&key, reqwest::Body::from(bytes), &payload_hash, Some(size))
                    .await
            }
        })
        .await
    }

    async fn retrying<'a, F, Fut>(&'a self, key: &str, mut attempt_fn: F) -> Result<(), PhotoError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<(), String>> + 'a,
    {
        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match attempt_fn(attempt).await {
                Ok(()) => return Ok(()),
                Err(message) => {
                    last_error = message;
                    if attempt < MAX_ATTEMPTS {
                        let jitter = rand::thread_rng().gen_range(0.0..JITTER_MAX);
                        let delay = backoff_delay(attempt, jitter);
                        warn!(
                            key,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "upload failed, backing off"
                        );
                        sleep(delay).await;
                    }
                }
            }
        }
        Err(PhotoError::Storage {
            attempts: MAX_ATTEMPTS,
            message: format!("{}: {}", key, last_error),
        })
    }

    async fn send(
        &self,
        key: &str,
        body: reqwest::Body,
        payload_hash: &str,
        content_length: Option<u64>,
    ) -> Result<(), String> {
        let signed = self.sign(key, payload_hash, Utc::now());
        let mut request = self
            .http
            .put(&signed.url)
            .header("Content-Type", content_type_for(key));
        for (name, value) in &signed.headers {
            request = request.header(*name, value);
        }
        if let Some(length) = content_length {
            request = request.header("Content-Length", length);
        }

        let response = request.body(body).send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("status {}", status.as_u16()))
        }
    }

    /// SigV4 header signing: host, acl, content hash, and date are signed;
    /// the Authorization header carries the derived signature.
    fn sign(&self, key: &str, payload_hash: &str, now: DateTime<Utc>) -> SignedRequest {
        let date = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = format!("{}/{}/{}/aws4_request", date, REGION, SERVICE);

        let endpoint = self.config.endpoint.trim_end_matches('/');
        let host = endpoint
            .strip_prefix("https://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .unwrap_or(endpoint)
            .split('/')
            .next()
            .unwrap_or(endpoint)
            .to_string();

        let canonical_uri = uri_encode_path(&format!("/{}/{}", self.config.bucket, key));
        let header_map: BTreeMap<&str, String> = BTreeMap::from([
            ("host", host),
            ("x-amz-acl", "public-read".to_string()),
            ("x-amz-content-sha256", payload_hash.to_string()),
            ("x-amz-date", amz_date.clone()),
        ]);

        let canonical_headers: String = header_map
            .iter()
            .map(|(name, value)| format!("{}:{}\n", name, value))
            .collect();
        let signed_headers = header_map
            .keys()
            .copied()
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "PUT\n{}\n\n{}\n{}\n{}",
            canonical_uri, canonical_headers, signed_headers, payload_hash
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac_sha256(
            &signing_key(&self.config.secret_key, &date),
            string_to_sign.as_bytes(),
        ));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key, credential_scope, signed_headers, signature
        );

        SignedRequest {
            url: format!("{}{}", endpoint, canonical_uri),
            headers: vec![
                ("Authorization", authorization),
                ("x-amz-acl", "public-read".to_string()),
                ("x-amz-content-sha256", payload_hash.to_string()),
                ("x-amz-date", amz_date),
            ],
        }
    }
}

/// Tracks which variants have reached the object store per listing. Once a
/// listing covers all five, its staging directory is safe to remove.
#[derive(Debug, Default)]
pub struct CompletenessTracker {
    inner: Mutex<HashMap<String, HashSet<&'static str>>>,
}

impl CompletenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one uploaded file. Returns true when the listing now covers
    /// every variant. Matching is by prefix on the file stem, so every
    /// object id of a multi-photo listing counts toward the same set.
    pub fn record(&self, listing_id: &str, file_name: &str) -> bool {
        let Some(variant) = VARIANT_NAMES
            .iter()
            .find(|name| file_name.starts_with(&format!("{}-", name)))
        else {
            return self.is_complete(listing_id);
        };

        let mut inner = self.inner.lock().expect("completeness lock");
        let set = inner.entry(listing_id.to_string()).or_default();
        set.insert(variant);
        set.len() == VARIANT_NAMES.len()
    }

    pub fn is_complete(&self, listing_id: &str) -> bool {
        self.inner
            .lock()
            .expect("completeness lock")
            .get(listing_id)
            .map(|set| set.len() == VARIANT_NAMES.len())
            .unwrap_or(false)
    }

    /// Forget a listing after its directory is cleaned up.
    pub fn clear(&self, listing_id: &str) {
        self.inner
            .lock()
            .expect("completeness lock")
            .remove(listing_id);
    }
}

/// Upload every staged file of a listing and remove the staging directory
/// once all five variants are confirmed stored.
pub async fn sync_listing_dir(
    store: &ObjectStore,
    tracker: &CompletenessTracker,
    property_class_long: &str,
    listing_id: &str,
    dir: &Path,
) -> Result<(), PhotoError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut uploads = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            uploads.push(entry.path());
        }
    }

    for path in &uploads {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let key = format!("Photos/{}/{}/{}", property_class_long, listing_id, file_name);
        store.put_file(&key, path).await?;
        tracker.record(listing_id, &file_name);
    }

    if tracker.is_complete(listing_id) {
        tokio::fs::remove_dir_all(dir).await?;
        tracker.clear(listing_id);
        info!(listing_id, "staging directory removed after full upload");
    }
    Ok(())
}
