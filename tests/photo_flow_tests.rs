//! Photo path end to end without the network: multipart fixture through the
//! pipeline to staged WebP variants, plus completeness and backoff behavior.

use std::time::Duration;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat, RgbImage};
use rets_sync::photos::pipeline::{class_long_name, ImagePipeline};
use rets_sync::photos::storage::{backoff_delay, CompletenessTracker, MAX_DELAY};
use rets_sync::rets::multipart::{boundary_from_content_type, split_parts};

fn jpeg_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb(rgb)));
    let mut cursor = std::io::Cursor::new(Vec::new());
    image.write_to(&mut cursor, ImageFormat::Jpeg).unwrap();
    cursor.into_inner()
}

fn multipart_body(boundary: &str, photos: &[(u32, Vec<u8>)]) -> Bytes {
    let mut buf = Vec::new();
    for (object_id, jpeg) in photos {
        buf.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        buf.extend_from_slice(
            format!(
                "Content-Type: image/jpeg\r\nObject-ID: {}\r\nContent-Label: Photo {}\r\n\r\n",
                object_id, object_id
            )
            .as_bytes(),
        );
        buf.extend_from_slice(jpeg);
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    Bytes::from(buf)
}

#[tokio::test]
async fn three_photo_listing_stages_fifteen_variants() {
    let boundary = "rets.photo.boundary";
    let content_type = format!("multipart/mixed; boundary={}", boundary);
    let body = multipart_body(
        boundary,
        &[
            (0, jpeg_bytes(640, 480, [200, 10, 10])),
            (1, jpeg_bytes(800, 600, [10, 200, 10])),
            (2, jpeg_bytes(320, 240, [10, 10, 200])),
        ],
    );

    let boundary = boundary_from_content_type(&content_type).unwrap();
    let parts = split_parts(&body, &boundary);
    assert_eq!(parts.len(), 3);

    // Feed the parts through the pipeline the way the scheduler does.
    let photos: Vec<rets_sync::photos::fetcher::FetchedPhoto> = parts
        .iter()
        .map(|part| rets_sync::photos::fetcher::FetchedPhoto {
            object_id: part.header("object-id").unwrap().to_string(),
            source_headers: Default::default(),
            data: part.body.clone(),
        })
        .collect();

    let staging = tempfile::tempdir().unwrap();
    let pipeline = ImagePipeline::new(staging.path());
    let (dir, processed) = pipeline
        .process_listing("RE_1", "230475", photos)
        .await
        .unwrap();

    assert!(dir.ends_with("Photos/Residential/230475"));
    assert_eq!(processed.len(), 3);

    let mut staged = 0;
    for object_id in ["0", "1", "2"] {
        for variant in ["original", "large", "medium", "small", "thumb"] {
            let file = dir.join(format!("{}-{}.webp", variant, object_id));
            assert!(file.exists(), "missing {}", file.display());
            staged += 1;
        }
    }
    assert_eq!(staged, 15);
    assert!(dir.join("metadata.json").exists());

    let sidecar: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.join("metadata.json")).unwrap()).unwrap();
    assert_eq!(sidecar.as_array().unwrap().len(), 3);
    assert!(sidecar[0]["dominant_color"].is_array());
}

#[test]
fn completeness_across_object_ids_gates_cleanup() {
    let tracker = CompletenessTracker::new();
    // Variants arrive interleaved across the listing's three photos; the
    // listing completes once each of the five variant names has landed.
    assert!(!tracker.record("230475", "original-0.webp"));
    assert!(!tracker.record("230475", "large-1.webp"));
    assert!(!tracker.record("230475", "medium-2.webp"));
    assert!(!tracker.record("230475", "small-0.webp"));
    assert!(tracker.record("230475", "thumb-1.webp"));
}

#[test]
fn retry_backoff_schedule_for_three_failures() {
    // Upload attempts 1-3 fail: the sleeps follow 1s, 2s, 4s scaled by
    // (1 + jitter), jitter below 0.1, all capped at 30s.
    for (failures, base) in [(1u32, 1.0f64), (2, 2.0), (3, 4.0)] {
        let low = backoff_delay(failures, 0.0);
        let high = backoff_delay(failures, 0.0999);
        assert_eq!(low, Duration::from_secs_f64(base));
        assert!(high < Duration::from_secs_f64(base * 1.1));
        assert!(high <= MAX_DELAY);
    }
}

#[test]
fn class_directories_match_photo_keys() {
    for (class, long) in [
        ("RE_1", "Residential"),
        ("MF_4", "MultiFamily"),
        ("CI_3", "Commercial"),
        ("LD_2", "Land"),
    ] {
        assert_eq!(class_long_name(class), long);
    }
}
