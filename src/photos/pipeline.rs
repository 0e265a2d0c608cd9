//! Image pipeline: per source photo, five WebP size variants, a dominant
//! color, and a metadata sidecar in the listing's staging directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

use crate::error::PhotoError;
use crate::photos::fetcher::FetchedPhoto;

/// One size preset.
#[derive(Debug, Clone, Copy)]
pub struct VariantSpec {
    pub name: &'static str,
    /// Width cap; `None` re-encodes at source dimensions.
    pub max_width: Option<u32>,
    pub quality: f32,
}

/// The five presets, largest first.
pub const VARIANTS: [VariantSpec; 5] = [
    VariantSpec { name: "original", max_width: None, quality: 90.0 },
    VariantSpec { name: "large", max_width: Some(1920), quality: 85.0 },
    VariantSpec { name: "medium", max_width: Some(1280), quality: 80.0 },
    VariantSpec { name: "small", max_width: Some(800), quality: 75.0 },
    VariantSpec { name: "thumb", max_width: Some(400), quality: 70.0 },
];

/// Directory name per property class under the photo staging root.
pub fn class_long_name(class: &str) -> &str {
    match class {
        "RE_1" => "Residential",
        "MF_4" => "MultiFamily",
        "CI_3" => "Commercial",
        "LD_2" => "Land",
        other => other,
    }
}

/// Target dimensions under a width cap, aspect preserved, never enlarged.
pub fn target_dimensions(width: u32, height: u32, max_width: Option<u32>) -> (u32, u32) {
    match max_width {
        Some(cap) if width > cap => {
            let scaled = (height as u64 * cap as u64) / width as u64;
            (cap, (scaled as u32).max(1))
        }
        _ => (width, height),
    }
}

/// Average RGB over a downsampled copy of the image.
pub fn dominant_color(image: &DynamicImage) -> [u8; 3] {
    let sample = image.thumbnail(64, 64).to_rgb8();
    let pixel_count = (sample.width() as u64 * sample.height() as u64).max(1);
    let mut sums = [0u64; 3];
    for pixel in sample.pixels() {
        sums[0] += pixel.0[0] as u64;
        sums[1] += pixel.0[1] as u64;
        sums[2] += pixel.0[2] as u64;
    }
    [
        (sums[0] / pixel_count) as u8,
        (sums[1] / pixel_count) as u8,
        (sums[2] / pixel_count) as u8,
    ]
}

/// One written variant file.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedVariant {
    pub name: String,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub format: String,
}

/// One fully derived photo.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedPhoto {
    pub object_id: String,
    pub dominant_color: [u8; 3],
    pub variants: Vec<ProcessedVariant>,
    pub source_headers: BTreeMap<String, String>,
}

/// Decode a source buffer, routing non-JPEG inputs through an in-memory
/// JPEG re-encode first.
fn decode_source(object_id: &str, data: &Bytes) -> Result<DynamicImage, PhotoError> {
    let guessed = image::guess_format(data).ok();
    if guessed == Some(ImageFormat::Jpeg) {
        return image::load_from_memory_with_format(data, ImageFormat::Jpeg).map_err(|e| {
            PhotoError::Decode {
                object_id: object_id.to_string(),
                message: e.to_string(),
            }
        });
    }

    // Non-JPEG source: decode whatever it is, round-trip through JPEG, and
    // decode that as the canonical source buffer.
    let decoded = image::load_from_memory(data).map_err(|e| PhotoError::Decode {
        object_id: object_id.to_string(),
        message: e.to_string(),
    })?;
    let mut jpeg = std::io::Cursor::new(Vec::new());
    decoded
        .to_rgb8()
        .write_to(&mut jpeg, ImageFormat::Jpeg)
        .map_err(|e| PhotoError::Encode {
            object_id: object_id.to_string(),
            message: e.to_string(),
        })?;
    image::load_from_memory_with_format(&jpeg.into_inner(), ImageFormat::Jpeg).map_err(|e| {
        PhotoError::Decode {
            object_id: object_id.to_string(),
            message: e.to_string(),
        }
    })
}

/// Lossy WebP encode at the given quality.
fn encode_webp(image: &DynamicImage, quality: f32) -> Result<Vec<u8>, String> {
    let rgb = image.to_rgb8();
    let encoder = webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height());
    Ok(encoder.encode(quality).to_vec())
}

/// Derive one variant in memory.
fn derive_variant(
    source: &DynamicImage,
    spec: &VariantSpec,
    object_id: &str,
) -> Result<(ProcessedVariant, Vec<u8>), PhotoError> {
    let (width, height) = target_dimensions(source.width(), source.height(), spec.max_width);
    let resized = if (width, height) == (source.width(), source.height()) {
        source.clone()
    } else {
        source.resize_exact(width, height, image::imageops::FilterType::Lanczos3)
    };

    let bytes = encode_webp(&resized, spec.quality).map_err(|message| PhotoError::Encode {
        object_id: object_id.to_string(),
        message,
    })?;

    Ok((
        ProcessedVariant {
            name: spec.name.to_string(),
            file_name: format!("{}-{}.webp", spec.name, object_id),
            width,
            height,
            byte_size: bytes.len() as u64,
            format: "webp".to_string(),
        },
        bytes,
    ))
}

pub struct ImagePipeline {
    staging_root: PathBuf,
}

impl ImagePipeline {
    /// `staging_root` is the cache directory; listings land under
    /// `<staging_root>/Photos/<ClassLongName>/<listingId>/`.
    pub fn new(staging_root: &Path) -> Self {
        Self {
            staging_root: staging_root.to_path_buf(),
        }
    }

    /// Staging directory for one listing.
    pub fn listing_dir(&self, property_type: &str, listing_id: &str) -> PathBuf {
        self.staging_root
            .join("Photos")
            .join(class_long_name(property_type))
            .join(listing_id)
    }

    /// Process every photo of a listing: write the five variants per photo
    /// plus the `metadata.json` sidecar. Undecodable photos are logged and
    /// skipped; the rest of the listing continues.
    pub async fn process_listing(
        &self,
        property_type: &str,
        listing_id: &str,
        photos: Vec<FetchedPhoto>,
    ) -> Result<(PathBuf, Vec<ProcessedPhoto>), PhotoError> {
        let dir = self.listing_dir(property_type, listing_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut processed = Vec::new();
        for photo in photos {
            if photo.data.is_empty() {
                continue;
            }
            match self.process_photo(&dir, photo).await {
                Ok(result) => processed.push(result),
                Err(err) => {
                    warn!(listing_id, error = %err, "photo dropped from listing");
                }
            }
        }

        let sidecar = dir.join("metadata.json");
        tokio::fs::write(
            &sidecar,
            serde_json::to_vec_pretty(&processed).unwrap_or_default(),
        )
        .await?;
        debug!(
            listing_id,
            photos = processed.len(),
            dir = %dir.display(),
            "listing variants staged"
        );

        Ok((dir, processed))
    }

    async fn process_photo(
        &self,
        dir: &Path,
        photo: FetchedPhoto,
    ) -> Result<ProcessedPhoto, PhotoError> {
        let object_id = photo.object_id.clone();
        let data = photo.data.clone();

        // Decode once on a blocking thread; variants then derive in parallel
        // from the shared source image.
        let decode_id = object_id.clone();
        let source = spawn_blocking(move || decode_source(&decode_id, &data))
            .await
            .map_err(|e| PhotoError::Decode {
                object_id: object_id.clone(),
                message: e.to_string(),
            })??;
        let source = Arc::new(source);
        let color = dominant_color(&source);

        let tasks = VARIANTS.iter().map(|spec| {
            let source = source.clone();
            let spec = *spec;
            let object_id = object_id.clone();
            spawn_blocking(move || derive_variant(&source, &spec, &object_id))
        });

        let mut variants = Vec::new();
        for joined in join_all(tasks).await {
            let (variant, bytes) = joined.map_err(|e| PhotoError::Encode {
                object_id: object_id.clone(),
                message: e.to_string(),
            })??;
            tokio::fs::write(dir.join(&variant.file_name), &bytes).await?;
            variants.push(variant);
        }

        Ok(ProcessedPhoto {
            object_id,
            dominant_color: color,
            variants,
            source_headers: photo.source_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn solid_image(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb(rgb)))
    }

    #[test]
    fn class_long_names() {
        assert_eq!(class_long_name("RE_1"), "Residential");
        assert_eq!(class_long_name("MF_4"), "MultiFamily");
        assert_eq!(class_long_name("CI_3"), "Commercial");
        assert_eq!(class_long_name("LD_2"), "Land");
        assert_eq!(class_long_name("ZZ_9"), "ZZ_9");
    }

    #[test]
    fn resize_never_enlarges() {
        assert_eq!(target_dimensions(3000, 2000, Some(1920)), (1920, 1280));
        assert_eq!(target_dimensions(800, 600, Some(1920)), (800, 600));
        assert_eq!(target_dimensions(800, 600, None), (800, 600));
        assert_eq!(target_dimensions(400, 400, Some(400)), (400, 400));
    }

    #[test]
    fn tall_images_keep_aspect() {
        let (w, h) = target_dimensions(2000, 4000, Some(400));
        assert_eq!((w, h), (400, 800));
    }

    #[test]
    fn dominant_color_of_solid_image() {
        let image = solid_image(100, 80, [200, 40, 90]);
        assert_eq!(dominant_color(&image), [200, 40, 90]);
    }

    #[test]
    fn variant_presets_cover_the_five_sizes() {
        let names: Vec<&str> = VARIANTS.iter().map(|v| v.name).collect();
        assert_eq!(names, ["original", "large", "medium", "small", "thumb"]);
        assert_eq!(VARIANTS[0].max_width, None);
        assert_eq!(VARIANTS[4].max_width, Some(400));
    }

    #[test]
    fn derive_variant_respects_cap_and_names_file() {
        let source = solid_image(1000, 500, [10, 20, 30]);
        let spec = VariantSpec { name: "small", max_width: Some(800), quality: 75.0 };
        let (variant, bytes) = derive_variant(&source, &spec, "2").unwrap();
        assert_eq!(variant.file_name, "small-2.webp");
        assert_eq!((variant.width, variant.height), (800, 400));
        assert_eq!(variant.byte_size, bytes.len() as u64);
        assert_eq!(variant.format, "webp");
        // RIFF container magic.
        assert_eq!(&bytes[..4], b"RIFF");
    }

    #[test]
    fn decode_source_accepts_png_via_jpeg_roundtrip() {
        let mut png = std::io::Cursor::new(Vec::new());
        solid_image(32, 32, [1, 2, 3])
            .write_to(&mut png, ImageFormat::Png)
            .unwrap();
        let decoded = decode_source("7", &Bytes::from(png.into_inner())).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
    }

    #[test]
    fn decode_source_rejects_garbage() {
        let err = decode_source("9", &Bytes::from_static(b"not an image at all")).unwrap_err();
        assert!(matches!(err, PhotoError::Decode { .. }));
    }

    #[tokio::test]
    async fn process_listing_writes_variants_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ImagePipeline::new(dir.path());

        let mut jpeg = std::io::Cursor::new(Vec::new());
        solid_image(640, 480, [120, 130, 140])
            .write_to(&mut jpeg, ImageFormat::Jpeg)
            .unwrap();
        let photos = vec![FetchedPhoto {
            object_id: "0".to_string(),
            source_headers: BTreeMap::from([(
                "content-label".to_string(),
                "Front".to_string(),
            )]),
            data: Bytes::from(jpeg.into_inner()),
        }];

        let (listing_dir, processed) = pipeline
            .process_listing("RE_1", "230475", photos)
            .await
            .unwrap();

        assert!(listing_dir.ends_with("Photos/Residential/230475"));
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].variants.len(), 5);
        for name in ["original", "large", "medium", "small", "thumb"] {
            assert!(listing_dir.join(format!("{}-0.webp", name)).exists());
        }
        assert!(listing_dir.join("metadata.json").exists());

        // Source smaller than every cap: no variant exceeds it.
        for variant in &processed[0].variants {
            assert!(variant.width <= 640);
        }
        assert_eq!(processed[0].source_headers["content-label"], "Front");
    }

    #[tokio::test]
    async fn process_listing_skips_undecodable_photo() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ImagePipeline::new(dir.path());

        let mut jpeg = std::io::Cursor::new(Vec::new());
        solid_image(64, 64, [5, 5, 5])
            .write_to(&mut jpeg, ImageFormat::Jpeg)
            .unwrap();
        let photos = vec![
            FetchedPhoto {
                object_id: "0".to_string(),
                source_headers: BTreeMap::new(),
                data: Bytes::from_static(b"definitely not an image"),
            },
            FetchedPhoto {
                object_id: "1".to_string(),
                source_headers: BTreeMap::new(),
                data: Bytes::from(jpeg.into_inner()),
            },
        ];

        let (_dir, processed) = pipeline
            .process_listing("LD_2", "99", photos)
            .await
            .unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].object_id, "1");
    }
}
