/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::blob::BlobStore;
use crate::fetch::Fetcher;
use crate::store::{Attachment, Store};
use anyhow::{Context, Result};
use std::io::Cursor;
use tracing::{info, warn};

const MAX_DIMENSION: u32 = 1600;
const PDF_LIMIT: usize = 1_000_000;
const MISC_LIMIT: usize = 100_000;

/// Attachment types worth keeping a local copy of.
pub fn wants_local_copy(attachment_type: &str, media: &str) -> bool {
    if attachment_type != "Document" && attachment_type != "Image" {
        return false;
    }
    let media = media.to_lowercase();
    media == "text/plain" || media == "application/pdf" || media.starts_with("image")
}

/// Size policy applied after the body arrives.
pub fn size_allows(media: &str, len: usize) -> bool {
    if media.starts_with("image") {
        return true;
    }
    if media == "application/pdf" {
        return len <= PDF_LIMIT;
    }
    len <= MISC_LIMIT
}

/// Decode and re-encode an image, bounding its dimensions. The output bytes
/// and media type replace whatever the remote claimed.
pub fn normalize_image(data: &[u8]) -> Result<(Vec<u8>, String)> {
    let img = image::load_from_memory(data).context("decode image")?;
    let (w, h) = (img.width(), img.height());
    let img = if w > MAX_DIMENSION || h > MAX_DIMENSION {
        img.resize(
            MAX_DIMENSION,
            MAX_DIMENSION,
            image::imageops::FilterType::Triangle,
        )
    } else {
        img
    };
    let mut buf = Vec::new();
    if img.color().has_alpha() {
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .context("encode png")?;
        Ok((buf, "image/png".to_string()))
    } else {
        let rgb = img.to_rgb8();
        let mut enc = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 80);
        enc.encode_image(&rgb).context("encode jpeg")?;
        Ok((buf, "image/jpeg".to_string()))
    }
}

/// Fetch, normalize and persist one attachment. Returns None when the
/// attachment is not worth keeping at all (no url, or an image that would
/// not decode). Localization failures fall back to metadata-only rows.
pub async fn save_attachment(
    store: &Store,
    blobs: &BlobStore,
    fetcher: &Fetcher,
    server_name: &str,
    url: &str,
    name: &str,
    desc: &str,
    media: &str,
    localize: bool,
) -> Option<Attachment> {
    if url.is_empty() {
        return None;
    }
    match store.find_attachment_by_url(url) {
        Ok(Some(att)) => return Some(att),
        Ok(None) => {}
        Err(e) => warn!("error finding attachment: {e:#}"),
    }
    info!("saving attachment: {url}");

    let mut media = media.to_string();
    if media.is_empty() {
        if let Some(m) = mime_guess::from_path(url).first() {
            media = m.to_string();
        }
    }
    let mut localize = localize;
    let mut data = Vec::new();
    if localize {
        match fetcher.fetch_binary(url).await {
            Ok(body) => data = body,
            Err(e) => {
                info!("error fetching attachment: {e:#}");
                localize = false;
            }
        }
        if data.len() == crate::fetch::BINARY_BODY_LIMIT {
            info!("truncation likely");
        }
    }
    if localize {
        if media.starts_with("image") {
            match normalize_image(&data) {
                Ok((normalized, newmedia)) => {
                    data = normalized;
                    media = newmedia;
                }
                Err(e) => {
                    info!("unable to decode image: {e:#}");
                    return None;
                }
            }
        } else if !size_allows(&media, data.len()) {
            info!("not saving large attachment");
            localize = false;
            data.clear();
        }
    }

    let mut xid = String::new();
    let mut url = url.to_string();
    if localize {
        match blobs.save_file_body(&media, &data) {
            Ok(x) => xid = x,
            Err(e) => {
                warn!("error saving file body: {e:#}");
                return None;
            }
        }
        if url.is_empty() {
            url = format!("https://{server_name}/d/{xid}");
        }
    }
    match store.save_file_metadata(&xid, name, desc, &url, &media, localize) {
        Ok(file_id) => Some(Attachment {
            file_id,
            xid,
            name: name.to_string(),
            desc: desc.to_string(),
            url,
            media,
            local: localize,
        }),
        Err(e) => {
            warn!("error saving file metadata: {e:#}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localization_policy_by_type_and_mime() {
        assert!(wants_local_copy("Image", "image/png"));
        assert!(wants_local_copy("Document", "application/pdf"));
        assert!(wants_local_copy("Document", "text/plain"));
        assert!(!wants_local_copy("Document", "video/mp4"));
        assert!(!wants_local_copy("Link", "image/png"));
    }

    #[test]
    fn size_policy() {
        assert!(size_allows("image/jpeg", 9_000_000));
        assert!(size_allows("application/pdf", 900_000));
        assert!(!size_allows("application/pdf", 1_100_000));
        assert!(size_allows("text/plain", 50_000));
        assert!(!size_allows("text/plain", 150_000));
    }

    #[test]
    fn images_reencode_and_garbage_fails() {
        let mut png = Vec::new();
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([200u8, 10, 10]));
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let (out, media) = normalize_image(&png).unwrap();
        assert!(!out.is_empty());
        assert_eq!(media, "image/jpeg");

        assert!(normalize_image(b"definitely not an image").is_err());
    }

    #[test]
    fn alpha_images_stay_png() {
        let mut png = Vec::new();
        let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([200u8, 10, 10, 100]));
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let (_, media) = normalize_image(&png).unwrap();
        assert_eq!(media, "image/png");
    }
}
