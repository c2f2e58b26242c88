use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::path::Path;

/// Largest image the console will upload.
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

pub fn mime_type_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

pub fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}

/// Reads an image file into a `data:` URL suitable for `analyze_image`.
pub async fn load_data_url(path: &Path) -> Result<String> {
    let Some(mime_type) = mime_type_for(path) else {
        bail!("Unsupported image type: {} (expected png, jpg, gif or webp)", path.display());
    };
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read image {}", path.display()))?;
    if bytes.len() > MAX_IMAGE_BYTES {
        bail!("Image {} is larger than {} MB", path.display(), MAX_IMAGE_BYTES / (1024 * 1024));
    }
    Ok(data_url(mime_type, &bytes))
}
