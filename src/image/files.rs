//! Per-character image folders

use std::path::{Path, PathBuf};

/// Make a character name safe to use as a directory name.
///
/// Reserved characters become `_`; leading and trailing spaces and dots
/// are dropped. An empty result becomes `unnamed_character`.
pub fn sanitize_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "unnamed_character".to_string()
    } else {
        trimmed.to_string()
    }
}

/// First free number for `image_NNN.*` files in `dir` (1 if none exist).
pub fn next_image_number(dir: &Path) -> std::io::Result<u32> {
    if !dir.exists() {
        return Ok(1);
    }
    let mut highest = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let number = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("image_"))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(n) = number {
            highest = highest.max(n);
        }
    }
    Ok(highest + 1)
}

/// Write `images` under `<output_dir>/<sanitized name>/`, continuing the numbering.
pub async fn save_images(
    output_dir: &Path,
    character: &str,
    images: &[Vec<u8>],
) -> std::io::Result<Vec<PathBuf>> {
    let dir = output_dir.join(sanitize_name(character));
    tokio::fs::create_dir_all(&dir).await?;

    let first = next_image_number(&dir)?;
    let mut saved = Vec::with_capacity(images.len());
    for (offset, bytes) in images.iter().enumerate() {
        let path = dir.join(format!("image_{:03}.png", first + offset as u32));
        tokio::fs::write(&path, bytes).await?;
        saved.push(path);
    }
    Ok(saved)
}
