use std::path::Path;

/// Name used when an upload arrives without a usable filename
pub const FALLBACK_FILENAME: &str = "upload.bin";

/// Reduces a client-supplied filename to something safe to store and to echo in
/// a `Content-Disposition` header. Path components are stripped and reserved or
/// control characters become `_`.
pub fn sanitize_filename(filename: &str) -> String {
    // Treat both separators as path separators regardless of platform
    let unified = filename.replace('\\', "/");
    let name = Path::new(&unified)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if filename.contains("..") {
        tracing::warn!("Path traversal attempt in filename: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control()
                || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ';')
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Limit length safely for UTF-8
    let sanitized = if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    };

    let trimmed = sanitized.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return FALLBACK_FILENAME.to_string();
    }
    trimmed.to_string()
}

/// `Content-Disposition` value for an attachment download.
pub fn attachment_disposition(filename: &str) -> String {
    format!("attachment; filename=\"{}\"", sanitize_filename(filename))
}
