//! Content-type resolution for uploaded files.

/// Fallback for anything that is not a known image extension.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Content types the upload path accepts.
pub const ALLOWED_IMAGE_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/bmp",
    "image/webp",
];

/// Resolve the content type of a file.
///
/// A non-blank declared header wins and is returned lower-cased, without
/// checking it against any table. Otherwise the lower-cased extension of
/// `file_name` is mapped; unknown or missing extensions resolve to
/// [`OCTET_STREAM`].
pub fn resolve(declared: Option<&str>, file_name: &str) -> String {
    if let Some(header) = declared.map(str::trim).filter(|h| !h.is_empty()) {
        return header.to_ascii_lowercase();
    }

    let resolved = match extension(file_name).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => OCTET_STREAM,
    };
    resolved.to_string()
}

/// True when `content_type` is one of [`ALLOWED_IMAGE_TYPES`].
pub fn is_allowed_image(content_type: &str) -> bool {
    ALLOWED_IMAGE_TYPES.contains(&content_type)
}

/// Lower-cased text after the last `.` of the final path component.
fn extension(file_name: &str) -> Option<String> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    base.rfind('.')
        .map(|pos| base[pos + 1..].to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_header_wins_and_is_lowercased() {
        assert_eq!(resolve(Some("image/PNG"), "x.png"), "image/png");
        assert_eq!(resolve(Some("Image/Jpeg"), "x.gif"), "image/jpeg");
        assert_eq!(resolve(Some("text/plain"), "x.png"), "text/plain");
    }

    #[test]
    fn blank_header_falls_back_to_extension() {
        assert_eq!(resolve(Some(""), "x.gif"), "image/gif");
        assert_eq!(resolve(Some("   "), "x.BMP"), "image/bmp");
        assert_eq!(resolve(None, "photo.JPEG"), "image/jpeg");
        assert_eq!(resolve(None, "photo.jpg"), "image/jpeg");
        assert_eq!(resolve(None, "a.b.webp"), "image/webp");
        assert_eq!(resolve(None, "dir.png/x.png"), "image/png");
    }

    #[test]
    fn unknown_extensions_are_generic_binary() {
        assert_eq!(resolve(Some(""), "x.xyz"), OCTET_STREAM);
        assert_eq!(resolve(None, "noext"), OCTET_STREAM);
        assert_eq!(resolve(None, "trailing."), OCTET_STREAM);
        assert_eq!(resolve(None, "dir.png/noext"), OCTET_STREAM);
    }

    #[test]
    fn image_gate() {
        for ct in ALLOWED_IMAGE_TYPES {
            assert!(is_allowed_image(ct));
        }
        assert!(!is_allowed_image(OCTET_STREAM));
        assert!(!is_allowed_image("image/svg+xml"));
        assert!(!is_allowed_image("IMAGE/PNG"));
        assert!(!is_allowed_image(""));
    }
}
