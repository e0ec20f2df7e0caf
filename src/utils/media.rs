use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;
use url::Url;

/// True for references a backend can fetch or decode on its own.
pub fn is_inline_or_remote(reference: &str) -> bool {
    match Url::parse(reference.trim()) {
        Ok(url) => matches!(url.scheme(), "http" | "https" | "data"),
        Err(_) => false,
    }
}

pub fn mime_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => "image/jpeg",
    }
}

pub fn to_data_uri(bytes: &[u8], mime: &str) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

/// Split `data:<mime>;base64,<payload>` into its mime type and payload.
pub fn split_data_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    Some((mime, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_classification() {
        assert!(is_inline_or_remote("https://example.com/kid.png"));
        assert!(is_inline_or_remote("data:image/png;base64,AAAA"));
        assert!(!is_inline_or_remote("photos/kid.png"));
        assert!(!is_inline_or_remote("/home/me/kid.jpg"));
    }

    #[test]
    fn test_data_uri_round_trip() {
        let uri = to_data_uri(b"hi", mime_for_path(Path::new("kid.PNG")));
        assert_eq!(uri, "data:image/png;base64,aGk=");
        assert_eq!(split_data_uri(&uri), Some(("image/png", "aGk=")));
        assert_eq!(split_data_uri("https://x"), None);
    }
}
