//! File name and URL helpers shared by the managers

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

use crate::error::{DownloadError, DownloadResult};

static CONTENT_DISPOSITION_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)filename\*?=\s*(?:UTF-8'[^']*')?(?:"([^"]*)"|'([^']*)'|([^;\n]*))"#)
        .expect("valid filename regex")
});

/// Lowercased file name with directory and last extension removed.
/// `Llama-3.Q4.gguf` and `llama-3.q4.GGUF` collide.
pub fn normalized_base_name(name: &str) -> String {
    let file = Path::new(name)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(name);

    let stem = match file.rfind('.') {
        Some(idx) if idx > 0 => &file[..idx],
        _ => file,
    };
    stem.to_lowercase()
}

/// Reject names that could escape the models directory or are not models
pub fn validate_file_name(name: &str, allowed_extensions: &[String]) -> DownloadResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DownloadError::Validation("File name is empty".to_string()));
    }
    if trimmed != name {
        return Err(DownloadError::Validation(format!(
            "File name has surrounding whitespace: {:?}",
            name
        )));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.contains('\0') {
        return Err(DownloadError::Validation(format!(
            "File name must not contain path components: {}",
            name
        )));
    }

    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());
    match ext {
        Some(ext) if allowed_extensions.iter().any(|a| *a == ext) => Ok(()),
        _ => Err(DownloadError::Validation(format!(
            "Unsupported file type: {} (expected {})",
            name,
            allowed_extensions
                .iter()
                .map(|e| format!(".{}", e))
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Only absolute http(s) URLs can be downloaded
pub fn validate_url(url: &str) -> DownloadResult<reqwest::Url> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| DownloadError::Validation(format!("Invalid URL {}: {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(DownloadError::Validation(format!(
                "Unsupported URL scheme: {}",
                other
            )))
        }
    }
    if parsed.host_str().map_or(true, |h| h.is_empty()) {
        return Err(DownloadError::Validation(format!("URL has no host: {}", url)));
    }

    Ok(parsed)
}

/// Last non-empty path segment, percent-decoded
pub fn file_name_from_url(url: &reqwest::Url) -> Option<String> {
    let segment = url
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()?;

    let decoded = percent_decode(segment);
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

/// `filename` parameter of a Content-Disposition header value
pub fn file_name_from_content_disposition(header: &str) -> Option<String> {
    let caps = CONTENT_DISPOSITION_FILENAME.captures(header)?;
    let raw = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))?
        .as_str()
        .trim();

    // Servers sometimes send a full path
    let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let name = percent_decode(name);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gguf() -> Vec<String> {
        vec!["gguf".to_string()]
    }

    #[test]
    fn test_normalized_base_name() {
        assert_eq!(normalized_base_name("Model.GGUF"), "model");
        assert_eq!(normalized_base_name("llama-3.Q4_K_M.gguf"), "llama-3.q4_k_m");
        assert_eq!(normalized_base_name("/sdcard/Download/Phi.gguf"), "phi");
        assert_eq!(normalized_base_name("noext"), "noext");
        assert_eq!(normalized_base_name(".hidden"), ".hidden");
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("model.gguf", &gguf()).is_ok());
        assert!(validate_file_name("Model.GGUF", &gguf()).is_ok());

        for bad in ["", " model.gguf", "../model.gguf", "a/b.gguf", "a\\b.gguf", "model.bin", "model"] {
            assert!(
                matches!(validate_file_name(bad, &gguf()), Err(DownloadError::Validation(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://huggingface.co/x/resolve/main/m.gguf").is_ok());
        assert!(validate_url("http://localhost:8080/m.gguf").is_ok());
        assert!(matches!(validate_url("ftp://host/m.gguf"), Err(DownloadError::Validation(_))));
        assert!(matches!(validate_url("not a url"), Err(DownloadError::Validation(_))));
    }

    #[test]
    fn test_file_name_from_url() {
        let url = reqwest::Url::parse("https://host/a/My%20Model.gguf?download=true").unwrap();
        assert_eq!(file_name_from_url(&url), Some("My Model.gguf".to_string()));

        let url = reqwest::Url::parse("https://host/").unwrap();
        assert_eq!(file_name_from_url(&url), None);
    }

    #[test]
    fn test_file_name_from_content_disposition() {
        assert_eq!(
            file_name_from_content_disposition(r#"attachment; filename="phi-2.Q4.gguf""#),
            Some("phi-2.Q4.gguf".to_string())
        );
        assert_eq!(
            file_name_from_content_disposition("attachment; filename=model.gguf; size=10"),
            Some("model.gguf".to_string())
        );
        assert_eq!(
            file_name_from_content_disposition("attachment; filename*=UTF-8''my%20model.gguf"),
            Some("my model.gguf".to_string())
        );
        assert_eq!(file_name_from_content_disposition("inline"), None);
    }
}
