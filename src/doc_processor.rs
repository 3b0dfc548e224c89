use base64::{engine::general_purpose, Engine as _};
use std::path::Path;

/// PDF text beyond this many characters is cut.
pub const MAX_EXTRACTED_CHARS: usize = 20_000;
pub const TRUNCATION_MARKER: &str = "\n...[Content Truncated]";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Pdf(String),
    #[error("No active editor")]
    NoActiveEditor,
    #[error("Unsupported file type: .{0}")]
    Unsupported(String),
}

/// Text pulled out of a file for use as chat context.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub content: String,
    pub language: String,
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Parse a file into plain text. PDFs go through text extraction, anything
/// else is read as UTF-8 with invalid bytes replaced.
pub fn parse_file(path: &Path) -> Result<ParsedDocument, ContextError> {
    let ext = extension_of(path);
    let bytes = std::fs::read(path)?;

    if ext == "pdf" {
        let content = pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| ContextError::Pdf(e.to_string()))?;
        return Ok(ParsedDocument {
            content: truncate_extracted(content),
            language: "plaintext".into(),
        });
    }
    if image_mime_type(&ext).is_some() {
        return Err(ContextError::Unsupported(ext));
    }

    Ok(ParsedDocument {
        content: String::from_utf8_lossy(&bytes).into_owned(),
        language: language_for_extension(&ext).to_string(),
    })
}

pub fn truncate_extracted(text: String) -> String {
    match text.char_indices().nth(MAX_EXTRACTED_CHARS) {
        Some((cut, _)) => format!("{}{}", &text[..cut], TRUNCATION_MARKER),
        None => text,
    }
}

/// Editor language id for a file extension.
pub fn language_for_extension(ext: &str) -> &'static str {
    match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "md" | "markdown" => "markdown",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "html" | "htm" => "html",
        "css" => "css",
        "sh" | "bash" => "shellscript",
        "sql" => "sql",
        _ => "plaintext",
    }
}

pub fn image_mime_type(ext: &str) -> Option<&'static str> {
    match ext {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

pub fn is_image(path: &Path) -> bool {
    image_mime_type(&extension_of(path)).is_some()
}

/// Reads an image file into a base64 data URL.
pub fn image_data_url(path: &Path) -> Result<String, ContextError> {
    let ext = extension_of(path);
    let mime = image_mime_type(&ext).ok_or(ContextError::Unsupported(ext))?;
    let bytes = std::fs::read(path)?;
    Ok(format!(
        "data:{};base64,{}",
        mime,
        general_purpose::STANDARD.encode(bytes)
    ))
}
