//! Object key construction for stored images.

use uuid::Uuid;

/// Extension used when a content type has no specific mapping.
const FALLBACK_EXTENSION: &str = "bin";

/// Generates collision-resistant object keys scoped to a label namespace.
///
/// Key format: `{prefix}/{label}/{uuid}.{extension}`
///
/// - First level: configured prefix, shared by all images
/// - Second level: sanitized label name, so per-label listings are one
///   prefix query
/// - Filename: random v4 UUID, so concurrent uploads of identical content
///   never contend for a key
#[derive(Debug, Clone)]
pub struct ObjectKeyGenerator {
    prefix: String,
}

impl ObjectKeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { prefix }
    }

    /// Generate a key for one new image under `label`.
    ///
    /// Every call returns a distinct key, even for the same label and
    /// content type.
    pub fn object_key(&self, label: &str, content_type: &str) -> String {
        format!(
            "{}{}/{}.{}",
            self.prefix_segment(),
            sanitize_path_component(label),
            Uuid::new_v4(),
            extension_for(content_type)
        )
    }

    /// Key for the zero-byte marker that makes a label's namespace visible
    /// to prefix listings before any image lands in it.
    pub fn namespace_marker(&self, label: &str) -> String {
        format!("{}{}/", self.prefix_segment(), sanitize_path_component(label))
    }

    fn prefix_segment(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Map a content type to a file extension
fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim();

    match essence.to_lowercase().as_str() {
        "image/jpeg" => "jpeg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/gif" => "gif",
        _ => FALLBACK_EXTENSION,
    }
}
