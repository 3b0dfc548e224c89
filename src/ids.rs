use chrono::Utc;
use uuid::Uuid;

/// 48 random bits, hex encoded.
fn random_suffix() -> String {
    let mut raw = Uuid::new_v4().simple().to_string();
    raw.truncate(12);
    raw
}

/// Message ids: microsecond timestamp plus a random suffix.
pub fn message_id() -> String {
    format!("{}-{}", Utc::now().timestamp_micros(), random_suffix())
}

/// Conversation ids: millisecond timestamp plus a random suffix, regenerated
/// until `exists` reports the id as unused.
pub fn conversation_id(exists: impl Fn(&str) -> bool) -> String {
    loop {
        let id = format!("{}-{}", Utc::now().timestamp_millis(), random_suffix());
        if !exists(&id) {
            return id;
        }
    }
}

/// File name for a stored image blob, e.g. `img_1718000000000_3f2a9c01d4e2.png`.
pub fn image_filename(extension: &str) -> String {
    format!(
        "img_{}_{}.{}",
        Utc::now().timestamp_millis(),
        random_suffix(),
        extension
    )
}
