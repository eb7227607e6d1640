//! Removes base64 image payloads from audited request bodies.

use serde_json::{json, Value};

use crate::decoded_base64_len;

/// Image payloads below this size stay in the audit row verbatim.
const IMAGE_KEEP_THRESHOLD: usize = 512;

/// Replaces large `messages[].images` payloads with a `{count, sizes}`
/// summary, in place. Non-image content is untouched.
pub fn scrub_images(content: &mut Value) {
    let Some(messages) = content
        .get_mut("messages")
        .and_then(Value::as_array_mut)
    else {
        return;
    };

    for message in messages {
        let Some(images) = message.get("images").and_then(Value::as_array) else {
            continue;
        };
        if images.is_empty() {
            continue;
        }

        let sizes: Vec<usize> = images
            .iter()
            .map(|image| image.as_str().map(decoded_base64_len).unwrap_or(0))
            .collect();
        if sizes.iter().all(|size| *size < IMAGE_KEEP_THRESHOLD) {
            continue;
        }

        message["images"] = json!({
            "count": sizes.len(),
            "sizes": sizes,
        });
    }
}
