use serde_json::Value as JsonValue;

use taskgate_protocol::doubao::request::{ContentItem, CreateTaskRequest, ImageRole};
use taskgate_protocol::task::VideoRequest;

/// Map a canonical video request onto the Ark task body. Generation knobs
/// travel as `--flag value` suffixes on the prompt text.
pub fn convert_request(request: &VideoRequest) -> CreateTaskRequest {
    let mut content = Vec::with_capacity(3);

    if !request.prompt.is_empty() {
        let mut text = request.prompt.clone();
        for part in prompt_params(request) {
            text.push(' ');
            text.push_str(&part);
        }
        content.push(ContentItem::text(text));
    }
    if !request.image.is_empty() {
        content.push(ContentItem::image(
            request.image.clone(),
            ImageRole::FirstFrame,
        ));
    }
    if !request.image_tail.is_empty() {
        content.push(ContentItem::image(
            request.image_tail.clone(),
            ImageRole::LastFrame,
        ));
    }

    CreateTaskRequest {
        model: request.model.clone(),
        content,
    }
}

fn prompt_params(request: &VideoRequest) -> Vec<String> {
    let mut parts = Vec::new();
    if request.duration > 0.0 {
        parts.push(format!("--dur {:.0}", request.duration));
    }
    if request.fps > 0 {
        parts.push(format!("--fps {}", request.fps));
    }
    if request.seed > 0 {
        parts.push(format!("--seed {}", request.seed));
    }
    if !request.aspect_ratio.is_empty() {
        parts.push(format!("--rt {}", request.aspect_ratio));
    }
    if !request.resolution.is_empty() {
        parts.push(format!("--rs {}", request.resolution));
    }
    parts.push(format!("--wm {}", request.watermark));
    parts.push(format!("--cf {}", request.camera_fixed));

    // serde_json maps iterate in key order, so the suffix is stable.
    if let Some(metadata) = &request.metadata {
        for (key, value) in metadata {
            parts.push(format!("--{key} {}", metadata_value(value)));
        }
    }
    parts
}

fn metadata_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}
