use serde::{Deserialize, Serialize};

/// Body of `POST /api/v3/contents/generations/tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub model: String,
    pub content: Vec<ContentItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub r#type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<ImageUrl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ImageRole>,
}

impl ContentItem {
    pub fn text(text: String) -> Self {
        Self {
            r#type: ContentType::Text,
            text: Some(text),
            image_url: None,
            role: None,
        }
    }

    pub fn image(url: String, role: ImageRole) -> Self {
        Self {
            r#type: ContentType::ImageUrl,
            text: None,
            image_url: Some(ImageUrl { url }),
            role: Some(role),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    ImageUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRole {
    FirstFrame,
    LastFrame,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}
