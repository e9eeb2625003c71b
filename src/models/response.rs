//! Feedback response submitted by a user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform the feedback was sent from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Mac,
    Linux,
    Android,
    Unknown,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Windows => write!(f, "windows"),
            Platform::Mac => write!(f, "mac"),
            Platform::Linux => write!(f, "linux"),
            Platform::Android => write!(f, "android"),
            Platform::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<&str> for Platform {
    /// Anything unrecognised maps to `Unknown`
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "windows" => Platform::Windows,
            "mac" | "macos" => Platform::Mac,
            "linux" => Platform::Linux,
            "android" => Platform::Android,
            _ => Platform::Unknown,
        }
    }
}

/// A single piece of feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Assigned by the store on first save; 0 means unsaved
    pub id: u64,

    /// Happy or sad feedback
    pub happy: bool,

    /// Free-form text the user typed
    pub description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    pub product: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    pub version: String,

    pub platform: Platform,

    /// Locale of the UI the feedback came from (e.g. "en-US")
    pub locale: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    pub created: DateTime<Utc>,
}

impl Response {
    /// Create an unsaved response with minimal required fields
    pub fn new(happy: bool, description: &str, product: &str, version: &str) -> Self {
        Self {
            id: 0,
            happy,
            description: description.to_string(),
            url: None,
            product: product.to_string(),
            channel: None,
            version: version.to_string(),
            platform: Platform::Unknown,
            locale: "en-US".to_string(),
            country: None,
            user_agent: None,
            created: Utc::now(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_locale(mut self, locale: &str) -> Self {
        self.locale = locale.to_string();
        self
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// "happy" / "sad" label used by the index
    pub fn sentiment(&self) -> &'static str {
        if self.happy {
            "happy"
        } else {
            "sad"
        }
    }
}
