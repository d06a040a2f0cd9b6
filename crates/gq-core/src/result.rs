//! Completed generations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gq_protocol::{GenerationParameters, ResultRecord};

use crate::error::ValidationError;
use crate::time::instant_or;

/// Hard cap on cached results, whatever the configured history limit
pub const MAX_RESULTS: usize = 500;

/// A finished generation kept for history display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub id: String,
    /// Backend job that produced this result, when known
    pub job_id: Option<String>,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// Primary image locator
    pub image_url: String,
    /// All image locators, primary first
    pub image_urls: Vec<String>,
    pub thumbnail_url: Option<String>,
    pub parameters: GenerationParameters,
    pub created_at: DateTime<Utc>,
    /// User rating in `1..=5`
    pub rating: Option<u8>,
    pub is_favorite: bool,
}

impl GenerationResult {
    /// Validate and coerce a backend record
    ///
    /// A record with an empty id, without a usable image locator, with zero
    /// dimensions or with an out-of-range rating is rejected as a whole. A missing or
    /// unparseable timestamp is replaced by `now`.
    pub fn from_record(
        record: ResultRecord,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidResult {
            id: record.id.clone(),
            reason: reason.to_string(),
        };

        if record.id.trim().is_empty() {
            return Err(invalid("empty id"));
        }

        let mut image_urls: Vec<String> = record
            .image_urls
            .iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        let primary = record
            .image_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        if let Some(primary) = &primary {
            image_urls.retain(|url| url != primary);
            image_urls.insert(0, primary.clone());
        }
        let Some(image_url) = image_urls.first().cloned() else {
            return Err(invalid("no image locator"));
        };

        let parameters = record.merged_parameters();
        if parameters.width == Some(0) || parameters.height == Some(0) {
            return Err(invalid("zero image dimension"));
        }
        if parameters.steps == Some(0) {
            return Err(invalid("zero steps"));
        }

        let rating = match record.rating {
            None => None,
            Some(raw) if raw.is_nan() => return Err(invalid("rating is not a number")),
            Some(raw) => {
                let rounded = raw.round();
                if rounded <= 0.0 {
                    None
                } else if rounded <= 5.0 {
                    Some(rounded as u8)
                } else {
                    return Err(invalid("rating above 5"));
                }
            }
        };

        Ok(Self {
            created_at: instant_or(record.created_at.as_deref(), now),
            id: record.id,
            job_id: None,
            prompt: record.prompt.unwrap_or_default(),
            negative_prompt: record.negative_prompt,
            image_url,
            image_urls,
            thumbnail_url: record.thumbnail_url,
            parameters,
            rating,
            is_favorite: record.is_favorite.unwrap_or(false),
        })
    }
}
