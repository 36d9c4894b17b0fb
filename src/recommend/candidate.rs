use chrono::{DateTime, Utc};

use super::Recommendation;

/// A resolved web page under evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    /// Normalized URL
    pub url: String,
    pub domain: String,
    pub title: String,
    /// Site name
    pub source: String,
    pub author: String,
    pub description: String,
    pub published: Option<DateTime<Utc>>,
    pub paywall: Option<bool>,
    pub image_url: String,
    pub score: f32,
}

impl Candidate {
    /// Text compared against the label set.
    pub fn scoring_text(&self) -> String {
        format!("{}. {}", self.title, self.description).trim().to_string()
    }

    pub fn into_recommendation(self) -> Recommendation {
        let source = if self.source.is_empty() {
            self.domain
        } else {
            self.source
        };
        Recommendation {
            title: self.title,
            source,
            url: self.url,
            image_url: self.image_url,
            date: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_falls_back_to_domain() {
        let c = Candidate {
            url: "https://aeon.co/essays/x".to_string(),
            domain: "aeon.co".to_string(),
            title: "X".to_string(),
            ..Default::default()
        };
        let r = c.into_recommendation();
        assert_eq!(r.source, "aeon.co");
        assert_eq!(r.date, None);
    }

    #[test]
    fn test_scoring_text_trims_missing_description() {
        let c = Candidate {
            title: "Title".to_string(),
            ..Default::default()
        };
        assert_eq!(c.scoring_text(), "Title.");
    }
}
