use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GroupingError;

pub const EXPERIENCE_FIELD: &str = "experience";
pub const REGION_FIELD: &str = "region";

/// A user profile as it appears on the source feed. Only `experience` and
/// `region` matter to the aggregation; everything else is carried untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experience: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Value>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl UserProfile {
    pub fn new(experience: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            experience: Some(Value::String(experience.into())),
            region: Some(Value::String(region.into())),
            other: Map::new(),
        }
    }

    /// A profile is complete when its experience text is longer than
    /// `min_bytes` UTF-8 bytes. Missing or non-string experience never is.
    pub fn is_complete(&self, min_bytes: usize) -> bool {
        match &self.experience {
            Some(Value::String(text)) => text.len() > min_bytes,
            _ => false,
        }
    }

    pub fn region_key(&self) -> Result<String, GroupingError> {
        match &self.region {
            None | Some(Value::Null) => Err(GroupingError::Missing(REGION_FIELD)),
            Some(Value::String(region)) => {
                let region = region.trim();
                if region.is_empty() {
                    Err(GroupingError::Empty(REGION_FIELD))
                } else {
                    Ok(region.to_string())
                }
            }
            Some(_) => Err(GroupingError::NotAString(REGION_FIELD)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(250, true; "well over")]
    #[test_case(201, true; "one past the threshold")]
    #[test_case(200, false; "exactly at the threshold")]
    #[test_case(10, false; "short")]
    fn test_completeness_is_strictly_greater(len: usize, expected: bool) {
        let profile = UserProfile::new("x".repeat(len), "EU");
        assert_eq!(profile.is_complete(200), expected);
    }

    #[test]
    fn test_completeness_counts_bytes_not_chars() {
        // 101 two-byte characters is 202 bytes.
        let profile = UserProfile::new("é".repeat(101), "EU");
        assert!(profile.is_complete(200));
    }

    #[test]
    fn test_missing_or_non_string_experience_is_incomplete() {
        let profile: UserProfile = serde_json::from_value(json!({"region": "EU"})).unwrap();
        assert!(!profile.is_complete(0));

        let profile: UserProfile =
            serde_json::from_value(json!({"region": "EU", "experience": 12})).unwrap();
        assert!(!profile.is_complete(0));
    }

    #[test]
    fn test_region_key_errors() {
        let missing: UserProfile = serde_json::from_value(json!({"experience": "x"})).unwrap();
        assert_eq!(
            missing.region_key(),
            Err(GroupingError::Missing(REGION_FIELD))
        );

        let empty = UserProfile::new("x", "   ");
        assert_eq!(empty.region_key(), Err(GroupingError::Empty(REGION_FIELD)));

        let numeric: UserProfile =
            serde_json::from_value(json!({"experience": "x", "region": 3})).unwrap();
        assert_eq!(
            numeric.region_key(),
            Err(GroupingError::NotAString(REGION_FIELD))
        );

        assert_eq!(UserProfile::new("x", " EU ").region_key().unwrap(), "EU");
    }

    #[test]
    fn test_unknown_fields_are_preserved() {
        let profile: UserProfile = serde_json::from_value(
            json!({"experience": "x", "region": "EU", "name": "Ada", "age": 36}),
        )
        .unwrap();
        assert_eq!(profile.other.get("name"), Some(&json!("Ada")));
        let back = serde_json::to_value(&profile).unwrap();
        assert_eq!(back["age"], json!(36));
    }
}
