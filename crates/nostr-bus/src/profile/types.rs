use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::url_safety::{check_url, validate_url_safety};
use crate::Error;

/// Kind-0 profile content. Unknown keys from other clients are ignored, and
/// a known key holding anything but a non-blank string reads as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileContent {
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub display_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub about: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub picture: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub banner: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub website: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub nip05: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub lud16: Option<String>,
}

impl ProfileContent {
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse relay-supplied content. Only a non-object document is an error;
    /// bad individual fields are dropped.
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Refuse outgoing content with an unsafe URL field.
    pub fn validate_urls(&self) -> Result<(), Error> {
        for (field, value) in self.url_fields() {
            if let Some(value) = value {
                validate_url_safety(field, value)?;
            }
        }
        Ok(())
    }

    /// Drop unsafe URL fields from imported content. Returns the names of
    /// the fields that were removed.
    pub fn sanitize_urls(&mut self) -> Vec<&'static str> {
        let mut dropped = Vec::new();
        for (field, slot) in [
            ("picture", &mut self.picture),
            ("banner", &mut self.banner),
            ("website", &mut self.website),
        ] {
            if slot.as_deref().is_some_and(|url| check_url(url).is_err()) {
                *slot = None;
                dropped.push(field);
            }
        }
        dropped
    }

    fn url_fields(&self) -> [(&'static str, Option<&String>); 3] {
        [
            ("picture", self.picture.as_ref()),
            ("banner", self.banner.as_ref()),
            ("website", self.website.as_ref()),
        ]
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    })
}

/// Per field, keep the local value when present, otherwise take the
/// imported one.
pub fn merge_profiles(local: &ProfileContent, imported: &ProfileContent) -> ProfileContent {
    fn pick(local: &Option<String>, imported: &Option<String>) -> Option<String> {
        local.clone().or_else(|| imported.clone())
    }

    ProfileContent {
        name: pick(&local.name, &imported.name),
        display_name: pick(&local.display_name, &imported.display_name),
        about: pick(&local.about, &imported.about),
        picture: pick(&local.picture, &imported.picture),
        banner: pick(&local.banner, &imported.banner),
        website: pick(&local.website, &imported.website),
        nip05: pick(&local.nip05, &imported.nip05),
        lud16: pick(&local.lud16, &imported.lud16),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_local_wins() {
        let local = ProfileContent {
            name: Some("Alice".to_string()),
            ..Default::default()
        };
        let imported = ProfileContent {
            name: Some("Bob".to_string()),
            about: Some("hi".to_string()),
            ..Default::default()
        };

        let merged = merge_profiles(&local, &imported);
        assert_eq!(
            merged,
            ProfileContent {
                name: Some("Alice".to_string()),
                about: Some("hi".to_string()),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_json_uses_display_name_and_omits_absent() {
        let profile = ProfileContent {
            name: Some("aman".to_string()),
            display_name: Some("Aman".to_string()),
            ..Default::default()
        };
        let json = profile.to_json().unwrap();
        assert_eq!(json, r#"{"name":"aman","display_name":"Aman"}"#);
    }

    #[test]
    fn test_from_json_ignores_unknown_and_blank() {
        let profile =
            ProfileContent::from_json(r#"{"name":"x","about":"  ","displayName":"y","bot":true}"#)
                .unwrap();
        assert_eq!(profile.name.as_deref(), Some("x"));
        assert_eq!(profile.about, None);
        assert_eq!(profile.display_name, None);
    }

    #[test]
    fn test_from_json_drops_mistyped_fields() {
        let profile = ProfileContent::from_json(
            r#"{"name":"Alice","about":"hi","nip05":123,"picture":null,"lud16":["a"],"website":{"u":1}}"#,
        )
        .unwrap();
        assert_eq!(
            profile,
            ProfileContent {
                name: Some("Alice".to_string()),
                about: Some("hi".to_string()),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        assert!(ProfileContent::from_json("[1,2]").is_err());
        assert!(ProfileContent::from_json("not json").is_err());
    }

    #[test]
    fn test_sanitize_drops_only_unsafe_fields() {
        let mut profile = ProfileContent {
            name: Some("n".to_string()),
            picture: Some("https://127.0.0.1/a.png".to_string()),
            banner: Some("https://cdn.example.com/b.png".to_string()),
            website: Some("http://example.com".to_string()),
            ..Default::default()
        };
        let dropped = profile.sanitize_urls();
        assert_eq!(dropped, vec!["picture", "website"]);
        assert_eq!(profile.picture, None);
        assert_eq!(profile.banner.as_deref(), Some("https://cdn.example.com/b.png"));
        assert_eq!(profile.name.as_deref(), Some("n"));
    }

    #[test]
    fn test_validate_urls_refuses_unsafe() {
        let profile = ProfileContent {
            banner: Some("https://foo.localhost/x".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            profile.validate_urls(),
            Err(Error::UnsafeUrl { field: "banner", .. })
        ));
    }
}
