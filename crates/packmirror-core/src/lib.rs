//! Core domain model for packmirror: manifest documents, mirror-path
//! derivation, and manifest rewriting.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "packmirror-core";

/// Suffix appended to a manifest key to form the archive key.
pub const ARCHIVE_SUFFIX: &str = ".zip";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("`{url}` is not a well-formed absolute URL")]
    InvalidUrl { url: String },
    #[error("manifest URL `{url}` does not name a known package kind")]
    UnknownKind { url: String },
}

/// The two metadata entry kinds an archive can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestKind {
    System,
    Module,
}

impl ManifestKind {
    /// Base name of the metadata entry inside the archive.
    pub fn file_name(self) -> &'static str {
        match self {
            ManifestKind::System => "system.json",
            ManifestKind::Module => "module.json",
        }
    }

    /// Derive the kind from the final path segment of a manifest URL.
    pub fn from_manifest_url(url: &str) -> Result<Self, ManifestError> {
        let parsed = Url::parse(url).map_err(|_| ManifestError::InvalidUrl {
            url: url.to_string(),
        })?;
        let last = parsed
            .path_segments()
            .and_then(|segments| segments.last())
            .unwrap_or_default();
        match last {
            "system.json" => Ok(ManifestKind::System),
            "module.json" => Ok(ManifestKind::Module),
            _ => Err(ManifestError::UnknownKind {
                url: url.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ManifestKind::System => "system",
            ManifestKind::Module => "module",
        })
    }
}

/// A parsed manifest document. The raw JSON value is retained so equality
/// is structural: key order and formatting never count as change.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub title: String,
    pub manifest_url: String,
    pub download_url: String,
    raw: Value,
}

impl Manifest {
    /// Parse manifest text. `manifest` and `download` must be present and
    /// non-empty; their absence is a hard validation failure, not a skip.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let raw: Value = serde_json::from_str(text)?;
        let manifest_url = required_string(&raw, "manifest")?;
        let download_url = required_string(&raw, "download")?;
        let name = optional_string(&raw, "name");
        let title = optional_string(&raw, "title");
        Ok(Self {
            name,
            title,
            manifest_url,
            download_url,
            raw,
        })
    }

    /// Structural equality against another document.
    pub fn same_content(&self, other: &Manifest) -> bool {
        self.raw == other.raw
    }

    pub fn kind(&self) -> Result<ManifestKind, ManifestError> {
        ManifestKind::from_manifest_url(&self.manifest_url)
    }

    /// Render this manifest with `manifest`/`download` re-pointed at the
    /// mirror. All other fields pass through untouched.
    pub fn rewritten(&self, mirror_prefix: &str, paths: &MirrorPaths) -> String {
        let mut doc = self.raw.clone();
        if let Some(map) = doc.as_object_mut() {
            map.insert(
                "manifest".to_string(),
                Value::String(paths.manifest_mirror_url(mirror_prefix)),
            );
            map.insert(
                "download".to_string(),
                Value::String(paths.archive_mirror_url(mirror_prefix)),
            );
        }
        serde_json::to_string_pretty(&doc).unwrap_or_else(|_| doc.to_string())
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

fn required_string(raw: &Value, field: &'static str) -> Result<String, ManifestError> {
    match raw.get(field).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(ManifestError::MissingField(field)),
    }
}

fn optional_string(raw: &Value, field: &str) -> String {
    raw.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Derived storage keys for one tracked item. Derivation is pure: the same
/// origin URL always yields the same keys, across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorPaths {
    pub manifest_key: String,
    pub archive_key: String,
}

impl MirrorPaths {
    /// Derive keys from an absolute origin URL: drop scheme and
    /// query/fragment, keep host\[:port\]+path, percent-decode.
    pub fn derive(origin_url: &str) -> Result<Self, ManifestError> {
        let parsed = Url::parse(origin_url).map_err(|_| ManifestError::InvalidUrl {
            url: origin_url.to_string(),
        })?;
        let host = parsed.host_str().ok_or_else(|| ManifestError::InvalidUrl {
            url: origin_url.to_string(),
        })?;
        let mut key = String::from(host);
        if let Some(port) = parsed.port() {
            key.push(':');
            key.push_str(&port.to_string());
        }
        let path = percent_decode_str(parsed.path())
            .decode_utf8()
            .map_err(|_| ManifestError::InvalidUrl {
                url: origin_url.to_string(),
            })?;
        key.push_str(&path);
        let archive_key = format!("{key}{ARCHIVE_SUFFIX}");
        Ok(Self {
            manifest_key: key,
            archive_key,
        })
    }

    pub fn manifest_mirror_url(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.manifest_key)
    }

    pub fn archive_mirror_url(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.archive_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DND: &str = r#"{
        "name": "dnd5e",
        "title": "Dungeons & Dragons 5e",
        "manifest": "https://origin/system.json",
        "download": "https://origin/system.zip"
    }"#;

    #[test]
    fn parses_required_fields() {
        let manifest = Manifest::parse(DND).expect("parse");
        assert_eq!(manifest.name, "dnd5e");
        assert_eq!(manifest.manifest_url, "https://origin/system.json");
        assert_eq!(manifest.download_url, "https://origin/system.zip");
        assert_eq!(manifest.kind().expect("kind"), ManifestKind::System);
    }

    #[test]
    fn missing_manifest_field_is_hard_failure() {
        let err = Manifest::parse(r#"{"name":"x","download":"https://o/a.zip"}"#).unwrap_err();
        assert!(matches!(err, ManifestError::MissingField("manifest")));
    }

    #[test]
    fn empty_download_field_is_hard_failure() {
        let err = Manifest::parse(
            r#"{"name":"x","manifest":"https://o/system.json","download":""}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::MissingField("download")));
    }

    #[test]
    fn equality_ignores_formatting_and_key_order() {
        let a = Manifest::parse(DND).expect("a");
        let b = Manifest::parse(
            r#"{"download":"https://origin/system.zip","manifest":"https://origin/system.json","title":"Dungeons & Dragons 5e","name":"dnd5e"}"#,
        )
        .expect("b");
        assert!(a.same_content(&b));
    }

    #[test]
    fn changed_download_field_is_detected() {
        let a = Manifest::parse(DND).expect("a");
        let b = Manifest::parse(&DND.replace("system.zip", "system-v2.zip")).expect("b");
        assert!(!a.same_content(&b));
    }

    #[test]
    fn derivation_is_pure_and_scheme_insensitive() {
        let https = MirrorPaths::derive("https://host/dir/system.json").expect("https");
        let http = MirrorPaths::derive("http://host/dir/system.json").expect("http");
        let again = MirrorPaths::derive("https://host/dir/system.json").expect("again");
        assert_eq!(https, http);
        assert_eq!(https, again);
        assert_eq!(https.manifest_key, "host/dir/system.json");
        assert_eq!(https.archive_key, "host/dir/system.json.zip");
    }

    #[test]
    fn derivation_strips_query_and_decodes_escapes() {
        let paths =
            MirrorPaths::derive("https://host:8443/a%20b/system.json?token=abc#frag").expect("ok");
        assert_eq!(paths.manifest_key, "host:8443/a b/system.json");
    }

    #[test]
    fn relative_url_is_rejected() {
        let err = MirrorPaths::derive("not-a-url").unwrap_err();
        assert!(matches!(err, ManifestError::InvalidUrl { .. }));
    }

    #[test]
    fn rewrite_repoints_only_urls() {
        let manifest = Manifest::parse(DND).expect("parse");
        let paths = MirrorPaths::derive(&manifest.manifest_url).expect("paths");
        let rewritten = manifest.rewritten("https://mirror.example/", &paths);
        let doc: Value = serde_json::from_str(&rewritten).expect("json");
        assert_eq!(
            doc["manifest"],
            "https://mirror.example/origin/system.json"
        );
        assert_eq!(
            doc["download"],
            "https://mirror.example/origin/system.json.zip"
        );
        assert_eq!(doc["name"], "dnd5e");
        assert_eq!(doc["title"], "Dungeons & Dragons 5e");
    }

    #[test]
    fn kind_from_url() {
        assert_eq!(
            ManifestKind::from_manifest_url("https://o/p/module.json").expect("module"),
            ManifestKind::Module
        );
        assert!(ManifestKind::from_manifest_url("https://o/p/other.json").is_err());
    }
}
