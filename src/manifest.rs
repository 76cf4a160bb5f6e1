//! Manifest media types and parsing.
//!
//! The registry accepts Docker schema2 and OCI manifests, both single-arch
//! images and multi-arch lists/indexes. Parsing extracts exactly what
//! validation needs: referenced blob descriptors, referenced child
//! manifests, the subject for referrer indexing, and annotations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::RegistryError;
use crate::models::Platform;

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

pub const DOCKER_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

pub fn is_manifest_media_type(media_type: &str) -> bool {
    matches!(
        media_type,
        DOCKER_MANIFEST | DOCKER_MANIFEST_LIST | OCI_MANIFEST | OCI_INDEX
    )
}

pub fn is_list_media_type(media_type: &str) -> bool {
    matches!(media_type, DOCKER_MANIFEST_LIST | OCI_INDEX)
}

/// Image config blobs are always reverse-proxied rather than redirected so
/// that CORS applies uniformly.
pub fn is_image_config_media_type(media_type: &str) -> bool {
    matches!(media_type, DOCKER_IMAGE_CONFIG | OCI_IMAGE_CONFIG)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: Option<String>,
    pub digest: String,
    pub size: i64,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub annotations: Option<HashMap<String, String>>,
    #[serde(default)]
    pub artifact_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawImageManifest {
    #[serde(default)]
    media_type: Option<String>,
    config: Descriptor,
    layers: Vec<Descriptor>,
    #[serde(default)]
    subject: Option<Descriptor>,
    #[serde(default)]
    artifact_type: Option<String>,
    #[serde(default)]
    annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawImageList {
    #[serde(default)]
    media_type: Option<String>,
    manifests: Vec<Descriptor>,
    #[serde(default)]
    subject: Option<Descriptor>,
    #[serde(default)]
    artifact_type: Option<String>,
    #[serde(default)]
    annotations: Option<HashMap<String, String>>,
}

/// A manifest reduced to what validation and indexing care about.
#[derive(Debug)]
pub struct ParsedManifest {
    pub media_type: String,
    /// The image config descriptor; present only for single-arch images.
    pub config: Option<Descriptor>,
    /// Layer blob descriptors (single-arch images).
    pub layers: Vec<Descriptor>,
    /// Child manifest descriptors (lists/indexes).
    pub children: Vec<Descriptor>,
    pub subject: Option<Descriptor>,
    pub artifact_type: Option<String>,
    pub annotations: Option<HashMap<String, String>>,
}

impl ParsedManifest {
    pub fn is_list(&self) -> bool {
        is_list_media_type(&self.media_type)
    }

    /// All blob descriptors this manifest references directly.
    pub fn blob_descriptors(&self) -> Vec<&Descriptor> {
        self.config.iter().chain(self.layers.iter()).collect()
    }
}

/// Parses manifest bytes according to the declared media type. The body's
/// embedded `mediaType`, when present, must agree with the declaration.
pub fn parse(media_type: &str, content: &[u8]) -> Result<ParsedManifest, RegistryError> {
    if is_list_media_type(media_type) {
        let raw: RawImageList = serde_json::from_slice(content)
            .map_err(|e| RegistryError::manifest_invalid(format!("malformed manifest: {e}")))?;
        check_embedded_media_type(media_type, raw.media_type.as_deref())?;
        Ok(ParsedManifest {
            media_type: media_type.to_string(),
            config: None,
            layers: Vec::new(),
            children: raw.manifests,
            subject: raw.subject,
            artifact_type: raw.artifact_type,
            annotations: raw.annotations,
        })
    } else if is_manifest_media_type(media_type) {
        let raw: RawImageManifest = serde_json::from_slice(content)
            .map_err(|e| RegistryError::manifest_invalid(format!("malformed manifest: {e}")))?;
        check_embedded_media_type(media_type, raw.media_type.as_deref())?;
        Ok(ParsedManifest {
            media_type: media_type.to_string(),
            config: Some(raw.config),
            layers: raw.layers,
            children: Vec::new(),
            subject: raw.subject,
            artifact_type: raw.artifact_type,
            annotations: raw.annotations,
        })
    } else {
        Err(RegistryError::manifest_invalid(format!(
            "unsupported manifest media type {media_type:?}"
        )))
    }
}

fn check_embedded_media_type(
    declared: &str,
    embedded: Option<&str>,
) -> Result<(), RegistryError> {
    match embedded {
        Some(embedded) if embedded != declared => Err(RegistryError::manifest_invalid(format!(
            "declared media type {declared:?} does not match manifest body {embedded:?}"
        ))),
        _ => Ok(()),
    }
}

/// The parts of an image config blob that feed manifest metadata.
#[derive(Debug, Default)]
pub struct ImageConfigInfo {
    pub labels: HashMap<String, String>,
    pub min_layer_created_at: Option<DateTime<Utc>>,
    pub max_layer_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawImageConfig {
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    config: Option<RawConfigSection>,
    #[serde(default)]
    history: Vec<RawHistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct RawConfigSection {
    #[serde(default, rename = "Labels")]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct RawHistoryEntry {
    #[serde(default)]
    created: Option<String>,
}

/// Extracts labels and layer timestamps from an image config blob.
pub fn parse_image_config(content: &[u8]) -> Result<ImageConfigInfo, RegistryError> {
    let raw: RawImageConfig = serde_json::from_slice(content)
        .map_err(|e| RegistryError::manifest_invalid(format!("malformed image config: {e}")))?;

    let mut timestamps: Vec<DateTime<Utc>> = raw
        .history
        .iter()
        .filter_map(|h| h.created.as_deref())
        .chain(raw.created.as_deref())
        .filter_map(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .collect();
    timestamps.sort();

    Ok(ImageConfigInfo {
        labels: raw
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default(),
        min_layer_created_at: timestamps.first().copied(),
        max_layer_created_at: timestamps.last().copied(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111",
            "size": 100
        },
        "layers": [
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": "sha256:2222222222222222222222222222222222222222222222222222222222222222",
                "size": 200
            }
        ],
        "subject": {
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": "sha256:3333333333333333333333333333333333333333333333333333333333333333",
            "size": 300
        },
        "artifactType": "application/spdx+json",
        "annotations": {"org.example.key": "value"}
    }"#;

    #[test]
    fn test_parse_image_manifest() {
        let parsed = parse(OCI_MANIFEST, IMAGE_MANIFEST.as_bytes()).unwrap();
        assert!(!parsed.is_list());
        assert_eq!(parsed.blob_descriptors().len(), 2);
        assert_eq!(parsed.config.as_ref().unwrap().size, 100);
        assert_eq!(
            parsed.subject.as_ref().unwrap().digest,
            "sha256:3333333333333333333333333333333333333333333333333333333333333333"
        );
        assert_eq!(parsed.artifact_type.as_deref(), Some("application/spdx+json"));
        assert_eq!(
            parsed.annotations.unwrap().get("org.example.key").unwrap(),
            "value"
        );
    }

    #[test]
    fn test_parse_image_list() {
        let body = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": "sha256:4444444444444444444444444444444444444444444444444444444444444444",
                    "size": 400,
                    "platform": {"os": "linux", "architecture": "amd64"}
                },
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": "sha256:5555555555555555555555555555555555555555555555555555555555555555",
                    "size": 500,
                    "platform": {"os": "linux", "architecture": "arm64", "variant": "v8"}
                }
            ]
        }"#;
        let parsed = parse(OCI_INDEX, body.as_bytes()).unwrap();
        assert!(parsed.is_list());
        assert_eq!(parsed.children.len(), 2);
        assert!(parsed.blob_descriptors().is_empty());
        let platform = parsed.children[1].platform.as_ref().unwrap();
        assert_eq!(platform.architecture, "arm64");
        assert_eq!(platform.variant.as_deref(), Some("v8"));
    }

    #[test]
    fn test_media_type_mismatch_rejected() {
        // declared as a list while the body is an image manifest
        let err = parse(OCI_INDEX, IMAGE_MANIFEST.as_bytes()).unwrap_err();
        assert_eq!(err.code.as_str(), "MANIFEST_INVALID");

        let err = parse("text/plain", IMAGE_MANIFEST.as_bytes()).unwrap_err();
        assert_eq!(err.code.as_str(), "MANIFEST_INVALID");
    }

    #[test]
    fn test_parse_image_config() {
        let body = r#"{
            "created": "2024-03-01T10:00:00Z",
            "config": {"Labels": {"maintainer": "ops@example.org"}},
            "history": [
                {"created": "2024-01-01T00:00:00Z"},
                {"created": "2024-02-01T00:00:00Z"}
            ]
        }"#;
        let info = parse_image_config(body.as_bytes()).unwrap();
        assert_eq!(info.labels.get("maintainer").unwrap(), "ops@example.org");
        assert_eq!(
            info.min_layer_created_at.unwrap().to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
        assert_eq!(
            info.max_layer_created_at.unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );
    }

    #[test]
    fn test_image_config_without_labels() {
        let info = parse_image_config(b"{}").unwrap();
        assert!(info.labels.is_empty());
        assert!(info.min_layer_created_at.is_none());
    }
}
