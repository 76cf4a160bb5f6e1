use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A tenant namespace. Maps to one auth tenant and optionally one upstream
/// for replication.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub auth_tenant_id: String,
    /// Set when this account replicates from a peer registry.
    pub upstream_peer_hostname: Option<String>,
    /// Set when this account replicates from a non-peer registry.
    pub external_peer_url: Option<String>,
    pub external_peer_username: Option<String>,
    pub external_peer_password: Option<String>,
    pub is_deleting: bool,
    /// JSON array of acceptable OS/arch pairs for image lists.
    pub platform_filter_json: Option<String>,
    /// JSON array of tag policies.
    pub tag_policies_json: Option<String>,
    /// Comma-separated label names every pushed image must carry.
    pub required_labels: Option<String>,
}

impl Account {
    pub fn is_replica(&self) -> bool {
        self.upstream_peer_hostname.is_some() || self.external_peer_url.is_some()
    }

    pub fn platform_filter(&self) -> Vec<Platform> {
        self.platform_filter_json
            .as_deref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or_default()
    }

    pub fn tag_policies(&self) -> Vec<TagPolicy> {
        self.tag_policies_json
            .as_deref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or_default()
    }

    pub fn required_label_names(&self) -> Vec<String> {
        self.required_labels
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// An OS/architecture pair as it appears in image index platform entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// A per-account rule protecting tags in matching repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagPolicy {
    /// Glob pattern over repository names within the account (`*` matches
    /// any run of characters).
    pub match_repository: String,
    /// Glob pattern over tag names; absent means all tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_tag: Option<String>,
    #[serde(default)]
    pub block_overwrite: bool,
    #[serde(default)]
    pub block_delete: bool,
}

impl TagPolicy {
    pub fn matches(&self, repo_name: &str, tag_name: &str) -> bool {
        glob_matches(&self.match_repository, repo_name)
            && self
                .match_tag
                .as_deref()
                .map_or(true, |pat| glob_matches(pat, tag_name))
    }
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for part in pattern.split('*') {
        if !re.ends_with('^') {
            re.push_str(".*");
        }
        re.push_str(&regex::escape(part));
    }
    re.push('$');
    regex::Regex::new(&re).map(|r| r.is_match(value)).unwrap_or(false)
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Repository {
    pub id: Uuid,
    pub account_name: String,
    pub name: String,
}

impl Repository {
    /// Full name as it appears in URLs and scope strings.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.account_name, self.name)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Blob {
    pub id: Uuid,
    pub account_name: String,
    pub digest: String,
    pub size_bytes: i64,
    /// Empty iff the blob is announced but not yet replicated. Only blobs
    /// in replica accounts may be in that state.
    pub storage_id: String,
    pub pushed_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
    pub media_type: String,
}

impl Blob {
    pub fn is_unbacked(&self) -> bool {
        self.storage_id.is_empty()
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Upload {
    pub uuid: Uuid,
    pub repo_id: Uuid,
    pub storage_id: String,
    pub size_bytes: i64,
    /// Running digest of all bytes appended so far.
    pub digest: String,
    pub num_chunks: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Manifest {
    pub repo_id: Uuid,
    pub digest: String,
    pub media_type: String,
    pub size_bytes: i64,
    pub pushed_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
    pub last_pulled_at: Option<DateTime<Utc>>,
    pub min_layer_created_at: Option<DateTime<Utc>>,
    pub max_layer_created_at: Option<DateTime<Utc>>,
    pub artifact_type: Option<String>,
    pub subject_digest: Option<String>,
    pub labels_json: Option<String>,
    pub annotations_json: Option<String>,
    pub vulnerability_status: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tag {
    pub repo_id: Uuid,
    pub name: String,
    pub digest: String,
    pub pushed_at: DateTime<Utc>,
    pub last_pulled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Quota {
    pub auth_tenant_id: String,
    pub manifests_max: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_with_policies(json: &str) -> Account {
        Account {
            name: "test1".into(),
            auth_tenant_id: "tenant1".into(),
            upstream_peer_hostname: None,
            external_peer_url: None,
            external_peer_username: None,
            external_peer_password: None,
            is_deleting: false,
            platform_filter_json: None,
            tag_policies_json: Some(json.into()),
            required_labels: None,
        }
    }

    #[test]
    fn test_tag_policy_matching() {
        let account = account_with_policies(
            r#"[{"match_repository":"foo","block_overwrite":true},
                {"match_repository":"lib/*","match_tag":"v*","block_delete":true}]"#,
        );
        let policies = account.tag_policies();
        assert_eq!(policies.len(), 2);

        assert!(policies[0].matches("foo", "latest"));
        assert!(!policies[0].matches("foobar", "latest"));

        assert!(policies[1].matches("lib/ssl", "v1.2"));
        assert!(!policies[1].matches("lib/ssl", "latest"));
        assert!(!policies[1].matches("app", "v1.2"));
    }

    #[test]
    fn test_glob_escape() {
        // dots in the pattern are literals, not regex wildcards
        assert!(!glob_matches("a.c", "abc"));
        assert!(glob_matches("a.c", "a.c"));
        assert!(glob_matches("*", "anything/at/all"));
    }

    #[test]
    fn test_required_label_names() {
        let mut account = account_with_policies("[]");
        account.required_labels = Some("maintainer, source-repo".into());
        assert_eq!(
            account.required_label_names(),
            vec!["maintainer".to_string(), "source-repo".to_string()]
        );
        account.required_labels = None;
        assert!(account.required_label_names().is_empty());
    }

    #[test]
    fn test_replica_detection() {
        let mut account = account_with_policies("[]");
        assert!(!account.is_replica());
        account.upstream_peer_hostname = Some("registry-two.example.org".into());
        assert!(account.is_replica());
    }
}
