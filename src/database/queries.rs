use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::{
    database::Database,
    error::Result,
    models::{Account, Blob, Manifest, Quota, Repository, Tag, Upload},
};

// ---------------------------------------------------------------- accounts

pub async fn get_account(db: &Database, name: &str) -> Result<Option<Account>> {
    let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE name = $1")
        .bind(name)
        .fetch_optional(&db.pool)
        .await?;
    Ok(account)
}

/// Account creation is driven by an external control plane; this insert is
/// what that plane (and the test suite) goes through.
pub async fn insert_account(db: &Database, account: &Account) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO accounts (name, auth_tenant_id, upstream_peer_hostname,
            external_peer_url, external_peer_username, external_peer_password,
            is_deleting, platform_filter_json, tag_policies_json, required_labels)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&account.name)
    .bind(&account.auth_tenant_id)
    .bind(&account.upstream_peer_hostname)
    .bind(&account.external_peer_url)
    .bind(&account.external_peer_username)
    .bind(&account.external_peer_password)
    .bind(account.is_deleting)
    .bind(&account.platform_filter_json)
    .bind(&account.tag_policies_json)
    .bind(&account.required_labels)
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn update_account_tag_policies(
    db: &Database,
    name: &str,
    tag_policies_json: &str,
) -> Result<()> {
    sqlx::query("UPDATE accounts SET tag_policies_json = $1 WHERE name = $2")
        .bind(tag_policies_json)
        .bind(name)
        .execute(&db.pool)
        .await?;
    Ok(())
}

// ------------------------------------------------------------------ repos

pub async fn get_repo(db: &Database, account_name: &str, name: &str) -> Result<Option<Repository>> {
    let repo = sqlx::query_as::<_, Repository>(
        "SELECT * FROM repos WHERE account_name = $1 AND name = $2",
    )
    .bind(account_name)
    .bind(name)
    .fetch_optional(&db.pool)
    .await?;
    Ok(repo)
}

pub async fn get_or_create_repo(
    db: &Database,
    account_name: &str,
    name: &str,
) -> Result<Repository> {
    if let Some(repo) = get_repo(db, account_name, name).await? {
        return Ok(repo);
    }

    let id = Uuid::new_v4();
    // a concurrent creator may win the race; the unique index decides
    sqlx::query("INSERT OR IGNORE INTO repos (id, account_name, name) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(account_name)
        .bind(name)
        .execute(&db.pool)
        .await?;

    let repo = sqlx::query_as::<_, Repository>(
        "SELECT * FROM repos WHERE account_name = $1 AND name = $2",
    )
    .bind(account_name)
    .bind(name)
    .fetch_one(&db.pool)
    .await?;
    Ok(repo)
}

/// All repositories, sorted by `account/name`. The catalog handler filters
/// by the token's account scopes and applies pagination.
pub async fn list_all_repos(db: &Database) -> Result<Vec<Repository>> {
    let repos =
        sqlx::query_as::<_, Repository>("SELECT * FROM repos ORDER BY account_name, name")
            .fetch_all(&db.pool)
            .await?;
    Ok(repos)
}

// ------------------------------------------------------------------ blobs

pub async fn get_blob(db: &Database, account_name: &str, digest: &str) -> Result<Option<Blob>> {
    let blob = sqlx::query_as::<_, Blob>(
        "SELECT * FROM blobs WHERE account_name = $1 AND digest = $2",
    )
    .bind(account_name)
    .bind(digest)
    .fetch_optional(&db.pool)
    .await?;
    Ok(blob)
}

/// A blob is visible in a repository only through a blob mount.
pub async fn get_blob_in_repo(
    db: &Database,
    repo_id: &Uuid,
    digest: &str,
) -> Result<Option<Blob>> {
    let blob = sqlx::query_as::<_, Blob>(
        r#"
        SELECT b.* FROM blobs b
        JOIN blob_mounts bm ON b.id = bm.blob_id
        WHERE bm.repo_id = $1 AND b.digest = $2
        "#,
    )
    .bind(repo_id)
    .bind(digest)
    .fetch_optional(&db.pool)
    .await?;
    Ok(blob)
}

/// Outcome of [`commit_blob`]: the winning row plus whether this call
/// inserted it. When `inserted` is false the caller owns a redundant
/// storage object and must delete it.
pub struct BlobCommit {
    pub blob: Blob,
    pub inserted: bool,
}

/// Insert-if-absent on (account, digest), then mount into the repo.
/// Concurrent duplicate uploads converge on a single row here.
pub async fn commit_blob(
    db: &Database,
    account_name: &str,
    digest: &str,
    size_bytes: i64,
    storage_id: &str,
    media_type: &str,
    repo_id: &Uuid,
) -> Result<BlobCommit> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO blobs (id, account_name, digest, size_bytes, storage_id,
            pushed_at, validated_at, media_type)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT(account_name, digest) DO NOTHING
        "#,
    )
    .bind(id)
    .bind(account_name)
    .bind(digest)
    .bind(size_bytes)
    .bind(storage_id)
    .bind(now)
    .bind(now)
    .bind(media_type)
    .execute(&db.pool)
    .await?;
    let inserted = result.rows_affected() > 0;

    let blob = sqlx::query_as::<_, Blob>(
        "SELECT * FROM blobs WHERE account_name = $1 AND digest = $2",
    )
    .bind(account_name)
    .bind(digest)
    .fetch_one(&db.pool)
    .await?;

    mount_blob(db, &blob.id, repo_id).await?;

    Ok(BlobCommit { blob, inserted })
}

/// Records a blob known from a replicated manifest whose bytes have not
/// been fetched yet (`storage_id` stays empty until first pull).
pub async fn announce_blob(
    db: &Database,
    account_name: &str,
    digest: &str,
    size_bytes: i64,
    media_type: &str,
    repo_id: &Uuid,
) -> Result<Blob> {
    let commit = commit_blob(db, account_name, digest, size_bytes, "", media_type, repo_id).await?;
    Ok(commit.blob)
}

/// Marks an announced blob as replicated.
pub async fn set_blob_backing(
    db: &Database,
    blob_id: &Uuid,
    storage_id: &str,
    size_bytes: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE blobs SET storage_id = $1, size_bytes = $2, validated_at = $3 WHERE id = $4",
    )
    .bind(storage_id)
    .bind(size_bytes)
    .bind(Utc::now())
    .bind(blob_id)
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Blob media types become known once a manifest names the blob in a
/// descriptor.
pub async fn set_blob_media_type(db: &Database, blob_id: &Uuid, media_type: &str) -> Result<()> {
    sqlx::query("UPDATE blobs SET media_type = $1 WHERE id = $2")
        .bind(media_type)
        .bind(blob_id)
        .execute(&db.pool)
        .await?;
    Ok(())
}

pub async fn mount_blob(db: &Database, blob_id: &Uuid, repo_id: &Uuid) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO blob_mounts (blob_id, repo_id) VALUES ($1, $2)")
        .bind(blob_id)
        .bind(repo_id)
        .execute(&db.pool)
        .await?;
    Ok(())
}

pub async fn unmount_blob(db: &Database, repo_id: &Uuid, blob_id: &Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM blob_mounts WHERE repo_id = $1 AND blob_id = $2")
        .bind(repo_id)
        .bind(blob_id)
        .execute(&db.pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Whether any manifest in this repo references the blob. Blob mounts may
/// not be deleted while this holds.
pub async fn blob_is_referenced(db: &Database, repo_id: &Uuid, blob_id: &Uuid) -> Result<bool> {
    let row = sqlx::query(
        "SELECT 1 FROM manifest_blob_refs WHERE repo_id = $1 AND blob_id = $2 LIMIT 1",
    )
    .bind(repo_id)
    .bind(blob_id)
    .fetch_optional(&db.pool)
    .await?;
    Ok(row.is_some())
}

// ---------------------------------------------------------------- uploads

pub async fn insert_upload(db: &Database, upload: &Upload) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO uploads (uuid, repo_id, storage_id, size_bytes, digest, num_chunks, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(upload.uuid)
    .bind(upload.repo_id)
    .bind(&upload.storage_id)
    .bind(upload.size_bytes)
    .bind(&upload.digest)
    .bind(upload.num_chunks)
    .bind(upload.updated_at)
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn get_upload(db: &Database, repo_id: &Uuid, uuid: &Uuid) -> Result<Option<Upload>> {
    let upload =
        sqlx::query_as::<_, Upload>("SELECT * FROM uploads WHERE uuid = $1 AND repo_id = $2")
            .bind(uuid)
            .bind(repo_id)
            .fetch_optional(&db.pool)
            .await?;
    Ok(upload)
}

pub async fn update_upload(
    db: &Database,
    uuid: &Uuid,
    size_bytes: i64,
    digest: &str,
    num_chunks: i32,
) -> Result<()> {
    sqlx::query(
        "UPDATE uploads SET size_bytes = $1, digest = $2, num_chunks = $3, updated_at = $4 WHERE uuid = $5",
    )
    .bind(size_bytes)
    .bind(digest)
    .bind(num_chunks)
    .bind(Utc::now())
    .bind(uuid)
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn delete_upload(db: &Database, uuid: &Uuid) -> Result<()> {
    sqlx::query("DELETE FROM uploads WHERE uuid = $1")
        .bind(uuid)
        .execute(&db.pool)
        .await?;
    Ok(())
}

// -------------------------------------------------------------- manifests

pub async fn get_manifest(db: &Database, repo_id: &Uuid, digest: &str) -> Result<Option<Manifest>> {
    let manifest = sqlx::query_as::<_, Manifest>(
        "SELECT * FROM manifests WHERE repo_id = $1 AND digest = $2",
    )
    .bind(repo_id)
    .bind(digest)
    .fetch_optional(&db.pool)
    .await?;
    Ok(manifest)
}

pub async fn get_manifest_content(
    db: &Database,
    repo_id: &Uuid,
    digest: &str,
) -> Result<Option<Vec<u8>>> {
    let row = sqlx::query(
        "SELECT content FROM manifest_contents WHERE repo_id = $1 AND digest = $2",
    )
    .bind(repo_id)
    .bind(digest)
    .fetch_optional(&db.pool)
    .await?;
    Ok(row.map(|r| r.get("content")))
}

/// Everything a manifest PUT writes in one transaction.
pub struct NewManifest {
    pub manifest: Manifest,
    pub content: Vec<u8>,
    pub blob_ids: Vec<Uuid>,
    pub child_digests: Vec<String>,
    pub tag_name: Option<String>,
}

/// Outcome of [`insert_manifest`], used to decide which audit events fire.
pub struct ManifestPut {
    pub manifest_inserted: bool,
    pub tag_changed: bool,
    pub pushed_at: DateTime<Utc>,
}

/// Inserts the manifest row, its raw contents, its reference edges, and the
/// tag row when PUTting to a tag. Repeated identical PUTs are no-ops for
/// the manifest and only move the tag when it pointed elsewhere.
pub async fn insert_manifest(db: &Database, new: &NewManifest) -> Result<ManifestPut> {
    let mut tx = db.pool.begin().await?;

    let existing: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT pushed_at FROM manifests WHERE repo_id = $1 AND digest = $2",
    )
    .bind(new.manifest.repo_id)
    .bind(&new.manifest.digest)
    .fetch_optional(&mut *tx)
    .await?;

    let manifest_inserted = existing.is_none();
    let pushed_at = existing.map(|(t,)| t).unwrap_or(new.manifest.pushed_at);

    if manifest_inserted {
        let m = &new.manifest;
        sqlx::query(
            r#"
            INSERT INTO manifests (repo_id, digest, media_type, size_bytes, pushed_at,
                validated_at, last_pulled_at, min_layer_created_at, max_layer_created_at,
                artifact_type, subject_digest, labels_json, annotations_json,
                vulnerability_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(m.repo_id)
        .bind(&m.digest)
        .bind(&m.media_type)
        .bind(m.size_bytes)
        .bind(m.pushed_at)
        .bind(m.validated_at)
        .bind(m.last_pulled_at)
        .bind(m.min_layer_created_at)
        .bind(m.max_layer_created_at)
        .bind(&m.artifact_type)
        .bind(&m.subject_digest)
        .bind(&m.labels_json)
        .bind(&m.annotations_json)
        .bind(&m.vulnerability_status)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO manifest_contents (repo_id, digest, content) VALUES ($1, $2, $3)",
        )
        .bind(m.repo_id)
        .bind(&m.digest)
        .bind(&new.content)
        .execute(&mut *tx)
        .await?;

        for blob_id in &new.blob_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO manifest_blob_refs (repo_id, parent_digest, blob_id) VALUES ($1, $2, $3)",
            )
            .bind(m.repo_id)
            .bind(&m.digest)
            .bind(blob_id)
            .execute(&mut *tx)
            .await?;
        }

        for child in &new.child_digests {
            sqlx::query(
                "INSERT OR IGNORE INTO manifest_manifest_refs (repo_id, parent_digest, child_digest) VALUES ($1, $2, $3)",
            )
            .bind(m.repo_id)
            .bind(&m.digest)
            .bind(child)
            .execute(&mut *tx)
            .await?;
        }
    }

    let mut tag_changed = false;
    if let Some(tag_name) = &new.tag_name {
        let current: Option<(String,)> =
            sqlx::query_as("SELECT digest FROM tags WHERE repo_id = $1 AND name = $2")
                .bind(new.manifest.repo_id)
                .bind(tag_name)
                .fetch_optional(&mut *tx)
                .await?;
        tag_changed = current.as_ref().map(|(d,)| d.as_str()) != Some(new.manifest.digest.as_str());

        sqlx::query(
            r#"
            INSERT INTO tags (repo_id, name, digest, pushed_at, last_pulled_at)
            VALUES ($1, $2, $3, $4, NULL)
            ON CONFLICT(repo_id, name)
            DO UPDATE SET digest = excluded.digest, pushed_at = excluded.pushed_at
            "#,
        )
        .bind(new.manifest.repo_id)
        .bind(tag_name)
        .bind(&new.manifest.digest)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(ManifestPut {
        manifest_inserted,
        tag_changed,
        pushed_at,
    })
}

/// Deletes the manifest and cascades its tag rows and reference edges.
pub async fn delete_manifest(db: &Database, repo_id: &Uuid, digest: &str) -> Result<bool> {
    let mut tx = db.pool.begin().await?;

    sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM manifest_blob_refs WHERE repo_id = $1 AND parent_digest = $2")
        .bind(repo_id)
        .bind(digest)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM manifest_manifest_refs WHERE repo_id = $1 AND parent_digest = $2")
        .bind(repo_id)
        .bind(digest)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM manifest_contents WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM manifests WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

/// Returns the digest of a manifest in the same repo that references the
/// given one, if any. Such a manifest blocks deletion.
pub async fn find_parent_manifest(
    db: &Database,
    repo_id: &Uuid,
    child_digest: &str,
) -> Result<Option<String>> {
    let row = sqlx::query(
        "SELECT parent_digest FROM manifest_manifest_refs WHERE repo_id = $1 AND child_digest = $2 LIMIT 1",
    )
    .bind(repo_id)
    .bind(child_digest)
    .fetch_optional(&db.pool)
    .await?;
    Ok(row.map(|r| r.get("parent_digest")))
}

/// Manifests in this repo whose `subject` equals the given digest, sorted
/// by digest for stable referrer listings.
pub async fn list_referrers(
    db: &Database,
    repo_id: &Uuid,
    subject_digest: &str,
    artifact_type: Option<&str>,
) -> Result<Vec<Manifest>> {
    let manifests = match artifact_type {
        Some(filter) => {
            sqlx::query_as::<_, Manifest>(
                "SELECT * FROM manifests WHERE repo_id = $1 AND subject_digest = $2 AND artifact_type = $3 ORDER BY digest",
            )
            .bind(repo_id)
            .bind(subject_digest)
            .bind(filter)
            .fetch_all(&db.pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Manifest>(
                "SELECT * FROM manifests WHERE repo_id = $1 AND subject_digest = $2 ORDER BY digest",
            )
            .bind(repo_id)
            .bind(subject_digest)
            .fetch_all(&db.pool)
            .await?
        }
    };
    Ok(manifests)
}

pub async fn touch_manifest_pulled(db: &Database, repo_id: &Uuid, digest: &str) -> Result<()> {
    sqlx::query("UPDATE manifests SET last_pulled_at = $1 WHERE repo_id = $2 AND digest = $3")
        .bind(Utc::now())
        .bind(repo_id)
        .bind(digest)
        .execute(&db.pool)
        .await?;
    Ok(())
}

pub async fn touch_tag_pulled(db: &Database, repo_id: &Uuid, name: &str) -> Result<()> {
    sqlx::query("UPDATE tags SET last_pulled_at = $1 WHERE repo_id = $2 AND name = $3")
        .bind(Utc::now())
        .bind(repo_id)
        .bind(name)
        .execute(&db.pool)
        .await?;
    Ok(())
}

// ----------------------------------------------------------------- quotas

pub async fn get_quota(db: &Database, auth_tenant_id: &str) -> Result<Option<Quota>> {
    let quota = sqlx::query_as::<_, Quota>("SELECT * FROM quotas WHERE auth_tenant_id = $1")
        .bind(auth_tenant_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(quota)
}

pub async fn set_quota(db: &Database, auth_tenant_id: &str, manifests_max: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO quotas (auth_tenant_id, manifests_max) VALUES ($1, $2)
        ON CONFLICT(auth_tenant_id) DO UPDATE SET manifests_max = excluded.manifests_max
        "#,
    )
    .bind(auth_tenant_id)
    .bind(manifests_max)
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Current manifest count across all accounts of a tenant.
pub async fn manifest_usage(db: &Database, auth_tenant_id: &str) -> Result<i64> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS usage_count FROM manifests m
        JOIN repos r ON m.repo_id = r.id
        JOIN accounts a ON r.account_name = a.name
        WHERE a.auth_tenant_id = $1
        "#,
    )
    .bind(auth_tenant_id)
    .fetch_one(&db.pool)
    .await?;
    Ok(row.get("usage_count"))
}

// ------------------------------------------------------------------- tags

pub async fn get_tag(db: &Database, repo_id: &Uuid, name: &str) -> Result<Option<Tag>> {
    let tag = sqlx::query_as::<_, Tag>("SELECT * FROM tags WHERE repo_id = $1 AND name = $2")
        .bind(repo_id)
        .bind(name)
        .fetch_optional(&db.pool)
        .await?;
    Ok(tag)
}

pub async fn list_tags(db: &Database, repo_id: &Uuid) -> Result<Vec<Tag>> {
    let tags = sqlx::query_as::<_, Tag>("SELECT * FROM tags WHERE repo_id = $1 ORDER BY name")
        .bind(repo_id)
        .fetch_all(&db.pool)
        .await?;
    Ok(tags)
}

pub async fn list_tags_for_digest(
    db: &Database,
    repo_id: &Uuid,
    digest: &str,
) -> Result<Vec<Tag>> {
    let tags = sqlx::query_as::<_, Tag>(
        "SELECT * FROM tags WHERE repo_id = $1 AND digest = $2 ORDER BY name",
    )
    .bind(repo_id)
    .bind(digest)
    .fetch_all(&db.pool)
    .await?;
    Ok(tags)
}

pub async fn delete_tag(db: &Database, repo_id: &Uuid, name: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND name = $2")
        .bind(repo_id)
        .bind(name)
        .execute(&db.pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
