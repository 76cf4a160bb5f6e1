use crate::error::Result;
use sqlx::SqlitePool;

pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    // Accounts table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            name TEXT PRIMARY KEY,
            auth_tenant_id TEXT NOT NULL,
            upstream_peer_hostname TEXT,
            external_peer_url TEXT,
            external_peer_username TEXT,
            external_peer_password TEXT,
            is_deleting BOOLEAN NOT NULL DEFAULT FALSE,
            platform_filter_json TEXT,
            tag_policies_json TEXT,
            required_labels TEXT
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Repositories table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repos (
            id TEXT PRIMARY KEY,
            account_name TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY (account_name) REFERENCES accounts (name),
            UNIQUE(account_name, name)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Blobs table; one row per (account, digest)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blobs (
            id TEXT PRIMARY KEY,
            account_name TEXT NOT NULL,
            digest TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            storage_id TEXT NOT NULL DEFAULT '',
            pushed_at DATETIME NOT NULL,
            validated_at DATETIME,
            media_type TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (account_name) REFERENCES accounts (name),
            UNIQUE(account_name, digest)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Blob mount table; deleting a mount is the only way to remove a blob
    // from a repository
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blob_mounts (
            blob_id TEXT NOT NULL,
            repo_id TEXT NOT NULL,
            FOREIGN KEY (blob_id) REFERENCES blobs (id),
            FOREIGN KEY (repo_id) REFERENCES repos (id),
            UNIQUE(blob_id, repo_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Upload sessions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uploads (
            uuid TEXT PRIMARY KEY,
            repo_id TEXT NOT NULL,
            storage_id TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            digest TEXT NOT NULL DEFAULT '',
            num_chunks INTEGER NOT NULL DEFAULT 0,
            updated_at DATETIME NOT NULL,
            FOREIGN KEY (repo_id) REFERENCES repos (id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Manifests table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manifests (
            repo_id TEXT NOT NULL,
            digest TEXT NOT NULL,
            media_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            pushed_at DATETIME NOT NULL,
            validated_at DATETIME NOT NULL,
            last_pulled_at DATETIME,
            min_layer_created_at DATETIME,
            max_layer_created_at DATETIME,
            artifact_type TEXT,
            subject_digest TEXT,
            labels_json TEXT,
            annotations_json TEXT,
            vulnerability_status TEXT,
            FOREIGN KEY (repo_id) REFERENCES repos (id),
            PRIMARY KEY(repo_id, digest)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Raw manifest bytes cache
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manifest_contents (
            repo_id TEXT NOT NULL,
            digest TEXT NOT NULL,
            content BLOB NOT NULL,
            PRIMARY KEY(repo_id, digest),
            FOREIGN KEY (repo_id, digest) REFERENCES manifests (repo_id, digest)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Manifest to blob reference edges
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manifest_blob_refs (
            repo_id TEXT NOT NULL,
            parent_digest TEXT NOT NULL,
            blob_id TEXT NOT NULL,
            FOREIGN KEY (repo_id) REFERENCES repos (id),
            FOREIGN KEY (blob_id) REFERENCES blobs (id),
            UNIQUE(repo_id, parent_digest, blob_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Manifest to manifest reference edges (image lists)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manifest_manifest_refs (
            repo_id TEXT NOT NULL,
            parent_digest TEXT NOT NULL,
            child_digest TEXT NOT NULL,
            FOREIGN KEY (repo_id) REFERENCES repos (id),
            UNIQUE(repo_id, parent_digest, child_digest)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Tags table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            repo_id TEXT NOT NULL,
            name TEXT NOT NULL,
            digest TEXT NOT NULL,
            pushed_at DATETIME NOT NULL,
            last_pulled_at DATETIME,
            FOREIGN KEY (repo_id) REFERENCES repos (id),
            PRIMARY KEY(repo_id, name)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Quotas table, one row per auth tenant
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quotas (
            auth_tenant_id TEXT PRIMARY KEY,
            manifests_max INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
