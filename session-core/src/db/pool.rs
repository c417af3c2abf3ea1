//! Database pool and query utilities

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::error::AppResult;

/// Open (or create) the database with WAL mode and run migrations
pub async fn connect(db_path: &str) -> AppResult<SqlitePool> {
    let db_url = format!("sqlite:{}?mode=rwc", db_path);
    let db = SqlitePool::connect(&db_url).await?;

    // Enable WAL mode for better concurrent performance
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&db).await?;

    // Set synchronous mode to NORMAL for better performance with WAL
    sqlx::query("PRAGMA synchronous=NORMAL;").execute(&db).await?;

    sqlx::migrate!("../migrations").run(&db).await?;

    tracing::info!("Database initialized with WAL mode at: {}", db_path);
    Ok(db)
}

/// Private in-memory database, mostly for tests and ephemeral runs
///
/// A single connection keeps every query on the same in-memory database.
pub async fn connect_in_memory() -> AppResult<SqlitePool> {
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::migrate!("../migrations").run(&db).await?;
    Ok(db)
}

// ============================================================================
// Vault Queries
// ============================================================================

/// Insert or replace a sealed vault entry
pub async fn put_vault_entry(pool: &SqlitePool, name: &str, ciphertext: &[u8]) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO vault_entries (name, ciphertext, updated_at)
        VALUES (?, ?, datetime('now'))
        ON CONFLICT(name) DO UPDATE SET
            ciphertext = excluded.ciphertext,
            updated_at = datetime('now')
        "#,
    )
    .bind(name)
    .bind(ciphertext)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_vault_entry(pool: &SqlitePool, name: &str) -> AppResult<Option<Vec<u8>>> {
    let row = sqlx::query_as::<_, (Vec<u8>,)>("SELECT ciphertext FROM vault_entries WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|(ciphertext,)| ciphertext))
}

/// Delete one entry; returns whether it existed
pub async fn delete_vault_entry(pool: &SqlitePool, name: &str) -> AppResult<bool> {
    let result = sqlx::query("DELETE FROM vault_entries WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Names of all entries starting with `prefix`
pub async fn list_vault_entries(pool: &SqlitePool, prefix: &str) -> AppResult<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT name FROM vault_entries WHERE substr(name, 1, length(?1)) = ?1 ORDER BY name",
    )
    .bind(prefix)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(name,)| name).collect())
}

pub async fn clear_vault(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query("DELETE FROM vault_entries").execute(pool).await?;
    Ok(())
}

// ============================================================================
// Session Queries
// ============================================================================

/// Save sealed session state to the local cache
pub async fn upsert_session(
    pool: &SqlitePool,
    conversation_id: &str,
    peer_id: &str,
    session_data: &str,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (conversation_id, peer_id, session_data, updated_at)
        VALUES (?, ?, ?, datetime('now'))
        ON CONFLICT(conversation_id, peer_id) DO UPDATE SET
            session_data = excluded.session_data,
            updated_at = datetime('now')
        "#,
    )
    .bind(conversation_id)
    .bind(peer_id)
    .bind(session_data)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_session(
    pool: &SqlitePool,
    conversation_id: &str,
    peer_id: &str,
) -> AppResult<Option<String>> {
    let row = sqlx::query_as::<_, (String,)>(
        "SELECT session_data FROM sessions WHERE conversation_id = ? AND peer_id = ?",
    )
    .bind(conversation_id)
    .bind(peer_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(data,)| data))
}

pub async fn delete_session(pool: &SqlitePool, conversation_id: &str, peer_id: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM sessions WHERE conversation_id = ? AND peer_id = ?")
        .bind(conversation_id)
        .bind(peer_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete every session in a conversation, returning the peers that had one
pub async fn delete_conversation_sessions(
    pool: &SqlitePool,
    conversation_id: &str,
) -> AppResult<Vec<String>> {
    let peers = sqlx::query_as::<_, (String,)>("SELECT peer_id FROM sessions WHERE conversation_id = ?")
        .bind(conversation_id)
        .fetch_all(pool)
        .await?;

    sqlx::query("DELETE FROM sessions WHERE conversation_id = ?")
        .bind(conversation_id)
        .execute(pool)
        .await?;

    Ok(peers.into_iter().map(|(peer,)| peer).collect())
}

/// All (conversation, peer) pairs with a local session
pub async fn list_sessions(pool: &SqlitePool) -> AppResult<Vec<(String, String)>> {
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT conversation_id, peer_id FROM sessions ORDER BY updated_at",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn clear_sessions(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query("DELETE FROM sessions").execute(pool).await?;
    Ok(())
}

// ============================================================================
// Pending Exchange Queries
// ============================================================================

/// Record an inbound handshake. The first record for a (sender, conversation)
/// pair wins; returns false when one was already pending.
pub async fn insert_pending_exchange(
    pool: &SqlitePool,
    from_user_id: &str,
    conversation_id: &str,
    exchange_id: &str,
    record: &str,
) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO pending_exchanges (from_user_id, conversation_id, exchange_id, record, received_at)
        VALUES (?, ?, ?, ?, datetime('now'))
        ON CONFLICT(from_user_id, conversation_id) DO NOTHING
        "#,
    )
    .bind(from_user_id)
    .bind(conversation_id)
    .bind(exchange_id)
    .bind(record)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn get_pending_exchange(
    pool: &SqlitePool,
    from_user_id: &str,
    conversation_id: &str,
) -> AppResult<Option<String>> {
    let row = sqlx::query_as::<_, (String,)>(
        "SELECT record FROM pending_exchanges WHERE from_user_id = ? AND conversation_id = ?",
    )
    .bind(from_user_id)
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(record,)| record))
}

pub async fn list_pending_exchanges(pool: &SqlitePool) -> AppResult<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>("SELECT record FROM pending_exchanges ORDER BY received_at")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(record,)| record).collect())
}

pub async fn delete_pending_exchange(
    pool: &SqlitePool,
    from_user_id: &str,
    conversation_id: &str,
) -> AppResult<()> {
    sqlx::query("DELETE FROM pending_exchanges WHERE from_user_id = ? AND conversation_id = ?")
        .bind(from_user_id)
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn clear_pending_exchanges(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query("DELETE FROM pending_exchanges").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vault_entry_prefix_listing() {
        let pool = connect_in_memory().await.unwrap();
        put_vault_entry(&pool, "otk:1", b"a").await.unwrap();
        put_vault_entry(&pool, "otk:2", b"b").await.unwrap();
        put_vault_entry(&pool, "identity", b"c").await.unwrap();

        let names = list_vault_entries(&pool, "otk:").await.unwrap();
        assert_eq!(names, vec!["otk:1", "otk:2"]);

        put_vault_entry(&pool, "otk:1", b"z").await.unwrap();
        assert_eq!(get_vault_entry(&pool, "otk:1").await.unwrap().unwrap(), b"z");

        assert!(delete_vault_entry(&pool, "otk:1").await.unwrap());
        assert!(!delete_vault_entry(&pool, "otk:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_first_pending_exchange_wins() {
        let pool = connect_in_memory().await.unwrap();
        assert!(insert_pending_exchange(&pool, "bob", "c1", "x1", "first").await.unwrap());
        assert!(!insert_pending_exchange(&pool, "bob", "c1", "x2", "second").await.unwrap());

        let record = get_pending_exchange(&pool, "bob", "c1").await.unwrap();
        assert_eq!(record.as_deref(), Some("first"));

        delete_pending_exchange(&pool, "bob", "c1").await.unwrap();
        assert!(list_pending_exchanges(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_conversation_sessions() {
        let pool = connect_in_memory().await.unwrap();
        upsert_session(&pool, "g1", "alice", "s1").await.unwrap();
        upsert_session(&pool, "g1", "bob", "s2").await.unwrap();
        upsert_session(&pool, "c2", "bob", "s3").await.unwrap();

        let mut peers = delete_conversation_sessions(&pool, "g1").await.unwrap();
        peers.sort();
        assert_eq!(peers, vec!["alice", "bob"]);
        assert_eq!(list_sessions(&pool).await.unwrap(), vec![("c2".to_string(), "bob".to_string())]);
    }
}
