use crate::errors::SurveyError;
use crate::models::{BlockRef, Disposition, SessionId, VerificationBitmap};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use survey_zk::constants::DOMAIN_BLOCK;
use survey_zk::transcript::digest_hex;
use uuid::Uuid;

pub type Db = Pool<Sqlite>;

/// `prev_hash` of the first block.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub async fn connect(db_url: &str) -> Result<Db, SurveyError> {
    Ok(SqlitePoolOptions::new().max_connections(5).connect(db_url).await?)
}

/// A private in-memory ledger. One connection, since every connection would get its own database.
pub async fn connect_in_memory() -> Result<Db, SurveyError> {
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_schema(&db).await?;
    Ok(db)
}

pub async fn init_schema(db: &Db) -> Result<(), SurveyError> {
    // Append-only: rows are inserted, never updated.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS blocks (
  idx INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT NOT NULL,
  disposition TEXT NOT NULL,
  bitmap_json TEXT NOT NULL,
  prev_hash TEXT NOT NULL,
  hash TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS blocks_by_session ON blocks(session_id);
"#,
    )
    .execute(db)
    .await?;

    Ok(())
}

fn block_hash(prev_hash: &str, session_id: &str, disposition: &str, bitmap_json: &str, created_at: &str) -> String {
    digest_hex(
        DOMAIN_BLOCK,
        &[
            prev_hash.as_bytes(),
            session_id.as_bytes(),
            disposition.as_bytes(),
            bitmap_json.as_bytes(),
            created_at.as_bytes(),
        ],
    )
}

fn block_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<BlockRef, SurveyError> {
    let index: i64 = row.get(0);
    let session_id: String = row.get(1);
    let disposition: String = row.get(2);
    let bitmap_json: String = row.get(3);
    let prev_hash: String = row.get(4);
    let hash: String = row.get(5);
    let created_at: String = row.get(6);

    let session_id = Uuid::parse_str(&session_id).map_err(|e| SurveyError::Ledger(e.to_string()))?;
    let disposition =
        Disposition::parse(&disposition).ok_or_else(|| SurveyError::Ledger(format!("bad disposition {disposition}")))?;
    let bitmap: VerificationBitmap =
        serde_json::from_str(&bitmap_json).map_err(|e| SurveyError::Ledger(e.to_string()))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| SurveyError::Ledger(e.to_string()))?
        .with_timezone(&Utc);

    Ok(BlockRef {
        index,
        session_id,
        disposition,
        bitmap,
        prev_hash,
        hash,
        created_at,
    })
}

/// Append a block chained onto the current head. Callers serialise appends.
pub async fn append_block(
    db: &Db,
    session_id: SessionId,
    bitmap: &VerificationBitmap,
    disposition: Disposition,
) -> Result<BlockRef, SurveyError> {
    let prev_hash = sqlx::query(r#"SELECT hash FROM blocks ORDER BY idx DESC LIMIT 1"#)
        .fetch_optional(db)
        .await?
        .map(|row| row.get::<String, _>(0))
        .unwrap_or_else(|| GENESIS_HASH.to_string());

    let session = session_id.to_string();
    let bitmap_json = serde_json::to_string(bitmap).map_err(|e| SurveyError::Ledger(e.to_string()))?;
    let created_at = Utc::now().to_rfc3339();
    let hash = block_hash(&prev_hash, &session, disposition.as_str(), &bitmap_json, &created_at);

    let result = sqlx::query(
        r#"INSERT INTO blocks (session_id, disposition, bitmap_json, prev_hash, hash, created_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&session)
    .bind(disposition.as_str())
    .bind(&bitmap_json)
    .bind(&prev_hash)
    .bind(&hash)
    .bind(&created_at)
    .execute(db)
    .await?;

    tracing::info!(%session_id, disposition = disposition.as_str(), %hash, "ledger block appended");

    Ok(BlockRef {
        index: result.last_insert_rowid(),
        session_id,
        disposition,
        bitmap: bitmap.clone(),
        prev_hash,
        hash,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| SurveyError::Ledger(e.to_string()))?
            .with_timezone(&Utc),
    })
}

pub async fn latest_block(db: &Db, session_id: SessionId) -> Result<Option<BlockRef>, SurveyError> {
    let row = sqlx::query(
        r#"SELECT idx, session_id, disposition, bitmap_json, prev_hash, hash, created_at
           FROM blocks WHERE session_id = ? ORDER BY idx DESC LIMIT 1"#,
    )
    .bind(session_id.to_string())
    .fetch_optional(db)
    .await?;

    row.as_ref().map(block_from_row).transpose()
}

pub async fn list_blocks(db: &Db, offset: u64, limit: u64) -> Result<Vec<BlockRef>, SurveyError> {
    let rows = sqlx::query(
        r#"SELECT idx, session_id, disposition, bitmap_json, prev_hash, hash, created_at
           FROM blocks ORDER BY idx LIMIT ? OFFSET ?"#,
    )
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(db)
    .await?;

    rows.iter().map(block_from_row).collect()
}

/// Recompute every hash and link. Returns the index of the first bad block, if any.
pub async fn verify_chain(db: &Db) -> Result<Option<i64>, SurveyError> {
    let rows = sqlx::query(
        r#"SELECT idx, session_id, disposition, bitmap_json, prev_hash, hash, created_at
           FROM blocks ORDER BY idx"#,
    )
    .fetch_all(db)
    .await?;

    let mut prev = GENESIS_HASH.to_string();
    for row in rows {
        let index: i64 = row.get(0);
        let session_id: String = row.get(1);
        let disposition: String = row.get(2);
        let bitmap_json: String = row.get(3);
        let prev_hash: String = row.get(4);
        let hash: String = row.get(5);
        let created_at: String = row.get(6);

        let expected = block_hash(&prev_hash, &session_id, &disposition, &bitmap_json, &created_at);
        if prev_hash != prev || hash != expected {
            return Ok(Some(index));
        }
        prev = hash;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use survey_zk::proofs::ProofCategory;

    fn bitmap(n: u32) -> VerificationBitmap {
        VerificationBitmap::from([(ProofCategory::Aggregation, n), (ProofCategory::KeySwitch, n)])
    }

    #[tokio::test]
    async fn blocks_chain_onto_each_other() {
        let db = connect_in_memory().await.unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = append_block(&db, a, &bitmap(2), Disposition::Verified).await.unwrap();
        assert_eq!(first.prev_hash, GENESIS_HASH);
        let second = append_block(&db, b, &bitmap(0), Disposition::Disputed).await.unwrap();
        assert_eq!(second.prev_hash, first.hash);

        let head = latest_block(&db, a).await.unwrap().unwrap();
        assert_eq!(head.hash, first.hash);
        assert_eq!(head.bitmap, bitmap(2));
        assert_eq!(head.disposition, Disposition::Verified);
        assert!(latest_block(&db, Uuid::new_v4()).await.unwrap().is_none());

        assert_eq!(list_blocks(&db, 0, 10).await.unwrap().len(), 2);
        assert_eq!(verify_chain(&db).await.unwrap(), None);
    }

    #[tokio::test]
    async fn tampering_breaks_the_chain() {
        let db = connect_in_memory().await.unwrap();
        let s = Uuid::new_v4();
        append_block(&db, s, &bitmap(1), Disposition::Verified).await.unwrap();
        let second = append_block(&db, s, &bitmap(1), Disposition::Verified).await.unwrap();

        sqlx::query("UPDATE blocks SET disposition = 'disputed' WHERE idx = ?")
            .bind(second.index)
            .execute(&db)
            .await
            .unwrap();
        assert_eq!(verify_chain(&db).await.unwrap(), Some(second.index));
    }
}
