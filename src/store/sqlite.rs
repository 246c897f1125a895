//! SQLite implementation of the best-record update transaction.

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Acquire, Row, SqliteConnection, SqlitePool};

use super::schema::{
    PersonalBests, Records, CREATE_PERSONAL_BESTS_TABLE, CREATE_RECORDS_TABLE,
};
use super::{BestRecordUpdater, Result};

/// SQLite-backed record store.
///
/// Each `update` call acquires its own pooled connection, so concurrently
/// running units never share a session or interleave transactions.
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Create a new SQLite record store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_RECORDS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_PERSONAL_BESTS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply the recomputation inside an already-open transaction.
    ///
    /// Nothing becomes visible outside the transaction until the caller
    /// commits; on any error the caller's rollback discards all flag changes.
    async fn apply_update(
        conn: &mut SqliteConnection,
        participant_id: i64,
        level_id: i64,
    ) -> Result<Vec<i64>> {
        // Records currently flagged best for the pair.
        let query = Query::select()
            .column(Records::Id)
            .from(Records::Table)
            .and_where(Expr::col(Records::ParticipantId).eq(participant_id))
            .and_where(Expr::col(Records::LevelId).eq(level_id))
            .and_where(Expr::col(Records::IsBest).eq(1))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;
        let flagged: Vec<i64> = rows.iter().map(|row| row.get("id")).collect();

        // Minimum-time valid attempt. None means the pair currently has no
        // best: clear all flags and set nothing.
        let query = Query::select()
            .column(Records::Id)
            .from(Records::Table)
            .and_where(Expr::col(Records::ParticipantId).eq(participant_id))
            .and_where(Expr::col(Records::LevelId).eq(level_id))
            .and_where(Expr::col(Records::IsValid).eq(1))
            .order_by(Records::Time, Order::Asc)
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let winner: Option<i64> = sqlx::query(&query)
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| row.get("id"));

        let mut changed = Vec::new();

        for id in &flagged {
            if Some(*id) != winner {
                let query = Query::update()
                    .table(Records::Table)
                    .value(Records::IsBest, 0)
                    .and_where(Expr::col(Records::Id).eq(*id))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&query).execute(&mut *conn).await?;
                changed.push(*id);
            }
        }

        if let Some(id) = winner {
            if !flagged.contains(&id) {
                let query = Query::update()
                    .table(Records::Table)
                    .value(Records::IsBest, 1)
                    .and_where(Expr::col(Records::Id).eq(id))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&query).execute(&mut *conn).await?;
                changed.push(id);
            }

            // Summary row: created once, then updated in place. `created_at`
            // keeps its original value on conflict.
            let created_at = chrono::Utc::now().to_rfc3339();
            let query = Query::insert()
                .into_table(PersonalBests::Table)
                .columns([
                    PersonalBests::ParticipantId,
                    PersonalBests::LevelId,
                    PersonalBests::RecordId,
                    PersonalBests::CreatedAt,
                ])
                .values_panic([
                    participant_id.into(),
                    level_id.into(),
                    id.into(),
                    created_at.into(),
                ])
                .on_conflict(
                    OnConflict::columns([
                        PersonalBests::ParticipantId,
                        PersonalBests::LevelId,
                    ])
                    .update_columns([PersonalBests::RecordId])
                    .to_owned(),
                )
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
        }

        Ok(changed)
    }
}

#[async_trait]
impl BestRecordUpdater for SqliteRecordStore {
    async fn update(&self, participant_id: i64, level_id: i64) -> Result<Vec<i64>> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let changed = Self::apply_update(&mut *tx, participant_id, level_id).await?;

        tx.commit().await?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (tempfile::TempDir, SqliteRecordStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pbproc.db");
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path.display()))
            .await
            .expect("connect");
        let store = SqliteRecordStore::new(pool);
        store.init().await.expect("init schema");
        (dir, store)
    }

    async fn seed_record(
        store: &SqliteRecordStore,
        id: i64,
        participant_id: i64,
        level_id: i64,
        time: f64,
        is_valid: bool,
        is_best: bool,
    ) {
        let query = Query::insert()
            .into_table(Records::Table)
            .columns([
                Records::Id,
                Records::ParticipantId,
                Records::LevelId,
                Records::Time,
                Records::IsValid,
                Records::IsBest,
            ])
            .values_panic([
                id.into(),
                participant_id.into(),
                level_id.into(),
                time.into(),
                (is_valid as i32).into(),
                (is_best as i32).into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&store.pool)
            .await
            .expect("seed record");
    }

    async fn is_best(store: &SqliteRecordStore, id: i64) -> bool {
        let query = Query::select()
            .column(Records::IsBest)
            .from(Records::Table)
            .and_where(Expr::col(Records::Id).eq(id))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query)
            .fetch_one(&store.pool)
            .await
            .expect("fetch record");
        row.get::<i64, _>("is_best") != 0
    }

    async fn summary_record_id(
        store: &SqliteRecordStore,
        participant_id: i64,
        level_id: i64,
    ) -> Option<i64> {
        let query = Query::select()
            .column(PersonalBests::RecordId)
            .from(PersonalBests::Table)
            .and_where(Expr::col(PersonalBests::ParticipantId).eq(participant_id))
            .and_where(Expr::col(PersonalBests::LevelId).eq(level_id))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .fetch_optional(&store.pool)
            .await
            .expect("fetch summary")
            .map(|row| row.get("record_id"))
    }

    #[tokio::test]
    async fn test_faster_attempt_takes_over_best() {
        let (_dir, store) = open_store().await;
        seed_record(&store, 1, 7, 3, 50.0, true, true).await;
        seed_record(&store, 2, 7, 3, 40.0, true, false).await;

        let mut changed = store.update(7, 3).await.expect("update");
        changed.sort();

        assert_eq!(changed, vec![1, 2]);
        assert!(!is_best(&store, 1).await);
        assert!(is_best(&store, 2).await);
        assert_eq!(summary_record_id(&store, 7, 3).await, Some(2));
    }

    #[tokio::test]
    async fn test_no_valid_attempts_clears_best() {
        let (_dir, store) = open_store().await;
        seed_record(&store, 1, 7, 3, 50.0, false, true).await;

        let changed = store.update(7, 3).await.expect("update");

        assert_eq!(changed, vec![1]);
        assert!(!is_best(&store, 1).await);
        assert_eq!(summary_record_id(&store, 7, 3).await, None);
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let (_dir, store) = open_store().await;
        seed_record(&store, 1, 7, 3, 50.0, true, false).await;
        seed_record(&store, 2, 7, 3, 40.0, true, false).await;

        let first = store.update(7, 3).await.expect("first update");
        assert_eq!(first, vec![2]);

        let second = store.update(7, 3).await.expect("second update");
        assert!(second.is_empty());
        assert!(is_best(&store, 2).await);
    }

    #[tokio::test]
    async fn test_multiple_stale_flags_collapse_to_single_winner() {
        let (_dir, store) = open_store().await;
        seed_record(&store, 1, 7, 3, 50.0, true, true).await;
        seed_record(&store, 2, 7, 3, 45.0, true, true).await;
        seed_record(&store, 3, 7, 3, 40.0, false, false).await;
        seed_record(&store, 4, 7, 3, 42.0, true, false).await;

        let mut changed = store.update(7, 3).await.expect("update");
        changed.sort();

        // Invalid record 3 never wins despite the lowest time.
        assert_eq!(changed, vec![1, 2, 4]);
        assert!(!is_best(&store, 1).await);
        assert!(!is_best(&store, 2).await);
        assert!(!is_best(&store, 3).await);
        assert!(is_best(&store, 4).await);
    }

    #[tokio::test]
    async fn test_pairs_are_isolated() {
        let (_dir, store) = open_store().await;
        seed_record(&store, 1, 7, 3, 50.0, true, true).await;
        seed_record(&store, 2, 9, 3, 40.0, true, false).await;

        let changed = store.update(9, 3).await.expect("update");

        assert_eq!(changed, vec![2]);
        // Pair (7, 3) untouched.
        assert!(is_best(&store, 1).await);
    }

    #[tokio::test]
    async fn test_summary_updates_in_place() {
        let (_dir, store) = open_store().await;
        seed_record(&store, 1, 7, 3, 50.0, true, false).await;
        store.update(7, 3).await.expect("first update");
        assert_eq!(summary_record_id(&store, 7, 3).await, Some(1));

        seed_record(&store, 2, 7, 3, 40.0, true, false).await;
        store.update(7, 3).await.expect("second update");
        assert_eq!(summary_record_id(&store, 7, 3).await, Some(2));
    }

    #[tokio::test]
    async fn test_rollback_leaves_no_partial_changes() {
        let (_dir, store) = open_store().await;
        seed_record(&store, 1, 7, 3, 50.0, true, true).await;
        seed_record(&store, 2, 7, 3, 40.0, true, false).await;

        {
            let mut conn = store.pool.acquire().await.expect("acquire");
            let mut tx = conn.begin().await.expect("begin");
            let changed = SqliteRecordStore::apply_update(&mut *tx, 7, 3)
                .await
                .expect("apply");
            assert_eq!(changed.len(), 2);
            tx.rollback().await.expect("rollback");
        }

        // State equals the pre-call state.
        assert!(is_best(&store, 1).await);
        assert!(!is_best(&store, 2).await);
        assert_eq!(summary_record_id(&store, 7, 3).await, None);
    }
}
