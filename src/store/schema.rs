//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Records table schema. One row per timed attempt; `is_best` is the only
/// column this worker mutates.
#[derive(Iden)]
pub enum Records {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "participant_id"]
    ParticipantId,
    #[iden = "level_id"]
    LevelId,
    #[iden = "time"]
    Time,
    #[iden = "is_valid"]
    IsValid,
    #[iden = "is_best"]
    IsBest,
}

/// Personal bests summary table schema. One row per pair that has ever had a
/// best attempt; updated in place once created, never deleted here.
#[derive(Iden)]
pub enum PersonalBests {
    Table,
    #[iden = "participant_id"]
    ParticipantId,
    #[iden = "level_id"]
    LevelId,
    #[iden = "record_id"]
    RecordId,
    #[iden = "created_at"]
    CreatedAt,
}

/// SQL for creating the records table.
pub const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    participant_id INTEGER NOT NULL,
    level_id INTEGER NOT NULL,
    time REAL NOT NULL,
    is_valid INTEGER NOT NULL DEFAULT 1,
    is_best INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_records_participant_level ON records(participant_id, level_id);
"#;

/// SQL for creating the personal bests summary table.
pub const CREATE_PERSONAL_BESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS personal_bests (
    participant_id INTEGER NOT NULL,
    level_id INTEGER NOT NULL,
    record_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (participant_id, level_id)
);
"#;
