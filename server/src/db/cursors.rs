//! The sync clock and the per-direction cursors.

use crate::error::Result;
use fieldsync_engine::{Direction, Tick, TickTock};
use sqlx::PgPool;

const CURRENT_SYNC_TICK: &str = "currentSyncTick";

/// Advance the clock by two in one statement.
pub async fn tick_tock(pool: &PgPool) -> Result<TickTock> {
    let current: i64 = sqlx::query_scalar(
        r#"
        UPDATE sync_facts
        SET value = (value::bigint + 2)::text
        WHERE key = $1
        RETURNING value::bigint
        "#,
    )
    .bind(CURRENT_SYNC_TICK)
    .fetch_one(pool)
    .await?;
    Ok(TickTock::from_incremented(current))
}

pub async fn fetch_or_create_cursor(pool: &PgPool, direction: Direction) -> Result<Tick> {
    let last_beat: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO sync_cursors (direction, last_beat)
        VALUES ($1, 0)
        ON CONFLICT (direction) DO UPDATE SET direction = EXCLUDED.direction
        RETURNING last_beat
        "#,
    )
    .bind(direction.as_str())
    .fetch_one(pool)
    .await?;
    Ok(last_beat)
}

pub async fn update_cursor(pool: &PgPool, direction: Direction, last_beat: Tick) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_cursors (direction, last_beat)
        VALUES ($1, $2)
        ON CONFLICT (direction) DO UPDATE SET
            last_beat = EXCLUDED.last_beat,
            updated_at = now()
        "#,
    )
    .bind(direction.as_str())
    .bind(last_beat)
    .execute(pool)
    .await?;
    Ok(())
}
