use chrono::{DateTime, Utc};
use log::*;
use sqlx::{FromRow, SqliteConnection};

use crate::{
    db::StoreError,
    db_types::{ErroredMessage, MessageKind, OrderId, ParkedMessage},
};

#[derive(FromRow)]
struct ParkedRow {
    order_id: String,
    kind: String,
    blob: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ParkedRow> for ParkedMessage {
    type Error = StoreError;

    fn try_from(row: ParkedRow) -> Result<Self, Self::Error> {
        let kind = row.kind.parse::<MessageKind>().map_err(|e| StoreError::DataConversion(e.to_string()))?;
        Ok(ParkedMessage { order_id: OrderId::new(row.order_id), kind, blob: row.blob, created_at: row.created_at })
    }
}

#[derive(FromRow)]
struct ErroredRow {
    id: i64,
    order_id: String,
    kind: String,
    blob: Vec<u8>,
    error: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ErroredRow> for ErroredMessage {
    type Error = StoreError;

    fn try_from(row: ErroredRow) -> Result<Self, Self::Error> {
        let kind = row.kind.parse::<MessageKind>().map_err(|e| StoreError::DataConversion(e.to_string()))?;
        Ok(ErroredMessage {
            id: row.id,
            order_id: OrderId::new(row.order_id),
            kind,
            blob: row.blob,
            error: row.error,
            created_at: row.created_at,
        })
    }
}

/// Parks a message. Each order holds at most one parked message per kind; returns `false` if the slot was taken.
pub async fn park_message(
    order_id: &OrderId,
    kind: MessageKind,
    blob: &[u8],
    conn: &mut SqliteConnection,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "INSERT INTO parked_messages (order_id, kind, blob, created_at) VALUES ($1, $2, $3, $4) ON CONFLICT (order_id, \
         kind) DO NOTHING",
    )
    .bind(order_id.as_str())
    .bind(kind.as_str())
    .bind(blob)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    let parked = result.rows_affected() > 0;
    if parked {
        debug!("🗃️ Parked {kind} for order {order_id}");
    }
    Ok(parked)
}

pub async fn fetch_parked(order_id: &OrderId, conn: &mut SqliteConnection) -> Result<Vec<ParkedMessage>, StoreError> {
    let rows: Vec<ParkedRow> =
        sqlx::query_as("SELECT * FROM parked_messages WHERE order_id = $1 ORDER BY created_at")
            .bind(order_id.as_str())
            .fetch_all(conn)
            .await?;
    rows.into_iter().map(ParkedMessage::try_from).collect()
}

pub async fn fetch_parked_kind(
    order_id: &OrderId,
    kind: MessageKind,
    conn: &mut SqliteConnection,
) -> Result<Option<ParkedMessage>, StoreError> {
    let row: Option<ParkedRow> = sqlx::query_as("SELECT * FROM parked_messages WHERE order_id = $1 AND kind = $2")
        .bind(order_id.as_str())
        .bind(kind.as_str())
        .fetch_optional(conn)
        .await?;
    row.map(ParkedMessage::try_from).transpose()
}

pub async fn remove_parked(
    order_id: &OrderId,
    kind: MessageKind,
    conn: &mut SqliteConnection,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM parked_messages WHERE order_id = $1 AND kind = $2")
        .bind(order_id.as_str())
        .bind(kind.as_str())
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn record_errored(
    order_id: &OrderId,
    kind: MessageKind,
    blob: &[u8],
    error: &str,
    conn: &mut SqliteConnection,
) -> Result<i64, StoreError> {
    let id = sqlx::query_scalar(
        "INSERT INTO errored_messages (order_id, kind, blob, error, created_at) VALUES ($1, $2, $3, $4, $5) \
         RETURNING id",
    )
    .bind(order_id.as_str())
    .bind(kind.as_str())
    .bind(blob)
    .bind(error)
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;
    warn!("🗃️ {kind} for order {order_id} recorded as errored: {error}");
    Ok(id)
}

pub async fn fetch_errored(order_id: &OrderId, conn: &mut SqliteConnection) -> Result<Vec<ErroredMessage>, StoreError> {
    let rows: Vec<ErroredRow> = sqlx::query_as("SELECT * FROM errored_messages WHERE order_id = $1 ORDER BY id")
        .bind(order_id.as_str())
        .fetch_all(conn)
        .await?;
    rows.into_iter().map(ErroredMessage::try_from).collect()
}
