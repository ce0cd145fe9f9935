use chrono::{DateTime, Utc};
use log::*;
use sqlx::{FromRow, SqliteConnection};

use crate::{
    db::StoreError,
    db_types::{MessageKind, OrderId, StoredMessage},
};

#[derive(FromRow)]
struct MessageRow {
    kind: String,
    seq: i64,
    blob: Vec<u8>,
    acked: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let kind = row.kind.parse::<MessageKind>().map_err(|e| StoreError::DataConversion(e.to_string()))?;
        Ok(StoredMessage { kind, seq: row.seq, blob: row.blob, acked: row.acked, created_at: row.created_at })
    }
}

/// Stores a new message blob with its ACK bit cleared.
pub async fn insert_message(
    order_id: &OrderId,
    kind: MessageKind,
    seq: i64,
    blob: &[u8],
    conn: &mut SqliteConnection,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO order_messages (order_id, kind, seq, blob, acked, created_at) VALUES ($1, $2, $3, $4, 0, $5)",
    )
    .bind(order_id.as_str())
    .bind(kind.as_str())
    .bind(seq)
    .bind(blob)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    trace!("🗃️ Stored {kind}#{seq} for order {order_id}");
    Ok(())
}

pub async fn fetch_messages(order_id: &OrderId, conn: &mut SqliteConnection) -> Result<Vec<StoredMessage>, StoreError> {
    let rows: Vec<MessageRow> = sqlx::query_as(
        "SELECT kind, seq, blob, acked, created_at FROM order_messages WHERE order_id = $1 ORDER BY created_at, seq",
    )
    .bind(order_id.as_str())
    .fetch_all(conn)
    .await?;
    rows.into_iter().map(StoredMessage::try_from).collect()
}

pub async fn set_acked(
    order_id: &OrderId,
    kind: MessageKind,
    seq: i64,
    conn: &mut SqliteConnection,
) -> Result<bool, StoreError> {
    let result = sqlx::query("UPDATE order_messages SET acked = 1 WHERE order_id = $1 AND kind = $2 AND seq = $3")
        .bind(order_id.as_str())
        .bind(kind.as_str())
        .bind(seq)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// The sequence number of the stored message of `kind` whose blob is exactly `blob`, if there is one.
pub async fn find_seq_by_blob(
    order_id: &OrderId,
    kind: MessageKind,
    blob: &[u8],
    conn: &mut SqliteConnection,
) -> Result<Option<i64>, StoreError> {
    let seq = sqlx::query_scalar("SELECT seq FROM order_messages WHERE order_id = $1 AND kind = $2 AND blob = $3")
        .bind(order_id.as_str())
        .bind(kind.as_str())
        .bind(blob)
        .fetch_optional(conn)
        .await?;
    Ok(seq)
}
