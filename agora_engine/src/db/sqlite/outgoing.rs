use chrono::{DateTime, Utc};
use log::*;
use sqlx::{FromRow, SqliteConnection};

use crate::{
    db::StoreError,
    db_types::{MessageId, MessageKind, OrderId, OutgoingMessage, PeerId},
};

#[derive(FromRow)]
struct OutgoingRow {
    message_id: String,
    recipient: String,
    sequence: i64,
    order_id: String,
    kind: String,
    message_seq: i64,
    envelope: Vec<u8>,
    attempts: i64,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutgoingRow> for OutgoingMessage {
    type Error = StoreError;

    fn try_from(row: OutgoingRow) -> Result<Self, Self::Error> {
        let kind = row.kind.parse::<MessageKind>().map_err(|e| StoreError::DataConversion(e.to_string()))?;
        Ok(OutgoingMessage {
            message_id: MessageId::from(row.message_id.as_str()),
            recipient: PeerId::new(row.recipient),
            sequence: row.sequence,
            order_id: OrderId::new(row.order_id),
            kind,
            message_seq: row.message_seq,
            envelope: row.envelope,
            attempts: row.attempts,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

/// Hands out the next per-recipient sequence number. Numbers are never reused, even after rows are deleted.
pub async fn next_sequence(recipient: &PeerId, conn: &mut SqliteConnection) -> Result<i64, StoreError> {
    let seq = sqlx::query_scalar(
        r#"
            INSERT INTO peer_sequences (recipient, next_sequence) VALUES ($1, 1)
            ON CONFLICT (recipient) DO UPDATE SET next_sequence = next_sequence + 1
            RETURNING next_sequence
        "#,
    )
    .bind(recipient.as_str())
    .fetch_one(conn)
    .await?;
    Ok(seq)
}

pub async fn insert_outgoing(msg: &OutgoingMessage, conn: &mut SqliteConnection) -> Result<(), StoreError> {
    sqlx::query(
        r#"
            INSERT INTO outgoing_messages (
                message_id,
                recipient,
                sequence,
                order_id,
                kind,
                message_seq,
                envelope,
                attempts,
                next_attempt_at,
                last_error,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(msg.message_id.as_str())
    .bind(msg.recipient.as_str())
    .bind(msg.sequence)
    .bind(msg.order_id.as_str())
    .bind(msg.kind.as_str())
    .bind(msg.message_seq)
    .bind(&msg.envelope)
    .bind(msg.attempts)
    .bind(msg.next_attempt_at)
    .bind(&msg.last_error)
    .bind(msg.created_at)
    .execute(conn)
    .await?;
    trace!("🗃️ Outgoing {} #{} to {} queued as {}", msg.kind, msg.sequence, msg.recipient.short(), msg.message_id);
    Ok(())
}

/// Rows whose next attempt is due at or before `now`, lowest sequence first.
pub async fn fetch_due(
    now: DateTime<Utc>,
    limit: i64,
    conn: &mut SqliteConnection,
) -> Result<Vec<OutgoingMessage>, StoreError> {
    let rows: Vec<OutgoingRow> = sqlx::query_as(
        "SELECT * FROM outgoing_messages WHERE next_attempt_at <= $1 ORDER BY recipient, sequence LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.into_iter().map(OutgoingMessage::try_from).collect()
}

pub async fn next_due_at(conn: &mut SqliteConnection) -> Result<Option<DateTime<Utc>>, StoreError> {
    let next = sqlx::query_scalar("SELECT MIN(next_attempt_at) FROM outgoing_messages").fetch_one(conn).await?;
    Ok(next)
}

pub async fn fetch_outgoing_for_order(
    order_id: &OrderId,
    conn: &mut SqliteConnection,
) -> Result<Vec<OutgoingMessage>, StoreError> {
    let rows: Vec<OutgoingRow> = sqlx::query_as("SELECT * FROM outgoing_messages WHERE order_id = $1 ORDER BY sequence")
        .bind(order_id.as_str())
        .fetch_all(conn)
        .await?;
    rows.into_iter().map(OutgoingMessage::try_from).collect()
}

pub async fn record_attempt(
    message_id: &MessageId,
    next_attempt_at: DateTime<Utc>,
    error: Option<&str>,
    conn: &mut SqliteConnection,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE outgoing_messages SET attempts = attempts + 1, next_attempt_at = $1, last_error = $2 WHERE message_id \
         = $3",
    )
    .bind(next_attempt_at)
    .bind(error)
    .bind(message_id.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

/// Removes an acknowledged row, returning it if it existed.
pub async fn delete_outgoing(
    message_id: &MessageId,
    conn: &mut SqliteConnection,
) -> Result<Option<OutgoingMessage>, StoreError> {
    let row: Option<OutgoingRow> = sqlx::query_as("DELETE FROM outgoing_messages WHERE message_id = $1 RETURNING *")
        .bind(message_id.as_str())
        .fetch_optional(conn)
        .await?;
    row.map(OutgoingMessage::try_from).transpose()
}

/// How many recipients have yet to acknowledge a given stored order message.
pub async fn count_pending_for_message(
    order_id: &OrderId,
    kind: MessageKind,
    message_seq: i64,
    conn: &mut SqliteConnection,
) -> Result<i64, StoreError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM outgoing_messages WHERE order_id = $1 AND kind = $2 AND message_seq = $3",
    )
    .bind(order_id.as_str())
    .bind(kind.as_str())
    .bind(message_seq)
    .fetch_one(conn)
    .await?;
    Ok(count)
}

/// Remembers an inbound message id. Returns `false` if it had been seen before.
pub async fn record_received(
    message_id: &MessageId,
    sender: &PeerId,
    conn: &mut SqliteConnection,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "INSERT INTO received_messages (message_id, sender, received_at) VALUES ($1, $2, $3) ON CONFLICT (message_id) \
         DO NOTHING",
    )
    .bind(message_id.as_str())
    .bind(sender.as_str())
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn has_received(message_id: &MessageId, conn: &mut SqliteConnection) -> Result<bool, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM received_messages WHERE message_id = $1")
        .bind(message_id.as_str())
        .fetch_one(conn)
        .await?;
    Ok(count > 0)
}
