use chrono::{DateTime, Utc};
use log::*;
use sqlx::{FromRow, SqliteConnection};

use crate::{
    db::StoreError,
    db_types::{OrderId, OrderTransaction, WalletTransaction},
};

#[derive(FromRow)]
struct TransactionRow {
    txid: String,
    height: i64,
    transaction_json: String,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for OrderTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let transaction = serde_json::from_str::<WalletTransaction>(&row.transaction_json)?;
        let height = u64::try_from(row.height).map_err(|e| StoreError::DataConversion(e.to_string()))?;
        Ok(OrderTransaction { txid: row.txid, height, transaction, recorded_at: row.recorded_at })
    }
}

/// Records a transaction against an order. Returns `false` if the transaction id was already recorded, in which case
/// nothing changes.
pub async fn insert_transaction(
    order_id: &OrderId,
    tx: &WalletTransaction,
    conn: &mut SqliteConnection,
) -> Result<bool, StoreError> {
    let json = serde_json::to_string(tx)?;
    let height = i64::try_from(tx.height).map_err(|e| StoreError::DataConversion(e.to_string()))?;
    let result = sqlx::query(
        r#"
            INSERT INTO order_transactions (order_id, txid, height, transaction_json, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (order_id, txid) DO NOTHING
        "#,
    )
    .bind(order_id.as_str())
    .bind(&tx.id)
    .bind(height)
    .bind(json)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    let inserted = result.rows_affected() > 0;
    if inserted {
        debug!("🗃️ Transaction {} recorded against order {order_id}", tx.id);
    }
    Ok(inserted)
}

/// Updates the confirmation height of a recorded transaction.
pub async fn update_height(
    order_id: &OrderId,
    txid: &str,
    height: u64,
    conn: &mut SqliteConnection,
) -> Result<(), StoreError> {
    let height = i64::try_from(height).map_err(|e| StoreError::DataConversion(e.to_string()))?;
    sqlx::query("UPDATE order_transactions SET height = $1 WHERE order_id = $2 AND txid = $3")
        .bind(height)
        .bind(order_id.as_str())
        .bind(txid)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn fetch_transactions(
    order_id: &OrderId,
    conn: &mut SqliteConnection,
) -> Result<Vec<OrderTransaction>, StoreError> {
    let rows: Vec<TransactionRow> = sqlx::query_as(
        "SELECT txid, height, transaction_json, recorded_at FROM order_transactions WHERE order_id = $1 ORDER BY \
         recorded_at, txid",
    )
    .bind(order_id.as_str())
    .fetch_all(conn)
    .await?;
    rows.into_iter().map(OrderTransaction::try_from).collect()
}
