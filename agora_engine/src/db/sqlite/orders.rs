use agora_common::Amount;
use chrono::{DateTime, Utc};
use log::*;
use sqlx::{FromRow, QueryBuilder, SqliteConnection};

use crate::{
    db::{
        sqlite::{messages, transactions},
        StoreError,
    },
    db_types::{OrderId, OrderRecord, OrderState, PaymentMethod, Role},
};

/// The summary columns of an order, as written when its `ORDER_OPEN` is first committed.
#[derive(Debug, Clone)]
pub struct NewOrderRecord {
    pub order_id: OrderId,
    pub role: Role,
    pub state: OrderState,
    pub payment_method: PaymentMethod,
    pub payment_coin: String,
    pub payment_address: String,
    pub payment_amount: Amount,
}

#[derive(Debug, Clone, Default)]
pub struct OrderQueryFilter {
    pub role: Option<Role>,
    pub state: Option<OrderState>,
    pub coin: Option<String>,
}

impl OrderQueryFilter {
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_state(mut self, state: OrderState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_coin<S: Into<String>>(mut self, coin: S) -> Self {
        self.coin = Some(coin.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.role.is_none() && self.state.is_none() && self.coin.is_none()
    }
}

#[derive(FromRow)]
struct OrderRow {
    order_id: String,
    role: String,
    state: String,
    payment_method: String,
    payment_coin: String,
    payment_address: String,
    payment_amount: String,
    funded: bool,
    funding_notified: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for OrderRecord {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let conversion = |e: &dyn std::fmt::Display| StoreError::DataConversion(e.to_string());
        Ok(OrderRecord {
            order_id: OrderId::new(row.order_id),
            role: row.role.parse::<Role>().map_err(|e| conversion(&e))?,
            state: row.state.parse::<OrderState>().map_err(|e| conversion(&e))?,
            payment_method: row.payment_method.parse::<PaymentMethod>().map_err(|e| conversion(&e))?,
            payment_coin: row.payment_coin,
            payment_address: row.payment_address,
            payment_amount: row.payment_amount.parse::<Amount>().map_err(|e| conversion(&e))?,
            funded: row.funded,
            funding_notified: row.funding_notified,
            messages: Vec::new(),
            transactions: Vec::new(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub async fn insert_order(order: &NewOrderRecord, conn: &mut SqliteConnection) -> Result<(), StoreError> {
    let now = Utc::now();
    sqlx::query(
        r#"
            INSERT INTO orders (
                order_id,
                role,
                state,
                payment_method,
                payment_coin,
                payment_address,
                payment_amount,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
        "#,
    )
    .bind(order.order_id.as_str())
    .bind(order.role.to_string())
    .bind(order.state.to_string())
    .bind(order.payment_method.to_string())
    .bind(&order.payment_coin)
    .bind(&order.payment_address)
    .bind(order.payment_amount.to_string())
    .bind(now)
    .execute(conn)
    .await?;
    debug!("🗃️ Order [{}] inserted as {}", order.order_id, order.role);
    Ok(())
}

async fn fetch_order_row(order_id: &OrderId, conn: &mut SqliteConnection) -> Result<Option<OrderRecord>, StoreError> {
    let row: Option<OrderRow> = sqlx::query_as("SELECT * FROM orders WHERE order_id = $1")
        .bind(order_id.as_str())
        .fetch_optional(conn)
        .await?;
    row.map(OrderRecord::try_from).transpose()
}

/// Loads the full order aggregate: summary columns, every stored message and every recorded transaction.
pub async fn fetch_order(order_id: &OrderId, conn: &mut SqliteConnection) -> Result<Option<OrderRecord>, StoreError> {
    let Some(mut order) = fetch_order_row(order_id, conn).await? else {
        return Ok(None);
    };
    order.messages = messages::fetch_messages(order_id, conn).await?;
    order.transactions = transactions::fetch_transactions(order_id, conn).await?;
    Ok(Some(order))
}

pub async fn order_exists(order_id: &OrderId, conn: &mut SqliteConnection) -> Result<bool, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE order_id = $1")
        .bind(order_id.as_str())
        .fetch_one(conn)
        .await?;
    Ok(count > 0)
}

/// Orders whose payment (or escrow) address is one of `addresses`.
pub async fn order_ids_for_addresses(
    addresses: &[String],
    conn: &mut SqliteConnection,
) -> Result<Vec<OrderId>, StoreError> {
    if addresses.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder = QueryBuilder::new("SELECT order_id FROM orders WHERE payment_address IN (");
    let mut list = builder.separated(", ");
    for address in addresses {
        list.push_bind(address.clone());
    }
    list.push_unseparated(") ORDER BY created_at");
    let ids: Vec<(String,)> = builder.build_query_as().fetch_all(conn).await?;
    Ok(ids.into_iter().map(|(id,)| OrderId::new(id)).collect())
}

/// Fetches order summaries (without messages or transactions) matching `query`, oldest first.
pub async fn search_orders(
    query: OrderQueryFilter,
    conn: &mut SqliteConnection,
) -> Result<Vec<OrderRecord>, StoreError> {
    let mut builder = QueryBuilder::new("SELECT * FROM orders ");
    if !query.is_empty() {
        builder.push("WHERE ");
    }
    let mut where_clause = builder.separated(" AND ");
    if let Some(role) = query.role {
        where_clause.push("role = ");
        where_clause.push_bind_unseparated(role.to_string());
    }
    if let Some(state) = query.state {
        where_clause.push("state = ");
        where_clause.push_bind_unseparated(state.to_string());
    }
    if let Some(coin) = query.coin {
        where_clause.push("payment_coin = ");
        where_clause.push_bind_unseparated(coin);
    }
    builder.push(" ORDER BY created_at ASC");
    trace!("🗃️ Executing query: {}", builder.sql());
    let rows: Vec<OrderRow> = builder.build_query_as().fetch_all(conn).await?;
    rows.into_iter().map(OrderRecord::try_from).collect()
}

pub async fn update_summary(
    order_id: &OrderId,
    state: OrderState,
    funded: bool,
    funding_notified: bool,
    conn: &mut SqliteConnection,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE orders SET state = $1, funded = $2, funding_notified = $3, updated_at = $4 WHERE order_id = $5",
    )
    .bind(state.to_string())
    .bind(funded)
    .bind(funding_notified)
    .bind(Utc::now())
    .bind(order_id.as_str())
    .execute(conn)
    .await?;
    if result.rows_affected() == 0 {
        warn!("🗃️ Tried to update the summary of order {order_id}, but it does not exist");
    }
    Ok(())
}
