// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use alloy_primitives::Address;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgConnection, PgPool};
use tracing::debug;

pub const RECEIPT_NOTIFICATION_CHANNEL: &str = "scalar_tap_receipt_notification";
pub const DENY_NOTIFICATION_CHANNEL: &str = "scalar_tap_deny_notification";
pub const COST_MODELS_NOTIFICATION_CHANNEL: &str = "cost_models_update_notification";

/// Upper bound on attempts for transactions that can hit serialization
/// conflicts under `REPEATABLE READ`.
pub const MAX_TRANSACTION_ATTEMPTS: u32 = 20;

/// Connects a pool and applies the embedded migrations.
pub async fn connect(postgres_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(30)
        .connect(postgres_url)
        .await?;
    sqlx::migrate!("../migrations").run(&pool).await?;
    install_notification_schema(&pool).await?;
    Ok(pool)
}

/// Change notification fired on every `scalar_tap_receipts` insert or update.
#[derive(Debug, Clone, Deserialize)]
pub struct TapReceiptNotification {
    pub id: u64,
    pub allocation_id: Address,
    pub sender_address: Address,
    pub timestamp_ns: u64,
    pub value: u128,
}

/// Change notification fired on `scalar_tap_denylist` mutations. An update
/// (which the denylist never expects) carries no sender.
#[derive(Debug, Clone, Deserialize)]
pub struct DenylistNotification {
    pub tg_op: String,
    pub sender_address: Option<Address>,
}

/// Change notification fired on `"CostModelsHistory"` mutations.
#[derive(Debug, Clone, Deserialize)]
pub struct CostModelNotification {
    pub tg_op: String,
    pub deployment: String,
}

/// Opens a dedicated connection listening on `channel`.
pub async fn notification_listener(pool: &PgPool, channel: &str) -> sqlx::Result<PgListener> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(channel).await?;
    Ok(listener)
}

/// `EXISTS` returns a single boolean; the caller creates the trigger only
/// when it is false.
pub async fn trigger_exists(pool: &PgPool, name: &str) -> sqlx::Result<bool> {
    sqlx::query_scalar("SELECT EXISTS (SELECT FROM pg_trigger WHERE tgname = $1)")
        .bind(name)
        .fetch_one(pool)
        .await
}

pub async fn index_exists(pool: &PgPool, name: &str) -> sqlx::Result<bool> {
    sqlx::query_scalar("SELECT EXISTS (SELECT FROM pg_indexes WHERE indexname = $1)")
        .bind(name)
        .fetch_one(pool)
        .await
}

/// Installs the change-notification functions, triggers, lookup indexes, the
/// latest-cost-model view, and rebases the cost-model id sequence. Safe to
/// run on every startup.
pub async fn install_notification_schema(pool: &PgPool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION scalar_tap_receipt_notify()
        RETURNS trigger AS
        $$
        BEGIN
            PERFORM pg_notify('scalar_tap_receipt_notification', format(
                '{"id": %s, "allocation_id": "%s", "sender_address": "%s", "timestamp_ns": %s, "value": %s}',
                NEW.id, NEW.allocation_id, NEW.sender_address, NEW.timestamp_ns, NEW.value));
            RETURN NEW;
        END;
        $$ LANGUAGE 'plpgsql'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION scalar_tap_deny_notify()
        RETURNS trigger AS
        $$
        BEGIN
            IF TG_OP = 'INSERT' THEN
                PERFORM pg_notify('scalar_tap_deny_notification', format(
                    '{"tg_op": "INSERT", "sender_address": "%s"}', NEW.sender_address));
                RETURN NEW;
            ELSIF TG_OP = 'DELETE' THEN
                PERFORM pg_notify('scalar_tap_deny_notification', format(
                    '{"tg_op": "DELETE", "sender_address": "%s"}', OLD.sender_address));
                RETURN OLD;
            ELSE
                PERFORM pg_notify('scalar_tap_deny_notification', format(
                    '{"tg_op": "%s", "sender_address": null}', TG_OP));
                RETURN NEW;
            END IF;
        END;
        $$ LANGUAGE 'plpgsql'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION cost_models_update_notify()
        RETURNS trigger AS
        $$
        BEGIN
            IF TG_OP = 'DELETE' THEN
                PERFORM pg_notify('cost_models_update_notification', format(
                    '{"tg_op": "DELETE", "deployment": "%s"}', OLD.deployment));
                RETURN OLD;
            ELSE
                PERFORM pg_notify('cost_models_update_notification', format(
                    '{"tg_op": "%s", "deployment": "%s"}', TG_OP, NEW.deployment));
                RETURN NEW;
            END IF;
        END;
        $$ LANGUAGE 'plpgsql'
        "#,
    )
    .execute(pool)
    .await?;

    for (trigger, ddl) in [
        (
            "receipt_update",
            r#"CREATE TRIGGER receipt_update AFTER INSERT OR UPDATE ON scalar_tap_receipts
               FOR EACH ROW EXECUTE PROCEDURE scalar_tap_receipt_notify()"#,
        ),
        (
            "deny_update",
            r#"CREATE TRIGGER deny_update AFTER INSERT OR UPDATE OR DELETE ON scalar_tap_denylist
               FOR EACH ROW EXECUTE PROCEDURE scalar_tap_deny_notify()"#,
        ),
        (
            "cost_models_update",
            r#"CREATE TRIGGER cost_models_update AFTER INSERT OR UPDATE OR DELETE ON "CostModelsHistory"
               FOR EACH ROW EXECUTE PROCEDURE cost_models_update_notify()"#,
        ),
    ] {
        if !trigger_exists(pool, trigger).await? {
            debug!(trigger, "Creating notification trigger");
            sqlx::query(ddl).execute(pool).await?;
        }
    }

    for (index, ddl) in [
        (
            "scalar_tap_receipts_allocation_id_idx",
            "CREATE INDEX scalar_tap_receipts_allocation_id_idx ON scalar_tap_receipts (allocation_id)",
        ),
        (
            "scalar_tap_receipts_timestamp_ns_idx",
            "CREATE INDEX scalar_tap_receipts_timestamp_ns_idx ON scalar_tap_receipts (timestamp_ns)",
        ),
    ] {
        if !index_exists(pool, index).await? {
            debug!(index, "Creating lookup index");
            sqlx::query(ddl).execute(pool).await?;
        }
    }

    sqlx::query(
        r#"
        CREATE OR REPLACE VIEW "CostModels" AS
        SELECT id, deployment, model, variables, created_at, updated_at
        FROM "CostModelsHistory"
        WHERE id IN (SELECT MAX(id) FROM "CostModelsHistory" GROUP BY deployment)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        SELECT setval(
            pg_get_serial_sequence('"CostModelsHistory"', 'id'),
            COALESCE(MAX(id), 1)
        ) FROM "CostModelsHistory"
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(())
}

/// Adds a sender to the denylist; the insert fires the deny notification.
pub async fn deny_sender(pool: &PgPool, sender: Address) -> sqlx::Result<()> {
    sqlx::query("INSERT INTO scalar_tap_denylist (sender_address) VALUES ($1)")
        .bind(alloy_primitives::hex::encode(sender))
        .execute(pool)
        .await?;
    Ok(())
}

/// Removes a sender from the denylist; the delete fires the deny notification.
pub async fn allow_sender(pool: &PgPool, sender: Address) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM scalar_tap_denylist WHERE sender_address = $1")
        .bind(alloy_primitives::hex::encode(sender))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn denied_senders(pool: &PgPool) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar("SELECT sender_address FROM scalar_tap_denylist ORDER BY id")
        .fetch_all(pool)
        .await
}

fn is_serialization_conflict(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("40001")
    )
}

/// Runs `op` inside a `REPEATABLE READ` transaction, retrying serialization
/// conflicts up to [`MAX_TRANSACTION_ATTEMPTS`] times. Any other error aborts
/// the transaction and surfaces unchanged.
pub async fn serializable_retry<T, F>(pool: &PgPool, mut op: F) -> sqlx::Result<T>
where
    F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, sqlx::Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;
        match op(&mut *tx).await {
            Ok(value) => match tx.commit().await {
                Ok(()) => return Ok(value),
                Err(e) if is_serialization_conflict(&e) && attempts < MAX_TRANSACTION_ATTEMPTS => {
                    debug!(attempts, "Serialization conflict at commit; retrying");
                }
                Err(e) => return Err(e),
            },
            Err(e) if is_serialization_conflict(&e) && attempts < MAX_TRANSACTION_ATTEMPTS => {
                let _ = tx.rollback().await;
                debug!(attempts, "Serialization conflict; retrying");
            }
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }
    }
}
