// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};

/// The latest cost model for one deployment, as surfaced by the
/// `"CostModels"` view. History rows are append-only; the view keeps the
/// newest row per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostModel {
    pub deployment: String,
    pub model: Option<String>,
    pub variables: Option<Value>,
}

fn model_from_row(row: sqlx::postgres::PgRow) -> sqlx::Result<CostModel> {
    Ok(CostModel {
        deployment: row.try_get("deployment")?,
        model: row.try_get("model")?,
        variables: row.try_get("variables")?,
    })
}

/// Latest cost models for the given deployments; all of them when the filter
/// is empty.
pub async fn cost_models(pool: &PgPool, deployments: &[String]) -> sqlx::Result<Vec<CostModel>> {
    let rows = if deployments.is_empty() {
        sqlx::query(r#"SELECT deployment, model, variables FROM "CostModels" ORDER BY deployment"#)
            .fetch_all(pool)
            .await?
    } else {
        sqlx::query(
            r#"
            SELECT deployment, model, variables FROM "CostModels"
            WHERE deployment = ANY($1)
            ORDER BY deployment
            "#,
        )
        .bind(deployments)
        .fetch_all(pool)
        .await?
    };
    rows.into_iter().map(model_from_row).collect()
}

pub async fn cost_model(pool: &PgPool, deployment: &str) -> sqlx::Result<Option<CostModel>> {
    sqlx::query(r#"SELECT deployment, model, variables FROM "CostModels" WHERE deployment = $1"#)
        .bind(deployment)
        .fetch_optional(pool)
        .await?
        .map(model_from_row)
        .transpose()
}

/// Appends a new history row for the deployment. The mutation fires the
/// cost-model change notification, and the view picks the row up as the
/// deployment's current model.
pub async fn set_cost_model(pool: &PgPool, model: &CostModel) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO "CostModelsHistory" (deployment, model, variables, created_at, updated_at)
        VALUES ($1, $2, $3, now(), now())
        "#,
    )
    .bind(&model.deployment)
    .bind(&model.model)
    .bind(&model.variables)
    .execute(pool)
    .await?;
    Ok(())
}
