//! Row helpers shared by the repositories.

use cascade_core::parameter::{Parameter, ParameterType};
use cascade_core::prerequisite::Prerequisite;
use cascade_core::Result;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::error::db_err;

pub(crate) fn param_type_to_str(t: ParameterType) -> &'static str {
    match t {
        ParameterType::String => "string",
        ParameterType::Text => "text",
        ParameterType::Boolean => "boolean",
        ParameterType::Number => "number",
        ParameterType::List => "list",
        ParameterType::Secret => "secret",
    }
}

pub(crate) fn str_to_param_type(s: &str) -> ParameterType {
    match s {
        "text" => ParameterType::Text,
        "boolean" => ParameterType::Boolean,
        "number" => ParameterType::Number,
        "list" => ParameterType::List,
        "secret" => ParameterType::Secret,
        _ => ParameterType::String,
    }
}

pub(crate) fn row_to_parameter(r: &PgRow) -> Parameter {
    let type_str: String = r.get("type");
    Parameter {
        name: r.get("name"),
        param_type: str_to_param_type(&type_str),
        value: r.get("value"),
        description: r.get("description"),
    }
}

/// Tables holding (owner, parameter, expected_value) prerequisite rows.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PrerequisiteTable {
    Stage,
    Trigger,
}

impl PrerequisiteTable {
    fn table(&self) -> &'static str {
        match self {
            PrerequisiteTable::Stage => "pipeline_stage_prerequisite",
            PrerequisiteTable::Trigger => "pipeline_trigger_prerequisite",
        }
    }

    fn owner_column(&self) -> &'static str {
        match self {
            PrerequisiteTable::Stage => "pipeline_stage_id",
            PrerequisiteTable::Trigger => "pipeline_trigger_id",
        }
    }
}

pub(crate) async fn insert_prerequisites(
    conn: &mut PgConnection,
    table: PrerequisiteTable,
    owner: &Uuid,
    prerequisites: &[Prerequisite],
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} ({}, parameter, expected_value) VALUES ($1, $2, $3)",
        table.table(),
        table.owner_column()
    );
    for p in prerequisites {
        sqlx::query(&sql)
            .bind(owner)
            .bind(&p.parameter)
            .bind(&p.expected_value)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
    }
    Ok(())
}

pub(crate) async fn load_prerequisites(
    conn: &mut PgConnection,
    table: PrerequisiteTable,
    owner: &Uuid,
) -> Result<Vec<Prerequisite>> {
    let sql = format!(
        "SELECT parameter, expected_value FROM {} WHERE {} = $1 ORDER BY id",
        table.table(),
        table.owner_column()
    );
    let rows = sqlx::query(&sql)
        .bind(owner)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

    Ok(rows
        .iter()
        .map(|r| Prerequisite::new(r.get::<String, _>("parameter"), r.get::<String, _>("expected_value")))
        .collect())
}

pub(crate) async fn delete_prerequisites(
    conn: &mut PgConnection,
    table: PrerequisiteTable,
    owner: &Uuid,
) -> Result<()> {
    let sql = format!(
        "DELETE FROM {} WHERE {} = $1",
        table.table(),
        table.owner_column()
    );
    sqlx::query(&sql)
        .bind(owner)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}
