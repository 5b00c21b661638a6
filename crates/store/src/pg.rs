use crate::{
    ConnectionStatus, CustomTools, DisabledTools, Endpoint, EndpointBackup, EndpointPatch,
    EndpointStore, StoreError, ToolOverlay,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;

/// Forward-only schema setup. Older rows never see a destructive change;
/// new columns arrive with defaults so existing readers keep working.
pub(crate) async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
create table if not exists mcp_endpoints (
    id bigserial primary key,
    name text not null unique,
    url text not null,
    enabled boolean not null default true,
    created_at timestamptz not null default now(),
    updated_at timestamptz not null default now()
)
",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "alter table mcp_endpoints add column if not exists connection_status text not null default 'disconnected'",
    )
    .execute(pool)
    .await?;
    sqlx::query("alter table mcp_endpoints add column if not exists last_connected_at timestamptz")
        .execute(pool)
        .await?;
    sqlx::query("alter table mcp_endpoints add column if not exists last_error text")
        .execute(pool)
        .await?;

    sqlx::query(
        r"
create table if not exists mcp_tool_settings (
    provider_name text not null,
    tool_name text not null,
    enabled boolean not null default true,
    custom_name text,
    custom_description text,
    updated_at timestamptz not null default now(),
    primary key (provider_name, tool_name)
)
",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct PgEndpointStore {
    pool: PgPool,
}

impl PgEndpointStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn endpoint_from_row(row: &PgRow) -> Result<Endpoint, sqlx::Error> {
    let status: String = row.try_get("connection_status")?;
    Ok(Endpoint {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        enabled: row.try_get("enabled")?,
        // Tolerate values written by a newer schema.
        connection_status: ConnectionStatus::parse(&status)
            .unwrap_or(ConnectionStatus::Disconnected),
        last_connected_at: row.try_get("last_connected_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SELECT_ENDPOINT: &str = r"
select id, name, url, enabled, connection_status, last_connected_at, last_error,
       created_at, updated_at
from mcp_endpoints
";

#[async_trait]
impl EndpointStore for PgEndpointStore {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_ENDPOINT} order by id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| endpoint_from_row(r).map_err(StoreError::from))
            .collect()
    }

    async fn list_enabled_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_ENDPOINT} where enabled order by id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| endpoint_from_row(r).map_err(StoreError::from))
            .collect()
    }

    async fn get_endpoint(&self, id: i64) -> Result<Option<Endpoint>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_ENDPOINT} where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(endpoint_from_row).transpose().map_err(StoreError::from)
    }

    async fn get_endpoint_by_name(&self, name: &str) -> Result<Option<Endpoint>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_ENDPOINT} where name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(endpoint_from_row).transpose().map_err(StoreError::from)
    }

    async fn upsert_endpoint(
        &self,
        name: &str,
        url: &str,
        enabled: bool,
    ) -> Result<(Endpoint, bool), StoreError> {
        let row = sqlx::query(
            r"
insert into mcp_endpoints (name, url, enabled)
values ($1, $2, $3)
on conflict (name) do update
set url = excluded.url, enabled = excluded.enabled, updated_at = now()
returning id, name, url, enabled, connection_status, last_connected_at, last_error,
          created_at, updated_at, (xmax = 0) as inserted
",
        )
        .bind(name)
        .bind(url)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await?;

        let created: bool = row.try_get("inserted")?;
        Ok((endpoint_from_row(&row)?, created))
    }

    async fn update_endpoint(
        &self,
        id: i64,
        patch: EndpointPatch,
    ) -> Result<Option<Endpoint>, StoreError> {
        let row = sqlx::query(
            r"
update mcp_endpoints
set name = coalesce($2, name),
    url = coalesce($3, url),
    enabled = coalesce($4, enabled),
    updated_at = now()
where id = $1
returning id, name, url, enabled, connection_status, last_connected_at, last_error,
          created_at, updated_at
",
        )
        .bind(id)
        .bind(patch.name)
        .bind(patch.url)
        .bind(patch.enabled)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(endpoint_from_row).transpose().map_err(StoreError::from)
    }

    async fn update_status(
        &self,
        id: i64,
        status: ConnectionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        if status == ConnectionStatus::Connected {
            sqlx::query(
                r"
update mcp_endpoints
set connection_status = $2, last_connected_at = now(), last_error = null,
    updated_at = now()
where id = $1
",
            )
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r"
update mcp_endpoints
set connection_status = $2, last_error = coalesce($3, last_error),
    updated_at = now()
where id = $1
",
            )
            .bind(id)
            .bind(status.as_str())
            .bind(error)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn delete_endpoint(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("delete from mcp_endpoints where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_endpoints(&self, endpoints: &[EndpointBackup]) -> Result<usize, StoreError> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        sqlx::query("delete from mcp_endpoints").execute(&mut *tx).await?;

        for ep in endpoints {
            let created_at: DateTime<Utc> = ep.created_at.unwrap_or_else(Utc::now);
            sqlx::query(
                r"
insert into mcp_endpoints (name, url, enabled, created_at, updated_at)
values ($1, $2, $3, $4, now())
",
            )
            .bind(&ep.name)
            .bind(&ep.url)
            .bind(ep.enabled)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(endpoints.len())
    }

    async fn get_disabled_tools(&self) -> Result<DisabledTools, StoreError> {
        let rows = sqlx::query(
            "select provider_name, tool_name from mcp_tool_settings where not enabled order by provider_name, tool_name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out: DisabledTools = HashMap::new();
        for row in rows {
            let provider: String = row.try_get("provider_name")?;
            let tool: String = row.try_get("tool_name")?;
            out.entry(provider).or_default().push(tool);
        }
        Ok(out)
    }

    async fn get_custom_tools(&self) -> Result<CustomTools, StoreError> {
        let rows = sqlx::query(
            r"
select provider_name, tool_name, custom_name, custom_description
from mcp_tool_settings
where custom_name is not null or custom_description is not null
",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out: CustomTools = HashMap::new();
        for row in rows {
            let provider: String = row.try_get("provider_name")?;
            let tool: String = row.try_get("tool_name")?;
            let overlay = ToolOverlay {
                name: row.try_get("custom_name")?,
                description: row.try_get("custom_description")?,
            };
            out.entry(provider).or_default().insert(tool, overlay);
        }
        Ok(out)
    }

    async fn set_tool_enabled(
        &self,
        provider: &str,
        tool: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
insert into mcp_tool_settings (provider_name, tool_name, enabled)
values ($1, $2, $3)
on conflict (provider_name, tool_name) do update
set enabled = excluded.enabled, updated_at = now()
",
        )
        .bind(provider)
        .bind(tool)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_tool_metadata(
        &self,
        provider: &str,
        tool: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
insert into mcp_tool_settings (provider_name, tool_name, custom_name, custom_description)
values ($1, $2, $3, $4)
on conflict (provider_name, tool_name) do update
set custom_name = coalesce(excluded.custom_name, mcp_tool_settings.custom_name),
    custom_description = coalesce(excluded.custom_description, mcp_tool_settings.custom_description),
    updated_at = now()
",
        )
        .bind(provider)
        .bind(tool)
        .bind(name)
        .bind(description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_tool_metadata(&self, provider: &str, tool: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
update mcp_tool_settings
set custom_name = null, custom_description = null, updated_at = now()
where provider_name = $1 and tool_name = $2
",
        )
        .bind(provider)
        .bind(tool)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_tools_for_provider(&self, provider: &str) -> Result<(), StoreError> {
        sqlx::query("delete from mcp_tool_settings where provider_name = $1")
            .bind(provider)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_tool_settings(
        &self,
        disabled: &DisabledTools,
        custom: &CustomTools,
    ) -> Result<(), StoreError> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        sqlx::query("delete from mcp_tool_settings").execute(&mut *tx).await?;

        for (provider, tools) in disabled {
            for tool in tools {
                sqlx::query(
                    r"
insert into mcp_tool_settings (provider_name, tool_name, enabled)
values ($1, $2, false)
on conflict (provider_name, tool_name) do update set enabled = false
",
                )
                .bind(provider)
                .bind(tool)
                .execute(&mut *tx)
                .await?;
            }
        }

        for (provider, tools) in custom {
            for (tool, overlay) in tools {
                sqlx::query(
                    r"
insert into mcp_tool_settings (provider_name, tool_name, custom_name, custom_description)
values ($1, $2, $3, $4)
on conflict (provider_name, tool_name) do update
set custom_name = excluded.custom_name,
    custom_description = excluded.custom_description,
    updated_at = now()
",
                )
                .bind(provider)
                .bind(tool)
                .bind(overlay.name.as_deref())
                .bind(overlay.description.as_deref())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
