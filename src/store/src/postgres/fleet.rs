//! Agent and command persistence for the Postgres backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::rows;
use super::{map_sqlx, to_json, PgStore};
use crate::store::{AgentStore, CommandStore};
use crate::types::*;

#[async_trait]
impl AgentStore for PgStore {
    async fn insert_agent(&self, agent: Agent) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO agents
               (id, name, region, provider, location, public_ip, capabilities,
                max_targets, version, tags, api_key_hash, last_heartbeat,
                archived_at, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
        )
        .bind(agent.id)
        .bind(&agent.name)
        .bind(&agent.region)
        .bind(&agent.provider)
        .bind(&agent.location)
        .bind(agent.public_ip.map(|ip| ip.to_string()))
        .bind(to_json(&agent.capabilities))
        .bind(agent.max_targets as i32)
        .bind(&agent.version)
        .bind(to_json(&agent.tags))
        .bind(&agent.api_key_hash)
        .bind(agent.last_heartbeat)
        .bind(agent.archived_at)
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_agent(&self, agent: Agent) -> StoreResult<()> {
        // last_heartbeat and api_key_hash are owned by their dedicated paths.
        let done = sqlx::query(
            r#"UPDATE agents SET
                 name = $2, region = $3, provider = $4, location = $5,
                 public_ip = $6, capabilities = $7, max_targets = $8,
                 version = $9, tags = $10, archived_at = $11, updated_at = $12
               WHERE id = $1"#,
        )
        .bind(agent.id)
        .bind(&agent.name)
        .bind(&agent.region)
        .bind(&agent.provider)
        .bind(&agent.location)
        .bind(agent.public_ip.map(|ip| ip.to_string()))
        .bind(to_json(&agent.capabilities))
        .bind(agent.max_targets as i32)
        .bind(&agent.version)
        .bind(to_json(&agent.tags))
        .bind(agent.archived_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound("agent"));
        }
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>> {
        sqlx::query("SELECT * FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(|row| rows::agent(&row))
            .transpose()
    }

    async fn get_agent_by_name(&self, name: &str) -> StoreResult<Option<Agent>> {
        sqlx::query("SELECT * FROM agents WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(|row| rows::agent(&row))
            .transpose()
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        sqlx::query("SELECT * FROM agents ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::agent)
            .collect()
    }

    async fn list_active_agents(&self) -> StoreResult<Vec<Agent>> {
        sqlx::query("SELECT * FROM agents WHERE archived_at IS NULL ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::agent)
            .collect()
    }

    async fn record_heartbeat(
        &self,
        id: AgentId,
        at: DateTime<Utc>,
        metrics: AgentMetricsRow,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let archived: Option<(bool,)> =
            sqlx::query_as("SELECT archived_at IS NOT NULL FROM agents WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        match archived {
            None => return Err(StoreError::NotFound("agent")),
            Some((true,)) => {
                tx.rollback().await.map_err(map_sqlx)?;
                return Ok(false);
            }
            Some((false,)) => {}
        }

        // Forward only; a replayed heartbeat never regresses freshness.
        sqlx::query(
            r#"UPDATE agents SET last_heartbeat = $2
               WHERE id = $1
                 AND (last_heartbeat IS NULL OR last_heartbeat < $2)"#,
        )
        .bind(id)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query(
            r#"INSERT INTO agent_metrics
               (time, agent_id, cpu_pct, memory_pct, tasks, active_targets,
                probes_per_second, results_queued, results_shipped, assignment_version)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (time, agent_id) DO NOTHING"#,
        )
        .bind(metrics.time)
        .bind(metrics.agent_id)
        .bind(metrics.cpu_pct)
        .bind(metrics.memory_pct)
        .bind(metrics.tasks as i32)
        .bind(metrics.active_targets as i32)
        .bind(metrics.probes_per_second)
        .bind(metrics.results_queued as i64)
        .bind(metrics.results_shipped as i64)
        .bind(metrics.assignment_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(true)
    }

    async fn set_agent_archived(
        &self,
        id: AgentId,
        archived_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let done = sqlx::query("UPDATE agents SET archived_at = $2 WHERE id = $1")
            .bind(id)
            .bind(archived_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound("agent"));
        }
        Ok(())
    }

    async fn set_agent_api_key_hash(&self, id: AgentId, hash: Option<String>) -> StoreResult<()> {
        let done = sqlx::query("UPDATE agents SET api_key_hash = $2 WHERE id = $1")
            .bind(id)
            .bind(hash)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound("agent"));
        }
        Ok(())
    }

    async fn list_agent_metrics(
        &self,
        id: AgentId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<AgentMetricsRow>> {
        sqlx::query("SELECT * FROM agent_metrics WHERE agent_id = $1 AND time >= $2 ORDER BY time")
            .bind(id)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::agent_metrics)
            .collect()
    }
}

#[async_trait]
impl CommandStore for PgStore {
    async fn create_command(&self, command: Command) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO commands
               (id, command, payload, agent_ids, quorum, created_at, expires_at, completed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(command.id)
        .bind(&command.command)
        .bind(&command.payload)
        .bind(to_json(&command.agent_ids))
        .bind(command.quorum as i32)
        .bind(command.created_at)
        .bind(command.expires_at)
        .bind(command.completed_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_command(&self, id: CommandId) -> StoreResult<Option<Command>> {
        sqlx::query("SELECT * FROM commands WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(|row| rows::command(&row))
            .transpose()
    }

    async fn pending_commands_for_agent(
        &self,
        agent_id: AgentId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Command>> {
        sqlx::query(
            r#"SELECT c.* FROM commands c
               WHERE c.completed_at IS NULL
                 AND c.expires_at > $2
                 AND (c.agent_ids = '[]'::jsonb OR c.agent_ids @> to_jsonb($1::uuid))
                 AND NOT EXISTS (
                     SELECT 1 FROM command_results r
                     WHERE r.command_id = c.id AND r.agent_id = $1)
               ORDER BY c.created_at"#,
        )
        .bind(agent_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::command)
        .collect()
    }

    async fn submit_command_result(&self, result: CommandResult) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let exists: Option<(i32,)> = sqlx::query_as("SELECT quorum FROM commands WHERE id = $1")
            .bind(result.command_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let quorum = exists.ok_or(StoreError::NotFound("command"))?.0;

        let inserted = sqlx::query(
            r#"INSERT INTO command_results (command_id, agent_id, success, output, submitted_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (command_id, agent_id) DO NOTHING"#,
        )
        .bind(result.command_id)
        .bind(result.agent_id)
        .bind(result.success)
        .bind(&result.output)
        .bind(result.submitted_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if inserted.rows_affected() > 0 {
            sqlx::query(
                r#"UPDATE commands SET completed_at = $2
                   WHERE id = $1 AND completed_at IS NULL
                     AND (SELECT count(*) FROM command_results
                          WHERE command_id = $1 AND success) >= $3"#,
            )
            .bind(result.command_id)
            .bind(result.submitted_at)
            .bind(quorum)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }
}
