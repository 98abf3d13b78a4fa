//! Assignment persistence: per-target transactional swap units, the global
//! version counter and the change journal backing delta fetches.

use async_trait::async_trait;
use std::collections::HashMap;

use super::rows;
use super::{enum_str, map_sqlx, PgStore};
use crate::store::AssignmentStore;
use crate::types::*;

/// Journal rows retained before delta fetches degrade to full sets
const JOURNAL_RETENTION: i64 = 50_000;

#[async_trait]
impl AssignmentStore for PgStore {
    async fn list_assignments(&self) -> StoreResult<Vec<Assignment>> {
        sqlx::query("SELECT * FROM target_assignments")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::assignment)
            .collect()
    }

    async fn list_assignments_for_agent(&self, agent_id: AgentId) -> StoreResult<Vec<Assignment>> {
        sqlx::query("SELECT * FROM target_assignments WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::assignment)
            .collect()
    }

    async fn agents_assigned_to_target(&self, target_id: TargetId) -> StoreResult<Vec<AgentId>> {
        let rows: Vec<(AgentId,)> =
            sqlx::query_as("SELECT agent_id FROM target_assignments WHERE target_id = $1")
                .bind(target_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn apply_assignment_diff(&self, diff: AssignmentDiff) -> StoreResult<u64> {
        if diff.is_empty() {
            return Err(StoreError::InvalidInput(
                "assignment diff is empty".to_string(),
            ));
        }

        // Journal rows carry the version the counter will take once every
        // unit has committed; the counter itself only moves at the end, so a
        // consumer observing version v sees all mutations <= v.
        let (current,): (i64,) =
            sqlx::query_as("SELECT version FROM assignment_version WHERE id = 1")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?;
        let version = current + 1;

        // Group the diff per target; each target is its own transactional
        // unit so a mid-run failure leaves whole targets consistent.
        let mut per_target: HashMap<TargetId, (Vec<Assignment>, Vec<AgentId>)> = HashMap::new();
        for assignment in diff.added {
            per_target
                .entry(assignment.target_id)
                .or_default()
                .0
                .push(assignment);
        }
        for (target_id, agent_id) in diff.removed {
            per_target.entry(target_id).or_default().1.push(agent_id);
        }

        for (target_id, (adds, removes)) in per_target {
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
            for agent_id in removes {
                sqlx::query(
                    "DELETE FROM target_assignments WHERE target_id = $1 AND agent_id = $2",
                )
                .bind(target_id)
                .bind(agent_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
                sqlx::query(
                    r#"INSERT INTO assignment_changes (version, target_id, agent_id, op)
                       VALUES ($1, $2, $3, $4)"#,
                )
                .bind(version)
                .bind(target_id)
                .bind(agent_id)
                .bind(enum_str(&AssignmentOp::Remove))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            }
            for assignment in adds {
                sqlx::query(
                    r#"INSERT INTO target_assignments (target_id, agent_id, tier)
                       VALUES ($1, $2, $3)
                       ON CONFLICT (target_id, agent_id) DO UPDATE SET tier = EXCLUDED.tier"#,
                )
                .bind(assignment.target_id)
                .bind(assignment.agent_id)
                .bind(&assignment.tier)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
                sqlx::query(
                    r#"INSERT INTO assignment_changes (version, target_id, agent_id, op)
                       VALUES ($1, $2, $3, $4)"#,
                )
                .bind(version)
                .bind(assignment.target_id)
                .bind(assignment.agent_id)
                .bind(enum_str(&AssignmentOp::Add))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            }
            tx.commit().await.map_err(map_sqlx)?;
        }

        sqlx::query("UPDATE assignment_version SET version = $1 WHERE id = 1 AND version < $1")
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

        // Bounded journal: drop entries beyond the retention horizon.
        sqlx::query("DELETE FROM assignment_changes WHERE version <= $1 - $2")
            .bind(version)
            .bind(JOURNAL_RETENTION)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(version as u64)
    }

    async fn current_assignment_version(&self) -> StoreResult<u64> {
        let (version,): (i64,) =
            sqlx::query_as("SELECT version FROM assignment_version WHERE id = 1")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?;
        Ok(version as u64)
    }

    async fn assignment_changes_since(
        &self,
        agent_id: AgentId,
        from_version: u64,
    ) -> StoreResult<Option<Vec<AssignmentChange>>> {
        let (horizon,): (Option<i64>,) =
            sqlx::query_as("SELECT min(version) FROM assignment_changes")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?;
        if let Some(min_version) = horizon {
            // A from_version older than the oldest retained change cannot be
            // reconstructed as a delta.
            if (from_version as i64) < min_version - 1 {
                return Ok(None);
            }
        }

        let changes = sqlx::query(
            r#"SELECT * FROM assignment_changes
               WHERE agent_id = $1 AND version > $2
               ORDER BY version"#,
        )
        .bind(agent_id)
        .bind(from_version as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::assignment_change)
        .collect::<StoreResult<Vec<_>>>()?;
        Ok(Some(changes))
    }

    async fn delete_all_assignments(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("DELETE FROM target_assignments")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        sqlx::query("DELETE FROM assignment_changes")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }
}
