//! The priority queue: ordered by `(bucket, priority, id)`, consumed by workers
//! through lease-bearing assignments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::types::PgInterval;
use sqlx::{Error, FromRow, PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A scheduled, not-yet-executed run intent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i32,
    pub codebase: String,
    pub campaign: String,
    pub command: String,
    pub bucket: String,
    pub context: Option<String>,
    pub estimated_duration: PgInterval,
    pub refresh: bool,
    pub requester: Option<String>,
    pub change_set: Option<String>,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for QueueItem {}

/// Branch/VCS location info joined in alongside a queue item, so a worker knows
/// where to check a codebase out from without a second round trip.
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize)]
pub struct VcsInfo {
    pub branch_url: Option<String>,
    pub subpath: Option<String>,
    pub vcs_type: Option<String>,
}

/// An in-process lease on a claimed queue item.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub queue_id: i32,
    pub worker_id: String,
    pub lease_deadline: DateTime<Utc>,
}

const DEFAULT_LEASE_SECONDS: i64 = 300;

/// Tracks which queue items are currently leased to a worker. Kept in-process:
/// restart safety is best-effort, matching the rest of the engine's concurrency
/// model (§5) -- a crash strands an assignment until its lease naturally expires.
#[derive(Default)]
pub struct AssignmentTable {
    by_queue_id: Mutex<HashMap<i32, Assignment>>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn reap_expired(&self, guard: &mut HashMap<i32, Assignment>) {
        let now = Utc::now();
        guard.retain(|_, a| a.lease_deadline > now);
    }

    /// Currently-assigned queue ids (expired leases excluded).
    pub fn assigned_ids(&self) -> HashSet<i32> {
        let mut guard = self.by_queue_id.lock().unwrap();
        self.reap_expired(&mut guard);
        guard.keys().copied().collect()
    }

    pub fn assign(&self, queue_id: i32, worker_id: &str) {
        let mut guard = self.by_queue_id.lock().unwrap();
        guard.insert(
            queue_id,
            Assignment {
                queue_id,
                worker_id: worker_id.to_string(),
                lease_deadline: Utc::now() + chrono::Duration::seconds(DEFAULT_LEASE_SECONDS),
            },
        );
    }

    /// Extend the lease on an assignment. Returns `false` if the assignment has
    /// already expired and been reaped (the caller must re-request work).
    pub fn keepalive(&self, queue_id: i32) -> bool {
        let mut guard = self.by_queue_id.lock().unwrap();
        self.reap_expired(&mut guard);
        if let Some(a) = guard.get_mut(&queue_id) {
            a.lease_deadline = Utc::now() + chrono::Duration::seconds(DEFAULT_LEASE_SECONDS);
            true
        } else {
            false
        }
    }

    /// Release an assignment, e.g. on completion.
    pub fn release(&self, queue_id: i32) {
        self.by_queue_id.lock().unwrap().remove(&queue_id);
    }
}

/// Thin wrapper around a `PgPool` exposing queue operations.
pub struct Queue<'a> {
    pool: &'a PgPool,
}

/// Estimated queue position and wait time for a `(codebase, campaign)` pair.
#[derive(FromRow)]
pub struct Eta {
    pub position: i64,
    pub wait_time: PgInterval,
}

impl<'a> Queue<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Queue { pool }
    }

    pub async fn get_position(&self, campaign: &str, codebase: &str) -> Result<Option<Eta>, Error> {
        sqlx::query_as::<_, Eta>(
            "SELECT position, wait_time FROM queue_positions WHERE codebase = $1 AND campaign = $2",
        )
        .bind(codebase)
        .bind(campaign)
        .fetch_optional(self.pool)
        .await
    }

    pub async fn get_item(&self, queue_id: i32) -> Result<Option<QueueItem>, Error> {
        sqlx::query_as::<_, QueueItem>(
            "SELECT id, codebase, campaign, command, bucket, context, estimated_duration,
                    refresh, requester, change_set
             FROM queue WHERE id = $1",
        )
        .bind(queue_id)
        .fetch_optional(self.pool)
        .await
    }

    /// Pop the next runnable item not already held by an assignment, optionally
    /// scoped to a codebase/campaign and excluding some VCS hosts (e.g. those
    /// currently rate-limited).
    pub async fn next_item(
        &self,
        codebase: Option<&str>,
        campaign: Option<&str>,
        exclude_hosts: Option<HashSet<String>>,
        assigned_queue_items: HashSet<i32>,
    ) -> Result<(Option<QueueItem>, Option<VcsInfo>), Error> {
        let mut query = String::from(
            "SELECT queue.id, queue.codebase, queue.campaign, queue.command, queue.bucket,
                    queue.context, queue.estimated_duration, queue.refresh, queue.requester,
                    queue.change_set,
                    codebase.branch_url, codebase.subpath, codebase.vcs_type
             FROM queue
             LEFT JOIN codebase ON codebase.name = queue.codebase",
        );

        let mut conditions = Vec::new();
        if !assigned_queue_items.is_empty() {
            conditions.push("NOT (queue.id = ANY($1::int[]))".to_string());
        }
        if codebase.is_some() {
            conditions.push(format!("queue.codebase = ${}", conditions.len() + 2));
        }
        if campaign.is_some() {
            conditions.push(format!("queue.campaign = ${}", conditions.len() + 2));
        }
        if exclude_hosts.is_some() {
            conditions.push(format!(
                "NOT (codebase.branch_url IS NOT NULL AND SUBSTRING(codebase.branch_url from '.*://(?:[^/@]*@)?([^/]*)') = ANY(${}::text[]))",
                conditions.len() + 2
            ));
        }
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query.push_str(" ORDER BY queue.bucket ASC, queue.priority ASC, queue.id ASC LIMIT 1");

        let mut q = sqlx::query(&query);
        if !assigned_queue_items.is_empty() {
            q = q.bind(assigned_queue_items.into_iter().collect::<Vec<_>>());
        }
        if let Some(codebase) = codebase {
            q = q.bind(codebase);
        }
        if let Some(campaign) = campaign {
            q = q.bind(campaign);
        }
        if let Some(exclude_hosts) = exclude_hosts {
            q = q.bind(exclude_hosts.into_iter().collect::<Vec<_>>());
        }

        let row = q.fetch_optional(self.pool).await?;
        match row {
            Some(row) => {
                let item = QueueItem::from_row(&row)?;
                let vcs = VcsInfo::from_row(&row)?;
                Ok((Some(item), Some(vcs)))
            }
            None => Ok((None, None)),
        }
    }

    /// Insert (or update, if a row for this `(codebase, campaign, change_set)`
    /// already exists and this request would place it earlier) a queue entry.
    pub async fn add(
        &self,
        codebase: &str,
        command: &str,
        campaign: &str,
        change_set: Option<&str>,
        offset: f64,
        bucket: &str,
        context: Option<&str>,
        estimated_duration: Option<chrono::Duration>,
        refresh: bool,
        requester: Option<&str>,
    ) -> Result<(i32, String), Error> {
        let row = sqlx::query(
            "INSERT INTO queue
                (codebase, command, campaign, change_set, priority, bucket, context,
                 estimated_duration, refresh, requester)
             VALUES ($1, $2, $3, $4,
                     (SELECT COALESCE(MIN(priority), 0) FROM queue) + $5, $6, $7, $8, $9, $10)
             ON CONFLICT (codebase, campaign, coalesce(change_set, ''::text))
             DO UPDATE SET context = EXCLUDED.context,
                           priority = EXCLUDED.priority,
                           bucket = EXCLUDED.bucket,
                           estimated_duration = EXCLUDED.estimated_duration,
                           refresh = EXCLUDED.refresh,
                           requester = EXCLUDED.requester,
                           command = EXCLUDED.command
             WHERE queue.bucket >= EXCLUDED.bucket OR
                   (queue.bucket = EXCLUDED.bucket AND queue.priority >= EXCLUDED.priority)
             RETURNING id, bucket",
        )
        .bind(codebase)
        .bind(command)
        .bind(campaign)
        .bind(change_set)
        .bind(offset)
        .bind(bucket)
        .bind(context)
        .bind(estimated_duration)
        .bind(refresh)
        .bind(requester)
        .fetch_optional(self.pool)
        .await?;

        if let Some(row) = row {
            return Ok((row.try_get("id")?, row.try_get("bucket")?));
        }

        let row = sqlx::query(
            "SELECT id, bucket FROM queue
             WHERE codebase = $1 AND campaign = $2 AND coalesce(change_set, ''::text) = $3",
        )
        .bind(codebase)
        .bind(campaign)
        .bind(change_set.unwrap_or(""))
        .fetch_one(self.pool)
        .await?;
        Ok((row.try_get("id")?, row.try_get("bucket")?))
    }

    /// Remove a completed queue item. Callers must do this in the same
    /// transaction as recording the run, so an item is never both completed and
    /// left queued.
    pub async fn remove(&self, queue_id: i32) -> Result<(), Error> {
        sqlx::query("DELETE FROM queue WHERE id = $1")
            .bind(queue_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_buckets(&self) -> Result<Vec<(String, i64)>, Error> {
        let rows = sqlx::query(
            "SELECT bucket, count(*) as count FROM queue GROUP BY bucket ORDER BY bucket ASC",
        )
        .fetch_all(self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get("bucket")?, row.try_get("count")?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i32, bucket: &str, priority: i64) -> (i32, String, i64) {
        (id, bucket.to_string(), priority)
    }

    /// Mirrors the ordering rule the SQL `ORDER BY` clause encodes: lexicographic
    /// ascending `(bucket, priority, id)`.
    fn ordering_key(i: &(i32, String, i64)) -> (String, i64, i32) {
        (i.1.clone(), i.2, i.0)
    }

    #[test]
    fn queue_ordering_is_lexicographic_bucket_priority_id() {
        let mut items = vec![
            item(1, "default", 3500),
            item(2, "control", 9999),
            item(3, "default", 100),
        ];
        items.sort_by_key(ordering_key);
        let order: Vec<i32> = items.iter().map(|i| i.0).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn fifo_within_tier() {
        let mut items = vec![
            item(5, "default", 100),
            item(2, "default", 100),
            item(9, "default", 100),
        ];
        items.sort_by_key(ordering_key);
        let order: Vec<i32> = items.iter().map(|i| i.0).collect();
        assert_eq!(order, vec![2, 5, 9]);
    }

    #[test]
    fn assignment_table_tracks_and_releases() {
        let table = AssignmentTable::new();
        table.assign(1, "worker-a");
        assert!(table.assigned_ids().contains(&1));
        table.release(1);
        assert!(!table.assigned_ids().contains(&1));
    }

    #[test]
    fn expired_lease_is_reaped() {
        let table = AssignmentTable::new();
        table.by_queue_id.lock().unwrap().insert(
            7,
            Assignment {
                queue_id: 7,
                worker_id: "worker-b".to_string(),
                lease_deadline: Utc::now() - chrono::Duration::seconds(1),
            },
        );
        assert!(!table.assigned_ids().contains(&7));
        assert!(!table.keepalive(7));
    }

    #[test]
    fn keepalive_extends_live_lease() {
        let table = AssignmentTable::new();
        table.assign(3, "worker-c");
        assert!(table.keepalive(3));
    }
}
