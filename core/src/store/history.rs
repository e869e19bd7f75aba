use super::HistoryStore;
use crate::{
    error::{FunnelError, FunnelResult},
    funnel::FunnelMetrics,
    history::{Snapshot, SnapshotRow},
    types::RunTimestamp,
};
use chrono::DateTime;
use rusqlite::{params, OptionalExtension};

fn to_timestamp(secs: i64) -> FunnelResult<RunTimestamp> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        FunnelError::Other(anyhow::anyhow!("stored run_timestamp {secs} is out of range"))
    })
}

fn to_column(value: u64, column: &str) -> FunnelResult<i64> {
    i64::try_from(value).map_err(|_| {
        FunnelError::Other(anyhow::anyhow!("{column} value {value} does not fit in a stored integer"))
    })
}

fn from_column(value: i64, column: &str) -> FunnelResult<u64> {
    u64::try_from(value)
        .map_err(|_| FunnelError::Other(anyhow::anyhow!("stored {column} is negative ({value})")))
}

/// One `funnel_snapshot` row as stored, before range checks.
struct RawSnapshotRow {
    run_timestamp:       i64,
    starting_population: i64,
    section:             String,
    template:            String,
    position:            i64,
    check_name:          String,
    criteria:            Option<String>,
    description:         Option<String>,
    counts:              [i64; 5],
}

impl RawSnapshotRow {
    fn into_row(self) -> FunnelResult<SnapshotRow> {
        let [unique, incremental, cumulative, regain, remaining] = self.counts;
        let position = usize::try_from(self.position).map_err(|_| {
            FunnelError::Other(anyhow::anyhow!("stored position is negative ({})", self.position))
        })?;
        Ok(SnapshotRow {
            section: self.section,
            template: self.template,
            position,
            check_name: self.check_name,
            criteria: self.criteria,
            description: self.description,
            metrics: FunnelMetrics {
                unique_drops:      from_column(unique, "unique_drops")?,
                incremental_drops: from_column(incremental, "incremental_drops")?,
                cumulative_drops:  from_column(cumulative, "cumulative_drops")?,
                regain:            from_column(regain, "regain")?,
                remaining:         from_column(remaining, "remaining")?,
            },
        })
    }
}

impl HistoryStore {
    // ── Snapshot writes ────────────────────────────────────────

    /// Append one grouping's rows for a run. All rows land or none do.
    pub fn record(
        &self,
        run_id: &str,
        run_timestamp: RunTimestamp,
        grouping: &str,
        rows: &[SnapshotRow],
        starting_population: u64,
    ) -> FunnelResult<()> {
        let start = to_column(starting_population, "starting_population")?;
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO funnel_snapshot (
                    run_id, run_timestamp, grouping_name, section, template, position,
                    check_name, criteria, description,
                    unique_drops, incremental_drops, cumulative_drops, regain, remaining,
                    starting_population
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            )?;
            for row in rows {
                stmt.execute(params![
                    run_id,
                    run_timestamp.timestamp(),
                    grouping,
                    row.section,
                    row.template,
                    to_column(row.position as u64, "position")?,
                    row.check_name,
                    row.criteria,
                    row.description,
                    to_column(row.metrics.unique_drops, "unique_drops")?,
                    to_column(row.metrics.incremental_drops, "incremental_drops")?,
                    to_column(row.metrics.cumulative_drops, "cumulative_drops")?,
                    to_column(row.metrics.regain, "regain")?,
                    to_column(row.metrics.remaining, "remaining")?,
                    start,
                ])?;
            }
        }
        tx.commit()?;
        log::debug!(
            "history: recorded {} row(s) for grouping={grouping} run={run_id}",
            rows.len()
        );
        Ok(())
    }

    // ── Snapshot reads ─────────────────────────────────────────

    /// Run whose timestamp is closest to `target`, ties going to the later run.
    pub fn find_nearest(
        &self,
        grouping: &str,
        target: RunTimestamp,
    ) -> FunnelResult<Option<Snapshot>> {
        let run = self
            .conn
            .query_row(
                "SELECT run_id FROM funnel_snapshot
                 WHERE grouping_name = ?1
                 GROUP BY run_id, run_timestamp
                 ORDER BY ABS(run_timestamp - ?2) ASC, run_timestamp DESC
                 LIMIT 1",
                params![grouping, target.timestamp()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match run {
            Some(run_id) => self.load_snapshot(&run_id, grouping),
            None => Ok(None),
        }
    }

    /// Most recent run with `from <= run_timestamp < to`.
    pub fn find_latest_between(
        &self,
        grouping: &str,
        from: RunTimestamp,
        to: RunTimestamp,
    ) -> FunnelResult<Option<Snapshot>> {
        let run = self
            .conn
            .query_row(
                "SELECT run_id FROM funnel_snapshot
                 WHERE grouping_name = ?1 AND run_timestamp >= ?2 AND run_timestamp < ?3
                 ORDER BY run_timestamp DESC, id DESC
                 LIMIT 1",
                params![grouping, from.timestamp(), to.timestamp()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match run {
            Some(run_id) => self.load_snapshot(&run_id, grouping),
            None => Ok(None),
        }
    }

    /// Distinct run timestamps for `grouping` within `[from, to]`, oldest first.
    pub fn runs_between(
        &self,
        grouping: &str,
        from: RunTimestamp,
        to: RunTimestamp,
    ) -> FunnelResult<Vec<RunTimestamp>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT run_timestamp FROM funnel_snapshot
             WHERE grouping_name = ?1 AND run_timestamp >= ?2 AND run_timestamp <= ?3
             ORDER BY run_timestamp ASC",
        )?;
        let secs = stmt
            .query_map(params![grouping, from.timestamp(), to.timestamp()], |row| {
                row.get::<_, i64>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        secs.into_iter().map(to_timestamp).collect()
    }

    /// Every row one run recorded for `grouping`, in evaluation order.
    pub fn load_snapshot(&self, run_id: &str, grouping: &str) -> FunnelResult<Option<Snapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_timestamp, starting_population, section, template, position,
                    check_name, criteria, description,
                    unique_drops, incremental_drops, cumulative_drops, regain, remaining
             FROM funnel_snapshot
             WHERE run_id = ?1 AND grouping_name = ?2
             ORDER BY position ASC, id ASC",
        )?;
        let raw = stmt
            .query_map(params![run_id, grouping], |row| {
                Ok(RawSnapshotRow {
                    run_timestamp:       row.get(0)?,
                    starting_population: row.get(1)?,
                    section:             row.get(2)?,
                    template:            row.get(3)?,
                    position:            row.get(4)?,
                    check_name:          row.get(5)?,
                    criteria:            row.get(6)?,
                    description:         row.get(7)?,
                    counts:              [
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                        row.get(12)?,
                    ],
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let Some((ts, start)) = raw.first().map(|r| (r.run_timestamp, r.starting_population))
        else {
            return Ok(None);
        };
        Ok(Some(Snapshot {
            run_id:              run_id.to_string(),
            run_timestamp:       to_timestamp(ts)?,
            grouping:            grouping.to_string(),
            starting_population: from_column(start, "starting_population")?,
            rows:                raw
                .into_iter()
                .map(RawSnapshotRow::into_row)
                .collect::<FunnelResult<Vec<_>>>()?,
        }))
    }
}
