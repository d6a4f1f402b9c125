use super::models::*;
use super::sqlite::Database;
use crate::domain::{Hashes, ItemKind};
use crate::hasher::HashKind;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Result, Row};
use tracing::debug;

const RECORD_COLUMNS: &str =
    "t.id, t.crc32, t.md5, t.sha1, t.sha256, t.sha384, t.sha512, t.size, t.is_in_repo, \
     t.created_at, t.updated_at";

const ROMSET_COLUMNS: &str =
    "id, name, description, version, author, date, homepage, category, file_name, sha384, \
     created_at, updated_at";

fn record_from_row(kind: ItemKind, row: &Row<'_>, offset: usize) -> Result<ContentRecord> {
    Ok(ContentRecord {
        id: row.get(offset)?,
        kind,
        hashes: Hashes {
            crc32: row.get(offset + 1)?,
            md5: row.get(offset + 2)?,
            sha1: row.get(offset + 3)?,
            sha256: row.get(offset + 4)?,
            sha384: row.get(offset + 5)?,
            sha512: row.get(offset + 6)?,
        },
        size: row.get::<_, i64>(offset + 7)? as u64,
        is_in_repo: row.get(offset + 8)?,
        created_at: row.get(offset + 9)?,
        updated_at: row.get(offset + 10)?,
    })
}

fn romset_from_row(row: &Row<'_>) -> Result<RomSet> {
    Ok(RomSet {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        version: row.get(3)?,
        author: row.get(4)?,
        date: row.get(5)?,
        homepage: row.get(6)?,
        category: row.get(7)?,
        file_name: row.get(8)?,
        sha384: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn machine_from_row(row: &Row<'_>) -> Result<Machine> {
    Ok(Machine {
        id: row.get(0)?,
        romset_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

impl Database {
    // ── RomSets ──────────────────────────────────────────────────

    /// Insert a RomSet; `id` and timestamps of the argument are ignored.
    pub fn insert_romset(&self, romset: &RomSet) -> Result<i64> {
        let now = Utc::now();
        self.connection().execute(
            "INSERT INTO romset (name, description, version, author, date, homepage, \
             category, file_name, sha384, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                romset.name,
                romset.description,
                romset.version,
                romset.author,
                romset.date,
                romset.homepage,
                romset.category,
                romset.file_name,
                romset.sha384,
                now,
            ],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn get_romset(&self, id: i64) -> Result<Option<RomSet>> {
        self.connection()
            .query_row(
                &format!("SELECT {} FROM romset WHERE id = ?1", ROMSET_COLUMNS),
                params![id],
                romset_from_row,
            )
            .optional()
    }

    pub fn find_romset_by_sha384(&self, sha384: &str) -> Result<Option<RomSet>> {
        self.connection()
            .query_row(
                &format!(
                    "SELECT {} FROM romset WHERE sha384 = ?1 ORDER BY id LIMIT 1",
                    ROMSET_COLUMNS
                ),
                params![sha384],
                romset_from_row,
            )
            .optional()
    }

    pub fn list_romsets(&self) -> Result<Vec<RomSet>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM romset ORDER BY name, id",
            ROMSET_COLUMNS
        ))?;
        let romsets = stmt
            .query_map([], romset_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(romsets)
    }

    /// Delete a RomSet; machines, associations and its stat cascade.
    /// Content records are shared and stay.
    pub fn delete_romset(&self, id: i64) -> Result<bool> {
        let n = self
            .connection()
            .execute("DELETE FROM romset WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // ── Machines ─────────────────────────────────────────────────

    pub fn insert_machine(
        &self,
        romset_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now();
        let mut stmt = self.connection().prepare_cached(
            "INSERT INTO machine (romset_id, name, description, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4)",
        )?;
        stmt.execute(params![romset_id, name, description, now])?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn list_machines(&self, romset_id: i64) -> Result<Vec<Machine>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, romset_id, name, description, created_at, updated_at \
             FROM machine WHERE romset_id = ?1 ORDER BY name",
        )?;
        let machines = stmt
            .query_map(params![romset_id], machine_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(machines)
    }

    pub fn find_machine(&self, romset_id: i64, name: &str) -> Result<Option<Machine>> {
        self.connection()
            .query_row(
                "SELECT id, romset_id, name, description, created_at, updated_at \
                 FROM machine WHERE romset_id = ?1 AND name = ?2",
                params![romset_id, name],
                machine_from_row,
            )
            .optional()
    }

    // ── Content records ──────────────────────────────────────────

    /// All records of `kind` whose `algo` digest and size match one of
    /// `pairs`. One round trip through a temp-table join, however many
    /// pairs are probed.
    pub fn bulk_existence_query(
        &self,
        kind: ItemKind,
        algo: HashKind,
        pairs: &[(String, u64)],
    ) -> Result<Vec<ContentRecord>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let tx = self.connection().unchecked_transaction()?;
        tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS probe (hash TEXT NOT NULL, size INTEGER NOT NULL);
             DELETE FROM temp.probe;",
        )?;
        {
            let mut insert =
                tx.prepare_cached("INSERT INTO temp.probe (hash, size) VALUES (?1, ?2)")?;
            for (hash, size) in pairs {
                insert.execute(params![hash, *size as i64])?;
            }
        }

        let records = {
            let mut stmt = tx.prepare(&format!(
                "SELECT DISTINCT {cols} FROM {table} t \
                 JOIN temp.probe p ON t.{col} = p.hash AND t.size = p.size",
                cols = RECORD_COLUMNS,
                table = kind.table(),
                col = algo.as_str(),
            ))?;
            let rows = stmt
                .query_map([], |row| record_from_row(kind, row, 0))?
                .collect::<Result<Vec<_>>>()?;
            rows
        };

        tx.execute_batch("DELETE FROM temp.probe;")?;
        tx.commit()?;
        debug!(
            "Bulk probe {} by {}: {} pairs, {} hits",
            kind,
            algo,
            pairs.len(),
            records.len()
        );
        Ok(records)
    }

    pub fn find_records(
        &self,
        kind: ItemKind,
        algo: HashKind,
        value: &str,
        size: u64,
    ) -> Result<Vec<ContentRecord>> {
        let mut stmt = self.connection().prepare_cached(&format!(
            "SELECT {cols} FROM {table} t WHERE t.{col} = ?1 AND t.size = ?2",
            cols = RECORD_COLUMNS,
            table = kind.table(),
            col = algo.as_str(),
        ))?;
        let records = stmt
            .query_map(params![value, size as i64], |row| {
                record_from_row(kind, row, 0)
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn get_record(&self, kind: ItemKind, id: i64) -> Result<Option<ContentRecord>> {
        self.connection()
            .query_row(
                &format!(
                    "SELECT {} FROM {} t WHERE t.id = ?1",
                    RECORD_COLUMNS,
                    kind.table()
                ),
                params![id],
                |row| record_from_row(kind, row, 0),
            )
            .optional()
    }

    pub fn insert_record(&self, record: &ContentRecord) -> Result<i64> {
        let mut stmt = self.connection().prepare_cached(&format!(
            "INSERT INTO {} (crc32, md5, sha1, sha256, sha384, sha512, size, is_in_repo, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            record.kind.table()
        ))?;
        let h = &record.hashes;
        stmt.execute(params![
            h.crc32,
            h.md5,
            h.sha1,
            h.sha256,
            h.sha384,
            h.sha512,
            record.size as i64,
            record.is_in_repo,
            record.created_at,
            record.updated_at,
        ])?;
        Ok(self.connection().last_insert_rowid())
    }

    /// Write the hash columns of `record`. Columns already populated in the
    /// index are kept (`COALESCE`), so a concurrent backfill never loses data.
    pub fn update_record_hashes(&self, record: &ContentRecord) -> Result<()> {
        let mut stmt = self.connection().prepare_cached(&format!(
            "UPDATE {} SET crc32 = COALESCE(crc32, ?1), md5 = COALESCE(md5, ?2), \
             sha1 = COALESCE(sha1, ?3), sha256 = COALESCE(sha256, ?4), \
             sha384 = COALESCE(sha384, ?5), sha512 = COALESCE(sha512, ?6), \
             updated_at = ?7 WHERE id = ?8",
            record.kind.table()
        ))?;
        let h = &record.hashes;
        stmt.execute(params![
            h.crc32,
            h.md5,
            h.sha1,
            h.sha256,
            h.sha384,
            h.sha512,
            Utc::now(),
            record.id,
        ])?;
        Ok(())
    }

    pub fn set_in_repo(&self, kind: ItemKind, id: i64, in_repo: bool) -> Result<()> {
        let mut stmt = self.connection().prepare_cached(&format!(
            "UPDATE {} SET is_in_repo = ?1, updated_at = ?2 WHERE id = ?3",
            kind.table()
        ))?;
        stmt.execute(params![in_repo, Utc::now(), id])?;
        Ok(())
    }

    pub fn count_records(&self, kind: ItemKind) -> Result<i64> {
        self.connection().query_row(
            &format!("SELECT COUNT(*) FROM {}", kind.table()),
            [],
            |row| row.get(0),
        )
    }

    /// Number and total size of payloads present in the store.
    pub fn repository_totals(&self) -> Result<(u64, u64)> {
        let mut count = 0u64;
        let mut bytes = 0u64;
        for kind in ItemKind::ALL {
            let (n, b): (i64, i64) = self.connection().query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM {} WHERE is_in_repo = 1",
                    kind.table()
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            count += n as u64;
            bytes += b as u64;
        }
        Ok((count, bytes))
    }

    // ── Associations ─────────────────────────────────────────────

    pub fn insert_association(&self, association: &Association) -> Result<i64> {
        let mut stmt = self.connection().prepare_cached(&format!(
            "INSERT INTO {} (machine_id, item_id, name, path, last_modified) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            association.kind.association_table()
        ))?;
        stmt.execute(params![
            association.machine_id,
            association.item_id,
            association.name,
            association.path,
            association.last_modified,
        ])?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn count_associations(&self, kind: ItemKind) -> Result<i64> {
        self.connection().query_row(
            &format!("SELECT COUNT(*) FROM {}", kind.association_table()),
            [],
            |row| row.get(0),
        )
    }

    /// Files, then disks, then medias of one machine, each ordered by name.
    pub fn machine_items(&self, machine_id: i64) -> Result<Vec<MachineItem>> {
        let mut items = Vec::new();
        for kind in ItemKind::ALL {
            let mut stmt = self.connection().prepare_cached(&format!(
                "SELECT a.id, a.machine_id, a.item_id, a.name, a.path, a.last_modified, {cols} \
                 FROM {assoc} a JOIN {table} t ON t.id = a.item_id \
                 WHERE a.machine_id = ?1 ORDER BY a.name, a.id",
                cols = RECORD_COLUMNS,
                assoc = kind.association_table(),
                table = kind.table(),
            ))?;
            let rows = stmt
                .query_map(params![machine_id], |row| {
                    Ok(MachineItem {
                        association: Association {
                            id: row.get(0)?,
                            kind,
                            machine_id: row.get(1)?,
                            item_id: row.get(2)?,
                            name: row.get(3)?,
                            path: row.get(4)?,
                            last_modified: row.get(5)?,
                        },
                        record: record_from_row(kind, row, 6)?,
                    })
                })?
                .collect::<Result<Vec<_>>>()?;
            items.extend(rows);
        }
        Ok(items)
    }

    // ── Statistics ───────────────────────────────────────────────

    /// Aggregate completeness of a RomSet from the current index.
    pub fn compute_romset_stat(&self, romset_id: i64) -> Result<RomSetStat> {
        let mut parts = Vec::new();
        for kind in ItemKind::ALL {
            parts.push(format!(
                "SELECT a.machine_id AS machine_id, t.is_in_repo AS in_repo \
                 FROM {assoc} a JOIN {table} t ON t.id = a.item_id \
                 JOIN machine m ON m.id = a.machine_id WHERE m.romset_id = ?1",
                assoc = kind.association_table(),
                table = kind.table(),
            ));
        }
        let sql = format!(
            "WITH items AS ({union}), \
             per_machine AS (SELECT machine_id, COUNT(*) AS total, SUM(in_repo) AS have \
                             FROM items GROUP BY machine_id) \
             SELECT (SELECT COUNT(*) FROM machine WHERE romset_id = ?1), \
                    COALESCE(SUM(CASE WHEN have = total THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN have < total THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(total), 0), \
                    COALESCE(SUM(have), 0) \
             FROM per_machine",
            union = parts.join(" UNION ALL "),
        );
        self.connection().query_row(&sql, params![romset_id], |row| {
            let total_items: i64 = row.get(3)?;
            let have_items: i64 = row.get(4)?;
            Ok(RomSetStat {
                romset_id,
                total_machines: row.get(0)?,
                complete_machines: row.get(1)?,
                incomplete_machines: row.get(2)?,
                total_items,
                have_items,
                miss_items: total_items - have_items,
            })
        })
    }

    /// Replace the stored snapshot of `stat.romset_id`.
    pub fn save_romset_stat(&self, stat: &RomSetStat) -> Result<()> {
        self.connection().execute(
            "INSERT OR REPLACE INTO romset_stat (romset_id, total_machines, complete_machines, \
             incomplete_machines, total_items, have_items, miss_items, computed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                stat.romset_id,
                stat.total_machines,
                stat.complete_machines,
                stat.incomplete_machines,
                stat.total_items,
                stat.have_items,
                stat.miss_items,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_romset_stat(&self, romset_id: i64) -> Result<Option<RomSetStat>> {
        self.connection()
            .query_row(
                "SELECT romset_id, total_machines, complete_machines, incomplete_machines, \
                 total_items, have_items, miss_items FROM romset_stat WHERE romset_id = ?1",
                params![romset_id],
                |row| {
                    Ok(RomSetStat {
                        romset_id: row.get(0)?,
                        total_machines: row.get(1)?,
                        complete_machines: row.get(2)?,
                        incomplete_machines: row.get(3)?,
                        total_items: row.get(4)?,
                        have_items: row.get(5)?,
                        miss_items: row.get(6)?,
                    })
                },
            )
            .optional()
    }

    /// Recompute and store the snapshot of one RomSet.
    pub fn refresh_romset_stat(&self, romset_id: i64) -> Result<RomSetStat> {
        let stat = self.compute_romset_stat(romset_id)?;
        self.save_romset_stat(&stat)?;
        Ok(stat)
    }

    pub fn refresh_all_romset_stats(&self) -> Result<Vec<RomSetStat>> {
        let ids: Vec<i64> = self.list_romsets()?.into_iter().map(|r| r.id).collect();
        ids.into_iter()
            .map(|id| self.refresh_romset_stat(id))
            .collect()
    }
}
