use std::marker::PhantomData;
use std::path::Path;

use causaltree_core::{
    error::Error, Atom, CausalRepoBranch, CausalRepoObject, ContentHash, ObjectStore, StageChange,
    StageDiff, StageStore,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

/// SQLite-backed `ObjectStore` and `StageStore`.
///
/// Objects live in one table shared by all heads; `head_objects` records which head
/// stored each object. The stage is an append-only log; a change is skipped when it
/// repeats the latest change for the same `(branch, hash)`.
pub struct SqliteStore<Op> {
    conn: Connection,
    _op: PhantomData<fn() -> Op>,
}

impl<Op> SqliteStore<Op> {
    pub fn new_in_memory() -> causaltree_core::Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::with_connection(conn)
    }

    pub fn open(path: impl AsRef<Path>) -> causaltree_core::Result<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> causaltree_core::Result<Self> {
        let mut store = Self {
            conn,
            _op: PhantomData,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> causaltree_core::Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS objects (
                    hash BLOB PRIMARY KEY,
                    kind TEXT NOT NULL,
                    body TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS head_objects (
                    head TEXT NOT NULL,
                    hash BLOB NOT NULL,
                    PRIMARY KEY (head, hash)
                );
                CREATE TABLE IF NOT EXISTS branches (
                    name TEXT PRIMARY KEY,
                    hash BLOB NOT NULL,
                    time INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS stage (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    branch TEXT NOT NULL,
                    added INTEGER NOT NULL,
                    hash BLOB NOT NULL,
                    body TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_stage_branch ON stage(branch, seq);
                CREATE INDEX IF NOT EXISTS idx_stage_hash ON stage(branch, hash, seq);",
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn append_stage(&mut self, branch: &str, changes: &[StageChange<Op>]) -> causaltree_core::Result<()>
    where
        Op: Serialize,
    {
        let tx = self.conn.transaction().map_err(storage_err)?;
        {
            let mut latest = tx
                .prepare(
                    "SELECT added FROM stage WHERE branch = ?1 AND hash = ?2
                     ORDER BY seq DESC LIMIT 1",
                )
                .map_err(storage_err)?;
            let mut insert = tx
                .prepare(
                    "INSERT INTO stage (branch, added, hash, body)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(storage_err)?;
            for change in changes {
                let hash = change.hash();
                let previous: Option<bool> = latest
                    .query_row(params![branch, hash.as_bytes().as_slice()], |row| row.get(0))
                    .optional()
                    .map_err(storage_err)?;
                if previous == Some(change.is_added()) {
                    continue;
                }
                let body = serde_json::to_string(change).map_err(json_err)?;
                insert
                    .execute(params![
                        branch,
                        change.is_added(),
                        hash.as_bytes().as_slice(),
                        body
                    ])
                    .map_err(storage_err)?;
            }
        }
        tx.commit().map_err(storage_err)
    }
}

impl<Op> ObjectStore<Op> for SqliteStore<Op>
where
    Op: Serialize + DeserializeOwned,
{
    fn get_object(&self, hash: &ContentHash) -> causaltree_core::Result<Option<CausalRepoObject<Op>>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM objects WHERE hash = ?1",
                [hash.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        body.map(|b| serde_json::from_str(&b).map_err(json_err))
            .transpose()
    }

    fn get_objects(
        &self,
        head: &str,
        hashes: &[ContentHash],
    ) -> causaltree_core::Result<Vec<CausalRepoObject<Op>>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT o.body FROM objects o
                 JOIN head_objects h ON h.hash = o.hash
                 WHERE h.head = ?1 AND o.hash = ?2",
            )
            .map_err(storage_err)?;
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let body: Option<String> = stmt
                .query_row(params![head, hash.as_bytes().as_slice()], |row| row.get(0))
                .optional()
                .map_err(storage_err)?;
            if let Some(body) = body {
                out.push(serde_json::from_str(&body).map_err(json_err)?);
            }
        }
        Ok(out)
    }

    fn store_objects(
        &mut self,
        head: &str,
        objects: &[CausalRepoObject<Op>],
    ) -> causaltree_core::Result<()> {
        let tx = self.conn.transaction().map_err(storage_err)?;
        {
            let mut insert_object = tx
                .prepare("INSERT OR IGNORE INTO objects (hash, kind, body) VALUES (?1, ?2, ?3)")
                .map_err(storage_err)?;
            let mut insert_head = tx
                .prepare("INSERT OR IGNORE INTO head_objects (head, hash) VALUES (?1, ?2)")
                .map_err(storage_err)?;
            for object in objects {
                let hash = object.hash();
                let body = serde_json::to_string(object).map_err(json_err)?;
                insert_object
                    .execute(params![hash.as_bytes().as_slice(), object.kind(), body])
                    .map_err(storage_err)?;
                insert_head
                    .execute(params![head, hash.as_bytes().as_slice()])
                    .map_err(storage_err)?;
            }
        }
        tx.commit().map_err(storage_err)
    }

    fn get_branches(&self, prefix: Option<&str>) -> causaltree_core::Result<Vec<CausalRepoBranch>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, hash, time FROM branches ORDER BY name ASC")
            .map_err(storage_err)?;
        let rows = stmt.query_map([], row_to_branch).map_err(storage_err)?;

        let mut branches = Vec::new();
        for branch in rows {
            let branch = branch.map_err(storage_err)?;
            if prefix.map_or(true, |p| branch.name.starts_with(p)) {
                branches.push(branch);
            }
        }
        Ok(branches)
    }

    fn get_branch(&self, name: &str) -> causaltree_core::Result<Option<CausalRepoBranch>> {
        self.conn
            .query_row(
                "SELECT name, hash, time FROM branches WHERE name = ?1",
                [name],
                row_to_branch,
            )
            .optional()
            .map_err(storage_err)
    }

    fn save_branch(&mut self, branch: &CausalRepoBranch) -> causaltree_core::Result<()> {
        let time: i64 = branch
            .time
            .try_into()
            .map_err(|_| Error::Storage("branch time overflow".into()))?;
        self.conn
            .execute(
                "INSERT INTO branches (name, hash, time) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET hash = excluded.hash, time = excluded.time",
                params![branch.name, branch.hash.as_bytes().as_slice(), time],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn delete_branch(&mut self, name: &str) -> causaltree_core::Result<()> {
        self.conn
            .execute("DELETE FROM branches WHERE name = ?1", [name])
            .map_err(storage_err)?;
        Ok(())
    }
}

impl<Op> StageStore<Op> for SqliteStore<Op>
where
    Op: Serialize + DeserializeOwned + Clone,
{
    fn get_stage(&self, branch: &str) -> causaltree_core::Result<StageDiff<Op>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM stage WHERE branch = ?1 ORDER BY seq ASC")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([branch], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;

        let mut log: Vec<StageChange<Op>> = Vec::new();
        for body in rows {
            let body = body.map_err(storage_err)?;
            log.push(serde_json::from_str(&body).map_err(json_err)?);
        }
        Ok(StageDiff::from_log(&log))
    }

    fn add_atoms(&mut self, branch: &str, atoms: &[Atom<Op>]) -> causaltree_core::Result<()> {
        let changes: Vec<StageChange<Op>> = atoms
            .iter()
            .map(|atom| StageChange::Added { atom: atom.clone() })
            .collect();
        self.append_stage(branch, &changes)
    }

    fn remove_atoms(&mut self, branch: &str, hashes: &[ContentHash]) -> causaltree_core::Result<()> {
        let changes: Vec<StageChange<Op>> = hashes
            .iter()
            .map(|hash| StageChange::Removed { hash: *hash })
            .collect();
        self.append_stage(branch, &changes)
    }

    fn clear_stage(&mut self, branch: &str) -> causaltree_core::Result<()> {
        self.conn
            .execute("DELETE FROM stage WHERE branch = ?1", [branch])
            .map_err(storage_err)?;
        Ok(())
    }
}

fn row_to_branch(row: &rusqlite::Row<'_>) -> rusqlite::Result<CausalRepoBranch> {
    let name: String = row.get(0)?;
    let hash: Vec<u8> = row.get(1)?;
    let time: i64 = row.get(2)?;
    let hash = ContentHash::from_slice(&hash).map_err(|_| {
        rusqlite::Error::InvalidColumnType(1, "hash".to_string(), rusqlite::types::Type::Blob)
    })?;
    Ok(CausalRepoBranch::new(name, hash, time.max(0) as u64))
}

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn json_err(e: serde_json::Error) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use causaltree_core::{AppOp, AtomId, SiteId};

    fn file(ts: u64) -> Atom<AppOp> {
        Atom::new(AtomId::new(ts, &SiteId::new("s"), 0), None, AppOp::file("e1"))
    }

    #[test]
    fn stored_atom_round_trips() {
        let mut store: SqliteStore<AppOp> = SqliteStore::new_in_memory().unwrap();
        let atom = file(1);
        store
            .store_objects("main", &[CausalRepoObject::Atom(atom.clone())])
            .unwrap();
        let loaded = store.get_object(&atom.hash()).unwrap();
        assert_eq!(loaded, Some(CausalRepoObject::Atom(atom.clone())));
        assert!(loaded.unwrap().as_atom().unwrap().is_valid());
    }

    #[test]
    fn stage_log_ignores_duplicate_rows() {
        let mut store: SqliteStore<AppOp> = SqliteStore::new_in_memory().unwrap();
        let atom = file(1);
        store.add_atoms("main", &[atom.clone()]).unwrap();
        store.add_atoms("main", &[atom.clone()]).unwrap();
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM stage", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn re_add_after_remove_is_logged() {
        let mut store: SqliteStore<AppOp> = SqliteStore::new_in_memory().unwrap();
        let atom = file(1);
        store.add_atoms("main", &[atom.clone()]).unwrap();
        store.remove_atoms("main", &[atom.hash()]).unwrap();
        store.add_atoms("main", &[atom.clone()]).unwrap();
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM stage", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);

        let diff = store.get_stage("main").unwrap();
        assert_eq!(diff.additions, vec![atom]);
        assert!(diff.deletions.is_empty());
    }
}
