//! SQLite persistence for the gateway.
//!
//! Holds everything that must survive a restart: per-identity retrieval
//! cursors, the token registry, the bootstrap snode pool, cached swarms, and
//! the silent-token list.  The handle is cheap to clone and opens a fresh
//! connection per logical operation — the two dispatch loops share it across
//! tasks, and a connection-per-call discipline keeps their accesses from
//! interleaving open transactions.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::snode::SnodeTarget;

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

/// Handle to the gateway database. Clone freely; every call connects,
/// operates, and closes.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Open or create the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            path: path.to_path_buf(),
        };
        let conn = store.connect()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                session_id  TEXT PRIMARY KEY,
                last_hash   TEXT NOT NULL DEFAULT '',
                expiration  INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS tokens (
                device_token TEXT PRIMARY KEY,
                session_id   TEXT NOT NULL REFERENCES sessions(session_id)
            );

            CREATE INDEX IF NOT EXISTS idx_tokens_session
                ON tokens(session_id);

            CREATE TABLE IF NOT EXISTS silent_tokens (
                device_token TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS snode_pool (
                host            TEXT NOT NULL,
                port            INTEGER NOT NULL,
                id_key          TEXT NOT NULL,
                encryption_key  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS swarms (
                session_id      TEXT NOT NULL,
                host            TEXT NOT NULL,
                port            INTEGER NOT NULL,
                id_key          TEXT NOT NULL,
                encryption_key  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_swarms_session
                ON swarms(session_id);
            ",
        )?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    // -- retrieval cursors --------------------------------------------------

    /// Current cursor for an identity; `("", 0)` when none is recorded.
    pub fn last_hash(&self, session_id: &str) -> Result<(String, u64), StorageError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT last_hash, expiration FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?;
        Ok(row.unwrap_or_default())
    }

    /// Advance the cursor only when `expiration` is strictly greater than
    /// the stored one, so out-of-order responses cannot regress it.
    /// Returns whether a row changed; unknown identities are a no-op.
    pub fn update_last_hash_if_newer(
        &self,
        session_id: &str,
        hash: &str,
        expiration: u64,
    ) -> Result<bool, StorageError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE sessions SET last_hash = ?2, expiration = ?3
             WHERE session_id = ?1 AND expiration < ?3",
            params![session_id, hash, expiration as i64],
        )?;
        Ok(changed > 0)
    }

    // -- token registry -----------------------------------------------------

    /// Register a token under an identity.  Creates the identity's session
    /// row (with an empty cursor) on first registration; re-registration
    /// under a new identity supersedes the old association.
    pub fn insert_token(&self, session_id: &str, token: &str) -> Result<(), StorageError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO sessions (session_id) VALUES (?1)",
            params![session_id],
        )?;
        conn.execute(
            "INSERT INTO tokens (device_token, session_id) VALUES (?1, ?2)
             ON CONFLICT(device_token) DO UPDATE SET session_id = excluded.session_id",
            params![token, session_id],
        )?;
        Ok(())
    }

    pub fn remove_token(&self, token: &str) -> Result<(), StorageError> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM tokens WHERE device_token = ?1", params![token])?;
        Ok(())
    }

    pub fn tokens_for(&self, session_id: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT device_token FROM tokens WHERE session_id = ?1")?;
        let tokens = stmt
            .query_map(params![session_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(tokens)
    }

    /// Identities that currently have at least one registered token.
    pub fn session_ids_with_tokens(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT DISTINCT session_id FROM tokens ORDER BY session_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    // -- silent tokens ------------------------------------------------------

    pub fn silent_tokens(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT device_token FROM silent_tokens")?;
        let tokens = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(tokens)
    }

    pub fn insert_silent_token(&self, token: &str) -> Result<(), StorageError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO silent_tokens (device_token) VALUES (?1)",
            params![token],
        )?;
        Ok(())
    }

    pub fn remove_silent_token(&self, token: &str) -> Result<(), StorageError> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM silent_tokens WHERE device_token = ?1",
            params![token],
        )?;
        Ok(())
    }

    // -- snode pool and swarm cache ----------------------------------------

    pub fn snode_pool(&self) -> Result<Vec<SnodeTarget>, StorageError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT host, port, id_key, encryption_key FROM snode_pool")?;
        let peers = stmt
            .query_map([], row_to_target)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(peers)
    }

    /// Replace the persisted bootstrap pool.
    pub fn save_snode_pool(&self, peers: &[SnodeTarget]) -> Result<(), StorageError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM snode_pool", [])?;
        for peer in peers {
            tx.execute(
                "INSERT INTO snode_pool (host, port, id_key, encryption_key)
                 VALUES (?1, ?2, ?3, ?4)",
                params![peer.host, peer.port, peer.id_key, peer.encryption_key],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn swarm_for(&self, session_id: &str) -> Result<Vec<SnodeTarget>, StorageError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT host, port, id_key, encryption_key FROM swarms WHERE session_id = ?1",
        )?;
        let peers = stmt
            .query_map(params![session_id], row_to_target)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(peers)
    }

    /// Replace the persisted swarm for one identity.
    pub fn save_swarm(&self, session_id: &str, peers: &[SnodeTarget]) -> Result<(), StorageError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM swarms WHERE session_id = ?1", params![session_id])?;
        for peer in peers {
            tx.execute(
                "INSERT INTO swarms (session_id, host, port, id_key, encryption_key)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, peer.host, peer.port, peer.id_key, peer.encryption_key],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn row_to_target(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnodeTarget> {
    Ok(SnodeTarget {
        host: row.get(0)?,
        port: row.get::<_, i64>(1)? as u16,
        id_key: row.get(2)?,
        encryption_key: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_store(tag: &str) -> Store {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("swarmgate-{tag}-{nanos}.db"));
        Store::open(&path).expect("open temp store")
    }

    #[test]
    fn cursor_starts_empty_and_stays_monotonic() {
        let store = temp_store("cursor");
        assert_eq!(store.last_hash("p1").unwrap(), (String::new(), 0));

        // Cursor rows exist only for registered identities.
        assert!(!store.update_last_hash_if_newer("p1", "h1", 100).unwrap());
        store.insert_token("p1", "tok1").unwrap();

        assert!(store.update_last_hash_if_newer("p1", "h1", 100).unwrap());
        assert!(!store.update_last_hash_if_newer("p1", "h0", 50).unwrap());
        assert!(!store.update_last_hash_if_newer("p1", "h1b", 100).unwrap());
        assert!(store.update_last_hash_if_newer("p1", "h2", 200).unwrap());
        assert_eq!(store.last_hash("p1").unwrap(), ("h2".to_string(), 200));
    }

    #[test]
    fn reregistration_supersedes_identity() {
        let store = temp_store("rereg");
        store.insert_token("p1", "tok").unwrap();
        store.insert_token("p2", "tok").unwrap();
        assert!(store.tokens_for("p1").unwrap().is_empty());
        assert_eq!(store.tokens_for("p2").unwrap(), vec!["tok".to_string()]);
        assert_eq!(store.session_ids_with_tokens().unwrap(), vec!["p2".to_string()]);

        store.remove_token("tok").unwrap();
        assert!(store.session_ids_with_tokens().unwrap().is_empty());
    }

    #[test]
    fn snode_pool_and_swarm_round_trip() {
        let store = temp_store("peers");
        let peers = vec![
            SnodeTarget {
                host: "1.2.3.4".into(),
                port: 443,
                id_key: "ed1".into(),
                encryption_key: "x1".into(),
            },
            SnodeTarget {
                host: "5.6.7.8".into(),
                port: 8080,
                id_key: "ed2".into(),
                encryption_key: "x2".into(),
            },
        ];
        store.save_snode_pool(&peers).unwrap();
        assert_eq!(store.snode_pool().unwrap(), peers);

        store.save_swarm("p1", &peers[..1]).unwrap();
        store.save_swarm("p1", &peers[1..]).unwrap();
        assert_eq!(store.swarm_for("p1").unwrap(), peers[1..].to_vec());
        assert!(store.swarm_for("p2").unwrap().is_empty());
    }

    #[test]
    fn silent_tokens_round_trip() {
        let store = temp_store("silent");
        store.insert_silent_token("tok1").unwrap();
        store.insert_silent_token("tok1").unwrap();
        store.insert_silent_token("tok2").unwrap();
        let mut tokens = store.silent_tokens().unwrap();
        tokens.sort();
        assert_eq!(tokens, vec!["tok1".to_string(), "tok2".to_string()]);
        store.remove_silent_token("tok1").unwrap();
        assert_eq!(store.silent_tokens().unwrap(), vec!["tok2".to_string()]);
    }
}
