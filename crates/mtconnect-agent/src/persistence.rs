//! `SQLite` asset archive.
//!
//! Assets drained from the in-memory store are upserted here by storage key.

use mtconnect_core::{Asset, AssetKey};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

/// `SQLite`-backed asset archive.
pub struct AssetArchive {
    conn: Connection,
}

impl std::fmt::Debug for AssetArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetArchive").finish_non_exhaustive()
    }
}

impl AssetArchive {
    /// Open or create an archive database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let conn = Connection::open(path)?;
        let archive = Self { conn };
        archive.init_schema()?;
        Ok(archive)
    }

    /// Create an in-memory archive (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn in_memory() -> Result<Self, ArchiveError> {
        let conn = Connection::open_in_memory()?;
        let archive = Self { conn };
        archive.init_schema()?;
        Ok(archive)
    }

    fn init_schema(&self) -> Result<(), ArchiveError> {
        self.conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS assets (
                asset_key TEXT PRIMARY KEY,
                asset_id TEXT NOT NULL,
                asset_type TEXT NOT NULL,
                device_uuid TEXT,
                removed INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                document TEXT NOT NULL,
                archived_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_assets_device ON assets(device_uuid);
            ",
        )?;

        Ok(())
    }

    /// Upsert a drained batch in one transaction.
    ///
    /// Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or any insert fails; the batch is then
    /// rolled back.
    pub fn save_assets(&mut self, assets: &[Asset]) -> Result<usize, ArchiveError> {
        let archived_at = chrono::Utc::now().timestamp();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r"
                INSERT OR REPLACE INTO assets
                    (asset_key, asset_id, asset_type, device_uuid, removed, timestamp, document, archived_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )?;

            for asset in assets {
                let document = serde_json::to_string(asset)?;
                stmt.execute((
                    asset.key().as_str(),
                    &asset.asset_id,
                    &asset.asset_type,
                    asset.device_uuid.as_deref(),
                    asset.removed,
                    asset.timestamp.to_rfc3339(),
                    document,
                    archived_at,
                ))?;
            }
        }
        tx.commit()?;

        Ok(assets.len())
    }

    /// Look up an archived asset by its identifier.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the stored document is corrupt.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn get_asset(&self, asset_id: &str) -> Result<Option<Asset>, ArchiveError> {
        let key = AssetKey::from_asset_id(asset_id);
        let document: Option<String> = self
            .conn
            .query_row(
                "SELECT document FROM assets WHERE asset_key = ?1",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        document
            .map(|document| serde_json::from_str(&document).map_err(ArchiveError::from))
            .transpose()
    }

    /// Number of archived assets.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn count(&self) -> Result<u64, ArchiveError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

/// Asset archive errors.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Database error
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Asset document (de)serialization error
    #[error("asset document: {0}")]
    Json(#[from] serde_json::Error),
}
