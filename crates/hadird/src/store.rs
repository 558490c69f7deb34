use std::path::Path;

use hadir_core::{AttendanceRecord, Descriptor, EnrolledIdentity, DESCRIPTOR_DIM, STATUS_PRESENT};
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const DESCRIPTOR_BYTE_LEN: usize = DESCRIPTOR_DIM * 4;
const HISTORY_LIMIT: u32 = 100;
const RECENT_LIMIT: u32 = 5;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("label '{0}' is already registered")]
    DuplicateLabel(String),
    #[error("{0} must not be empty")]
    MissingField(&'static str),
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid stored descriptor: {0}")]
    InvalidDescriptor(#[from] hadir_core::DescriptorError),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed attendance store with AES-256-GCM descriptor encryption.
///
/// Face descriptors are biometric data: they are encrypted before storage
/// and decrypted on retrieval. A per-installation 32-byte key is generated
/// at first use and stored at `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct AttendanceDb {
    conn: Connection,
    enc_key: [u8; 32],
}

impl AttendanceDb {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            // Ensure parent directory exists
            let parent = db_path.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(parent).ok();
            load_or_generate_key(&parent.join(".key"))?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS users (
                     id TEXT PRIMARY KEY,
                     label TEXT NOT NULL UNIQUE,
                     name TEXT NOT NULL,
                     descriptor BLOB NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS attendance (
                     id TEXT PRIMARY KEY,
                     label TEXT NOT NULL,
                     name TEXT NOT NULL,
                     weekday TEXT NOT NULL,
                     date TEXT NOT NULL,
                     time TEXT NOT NULL,
                     status TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_label ON attendance(label);
                 CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Enroll a new person. Returns the generated UUID.
    pub async fn register(
        &self,
        label: &str,
        name: &str,
        descriptor: &Descriptor,
    ) -> Result<String, StoreError> {
        let label = label.trim().to_string();
        let name = name.trim().to_string();
        if label.is_empty() {
            return Err(StoreError::MissingField("label"));
        }
        if name.is_empty() {
            return Err(StoreError::MissingField("name"));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();

        // Encrypt before entering the SQLite closure
        let blob = self.encrypt_descriptor(descriptor.values())?;

        let id_clone = id.clone();
        let label_clone = label.clone();

        let inserted = self
            .conn
            .call(move |conn| {
                match conn.execute(
                    "INSERT INTO users (id, label, name, descriptor, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id_clone, label_clone, name, blob, created_at],
                ) {
                    Ok(_) => Ok(true),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if !inserted {
            return Err(StoreError::DuplicateLabel(label));
        }
        Ok(id)
    }

    /// All enrolled identities in enrollment order (the matcher gallery).
    pub async fn enrolled_identities(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let rows: Vec<(String, String, Vec<u8>)> = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT label, name, descriptor FROM users ORDER BY rowid")?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut identities = Vec::with_capacity(rows.len());
        for (label, name, blob) in rows {
            let values = self.decrypt_descriptor(&blob)?;
            identities.push(EnrolledIdentity {
                label,
                name,
                descriptor: Descriptor::new(values)?,
            });
        }
        Ok(identities)
    }

    /// Registered users (metadata only, no descriptors), ordered by name.
    pub async fn list_users(&self) -> Result<Vec<UserInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, label, name, created_at FROM users ORDER BY name, label",
                )?;
                let rows = stmt.query_map([], user_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Record one attendance event stamped with the local date and time.
    pub async fn record_attendance(
        &self,
        identity: &EnrolledIdentity,
    ) -> Result<AttendanceRecord, StoreError> {
        let now = chrono::Local::now();
        let record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            label: identity.label.clone(),
            name: identity.name.clone(),
            weekday: now.format("%A").to_string(),
            date: now.format("%Y-%m-%d").to_string(),
            time: now.format("%H:%M:%S").to_string(),
            status: STATUS_PRESENT.to_string(),
            created_at: now.with_timezone(&chrono::Utc).to_rfc3339(),
        };

        let row = record.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (id, label, name, weekday, date, time, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        row.id,
                        row.label,
                        row.name,
                        row.weekday,
                        row.date,
                        row.time,
                        row.status,
                        row.created_at
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(record)
    }

    /// Attendance history for one label, newest first.
    pub async fn history(&self, label: &str) -> Result<UserHistory, StoreError> {
        let label = label.to_string();
        self.conn
            .call(move |conn| {
                let user = conn
                    .query_row(
                        "SELECT id, label, name, created_at FROM users WHERE label = ?1",
                        [&label],
                        user_from_row,
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        e => Err(e),
                    })?;

                let mut stmt = conn.prepare(
                    "SELECT id, label, name, weekday, date, time, status, created_at
                     FROM attendance WHERE label = ?1
                     ORDER BY date DESC, time DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![label, HISTORY_LIMIT], record_from_row)?;
                let attendance = rows.collect::<Result<Vec<_>, _>>()?;

                Ok(UserHistory {
                    label,
                    user,
                    attendance,
                })
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove a registered user by ID. Attendance history is kept.
    pub async fn remove_user(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM users WHERE id = ?1", [&id])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_users(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Totals plus the most recent attendance events.
    pub async fn stats(&self) -> Result<Stats, StoreError> {
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        self.conn
            .call(move |conn| {
                let total_users: u64 =
                    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
                let total_attendance: u64 =
                    conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
                let today_attendance: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE date = ?1",
                    [&today],
                    |row| row.get(0),
                )?;

                let mut stmt = conn.prepare(
                    "SELECT id, label, name, weekday, date, time, status, created_at
                     FROM attendance ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map([RECENT_LIMIT], record_from_row)?;
                let recent = rows.collect::<Result<Vec<_>, _>>()?;

                Ok(Stats {
                    total_users,
                    total_attendance,
                    today_attendance,
                    recent,
                })
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt descriptor values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_descriptor(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        let plaintext = descriptor_to_bytes(values);

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_descriptor(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        const NONCE_LEN: usize = 12;

        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_descriptor(&plaintext)
    }
}

impl hadir_core::AttendanceStore for AttendanceDb {
    type Error = StoreError;

    async fn fetch_enrolled_identities(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        self.enrolled_identities().await
    }

    async fn commit(&self, identity: &EnrolledIdentity) -> Result<AttendanceRecord, StoreError> {
        self.record_attendance(identity).await
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn descriptor_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_descriptor(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != DESCRIPTOR_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserInfo> {
    Ok(UserInfo {
        id: row.get(0)?,
        label: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        label: row.get(1)?,
        name: row.get(2)?,
        weekday: row.get(3)?,
        date: row.get(4)?,
        time: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
    })
}

// ── Public types ──────────────────────────────────────────────────────────────

/// A registered user (no descriptor data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserInfo {
    pub id: String,
    pub label: String,
    pub name: String,
    pub created_at: String,
}

/// Attendance history for one label.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserHistory {
    pub label: String,
    /// `None` when the label is no longer registered.
    pub user: Option<UserInfo>,
    pub attendance: Vec<AttendanceRecord>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Stats {
    pub total_users: u64,
    pub total_attendance: u64,
    pub today_attendance: u64,
    pub recent: Vec<AttendanceRecord>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
