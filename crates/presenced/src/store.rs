use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use presence_core::{Embedding, Reference, DESCRIPTOR_DIM};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const DESCRIPTOR_BYTE_LEN: usize = DESCRIPTOR_DIM * 4;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed — key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid descriptor dimension: {0} (expected 128)")]
    InvalidDescriptorDim(usize),
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidDescriptorValue,
    #[error("enrollment {0} has neither a descriptor nor a photo")]
    EmptyEnrollment(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed enrollment storage with AES-256-GCM descriptor
/// encryption.
///
/// An enrollment holds either a 128-dim face descriptor (encrypted at
/// rest) or a reference photo URL for the external comparison service.
/// A per-installation 32-byte key is generated at first use and stored
/// at `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct EnrollmentStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl EnrollmentStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/presence"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS enrollments (
                     id TEXT PRIMARY KEY,
                     user TEXT NOT NULL,
                     label TEXT NOT NULL,
                     descriptor BLOB,
                     photo_url TEXT,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_enrollments_user ON enrollments(user);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Insert a descriptor enrollment. Returns the generated UUID.
    pub async fn insert_descriptor(
        &self,
        user: &str,
        label: &str,
        descriptor: &Embedding,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();

        // Encrypt before entering the SQLite closure
        let blob = self.encrypt_descriptor(&descriptor.values)?;

        let id_clone = id.clone();
        let user = user.to_string();
        let label = label.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO enrollments (id, user, label, descriptor, photo_url, created_at)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
                    rusqlite::params![id_clone, user, label, blob, created_at],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Insert a reference-photo enrollment. Returns the generated UUID.
    pub async fn insert_photo(
        &self,
        user: &str,
        label: &str,
        photo_url: &str,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();

        let id_clone = id.clone();
        let user = user.to_string();
        let label = label.to_string();
        let photo_url = photo_url.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO enrollments (id, user, label, descriptor, photo_url, created_at)
                     VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
                    rusqlite::params![id_clone, user, label, photo_url, created_at],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// The reference the matcher compares against: the user's most
    /// recent enrollment, as a descriptor or a photo URL.
    pub async fn reference_for_user(&self, user: &str) -> Result<Option<Reference>, StoreError> {
        let user = user.to_string();

        let row: Option<(String, Option<Vec<u8>>, Option<String>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, descriptor, photo_url FROM enrollments
                     WHERE user = ?1 ORDER BY created_at DESC LIMIT 1",
                )?;
                let mut rows = stmt.query_map([&user], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })?;
                Ok(rows.next().transpose()?)
            })
            .await?;

        match row {
            None => Ok(None),
            Some((_, Some(blob), _)) => {
                let values = self.decrypt_descriptor(&blob)?;
                Ok(Some(Reference::Descriptor(Embedding::new(values))))
            }
            Some((_, None, Some(url))) => Ok(Some(Reference::ImageUrl(url))),
            Some((id, None, None)) => Err(StoreError::EmptyEnrollment(id)),
        }
    }

    /// List enrollments for a user (metadata only, no biometric data).
    pub async fn list_by_user(&self, user: &str) -> Result<Vec<EnrollmentInfo>, StoreError> {
        let user = user.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, label, descriptor IS NOT NULL, created_at
                     FROM enrollments WHERE user = ?1 ORDER BY created_at",
                )?;
                let rows = stmt.query_map([&user], |row| {
                    let has_descriptor: bool = row.get(2)?;
                    Ok(EnrollmentInfo {
                        id: row.get(0)?,
                        label: row.get(1)?,
                        kind: if has_descriptor {
                            "descriptor"
                        } else {
                            "photo"
                        }
                        .to_string(),
                        created_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove an enrollment by ID, scoped to a user for cross-user
    /// protection.
    pub async fn remove(&self, user: &str, enrollment_id: &str) -> Result<bool, StoreError> {
        let user = user.to_string();
        let enrollment_id = enrollment_id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "DELETE FROM enrollments WHERE id = ?1 AND user = ?2",
                    [&enrollment_id, &user],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count total enrollments across all users.
    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM enrollments", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt descriptor values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_descriptor(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_descriptor_values(values)?;
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

    /// Decrypt a descriptor blob (12-byte nonce + ciphertext + GCM tag).
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

    let mut values = Vec::with_capacity(DESCRIPTOR_DIM);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidDescriptorValue);
        }
        values.push(v);
    }

    Ok(values)
}

fn validate_descriptor_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != DESCRIPTOR_DIM {
        return Err(StoreError::InvalidDescriptorDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidDescriptorValue);
    }
    Ok(())
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about one enrollment (no biometric payload).
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnrollmentInfo {
    pub id: String,
    pub label: String,
    pub kind: String,
    pub created_at: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
