//! src/services/blob_store.rs
//!
//! Blob store for job results. `DiskBlobStore` keeps payload metadata in
//! SQLite and payload bytes on local disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`.

use crate::{
    models::blob::{BlobLocation, BlobObject},
    services::clock::Clock,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::Duration;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("download URL signing key rejected")]
    SigningKey,
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Abstract blob store consumed by the export manager.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write (or overwrite) an object.
    async fn put(&self, location: &BlobLocation, key: &str, data: Bytes) -> BlobResult<BlobObject>;

    /// Read an object; `None` when it does not exist.
    async fn get(&self, location: &BlobLocation, key: &str) -> BlobResult<Option<Bytes>>;

    /// Remove an object. Removing a missing object is not an error.
    async fn delete(&self, location: &BlobLocation, key: &str) -> BlobResult<()>;

    /// Time-limited URL a client can fetch the object from.
    async fn issue_download_url(&self, location: &BlobLocation, key: &str) -> BlobResult<String>;

    /// Cheap write/read/delete round trip for readiness checks.
    async fn probe(&self) -> BlobResult<()>;
}

type HmacSha256 = Hmac<Sha256>;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const SUPPORTED_REGIONS: [&str; 9] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-southeast-1",
    "ap-northeast-1",
];

#[derive(Clone)]
pub struct DiskBlobStore {
    /// Shared SQLite pool holding the `blobs` metadata table.
    db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    base_path: PathBuf,

    /// Prefix of issued download URLs.
    public_url: String,

    url_lease: Duration,

    /// Key of the HMAC carried by download URLs.
    url_secret: Vec<u8>,

    clock: Arc<dyn Clock>,
}

impl DiskBlobStore {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        public_url: impl Into<String>,
        url_lease: Duration,
        url_secret: impl AsRef<[u8]>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let public_url: String = public_url.into();
        Self {
            db,
            base_path: base_path.into(),
            public_url: public_url.trim_end_matches('/').to_string(),
            url_lease,
            url_secret: url_secret.as_ref().to_vec(),
            clock,
        }
    }

    /// HMAC-SHA256 over the object, the expiry and the payload etag, so a URL
    /// stops verifying once it expires or the object is overwritten.
    fn url_mac(&self, location: &BlobLocation, key: &str, expires: i64, etag: &str) -> BlobResult<HmacSha256> {
        let mut mac =
            HmacSha256::new_from_slice(&self.url_secret).map_err(|_| BlobError::SigningKey)?;
        mac.update(format!("{}/{}:{}:{}", location.bucket, key, expires, etag).as_bytes());
        Ok(mac)
    }

    /// Check the `X-Expires` / `X-Token` pair of a download URL issued by
    /// this store.
    pub async fn verify_download_token(
        &self,
        location: &BlobLocation,
        key: &str,
        expires: i64,
        token: &str,
    ) -> BlobResult<bool> {
        self.ensure_location(location, key)?;
        if expires <= self.clock.now().timestamp() {
            return Ok(false);
        }
        let Ok(signature) = URL_SAFE_NO_PAD.decode(token) else {
            return Ok(false);
        };
        let Some(meta) = self.fetch_meta(location, key).await? else {
            return Ok(false);
        };
        let mac = self.url_mac(location, key, expires, &meta.etag)?;
        Ok(mac.verify_slice(&signature).is_ok())
    }

    /// Reject empty, oversized, absolute or traversing keys.
    fn ensure_key_safe(&self, key: &str) -> BlobResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key.bytes().any(|b| b.is_ascii_control() || b == b'\\');
        if invalid {
            return Err(BlobError::InvalidObjectKey(key.to_string()));
        }
        Ok(())
    }

    /// S3-style bucket names: 3–63 lowercase letters, digits, dots and
    /// hyphens, starting and ending alphanumeric, never an IPv4 address.
    fn ensure_bucket_name_safe(&self, name: &str) -> BlobResult<()> {
        let reject = |reason: &str| {
            Err(BlobError::InvalidBucketName {
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };

        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&name.len()) {
            return reject("must be between 3 and 63 characters");
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return reject("allowed characters are lowercase letters, digits, dots, and hyphens");
        }
        if !name.starts_with(|c: char| c.is_ascii_alphanumeric())
            || !name.ends_with(|c: char| c.is_ascii_alphanumeric())
        {
            return reject("must start and end with a lowercase letter or digit");
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return reject("cannot contain consecutive dots or dot-hyphen combinations");
        }
        if is_ipv4_like(name) {
            return reject("must not be formatted like an IP address");
        }
        Ok(())
    }

    fn ensure_region_valid(&self, region: &str) -> BlobResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(BlobError::UnsupportedRegion(region.to_string()))
        }
    }

    fn ensure_location(&self, location: &BlobLocation, key: &str) -> BlobResult<()> {
        self.ensure_bucket_name_safe(&location.bucket)?;
        self.ensure_region_valid(&location.region)?;
        self.ensure_key_safe(key)
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// First two bytes of MD5(bucket/key) as hex; keeps directories small.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_meta(&self, location: &BlobLocation, key: &str) -> BlobResult<Option<BlobObject>> {
        let meta = sqlx::query_as::<_, BlobObject>(
            "SELECT bucket, key, region, size_bytes, etag, last_modified
             FROM blobs WHERE bucket = ? AND key = ?",
        )
        .bind(&location.bucket)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(meta)
    }

    /// Write bytes to a temp file, fsync, then rename into place.
    async fn write_payload(&self, file_path: &Path, data: &[u8]) -> BlobResult<()> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, file_path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        Ok(())
    }

    /// Remove empty directories from `start` up to, but excluding, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn put(&self, location: &BlobLocation, key: &str, data: Bytes) -> BlobResult<BlobObject> {
        self.ensure_location(location, key)?;
        let file_path = self.object_path(&location.bucket, key);
        self.write_payload(&file_path, &data).await?;

        let etag = format!("{:x}", md5::compute(&data));
        let insert = sqlx::query_as::<_, BlobObject>(
            r#"
            INSERT INTO blobs (bucket, key, region, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                region = excluded.region,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING bucket, key, region, size_bytes, etag, last_modified
            "#,
        )
        .bind(&location.bucket)
        .bind(key)
        .bind(location.region.to_ascii_lowercase())
        .bind(data.len() as i64)
        .bind(&etag)
        .bind(self.clock.now())
        .fetch_one(&*self.db)
        .await;

        match insert {
            Ok(object) => {
                debug!(bucket = %location.bucket, key, size = data.len(), "stored blob");
                Ok(object)
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(BlobError::Sqlx(err))
            }
        }
    }

    async fn get(&self, location: &BlobLocation, key: &str) -> BlobResult<Option<Bytes>> {
        self.ensure_location(location, key)?;
        if self.fetch_meta(location, key).await?.is_none() {
            return Ok(None);
        }
        match fs::read(self.object_path(&location.bucket, key)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    async fn delete(&self, location: &BlobLocation, key: &str) -> BlobResult<()> {
        self.ensure_location(location, key)?;
        sqlx::query("DELETE FROM blobs WHERE bucket = ? AND key = ?")
            .bind(&location.bucket)
            .bind(key)
            .execute(&*self.db)
            .await?;

        let file_path = self.object_path(&location.bucket, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(BlobError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&location.bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    async fn issue_download_url(&self, location: &BlobLocation, key: &str) -> BlobResult<String> {
        self.ensure_location(location, key)?;
        let etag = self
            .fetch_meta(location, key)
            .await?
            .map(|meta| meta.etag)
            .unwrap_or_default();
        let expires = (self.clock.now() + self.url_lease).timestamp();
        let token = URL_SAFE_NO_PAD.encode(
            self.url_mac(location, key, expires, &etag)?
                .finalize()
                .into_bytes(),
        );
        Ok(format!(
            "{}/{}/{}?X-Expires={}&X-Token={}",
            self.public_url, location.bucket, key, expires, token
        ))
    }

    async fn probe(&self) -> BlobResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read? != b"readyz" {
            return Err(BlobError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, services::clock::ManualClock};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    async fn store() -> (DiskBlobStore, TempDir, Arc<ManualClock>) {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let pool = db::connect_in_memory().await.unwrap();
        let store = DiskBlobStore::new(
            Arc::new(pool),
            dir.path(),
            "https://files.example.com/results/",
            Duration::hours(1),
            "test-secret",
            clock.clone(),
        );
        (store, dir, clock)
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let (store, dir, _clock) = store().await;
        let loc = BlobLocation::new("exports", "us-east-1");

        let meta = store.put(&loc, "r1/1", Bytes::from_static(b"zip-bytes")).await.unwrap();
        assert_eq!(meta.size_bytes, 9);
        assert_eq!(meta.etag, format!("{:x}", md5::compute(b"zip-bytes")));

        let bytes = store.get(&loc, "r1/1").await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"zip-bytes");

        store.delete(&loc, "r1/1").await.unwrap();
        assert!(store.get(&loc, "r1/1").await.unwrap().is_none());
        store.delete(&loc, "r1/1").await.unwrap();

        let bucket_root = dir.path().join("exports");
        let leftovers = std::fs::read_dir(&bucket_root).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn overwrite_replaces_payload() {
        let (store, _dir, _clock) = store().await;
        let loc = BlobLocation::new("exports", "local");
        store.put(&loc, "r1", Bytes::from_static(b"old")).await.unwrap();
        store.put(&loc, "r1", Bytes::from_static(b"newer")).await.unwrap();
        assert_eq!(&store.get(&loc, "r1").await.unwrap().unwrap()[..], b"newer");
    }

    #[tokio::test]
    async fn rejects_bad_locations_and_keys() {
        let (store, _dir, _clock) = store().await;
        let data = Bytes::from_static(b"x");
        assert!(matches!(
            store.put(&BlobLocation::new("Bad_Bucket", "local"), "k", data.clone()).await,
            Err(BlobError::InvalidBucketName { .. })
        ));
        assert!(matches!(
            store.put(&BlobLocation::new("192.168.0.1", "local"), "k", data.clone()).await,
            Err(BlobError::InvalidBucketName { .. })
        ));
        assert!(matches!(
            store.put(&BlobLocation::new("exports", "mars-1"), "k", data.clone()).await,
            Err(BlobError::UnsupportedRegion(_))
        ));
        assert!(matches!(
            store.put(&BlobLocation::new("exports", "local"), "../etc/passwd", data).await,
            Err(BlobError::InvalidObjectKey(_))
        ));
    }

    #[tokio::test]
    async fn download_url_carries_expiry_and_token() {
        let (store, _dir, _clock) = store().await;
        let loc = BlobLocation::new("exports", "local");
        store.put(&loc, "r1/main", Bytes::from_static(b"m")).await.unwrap();

        let url = store.issue_download_url(&loc, "r1/main").await.unwrap();
        let expires = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap().timestamp();
        assert!(url.starts_with(&format!(
            "https://files.example.com/results/exports/r1/main?X-Expires={}&X-Token=",
            expires
        )));
    }

    fn token_of(url: &str) -> (i64, String) {
        let query = url.split_once('?').unwrap().1;
        let mut expires = 0;
        let mut token = String::new();
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("X-Expires", v) => expires = v.parse().unwrap(),
                ("X-Token", v) => token = v.to_string(),
                _ => {}
            }
        }
        (expires, token)
    }

    #[tokio::test]
    async fn download_tokens_need_the_secret() {
        let (store, _dir, clock) = store().await;
        let loc = BlobLocation::new("exports", "local");
        let meta = store.put(&loc, "r1/main", Bytes::from_static(b"m")).await.unwrap();

        let (expires, token) = token_of(&store.issue_download_url(&loc, "r1/main").await.unwrap());
        assert!(store.verify_download_token(&loc, "r1/main", expires, &token).await.unwrap());

        // A token rebuilt from public inputs only, with a far-future expiry.
        let far = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap().timestamp();
        let forged = URL_SAFE_NO_PAD.encode(
            md5::compute(format!("exports/r1/main:{}:{}", far, meta.etag)).0,
        );
        assert!(!store.verify_download_token(&loc, "r1/main", far, &forged).await.unwrap());
        assert!(!store.verify_download_token(&loc, "r1/main", far, &token).await.unwrap());
        assert!(!store.verify_download_token(&loc, "r1/other", expires, &token).await.unwrap());

        let other = DiskBlobStore {
            url_secret: b"another-secret".to_vec(),
            ..store.clone()
        };
        assert!(!other.verify_download_token(&loc, "r1/main", expires, &token).await.unwrap());

        clock.advance(Duration::hours(1));
        assert!(!store.verify_download_token(&loc, "r1/main", expires, &token).await.unwrap());
    }

    #[tokio::test]
    async fn overwriting_invalidates_issued_urls() {
        let (store, _dir, _clock) = store().await;
        let loc = BlobLocation::new("exports", "local");
        store.put(&loc, "r1", Bytes::from_static(b"v1")).await.unwrap();
        let (expires, token) = token_of(&store.issue_download_url(&loc, "r1").await.unwrap());

        store.put(&loc, "r1", Bytes::from_static(b"v2")).await.unwrap();
        assert!(!store.verify_download_token(&loc, "r1", expires, &token).await.unwrap());
    }

    #[tokio::test]
    async fn probe_succeeds_on_writable_dir() {
        let (store, _dir, _clock) = store().await;
        store.probe().await.unwrap();
    }
}
