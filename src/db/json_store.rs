use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{merge_codes, without_banned, StoreError, VoucherRecord, VoucherStore};
use crate::models::voucher::VoucherCode;
use crate::services::ban_list::BanList;
use crate::services::imaging::{discard_file_async, partial_path};

/// One JSON document per key, named by the MD5 of the key.
pub struct JsonVoucherStore {
    dir: PathBuf,
    ban_list: Arc<BanList>,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonVoucherStore {
    pub fn new(dir: impl Into<PathBuf>, ban_list: Arc<BanList>) -> Self {
        Self {
            dir: dir.into(),
            ban_list,
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{:x}.json", md5::compute(key.as_bytes())))
    }

    async fn read_path(&self, path: &Path) -> Result<Option<VoucherRecord>, StoreError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Record exactly as written, including codes banned since.
    async fn read_stored(&self, key: &str) -> Result<Option<VoucherRecord>, StoreError> {
        match self.read_path(&self.record_path(key)).await? {
            Some(record) if record.key != key => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: "record belongs to a different key".to_string(),
            }),
            other => Ok(other),
        }
    }

    async fn write_record(&self, record: &VoucherRecord) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(&record.key);
        let tmp = partial_path(&path);
        let body = serde_json::to_vec_pretty(record)?;

        if let Err(e) = tokio::fs::write(&tmp, &body).await {
            discard_file_async(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            discard_file_async(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl VoucherStore for JsonVoucherStore {
    async fn create_if_absent(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn read_by_key(&self, key: &str) -> Result<Option<VoucherRecord>, StoreError> {
        let banned = self.ban_list.snapshot();
        Ok(self
            .read_stored(key)
            .await?
            .map(|record| without_banned(record, &banned)))
    }

    async fn upsert(&self, key: &str, codes: &[VoucherCode]) -> Result<VoucherRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let mut record = self.read_stored(key).await?.unwrap_or_else(|| VoucherRecord {
            key: key.to_string(),
            codes: Vec::new(),
            created_at: now,
            updated_at: now,
        });

        let banned = self.ban_list.snapshot();
        let added = merge_codes(&mut record.codes, codes, &banned);
        record.updated_at = now;
        self.write_record(&record).await?;

        debug!(key = %key, added, total = record.codes.len(), "Stored voucher record");
        Ok(without_banned(record, &banned))
    }

    async fn list_all(&self) -> Result<Vec<VoucherRecord>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let banned = self.ban_list.snapshot();
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_path(&path).await {
                Ok(Some(record)) => records.push(without_banned(record, &banned)),
                Ok(None) => {}
                Err(e) => warn!(file = ?path.file_name(), error = %e, "Skipping unreadable voucher record"),
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::imaging::is_partial;

    fn code(s: &str) -> VoucherCode {
        VoucherCode::parse(s).unwrap()
    }

    fn store(dir: &Path) -> JsonVoucherStore {
        JsonVoucherStore::new(dir.join("vouchers"), Arc::new(BanList::from_codes(["1234123412341234"])))
    }

    #[tokio::test]
    async fn test_missing_key_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.create_if_absent().await.unwrap();
        assert!(store.read_by_key("tmp/a.png").await.unwrap().is_none());
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_merges_union() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store.upsert("tmp/a.png", &[code("1111222233334444")]).await.unwrap();
        let merged = store
            .upsert(
                "tmp/a.png",
                &[code("5555666677778888"), code("1111222233334444"), code("1234123412341234")],
            )
            .await
            .unwrap();

        assert_eq!(merged.codes, [code("1111222233334444"), code("5555666677778888")]);
        let read = store.read_by_key("tmp/a.png").await.unwrap().unwrap();
        assert_eq!(read, merged);
        assert!(read.created_at <= read.updated_at);
    }

    #[tokio::test]
    async fn test_file_name_is_md5_of_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.upsert("tmp/a.png", &[]).await.unwrap();

        let expected = dir
            .path()
            .join("vouchers")
            .join(format!("{:x}.json", md5::compute(b"tmp/a.png")));
        assert!(expected.exists());
        let leftovers = std::fs::read_dir(expected.parent().unwrap())
            .unwrap()
            .filter(|e| is_partial(&e.as_ref().unwrap().path()))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_keep_every_code() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(dir.path()));
        let codes = ["1000200030004000", "2000300040005000", "3000400050006000", "4000500060007000"];

        let writes = codes.iter().map(|c| {
            let store = store.clone();
            let c = code(c);
            tokio::spawn(async move { store.upsert("same.png", &[c]).await })
        });
        for write in futures::future::join_all(writes).await {
            write.unwrap().unwrap();
        }

        let record = store.read_by_key("same.png").await.unwrap().unwrap();
        assert_eq!(record.codes.len(), 4);
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_codes_banned_after_storing_are_hidden_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .upsert("a.png", &[code("9999000011112222"), code("5555666677778888")])
            .await
            .unwrap();

        store.ban_list.replace(["9999000011112222"]);

        let record = store.read_by_key("a.png").await.unwrap().unwrap();
        assert_eq!(record.codes, [code("5555666677778888")]);
        assert_eq!(store.list_all().await.unwrap()[0].codes, record.codes);
        let returned = store.upsert("a.png", &[]).await.unwrap();
        assert_eq!(returned.codes, record.codes);

        // The record itself is append-only; lifting the ban shows the code again.
        store.ban_list.replace(Vec::<String>::new());
        let record = store.read_by_key("a.png").await.unwrap().unwrap();
        assert_eq!(record.codes, [code("9999000011112222"), code("5555666677778888")]);
    }
}
