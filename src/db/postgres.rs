use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use super::{
    merge_codes, run_migrations, without_banned, StoreError, VoucherRecord, VoucherStore,
};
use crate::models::voucher::VoucherCode;
use crate::services::ban_list::BanList;

/// `vouchers` table keyed by the normalized image key.
pub struct PgVoucherStore {
    pool: PgPool,
    ban_list: Arc<BanList>,
}

impl PgVoucherStore {
    pub fn new(pool: PgPool, ban_list: Arc<BanList>) -> Self {
        Self { pool, ban_list }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn record_from_row(row: &PgRow) -> Result<VoucherRecord, StoreError> {
    let key: String = row.try_get("image_key")?;
    let raw: Vec<String> = row.try_get("codes")?;
    let codes = raw
        .into_iter()
        .map(VoucherCode::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(VoucherRecord {
        key,
        codes,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl VoucherStore for PgVoucherStore {
    async fn create_if_absent(&self) -> Result<(), StoreError> {
        run_migrations(&self.pool).await
    }

    async fn read_by_key(&self, key: &str) -> Result<Option<VoucherRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT image_key, codes, created_at, updated_at
            FROM vouchers
            WHERE image_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let banned = self.ban_list.snapshot();
        Ok(row
            .as_ref()
            .map(record_from_row)
            .transpose()?
            .map(|record| without_banned(record, &banned)))
    }

    async fn upsert(&self, key: &str, codes: &[VoucherCode]) -> Result<VoucherRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Make sure a row exists so FOR UPDATE has something to lock.
        sqlx::query(
            r#"
            INSERT INTO vouchers (image_key, codes)
            VALUES ($1, '{}')
            ON CONFLICT (image_key) DO NOTHING
            "#,
        )
        .bind(key)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT image_key, codes, created_at, updated_at
            FROM vouchers
            WHERE image_key = $1
            FOR UPDATE
            "#,
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;
        let mut record = record_from_row(&row)?;

        let banned = self.ban_list.snapshot();
        let added = merge_codes(&mut record.codes, codes, &banned);
        let stored: Vec<String> = record.codes.iter().map(|c| c.as_str().to_string()).collect();

        let row = sqlx::query(
            r#"
            UPDATE vouchers
            SET codes = $2, updated_at = NOW()
            WHERE image_key = $1
            RETURNING image_key, codes, created_at, updated_at
            "#,
        )
        .bind(key)
        .bind(&stored)
        .fetch_one(&mut *tx)
        .await?;
        let record = record_from_row(&row)?;

        tx.commit().await?;
        debug!(key = %key, added, total = record.codes.len(), "Stored voucher record");
        Ok(without_banned(record, &banned))
    }

    async fn list_all(&self) -> Result<Vec<VoucherRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT image_key, codes, created_at, updated_at
            FROM vouchers
            ORDER BY image_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let banned = self.ban_list.snapshot();
        rows.iter()
            .map(|row| record_from_row(row).map(|record| without_banned(record, &banned)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_pool;

    #[tokio::test]
    #[ignore] // Requires PostgreSQL at DATABASE_URL
    async fn test_upsert_merges_in_postgres() {
        dotenvy::dotenv().ok();
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = init_pool(&url).await.unwrap();
        let store = PgVoucherStore::new(pool, Arc::new(BanList::from_codes(["1234123412341234"])));
        store.create_if_absent().await.unwrap();

        let key = format!("test/{}.png", uuid::Uuid::new_v4());
        let first = VoucherCode::parse("1111222233334444").unwrap();
        let second = VoucherCode::parse("5555666677778888").unwrap();
        let banned = VoucherCode::parse("1234123412341234").unwrap();

        store.upsert(&key, &[first.clone()]).await.unwrap();
        let record = store.upsert(&key, &[second.clone(), banned, first.clone()]).await.unwrap();
        assert_eq!(record.codes, [first, second]);

        let read = store.read_by_key(&key).await.unwrap().unwrap();
        assert_eq!(read.codes.len(), 2);

        sqlx::query("DELETE FROM vouchers WHERE image_key = $1")
            .bind(&key)
            .execute(store.pool())
            .await
            .unwrap();
    }
}
