//! Postgres-backed campaign, cache and category storage.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmap_core::{
    content_hash, CampaignKey, CampaignRecord, Coordinate, ExistingCampaign, PlaceCacheEntry,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Acquire, PgPool};
use tracing::{debug, info, warn};

use crate::store::{CampaignStore, EnrichmentStore, ReplaceOutcome, StoreError};

const INSERT_CAMPAIGN_SQL: &str = "INSERT INTO campaign (\
     platform, title, offer, campaign_channel, source, company, company_link, content_link, \
     campaign_type, region, apply_from, apply_deadline, review_deadline, search_text, \
     address, lat, lng, category_id, img_url, created_at, updated_at\
     ) VALUES (\
     $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, NOW(), NOW()\
     ) RETURNING id";

const KEY_JOIN: &str = "UNNEST($1::text[], $2::text[], $3::text[], $4::text[]) \
     AS k(platform, title, offer, channel)";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .max_lifetime(Duration::from_secs(60 * 60))
            .idle_timeout(Duration::from_secs(30 * 60))
            .connect(database_url)
            .await?;
        info!("database connection established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

struct KeyColumns {
    platforms: Vec<String>,
    titles: Vec<String>,
    offers: Vec<String>,
    channels: Vec<String>,
}

impl KeyColumns {
    fn from_batch(batch: &[CampaignRecord]) -> Self {
        let mut cols = Self {
            platforms: Vec::with_capacity(batch.len()),
            titles: Vec::with_capacity(batch.len()),
            offers: Vec::with_capacity(batch.len()),
            channels: Vec::with_capacity(batch.len()),
        };
        for record in batch {
            cols.platforms.push(record.platform.clone());
            cols.titles.push(record.title.clone());
            cols.offers.push(record.offer.clone());
            cols.channels.push(record.channel.clone());
        }
        cols
    }

    /// One advisory-lock key per distinct composite key, sorted.
    fn lock_keys(&self) -> Vec<String> {
        let mut lock_keys: Vec<String> = (0..self.platforms.len())
            .map(|i| {
                [
                    self.platforms[i].as_str(),
                    self.titles[i].as_str(),
                    self.offers[i].as_str(),
                    self.channels[i].as_str(),
                ]
                .join("\u{1f}")
            })
            .collect();
        lock_keys.sort();
        lock_keys.dedup();
        lock_keys
    }
}

#[async_trait]
impl CampaignStore for PgStore {
    async fn load_existing(&self) -> Result<HashMap<CampaignKey, ExistingCampaign>, StoreError> {
        let rows = sqlx::query_as::<
            _,
            (
                String,
                String,
                String,
                String,
                Option<String>,
                Option<f64>,
                Option<f64>,
                Option<i64>,
            ),
        >(
            "SELECT platform, title, offer, campaign_channel, address, lat, lng, category_id \
             FROM campaign",
        )
        .fetch_all(&self.pool)
        .await?;

        let existing = rows
            .into_iter()
            .map(
                |(platform, title, offer, channel, address, lat, lng, category_id)| {
                    let key = CampaignKey::new(platform, title, offer, channel);
                    let campaign = ExistingCampaign {
                        key: key.clone(),
                        address,
                        lat,
                        lng,
                        category_id,
                    };
                    (key, campaign)
                },
            )
            .collect::<HashMap<_, _>>();
        info!(count = existing.len(), "loaded existing campaigns");
        Ok(existing)
    }

    async fn replace_campaigns(
        &self,
        batch: &[CampaignRecord],
    ) -> Result<ReplaceOutcome, StoreError> {
        if batch.is_empty() {
            warn!("no campaigns to store");
            return Ok(ReplaceOutcome::default());
        }

        let keys = KeyColumns::from_batch(batch);
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent replaces of the same key; sorted to avoid deadlocks.
        for lock_key in keys.lock_keys() {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(&lock_key)
                .execute(&mut *tx)
                .await?;
        }

        let matched = sqlx::query_as::<_, (i64, String, String, String, String)>(&format!(
            "SELECT c.id, c.platform, c.title, c.offer, c.campaign_channel \
             FROM campaign c JOIN {KEY_JOIN} \
             ON c.platform = k.platform AND c.title = k.title \
             AND c.offer = k.offer AND c.campaign_channel = k.channel \
             FOR UPDATE OF c"
        ))
        .bind(&keys.platforms)
        .bind(&keys.titles)
        .bind(&keys.offers)
        .bind(&keys.channels)
        .fetch_all(&mut *tx)
        .await?;

        let mut replaced_ids = Vec::with_capacity(matched.len());
        let mut pre_existing = HashSet::with_capacity(matched.len());
        for (id, platform, title, offer, channel) in matched {
            replaced_ids.push(id);
            pre_existing.insert(CampaignKey::new(platform, title, offer, channel));
        }

        if !replaced_ids.is_empty() {
            let detached = sqlx::query(
                "UPDATE keyword_alerts_alerts SET campaign_id = NULL WHERE campaign_id = ANY($1)",
            )
            .bind(&replaced_ids)
            .execute(&mut *tx)
            .await?;
            debug!(
                alerts = detached.rows_affected(),
                "detached alerts from replaced campaigns"
            );
        }

        // Rows committed by other writers after the lock above are only visible
        // to this statement's snapshot; they count as pre-existing too. Their
        // alerts are detached by the foreign key's ON DELETE SET NULL.
        let deleted = sqlx::query_as::<_, (i64, String, String, String, String)>(&format!(
            "DELETE FROM campaign c USING {KEY_JOIN} \
             WHERE c.platform = k.platform AND c.title = k.title \
             AND c.offer = k.offer AND c.campaign_channel = k.channel \
             RETURNING c.id, c.platform, c.title, c.offer, c.campaign_channel"
        ))
        .bind(&keys.platforms)
        .bind(&keys.titles)
        .bind(&keys.offers)
        .bind(&keys.channels)
        .fetch_all(&mut *tx)
        .await?;
        let deleted_count = deleted.len();
        for (id, platform, title, offer, channel) in deleted {
            if !replaced_ids.contains(&id) {
                debug!(id, "campaign row appeared during replace");
            }
            pre_existing.insert(CampaignKey::new(platform, title, offer, channel));
        }

        let mut inserted = Vec::with_capacity(batch.len());
        let mut failed_rows = 0usize;
        for record in batch {
            let mut savepoint = tx.begin().await?;
            let result = sqlx::query_scalar::<_, i64>(INSERT_CAMPAIGN_SQL)
                .bind(&record.platform)
                .bind(&record.title)
                .bind(&record.offer)
                .bind(&record.channel)
                .bind(&record.source)
                .bind(&record.company)
                .bind(&record.company_link)
                .bind(&record.content_link)
                .bind(&record.campaign_type)
                .bind(&record.region)
                .bind(record.apply_from)
                .bind(record.apply_deadline)
                .bind(record.review_deadline)
                .bind(&record.search_text)
                .bind(&record.address)
                .bind(record.lat)
                .bind(record.lng)
                .bind(record.category_id)
                .bind(&record.img_url)
                .fetch_one(&mut *savepoint)
                .await;

            match result {
                Ok(id) => {
                    savepoint.commit().await?;
                    inserted.push((record.key(), id));
                }
                Err(err) => {
                    warn!(key = %record.key(), error = %err, "campaign insert failed; row skipped");
                    savepoint.rollback().await?;
                    failed_rows += 1;
                }
            }
        }

        tx.commit().await?;

        let outcome = ReplaceOutcome::classify(inserted, &pre_existing, failed_rows);
        info!(
            deleted = deleted_count,
            stored = outcome.stored(),
            new = outcome.new_ids.len(),
            refreshed = outcome.refreshed_ids.len(),
            failed = outcome.failed_rows,
            "campaign batch stored"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl EnrichmentStore for PgStore {
    async fn place_cache(&self, title: &str) -> Result<Option<PlaceCacheEntry>, StoreError> {
        if title.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query_as::<
            _,
            (
                Option<String>,
                Option<f64>,
                Option<f64>,
                Option<String>,
                DateTime<Utc>,
            ),
        >(
            "SELECT address, lat, lng, category, updated_at \
             FROM local_search_cache WHERE title_hash = $1",
        )
        .bind(content_hash(title))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(address, lat, lng, category_text, updated_at)| PlaceCacheEntry {
                address,
                lat,
                lng,
                category_text,
                updated_at,
            },
        ))
    }

    async fn put_place_cache(
        &self,
        title: &str,
        address: &str,
        coordinate: Coordinate,
        category_text: Option<&str>,
    ) -> Result<(), StoreError> {
        if title.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO local_search_cache (title_hash, title, address, lat, lng, category, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, NOW()) \
             ON CONFLICT (title_hash) DO UPDATE SET \
             address = EXCLUDED.address, lat = EXCLUDED.lat, lng = EXCLUDED.lng, \
             category = EXCLUDED.category, updated_at = NOW()",
        )
        .bind(content_hash(title))
        .bind(title)
        .bind(address)
        .bind(coordinate.lat)
        .bind(coordinate.lng)
        .bind(category_text)
        .execute(&self.pool)
        .await?;
        debug!(title, "place cache written");
        Ok(())
    }

    async fn geocode_cache(&self, address: &str) -> Result<Option<Coordinate>, StoreError> {
        if address.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, (f64, f64)>(
            "SELECT lat, lng FROM geocode_cache WHERE address_hash = $1",
        )
        .bind(content_hash(address))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(lat, lng)| Coordinate::new(lat, lng)))
    }

    async fn put_geocode_cache(
        &self,
        address: &str,
        coordinate: Coordinate,
    ) -> Result<(), StoreError> {
        if address.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO geocode_cache (address_hash, address, lat, lng, updated_at) \
             VALUES ($1, $2, $3, $4, NOW()) \
             ON CONFLICT (address_hash) DO UPDATE SET \
             address = EXCLUDED.address, lat = EXCLUDED.lat, lng = EXCLUDED.lng, updated_at = NOW()",
        )
        .bind(content_hash(address))
        .bind(address)
        .bind(coordinate.lat)
        .bind(coordinate.lng)
        .execute(&self.pool)
        .await?;
        debug!(address, "geocode cache written");
        Ok(())
    }

    async fn raw_category_id(&self, raw_text: &str) -> Result<i64, StoreError> {
        const FIND: &str = "SELECT id FROM raw_categories WHERE raw_text = $1";

        if let Some(id) = sqlx::query_scalar::<_, i64>(FIND)
            .bind(raw_text)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(id);
        }

        info!(raw_text, "new raw category");
        let created = sqlx::query_scalar::<_, i64>(
            "INSERT INTO raw_categories (raw_text, created_at) VALUES ($1, NOW()) \
             ON CONFLICT (raw_text) DO NOTHING RETURNING id",
        )
        .bind(raw_text)
        .fetch_optional(&self.pool)
        .await?;

        match created {
            Some(id) => Ok(id),
            // Lost the race to a concurrent insert.
            None => Ok(sqlx::query_scalar::<_, i64>(FIND)
                .bind(raw_text)
                .fetch_one(&self.pool)
                .await?),
        }
    }

    async fn mapped_category_id(&self, raw_category_id: i64) -> Result<Option<i64>, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT standard_category_id FROM category_mappings WHERE raw_category_id = $1",
        )
        .bind(raw_category_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str, channel: &str) -> CampaignRecord {
        CampaignRecord {
            platform: "p".into(),
            title: title.into(),
            offer: "o".into(),
            channel: channel.into(),
            ..Default::default()
        }
    }

    #[test]
    fn lock_keys_are_sorted_and_distinct() {
        let keys = KeyColumns::from_batch(&[
            record("b", "blog"),
            record("a", "blog"),
            record("b", "blog"),
            record("a", "reels"),
        ]);
        let lock_keys = keys.lock_keys();
        assert_eq!(lock_keys.len(), 3);
        assert!(lock_keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(lock_keys[0], "p\u{1f}a\u{1f}o\u{1f}blog");
    }
}
