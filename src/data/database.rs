//! SQLite database operations
//!
//! All local state goes through this module. Every query is parameterized;
//! table names only ever come from [`Collection::table_name`].

use chrono::{DateTime, Utc};
use sqlx::{Pool, QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Map a failed INSERT to `DuplicateKey` when the primary key already exists.
fn map_insert_error(error: sqlx::Error, key: &str) -> AppError {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.is_unique_violation() {
            return AppError::DuplicateKey(key.to_string());
        }
    }
    AppError::Database(error)
}

fn require_row(rows_affected: u64) -> Result<(), AppError> {
    if rows_affected == 0 {
        Err(AppError::NotFound)
    } else {
        Ok(())
    }
}

/// Database connection pool wrapper.
///
/// Constructed once at startup and passed to every reconciler.
/// Call [`Database::close`] before the process exits so the WAL is
/// checkpointed into the main file.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Flush the write-ahead log and close every pooled connection.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<(), AppError> {
        if self.pool.is_closed() {
            return Ok(());
        }

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        self.pool.close().await;

        tracing::info!("Database connection closed");
        Ok(())
    }

    // =========================================================================
    // Cross-collection queries
    // =========================================================================

    /// Check whether any row in `collection` is keyed by `did`
    pub async fn exists(&self, collection: Collection, did: &str) -> Result<bool, AppError> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE did = ?)",
            collection.table_name()
        );
        let exists = sqlx::query_scalar::<_, bool>(&sql)
            .bind(did)
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }

    /// Keys present in `left` but absent from `right`
    ///
    /// # Arguments
    /// * `left` - Collection whose keys are returned
    /// * `right` - Collection the keys are checked against
    /// * `reason` - Only consider `left` rows with this reason
    ///
    /// # Errors
    /// `Validation` if a reason filter is given for a collection without reasons
    pub async fn set_difference(
        &self,
        left: Collection,
        right: Collection,
        reason: Option<BlockReason>,
    ) -> Result<Vec<String>, AppError> {
        if reason.is_some() && !left.has_reason() {
            return Err(AppError::Validation(format!(
                "{} rows have no reason to filter on",
                left.table_name()
            )));
        }

        let mut query_builder = QueryBuilder::<Sqlite>::new("SELECT DISTINCT a.did FROM ");
        query_builder.push(left.table_name());
        query_builder.push(" AS a WHERE NOT EXISTS (SELECT 1 FROM ");
        query_builder.push(right.table_name());
        query_builder.push(" AS b WHERE b.did = a.did)");
        if let Some(reason) = reason {
            query_builder.push(" AND a.reason = ");
            query_builder.push_bind(reason);
        }
        query_builder.push(" ORDER BY a.did");

        let dids = query_builder
            .build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await?;

        Ok(dids)
    }

    // =========================================================================
    // Followers
    // =========================================================================

    /// Insert new follower
    ///
    /// # Errors
    /// `DuplicateKey` if the DID is already present
    pub async fn insert_follower(&self, follower: &Follower) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO followers (did, handle, following_count, block_status, date_last_updated) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&follower.did)
        .bind(&follower.handle)
        .bind(follower.following_count)
        .bind(follower.block_status)
        .bind(follower.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &follower.did))?;

        Ok(())
    }

    /// Update an existing follower
    ///
    /// # Errors
    /// `NotFound` if no row exists for the DID
    pub async fn update_follower(&self, follower: &Follower) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE followers SET handle = ?, following_count = ?, block_status = ?, date_last_updated = ? WHERE did = ?",
        )
        .bind(&follower.handle)
        .bind(follower.following_count)
        .bind(follower.block_status)
        .bind(follower.last_updated)
        .bind(&follower.did)
        .execute(&self.pool)
        .await?;

        require_row(result.rows_affected())
    }

    /// Get follower by DID
    pub async fn get_follower(&self, did: &str) -> Result<Option<Follower>, AppError> {
        let follower = sqlx::query_as::<_, Follower>("SELECT * FROM followers WHERE did = ?")
            .bind(did)
            .fetch_optional(&self.pool)
            .await?;

        Ok(follower)
    }

    /// Get every follower ever observed
    pub async fn get_all_followers(&self) -> Result<Vec<Follower>, AppError> {
        let followers = sqlx::query_as::<_, Follower>("SELECT * FROM followers ORDER BY did")
            .fetch_all(&self.pool)
            .await?;

        Ok(followers)
    }

    // =========================================================================
    // User blocks
    // =========================================================================

    /// Insert new user block
    ///
    /// # Errors
    /// `DuplicateKey` if the DID is already blocked locally
    pub async fn insert_user_block(&self, block: &UserBlock) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO blocks (did, handle, r_key, reason, date_blocked, date_last_updated)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&block.did)
        .bind(&block.handle)
        .bind(&block.rkey)
        .bind(block.reason)
        .bind(block.date_blocked)
        .bind(block.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &block.did))?;

        Ok(())
    }

    /// Update an existing user block
    pub async fn update_user_block(&self, block: &UserBlock) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE blocks SET handle = ?, r_key = ?, reason = ?, date_blocked = ?, date_last_updated = ? WHERE did = ?",
        )
        .bind(&block.handle)
        .bind(&block.rkey)
        .bind(block.reason)
        .bind(block.date_blocked)
        .bind(block.last_updated)
        .bind(&block.did)
        .execute(&self.pool)
        .await?;

        require_row(result.rows_affected())
    }

    /// Get user block by DID
    pub async fn get_user_block(&self, did: &str) -> Result<Option<UserBlock>, AppError> {
        let block = sqlx::query_as::<_, UserBlock>("SELECT * FROM blocks WHERE did = ?")
            .bind(did)
            .fetch_optional(&self.pool)
            .await?;

        Ok(block)
    }

    /// Get all user blocks
    pub async fn get_all_user_blocks(&self) -> Result<Vec<UserBlock>, AppError> {
        let blocks = sqlx::query_as::<_, UserBlock>("SELECT * FROM blocks ORDER BY did")
            .fetch_all(&self.pool)
            .await?;

        Ok(blocks)
    }

    /// Get user blocks carrying any of the given reasons
    pub async fn user_blocks_by_reason(
        &self,
        reasons: &[BlockReason],
    ) -> Result<Vec<UserBlock>, AppError> {
        if reasons.is_empty() {
            return Ok(Vec::new());
        }

        let mut query_builder = QueryBuilder::<Sqlite>::new("SELECT * FROM blocks WHERE reason IN (");
        {
            let mut separated = query_builder.separated(", ");
            for reason in reasons {
                separated.push_bind(*reason);
            }
        }
        query_builder.push(") ORDER BY did");

        let blocks = query_builder
            .build_query_as::<UserBlock>()
            .fetch_all(&self.pool)
            .await?;

        Ok(blocks)
    }

    /// Delete user block
    ///
    /// # Returns
    /// `true` if a row was removed
    pub async fn delete_user_block(&self, did: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM blocks WHERE did = ?")
            .bind(did)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Subscription blocks
    // =========================================================================

    /// Insert a (subscriber, blocked account) pair
    ///
    /// # Errors
    /// `DuplicateKey` if the pair already exists
    pub async fn insert_subscription_block(
        &self,
        block: &SubscriptionBlock,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO subscription_blocks (did, subscribed_did, reason, date_last_updated) VALUES (?, ?, ?, ?)",
        )
        .bind(&block.did)
        .bind(&block.subscribed_did)
        .bind(block.reason)
        .bind(block.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &format!("{}:{}", block.subscribed_did, block.did)))?;

        Ok(())
    }

    /// Refresh the timestamp of an existing pair
    pub async fn update_subscription_block(
        &self,
        block: &SubscriptionBlock,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE subscription_blocks SET reason = ?, date_last_updated = ? WHERE subscribed_did = ? AND did = ?",
        )
        .bind(block.reason)
        .bind(block.last_updated)
        .bind(&block.subscribed_did)
        .bind(&block.did)
        .execute(&self.pool)
        .await?;

        require_row(result.rows_affected())
    }

    /// Get a single pair
    pub async fn get_subscription_block(
        &self,
        subscribed_did: &str,
        did: &str,
    ) -> Result<Option<SubscriptionBlock>, AppError> {
        let block = sqlx::query_as::<_, SubscriptionBlock>(
            "SELECT * FROM subscription_blocks WHERE subscribed_did = ? AND did = ?",
        )
        .bind(subscribed_did)
        .bind(did)
        .fetch_optional(&self.pool)
        .await?;

        Ok(block)
    }

    /// Get the cached block list of one subscription
    pub async fn subscription_blocks_for(
        &self,
        subscribed_did: &str,
    ) -> Result<Vec<SubscriptionBlock>, AppError> {
        let blocks = sqlx::query_as::<_, SubscriptionBlock>(
            "SELECT * FROM subscription_blocks WHERE subscribed_did = ? ORDER BY did",
        )
        .bind(subscribed_did)
        .fetch_all(&self.pool)
        .await?;

        Ok(blocks)
    }

    /// Get every cached pair across all subscriptions
    pub async fn get_all_subscription_blocks(&self) -> Result<Vec<SubscriptionBlock>, AppError> {
        let blocks = sqlx::query_as::<_, SubscriptionBlock>(
            "SELECT * FROM subscription_blocks ORDER BY subscribed_did, did",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(blocks)
    }

    /// Delete a single pair
    pub async fn delete_subscription_block(
        &self,
        subscribed_did: &str,
        did: &str,
    ) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM subscription_blocks WHERE subscribed_did = ? AND did = ?")
                .bind(subscribed_did)
                .bind(did)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Insert new subscription
    pub async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO subscriptions (did, handle, block_count, date_added, date_last_updated) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&subscription.did)
        .bind(&subscription.handle)
        .bind(subscription.block_count)
        .bind(subscription.date_added)
        .bind(subscription.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &subscription.did))?;

        Ok(())
    }

    /// Update an existing subscription
    pub async fn update_subscription(&self, subscription: &Subscription) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET handle = ?, block_count = ?, date_last_updated = ? WHERE did = ?",
        )
        .bind(&subscription.handle)
        .bind(subscription.block_count)
        .bind(subscription.last_updated)
        .bind(&subscription.did)
        .execute(&self.pool)
        .await?;

        require_row(result.rows_affected())
    }

    /// Record the latest observation of a subscription, creating it on first sight
    ///
    /// `date_added` is kept from the first insert.
    pub async fn upsert_subscription(
        &self,
        did: &str,
        handle: &str,
        block_count: i64,
        observed_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (did, handle, block_count, date_added, date_last_updated)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(did) DO UPDATE SET
                handle = excluded.handle,
                block_count = excluded.block_count,
                date_last_updated = excluded.date_last_updated
            "#,
        )
        .bind(did)
        .bind(handle)
        .bind(block_count)
        .bind(observed_at)
        .bind(observed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get subscription by DID
    pub async fn get_subscription(&self, did: &str) -> Result<Option<Subscription>, AppError> {
        let subscription =
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE did = ?")
                .bind(did)
                .fetch_optional(&self.pool)
                .await?;

        Ok(subscription)
    }

    /// Get all subscriptions
    pub async fn get_all_subscriptions(&self) -> Result<Vec<Subscription>, AppError> {
        let subscriptions =
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions ORDER BY did")
                .fetch_all(&self.pool)
                .await?;

        Ok(subscriptions)
    }

    /// Delete subscription bookkeeping for an account no longer subscribed
    pub async fn delete_subscription(&self, did: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE did = ?")
            .bind(did)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
