//! XRPC implementation of the directory client
//!
//! Talks to the account's service (PDS or entryway) over HTTP with reqwest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

use super::client::{
    BlockRecord, CreatedRecord, DeleteOutcome, DirectoryClient, FollowerView, Profile, Session,
};
use super::pagination::Page;
use super::rate_limit::RateLimiter;
use super::BLOCK_COLLECTION;
use crate::config::AtprotoConfig;
use crate::error::AppError;

const PAGE_LIMIT: &str = "100";
const READ_BUCKET: &str = "read";
const WRITE_BUCKET: &str = "write";

// =============================================================================
// Wire types
// =============================================================================

#[derive(Serialize)]
struct CreateSessionInput<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct CreateSessionOutput {
    did: String,
    handle: String,
    #[serde(rename = "accessJwt")]
    access_jwt: String,
}

#[derive(Deserialize)]
struct ResolveHandleOutput {
    did: String,
}

#[derive(Deserialize)]
struct ProfileView {
    did: String,
    handle: String,
    #[serde(rename = "followsCount", default)]
    follows_count: Option<i64>,
}

#[derive(Deserialize)]
struct GetFollowersOutput {
    followers: Vec<ProfileView>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct ListRecordsOutput {
    records: Vec<RecordView>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct RecordView {
    uri: String,
    cid: String,
    value: BlockValue,
}

#[derive(Deserialize)]
struct BlockValue {
    #[serde(default)]
    subject: Option<String>,
    #[serde(rename = "createdAt", default)]
    created_at: Option<String>,
}

#[derive(Serialize)]
struct BlockRecordValue<'a> {
    #[serde(rename = "$type")]
    record_type: &'a str,
    subject: &'a str,
    #[serde(rename = "createdAt")]
    created_at: String,
}

#[derive(Serialize)]
struct CreateRecordInput<'a> {
    repo: &'a str,
    collection: &'a str,
    record: BlockRecordValue<'a>,
}

#[derive(Deserialize)]
struct CreateRecordOutput {
    uri: String,
    cid: String,
}

#[derive(Serialize)]
struct DeleteRecordInput<'a> {
    repo: &'a str,
    collection: &'a str,
    rkey: &'a str,
}

#[derive(Deserialize, Default)]
struct XrpcErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

fn parse_created_at(uri: &str, raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(|| {
            tracing::warn!(%uri, created_at = ?raw, "Block record has no valid createdAt, using now");
            Utc::now()
        })
}

/// Turn a non-success response into an error
async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status.as_u16() {
        401 => Err(AppError::Unauthorized),
        429 => Err(AppError::RateLimited),
        code => {
            let body: XrpcErrorBody = response.json().await.unwrap_or_default();
            if matches!(body.error.as_str(), "ExpiredToken" | "InvalidToken") {
                return Err(AppError::Unauthorized);
            }
            Err(AppError::Remote {
                status: code,
                error: body.error,
                message: body.message,
            })
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// XRPC directory client
pub struct XrpcClient {
    http: reqwest::Client,
    /// Service base URL, always ending in '/'
    base_url: Url,
    session: RwLock<Option<Session>>,
    rate_limiter: RateLimiter,
}

impl XrpcClient {
    /// Create a client for the configured service
    ///
    /// # Errors
    /// `Config` if the service URL is invalid
    pub fn new(config: &AtprotoConfig) -> Result<Self, AppError> {
        let mut base_url = Url::parse(&config.service_url)
            .map_err(|e| AppError::Config(format!("invalid atproto.service_url: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("Sunblock/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            http,
            base_url,
            session: RwLock::new(None),
            rate_limiter: RateLimiter::new(
                config.rate_limit.max_requests,
                Duration::from_secs(config.rate_limit.window_seconds),
            ),
        })
    }

    fn endpoint(&self, nsid: &str) -> Result<Url, AppError> {
        self.base_url
            .join(&format!("xrpc/{nsid}"))
            .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid XRPC endpoint {nsid}: {e}")))
    }

    async fn access_token(&self) -> Result<String, AppError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.access_jwt.clone())
            .ok_or(AppError::Unauthorized)
    }

    async fn query<T: DeserializeOwned>(
        &self,
        nsid: &str,
        params: &[(&str, &str)],
    ) -> Result<T, AppError> {
        let url = self.endpoint(nsid)?;
        let token = self.access_token().await?;
        self.rate_limiter.acquire(READ_BUCKET).await;

        tracing::trace!(%url, "XRPC query");
        let response = self
            .http
            .get(url)
            .query(params)
            .bearer_auth(token)
            .send()
            .await?;

        Ok(error_for_status(response).await?.json().await?)
    }

    async fn procedure<B: Serialize>(
        &self,
        nsid: &str,
        body: &B,
    ) -> Result<reqwest::Response, AppError> {
        let url = self.endpoint(nsid)?;
        let token = self.access_token().await?;
        self.rate_limiter.acquire(WRITE_BUCKET).await;

        tracing::trace!(%url, "XRPC procedure");
        let response = self
            .http
            .post(url)
            .json(body)
            .bearer_auth(token)
            .send()
            .await?;

        Ok(response)
    }
}

#[async_trait]
impl DirectoryClient for XrpcClient {
    async fn authenticate(&self, identifier: &str, password: &str) -> Result<Session, AppError> {
        let url = self.endpoint("com.atproto.server.createSession")?;
        self.rate_limiter.acquire(WRITE_BUCKET).await;

        let response = self
            .http
            .post(url)
            .json(&CreateSessionInput {
                identifier,
                password,
            })
            .send()
            .await?;

        let output: CreateSessionOutput = match error_for_status(response).await {
            Ok(response) => response.json().await?,
            // Bad credentials come back as 401 AuthenticationRequired
            Err(AppError::Remote { status, message, .. }) if status == 400 || status == 401 => {
                tracing::error!(status, %message, "Login rejected");
                return Err(AppError::Unauthorized);
            }
            Err(error) => return Err(error),
        };

        let session = Session {
            did: output.did,
            handle: output.handle,
            access_jwt: output.access_jwt,
        };
        *self.session.write().await = Some(session.clone());

        tracing::info!(did = %session.did, handle = %session.handle, "Session created");
        Ok(session)
    }

    async fn resolve_handle(&self, handle: &str) -> Result<String, AppError> {
        match self
            .query::<ResolveHandleOutput>(
                "com.atproto.identity.resolveHandle",
                &[("handle", handle)],
            )
            .await
        {
            Ok(output) => Ok(output.did),
            Err(AppError::Remote { status, .. }) if status == 400 || status == 404 => {
                Err(AppError::NotFound)
            }
            Err(error) => Err(error),
        }
    }

    async fn list_followers_page(
        &self,
        actor: &str,
        cursor: Option<String>,
    ) -> Result<Page<FollowerView>, AppError> {
        let mut params = vec![("actor", actor), ("limit", PAGE_LIMIT)];
        if let Some(cursor) = cursor.as_deref() {
            params.push(("cursor", cursor));
        }

        let output: GetFollowersOutput = self.query("app.bsky.graph.getFollowers", &params).await?;

        Ok(Page {
            items: output
                .followers
                .into_iter()
                .map(|view| FollowerView {
                    did: view.did,
                    handle: view.handle,
                    following_count: view.follows_count,
                })
                .collect(),
            cursor: output.cursor,
        })
    }

    async fn get_profile(&self, actor: &str) -> Result<Profile, AppError> {
        let view: ProfileView = self
            .query("app.bsky.actor.getProfile", &[("actor", actor)])
            .await?;

        Ok(Profile {
            did: view.did,
            handle: view.handle,
            follows_count: view.follows_count,
        })
    }

    async fn list_blocks_page(
        &self,
        repo: &str,
        cursor: Option<String>,
    ) -> Result<Page<BlockRecord>, AppError> {
        let mut params = vec![
            ("repo", repo),
            ("collection", BLOCK_COLLECTION),
            ("limit", PAGE_LIMIT),
        ];
        if let Some(cursor) = cursor.as_deref() {
            params.push(("cursor", cursor));
        }

        let output: ListRecordsOutput = self.query("com.atproto.repo.listRecords", &params).await?;

        let items = output
            .records
            .into_iter()
            .filter_map(|record| {
                let Some(subject) = record.value.subject else {
                    tracing::warn!(uri = %record.uri, "Block record without subject, skipping");
                    return None;
                };
                let created_at = parse_created_at(&record.uri, record.value.created_at.as_deref());
                Some(BlockRecord {
                    uri: record.uri,
                    cid: record.cid,
                    subject,
                    created_at,
                })
            })
            .collect();

        Ok(Page {
            items,
            cursor: output.cursor,
        })
    }

    async fn create_block(&self, repo: &str, subject: &str) -> Result<CreatedRecord, AppError> {
        let input = CreateRecordInput {
            repo,
            collection: BLOCK_COLLECTION,
            record: BlockRecordValue {
                record_type: BLOCK_COLLECTION,
                subject,
                created_at: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            },
        };

        let response = self
            .procedure("com.atproto.repo.createRecord", &input)
            .await?;
        let output: CreateRecordOutput = error_for_status(response).await?.json().await?;

        Ok(CreatedRecord {
            uri: output.uri,
            cid: output.cid,
        })
    }

    async fn delete_block(&self, repo: &str, rkey: &str) -> Result<DeleteOutcome, AppError> {
        let input = DeleteRecordInput {
            repo,
            collection: BLOCK_COLLECTION,
            rkey,
        };

        let response = self
            .procedure("com.atproto.repo.deleteRecord", &input)
            .await?;
        let status = response.status().as_u16();

        match status {
            401 => Err(AppError::Unauthorized),
            429 => Err(AppError::RateLimited),
            _ => {
                if !response.status().is_success() {
                    let body: XrpcErrorBody = response.json().await.unwrap_or_default();
                    tracing::warn!(
                        status,
                        error = %body.error,
                        message = %body.message,
                        %rkey,
                        "deleteRecord did not succeed"
                    );
                }
                Ok(DeleteOutcome { status })
            }
        }
    }
}
