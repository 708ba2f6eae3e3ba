//! In-memory directory used by reconciler tests
//!
//! Keeps every repository's block records and answers list calls in small
//! pages so pagination is exercised. Writes are recorded for assertions.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::atproto::{
    BLOCK_COLLECTION, BlockRecord, CreatedRecord, DeleteOutcome, DirectoryClient, FollowerView,
    Page, Profile, Session,
};
use crate::error::AppError;

pub const OWNER: &str = "did:plc:owner";
const PAGE_SIZE: usize = 2;

#[derive(Default)]
struct State {
    followers: Vec<FollowerView>,
    profiles: HashMap<String, Profile>,
    handles: HashMap<String, String>,
    repos: HashMap<String, Vec<BlockRecord>>,
    failing_profiles: HashSet<String>,
    rate_limited_profiles: HashSet<String>,
    failing_repos: HashSet<String>,
    delete_status: HashMap<String, u16>,
    malformed_create_uri: bool,
    next_rkey: u32,
    creates: Vec<(String, String)>,
    deletes: Vec<(String, String)>,
}

#[derive(Default)]
pub struct FakeDirectory {
    state: Mutex<State>,
}

fn page<T: Clone>(items: &[T], cursor: Option<String>) -> Page<T> {
    let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
    let end = (start + PAGE_SIZE).min(items.len());
    Page {
        items: items[start.min(end)..end].to_vec(),
        cursor: (end < items.len()).then(|| end.to_string()),
    }
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a follower of the owner with the given follow count
    pub fn add_follower(&self, did: &str, follows: i64) {
        let mut state = self.state.lock().unwrap();
        let handle = handle_of(did);
        state.followers.push(FollowerView {
            did: did.to_string(),
            handle: handle.clone(),
            following_count: None,
        });
        state.profiles.insert(
            did.to_string(),
            Profile {
                did: did.to_string(),
                handle,
                follows_count: Some(follows),
            },
        );
    }

    pub fn set_follows(&self, did: &str, follows: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(profile) = state.profiles.get_mut(did) {
            profile.follows_count = Some(follows);
        }
    }

    pub fn fail_profile(&self, did: &str) {
        self.state.lock().unwrap().failing_profiles.insert(did.to_string());
    }

    /// Answer the next profile fetch for `did` with a rate-limit error
    pub fn rate_limit_profile_once(&self, did: &str) {
        self.state
            .lock()
            .unwrap()
            .rate_limited_profiles
            .insert(did.to_string());
    }

    /// Register an account whose block list can be subscribed to
    pub fn add_account(&self, handle: &str, did: &str) {
        let mut state = self.state.lock().unwrap();
        state.handles.insert(handle.to_string(), did.to_string());
        state.repos.entry(did.to_string()).or_default();
    }

    pub fn forget_handle(&self, handle: &str) {
        self.state.lock().unwrap().handles.remove(handle);
    }

    pub fn fail_repo(&self, did: &str) {
        self.state.lock().unwrap().failing_repos.insert(did.to_string());
    }

    pub fn heal_repo(&self, did: &str) {
        self.state.lock().unwrap().failing_repos.remove(did);
    }

    /// Put a block record for `subject` into `repo` without counting it as a write
    pub fn seed_block(&self, repo: &str, subject: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let record = state.new_record(repo, subject);
        let rkey = record.uri.rsplit('/').next().unwrap_or_default().to_string();
        state.repos.entry(repo.to_string()).or_default().push(record);
        rkey
    }

    /// Remove `subject` from `repo` without counting it as a write
    pub fn unseed_block(&self, repo: &str, subject: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(records) = state.repos.get_mut(repo) {
            records.retain(|record| record.subject != subject);
        }
    }

    pub fn set_delete_status(&self, rkey: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .delete_status
            .insert(rkey.to_string(), status);
    }

    pub fn return_malformed_uris(&self) {
        self.state.lock().unwrap().malformed_create_uri = true;
    }

    pub fn creates(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().creates.clone()
    }

    pub fn deletes(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub fn clear_calls(&self) {
        let mut state = self.state.lock().unwrap();
        state.creates.clear();
        state.deletes.clear();
    }

    pub fn blocked_subjects(&self, repo: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut subjects: Vec<String> = state
            .repos
            .get(repo)
            .map(|records| records.iter().map(|r| r.subject.clone()).collect())
            .unwrap_or_default();
        subjects.sort();
        subjects
    }
}

impl State {
    fn new_record(&mut self, repo: &str, subject: &str) -> BlockRecord {
        self.next_rkey += 1;
        BlockRecord {
            uri: format!("at://{repo}/{BLOCK_COLLECTION}/rk{}", self.next_rkey),
            cid: format!("cid{}", self.next_rkey),
            subject: subject.to_string(),
            created_at: Utc::now(),
        }
    }
}

pub fn handle_of(did: &str) -> String {
    format!("{}.test", did.trim_start_matches("did:plc:"))
}

#[async_trait]
impl DirectoryClient for FakeDirectory {
    async fn authenticate(&self, identifier: &str, password: &str) -> Result<Session, AppError> {
        if password != "secret" {
            return Err(AppError::Unauthorized);
        }
        Ok(Session {
            did: OWNER.to_string(),
            handle: identifier.to_string(),
            access_jwt: "jwt".to_string(),
        })
    }

    async fn resolve_handle(&self, handle: &str) -> Result<String, AppError> {
        let state = self.state.lock().unwrap();
        state.handles.get(handle).cloned().ok_or(AppError::NotFound)
    }

    async fn list_followers_page(
        &self,
        _actor: &str,
        cursor: Option<String>,
    ) -> Result<Page<FollowerView>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(page(&state.followers, cursor))
    }

    async fn get_profile(&self, actor: &str) -> Result<Profile, AppError> {
        let mut state = self.state.lock().unwrap();
        if state.rate_limited_profiles.remove(actor) {
            return Err(AppError::RateLimited);
        }
        if state.failing_profiles.contains(actor) {
            return Err(AppError::Remote {
                status: 400,
                error: "InvalidRequest".to_string(),
                message: "Profile not found".to_string(),
            });
        }
        Ok(state.profiles.get(actor).cloned().unwrap_or_else(|| Profile {
            did: actor.to_string(),
            handle: handle_of(actor),
            follows_count: None,
        }))
    }

    async fn list_blocks_page(
        &self,
        repo: &str,
        cursor: Option<String>,
    ) -> Result<Page<BlockRecord>, AppError> {
        let state = self.state.lock().unwrap();
        if state.failing_repos.contains(repo) {
            return Err(AppError::Remote {
                status: 502,
                error: "UpstreamFailure".to_string(),
                message: "repo unavailable".to_string(),
            });
        }
        let records = state.repos.get(repo).cloned().unwrap_or_default();
        Ok(page(&records, cursor))
    }

    async fn create_block(&self, repo: &str, subject: &str) -> Result<CreatedRecord, AppError> {
        let mut state = self.state.lock().unwrap();
        state.creates.push((repo.to_string(), subject.to_string()));
        let record = state.new_record(repo, subject);
        let uri = if state.malformed_create_uri {
            format!("at://{repo}/{BLOCK_COLLECTION}")
        } else {
            record.uri.clone()
        };
        let created = CreatedRecord {
            uri,
            cid: record.cid.clone(),
        };
        state.repos.entry(repo.to_string()).or_default().push(record);
        Ok(created)
    }

    async fn delete_block(&self, repo: &str, rkey: &str) -> Result<DeleteOutcome, AppError> {
        let mut state = self.state.lock().unwrap();
        state.deletes.push((repo.to_string(), rkey.to_string()));
        let status = state.delete_status.get(rkey).copied().unwrap_or(200);
        if status == 200 {
            let suffix = format!("/{rkey}");
            if let Some(records) = state.repos.get_mut(repo) {
                records.retain(|record| !record.uri.ends_with(&suffix));
            }
        }
        Ok(DeleteOutcome { status })
    }
}
