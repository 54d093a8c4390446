use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use draw_core::{
    dedup_names, generate_slug, merge_remote, normalize_email, organiser_matches, plan_draw,
    same_name, AssignmentMap, DrawError, DrawPlan, Group, GroupId, Participant,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    Committed,
    /// The row's giftee was set by someone else first; the caller lost the
    /// race and must retry from reconciliation.
    Conflict,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("group not found")]
    GroupNotFound,
    #[error("participant not found")]
    ParticipantNotFound,
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Seam over the hosted row store. Participant rows are keyed by
/// `(group_id, name)`; `assign_giftee_if_unset` is the only conditional
/// write, everything else is last-write-wins.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn create_group(&self, organiser_email: &str) -> Result<GroupId, StoreError>;
    async fn update_organiser_email(
        &self,
        group_id: &str,
        organiser_email: &str,
    ) -> Result<(), StoreError>;
    async fn set_slug(&self, group_id: &str, slug: &str) -> Result<(), StoreError>;
    async fn clear_lock(&self, group_id: &str) -> Result<(), StoreError>;
    async fn get_group(&self, group_id: &str) -> Result<Option<Group>, StoreError>;
    async fn get_group_by_slug(&self, slug: &str) -> Result<Option<Group>, StoreError>;
    async fn replace_participants(
        &self,
        group_id: &str,
        names: &[String],
    ) -> Result<(), StoreError>;
    async fn get_participants(&self, group_id: &str) -> Result<Vec<Participant>, StoreError>;
    async fn update_participant_email(
        &self,
        group_id: &str,
        name: &str,
        email: &str,
    ) -> Result<(), StoreError>;
    async fn assign_giftee_if_unset(
        &self,
        group_id: &str,
        name: &str,
        email: &str,
        giftee: &str,
        drawn_at: u64,
    ) -> Result<AssignOutcome, StoreError>;
    async fn delete_participants(&self, group_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MatchNotification {
    pub group_id: GroupId,
    pub gifter_name: String,
    pub giftee_name: String,
    pub email: String,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Seam over the remote email-sending function.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_match(&self, notification: &MatchNotification) -> Result<(), NotifyError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct GroupRecord {
    group: Group,
    participants: Vec<Participant>,
}

/// In-memory store with optional JSON snapshot persistence. Stands in for
/// the hosted row store in local deployments and tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    groups: Arc<RwLock<HashMap<GroupId, GroupRecord>>>,
    persist_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_persistence(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut store = Self::default();
        store.persist_path = Some(path.clone());
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if let Ok(saved) = serde_json::from_slice::<HashMap<GroupId, GroupRecord>>(&bytes) {
                let mut groups = store.groups.write().await;
                *groups = saved;
            }
        }
        store
    }

    async fn persist(&self) {
        if let Some(path) = &self.persist_path {
            let snapshot = {
                let groups = self.groups.read().await;
                groups.clone()
            };
            if let Ok(json) = serde_json::to_vec_pretty(&snapshot) {
                if let Err(err) = tokio::fs::write(path, json).await {
                    tracing::error!(error = %err, "persist failed");
                }
            }
        }
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn create_group(&self, organiser_email: &str) -> Result<GroupId, StoreError> {
        let id = Uuid::new_v4().to_string();
        let record = GroupRecord {
            group: Group::new(id.clone(), organiser_email),
            participants: Vec::new(),
        };
        self.groups.write().await.insert(id.clone(), record);
        self.persist().await;
        Ok(id)
    }

    async fn update_organiser_email(
        &self,
        group_id: &str,
        organiser_email: &str,
    ) -> Result<(), StoreError> {
        {
            let mut groups = self.groups.write().await;
            let record = groups.get_mut(group_id).ok_or(StoreError::GroupNotFound)?;
            record.group.organiser_email = organiser_email.to_string();
        }
        self.persist().await;
        Ok(())
    }

    async fn set_slug(&self, group_id: &str, slug: &str) -> Result<(), StoreError> {
        {
            let mut groups = self.groups.write().await;
            let record = groups.get_mut(group_id).ok_or(StoreError::GroupNotFound)?;
            record.group.slug = Some(slug.to_string());
            record.group.locked = true;
        }
        self.persist().await;
        Ok(())
    }

    async fn clear_lock(&self, group_id: &str) -> Result<(), StoreError> {
        {
            let mut groups = self.groups.write().await;
            let record = groups.get_mut(group_id).ok_or(StoreError::GroupNotFound)?;
            record.group.slug = None;
            record.group.locked = false;
        }
        self.persist().await;
        Ok(())
    }

    async fn get_group(&self, group_id: &str) -> Result<Option<Group>, StoreError> {
        let groups = self.groups.read().await;
        Ok(groups.get(group_id).map(|r| r.group.clone()))
    }

    async fn get_group_by_slug(&self, slug: &str) -> Result<Option<Group>, StoreError> {
        let groups = self.groups.read().await;
        Ok(groups
            .values()
            .find(|r| r.group.slug.as_deref() == Some(slug))
            .map(|r| r.group.clone()))
    }

    async fn replace_participants(
        &self,
        group_id: &str,
        names: &[String],
    ) -> Result<(), StoreError> {
        {
            let mut groups = self.groups.write().await;
            let record = groups.get_mut(group_id).ok_or(StoreError::GroupNotFound)?;
            record.participants = names.iter().map(|n| Participant::new(n.as_str())).collect();
        }
        self.persist().await;
        Ok(())
    }

    async fn get_participants(&self, group_id: &str) -> Result<Vec<Participant>, StoreError> {
        let groups = self.groups.read().await;
        let record = groups.get(group_id).ok_or(StoreError::GroupNotFound)?;
        Ok(record.participants.clone())
    }

    async fn update_participant_email(
        &self,
        group_id: &str,
        name: &str,
        email: &str,
    ) -> Result<(), StoreError> {
        {
            let mut groups = self.groups.write().await;
            let record = groups.get_mut(group_id).ok_or(StoreError::GroupNotFound)?;
            let row = record
                .participants
                .iter_mut()
                .find(|p| p.name == name)
                .ok_or(StoreError::ParticipantNotFound)?;
            row.claim_email = Some(email.to_string());
        }
        self.persist().await;
        Ok(())
    }

    async fn assign_giftee_if_unset(
        &self,
        group_id: &str,
        name: &str,
        email: &str,
        giftee: &str,
        drawn_at: u64,
    ) -> Result<AssignOutcome, StoreError> {
        let outcome = {
            let mut groups = self.groups.write().await;
            let record = groups.get_mut(group_id).ok_or(StoreError::GroupNotFound)?;
            let row = record
                .participants
                .iter_mut()
                .find(|p| p.name == name)
                .ok_or(StoreError::ParticipantNotFound)?;
            if row.giftee_name.is_some() {
                AssignOutcome::Conflict
            } else {
                row.claim_email = Some(email.to_string());
                row.giftee_name = Some(giftee.to_string());
                row.drawn_at = Some(drawn_at);
                AssignOutcome::Committed
            }
        };
        self.persist().await;
        Ok(outcome)
    }

    async fn delete_participants(&self, group_id: &str) -> Result<(), StoreError> {
        {
            let mut groups = self.groups.write().await;
            let record = groups.get_mut(group_id).ok_or(StoreError::GroupNotFound)?;
            record.participants.clear();
        }
        self.persist().await;
        Ok(())
    }
}

/// Development stand-in for the remote email function: the match is only
/// logged, so the giftee stays out of any response body.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send_match(&self, notification: &MatchNotification) -> Result<(), NotifyError> {
        tracing::info!(
            group_id = %notification.group_id,
            gifter = %notification.gifter_name,
            giftee = %notification.giftee_name,
            email = %notification.email,
            "match notification"
        );
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("group not found")]
    GroupNotFound,
    #[error("the group is not locked yet; wait for the organiser's link")]
    GroupNotLocked,
    #[error("the list is locked; reset the event to make changes")]
    GroupLocked,
    #[error("organiser email required")]
    OrganiserEmailRequired,
    #[error("no names captured; add at least one participant")]
    EmptyRoster,
    #[error("enter your email before drawing")]
    ClaimEmailRequired,
    #[error(transparent)]
    Draw(#[from] DrawError),
    #[error("someone drew for this name at the same time; try again")]
    ConcurrentDrawConflict,
    #[error("store failure: {0}")]
    Persistence(#[from] StoreError),
    #[error("your draw is saved but the email could not be sent; ask the organiser to resend")]
    NotificationDelivery(#[source] NotifyError),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DrawReceipt {
    /// True when an existing assignment was re-delivered instead of a fresh
    /// draw being committed.
    pub resent: bool,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    seed.map(ChaCha8Rng::seed_from_u64)
        .unwrap_or_else(ChaCha8Rng::from_entropy)
}

/// Orchestrates the group lifecycle against the store and sink seams:
/// save (open) -> lock -> draw/resend -> reset.
#[derive(Clone)]
pub struct DrawEngine {
    store: Arc<dyn GroupStore>,
    sink: Arc<dyn NotificationSink>,
}

impl DrawEngine {
    pub fn new(store: Arc<dyn GroupStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, sink }
    }

    /// Saves (or re-saves) the roster while the group is open. The remote
    /// participant set is replaced wholesale, so re-running a failed save is
    /// always safe.
    pub async fn save_roster(
        &self,
        group_id: Option<&str>,
        organiser_email: &str,
        names: &[String],
    ) -> Result<GroupId, EngineError> {
        let organiser_email = organiser_email.trim();
        if organiser_email.is_empty() {
            return Err(EngineError::OrganiserEmailRequired);
        }
        let unique = dedup_names(names);
        if unique.is_empty() {
            return Err(EngineError::EmptyRoster);
        }

        let group_id = match group_id {
            Some(id) => {
                let group = self
                    .store
                    .get_group(id)
                    .await?
                    .ok_or(EngineError::GroupNotFound)?;
                if group.locked {
                    return Err(EngineError::GroupLocked);
                }
                self.store.update_organiser_email(id, organiser_email).await?;
                id.to_string()
            }
            None => self.store.create_group(organiser_email).await?,
        };

        self.store.replace_participants(&group_id, &unique).await?;
        tracing::info!(group_id = %group_id, names = unique.len(), "roster saved");
        Ok(group_id)
    }

    /// Locks the group and returns its share slug. Idempotent: a locked
    /// group keeps its existing slug.
    pub async fn generate_link(
        &self,
        group_id: &str,
        seed: Option<u64>,
    ) -> Result<String, EngineError> {
        let group = self
            .store
            .get_group(group_id)
            .await?
            .ok_or(EngineError::GroupNotFound)?;
        if group.locked {
            if let Some(slug) = group.slug {
                return Ok(slug);
            }
        }

        let participants = self.store.get_participants(group_id).await?;
        if participants.len() < 2 {
            return Err(DrawError::NotEnoughParticipants.into());
        }

        let slug = generate_slug(&mut seeded_rng(seed));
        self.store.set_slug(group_id, &slug).await?;
        tracing::info!(group_id = %group_id, slug = %slug, "group locked");
        Ok(slug)
    }

    /// Claims `name` for `email`: reconciles against the store, re-delivers
    /// an existing assignment, or commits a fresh greedy pick through the
    /// conditional write. A lost race surfaces as
    /// [`EngineError::ConcurrentDrawConflict`]; retry from the top.
    pub async fn draw(
        &self,
        slug: &str,
        name: &str,
        email: &str,
        seed: Option<u64>,
    ) -> Result<DrawReceipt, EngineError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(EngineError::ClaimEmailRequired);
        }

        let group = self
            .store
            .get_group_by_slug(slug)
            .await?
            .ok_or(EngineError::GroupNotFound)?;
        if !group.locked {
            return Err(EngineError::GroupNotLocked);
        }

        // Reconcile: the fetched rows are authoritative for every committed
        // draw; the merged view is what the pick is validated against.
        let rows = self.store.get_participants(&group.id).await?;
        let roster: Vec<String> = rows.iter().map(|p| p.name.clone()).collect();
        let mut assignments = AssignmentMap::new();
        merge_remote(&mut assignments, &rows, now_millis());

        // Resolve the claimed name to its stored form so assignment lookups
        // and self-exclusion use the canonical casing.
        let canonical = rows
            .iter()
            .find(|p| same_name(&p.name, name))
            .map(|p| p.name.clone())
            .ok_or(DrawError::UnknownName)?;

        let plan = plan_draw(
            &roster,
            &canonical,
            &email,
            &assignments,
            &mut seeded_rng(seed),
        )?;

        match plan {
            DrawPlan::Resend { giftee } => {
                // Claim-email refresh is last-write-wins and not correctness
                // critical; a failed write only degrades the "yours" hint.
                if let Err(err) = self
                    .store
                    .update_participant_email(&group.id, &canonical, &email)
                    .await
                {
                    tracing::error!(error = %err, "claim email update failed");
                }
                self.notify(&group.id, &canonical, &giftee, &email).await?;
                Ok(DrawReceipt { resent: true })
            }
            DrawPlan::Fresh { giftee } => {
                let outcome = self
                    .store
                    .assign_giftee_if_unset(&group.id, &canonical, &email, &giftee, now_millis())
                    .await?;
                if outcome == AssignOutcome::Conflict {
                    tracing::warn!(group_id = %group.id, name = %canonical, "lost draw race");
                    return Err(EngineError::ConcurrentDrawConflict);
                }
                tracing::info!(group_id = %group.id, name = %canonical, "draw committed");
                self.notify(&group.id, &canonical, &giftee, &email).await?;
                Ok(DrawReceipt { resent: false })
            }
        }
    }

    /// Delivery failure never rolls back a committed draw; it surfaces as
    /// resend guidance to the caller.
    async fn notify(
        &self,
        group_id: &str,
        gifter: &str,
        giftee: &str,
        email: &str,
    ) -> Result<(), EngineError> {
        let notification = MatchNotification {
            group_id: group_id.to_string(),
            gifter_name: gifter.to_string(),
            giftee_name: giftee.to_string(),
            email: email.to_string(),
        };
        self.sink
            .send_match(&notification)
            .await
            .map_err(EngineError::NotificationDelivery)
    }

    /// Destructive: deletes every participant row and reopens the group for
    /// a brand-new draw epoch.
    pub async fn reset(&self, group_id: &str) -> Result<(), EngineError> {
        self.store
            .get_group(group_id)
            .await?
            .ok_or(EngineError::GroupNotFound)?;
        self.store.delete_participants(group_id).await?;
        self.store.clear_lock(group_id).await?;
        tracing::info!(group_id = %group_id, "group reset");
        Ok(())
    }

    pub async fn load_group(&self, slug: &str) -> Result<(Group, Vec<Participant>), EngineError> {
        let group = self
            .store
            .get_group_by_slug(slug)
            .await?
            .ok_or(EngineError::GroupNotFound)?;
        let participants = self.store.get_participants(&group.id).await?;
        Ok((group, participants))
    }

    /// The unlock gate is convention, not auth: it mirrors the organiser
    /// email check a client performs locally.
    pub async fn check_organiser(&self, slug: &str, attempt: &str) -> Result<bool, EngineError> {
        let group = self
            .store
            .get_group_by_slug(slug)
            .await?
            .ok_or(EngineError::GroupNotFound)?;
        Ok(organiser_matches(&group.organiser_email, attempt))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: DrawEngine,
}

impl AppState {
    pub fn new(store: Arc<dyn GroupStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            engine: DrawEngine::new(store, sink),
        }
    }
}

/// Participant-facing routes address the group by its share slug; the lock
/// and reset routes take the group id the organiser got back from save.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/group", post(save_group))
        .route("/group/:id", get(get_group))
        .route("/group/:id/lock", post(lock_group))
        .route("/group/:id/reset", post(reset_group))
        .route("/group/:id/draw", post(draw_name))
        .route("/group/:id/unlock", post(unlock_organiser))
        .with_state(state)
}

fn site_base_url() -> String {
    env::var("SITE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

fn error_response(err: EngineError) -> Response {
    let status = match &err {
        EngineError::GroupNotFound => StatusCode::NOT_FOUND,
        EngineError::GroupNotLocked
        | EngineError::GroupLocked
        | EngineError::ConcurrentDrawConflict => StatusCode::CONFLICT,
        EngineError::Draw(DrawError::NameAlreadyClaimed)
        | EngineError::Draw(DrawError::DuplicateName)
        | EngineError::Draw(DrawError::ExchangeExhausted) => StatusCode::CONFLICT,
        EngineError::Draw(_)
        | EngineError::OrganiserEmailRequired
        | EngineError::EmptyRoster
        | EngineError::ClaimEmailRequired => StatusCode::BAD_REQUEST,
        EngineError::Persistence(_) | EngineError::NotificationDelivery(_) => {
            StatusCode::BAD_GATEWAY
        }
    };
    (status, err.to_string()).into_response()
}

#[derive(Deserialize)]
struct SaveGroupRequest {
    group_id: Option<String>,
    organiser_email: String,
    names: Vec<String>,
}

#[derive(Serialize)]
struct SaveGroupResponse {
    group_id: String,
}

async fn save_group(
    State(state): State<AppState>,
    Json(payload): Json<SaveGroupRequest>,
) -> impl IntoResponse {
    match state
        .engine
        .save_roster(
            payload.group_id.as_deref(),
            &payload.organiser_email,
            &payload.names,
        )
        .await
    {
        Ok(group_id) => (StatusCode::OK, Json(SaveGroupResponse { group_id })).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct SeedParams {
    seed: Option<u64>,
}

#[derive(Serialize)]
struct LockResponse {
    slug: String,
    url: String,
}

async fn lock_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Query(params): Query<SeedParams>,
) -> impl IntoResponse {
    match state.engine.generate_link(&group_id, params.seed).await {
        Ok(slug) => {
            let url = format!("{}/group/{}", site_base_url(), slug);
            (StatusCode::OK, Json(LockResponse { slug, url })).into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Serialize)]
struct ParticipantView {
    name: String,
    claimed: bool,
    claim_email: Option<String>,
    drawn_at: Option<u64>,
}

#[derive(Serialize)]
struct GroupView {
    slug: Option<String>,
    locked: bool,
    organiser_email: String,
    participants: Vec<ParticipantView>,
}

async fn get_group(State(state): State<AppState>, Path(slug): Path<String>) -> impl IntoResponse {
    match state.engine.load_group(&slug).await {
        Ok((group, participants)) => {
            // The giftee a participant drew never leaves through the view;
            // it only travels via the notification sink.
            let participants = participants
                .into_iter()
                .map(|p| ParticipantView {
                    claimed: p.has_drawn(),
                    claim_email: p.claim_email,
                    drawn_at: p.drawn_at,
                    name: p.name,
                })
                .collect();
            (
                StatusCode::OK,
                Json(GroupView {
                    slug: group.slug,
                    locked: group.locked,
                    organiser_email: group.organiser_email,
                    participants,
                }),
            )
                .into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct DrawRequest {
    name: String,
    email: String,
}

#[derive(Serialize)]
struct DrawResponse {
    resent: bool,
    message: String,
}

async fn draw_name(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(params): Query<SeedParams>,
    Json(payload): Json<DrawRequest>,
) -> impl IntoResponse {
    match state
        .engine
        .draw(&slug, &payload.name, &payload.email, params.seed)
        .await
    {
        Ok(receipt) => {
            let message = if receipt.resent {
                "We just resent your match to your email.".to_string()
            } else {
                "All set! We just emailed you the name you drew (check your junk).".to_string()
            };
            (
                StatusCode::OK,
                Json(DrawResponse {
                    resent: receipt.resent,
                    message,
                }),
            )
                .into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct UnlockRequest {
    email: String,
}

async fn unlock_organiser(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(payload): Json<UnlockRequest>,
) -> impl IntoResponse {
    match state.engine.check_organiser(&slug, &payload.email).await {
        Ok(true) => (StatusCode::OK, "organiser tools unlocked").into_response(),
        Ok(false) => (
            StatusCode::UNAUTHORIZED,
            "that email doesn't match the organiser on file",
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

async fn reset_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> impl IntoResponse {
    match state.engine.reset(&group_id).await {
        Ok(()) => (StatusCode::OK, "group reset; add names to start again").into_response(),
        Err(err) => error_response(err),
    }
}
