//! Collaborator seams: chat-platform client, schedule source reader,
//! view rendering, and content fingerprints.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use csb_core::{AccentColor, Category, GroupedEntries, ScheduleEntry};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "csb-platform";

/// Renderable body of one posted unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitContent {
    pub body: String,
    pub accent_color: Option<u32>,
}

/// What the remote platform reports about an existing unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUnit {
    pub id: String,
    /// False when a foreign author occupies the slot; the reconciler then
    /// recreates rather than edits.
    pub authored_by_self: bool,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("unit not found")]
    NotFound,
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("platform transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound)
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, PlatformError::Permission(_))
    }
}

/// The four remote operations the reconciler consumes, abstracted over
/// the concrete chat-platform API.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn create_unit(
        &self,
        channel: &str,
        content: &UnitContent,
    ) -> Result<String, PlatformError>;

    async fn update_unit(
        &self,
        channel: &str,
        unit_id: &str,
        content: &UnitContent,
    ) -> Result<(), PlatformError>;

    async fn delete_unit(&self, channel: &str, unit_id: &str) -> Result<(), PlatformError>;

    async fn fetch_unit(&self, channel: &str, unit_id: &str)
        -> Result<RemoteUnit, PlatformError>;
}

/// Source-of-truth reader: entries for one category restricted to the
/// enabled sources and the lookahead horizon, grouped by subgroup.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn fetch_grouped(
        &self,
        category: Category,
        enabled_sources: &[String],
        horizon_days: i64,
    ) -> anyhow::Result<GroupedEntries>;
}

// ---------------------------------------------------------------------------
// Fingerprints

fn truncated_sha256(input: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

fn push_entries(buf: &mut String, subgroup: &str, entries: &[ScheduleEntry]) {
    buf.push_str(subgroup);
    buf.push(':');
    for entry in entries {
        buf.push_str(&format!("{}|{}|{}|", entry.id, entry.run_type, entry.start_ms));
    }
}

/// Fingerprint of one subgroup's entries. Sensitive to id, run type, and
/// start time; insensitive to rendering cosmetics.
pub fn subgroup_fingerprint(subgroup: &str, entries: &[ScheduleEntry]) -> u64 {
    let mut buf = String::new();
    push_entries(&mut buf, subgroup, entries);
    truncated_sha256(&buf)
}

/// Fingerprint over every subgroup of a category, in stable subgroup-key
/// order. Any membership, ordering, or field change shifts the hash.
pub fn aggregate_fingerprint(category: Category, grouped: &GroupedEntries) -> u64 {
    let mut buf = format!("{}|", category.key());
    for (subgroup, entries) in grouped {
        push_entries(&mut buf, subgroup, entries);
    }
    truncated_sha256(&buf)
}

// ---------------------------------------------------------------------------
// Rendering

fn timestamp_markup(start_ms: i64) -> String {
    let secs = start_ms.div_euclid(1000);
    format!("<t:{secs}:F> (<t:{secs}:R>)")
}

/// Category-level overview unit. Idempotent: depends only on category and
/// accent color, never on entries.
pub fn render_overview(category: Category, accent: AccentColor) -> UnitContent {
    let name = category.display_name();
    let body = format!(
        "## {name}\nUpcoming runs across every enabled community, updated automatically.\n\nDetails for each community follow below."
    );
    UnitContent {
        body,
        accent_color: accent.resolve(category),
    }
}

/// Detail unit for one subgroup. Empty subgroups render a placeholder body
/// rather than vanishing, so the unit layout stays stable.
pub fn render_detail(
    subgroup: &str,
    entries: &[ScheduleEntry],
    category: Category,
    accent: AccentColor,
) -> UnitContent {
    let mut body = format!("### {subgroup} — {}\n", category.display_name());
    if entries.is_empty() {
        body.push_str("\nNo runs currently scheduled.\n");
    } else {
        for entry in entries {
            body.push_str(&format!("- **{}** {}", entry.run_type, timestamp_markup(entry.start_ms)));
            if let Some(link) = &entry.reference_link {
                body.push_str(&format!(" — [details]({link})"));
            }
            body.push('\n');
        }
    }
    UnitContent {
        body,
        accent_color: accent.resolve(category),
    }
}

// ---------------------------------------------------------------------------
// REST chat platform client

#[derive(Debug, Clone)]
pub struct RestPlatformConfig {
    pub base_url: String,
    pub token: String,
    /// The bot's own user id, used to detect foreign authors.
    pub self_user_id: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct MessageBody<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    accent_color: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    id: String,
    author_id: String,
}

/// [`ChatPlatform`] over a REST message API: create/edit/delete/fetch of
/// channel messages with bearer-token auth.
#[derive(Debug)]
pub struct RestChatPlatform {
    client: reqwest::Client,
    base_url: String,
    self_user_id: String,
}

impl RestChatPlatform {
    pub fn new(config: RestPlatformConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", config.token))
            .context("building authorization header")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            self_user_id: config.self_user_id,
        })
    }

    fn messages_url(&self, channel: &str) -> String {
        format!("{}/channels/{}/messages", self.base_url, channel)
    }

    fn message_url(&self, channel: &str, unit_id: &str) -> String {
        format!("{}/{}", self.messages_url(channel), unit_id)
    }
}

/// Map a non-success HTTP status onto the platform error taxonomy.
pub fn classify_platform_status(status: StatusCode) -> Option<PlatformError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::NOT_FOUND => PlatformError::NotFound,
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            PlatformError::Permission(format!("http status {status}"))
        }
        other => PlatformError::Transport(anyhow::anyhow!("http status {other}")),
    })
}

fn transport(err: reqwest::Error) -> PlatformError {
    PlatformError::Transport(anyhow::Error::new(err))
}

#[async_trait]
impl ChatPlatform for RestChatPlatform {
    async fn create_unit(
        &self,
        channel: &str,
        content: &UnitContent,
    ) -> Result<String, PlatformError> {
        let resp = self
            .client
            .post(self.messages_url(channel))
            .json(&MessageBody {
                content: &content.body,
                accent_color: content.accent_color,
            })
            .send()
            .await
            .map_err(transport)?;
        if let Some(err) = classify_platform_status(resp.status()) {
            return Err(err);
        }
        let message: MessageResponse = resp.json().await.map_err(transport)?;
        debug!(channel, unit_id = %message.id, "created unit");
        Ok(message.id)
    }

    async fn update_unit(
        &self,
        channel: &str,
        unit_id: &str,
        content: &UnitContent,
    ) -> Result<(), PlatformError> {
        let resp = self
            .client
            .patch(self.message_url(channel, unit_id))
            .json(&MessageBody {
                content: &content.body,
                accent_color: content.accent_color,
            })
            .send()
            .await
            .map_err(transport)?;
        match classify_platform_status(resp.status()) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn delete_unit(&self, channel: &str, unit_id: &str) -> Result<(), PlatformError> {
        let resp = self
            .client
            .delete(self.message_url(channel, unit_id))
            .send()
            .await
            .map_err(transport)?;
        match classify_platform_status(resp.status()) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn fetch_unit(
        &self,
        channel: &str,
        unit_id: &str,
    ) -> Result<RemoteUnit, PlatformError> {
        let resp = self
            .client
            .get(self.message_url(channel, unit_id))
            .send()
            .await
            .map_err(transport)?;
        if let Some(err) = classify_platform_status(resp.status()) {
            return Err(err);
        }
        let message: MessageResponse = resp.json().await.map_err(transport)?;
        Ok(RemoteUnit {
            authored_by_self: message.author_id == self.self_user_id,
            id: message.id,
        })
    }
}

// ---------------------------------------------------------------------------
// Postgres source reader

/// [`SourceReader`] over the shared `schedule_entries` table. Cancelled
/// entries and anything outside `[now, now + horizon_days]` are excluded
/// in the query itself.
#[derive(Debug, Clone)]
pub struct SqlSourceReader {
    pool: PgPool,
}

impl SqlSourceReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to schedule database")?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl SourceReader for SqlSourceReader {
    async fn fetch_grouped(
        &self,
        category: Category,
        enabled_sources: &[String],
        horizon_days: i64,
    ) -> anyhow::Result<GroupedEntries> {
        if enabled_sources.is_empty() {
            return Ok(GroupedEntries::new());
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let horizon_ms = now_ms + horizon_days * 24 * 60 * 60 * 1000;

        let rows = sqlx::query(
            "SELECT id, run_type, start_ms, subgroup, source_id, reference_link \
             FROM schedule_entries \
             WHERE category = $1 \
               AND cancelled = FALSE \
               AND start_ms > $2 \
               AND start_ms < $3 \
               AND source_id = ANY($4) \
             ORDER BY subgroup, start_ms",
        )
        .bind(category.key())
        .bind(now_ms)
        .bind(horizon_ms)
        .bind(enabled_sources)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("fetching {category} schedule entries"))?;

        let mut grouped = GroupedEntries::new();
        for row in rows {
            let entry = ScheduleEntry {
                id: row.try_get("id").context("reading id column")?,
                run_type: row.try_get("run_type").context("reading run_type column")?,
                start_ms: row.try_get("start_ms").context("reading start_ms column")?,
                subgroup: row.try_get("subgroup").context("reading subgroup column")?,
                source_id: row.try_get("source_id").context("reading source_id column")?,
                reference_link: row
                    .try_get("reference_link")
                    .context("reading reference_link column")?,
            };
            grouped.entry(entry.subgroup.clone()).or_default().push(entry);
        }

        debug!(
            category = %category,
            sources = enabled_sources.len(),
            subgroups = grouped.len(),
            "fetched schedule"
        );
        Ok(grouped)
    }
}
