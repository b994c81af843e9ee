#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use aplauso_rewards_core::{
    admit_redemption, available_stock, format_rfc3339, gross_points, net_points, now_utc,
    summarize_user, AdmissionError, BadgeCatalog, LevelTable, RecognitionEvent, RedemptionRecord,
    RedemptionStatus, RewardDefinition, User, UserRole, UserStatus, UserSummary,
};
use serde_json::Value;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use tracing::{debug, info, warn};
use ulid::Ulid;

/// One upstream sheet row after header normalization: column name to raw
/// cell text. Everything is a string at this stage; typing happens in the
/// `*_from_rows` transforms.
pub type RawRow = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("unknown reward: {0}")]
    UnknownReward(String),
    #[error("user {0} is inactive")]
    InactiveUser(String),
    #[error("user {0} may not grant recognitions")]
    NotAGranter(String),
    #[error("giver and receiver must be distinct")]
    SelfRecognition,
    #[error("unknown principle: {0}")]
    UnknownPrinciple(String),
    #[error("recognition reason must not be empty")]
    EmptyReason,
    #[error(transparent)]
    Denied(#[from] AdmissionError),
    #[error("snapshot source error: {0}")]
    Source(String),
}

impl From<anyhow::Error> for LedgerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Source(format!("{err:#}"))
    }
}

/// Normalizes a sheet column header the way the upstream exporter is known
/// to mangle them: BOM and quotes stripped, lowercased, every run of
/// non-alphanumerics collapsed to a single underscore.
#[must_use]
pub fn normalize_header(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('"').replace('\u{feff}', "");
    let mut normalized = String::with_capacity(trimmed.len());
    let mut last_was_underscore = false;

    for ch in trimmed.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            normalized.push(ch);
            last_was_underscore = false;
        } else if !last_was_underscore {
            normalized.push('_');
            last_was_underscore = true;
        }
    }

    normalized.trim_matches('_').to_string()
}

/// Lenient integer parse: trimmed text, 0 on anything malformed or missing.
/// Derived-state computation must stay total over dirty sheet data.
#[must_use]
pub fn lenient_i64(raw: &str) -> i64 {
    raw.trim().parse().unwrap_or(0)
}

#[must_use]
pub fn lenient_u32(raw: &str) -> u32 {
    raw.trim().parse().unwrap_or(0)
}

/// Best-effort timestamp parse. Accepts RFC3339 (any offset, normalized to
/// UTC), `YYYY-MM-DD`, and `DD/MM/YYYY` (also `-`-separated), each with an
/// optional `HH:MM[:SS]` tail. Unparseable input degrades to the Unix epoch
/// so a bad cell cannot take down a whole snapshot load.
#[must_use]
pub fn lenient_timestamp(raw: &str) -> OffsetDateTime {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return OffsetDateTime::UNIX_EPOCH;
    }

    if let Ok(parsed) =
        OffsetDateTime::parse(trimmed, &time::format_description::well_known::Rfc3339)
    {
        return parsed.to_offset(UtcOffset::UTC);
    }

    if let Some(parsed) = parse_loose_datetime(trimmed) {
        return parsed;
    }

    warn!(value = trimmed, "unparseable timestamp, defaulting to epoch");
    OffsetDateTime::UNIX_EPOCH
}

fn parse_loose_datetime(value: &str) -> Option<OffsetDateTime> {
    let mut parts = value.splitn(2, [' ', 'T']);
    let date_part = parts.next()?;
    let time_part = parts.next();

    let date = parse_loose_date(date_part)?;
    let time = match time_part {
        Some(raw) => parse_loose_time(raw)?,
        None => Time::MIDNIGHT,
    };

    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

fn parse_loose_date(value: &str) -> Option<Date> {
    let pieces: Vec<&str> = value.split(['/', '-']).collect();
    let [first, second, third] = pieces.as_slice() else {
        return None;
    };

    // YYYY-MM-DD when the year leads, DD/MM/YYYY otherwise.
    let (year, month, day) = if first.len() == 4 {
        (first, second, third)
    } else {
        (third, second, first)
    };

    let year: i32 = year.parse().ok()?;
    let month: u8 = month.parse().ok()?;
    let day: u8 = day.parse().ok()?;

    Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
}

fn parse_loose_time(value: &str) -> Option<Time> {
    let pieces: Vec<&str> = value.trim().split(':').collect();
    let (hour, minute, second) = match pieces.as_slice() {
        [hour, minute] => (hour, minute, "0"),
        [hour, minute, second] => (hour, minute, *second),
        _ => return None,
    };

    Time::from_hms(
        hour.parse().ok()?,
        minute.parse().ok()?,
        second.parse().ok()?,
    )
    .ok()
}

/// Decodes a JSON document (an array of objects, one per sheet row) into
/// raw rows. Cell values of any scalar type are coerced to text; typing is
/// the transforms' job.
pub fn rows_from_json(document: &Value) -> Result<Vec<RawRow>> {
    let Value::Array(items) = document else {
        return Err(anyhow!("snapshot table MUST be a JSON array of row objects"));
    };

    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(fields) = item else {
            return Err(anyhow!("snapshot row MUST be a JSON object"));
        };

        let mut row = RawRow::new();
        for (key, value) in fields {
            row.insert(normalize_header(key), cell_to_string(value));
        }
        rows.push(row);
    }

    Ok(rows)
}

fn cell_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn field<'a>(row: &'a RawRow, keys: &[&str]) -> &'a str {
    for key in keys {
        if let Some(value) = row.get(*key) {
            if !value.trim().is_empty() {
                return value.trim();
            }
        }
    }
    ""
}

/// Users from raw rows. Rows without an id are dropped with a warning; the
/// flexible role column (`rol_otorgador` takes precedence over `rol`)
/// follows the upstream sheet's conventions.
#[must_use]
pub fn users_from_rows(rows: &[RawRow]) -> Vec<User> {
    let mut users = Vec::with_capacity(rows.len());
    for row in rows {
        let user_id = field(row, &["usuario_id", "user_id"]);
        if user_id.is_empty() {
            warn!("dropping user row without usuario_id");
            continue;
        }

        users.push(User {
            user_id: user_id.to_string(),
            name: field(row, &["nombre", "name"]).to_string(),
            email: field(row, &["email"]).to_string(),
            status: UserStatus::parse(field(row, &["estado", "status"])),
            role: UserRole::parse(field(row, &["rol_otorgador", "rol", "role"])),
            historical_points: lenient_i64(field(row, &["puntos_anteriores", "historical_points"])),
        });
    }
    users
}

#[must_use]
pub fn recognitions_from_rows(rows: &[RawRow]) -> Vec<RecognitionEvent> {
    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let recognition_id = field(row, &["aplauso_id", "recognition_id"]);
        if recognition_id.is_empty() {
            warn!("dropping recognition row without aplauso_id");
            continue;
        }

        events.push(RecognitionEvent {
            recognition_id: recognition_id.to_string(),
            giver_id: field(row, &["otorgante_id", "giver_id"]).to_string(),
            receiver_id: field(row, &["receptor_id", "receiver_id"]).to_string(),
            principle: field(row, &["principio", "principle"]).to_string(),
            reason: field(row, &["motivo", "reason"]).to_string(),
            occurred_at: lenient_timestamp(field(row, &["fecha", "occurred_at"])),
        });
    }
    events
}

#[must_use]
pub fn rewards_from_rows(rows: &[RawRow]) -> Vec<RewardDefinition> {
    let mut rewards = Vec::with_capacity(rows.len());
    for row in rows {
        let reward_id = field(row, &["recompensa_id", "reward_id"]);
        if reward_id.is_empty() {
            warn!("dropping reward row without recompensa_id");
            continue;
        }

        rewards.push(RewardDefinition {
            reward_id: reward_id.to_string(),
            name: field(row, &["nombre", "name"]).to_string(),
            description: field(row, &["descripcion", "description"]).to_string(),
            required_level: lenient_u32(field(row, &["nivel_requerido", "required_level"])),
            initial_stock: lenient_u32(field(row, &["stock", "initial_stock"])),
            point_cost: lenient_i64(field(row, &["puntos_costo", "point_cost"])),
        });
    }
    rewards
}

#[must_use]
pub fn redemptions_from_rows(rows: &[RawRow]) -> Vec<RedemptionRecord> {
    let mut redemptions = Vec::with_capacity(rows.len());
    for row in rows {
        let redemption_id = field(row, &["canje_id", "redemption_id"]);
        if redemption_id.is_empty() {
            warn!("dropping redemption row without canje_id");
            continue;
        }

        redemptions.push(RedemptionRecord {
            redemption_id: redemption_id.to_string(),
            user_id: field(row, &["usuario_id", "user_id"]).to_string(),
            reward_id: field(row, &["recompensa_id", "reward_id"]).to_string(),
            requested_at: lenient_timestamp(field(row, &["fecha", "requested_at"])),
            status: RedemptionStatus::parse(field(row, &["estado", "status"])),
        });
    }
    redemptions
}

/// The four raw tables of one full snapshot load. Always replaced
/// wholesale on refresh, never patched incrementally.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub users: Vec<User>,
    pub recognitions: Vec<RecognitionEvent>,
    pub rewards: Vec<RewardDefinition>,
    pub redemptions: Vec<RedemptionRecord>,
    pub loaded_at: OffsetDateTime,
}

impl Snapshot {
    #[must_use]
    pub fn user(&self, user_id: &str) -> Option<&User> {
        self.users.iter().find(|user| user.user_id == user_id)
    }

    #[must_use]
    pub fn reward(&self, reward_id: &str) -> Option<&RewardDefinition> {
        self.rewards
            .iter()
            .find(|reward| reward.reward_id == reward_id)
    }

    #[must_use]
    pub fn recognitions_received_by(&self, user_id: &str) -> Vec<&RecognitionEvent> {
        self.recognitions
            .iter()
            .filter(|event| event.receiver_id == user_id)
            .collect()
    }

    #[must_use]
    pub fn redemptions_by(&self, user_id: &str) -> Vec<RedemptionRecord> {
        self.redemptions
            .iter()
            .filter(|redemption| redemption.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SnapshotCounts {
    pub users: usize,
    pub recognitions: usize,
    pub rewards: usize,
    pub redemptions: usize,
    pub loaded_at: String,
}

/// Where the externally-owned tables live. One JSON row-array file per
/// table.
#[derive(Debug, Clone)]
pub struct SnapshotPaths {
    pub users: PathBuf,
    pub recognitions: PathBuf,
    pub rewards: PathBuf,
    pub redemptions: PathBuf,
}

impl SnapshotPaths {
    #[must_use]
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            users: dir.join("users.json"),
            recognitions: dir.join("recognitions.json"),
            rewards: dir.join("rewards.json"),
            redemptions: dir.join("redemptions.json"),
        }
    }
}

/// The external data collaborator: full-reload reads plus the two appends
/// the engine is allowed to perform. Everything else about the raw data is
/// owned upstream.
pub trait SnapshotSource {
    fn load(&self) -> Result<Snapshot>;
    fn append_redemption(&self, record: &RedemptionRecord) -> Result<()>;
    fn append_recognition(&self, event: &RecognitionEvent) -> Result<()>;
}

/// File-backed snapshot source. An absent redemption log is an empty one
/// (a fresh deployment starts with no redemptions); the other tables are
/// required.
#[derive(Debug, Clone)]
pub struct FileSnapshotSource {
    paths: SnapshotPaths,
}

impl FileSnapshotSource {
    #[must_use]
    pub fn new(paths: SnapshotPaths) -> Self {
        Self { paths }
    }

    fn read_table(path: &Path, required: bool) -> Result<Vec<RawRow>> {
        if !path.exists() {
            if required {
                return Err(anyhow!("missing snapshot table {}", path.display()));
            }
            debug!(path = %path.display(), "optional snapshot table absent, treating as empty");
            return Ok(Vec::new());
        }

        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot table {}", path.display()))?;
        let document: Value = serde_json::from_str(&body)
            .with_context(|| format!("invalid JSON in snapshot table {}", path.display()))?;
        rows_from_json(&document)
            .with_context(|| format!("invalid rows in snapshot table {}", path.display()))
    }

    fn append_row(path: &Path, row: Value) -> Result<()> {
        let mut document: Value = if path.exists() {
            let body = fs::read_to_string(path)
                .with_context(|| format!("failed to read snapshot table {}", path.display()))?;
            serde_json::from_str(&body)
                .with_context(|| format!("invalid JSON in snapshot table {}", path.display()))?
        } else {
            Value::Array(Vec::new())
        };

        let Value::Array(items) = &mut document else {
            return Err(anyhow!(
                "snapshot table {} MUST be a JSON array",
                path.display()
            ));
        };
        items.push(row);

        let serialized =
            serde_json::to_string_pretty(&document).context("failed to serialize snapshot table")?;
        fs::write(path, serialized)
            .with_context(|| format!("failed to write snapshot table {}", path.display()))?;
        Ok(())
    }
}

impl SnapshotSource for FileSnapshotSource {
    fn load(&self) -> Result<Snapshot> {
        let users = users_from_rows(&Self::read_table(&self.paths.users, true)?);
        let recognitions = recognitions_from_rows(&Self::read_table(&self.paths.recognitions, true)?);
        let rewards = rewards_from_rows(&Self::read_table(&self.paths.rewards, true)?);
        let redemptions = redemptions_from_rows(&Self::read_table(&self.paths.redemptions, false)?);

        info!(
            users = users.len(),
            recognitions = recognitions.len(),
            rewards = rewards.len(),
            redemptions = redemptions.len(),
            "loaded snapshot"
        );

        Ok(Snapshot {
            users,
            recognitions,
            rewards,
            redemptions,
            loaded_at: now_utc(),
        })
    }

    fn append_redemption(&self, record: &RedemptionRecord) -> Result<()> {
        let requested_at =
            format_rfc3339(record.requested_at).map_err(|err| anyhow!(err.to_string()))?;
        Self::append_row(
            &self.paths.redemptions,
            serde_json::json!({
                "redemption_id": record.redemption_id,
                "user_id": record.user_id,
                "reward_id": record.reward_id,
                "requested_at": requested_at,
                "status": record.status.as_str(),
            }),
        )
    }

    fn append_recognition(&self, event: &RecognitionEvent) -> Result<()> {
        let occurred_at =
            format_rfc3339(event.occurred_at).map_err(|err| anyhow!(err.to_string()))?;
        Self::append_row(
            &self.paths.recognitions,
            serde_json::json!({
                "recognition_id": event.recognition_id,
                "giver_id": event.giver_id,
                "receiver_id": event.receiver_id,
                "principle": event.principle,
                "reason": event.reason,
                "occurred_at": occurred_at,
            }),
        )
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SnapshotIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SnapshotCheck {
    pub healthy: bool,
    pub counts: SnapshotCounts,
    pub issues: Vec<SnapshotIssue>,
}

/// Cross-table integrity audit of one snapshot. The engine degrades
/// silently over these conditions at computation time; the check surfaces
/// them so operators can fix the sheet instead.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn check_snapshot(snapshot: &Snapshot) -> SnapshotCheck {
    let mut issues = Vec::new();

    for redemption in &snapshot.redemptions {
        if snapshot.reward(&redemption.reward_id).is_none() {
            issues.push(SnapshotIssue {
                code: "unknown_reward_reference".to_string(),
                severity: IssueSeverity::Error,
                message: format!(
                    "redemption {} references missing reward {}",
                    redemption.redemption_id, redemption.reward_id
                ),
            });
        }

        match snapshot.user(&redemption.user_id) {
            None => {
                issues.push(SnapshotIssue {
                    code: "unknown_user_reference".to_string(),
                    severity: IssueSeverity::Warning,
                    message: format!(
                        "redemption {} references missing user {}",
                        redemption.redemption_id, redemption.user_id
                    ),
                });
            }
            Some(user) if user.status == UserStatus::Inactive => {
                issues.push(SnapshotIssue {
                    code: "inactive_user_redemption".to_string(),
                    severity: IssueSeverity::Warning,
                    message: format!(
                        "redemption {} belongs to inactive user {}",
                        redemption.redemption_id, redemption.user_id
                    ),
                });
            }
            Some(_) => {}
        }
    }

    for user in &snapshot.users {
        let received = snapshot.recognitions_received_by(&user.user_id).len();
        let gross = gross_points(received, user.historical_points);
        let net = net_points(gross, &snapshot.redemptions_by(&user.user_id), &snapshot.rewards);
        if net < 0 {
            issues.push(SnapshotIssue {
                code: "negative_net_points".to_string(),
                severity: IssueSeverity::Warning,
                message: format!(
                    "user {} has negative net points ({net}); externally-entered history is inconsistent",
                    user.user_id
                ),
            });
        }
    }

    for reward in &snapshot.rewards {
        let spending = snapshot
            .redemptions
            .iter()
            .filter(|redemption| {
                redemption.status.counts_as_spending() && redemption.reward_id == reward.reward_id
            })
            .count();
        let spending = u32::try_from(spending).unwrap_or(u32::MAX);
        if spending > reward.initial_stock {
            issues.push(SnapshotIssue {
                code: "over_redeemed_stock".to_string(),
                severity: IssueSeverity::Warning,
                message: format!(
                    "reward {} has {spending} spending redemptions against initial stock {}",
                    reward.reward_id, reward.initial_stock
                ),
            });
        }
    }

    let healthy = !issues
        .iter()
        .any(|issue| issue.severity == IssueSeverity::Error);

    SnapshotCheck {
        healthy,
        counts: snapshot_counts(snapshot),
        issues,
    }
}

fn snapshot_counts(snapshot: &Snapshot) -> SnapshotCounts {
    SnapshotCounts {
        users: snapshot.users.len(),
        recognitions: snapshot.recognitions.len(),
        rewards: snapshot.rewards.len(),
        redemptions: snapshot.redemptions.len(),
        loaded_at: format_rfc3339(snapshot.loaded_at).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RewardAvailability {
    pub reward: RewardDefinition,
    pub available_stock: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LeaderboardRow {
    pub rank: usize,
    pub user_id: String,
    pub name: String,
    pub gross_points: i64,
    pub level_name: String,
}

/// Engine facade over the current snapshot. The admission decision and the
/// record append happen as a single atomic unit behind one mutex, so two
/// racing requests cannot both claim the last unit of stock or spend the
/// same points.
pub struct RewardsLedger {
    state: Mutex<Snapshot>,
    level_table: LevelTable,
    badge_catalog: BadgeCatalog,
    source: Box<dyn SnapshotSource + Send + Sync>,
}

impl RewardsLedger {
    pub fn open(
        source: Box<dyn SnapshotSource + Send + Sync>,
        level_table: LevelTable,
        badge_catalog: BadgeCatalog,
    ) -> Result<Self> {
        let snapshot = source.load()?;
        Ok(Self {
            state: Mutex::new(snapshot),
            level_table,
            badge_catalog,
            source,
        })
    }

    fn state(&self) -> MutexGuard<'_, Snapshot> {
        // The snapshot is replaced wholesale on refresh; a poisoned lock
        // still holds a coherent snapshot, so recover it.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Full reload from the source, replacing the in-memory snapshot.
    pub fn refresh(&self) -> Result<SnapshotCounts> {
        let fresh = self.source.load()?;
        let counts = snapshot_counts(&fresh);
        *self.state() = fresh;
        Ok(counts)
    }

    #[must_use]
    pub fn counts(&self) -> SnapshotCounts {
        snapshot_counts(&self.state())
    }

    #[must_use]
    pub fn check(&self) -> SnapshotCheck {
        check_snapshot(&self.state())
    }

    pub fn user_summary(&self, user_id: &str) -> Result<UserSummary, LedgerError> {
        let snapshot = self.state();
        let user = snapshot
            .user(user_id)
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?;

        Ok(summarize_user(
            user,
            &snapshot.recognitions,
            &snapshot.redemptions,
            &snapshot.rewards,
            &self.level_table,
            &self.badge_catalog,
        ))
    }

    #[must_use]
    pub fn rewards_with_stock(&self) -> Vec<RewardAvailability> {
        let snapshot = self.state();
        snapshot
            .rewards
            .iter()
            .map(|reward| RewardAvailability {
                reward: reward.clone(),
                available_stock: available_stock(reward, &snapshot.redemptions),
            })
            .collect()
    }

    /// Active, non-admin users ranked by gross points descending, name
    /// ascending on ties.
    #[must_use]
    pub fn leaderboard(&self, limit: usize) -> Vec<LeaderboardRow> {
        let snapshot = self.state();
        let mut ranked: Vec<(i64, &User)> = snapshot
            .users
            .iter()
            .filter(|user| user.status == UserStatus::Active && user.role != UserRole::Admin)
            .map(|user| {
                let received = snapshot.recognitions_received_by(&user.user_id).len();
                (gross_points(received, user.historical_points), user)
            })
            .collect();

        ranked.sort_by(|(left_points, left), (right_points, right)| {
            right_points
                .cmp(left_points)
                .then_with(|| left.name.cmp(&right.name))
        });

        ranked
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(index, (points, user))| LeaderboardRow {
                rank: index + 1,
                user_id: user.user_id.clone(),
                name: user.name.clone(),
                gross_points: points,
                level_name: self.level_table.level_for(points).name.clone(),
            })
            .collect()
    }

    /// The guarded redemption path. Net points, level, and stock are all
    /// recomputed from the snapshot inside the critical section, and the
    /// record is appended through the source before the in-memory snapshot
    /// reflects it; there is no partial-success state.
    pub fn request_redemption(
        &self,
        user_id: &str,
        reward_id: &str,
    ) -> Result<RedemptionRecord, LedgerError> {
        let mut snapshot = self.state();

        let user = snapshot
            .user(user_id)
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?
            .clone();
        if user.status != UserStatus::Active {
            return Err(LedgerError::InactiveUser(user_id.to_string()));
        }

        let reward = snapshot
            .reward(reward_id)
            .ok_or_else(|| LedgerError::UnknownReward(reward_id.to_string()))?
            .clone();

        let received = snapshot.recognitions_received_by(&user.user_id).len();
        let gross = gross_points(received, user.historical_points);
        let net = net_points(gross, &snapshot.redemptions_by(&user.user_id), &snapshot.rewards);
        let stock = available_stock(&reward, &snapshot.redemptions);
        let level = self.level_table.level_for(gross).level;

        let record = admit_redemption(&user, &reward, net, stock, level, now_utc())?;
        self.source.append_redemption(&record)?;
        snapshot.redemptions.push(record.clone());

        info!(
            user_id = %record.user_id,
            reward_id = %record.reward_id,
            redemption_id = %record.redemption_id,
            "redemption admitted"
        );
        Ok(record)
    }

    /// Grants a recognition: only granters and admins may give, both
    /// parties must be active, self-recognition is refused, and the
    /// principle must belong to the badge catalog.
    pub fn grant_recognition(
        &self,
        giver_id: &str,
        receiver_id: &str,
        principle: &str,
        reason: &str,
    ) -> Result<RecognitionEvent, LedgerError> {
        if giver_id == receiver_id {
            return Err(LedgerError::SelfRecognition);
        }
        if reason.trim().is_empty() {
            return Err(LedgerError::EmptyReason);
        }
        if !self.badge_catalog.contains_principle(principle) {
            return Err(LedgerError::UnknownPrinciple(principle.to_string()));
        }

        let mut snapshot = self.state();

        let giver = snapshot
            .user(giver_id)
            .ok_or_else(|| LedgerError::UnknownUser(giver_id.to_string()))?;
        if giver.status != UserStatus::Active {
            return Err(LedgerError::InactiveUser(giver_id.to_string()));
        }
        if !giver.role.may_grant() {
            return Err(LedgerError::NotAGranter(giver_id.to_string()));
        }

        let receiver = snapshot
            .user(receiver_id)
            .ok_or_else(|| LedgerError::UnknownUser(receiver_id.to_string()))?;
        if receiver.status != UserStatus::Active {
            return Err(LedgerError::InactiveUser(receiver_id.to_string()));
        }

        let event = RecognitionEvent {
            recognition_id: Ulid::new().to_string(),
            giver_id: giver_id.to_string(),
            receiver_id: receiver_id.to_string(),
            principle: principle.to_string(),
            reason: reason.trim().to_string(),
            occurred_at: now_utc(),
        };

        self.source.append_recognition(&event)?;
        snapshot.recognitions.push(event.clone());

        info!(
            giver_id = %event.giver_id,
            receiver_id = %event.receiver_id,
            principle = %event.principle,
            "recognition granted"
        );
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn raw_row(fields: &[(&str, &str)]) -> RawRow {
        fields
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect()
    }

    fn fixture_user(user_id: &str, role: UserRole, historical: i64) -> User {
        User {
            user_id: user_id.to_string(),
            name: format!("User {user_id}"),
            email: format!("{user_id}@example.com"),
            status: UserStatus::Active,
            role,
            historical_points: historical,
        }
    }

    fn fixture_recognition(id: &str, receiver: &str) -> RecognitionEvent {
        RecognitionEvent {
            recognition_id: id.to_string(),
            giver_id: "granter".to_string(),
            receiver_id: receiver.to_string(),
            principle: "Excelencia".to_string(),
            reason: "fixture".to_string(),
            occurred_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn fixture_reward(id: &str, cost: i64, stock: u32) -> RewardDefinition {
        RewardDefinition {
            reward_id: id.to_string(),
            name: format!("Reward {id}"),
            description: "fixture".to_string(),
            required_level: 0,
            initial_stock: stock,
            point_cost: cost,
        }
    }

    fn fixture_snapshot() -> Snapshot {
        Snapshot {
            users: vec![
                fixture_user("u-1", UserRole::Contributor, 0),
                fixture_user("u-2", UserRole::Granter, 0),
            ],
            recognitions: (0..5)
                .map(|index| fixture_recognition(&format!("a-{index}"), "u-1"))
                .collect(),
            rewards: vec![fixture_reward("rw-1", 300, 1)],
            redemptions: Vec::new(),
            loaded_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn temp_data_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("aplauso-snapshot-{}", Ulid::new()));
        if let Err(err) = fs::create_dir_all(&dir) {
            panic!("failed to create temp data dir: {err}");
        }
        dir
    }

    fn write_snapshot_files(dir: &Path, snapshot: &Snapshot) {
        let users: Vec<Value> = snapshot
            .users
            .iter()
            .map(|user| {
                serde_json::json!({
                    "usuario_id": user.user_id,
                    "nombre": user.name,
                    "email": user.email,
                    "estado": if user.status == UserStatus::Active { "Activo" } else { "Inactivo" },
                    "rol": match user.role {
                        UserRole::Admin => "admin",
                        UserRole::Granter => "Otorgador",
                        UserRole::Contributor => "colaborador",
                    },
                    "puntos_anteriores": user.historical_points.to_string(),
                })
            })
            .collect();
        let recognitions: Vec<Value> = snapshot
            .recognitions
            .iter()
            .map(|event| {
                serde_json::json!({
                    "aplauso_id": event.recognition_id,
                    "otorgante_id": event.giver_id,
                    "receptor_id": event.receiver_id,
                    "principio": event.principle,
                    "motivo": event.reason,
                    "fecha": "2026-01-15T10:00:00Z",
                })
            })
            .collect();
        let rewards: Vec<Value> = snapshot
            .rewards
            .iter()
            .map(|reward| {
                serde_json::json!({
                    "recompensa_id": reward.reward_id,
                    "nombre": reward.name,
                    "descripcion": reward.description,
                    "nivel_requerido": reward.required_level.to_string(),
                    "stock": reward.initial_stock.to_string(),
                    "puntos_costo": reward.point_cost.to_string(),
                })
            })
            .collect();
        let redemptions: Vec<Value> = snapshot
            .redemptions
            .iter()
            .map(|redemption| {
                serde_json::json!({
                    "canje_id": redemption.redemption_id,
                    "usuario_id": redemption.user_id,
                    "recompensa_id": redemption.reward_id,
                    "fecha": "2026-02-01T10:00:00Z",
                    "estado": redemption.status.as_str(),
                })
            })
            .collect();

        for (name, rows) in [
            ("users.json", users),
            ("recognitions.json", recognitions),
            ("rewards.json", rewards),
            ("redemptions.json", redemptions),
        ] {
            let serialized = match serde_json::to_string_pretty(&Value::Array(rows)) {
                Ok(value) => value,
                Err(err) => panic!("failed to serialize fixture table: {err}"),
            };
            if let Err(err) = fs::write(dir.join(name), serialized) {
                panic!("failed to write fixture table: {err}");
            }
        }
    }

    fn fixture_ledger(snapshot: &Snapshot) -> (RewardsLedger, PathBuf) {
        let dir = temp_data_dir();
        write_snapshot_files(&dir, snapshot);
        let source = FileSnapshotSource::new(SnapshotPaths::from_dir(&dir));
        let ledger = must(RewardsLedger::open(
            Box::new(source),
            must(LevelTable::standard()),
            must(BadgeCatalog::standard()),
        ));
        (ledger, dir)
    }

    #[test]
    fn header_normalization_matches_sheet_mangling() {
        assert_eq!(normalize_header("\u{feff}Usuario ID"), "usuario_id");
        assert_eq!(normalize_header("\"estado:\""), "estado");
        assert_eq!(normalize_header("  Puntos   Costo "), "puntos_costo");
    }

    #[test]
    fn lenient_numerics_default_to_zero() {
        assert_eq!(lenient_i64(" 42 "), 42);
        assert_eq!(lenient_i64("n/a"), 0);
        assert_eq!(lenient_i64(""), 0);
        assert_eq!(lenient_u32("-3"), 0);
    }

    #[test]
    fn lenient_timestamp_accepts_sheet_formats() {
        let rfc = lenient_timestamp("2026-01-15T10:00:00Z");
        assert_eq!(rfc.year(), 2026);

        let offset = lenient_timestamp("2026-01-15T12:00:00+02:00");
        assert_eq!(offset.offset(), UtcOffset::UTC);
        assert_eq!(offset.hour(), 10);

        let dmy = lenient_timestamp("15/01/2026");
        assert_eq!((dmy.year(), u8::from(dmy.month()), dmy.day()), (2026, 1, 15));

        let ymd_time = lenient_timestamp("2026-01-15 08:30");
        assert_eq!((ymd_time.hour(), ymd_time.minute()), (8, 30));

        assert_eq!(lenient_timestamp("not a date"), OffsetDateTime::UNIX_EPOCH);
    }

    #[test]
    fn user_transform_maps_roles_and_skips_missing_ids() {
        let rows = vec![
            raw_row(&[
                ("usuario_id", "u-1"),
                ("nombre", "Ana"),
                ("estado", "Activo"),
                ("rol_otorgador", "Editor"),
                ("puntos_anteriores", "250"),
            ]),
            raw_row(&[("nombre", "Sin Id")]),
        ];

        let users = users_from_rows(&rows);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].role, UserRole::Granter);
        assert_eq!(users[0].status, UserStatus::Active);
        assert_eq!(users[0].historical_points, 250);
    }

    #[test]
    fn redemption_transform_maps_spanish_statuses() {
        let rows = vec![raw_row(&[
            ("canje_id", "rd-1"),
            ("usuario_id", "u-1"),
            ("recompensa_id", "rw-1"),
            ("estado", " Rechazado "),
            ("fecha", "2026-02-01T10:00:00Z"),
        ])];

        let redemptions = redemptions_from_rows(&rows);
        assert_eq!(redemptions.len(), 1);
        assert_eq!(redemptions[0].status, RedemptionStatus::Rejected);
        assert!(!redemptions[0].status.counts_as_spending());
    }

    #[test]
    fn reward_transform_degrades_malformed_numbers_to_zero() {
        let rows = vec![raw_row(&[
            ("recompensa_id", "rw-1"),
            ("nombre", "Día libre"),
            ("nivel_requerido", "dos"),
            ("stock", ""),
            ("puntos_costo", "300"),
        ])];

        let rewards = rewards_from_rows(&rows);
        assert_eq!(rewards[0].required_level, 0);
        assert_eq!(rewards[0].initial_stock, 0);
        assert_eq!(rewards[0].point_cost, 300);
    }

    #[test]
    fn check_flags_unknown_reward_reference_as_error() {
        let mut snapshot = fixture_snapshot();
        snapshot.redemptions.push(RedemptionRecord {
            redemption_id: "rd-1".to_string(),
            user_id: "u-1".to_string(),
            reward_id: "rw-missing".to_string(),
            requested_at: OffsetDateTime::UNIX_EPOCH,
            status: RedemptionStatus::Pending,
        });

        let check = check_snapshot(&snapshot);
        assert!(!check.healthy);
        assert!(check
            .issues
            .iter()
            .any(|issue| issue.code == "unknown_reward_reference"
                && issue.severity == IssueSeverity::Error));
    }

    #[test]
    fn check_flags_over_redemption_and_negative_net_as_warnings() {
        let mut snapshot = fixture_snapshot();
        // Two spending redemptions against a single unit of stock, charged
        // to a user who only earned 500 gross points.
        for index in 0..2 {
            snapshot.redemptions.push(RedemptionRecord {
                redemption_id: format!("rd-{index}"),
                user_id: "u-1".to_string(),
                reward_id: "rw-1".to_string(),
                requested_at: OffsetDateTime::UNIX_EPOCH,
                status: RedemptionStatus::Approved,
            });
        }

        let check = check_snapshot(&snapshot);
        assert!(check.healthy);
        assert!(check
            .issues
            .iter()
            .any(|issue| issue.code == "over_redeemed_stock"));
        assert!(check
            .issues
            .iter()
            .any(|issue| issue.code == "negative_net_points"));
    }

    #[test]
    fn redemption_succeeds_then_exhausted_stock_denies() {
        let (ledger, _dir) = fixture_ledger(&fixture_snapshot());

        let record = must(ledger.request_redemption("u-1", "rw-1"));
        assert_eq!(record.status, RedemptionStatus::Pending);
        assert_eq!(record.user_id, "u-1");

        // The single unit is gone; the same request must now be denied.
        let denied = ledger.request_redemption("u-1", "rw-1");
        match denied {
            Err(LedgerError::Denied(AdmissionError::OutOfStock { reward_id })) => {
                assert_eq!(reward_id, "rw-1");
            }
            other => panic!("expected OutOfStock denial, got {other:?}"),
        }
    }

    #[test]
    fn redemption_append_survives_reload() {
        let (ledger, dir) = fixture_ledger(&fixture_snapshot());
        let record = must(ledger.request_redemption("u-1", "rw-1"));

        // A fresh ledger over the same files sees the appended record.
        let source = FileSnapshotSource::new(SnapshotPaths::from_dir(&dir));
        let reloaded = must(source.load());
        assert_eq!(reloaded.redemptions.len(), 1);
        assert_eq!(reloaded.redemptions[0].redemption_id, record.redemption_id);
        assert_eq!(reloaded.redemptions[0].status, RedemptionStatus::Pending);
    }

    #[test]
    fn racing_redemptions_cannot_oversell_the_last_unit() {
        let (ledger, _dir) = fixture_ledger(&fixture_snapshot());
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.request_redemption("u-1", "rw-1").is_ok())
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => panic!("redemption thread panicked"),
            })
            .filter(|succeeded| *succeeded)
            .count();

        assert_eq!(successes, 1);
    }

    #[test]
    fn insufficient_points_denial_is_typed() {
        let mut snapshot = fixture_snapshot();
        snapshot.rewards = vec![fixture_reward("rw-1", 600, 5)];
        let (ledger, _dir) = fixture_ledger(&snapshot);

        let denied = ledger.request_redemption("u-1", "rw-1");
        match denied {
            Err(LedgerError::Denied(AdmissionError::InsufficientPoints {
                available,
                required,
            })) => {
                assert_eq!(available, 500);
                assert_eq!(required, 600);
            }
            other => panic!("expected InsufficientPoints denial, got {other:?}"),
        }
    }

    #[test]
    fn level_gate_denies_below_required_level() {
        let mut snapshot = fixture_snapshot();
        snapshot.rewards = vec![RewardDefinition {
            required_level: 4,
            ..fixture_reward("rw-1", 100, 5)
        }];
        let (ledger, _dir) = fixture_ledger(&snapshot);

        let denied = ledger.request_redemption("u-1", "rw-1");
        assert!(matches!(
            denied,
            Err(LedgerError::Denied(AdmissionError::LevelTooLow {
                level: 2,
                required_level: 4,
            }))
        ));
    }

    #[test]
    fn refresh_replaces_the_snapshot_wholesale() {
        let (ledger, dir) = fixture_ledger(&fixture_snapshot());
        assert_eq!(ledger.counts().recognitions, 5);

        let mut bigger = fixture_snapshot();
        bigger
            .recognitions
            .push(fixture_recognition("a-extra", "u-2"));
        write_snapshot_files(&dir, &bigger);

        let counts = must(ledger.refresh());
        assert_eq!(counts.recognitions, 6);
        assert_eq!(ledger.counts().recognitions, 6);
    }

    #[test]
    fn grant_recognition_enforces_roles_and_catalog() {
        let (ledger, _dir) = fixture_ledger(&fixture_snapshot());

        // u-1 is a contributor and may not grant.
        assert!(matches!(
            ledger.grant_recognition("u-1", "u-2", "Excelencia", "great work"),
            Err(LedgerError::NotAGranter(_))
        ));

        assert!(matches!(
            ledger.grant_recognition("u-2", "u-2", "Excelencia", "great work"),
            Err(LedgerError::SelfRecognition)
        ));

        assert!(matches!(
            ledger.grant_recognition("u-2", "u-1", "Puntualidad", "great work"),
            Err(LedgerError::UnknownPrinciple(_))
        ));

        let event = must(ledger.grant_recognition("u-2", "u-1", "Excelencia", "great work"));
        assert_eq!(event.receiver_id, "u-1");
        assert_eq!(ledger.counts().recognitions, 6);

        let summary = must(ledger.user_summary("u-1"));
        assert_eq!(summary.recognition_count, 6);
        assert_eq!(summary.gross_points, 600);
    }

    #[test]
    fn leaderboard_ranks_active_non_admins_by_gross_points() {
        let mut snapshot = fixture_snapshot();
        snapshot.users.push(fixture_user("u-3", UserRole::Admin, 9_000));
        let mut inactive = fixture_user("u-4", UserRole::Contributor, 9_000);
        inactive.status = UserStatus::Inactive;
        snapshot.users.push(inactive);
        let (ledger, _dir) = fixture_ledger(&snapshot);

        let rows = ledger.leaderboard(10);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].user_id, "u-1");
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[0].gross_points, 500);
        assert_eq!(rows[0].level_name, "Participante");
    }

    proptest! {
        #[test]
        fn leveling_is_monotonic(points in proptest::collection::vec(0_i64..5_000, 1..40)) {
            let table = must(LevelTable::standard());
            let mut sorted = points;
            sorted.sort_unstable();

            let mut previous = 0;
            for value in sorted {
                let level = table.level_for(value).level;
                prop_assert!(level >= previous);
                previous = level;
            }
        }

        #[test]
        fn stock_conservation_holds(initial in 0_u32..20, spending in 0_u32..30, rejected in 0_u32..10) {
            let reward = fixture_reward("rw-1", 100, initial);
            let mut redemptions = Vec::new();
            for index in 0..spending {
                redemptions.push(RedemptionRecord {
                    redemption_id: format!("rd-s-{index}"),
                    user_id: "u-1".to_string(),
                    reward_id: "rw-1".to_string(),
                    requested_at: OffsetDateTime::UNIX_EPOCH,
                    status: RedemptionStatus::Approved,
                });
            }
            for index in 0..rejected {
                redemptions.push(RedemptionRecord {
                    redemption_id: format!("rd-r-{index}"),
                    user_id: "u-1".to_string(),
                    reward_id: "rw-1".to_string(),
                    requested_at: OffsetDateTime::UNIX_EPOCH,
                    status: RedemptionStatus::Rejected,
                });
            }

            let stock = available_stock(&reward, &redemptions);
            prop_assert_eq!(stock, initial.saturating_sub(spending));
        }

        #[test]
        fn rejection_never_lowers_net_points(cost in 0_i64..1_000, gross in 0_i64..5_000) {
            let reward = fixture_reward("rw-1", cost, 5);
            let rewards = vec![reward];
            let active = vec![RedemptionRecord {
                redemption_id: "rd-1".to_string(),
                user_id: "u-1".to_string(),
                reward_id: "rw-1".to_string(),
                requested_at: OffsetDateTime::UNIX_EPOCH,
                status: RedemptionStatus::Pending,
            }];
            let mut refunded = active.clone();
            refunded[0].status = RedemptionStatus::Rejected;

            let before = net_points(gross, &active, &rewards);
            let after = net_points(gross, &refunded, &rewards);
            prop_assert!(after >= before);
            prop_assert_eq!(after - before, cost);
        }
    }
}
