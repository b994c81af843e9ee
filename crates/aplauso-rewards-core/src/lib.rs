use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Points granted for every recognition received.
pub const POINTS_PER_RECOGNITION: i64 = 100;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Typed denial reasons from the redemption guard. Denials are expected,
/// recoverable outcomes, not faults.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AdmissionError {
    #[error("level {level} is below required level {required_level}")]
    LevelTooLow { level: u32, required_level: u32 },
    #[error("insufficient points: have {available}, need {required}")]
    InsufficientPoints { available: i64, required: i64 },
    #[error("reward {reward_id} is out of stock")]
    OutOfStock { reward_id: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Inactive,
}

impl UserStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    /// Maps an upstream sheet value to a status. Only an explicit
    /// `activo`/`active` marker activates the account; everything else,
    /// including an empty cell, is inactive.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "activo" | "active" => Self::Active,
            _ => Self::Inactive,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Contributor,
    Granter,
    Admin,
}

impl UserRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contributor => "contributor",
            Self::Granter => "granter",
            Self::Admin => "admin",
        }
    }

    /// Maps an upstream sheet role to an engine role. Empty and reader-like
    /// roles become contributors; any other unrecognized non-empty value is
    /// treated as a granter so recognition-giving keeps working when the
    /// sheet invents role spellings.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "admin" | "administrador" => Self::Admin,
            "" | "colaborador" | "contributor" | "lector" => Self::Contributor,
            _ => Self::Granter,
        }
    }

    #[must_use]
    pub fn may_grant(self) -> bool {
        matches!(self, Self::Granter | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    Pending,
    Approved,
    Rejected,
    Unspecified,
}

impl RedemptionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Unspecified => "unspecified",
        }
    }

    /// Case-insensitive, trimmed status mapping. Accepts both the engine's
    /// canonical spellings and the upstream sheet's Spanish spellings;
    /// anything unrecognized is `Unspecified`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "pending" | "pendiente" => Self::Pending,
            "approved" | "aprobado" => Self::Approved,
            "rejected" | "rechazado" => Self::Rejected,
            _ => Self::Unspecified,
        }
    }

    /// A redemption spends points unless it was rejected; rejection is
    /// logically a refund.
    #[must_use]
    pub fn counts_as_spending(self) -> bool {
        self != Self::Rejected
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub status: UserStatus,
    pub role: UserRole,
    /// Carry-over balance from the previous program, added once into gross
    /// points. Immutable input, never derived. May be negative (a debt).
    pub historical_points: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecognitionEvent {
    pub recognition_id: String,
    pub giver_id: String,
    pub receiver_id: String,
    pub principle: String,
    pub reason: String,
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardDefinition {
    pub reward_id: String,
    pub name: String,
    pub description: String,
    pub required_level: u32,
    pub initial_stock: u32,
    pub point_cost: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedemptionRecord {
    pub redemption_id: String,
    pub user_id: String,
    pub reward_id: String,
    pub requested_at: OffsetDateTime,
    /// Mutated by the external approval workflow after creation. The engine
    /// only ever reads it; `pending -> approved` and `pending -> rejected`
    /// are both terminal.
    pub status: RedemptionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LevelEntry {
    pub level: u32,
    pub name: String,
    pub required_points: i64,
}

/// Ordered ladder of level thresholds. Validated once at construction; an
/// empty or non-monotonic table is a configuration fault, not a per-call
/// condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LevelTable {
    entries: Vec<LevelEntry>,
}

impl LevelTable {
    /// Builds a table from explicit entries.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when the table is empty, does
    /// not start at level 0 with 0 points, or is not strictly increasing in
    /// both `level` and `required_points`.
    pub fn new(entries: Vec<LevelEntry>) -> Result<Self, EngineError> {
        let Some(first) = entries.first() else {
            return Err(EngineError::Configuration(
                "level table MUST NOT be empty".to_string(),
            ));
        };

        if first.level != 0 || first.required_points != 0 {
            return Err(EngineError::Configuration(
                "level table MUST start at level 0 with 0 required points".to_string(),
            ));
        }

        for window in entries.windows(2) {
            let [previous, current] = window else {
                continue;
            };
            if current.level <= previous.level {
                return Err(EngineError::Configuration(format!(
                    "level numbers MUST be strictly increasing (level {} follows {})",
                    current.level, previous.level
                )));
            }
            if current.required_points <= previous.required_points {
                return Err(EngineError::Configuration(format!(
                    "required points MUST be strictly increasing (level {} requires {})",
                    current.level, current.required_points
                )));
            }
        }

        Ok(Self { entries })
    }

    /// The platform ladder: seven levels, one new tier every 200 points.
    ///
    /// # Errors
    /// Never fails in practice; kept fallible so callers handle table
    /// construction uniformly.
    pub fn standard() -> Result<Self, EngineError> {
        Self::new(vec![
            level_entry(0, "Novato", 0),
            level_entry(1, "Aprendiz", 200),
            level_entry(2, "Participante", 400),
            level_entry(3, "Contribuidor", 600),
            level_entry(4, "Mentor", 800),
            level_entry(5, "Líder", 1000),
            level_entry(6, "Leyenda", 1200),
        ])
    }

    #[must_use]
    pub fn entries(&self) -> &[LevelEntry] {
        &self.entries
    }

    /// Highest entry whose threshold the given gross points meet. Negative
    /// points land on level 0.
    #[must_use]
    pub fn level_for(&self, points: i64) -> &LevelEntry {
        let mut current = &self.entries[0];
        for entry in &self.entries {
            if points >= entry.required_points {
                current = entry;
            } else {
                break;
            }
        }
        current
    }

    #[must_use]
    pub fn next_level_after(&self, level: u32) -> Option<&LevelEntry> {
        self.entries.iter().find(|entry| entry.level == level + 1)
    }

    /// Progress from the current level toward the next one. At the top of
    /// the ladder the caller gets the maximum-level sentinel.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress_to_next(&self, points: i64) -> LevelProgress {
        let current = self.level_for(points);
        let Some(next) = self.next_level_after(current.level) else {
            return LevelProgress {
                percentage: 100.0,
                points_needed: 0,
                next_level_name: MAX_LEVEL_NAME.to_string(),
            };
        };

        let span = next.required_points - current.required_points;
        let percentage = if span <= 0 {
            100.0
        } else {
            let earned = (points - current.required_points) as f64;
            (earned / span as f64 * 100.0).clamp(0.0, 100.0)
        };

        LevelProgress {
            percentage,
            points_needed: (next.required_points - points).max(0),
            next_level_name: next.name.clone(),
        }
    }
}

/// Sentinel level name reported once the ladder is exhausted.
pub const MAX_LEVEL_NAME: &str = "Máximo";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelProgress {
    pub percentage: f64,
    pub points_needed: i64,
    pub next_level_name: String,
}

/// Gross points from recognitions received plus the historical carry-over.
/// The result is intentionally not floored; display layers decide how to
/// render a carried debt.
#[must_use]
pub fn gross_points(received_count: usize, historical_points: i64) -> i64 {
    let received = i64::try_from(received_count).unwrap_or(i64::MAX);
    received
        .saturating_mul(POINTS_PER_RECOGNITION)
        .saturating_add(historical_points)
}

/// Sum of the costs of this user's spending redemptions. A redemption that
/// references a reward absent from the catalog contributes 0; the snapshot
/// checker surfaces those separately.
#[must_use]
pub fn spent_points(user_redemptions: &[RedemptionRecord], rewards: &[RewardDefinition]) -> i64 {
    user_redemptions
        .iter()
        .filter(|redemption| redemption.status.counts_as_spending())
        .map(|redemption| {
            rewards
                .iter()
                .find(|reward| reward.reward_id == redemption.reward_id)
                .map_or(0, |reward| reward.point_cost)
        })
        .sum()
}

/// Spendable balance: gross minus non-rejected redemption costs. May be
/// negative when externally-entered history is inconsistent; the engine
/// never self-heals that, it only refuses to cause it.
#[must_use]
pub fn net_points(
    gross: i64,
    user_redemptions: &[RedemptionRecord],
    rewards: &[RewardDefinition],
) -> i64 {
    gross - spent_points(user_redemptions, rewards)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BadgeDefinition {
    pub name: String,
    pub principle: String,
    pub description: String,
}

/// The badge definitions plus the shared earn threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BadgeCatalog {
    definitions: Vec<BadgeDefinition>,
    threshold: usize,
}

impl BadgeCatalog {
    /// # Errors
    /// Returns [`EngineError::Configuration`] for an empty definition list,
    /// a zero threshold, or duplicate principles.
    pub fn new(definitions: Vec<BadgeDefinition>, threshold: usize) -> Result<Self, EngineError> {
        if definitions.is_empty() {
            return Err(EngineError::Configuration(
                "badge catalog MUST NOT be empty".to_string(),
            ));
        }
        if threshold == 0 {
            return Err(EngineError::Configuration(
                "badge threshold MUST be >= 1".to_string(),
            ));
        }

        let mut seen = Vec::new();
        for definition in &definitions {
            if seen.contains(&definition.principle.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate badge principle: {}",
                    definition.principle
                )));
            }
            seen.push(definition.principle.as_str());
        }

        Ok(Self {
            definitions,
            threshold,
        })
    }

    /// The platform's five principle badges, earned at three recognitions
    /// of the same principle.
    ///
    /// # Errors
    /// Never fails in practice; kept fallible for uniform construction.
    pub fn standard() -> Result<Self, EngineError> {
        Self::new(
            vec![
                badge_definition(
                    "Maestro de la Innovación",
                    "Innovación",
                    "Premiado por ideas creativas que rompen esquemas y mejoran procesos.",
                ),
                badge_definition(
                    "Campeón del Cliente",
                    "Foco en el Cliente",
                    "Destacado por ir más allá para satisfacer y deleitar a los clientes.",
                ),
                badge_definition(
                    "Colaborador Estrella",
                    "Trabajo en Equipo",
                    "Celebrado por fomentar un ambiente de cooperación y apoyo mutuo.",
                ),
                badge_definition(
                    "Ejecutor Impecable",
                    "Excelencia",
                    "Reconocido por entregar resultados de alta calidad de manera consistente.",
                ),
                badge_definition(
                    "Pilar de Integridad",
                    "Integridad",
                    "Premiado por actuar siempre con honestidad, transparencia y ética.",
                ),
            ],
            3,
        )
    }

    #[must_use]
    pub fn definitions(&self) -> &[BadgeDefinition] {
        &self.definitions
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    #[must_use]
    pub fn contains_principle(&self, principle: &str) -> bool {
        self.definitions
            .iter()
            .any(|definition| definition.principle == principle)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EarnedBadge {
    pub name: String,
    pub principle: String,
    pub description: String,
    pub count: usize,
    pub earned: bool,
    /// Timestamp of the threshold-th qualifying recognition, in ascending
    /// event time. Stable: later qualifying events never move it.
    pub earned_at: Option<OffsetDateTime>,
}

/// Evaluates every badge in the catalog against one user's received
/// recognitions. Pure: identical input yields identical output, and badges
/// with zero qualifying events are still reported with `earned = false`.
#[must_use]
pub fn calculate_earned_badges(
    received: &[RecognitionEvent],
    catalog: &BadgeCatalog,
) -> Vec<EarnedBadge> {
    let mut by_principle: BTreeMap<&str, Vec<&RecognitionEvent>> = BTreeMap::new();
    for event in received {
        by_principle
            .entry(event.principle.as_str())
            .or_default()
            .push(event);
    }

    catalog
        .definitions
        .iter()
        .map(|definition| {
            let mut relevant = by_principle
                .get(definition.principle.as_str())
                .cloned()
                .unwrap_or_default();
            let count = relevant.len();
            let earned = count >= catalog.threshold;

            let earned_at = if earned {
                relevant.sort_by_key(|event| event.occurred_at);
                relevant
                    .get(catalog.threshold - 1)
                    .map(|event| event.occurred_at)
            } else {
                None
            };

            EarnedBadge {
                name: definition.name.clone(),
                principle: definition.principle.clone(),
                description: definition.description.clone(),
                count,
                earned,
                earned_at,
            }
        })
        .collect()
}

/// Spending redemptions per reward id, computed from the entire redemption
/// log. Recomputing from the full log keeps stock consistent when statuses
/// flip out of band.
#[must_use]
pub fn redemption_counts(all_redemptions: &[RedemptionRecord]) -> BTreeMap<String, u32> {
    let mut counts = BTreeMap::new();
    for redemption in all_redemptions {
        if redemption.status.counts_as_spending() {
            *counts.entry(redemption.reward_id.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// Remaining stock for one reward, floored at zero.
#[must_use]
pub fn available_stock(reward: &RewardDefinition, all_redemptions: &[RedemptionRecord]) -> u32 {
    let redeemed = all_redemptions
        .iter()
        .filter(|redemption| {
            redemption.status.counts_as_spending() && redemption.reward_id == reward.reward_id
        })
        .count();
    let redeemed = u32::try_from(redeemed).unwrap_or(u32::MAX);
    reward.initial_stock.saturating_sub(redeemed)
}

/// The transactional gate for a redemption request. Every gate is
/// re-validated here against values computed at confirmation time; stock and
/// balance can both change between the moment an offer is shown and the
/// moment the user confirms.
///
/// On success the fresh record is the only effect; the point deduction is
/// never stored, it is always re-derived from the log.
///
/// # Errors
/// Returns the first failing [`AdmissionError`] gate: level, then points,
/// then stock.
pub fn admit_redemption(
    user: &User,
    reward: &RewardDefinition,
    net: i64,
    stock: u32,
    current_level: u32,
    now: OffsetDateTime,
) -> Result<RedemptionRecord, AdmissionError> {
    if current_level < reward.required_level {
        return Err(AdmissionError::LevelTooLow {
            level: current_level,
            required_level: reward.required_level,
        });
    }

    if net < reward.point_cost {
        return Err(AdmissionError::InsufficientPoints {
            available: net,
            required: reward.point_cost,
        });
    }

    if stock == 0 {
        return Err(AdmissionError::OutOfStock {
            reward_id: reward.reward_id.clone(),
        });
    }

    Ok(RedemptionRecord {
        redemption_id: Ulid::new().to_string(),
        user_id: user.user_id.clone(),
        reward_id: reward.reward_id.clone(),
        requested_at: now,
        status: RedemptionStatus::Pending,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSummary {
    pub user_id: String,
    pub name: String,
    pub recognition_count: usize,
    pub gross_points: i64,
    pub spent_points: i64,
    pub net_points: i64,
    pub level: LevelEntry,
    pub progress: LevelProgress,
    pub badges: Vec<EarnedBadge>,
}

/// Projects one user's derived state from the raw log in a single pass.
/// Nothing is cached or stored; every read recomputes from the snapshot.
/// Leveling uses gross points, so spending never demotes a user.
#[must_use]
pub fn summarize_user(
    user: &User,
    all_recognitions: &[RecognitionEvent],
    all_redemptions: &[RedemptionRecord],
    rewards: &[RewardDefinition],
    level_table: &LevelTable,
    badge_catalog: &BadgeCatalog,
) -> UserSummary {
    let received: Vec<RecognitionEvent> = all_recognitions
        .iter()
        .filter(|event| event.receiver_id == user.user_id)
        .cloned()
        .collect();
    let user_redemptions: Vec<RedemptionRecord> = all_redemptions
        .iter()
        .filter(|redemption| redemption.user_id == user.user_id)
        .cloned()
        .collect();

    let gross = gross_points(received.len(), user.historical_points);
    let spent = spent_points(&user_redemptions, rewards);
    let level = level_table.level_for(gross).clone();
    let progress = level_table.progress_to_next(gross);
    let badges = calculate_earned_badges(&received, badge_catalog);

    UserSummary {
        user_id: user.user_id.clone(),
        name: user.name.clone(),
        recognition_count: received.len(),
        gross_points: gross,
        spent_points: spent,
        net_points: gross - spent,
        level,
        progress,
        badges,
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`EngineError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EngineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EngineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`EngineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EngineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

fn level_entry(level: u32, name: &str, required_points: i64) -> LevelEntry {
    LevelEntry {
        level,
        name: name.to_string(),
        required_points,
    }
}

fn badge_definition(name: &str, principle: &str, description: &str) -> BadgeDefinition {
    BadgeDefinition {
        name: name.to_string(),
        principle: principle.to_string(),
        description: description.to_string(),
    }
}
