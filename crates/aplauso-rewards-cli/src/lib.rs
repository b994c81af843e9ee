//! Command surface for the rewards engine.
//!
//! Host processes embed the same behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for direct command execution against an open
//!   [`RewardsLedger`].

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use aplauso_rewards_core::{BadgeCatalog, LevelTable, UserSummary};
use aplauso_rewards_snapshot::{
    FileSnapshotSource, IssueSeverity, LeaderboardRow, LedgerError, RewardAvailability,
    RewardsLedger, SnapshotCheck, SnapshotPaths,
};
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "aplauso")]
#[command(about = "Aplauso recognition rewards CLI")]
pub struct Cli {
    /// Directory holding the snapshot tables (users.json, recognitions.json,
    /// rewards.json, redemptions.json).
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Rewards {
        #[command(subcommand)]
        command: Box<RewardsCommand>,
    },
    Redeem(RedeemArgs),
    Recognize(RecognizeArgs),
    Leaderboard(LeaderboardArgs),
    Snapshot {
        #[command(subcommand)]
        command: Box<SnapshotCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Show(UserShowArgs),
}

#[derive(Debug, Args)]
pub struct UserShowArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RewardsCommand {
    List(RewardsListArgs),
}

#[derive(Debug, Args)]
pub struct RewardsListArgs {
    /// Only rewards gated at exactly this level.
    #[arg(long)]
    level: Option<u32>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RedeemArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    reward_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RecognizeArgs {
    #[arg(long)]
    giver_id: String,
    #[arg(long)]
    receiver_id: String,
    #[arg(long)]
    principle: String,
    #[arg(long)]
    reason: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LeaderboardArgs {
    #[arg(long, default_value_t = 10)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum SnapshotCommand {
    Check(SnapshotCheckArgs),
    Show(SnapshotShowArgs),
}

#[derive(Debug, Args)]
pub struct SnapshotCheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SnapshotShowArgs {
    #[arg(long)]
    json: bool,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the snapshot cannot be loaded, the platform
/// configuration is invalid, or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let source = FileSnapshotSource::new(SnapshotPaths::from_dir(&cli.data));
    let level_table = LevelTable::standard().map_err(|err| anyhow!(err.to_string()))?;
    let badge_catalog = BadgeCatalog::standard().map_err(|err| anyhow!(err.to_string()))?;
    let ledger = RewardsLedger::open(Box::new(source), level_table, badge_catalog)?;
    run_command(cli.command, &ledger)
}

/// Executes a parsed command against an open ledger.
///
/// # Errors
/// Returns an error for unknown entities, denied redemptions, unhealthy
/// snapshots, and source failures. Denials are reported after printing the
/// typed reason so scripted callers get a non-zero exit.
pub fn run_command(command: Command, ledger: &RewardsLedger) -> Result<()> {
    match command {
        Command::User { command } => match *command {
            UserCommand::Show(args) => {
                let summary = ledger.user_summary(&args.user_id)?;
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                } else {
                    print_user_summary(&summary);
                }
                Ok(())
            }
        },
        Command::Rewards { command } => match *command {
            RewardsCommand::List(args) => {
                let mut rewards = ledger.rewards_with_stock();
                if let Some(level) = args.level {
                    rewards.retain(|item| item.reward.required_level == level);
                }
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&rewards)?);
                } else {
                    print_rewards_table(&rewards);
                }
                Ok(())
            }
        },
        Command::Redeem(args) => match ledger.request_redemption(&args.user_id, &args.reward_id) {
            Ok(record) => {
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                } else {
                    println!(
                        "redemption {} admitted: user={} reward={} status={}",
                        record.redemption_id,
                        record.user_id,
                        record.reward_id,
                        record.status.as_str()
                    );
                }
                Ok(())
            }
            Err(LedgerError::Denied(denial)) => {
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&denial)?);
                } else {
                    println!("redemption denied: {denial}");
                }
                Err(anyhow!("redemption denied: {denial}"))
            }
            Err(other) => Err(other.into()),
        },
        Command::Recognize(args) => {
            let event = ledger.grant_recognition(
                &args.giver_id,
                &args.receiver_id,
                &args.principle,
                &args.reason,
            )?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&event)?);
            } else {
                println!(
                    "recognition {} granted: {} -> {} ({})",
                    event.recognition_id, event.giver_id, event.receiver_id, event.principle
                );
            }
            Ok(())
        }
        Command::Leaderboard(args) => {
            let rows = ledger.leaderboard(args.limit);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_leaderboard(&rows);
            }
            Ok(())
        }
        Command::Snapshot { command } => match *command {
            SnapshotCommand::Check(args) => {
                let check = ledger.check();
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&check)?);
                } else {
                    print_snapshot_check(&check);
                }

                if !check.healthy {
                    return Err(anyhow!(
                        "snapshot integrity check failed: {}",
                        check
                            .issues
                            .iter()
                            .map(|issue| format!("{}:{}", issue.code, issue.message))
                            .collect::<Vec<_>>()
                            .join("; ")
                    ));
                }
                Ok(())
            }
            SnapshotCommand::Show(args) => {
                let counts = ledger.counts();
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&counts)?);
                } else {
                    println!(
                        "users={} recognitions={} rewards={} redemptions={} loaded_at={}",
                        counts.users,
                        counts.recognitions,
                        counts.rewards,
                        counts.redemptions,
                        counts.loaded_at
                    );
                }
                Ok(())
            }
        },
    }
}

fn print_user_summary(summary: &UserSummary) {
    println!(
        "{} ({}) level {} ({})",
        summary.name, summary.user_id, summary.level.level, summary.level.name
    );
    println!(
        "recognitions={} gross={} spent={} net={}",
        summary.recognition_count, summary.gross_points, summary.spent_points, summary.net_points
    );
    println!(
        "next level: {} ({:.1}%, {} points needed)",
        summary.progress.next_level_name, summary.progress.percentage, summary.progress.points_needed
    );

    println!("{:<28} {:<20} {:<6} {:<7} earned_at", "badge", "principle", "count", "earned");
    println!("{}", "-".repeat(90));
    for badge in &summary.badges {
        println!(
            "{:<28} {:<20} {:<6} {:<7} {}",
            badge.name,
            badge.principle,
            badge.count,
            if badge.earned { "yes" } else { "no" },
            badge
                .earned_at
                .and_then(|at| aplauso_rewards_core::format_rfc3339(at).ok())
                .unwrap_or_else(|| "n/a".to_string())
        );
    }
}

fn print_rewards_table(rewards: &[RewardAvailability]) {
    println!(
        "{:<12} {:<28} {:<6} {:<6} {:<6} available",
        "reward_id", "name", "level", "cost", "stock"
    );
    println!("{}", "-".repeat(80));
    for item in rewards {
        println!(
            "{:<12} {:<28} {:<6} {:<6} {:<6} {}",
            item.reward.reward_id,
            item.reward.name,
            item.reward.required_level,
            item.reward.point_cost,
            item.reward.initial_stock,
            item.available_stock
        );
    }
}

fn print_leaderboard(rows: &[LeaderboardRow]) {
    println!("{:<5} {:<12} {:<24} {:<8} level", "rank", "user_id", "name", "points");
    println!("{}", "-".repeat(70));
    for row in rows {
        println!(
            "{:<5} {:<12} {:<24} {:<8} {}",
            row.rank, row.user_id, row.name, row.gross_points, row.level_name
        );
    }
}

fn print_snapshot_check(check: &SnapshotCheck) {
    println!(
        "healthy={} users={} recognitions={} rewards={} redemptions={}",
        if check.healthy { "yes" } else { "no" },
        check.counts.users,
        check.counts.recognitions,
        check.counts.rewards,
        check.counts.redemptions
    );
    for issue in &check.issues {
        let severity = match issue.severity {
            IssueSeverity::Warning => "warning",
            IssueSeverity::Error => "error",
        };
        println!("{severity}:{}:{}", issue.code, issue.message);
    }
}
