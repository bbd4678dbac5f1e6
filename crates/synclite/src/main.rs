use clap::{Parser, Subcommand};

use synclite::{CompactOptions, Db};

#[derive(Parser)]
#[command(name = "synclite")]
#[command(about = "SQLite-backed bucket storage for a data sync service")]
struct Args {
    /// Database file path
    #[arg(short, long, default_value = "synclite.db")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show per-group state, checkpoints and storage counters
    Status,
    /// Rewrite historical bucket ops into MOVE/CLEAR summaries
    Compact {
        /// Group to compact (defaults to the active group)
        #[arg(long)]
        group: Option<i64>,
        /// Ops within this distance of the checkpoint are left untouched
        #[arg(long, default_value_t = 1000)]
        max_op_id_lag: u64,
        /// MOVE rewrites applied per transaction
        #[arg(long, default_value_t = 2000)]
        move_batch_limit: usize,
        /// Prefix ops collapsed per transaction (0 disables CLEAR collapse)
        #[arg(long, default_value_t = 5000)]
        clear_batch_limit: usize,
        /// Memory budget for supersession tracking, in MB
        #[arg(long, default_value_t = 64)]
        memory_limit_mb: usize,
    },
    /// Drop all op, parameter and current-data entries for a group
    Clear {
        #[arg(long)]
        group: i64,
    },
    /// Terminate a group
    Terminate {
        #[arg(long)]
        group: i64,
        /// Keep op and parameter storage instead of clearing it
        #[arg(long)]
        keep_storage: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let db = Db::open(&args.db)?;

    match args.command {
        Command::Status => {
            let groups = db.list_groups()?;
            if groups.is_empty() {
                println!("no sync rule groups");
                return Ok(());
            }
            for group in groups {
                let stats = db.group_stats(group.id)?;
                println!(
                    "group {} [{}] checkpoint={} lsn={} ops={} parameters={} current={}",
                    group.id,
                    group.state.as_str(),
                    group.last_checkpoint,
                    group.last_checkpoint_lsn.as_deref().unwrap_or("-"),
                    stats.op_count,
                    stats.parameter_count,
                    stats.current_count,
                );
                if let Some(error) = group.last_fatal_error {
                    println!("  last fatal error: {error}");
                }
            }
        }
        Command::Compact {
            group,
            max_op_id_lag,
            move_batch_limit,
            clear_batch_limit,
            memory_limit_mb,
        } => {
            let group = match group.or(db.active_group()?) {
                Some(group) => group,
                None => anyhow::bail!("no active group; pass --group"),
            };
            let stats = db.compact(
                group,
                &CompactOptions {
                    memory_limit_mb,
                    max_op_id_lag,
                    move_batch_limit,
                    clear_batch_limit,
                },
            )?;
            tracing::info!(
                group,
                buckets = stats.buckets,
                moved = stats.moved_ops,
                cleared = stats.cleared_ops,
                "compaction done"
            );
        }
        Command::Clear { group } => {
            db.clear(group)?;
            tracing::info!(group, "storage cleared");
        }
        Command::Terminate {
            group,
            keep_storage,
        } => {
            db.terminate(group, !keep_storage)?;
            tracing::info!(group, cleared = !keep_storage, "group terminated");
        }
    }

    Ok(())
}
