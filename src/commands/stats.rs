use owo_colors::OwoColorize;

use crate::config::{load_config, stats_file_path};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::{CliError, CliResult};

pub async fn handle_stats_cmd(json: bool) -> CliResult<()> {
    let cfg = load_config()
        .await
        .map_err(|e| CliError::ProxyConfig(format!("{e:#}")))?;
    let path = stats_file_path();
    let stats = StatsAggregator::load_or_new(
        &path,
        cfg.stats.utc_offset_minutes,
        cfg.stats.history_days,
    )
    .await
    .map_err(|e| CliError::Stats(format!("{e:#}")))?;
    let snap = stats.snapshot();

    if json {
        let text = serde_json::to_string_pretty(&snap)
            .map_err(|e| CliError::Stats(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    if !path.exists() {
        println!("No stats recorded yet ({:?} does not exist)", path);
        return Ok(());
    }
    print_snapshot(&snap);
    Ok(())
}

fn success_rate(success: u64, fail: u64) -> String {
    let total = success + fail;
    if total == 0 {
        return "-".to_string();
    }
    format!("{:.1}%", success as f64 * 100.0 / total as f64)
}

fn print_snapshot(snap: &StatsSnapshot) {
    println!(
        "total: {} ok / {} failed ({})",
        snap.total.success.green(),
        snap.total.fail.red(),
        success_rate(snap.total.success, snap.total.fail)
    );
    println!(
        "today ({}): {} ok / {} failed",
        snap.today.date, snap.today.success, snap.today.fail
    );

    if !snap.by_channel_id.is_empty() {
        println!();
        println!("by channel:");
        for (id, c) in &snap.by_channel_id {
            println!(
                "  {:<40} {:>8} ok {:>8} failed  {}",
                id,
                c.success,
                c.fail,
                success_rate(c.success, c.fail)
            );
        }
    }

    if !snap.days.is_empty() {
        println!();
        println!("by day:");
        for d in &snap.days {
            println!("  {}  {:>8} ok {:>8} failed", d.date, d.success, d.fail);
        }
    }
}
