use owo_colors::OwoColorize;

use crate::config::{
    ProxyConfig, config_file_path, config_warnings, init_config_toml, load_config_from,
};
use crate::{CliError, CliResult, ConfigCommand};

pub async fn handle_config_cmd(cmd: ConfigCommand) -> CliResult<()> {
    match cmd {
        ConfigCommand::Init { force } => {
            let path = init_config_toml(force)
                .await
                .map_err(|e| CliError::ProxyConfig(e.to_string()))?;
            println!("Wrote TOML config template to {:?}", path);
        }
        ConfigCommand::Check => {
            let path = config_file_path();
            if !path.exists() {
                println!(
                    "No config file at {:?}; run `catfish-agg config init` first",
                    path
                );
                return Ok(());
            }
            let cfg = load_config_from(&path)
                .await
                .map_err(|e| CliError::ProxyConfig(format!("{e:#}")))?;
            println!("Config {:?} parsed OK", path);
            print_summary(&cfg);

            let warnings = config_warnings(&cfg);
            if warnings.is_empty() {
                println!("{}", "No warnings.".green());
            } else {
                println!();
                for w in warnings {
                    println!("{} {}", "warning:".yellow(), w);
                }
            }
        }
    }
    Ok(())
}

fn print_summary(cfg: &ProxyConfig) {
    println!(
        "  server: {}:{}   timeout: {}s   admin key: {}",
        cfg.server.host,
        cfg.server.port,
        cfg.upstream.timeout_secs,
        if cfg.resolve_admin_key().is_some() {
            "set"
        } else {
            "missing"
        }
    );
    if cfg.schemes.is_empty() {
        println!("  (no schemes)");
        return;
    }
    for (i, scheme) in cfg.schemes.iter().enumerate() {
        let marker = if i == 0 { "*" } else { " " };
        println!(
            "  {} {} ({} channel(s))",
            marker,
            scheme.name.bold(),
            scheme.channels.len()
        );
        let mut channels = scheme.channels.iter().collect::<Vec<_>>();
        channels.sort_by_key(|c| c.priority);
        for ch in channels {
            let key = if ch.resolve_api_key().is_some() {
                "key ok"
            } else {
                "no key"
            };
            let breaker = match ch.breaker_policy() {
                Some(p) => format!("breaker {}x/{}s", p.threshold, p.disable_secs),
                None => "no breaker".to_string(),
            };
            let model = ch
                .model_override()
                .map(|m| format!(" model={m}"))
                .unwrap_or_default();
            println!(
                "      p{} {} {} [{}, {}]{}",
                ch.priority, ch.id, ch.base_url, key, breaker, model
            );
        }
    }
    println!("  (* = fallback scheme for unknown models)");
}
