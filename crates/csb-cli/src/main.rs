use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use csb_core::{AccentColor, Category, TenantConfig};
use csb_platform::{RestChatPlatform, RestPlatformConfig, SqlSourceReader};
use csb_store::{ConfigStore, StateStore};
use csb_sync::{Reconciler, SyncConfig, TimerDriver};
use csb_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "csb")]
#[command(about = "Community Schedule Board service and operator tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the periodic update timer plus the health endpoint.
    Run,
    /// Run exactly one full update cycle and exit.
    Sync,
    /// Force a refresh of one tenant across all categories.
    Force {
        #[arg(long)]
        tenant: String,
    },
    /// Delete and re-post every unit for one tenant/category.
    Regenerate {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        category: Category,
    },
    /// Remove a tenant: remote unit cleanup, configuration, and state.
    Reset {
        #[arg(long)]
        tenant: String,
    },
    /// Configure one tenant/category non-interactively.
    Setup {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        category: Category,
        #[arg(long)]
        channel: String,
        /// Enabled source ids, comma separated.
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,
        /// Accent color: "default", "none", or a hex value like "2add77".
        #[arg(long, default_value = "default")]
        color: String,
    },
}

fn parse_accent(value: &str) -> Result<AccentColor> {
    match value.to_ascii_lowercase().as_str() {
        "default" => Ok(AccentColor::Default),
        "none" => Ok(AccentColor::None),
        hex => {
            let color = u32::from_str_radix(hex.trim_start_matches('#'), 16)
                .with_context(|| format!("invalid accent color {value}"))?;
            Ok(AccentColor::Custom(color))
        }
    }
}

async fn build_reconciler(config: &SyncConfig) -> Result<Reconciler> {
    let state = Arc::new(StateStore::open(&config.state_path).await?);
    let tenants = Arc::new(ConfigStore::open(&config.config_path).await?);
    let source = Arc::new(SqlSourceReader::connect(&config.database_url).await?);
    let platform = Arc::new(RestChatPlatform::new(RestPlatformConfig {
        base_url: config.platform_base_url.clone(),
        token: config.platform_token.clone(),
        self_user_id: config.platform_user_id.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })?);
    Ok(Reconciler::new(
        config.clone(),
        source,
        platform,
        state,
        tenants,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Run => {
            let reconciler = build_reconciler(&config).await?;
            reconciler.prune_state().await?;

            let timer = Arc::new(TimerDriver::new(
                reconciler.clone(),
                config.update_interval,
            ));
            timer.start();

            let web = tokio::spawn(csb_web::serve(
                AppState::new(timer.clone(), reconciler.state_store().clone()),
                config.health_port,
            ));

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutdown requested");
            timer.stop();
            web.abort();
        }
        Commands::Sync => {
            let reconciler = build_reconciler(&config).await?;
            reconciler.prune_state().await?;
            let summary = reconciler.run_all().await;
            println!(
                "cycle complete: run_id={} tenants={} succeeded={} failed={}",
                summary.run_id, summary.tenants, summary.succeeded, summary.failed
            );
        }
        Commands::Force { tenant } => {
            let reconciler = build_reconciler(&config).await?;
            let outcomes = reconciler.force_refresh(&tenant).await?;
            for (category, outcome) in outcomes {
                println!("{category}: {outcome:?}");
            }
        }
        Commands::Regenerate { tenant, category } => {
            let reconciler = build_reconciler(&config).await?;
            let outcome = reconciler.regenerate(&tenant, category).await?;
            println!("{category}: {outcome:?}");
        }
        Commands::Reset { tenant } => {
            let reconciler = build_reconciler(&config).await?;
            reconciler.reset_tenant(&tenant).await?;
            println!("tenant {tenant} reset");
        }
        Commands::Setup {
            tenant,
            category,
            channel,
            sources,
            color,
        } => {
            anyhow::ensure!(!sources.is_empty(), "at least one source is required");
            let accent = parse_accent(&color)?;

            let tenants = ConfigStore::open(&config.config_path).await?;
            let mut tenant_config = tenants
                .get(&tenant)
                .await
                .unwrap_or_else(|| TenantConfig::new(tenant.clone()));
            {
                let slot = tenant_config.category_mut(category);
                slot.channel_id = Some(channel);
                slot.enabled_sources = sources;
                slot.accent_color = accent;
            }
            tenant_config.setup_complete = true;
            tenants.upsert(tenant_config).await?;
            println!("tenant {tenant} category {category} configured");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accent_argument_parses_all_three_states() {
        assert_eq!(parse_accent("default").unwrap(), AccentColor::Default);
        assert_eq!(parse_accent("none").unwrap(), AccentColor::None);
        assert_eq!(parse_accent("#2add77").unwrap(), AccentColor::Custom(0x2add77));
        assert!(parse_accent("not-a-color").is_err());
    }

    #[test]
    fn cli_parses_setup_sources_list() {
        let cli = Cli::parse_from([
            "csb", "setup", "--tenant", "T1", "--category", "raid", "--channel", "c1",
            "--sources", "S1,S2",
        ]);
        match cli.command {
            Commands::Setup { sources, category, .. } => {
                assert_eq!(sources, vec!["S1".to_string(), "S2".to_string()]);
                assert_eq!(category, Category::Raid);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
