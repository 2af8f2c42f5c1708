#![deny(unsafe_code)]

//! netengine CLI: inspect and exercise per-thread engine contexts.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result, anyhow, bail, ensure};
use clap::{Parser, Subcommand};
use netengine_config::EngineConfig;
use netengine_core::{EngineContext, EngineError, EngineSummary, EventBackend, build_info};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// netengine: per-thread network engine bootstrap and teardown.
#[derive(Parser)]
#[command(name = "netengine", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "netengine.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an engine on this thread, report its subsystems, and tear it down.
    Status {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run the init / get / duplicate / destroy protocol on several threads.
    Check {
        /// Number of threads to start concurrently.
        #[arg(long, default_value_t = 4)]
        threads: usize,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Print detailed build information.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, config_found) = read_config(&cli.config)?;

    let filter = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if !config_found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Status { json } => cmd_status(&config, json)?,
        Commands::Check { threads } => cmd_check(&config, threads)?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
        Commands::Version => println!("netengine {}", build_info::version_string()),
    }

    Ok(())
}

fn cmd_status(config: &EngineConfig, json: bool) -> Result<()> {
    let ctx = EngineContext::init(config).context("engine init failed")?;
    let summary = ctx.summary();
    ctx.destroy().context("engine destroy failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", render_summary(&summary));
    }
    Ok(())
}

fn render_summary(summary: &EngineSummary) -> String {
    let tls = match (summary.tls_context, &summary.tls_unavailable) {
        (true, _) => "global client context ready".to_string(),
        (false, Some(reason)) => format!("unavailable ({reason})"),
        (false, None) => "unavailable".to_string(),
    };
    let nameservers = if summary.nameservers.is_empty() {
        "none".to_string()
    } else {
        summary.nameservers.join(", ")
    };
    let timers = if summary.low_resolution_timers {
        "low resolution"
    } else {
        "standard"
    };

    format!(
        "backend:      {}\n\
         tls:          {}\n\
         entropy:      {}\n\
         nameservers:  {}\n\
         timers:       {}\n\
         contexts:     {} live, {} registered\n\
         version:      {}\n",
        summary.backend,
        tls,
        summary.entropy_device.display(),
        nameservers,
        timers,
        summary.live_contexts,
        summary.total_registrations,
        summary.version,
    )
}

fn cmd_check(config: &EngineConfig, threads: usize) -> Result<()> {
    ensure!(threads > 0, "--threads must be at least 1");
    info!(threads, "running lifecycle check");

    let handles = (0..threads)
        .map(|i| {
            let config = config.clone();
            std::thread::Builder::new()
                .name(format!("netengine-check-{i}"))
                .spawn(move || check_thread(&config))
                .context("failed to spawn check thread")
        })
        .collect::<Result<Vec<_>>>()?;

    let mut failed = 0;
    for (i, handle) in handles.into_iter().enumerate() {
        let outcome = handle
            .join()
            .map_err(|_| anyhow!("check thread panicked"))
            .and_then(|r| r);
        match outcome {
            Ok(backend) => println!("thread {i}: ok ({backend})"),
            Err(e) => {
                failed += 1;
                warn!(thread = i, error = %e, "lifecycle check failed");
                println!("thread {i}: FAILED: {e:#}");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {threads} threads failed the lifecycle check");
    }
    println!("all {threads} threads passed");
    Ok(())
}

/// One thread's pass through the lifecycle protocol.
fn check_thread(config: &EngineConfig) -> Result<EventBackend> {
    let ctx = EngineContext::init(config).context("init failed")?;

    let found = EngineContext::current().ok_or_else(|| anyhow!("no context after init"))?;
    ensure!(Rc::ptr_eq(&ctx, &found), "lookup returned a different context");
    drop(found);

    match EngineContext::init(config) {
        Err(EngineError::DuplicateContext) => {}
        Err(e) => bail!("duplicate init failed with the wrong error: {e}"),
        Ok(_) => bail!("duplicate init succeeded"),
    }

    let backend = ctx.backend();
    ctx.destroy().context("destroy failed")?;
    ensure!(
        EngineContext::current().is_none(),
        "thread slot still occupied after destroy"
    );
    Ok(backend)
}

fn cmd_config(config_path: &Path, config: &EngineConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load the config file, or defaults if it does not exist.
fn read_config(path: &Path) -> Result<(EngineConfig, bool)> {
    if path.exists() {
        let config = EngineConfig::load(path)
            .with_context(|| format!("invalid configuration at '{}'", path.display()))?;
        Ok((config, true))
    } else {
        Ok((EngineConfig::default(), false))
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use netengine_test_utils::TestConfigBuilder;
    use netengine_test_utils::fixtures::TestConfigFile;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_threads() {
        let cli = Cli::try_parse_from(["netengine", "-vv", "check", "--threads", "8"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Check { threads: 8 }));
    }

    #[test]
    fn test_read_missing_config_uses_defaults() {
        let (config, found) = read_config(Path::new("/nonexistent/netengine.toml")).unwrap();
        assert!(!found);
        assert_eq!(config.dns.max_sockets, 16);
    }

    #[test]
    fn test_read_config_file() {
        let fixture = TestConfigFile::with_toml("[dns]\nmax_sockets = 3\n");
        let (config, found) = read_config(&fixture.config_path).unwrap();
        assert!(found);
        assert_eq!(config.dns.max_sockets, 3);
    }

    #[test]
    fn test_read_invalid_config_fails() {
        let fixture = TestConfigFile::with_toml("");
        fixture.write("[dns]\nmax_sockets = 0\n");
        assert!(read_config(&fixture.config_path).is_err());
    }

    #[test]
    fn test_render_summary_without_tls() {
        let summary = EngineSummary {
            state: netengine_core::LifecycleState::Running,
            backend: EventBackend::Epoll,
            provider: "default".into(),
            thread: None,
            tls_context: false,
            tls_unavailable: Some("disabled by configuration".into()),
            entropy_device: "/dev/urandom".into(),
            low_resolution_timers: true,
            pending_timers: 0,
            nameservers: vec![],
            resolver_sockets: 0,
            registered_descriptors: 0,
            failed_writes: 0,
            buffered_bytes: 0,
            live_contexts: 1,
            total_registrations: 4,
            version: "0.1.0".into(),
        };
        let text = render_summary(&summary);
        assert!(text.contains("backend:      epoll"));
        assert!(text.contains("unavailable (disabled by configuration)"));
        assert!(text.contains("nameservers:  none"));
        assert!(text.contains("low resolution"));
        assert!(text.contains("contexts:     1 live, 4 registered"));
    }

    #[cfg(target_os = "linux")]
    #[test_log::test]
    fn test_check_runs_on_several_threads() {
        let config = TestConfigBuilder::new().tls_enabled(false).build();
        cmd_check(&config, 3).unwrap();
    }

    #[test]
    fn test_check_rejects_zero_threads() {
        let config = TestConfigBuilder::new().build();
        assert!(cmd_check(&config, 0).is_err());
    }
}
