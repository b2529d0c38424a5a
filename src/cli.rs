use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hpcserve")]
#[command(about = "Deploy, track and route AI inference services on Slurm clusters")]
#[command(version)]
pub struct Args {
    /// Path to the config file (default: ~/.hpcserve/config.yaml)
    #[arg(short, long, env = "HPCSERVE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: validate config and show recipes without serving
    #[arg(long)]
    pub dry_run: bool,

    /// Override the gateway bind address
    #[arg(long, env = "HPCSERVE_BIND_ADDR", value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the gateway port
    #[arg(short, long, env = "HPCSERVE_PORT", value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to a .env file loaded before the config
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

use crate::config::Config;

/// Apply command-line overrides on top of the loaded config
pub fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(ref bind_addr) = args.bind_addr {
        config.gateway.bind_addr = bind_addr.clone();
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
}

/// Format a dry-run report of the resolved configuration.
/// Pure function - returns a formatted string.
pub fn format_dry_run(config: &Config, recipes: &[String], args: &Args) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "hpcserve v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    match args.config {
        Some(ref path) => output.push_str(&format!("Config: {}\n", path.display())),
        None => output.push_str("Config: default\n"),
    }
    output.push_str(&format!(
        "Gateway: {}:{}\n",
        config.gateway.bind_addr, config.gateway.port
    ));
    output.push_str(&format!("State dir: {}\n", config.state_dir_path().display()));
    output.push_str(&format!(
        "Recipes dir: {}\n\n",
        config.recipes_dir_path().display()
    ));

    // Scheduler
    let scheduler = &config.scheduler;
    output.push_str("Scheduler (slurm):\n");
    output.push_str(&format!(
        "  Partition: {}\n",
        scheduler.partition.as_deref().unwrap_or("(cluster default)")
    ));
    if let Some(ref account) = scheduler.account {
        output.push_str(&format!("  Account: {}\n", account));
    }
    if let Some(ref qos) = scheduler.qos {
        output.push_str(&format!("  QoS: {}\n", qos));
    }
    output.push_str(&format!(
        "  Commands: {}\n",
        if scheduler.remote && config.tunnel.is_some() {
            "over tunnel"
        } else {
            "local"
        }
    ));
    output.push_str(&format!(
        "  Retry: {} attempt(s)\n\n",
        scheduler.retry.max_attempts
    ));

    // Lifecycle
    let lifecycle = &config.lifecycle;
    output.push_str("Lifecycle:\n");
    output.push_str(&format!(
        "  Reconcile every {}s (probe timeout {}s, {} concurrent)\n",
        lifecycle.reconcile_interval_secs,
        lifecycle.probe_timeout_secs,
        lifecycle.reconcile_concurrency
    ));
    output.push_str(&format!(
        "  Ports: {}-{}\n",
        lifecycle.port_range.start, lifecycle.port_range.end
    ));
    output.push_str(&format!("  Max replicas: {}\n\n", lifecycle.max_replicas));

    // Tunnel
    match config.tunnel {
        Some(ref tunnel) => {
            output.push_str(&format!(
                "Tunnel: {} via {}",
                tunnel.credentials.cluster,
                tunnel.credentials.destination()
            ));
            if let Some(port) = tunnel.credentials.port {
                output.push_str(&format!(" (port {})", port));
            }
            output.push('\n');
        }
        None => output.push_str("Tunnel: none (direct mode)\n"),
    }
    output.push('\n');

    // Recipes
    output.push_str(&format!("Recipes ({}):\n", recipes.len()));
    for name in recipes {
        output.push_str(&format!("  - {}\n", name));
    }

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to serve. Remove --dry-run to start the gateway.\n");

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn create_test_args() -> Args {
        Args {
            config: Some(PathBuf::from("hpcserve.yaml")),
            verbose: 0,
            dry_run: true,
            bind_addr: None,
            port: None,
            env_file: None,
        }
    }

    #[test]
    fn test_format_dry_run_basic() {
        let config = parse_config(
            r#"
scheduler:
  partition: gpu
  account: p200301
tunnel:
  cluster: meluxina
  host: login.lxp.lu
  user: u100
  port: 8822
"#,
        )
        .unwrap();
        let recipes = vec!["qdrant".to_string(), "vllm".to_string()];
        let output = format_dry_run(&config, &recipes, &create_test_args());

        assert!(output.contains("Config: hpcserve.yaml"));
        assert!(output.contains("Partition: gpu"));
        assert!(output.contains("Account: p200301"));
        assert!(output.contains("Commands: over tunnel"));
        assert!(output.contains("Tunnel: meluxina via u100@login.lxp.lu (port 8822)"));
        assert!(output.contains("Recipes (2):"));
        assert!(output.contains("  - vllm"));
        assert!(output.contains("Validation: PASSED"));
    }

    #[test]
    fn test_format_dry_run_direct_mode() {
        let output = format_dry_run(&Config::default(), &[], &create_test_args());
        assert!(output.contains("Tunnel: none (direct mode)"));
        assert!(output.contains("Commands: local"));
        assert!(output.contains("Recipes (0):"));
    }

    #[test]
    fn test_clap_parsing() {
        let args = Args::parse_from(["hpcserve", "--config", "cfg.yaml", "-vv", "--port", "9000"]);
        assert_eq!(args.config, Some(PathBuf::from("cfg.yaml")));
        assert_eq!(args.verbose, 2);
        assert_eq!(args.port, Some(9000));
        assert!(!args.dry_run);
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        let mut args = create_test_args();
        args.bind_addr = Some("127.0.0.1".to_string());
        args.port = Some(9100);
        apply_overrides(&mut config, &args);
        assert_eq!(config.gateway.bind_addr, "127.0.0.1");
        assert_eq!(config.gateway.port, 9100);
    }
}
