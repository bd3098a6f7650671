//! Command-line interface for the lane controller.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Command line arguments; each option overrides the matching config file value.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the protocol bind address
    pub bind_address: Option<String>,
    /// Optional override for the session store URL
    pub database_url: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(command().get_matches())
    }

    fn from_matches(matches: clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            database_url: matches.get_one::<String>("database").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

fn command() -> Command {
    Command::new("Lane Controller")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Instance registry and player router for a proxied game network")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Instance protocol bind address (e.g., 0.0.0.0:7400)"),
        )
        .arg(
            Arg::new("database")
                .short('d')
                .long("database")
                .value_name("URL")
                .help("Session store URL (e.g., sqlite://lane.db)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::from_matches(command().get_matches_from(args))
    }

    #[test]
    fn defaults_to_config_toml() {
        let args = parse(&["lane"]);
        assert_eq!(args.config_path, PathBuf::from("config.toml"));
        assert!(args.bind_address.is_none());
        assert!(args.database_url.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn overrides_are_captured() {
        let args = parse(&[
            "lane",
            "-c",
            "/etc/lane.toml",
            "--bind",
            "0.0.0.0:7400",
            "--database",
            "sqlite://lane.db",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        assert_eq!(args.config_path, PathBuf::from("/etc/lane.toml"));
        assert_eq!(args.bind_address.as_deref(), Some("0.0.0.0:7400"));
        assert_eq!(args.database_url.as_deref(), Some("sqlite://lane.db"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
    }
}
