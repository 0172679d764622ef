//! Command-line interface.
//!
//! Global flags apply to every service command; each command may override
//! the listen addresses. Flags win over values from `--config.file`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{self, ConfigError, RuntimeConfig};
use crate::lifecycle::ServiceKind;

#[derive(Debug, Parser)]
#[command(name = "chronostore", version)]
#[command(about = "A long-term storage platform for time series metrics", long_about = None)]
pub struct Cli {
    /// Log filtering level.
    #[arg(
        long = "log.level",
        global = true,
        value_parser = ["error", "warn", "info", "debug"]
    )]
    pub log_level: Option<String>,

    /// Name attached to every log line, to tell processes apart.
    #[arg(long = "debug.name", global = true)]
    pub debug_name: Option<String>,

    /// TOML configuration file.
    #[arg(long = "config.file", global = true)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sidecar for a Prometheus server, exposing its data over gRPC
    Sidecar(ServeArgs),
    /// Store gateway serving historical data from object storage
    Store(ServeArgs),
    /// Query frontend fanning out over store APIs
    Query(ServeArgs),
    /// Receiver accepting remote writes
    Receiver(ServeArgs),
    /// Rule evaluator for recording and alerting rules
    Rule(ServeArgs),
    /// Compactor for blocks in object storage
    Compact(HttpArgs),
    /// Bucket inspection and repair
    Bucket(HttpArgs),
    /// Downsampler for compacted blocks
    Downsample(HttpArgs),
}

/// Listen addresses for components with an RPC server.
#[derive(Debug, Clone, Default, Args)]
pub struct ServeArgs {
    /// Listen host:port for gRPC endpoints.
    #[arg(long = "grpc-address")]
    pub grpc_address: Option<String>,

    #[command(flatten)]
    pub http: HttpArgs,
}

/// Listen address for the metrics and profiling endpoint.
#[derive(Debug, Clone, Default, Args)]
pub struct HttpArgs {
    /// Listen host:port for HTTP endpoints.
    #[arg(long = "http-address")]
    pub http_address: Option<String>,
}

impl Command {
    pub fn service(&self) -> ServiceKind {
        match self {
            Command::Sidecar(_) => ServiceKind::Sidecar,
            Command::Store(_) => ServiceKind::Store,
            Command::Query(_) => ServiceKind::Query,
            Command::Receiver(_) => ServiceKind::Receiver,
            Command::Rule(_) => ServiceKind::Rule,
            Command::Compact(_) => ServiceKind::Compact,
            Command::Bucket(_) => ServiceKind::Bucket,
            Command::Downsample(_) => ServiceKind::Downsample,
        }
    }

    fn apply(&self, config: &mut RuntimeConfig) {
        let http = match self {
            Command::Sidecar(args)
            | Command::Store(args)
            | Command::Query(args)
            | Command::Receiver(args)
            | Command::Rule(args) => {
                if let Some(address) = &args.grpc_address {
                    config.grpc.bind_address = address.clone();
                }
                &args.http
            }
            Command::Compact(args) | Command::Bucket(args) | Command::Downsample(args) => args,
        };
        if let Some(address) = &http.http_address {
            config.http.bind_address = address.clone();
        }
    }
}

impl Cli {
    /// Assemble the validated configuration: file, then flags, then the
    /// `DEBUG` environment switch.
    pub fn config(&self, debug_env: Option<&str>) -> Result<RuntimeConfig, ConfigError> {
        let mut config = match &self.config_file {
            Some(path) => config::load_config(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(name) = &self.debug_name {
            config.log.debug_name = Some(name.clone());
        }
        self.command.apply(&mut config);
        if debug_env.is_some_and(|v| !v.is_empty()) {
            config.profiling.enable_debug();
        }
        config::finalize(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("chronostore").chain(args.iter().copied()))
    }

    #[test]
    fn flags_override_defaults() {
        let cli = parse(&[
            "store",
            "--log.level=debug",
            "--debug.name",
            "store-0",
            "--grpc-address",
            "127.0.0.1:19090",
            "--http-address",
            "127.0.0.1:19091",
        ])
        .unwrap();
        assert_eq!(cli.command.service(), ServiceKind::Store);

        let config = cli.config(None).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.debug_name.as_deref(), Some("store-0"));
        assert_eq!(config.grpc.bind_address, "127.0.0.1:19090");
        assert_eq!(config.http.bind_address, "127.0.0.1:19091");
        assert!(!config.profiling.debug);
    }

    #[test]
    fn http_only_commands_reject_grpc_flag() {
        let err = parse(&["compact", "--grpc-address", "127.0.0.1:1"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn invalid_log_level_is_parse_error() {
        let err = parse(&["query", "--log.level", "chatty"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn help_exits_zero() {
        let err = parse(&["--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert_eq!(err.exit_code(), 0);
    }

    #[test]
    fn debug_env_raises_sampling() {
        let cli = parse(&["bucket"]).unwrap();
        assert!(cli.config(Some("1")).unwrap().profiling.debug);
        assert!(!cli.config(Some("")).unwrap().profiling.debug);
    }

    #[test]
    fn missing_command_is_error() {
        let err = parse(&[]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
