//! Subcommand handlers: merge flags over loaded config, then run the command.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use keylock_core::{ClientConfig, LockKey, ServerConfig};

use crate::{
    commands::{exec, serve},
    config::load_config,
    logging::{self, Console},
};

/// Run the selected subcommand and return the process exit code.
///
/// # Errors
///
/// Returns error if configuration is invalid or the command fails.
pub async fn dispatch(matches: &ArgMatches) -> Result<i32> {
    match matches.subcommand() {
        Some(("serve", sub)) => handle_serve(sub).await,
        Some(("exec", sub)) => handle_exec(sub).await,
        Some((other, _)) => bail!("Unknown command: {other}"),
        None => bail!("No command given"),
    }
}

async fn handle_serve(sub: &ArgMatches) -> Result<i32> {
    let mut config = load_config(config_path(sub).as_deref())?.server;
    apply_server_flags(&mut config, sub);
    config.validate()?;

    logging::init(
        config.log_dir.as_deref().map(Path::new),
        Console::Stdout,
        tracing::Level::INFO,
    )?;
    serve::run(&config).await?;
    Ok(0)
}

async fn handle_exec(sub: &ArgMatches) -> Result<i32> {
    let mut config = load_config(config_path(sub).as_deref())?.client;
    apply_client_flags(&mut config, sub);
    config.validate()?;

    logging::init(None, Console::Stderr, tracing::Level::WARN)?;

    let key = sub
        .get_one::<String>("key")
        .context("--key is required")?;
    let timeout_secs = sub.get_one::<u64>("timeout").copied().unwrap_or(30);
    let mut command = sub
        .get_many::<String>("command")
        .into_iter()
        .flatten()
        .cloned();
    let Some(program) = command.next() else {
        bail!("No command given to run");
    };

    let options = exec::ExecOptions {
        key: LockKey::new(key.as_str()),
        timeout_secs,
        program,
        args: command.collect(),
    };
    exec::run(&options, &config).await
}

fn config_path(sub: &ArgMatches) -> Option<PathBuf> {
    sub.get_one::<String>("config").map(PathBuf::from)
}

fn apply_server_flags(config: &mut ServerConfig, sub: &ArgMatches) {
    if let Some(host) = sub.get_one::<String>("host") {
        config.host.clone_from(host);
    }
    if let Some(port) = sub.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(secs) = sub.get_one::<u64>("socket-timeout") {
        config.socket_timeout_secs = *secs;
    }
    if let Some(dir) = sub.get_one::<String>("log-dir") {
        config.log_dir = Some(dir.clone());
    }
}

fn apply_client_flags(config: &mut ClientConfig, sub: &ArgMatches) {
    if let Some(host) = sub.get_one::<String>("host") {
        config.host.clone_from(host);
    }
    if let Some(port) = sub.get_one::<u16>("port") {
        config.port = *port;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::build_cli;

    fn sub_matches(args: &[&str]) -> ArgMatches {
        let matches = build_cli().try_get_matches_from(args).unwrap();
        matches.subcommand().unwrap().1.clone()
    }

    #[test]
    fn test_serve_flags_override_config() {
        let sub = sub_matches(&[
            "keylock",
            "serve",
            "--host",
            "127.0.0.1",
            "--port",
            "9001",
            "--socket-timeout",
            "5",
            "--log-dir",
            "/tmp/keylock-logs",
        ]);
        let mut config = ServerConfig::default();
        apply_server_flags(&mut config, &sub);

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9001);
        assert_eq!(config.socket_timeout_secs, 5);
        assert_eq!(config.log_dir.as_deref(), Some("/tmp/keylock-logs"));
    }

    #[test]
    fn test_absent_flags_keep_config() {
        let sub = sub_matches(&["keylock", "exec", "--key", "k", "--", "true"]);
        let mut config = ClientConfig::new("locks.internal", 7000);
        apply_client_flags(&mut config, &sub);

        assert_eq!(config.host, "locks.internal");
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn test_config_path_flag() {
        let sub = sub_matches(&["keylock", "serve", "-c", "/etc/keylock.toml"]);
        assert_eq!(config_path(&sub), Some(PathBuf::from("/etc/keylock.toml")));
    }
}
