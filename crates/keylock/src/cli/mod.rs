pub mod handlers;

use clap::{value_parser, Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("keylock")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Distributed per-key lock server")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(cmd_serve())
        .subcommand(cmd_exec())
}

fn arg_config() -> Arg {
    Arg::new("config")
        .long("config")
        .short('c')
        .value_name("FILE")
        .help("TOML config file (default: <config dir>/keylock/config.toml)")
}

fn arg_host() -> Arg {
    Arg::new("host")
        .long("host")
        .value_name("HOST")
        .help("Lock server host")
}

fn arg_port() -> Arg {
    Arg::new("port")
        .long("port")
        .short('p')
        .value_name("PORT")
        .value_parser(value_parser!(u16))
        .help("Lock server port")
}

fn cmd_serve() -> Command {
    Command::new("serve")
        .about("Run the lock server")
        .arg(arg_config())
        .arg(arg_host())
        .arg(arg_port())
        .arg(
            Arg::new("socket-timeout")
                .long("socket-timeout")
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .help("Close connections idle for this many seconds"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .help("Write daily log files (YYYY-MM-DD.log) here instead of stdout"),
        )
}

fn cmd_exec() -> Command {
    Command::new("exec")
        .about("Run a command while holding a lock key")
        .after_help(
            "EXAMPLES:\n  \
             keylock exec --key deploy -- ./deploy.sh prod\n  \
             keylock exec --key nightly --timeout 600 --port 7420 -- make backup",
        )
        .arg(arg_config())
        .arg(arg_host())
        .arg(arg_port())
        .arg(
            Arg::new("key")
                .long("key")
                .short('k')
                .required(true)
                .value_name("KEY")
                .help("Lock key to hold while the command runs"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .short('t')
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .default_value("30")
                .help("Give up (and kill the command) after this many seconds"),
        )
        .arg(
            Arg::new("command")
                .required(true)
                .num_args(1..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true)
                .action(ArgAction::Append)
                .value_name("COMMAND")
                .help("Command and arguments, after --"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_exec_collects_trailing_command() {
        let matches = build_cli()
            .try_get_matches_from(["keylock", "exec", "--key", "k", "--", "sh", "-c", "exit 3"])
            .unwrap();
        let Some(("exec", exec)) = matches.subcommand() else {
            panic!("expected exec subcommand");
        };
        let command: Vec<&String> = exec
            .get_many::<String>("command")
            .map(Iterator::collect)
            .unwrap_or_default();
        assert_eq!(command, ["sh", "-c", "exit 3"]);
        assert_eq!(exec.get_one::<u64>("timeout"), Some(&30));
    }

    #[test]
    fn test_exec_requires_key() {
        let result = build_cli().try_get_matches_from(["keylock", "exec", "--", "true"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_serve_rejects_bad_port() {
        let result = build_cli().try_get_matches_from(["keylock", "serve", "--port", "http"]);
        assert!(result.is_err());
    }
}
