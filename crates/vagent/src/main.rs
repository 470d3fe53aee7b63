use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use vagent::methods::builtin::{HELLO, shutdown_flag};
use vagent::{
    AgentConfig, AgentHandle, Channel, JsonRpcCodec, PayloadCodec, Role,
    VAGENT_VERSION, driver, methods, transport,
};

const COMMAND_QUEUE: usize = 32;

const USAGE: &str = "\
Usage: vagent [--role guest|host] [--channel <method>] [--path <path>] [--verbose]
              [--call <command> [<arg>]]

Options:
  -r, --role <role>        guest or host [default: guest]
  -c, --channel <method>   unix-connect, unix-listen, virtio-serial or isa-serial
                           [default: virtio-serial]
  -p, --path <path>        socket or device path
                           [default for virtio-serial: /dev/virtio-ports/org.qemu.virtagent]
  -v, --verbose            log at debug level
      --call <command>     host only: run one command against the guest, print
                           the result and exit. Commands: ping, getfile <path>,
                           getdmesg, shutdown halt|powerdown|reboot
  -V, --version            print version and exit
  -h, --help               print this help";

fn init_tracing(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("VAGENT_LOG").as_deref() {
            _ if verbose => "debug",
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        let filter_str = format!(
            "vagent={level},vagent_bridge={level},vagent::audit=info",
            level = base_level
        );

        EnvFilter::new(filter_str)
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// A one-shot command the host runs against the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GuestCommand {
    Ping,
    GetFile(String),
    GetDmesg,
    Shutdown(String),
}

enum Parsed {
    Run(AgentConfig, Option<GuestCommand>),
    Version,
}

fn parse_args(args: &[String], mut config: AgentConfig) -> Result<Parsed, String> {
    let mut command = None;
    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--role" | "-r" => {
                i += 1;
                let value = args.get(i).ok_or("--role requires a value")?;
                config.role = value.parse().map_err(|e: vagent::ConfigError| e.to_string())?;
            }
            "--channel" | "-c" => {
                i += 1;
                let value = args.get(i).ok_or("--channel requires a value")?;
                config.method = value.parse().map_err(|e: vagent::ConfigError| e.to_string())?;
            }
            "--path" | "-p" => {
                i += 1;
                config.path = Some(PathBuf::from(args.get(i).ok_or("--path requires a value")?));
            }
            "--call" => {
                i += 1;
                command = Some(match args.get(i).map(String::as_str) {
                    Some("ping") => GuestCommand::Ping,
                    Some("getdmesg") => GuestCommand::GetDmesg,
                    Some("getfile") => {
                        i += 1;
                        GuestCommand::GetFile(args.get(i).ok_or("getfile requires a path")?.clone())
                    }
                    Some("shutdown") => {
                        i += 1;
                        let mode = args.get(i).ok_or("shutdown requires a mode")?;
                        if shutdown_flag(mode).is_none() {
                            return Err(format!("invalid shutdown mode: {mode}"));
                        }
                        GuestCommand::Shutdown(mode.clone())
                    }
                    Some(other) => return Err(format!("unknown command: {other}")),
                    None => return Err("--call requires a command".to_string()),
                });
            }
            "--verbose" | "-v" => config.verbose = true,
            "--version" | "-V" => return Ok(Parsed::Version),
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    if command.is_some() && config.role != Role::Host {
        return Err("--call requires --role host".to_string());
    }
    Ok(Parsed::Run(config, command))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = AgentConfig::from_env().context("invalid environment")?;

    let (config, command) = match parse_args(&args, config) {
        Ok(Parsed::Run(config, command)) => (config, command),
        Ok(Parsed::Version) => {
            println!("vagent {VAGENT_VERSION}");
            return Ok(());
        }
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing(config.verbose);
    run(config, command).await
}

async fn run(config: AgentConfig, command: Option<GuestCommand>) -> anyhow::Result<()> {
    let path = config.channel_path()?;
    tracing::info!(
        version = VAGENT_VERSION,
        role = %config.role,
        channel = %config.method,
        path = %path.display(),
        "Starting vagent"
    );

    let stream = transport::open(config.method, &path)
        .await
        .with_context(|| format!("failed to open {} channel at {}", config.method, path.display()))?;

    let codec: Arc<dyn PayloadCodec> = Arc::new(JsonRpcCodec);
    let (handle, commands) = AgentHandle::channel(COMMAND_QUEUE, Arc::clone(&codec));
    let table = match config.role {
        Role::Guest => methods::guest_methods(config.frame_limits),
        Role::Host => methods::host_methods(Some(handle.clone())),
    };
    tracing::debug!(methods = ?table.names().collect::<Vec<_>>(), "Methods registered");

    let channel = Channel::new(config.channel_config(), table, codec);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupted, shutting down");
                signal_token.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to listen for ctrl-c"),
        }
    });

    if config.role == Role::Guest {
        announce(handle);
    } else if let Some(command) = command {
        let task = tokio::spawn(driver::run(stream, channel, commands, shutdown.clone()));
        let result = run_command(&handle, command).await;
        shutdown.cancel();
        task.await
            .context("channel task failed")?
            .context("channel failed")?;
        return result;
    }

    driver::run(stream, channel, commands, shutdown)
        .await
        .context("channel failed")?;
    tracing::info!("vagent stopped");
    Ok(())
}

/// Tell the host the guest agent is up.
fn announce(handle: AgentHandle) {
    tokio::spawn(async move {
        match handle.call(HELLO, serde_json::json!({})).await {
            Ok(_) => tracing::info!("Host acknowledged startup"),
            Err(e) => tracing::warn!(error = %e, "Startup announcement failed"),
        }
    });
}

async fn run_command(handle: &AgentHandle, command: GuestCommand) -> anyhow::Result<()> {
    tracing::debug!(?command, "Running guest command");
    let output = match command {
        GuestCommand::Ping => {
            handle.ping().await.context("va.ping failed")?;
            b"ok\n".to_vec()
        }
        GuestCommand::GetFile(path) => handle
            .view_file(&path)
            .await
            .with_context(|| format!("failed to fetch {path}"))?,
        GuestCommand::GetDmesg => handle
            .view_dmesg()
            .await
            .context("va.getdmesg failed")?
            .into_bytes(),
        GuestCommand::Shutdown(mode) => {
            handle.shutdown(&mode).await.context("va.shutdown failed")?;
            format!("guest {mode} scheduled\n").into_bytes()
        }
    };
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&output)?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vagent::ChannelMethod;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("vagent")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn flags_override_config() {
        let parsed = parse_args(
            &args(&["--role", "host", "-c", "unix-listen", "--path", "/tmp/va.sock", "-v"]),
            AgentConfig::default(),
        );
        let Ok(Parsed::Run(config, None)) = parsed else {
            panic!("expected run");
        };
        assert_eq!(config.role, Role::Host);
        assert_eq!(config.method, ChannelMethod::UnixListen);
        assert_eq!(config.path, Some(PathBuf::from("/tmp/va.sock")));
        assert!(config.verbose);
    }

    #[test]
    fn bad_flags_are_reported() {
        let err = parse_args(&args(&["--role"]), AgentConfig::default()).err();
        assert_eq!(err.as_deref(), Some("--role requires a value"));

        let err = parse_args(&args(&["--channel", "tcp"]), AgentConfig::default()).err();
        assert_eq!(err.as_deref(), Some("unknown channel method \"tcp\""));

        let err = parse_args(&args(&["extra"]), AgentConfig::default()).err();
        assert_eq!(err.as_deref(), Some("unexpected argument: extra"));
    }

    #[test]
    fn host_commands() {
        let parse = |list: &[&str]| match parse_args(&args(list), AgentConfig::default()) {
            Ok(Parsed::Run(_, command)) => Ok(command),
            Ok(Parsed::Version) => panic!("unexpected version"),
            Err(e) => Err(e),
        };

        assert_eq!(
            parse(&["-r", "host", "--call", "getfile", "/etc/hostname"]),
            Ok(Some(GuestCommand::GetFile("/etc/hostname".to_string())))
        );
        assert_eq!(
            parse(&["--call", "shutdown", "reboot", "--role", "host"]),
            Ok(Some(GuestCommand::Shutdown("reboot".to_string())))
        );
        assert_eq!(
            parse(&["-r", "host", "--call", "ping"]),
            Ok(Some(GuestCommand::Ping))
        );
        assert_eq!(
            parse(&["-r", "host", "--call", "shutdown", "suspend"]),
            Err("invalid shutdown mode: suspend".to_string())
        );
        assert_eq!(
            parse(&["-r", "host", "--call", "getfile"]),
            Err("getfile requires a path".to_string())
        );
        assert_eq!(
            parse(&["--call", "getdmesg"]),
            Err("--call requires --role host".to_string())
        );
    }

    #[test]
    fn help_and_version() {
        assert_eq!(
            parse_args(&args(&["-h"]), AgentConfig::default()).err().as_deref(),
            Some("")
        );
        assert!(matches!(
            parse_args(&args(&["--version"]), AgentConfig::default()),
            Ok(Parsed::Version)
        ));
    }
}
