use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

/// castmate-bridge: JSON RPC bridge between CastMate and its overlays
#[derive(Parser, Debug)]
#[command(name = "castmate-bridge")]
#[command(about = "Host or join a CastMate RPC bridge over WebSocket", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the WebSocket host
    Serve {
        /// Port to bind the HTTP server to (overrides the config file)
        #[arg(long)]
        port: Option<u16>,

        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Connect to a host as an overlay and follow some states
    Connect {
        /// Host WebSocket URL
        #[arg(long, default_value = "ws://127.0.0.1:7891/ws")]
        url: String,

        /// Overlay id to connect as
        #[arg(long)]
        overlay: String,

        /// States to acquire, as `namespace.key`
        #[arg(long, num_args = 1..)]
        acquire: Vec<StateRef>,

        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// A `namespace.key` pair from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRef {
    pub namespace: String,
    pub key: String,
}

impl FromStr for StateRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((namespace, key)) if !namespace.is_empty() && !key.is_empty() => Ok(Self {
                namespace: namespace.to_string(),
                key: key.to_string(),
            }),
            _ => Err(format!("expected namespace.key, got {:?}", s)),
        }
    }
}

impl Cli {
    /// Parse CLI arguments from the environment
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["castmate-bridge", "serve"]).unwrap();
        match cli.command {
            Command::Serve { port, config } => {
                assert_eq!(port, None);
                assert_eq!(config, None);
            }
            other => panic!("expected serve, got {:?}", other),
        }
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from([
            "castmate-bridge",
            "serve",
            "--port",
            "9000",
            "--config",
            "/etc/castmate.toml",
        ])
        .unwrap();
        match cli.command {
            Command::Serve { port, config } => {
                assert_eq!(port, Some(9000));
                assert_eq!(config, Some(PathBuf::from("/etc/castmate.toml")));
            }
            other => panic!("expected serve, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_with_states() {
        let cli = Cli::try_parse_from([
            "castmate-bridge",
            "connect",
            "--overlay",
            "abc123",
            "--acquire",
            "obs.scene",
            "twitch.viewers",
        ])
        .unwrap();
        match cli.command {
            Command::Connect {
                url,
                overlay,
                acquire,
                config,
            } => {
                assert_eq!(url, "ws://127.0.0.1:7891/ws");
                assert_eq!(overlay, "abc123");
                assert_eq!(acquire.len(), 2);
                assert_eq!(acquire[1].namespace, "twitch");
                assert_eq!(acquire[1].key, "viewers");
                assert_eq!(config, None);
            }
            other => panic!("expected connect, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_requires_overlay() {
        assert!(Cli::try_parse_from(["castmate-bridge", "connect"]).is_err());
    }

    #[test]
    fn test_state_ref_key_keeps_dots() {
        let state: StateRef = "obs.scene.name".parse().unwrap();
        assert_eq!(state.namespace, "obs");
        assert_eq!(state.key, "scene.name");
    }

    #[test]
    fn test_state_ref_rejects_bare_name() {
        assert!("scene".parse::<StateRef>().is_err());
        assert!(".scene".parse::<StateRef>().is_err());
    }

    #[test]
    fn test_missing_subcommand() {
        assert!(Cli::try_parse_from(["castmate-bridge"]).is_err());
    }
}
