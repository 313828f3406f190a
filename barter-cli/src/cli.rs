use std::path::PathBuf;

use barter_session::Method;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "barter", version, about = "Session and realtime shell for the barter API")]
pub struct Args {
    /// Log filter directive, e.g. `barter_session=debug`
    #[arg(long, global = true, env = "BARTER_LOG")]
    pub log_filter: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Credential file; overrides BARTER_STORAGE_PATH
    #[arg(long, global = true)]
    pub storage: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign in and store the issued credential
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long, env = "BARTER_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Create an account, then sign in with it
    SignUp {
        #[arg(long)]
        email: String,
        #[arg(long, env = "BARTER_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        nickname: String,
    },

    /// Forget the stored credential and log out server-side
    SignOut,

    /// Show the stored credential's validity
    Status,

    /// Issue an authenticated API request and print the response body
    Request {
        #[arg(value_enum)]
        method: HttpMethod,
        /// Path under the API base URL, e.g. /api/v1/items
        path: String,
        /// Query parameter as key=value, repeatable
        #[arg(short, long = "query", value_parser = parse_pair)]
        query: Vec<(String, String)>,
        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,
    },

    /// Follow a chat room over the realtime channel until interrupted
    Tail {
        /// Room id; subscribes to /topic/directRoom/<room>
        #[arg(long, conflicts_with = "topic")]
        room: Option<u64>,
        /// Explicit topic to subscribe to
        #[arg(long)]
        topic: Option<String>,
    },

    /// Post one chat message over the realtime channel
    Say {
        #[arg(long)]
        room: u64,
        #[arg(long)]
        content: String,
        /// Seconds to wait for the channel to connect
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::Get,
            HttpMethod::Post => Method::Post,
            HttpMethod::Put => Method::Put,
            HttpMethod::Patch => Method::Patch,
            HttpMethod::Delete => Method::Delete,
        }
    }
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_arguments_parse() {
        let args = Args::try_parse_from([
            "barter", "request", "get", "/api/v1/items", "-q", "page=2", "-q", "size=20",
        ])
        .unwrap();
        match args.command {
            Commands::Request { method, path, query, body } => {
                assert!(matches!(method, HttpMethod::Get));
                assert_eq!(path, "/api/v1/items");
                assert_eq!(
                    query,
                    vec![("page".into(), "2".into()), ("size".into(), "20".into())]
                );
                assert!(body.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn room_and_topic_conflict() {
        assert!(
            Args::try_parse_from(["barter", "tail", "--room", "3", "--topic", "/topic/x"]).is_err()
        );
    }
}
