use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use barter_realtime::{ChannelConfig, ChannelState, RealtimeChannel};
use barter_session::{ApiRequest, Session};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::{Commands, HttpMethod};

const ROOM_TOPIC_PREFIX: &str = "/topic/directRoom/";
const ROOM_SEND_DESTINATION: &str = "/client/directRoom/send";

pub struct CommandExecutor {
    session: Arc<Session>,
    channel_config: ChannelConfig,
}

impl CommandExecutor {
    pub fn new(session: Session, channel_config: ChannelConfig) -> Self {
        Self {
            session: Arc::new(session),
            channel_config,
        }
    }

    pub async fn execute(&self, command: Commands) -> Result<()> {
        match command {
            Commands::SignIn { email, password } => {
                let credential = self.session.sign_in(&email, &password).await?;
                print_expiry("access token", credential.access_expires_at);
                Ok(())
            }
            Commands::SignUp {
                email,
                password,
                nickname,
            } => {
                self.session.sign_up(&email, &password, &nickname).await?;
                println!("account created for {email}");
                Ok(())
            }
            Commands::SignOut => {
                self.session.sign_out().await?;
                println!("signed out");
                Ok(())
            }
            Commands::Status => self.status().await,
            Commands::Request {
                method,
                path,
                query,
                body,
            } => self.request(method, path, query, body).await,
            Commands::Tail { room, topic } => {
                let topic = match (room, topic) {
                    (_, Some(topic)) => topic,
                    (Some(room), None) => format!("{ROOM_TOPIC_PREFIX}{room}"),
                    (None, None) => bail!("either --room or --topic is required"),
                };
                self.tail(topic).await
            }
            Commands::Say {
                room,
                content,
                wait,
            } => self.say(room, content, Duration::from_secs(wait)).await,
        }
    }

    async fn status(&self) -> Result<()> {
        match self.session.credential().await? {
            None => println!("not signed in"),
            Some(credential) => {
                let now = Utc::now();
                print_expiry("access token", credential.access_expires_at);
                print_expiry("refresh token", credential.refresh_expires_at);
                if credential.is_refresh_expired_at(now) {
                    println!("refresh token expired; sign in again");
                } else if credential.is_access_expired_at(now) {
                    println!("access token expired; it will be renewed on the next request");
                }
            }
        }
        Ok(())
    }

    async fn request(
        &self,
        method: HttpMethod,
        path: String,
        query: Vec<(String, String)>,
        body: Option<String>,
    ) -> Result<()> {
        let mut request = query
            .into_iter()
            .fold(ApiRequest::new(method.into(), path), |r, (k, v)| r.query(k, v));
        if let Some(body) = body {
            let body: Value = serde_json::from_str(&body).context("--body is not valid JSON")?;
            request = request.json(body);
        }

        let response = self.session.issue_request(request).await?;
        match response.json::<Value>() {
            Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
            Err(_) => println!("{}", String::from_utf8_lossy(&response.body)),
        }
        if !response.is_success() {
            bail!("server answered {}", response.status);
        }
        Ok(())
    }

    fn open_channel(&self) -> Result<RealtimeChannel> {
        Ok(RealtimeChannel::websocket(
            self.channel_config.clone(),
            self.session.store(),
        )?)
    }

    async fn tail(&self, topic: String) -> Result<()> {
        if !self.session.restore().await? {
            bail!("not signed in");
        }
        let channel = self.open_channel()?;
        let mut states = channel.events();
        let mut expired = self.session.on_session_expired();

        let _subscription = channel.subscribe(topic.clone(), |message| {
            match message.json::<Value>() {
                Ok(body) => println!("{body}"),
                Err(_) => println!("{}", String::from_utf8_lossy(&message.body)),
            }
        });
        channel.connect();
        info!(%topic, "Tailing, press Ctrl+C to stop");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                change = states.recv() => match change {
                    Ok(change) => match change.reason {
                        Some(reason) => warn!(state = %change.to, %reason, "Channel state changed"),
                        None => info!(state = %change.to, "Channel state changed"),
                    },
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                ended = expired.recv() => {
                    if let Ok(ended) = ended {
                        warn!(reason = %ended.reason, "Session ended");
                    }
                    break;
                }
            }
        }

        channel.shutdown().await;
        Ok(())
    }

    async fn say(&self, room: u64, content: String, wait: Duration) -> Result<()> {
        if !self.session.restore().await? {
            bail!("not signed in");
        }
        let channel = self.open_channel()?;
        let mut states = channel.events();
        channel.connect();

        let connected = tokio::time::timeout(wait, async {
            while channel.state() != ChannelState::Connected {
                if let Err(RecvError::Closed) = states.recv().await {
                    break;
                }
            }
        })
        .await;
        if connected.is_err() || channel.state() != ChannelState::Connected {
            channel.disconnect();
            bail!("realtime channel did not connect within {wait:?}");
        }

        let result = channel.send(
            ROOM_SEND_DESTINATION,
            &json!({ "roomId": room, "content": content }),
        );
        channel.shutdown().await;
        result?;
        println!("sent to room {room}");
        Ok(())
    }
}

fn print_expiry(label: &str, at: Option<chrono::DateTime<Utc>>) {
    match at {
        Some(at) => println!("{label} valid until {}", at.to_rfc3339()),
        None => println!("{label} has no known expiry"),
    }
}
