//! `chatlink` command-line messaging client.
//!
//! Signs in with a bearer token, then either stays connected and prints
//! inbound messages or runs a single command against the service.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/chatlink/config.toml`).
//!
//! ```bash
//! # Listen for messages
//! CHATLINK_TOKEN=... cargo run --bin chatlink
//!
//! # Send one message (socket if it confirms in time, otherwise HTTP)
//! cargo run --bin chatlink -- --token ... send --to 2 "hello"
//!
//! # Page through a group conversation
//! cargo run --bin chatlink -- history --group 4 --page 2
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing_appender::non_blocking::WorkerGuard;

use chatlink::api::ApiError;
use chatlink::api::http::HttpApi;
use chatlink::auth::{SharedToken, TokenSource};
use chatlink::chat::SendError;
use chatlink::chat::send::{SendEvent, SendEventKind};
use chatlink::client::ChatClient;
use chatlink::config::{CliArgs, ClientConfig, Command, ConfigError};
use chatlink::connection::websocket::WsConnector;
use chatlink::connection::{ConnectionError, ConnectionEvent, ConnectionManager, EventKind};
use chatlink_proto::message::{ConversationKey, GroupId, UserId, UserRef};

type Client = ChatClient<HttpApi, WsConnector>;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("no token: pass --token or set CHATLINK_TOKEN")]
    NoToken,
    #[error("name a user (--to/--with) or a group (--group)")]
    NoTarget,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(ws = %config.ws_url, api = %config.api_url, "chatlink starting");

    let command = cli.command.unwrap_or(Command::Listen);
    match run(command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging.
///
/// With a log file, entries go through a non-blocking file writer and the
/// returned [`WorkerGuard`] must be held until shutdown so buffered entries
/// are flushed. Without one, logs go to stderr.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = log_path.parent().filter(|p| !p.as_os_str().is_empty());
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender =
        tracing_appender::rolling::never(log_dir.unwrap_or_else(|| Path::new(".")), file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(command: Command, config: &ClientConfig) -> Result<(), CliError> {
    let token = config.token.clone().ok_or(CliError::NoToken)?;
    let tokens: Arc<dyn TokenSource> = Arc::new(SharedToken::new(token));

    let api = Arc::new(HttpApi::new(
        config.api_base()?,
        Arc::clone(&tokens),
        config.request_timeout,
    )?);
    let connection = ConnectionManager::new(WsConnector, tokens, config.connection_config()?);
    let client = ChatClient::for_current_user(
        api,
        connection,
        config.send_config(),
        config.store_config(),
    )
    .await?;

    match command {
        Command::Listen => listen(&client).await,
        Command::Send { to, group, text } => send(&client, target(to, group)?, text).await,
        Command::History { with, group, page } => history(&client, target(with, group)?, page).await,
        Command::Conversations => conversations(&client).await,
        Command::Unread => {
            let count = client
                .notifications()
                .fetch_unread_count()
                .await
                .unwrap_or_else(|| client.unread_count());
            println!("{count}");
            Ok(())
        }
    }
}

fn target(user: Option<u64>, group: Option<u64>) -> Result<ConversationKey, CliError> {
    match (group, user) {
        (Some(g), _) => Ok(ConversationKey::Group(GroupId::new(g))),
        (None, Some(u)) => Ok(ConversationKey::Direct(UserId::new(u))),
        (None, None) => Err(CliError::NoTarget),
    }
}

async fn listen(client: &Client) -> Result<(), CliError> {
    let me = client.me().id;
    let gave_up = Arc::new(Notify::new());

    let frames = client.connection().on(EventKind::Message, move |event| {
        if let ConnectionEvent::Frame(frame) = event
            && let Some(raw) = frame.message()
        {
            let from = raw
                .sender
                .as_ref()
                .filter(|s| s.id != me)
                .map_or_else(|| "me".to_string(), UserRef::label);
            let content = raw.content.as_deref().unwrap_or_default();
            match raw.group_id {
                Some(group) => println!("[group {group}] {from}: {content}"),
                None => println!("{from}: {content}"),
            }
        }
    });
    let status = {
        let gave_up = Arc::clone(&gave_up);
        client.connection().on(EventKind::Error, move |event| {
            if let ConnectionEvent::Error(ConnectionError::MaxReconnectExceeded { attempts }) = event {
                eprintln!("giving up after {attempts} reconnect attempts");
                gave_up.notify_one();
            }
        })
    };

    client.connect().await;
    match client.refresh_conversations().await {
        Ok(previews) => {
            let unread: u32 = previews.iter().map(|p| p.unread_count).sum();
            eprintln!("{} conversations, {unread} unread", previews.len());
        }
        Err(e) => tracing::warn!(error = %e, "could not load conversations"),
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        () = gave_up.notified() => {}
    }

    client.connection().off(EventKind::Message, frames);
    client.connection().off(EventKind::Error, status);
    client.disconnect();
    Ok(())
}

async fn send(client: &Client, key: ConversationKey, text: String) -> Result<(), CliError> {
    let via = Arc::new(Mutex::new(None));
    let listener = {
        let via = Arc::clone(&via);
        client.sender().on(SendEventKind::Delivered, move |event| {
            let SendEvent::Delivered { via: path, .. } = event;
            *via.lock() = Some(*path);
        })
    };

    client.connect().await;
    let result = match key {
        ConversationKey::Direct(peer) => client.send_message(peer, text).await,
        ConversationKey::Group(group) => client.send_group_message(group, text).await,
    };
    client.sender().off(SendEventKind::Delivered, listener);
    client.disconnect();

    let message = result?;
    let path = via.lock().map_or_else(|| "unknown".to_string(), |p| p.to_string());
    match message.id {
        Some(id) => println!("sent message {id} via {path}"),
        None => println!("sent via {path}"),
    }
    Ok(())
}

async fn history(client: &Client, key: ConversationKey, page: u32) -> Result<(), CliError> {
    let page_size = client.store().config().page_size;
    let cursor = client.store().fetch(key, page.max(1), page_size).await?;
    let Some(conversation) = client.store().conversation(key) else {
        return Ok(());
    };
    for message in &conversation.messages {
        let marker = if message.is_revoked {
            " (revoked)"
        } else if message.is_edited {
            " (edited)"
        } else {
            ""
        };
        println!(
            "{} {}: {}{marker}",
            message.timestamp.format("%Y-%m-%d %H:%M"),
            message.sender.label(),
            message.content
        );
    }
    println!(
        "-- page {} of {} messages{}",
        cursor.page,
        cursor.count,
        if cursor.has_next { ", older pages available" } else { "" }
    );
    Ok(())
}

async fn conversations(client: &Client) -> Result<(), CliError> {
    for preview in client.refresh_conversations().await? {
        let last = preview
            .last_message
            .as_ref()
            .map_or("", |m| m.content.as_str());
        let badge = if preview.unread_count > 0 {
            format!(" [{}]", preview.unread_count)
        } else {
            String::new()
        };
        println!("{} ({}){badge}: {last}", preview.title, preview.key);
    }
    Ok(())
}
