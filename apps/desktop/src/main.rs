use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, load_settings_from, AttachmentUpload, HttpMessagingApi, MessagingApi,
    MessagingSession, MissingTransport, OutgoingMessage, SessionEvent, Transport, WsTransport,
};
use shared::domain::{ThreadId, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the server URL from settings and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    thread: Option<i64>,
    /// Starts (or reuses) a private thread with this user.
    #[arg(long, conflicts_with = "thread")]
    recipient: Option<i64>,
    #[arg(long)]
    message: Option<String>,
    #[arg(long)]
    attach: Option<PathBuf>,
    /// Skip the live connection and use REST only.
    #[arg(long)]
    rest_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(server_url) = args.server_url.clone() {
        settings.server_url = server_url;
    }

    let transport: Arc<dyn Transport> = if args.rest_only {
        Arc::new(MissingTransport)
    } else {
        Arc::new(WsTransport::new(settings.clone()))
    };
    let api: Arc<dyn MessagingApi> = Arc::new(HttpMessagingApi::new(settings.server_url.clone()));
    let session = MessagingSession::new(UserId(args.user_id), settings, transport, api);
    let mut events = session.subscribe_events();

    session.start().await;
    info!(user_id = args.user_id, "session started");
    for thread in session.threads().await {
        println!(
            "thread {} [{:?}] {} unread={}",
            thread.id,
            thread.kind,
            thread.subject.as_deref().unwrap_or("-"),
            thread.unread_count
        );
    }

    let target = match (args.thread, args.recipient) {
        (Some(thread_id), _) => Some(ThreadId(thread_id)),
        (None, Some(recipient)) => session
            .open_private_thread(UserId(recipient))
            .await
            .map(|thread| thread.id),
        (None, None) => None,
    };
    if let Some(thread_id) = target {
        for message in session.open_thread(thread_id).await {
            println!(
                "[{}] {}: {}",
                message.sent_at,
                message.sender_name.as_deref().unwrap_or("?"),
                message.content.as_deref().unwrap_or("")
            );
        }
    }

    if args.message.is_some() || args.attach.is_some() {
        let thread_id = target.context("--message needs --thread or --recipient")?;
        let mut outgoing = OutgoingMessage {
            thread_id: Some(thread_id),
            content: args.message.clone(),
            ..OutgoingMessage::default()
        };
        if let Some(path) = &args.attach {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read attachment {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string());
            outgoing = outgoing.with_attachment(AttachmentUpload::new(file_name, bytes));
        }
        session.send_message(outgoing).await;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&session, event).await,
                Err(RecvError::Lagged(skipped)) => println!("(skipped {skipped} events)"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.shutdown().await;
    info!(user_id = args.user_id, "session closed");
    Ok(())
}

async fn print_event(session: &MessagingSession, event: SessionEvent) {
    match event {
        SessionEvent::MessagesUpdated { thread_id } => {
            if session.active_thread().await == Some(thread_id) {
                if let Some(message) = session.active_messages().await.last() {
                    println!(
                        "[{}] {}: {}",
                        thread_id,
                        message.sender_name.as_deref().unwrap_or("?"),
                        message.content.as_deref().unwrap_or("")
                    );
                }
            }
        }
        SessionEvent::UnreadChanged(totals) => println!(
            "unread: general={} private={} total={}",
            totals.general, totals.private, totals.total
        ),
        other => println!("{other:?}"),
    }
}
