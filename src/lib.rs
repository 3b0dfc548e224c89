pub mod attachments;
pub mod captioning;
pub mod commands;
pub mod db;
pub mod doc_processor;
pub mod ids;
pub mod llm;
pub mod pipeline;
pub mod settings;

use attachments::{AttachmentError, AttachmentStore};
use commands::context::DetachedEditor;
use commands::{ChannelSink, InboundCommand, OutboundEvent, SessionHandler};
use db::{Database, StoreError};
use llm::HttpBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Overrides the data directory.
pub const DATA_DIR_ENV: &str = "AI_COMPANION_DATA_DIR";

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("No data directory available")]
    NoDataDir,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Event writer stopped: {0}")]
    Writer(#[from] tokio::task::JoinError),
}

fn data_dir() -> Result<PathBuf, HostError> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|d| d.join("ai-companion"))
        .ok_or(HostError::NoDataDir)
}

/// Runs the backend over stdio: one JSON command per stdin line, one JSON
/// event per stdout line. Logs go to stderr.
pub fn run() -> Result<(), HostError> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let app_dir = data_dir()?;
    info!(path = %app_dir.display(), "starting ai-companion");

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let db = Arc::new(Database::new(&app_dir)?);
        let attachments = Arc::new(AttachmentStore::new(app_dir.join("images"))?);
        let handler = Arc::new(SessionHandler::new(
            db,
            attachments,
            Arc::new(HttpBackend::new()),
            Arc::new(DetachedEditor),
        ));
        let input = BufReader::new(tokio::io::stdin());
        serve(handler, input, tokio::io::stdout()).await?;
        info!("input closed, shutting down");
        Ok::<(), HostError>(())
    })
}

/// Pumps commands from `input` into `handler` and its events into `output`
/// until `input` ends and every started command has finished. Returns the
/// writer.
pub async fn serve<R, W>(
    handler: Arc<SessionHandler>,
    input: R,
    output: W,
) -> Result<W, HostError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_events(rx, output));
    handler.attach_view(Arc::new(ChannelSink::new(tx)));

    let mut tasks = JoinSet::new();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match InboundCommand::parse(&line) {
            Ok(command) => {
                let handler = handler.clone();
                tasks.spawn(async move { handler.handle(command).await });
            }
            Err(e) => warn!(error = %e, "ignoring inbound message"),
        }
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                error!(error = %e, "command task panicked");
            }
        }
    }

    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            error!(error = %e, "command task panicked");
        }
    }
    handler.detach_view();
    Ok(writer.await??)
}

async fn write_events<W>(
    mut rx: mpsc::UnboundedReceiver<OutboundEvent>,
    mut output: W,
) -> Result<W, std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                error!(command = %event.command, error = %e, "could not encode event");
                continue;
            }
        };
        line.push('\n');
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::FakeBackend;
    use serde_json::Value;

    #[tokio::test]
    async fn test_serve_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(SessionHandler::new(
            Arc::new(Database::in_memory().unwrap()),
            Arc::new(AttachmentStore::new(dir.path()).unwrap()),
            Arc::new(FakeBackend::replying("pong")),
            Arc::new(DetachedEditor),
        ));
        let input = concat!(
            "{\"command\":\"chatRequest\",\"data\":{\"message\":\"ping\",\"chat_id\":\"c1\"}}\n",
            "not json\n",
            "\n",
            "{\"command\":\"mystery\"}\n",
        );

        let output = serve(handler.clone(), input.as_bytes(), Vec::new())
            .await
            .unwrap();
        let events: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["role"], "user");
        assert_eq!(events[0]["content"], "ping");
        assert_eq!(events[1]["role"], "bot");
        assert_eq!(events[1]["content"], "pong");
    }
}
