//! Worker process entry point
//!
//! A worker process reads length-prefixed MessagePack frames from its parent on
//! stdin and answers on stdout. Rounds are handled one at a time; a `quit`
//! message or end of input terminates the loop. Logging goes to stderr so it
//! never corrupts the frame stream.

use super::runner::WorkerRunner;
use crate::protocol::{decode_frame, read_frame, write_message, CoordinatorMessage, WorkerMessage};
use crate::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Serve coordinator messages until `quit` or end of input
pub async fn serve<R, W>(mut reader: R, mut writer: W, runner: WorkerRunner) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            write_message(&mut writer, &msg).await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    loop {
        let frame = match read_frame(&mut reader).await? {
            Some(frame) => frame,
            None => {
                debug!("Parent closed the channel");
                break;
            }
        };
        match decode_frame::<CoordinatorMessage>(&frame) {
            Ok(CoordinatorMessage::Test(round)) => {
                info!(client = round.client_idx, round = round.round_idx, "Received round");
                runner.handle_round(&round, &out_tx).await;
            }
            Ok(CoordinatorMessage::Quit) => {
                info!("Received quit");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Discarding undecodable message");
                let _ = out_tx.send(WorkerMessage::Error("unknown message type".to_string()));
            }
        }
    }

    drop(out_tx);
    writer_task.await??;
    Ok(())
}

/// Run as a worker over this process's stdin/stdout
pub async fn run_stdio() -> Result<()> {
    serve(tokio::io::stdin(), tokio::io::stdout(), WorkerRunner::new()).await
}
