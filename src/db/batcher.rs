use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

/// Commits one batch in a single round trip.
pub trait BatchWrite: Send + Sync + 'static {
    type Row: Send + 'static;

    fn write(&self, rows: &[Self::Row]) -> impl Future<Output = anyhow::Result<()>> + Send;
}

pub type Ack = oneshot::Receiver<Result<(), String>>;

type Envelope<Row> = (Row, Option<oneshot::Sender<Result<(), String>>>);

/// Accepts rows on a single push channel and groups them into batches. A
/// batch opens lazily on its first row and closes on either `batch_size` rows
/// or `batch_timeout` after that first row, whichever comes first.
pub struct Batcher<Row: Send + 'static> {
    tx: mpsc::Sender<Envelope<Row>>,
}

impl<Row: Send + 'static> Clone for Batcher<Row> {
    fn clone(&self) -> Self {
        Batcher {
            tx: self.tx.clone(),
        }
    }
}

impl<Row: Send + 'static> Batcher<Row> {
    pub fn start<W>(
        name: &'static str,
        writer: W,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Batcher<Row>
    where
        W: BatchWrite<Row = Row>,
    {
        let (tx, mut rx) = mpsc::channel::<Envelope<Row>>(batch_size * 4);

        tokio::spawn(async move {
            loop {
                // A batch starts on its first row
                let Some(first) = rx.recv().await else {
                    break;
                };
                let mut batch = vec![first];
                let deadline = Instant::now() + batch_timeout;

                let mut closed = false;
                while batch.len() < batch_size {
                    match timeout_at(deadline, rx.recv()).await {
                        Ok(Some(envelope)) => batch.push(envelope),
                        Ok(None) => {
                            closed = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }

                let (rows, acks): (Vec<Row>, Vec<_>) = batch.into_iter().unzip();
                let error = match writer.write(&rows).await {
                    Ok(()) => {
                        debug!(rows = rows.len(), "Committed batch into {}", name);
                        None
                    }
                    Err(e) => {
                        warn!("Failed to commit batch into {}: {:#}", name, e);
                        Some(format!("{e:#}"))
                    }
                };

                for ack in acks.into_iter().flatten() {
                    let _ = ack.send(match &error {
                        None => Ok(()),
                        Some(message) => Err(message.clone()),
                    });
                }

                if closed {
                    break;
                }
            }
            debug!("Batcher {} drained", name);
        });

        Batcher { tx }
    }

    pub async fn push(&self, row: Row) {
        if self.tx.send((row, None)).await.is_err() {
            warn!("Batcher channel closed, row dropped");
        }
    }

    /// Pushes a row and returns a receiver resolved once the row's batch has
    /// been committed (or failed).
    pub async fn push_with_ack(&self, row: Row) -> Ack {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send((row, Some(ack_tx))).await.is_err() {
            warn!("Batcher channel closed, row dropped");
        }
        ack_rx
    }
}
