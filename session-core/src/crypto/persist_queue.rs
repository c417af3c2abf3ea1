//! Background persistence of session blobs to the network store
//!
//! Saves are fire-and-forget for callers. A single task owns the pending
//! set, coalesces saves for the same (conversation, peer) so only the newest
//! blob is uploaded, and retries failures with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::api::ServerApi;
use crate::config::RetryPolicy;

type SessionKey = (String, String);

enum PersistCommand {
    Save {
        conversation_id: String,
        peer_id: String,
        blob: String,
    },
    Delete {
        conversation_id: String,
        peer_id: String,
    },
    /// Attempt everything pending now and report how many jobs remain
    Flush(oneshot::Sender<usize>),
}

#[derive(Clone)]
enum JobKind {
    Save(String),
    Delete,
}

struct PendingJob {
    kind: JobKind,
    attempts: u32,
    due: Instant,
}

/// Handle for enqueueing session persistence work
#[derive(Clone)]
pub struct PersistQueue {
    sender: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistQueue {
    /// Spawn the persistence task on the current runtime
    pub fn spawn(api: Arc<dyn ServerApi>, policy: RetryPolicy) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run(api, policy, receiver));
        Self { sender }
    }

    pub fn save(&self, conversation_id: &str, peer_id: &str, blob: String) {
        let command = PersistCommand::Save {
            conversation_id: conversation_id.to_string(),
            peer_id: peer_id.to_string(),
            blob,
        };
        if self.sender.send(command).is_err() {
            tracing::error!(
                "Persistence task stopped; session {}/{} not saved remotely",
                conversation_id,
                peer_id
            );
        }
    }

    pub fn delete(&self, conversation_id: &str, peer_id: &str) {
        let command = PersistCommand::Delete {
            conversation_id: conversation_id.to_string(),
            peer_id: peer_id.to_string(),
        };
        if self.sender.send(command).is_err() {
            tracing::error!("Persistence task stopped; remote delete dropped");
        }
    }

    /// Try all pending work immediately; returns the number of jobs still pending
    pub async fn flush(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(PersistCommand::Flush(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn run(
    api: Arc<dyn ServerApi>,
    policy: RetryPolicy,
    mut receiver: mpsc::UnboundedReceiver<PersistCommand>,
) {
    let mut pending: HashMap<SessionKey, PendingJob> = HashMap::new();

    loop {
        let next_due = pending.values().map(|job| job.due).min();

        let command = match next_due {
            Some(due) => {
                tokio::select! {
                    command = receiver.recv() => command,
                    _ = sleep_until(due) => {
                        attempt_due(api.as_ref(), &policy, &mut pending, false).await;
                        continue;
                    }
                }
            }
            None => receiver.recv().await,
        };

        let Some(command) = command else {
            // All handles dropped: one last attempt, then stop
            attempt_due(api.as_ref(), &policy, &mut pending, true).await;
            if !pending.is_empty() {
                tracing::warn!("{} session saves abandoned at shutdown", pending.len());
            }
            break;
        };

        match command {
            PersistCommand::Save {
                conversation_id,
                peer_id,
                blob,
            } => {
                pending.insert(
                    (conversation_id, peer_id),
                    PendingJob {
                        kind: JobKind::Save(blob),
                        attempts: 0,
                        due: Instant::now(),
                    },
                );
            }
            PersistCommand::Delete {
                conversation_id,
                peer_id,
            } => {
                pending.insert(
                    (conversation_id, peer_id),
                    PendingJob {
                        kind: JobKind::Delete,
                        attempts: 0,
                        due: Instant::now(),
                    },
                );
            }
            PersistCommand::Flush(reply) => {
                attempt_due(api.as_ref(), &policy, &mut pending, true).await;
                let _ = reply.send(pending.len());
            }
        }
    }
}

async fn attempt_due(
    api: &dyn ServerApi,
    policy: &RetryPolicy,
    pending: &mut HashMap<SessionKey, PendingJob>,
    force: bool,
) {
    let now = Instant::now();
    let due: Vec<SessionKey> = pending
        .iter()
        .filter(|(_, job)| force || job.due <= now)
        .map(|(key, _)| key.clone())
        .collect();

    for key in due {
        let Some(job) = pending.get_mut(&key) else {
            continue;
        };
        let (conversation_id, peer_id) = (&key.0, &key.1);

        let result = match &job.kind {
            JobKind::Save(blob) => api.save_session_blob(conversation_id, peer_id, blob).await,
            JobKind::Delete => api.delete_session_blob(conversation_id, peer_id).await,
        };

        match result {
            Ok(()) => {
                tracing::debug!("Persisted session {}/{}", conversation_id, peer_id);
                pending.remove(&key);
            }
            Err(e) => {
                job.attempts += 1;
                if job.attempts >= policy.max_attempts {
                    tracing::error!(
                        "Giving up persisting session {}/{} after {} attempts: {}",
                        conversation_id,
                        peer_id,
                        job.attempts,
                        e
                    );
                    pending.remove(&key);
                } else {
                    let delay = policy.delay_for(job.attempts);
                    tracing::warn!(
                        "Persisting session {}/{} failed (attempt {}), retrying in {:?}: {}",
                        conversation_id,
                        peer_id,
                        job.attempts,
                        delay,
                        e
                    );
                    job.due = Instant::now() + delay;
                }
            }
        }
    }
}
