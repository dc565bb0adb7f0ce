//! Queue service command loop.
//!
//! The [`QueueFacade`] is owned by a single task servicing [`QueueCommand`]s
//! from an mpsc channel, which is how the no-internal-locking model of the
//! core survives contact with an async process: collaborators hold a
//! cloneable [`QueueHandle`] and every operation is a request/reply exchange
//! with the one task allowed to touch queue state.

use std::time::Duration;

use postrider_common::{
    DeliveryKind, Envelope, EnvelopeId, MessageId, Signal, internal, now_secs,
};
use postrider_scheduler::RescheduleSelector;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::facade::{PendingEnvelope, QueueError, QueueFacade, QueueStats, Result};

/// Command channel depth; senders back off once this many are in flight.
const COMMAND_BUFFER: usize = 64;

/// Wakeup interval while the queue is empty (in seconds).
const IDLE_WAKE_SECS: u64 = 60;

/// One queue operation with its reply channel.
#[derive(Debug)]
pub enum QueueCommand {
    CreateMessage {
        reply: oneshot::Sender<Result<MessageId>>,
    },
    CreateEnvelope {
        message: MessageId,
        envelope: Box<Envelope>,
        reply: oneshot::Sender<Result<EnvelopeId>>,
    },
    CommitMessage {
        message: MessageId,
        reply: oneshot::Sender<Result<usize>>,
    },
    DeleteMessage {
        message: MessageId,
        reply: oneshot::Sender<Result<usize>>,
    },
    LoadEnvelope {
        id: EnvelopeId,
        reply: oneshot::Sender<Result<Option<Envelope>>>,
    },
    UpdateEnvelope {
        id: EnvelopeId,
        envelope: Box<Envelope>,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteEnvelope {
        id: EnvelopeId,
        reply: oneshot::Sender<Result<()>>,
    },
    NextDue {
        reply: oneshot::Sender<Option<EnvelopeId>>,
    },
    Reschedule {
        selector: RescheduleSelector,
        reply: oneshot::Sender<usize>,
    },
    PendingEnvelope {
        id: EnvelopeId,
        reply: oneshot::Sender<Option<PendingEnvelope>>,
    },
    HostEnvelopes {
        host: String,
        reply: oneshot::Sender<Vec<PendingEnvelope>>,
    },
    MessageEnvelopes {
        message: MessageId,
        reply: oneshot::Sender<Vec<PendingEnvelope>>,
    },
    AllEnvelopes {
        reply: oneshot::Sender<Vec<PendingEnvelope>>,
    },
    Pause {
        kind: DeliveryKind,
        reply: oneshot::Sender<()>,
    },
    Resume {
        kind: DeliveryKind,
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
}

/// Create a linked handle/service pair around `facade`.
#[must_use]
pub fn channel(facade: QueueFacade) -> (QueueHandle, QueueService) {
    let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
    (QueueHandle { sender }, QueueService { facade, commands })
}

/// Cloneable client side of the queue service.
///
/// Every method is a request/reply exchange with the service task; a
/// [`QueueError::ServiceClosed`] means the task has shut down.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<QueueCommand>,
}

impl QueueHandle {
    async fn send(&self, command: QueueCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| QueueError::ServiceClosed)
    }

    /// Open a new message session.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot claim a fresh message id, or
    /// if the service has shut down.
    pub async fn create_message(&self) -> Result<MessageId> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::CreateMessage { reply }).await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)?
    }

    /// Persist an envelope under `message`: held for its session while the
    /// message is open, scheduled immediately once it has committed.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails or the service has shut down.
    pub async fn create_envelope(
        &self,
        message: MessageId,
        envelope: Envelope,
    ) -> Result<EnvelopeId> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::CreateEnvelope {
            message,
            envelope: Box::new(envelope),
            reply,
        })
        .await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)?
    }

    /// Commit a message, scheduling every envelope of its session.
    /// Returns the number of envelopes scheduled.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails or the service has shut down.
    pub async fn commit_message(&self, message: MessageId) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::CommitMessage { message, reply })
            .await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)?
    }

    /// Roll back an uncommitted message. Returns the number of envelopes
    /// discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is not uncommitted, on I/O failure,
    /// or if the service has shut down.
    pub async fn delete_message(&self, message: MessageId) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::DeleteMessage { message, reply })
            .await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)?
    }

    /// Load and decode a committed envelope.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O or decode failure, or if the service has
    /// shut down.
    pub async fn load_envelope(&self, id: EnvelopeId) -> Result<Option<Envelope>> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::LoadEnvelope { id, reply }).await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)?
    }

    /// Persist an envelope's updated attempt history and reschedule it.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails or the service has shut down.
    pub async fn update_envelope(&self, id: EnvelopeId, envelope: Envelope) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::UpdateEnvelope {
            id,
            envelope: Box::new(envelope),
            reply,
        })
        .await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)?
    }

    /// Remove an envelope from the store and the scheduler.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope has no file, on I/O failure, or if
    /// the service has shut down.
    pub async fn delete_envelope(&self, id: EnvelopeId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::DeleteEnvelope { id, reply }).await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)?
    }

    /// The next envelope eligible for a delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the service has shut down.
    pub async fn next_due(&self) -> Result<Option<EnvelopeId>> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::NextDue { reply }).await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)
    }

    /// Expedite pending envelopes. Returns how many matched.
    ///
    /// # Errors
    ///
    /// Returns an error if the service has shut down.
    pub async fn reschedule(&self, selector: RescheduleSelector) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::Reschedule { selector, reply })
            .await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)
    }

    /// The tracked summary and due time for a pending envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the service has shut down.
    pub async fn pending_envelope(&self, id: EnvelopeId) -> Result<Option<PendingEnvelope>> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::PendingEnvelope { id, reply })
            .await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)
    }

    /// Every pending envelope destined to `host`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service has shut down.
    pub async fn host_envelopes(&self, host: impl Into<String>) -> Result<Vec<PendingEnvelope>> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::HostEnvelopes {
            host: host.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)
    }

    /// Every pending envelope of `message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service has shut down.
    pub async fn message_envelopes(&self, message: MessageId) -> Result<Vec<PendingEnvelope>> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::MessageEnvelopes { message, reply })
            .await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)
    }

    /// Every pending envelope in service order.
    ///
    /// # Errors
    ///
    /// Returns an error if the service has shut down.
    pub async fn all_envelopes(&self) -> Result<Vec<PendingEnvelope>> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::AllEnvelopes { reply }).await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)
    }

    /// Stop serving envelopes of `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service has shut down.
    pub async fn pause(&self, kind: DeliveryKind) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::Pause { kind, reply }).await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)
    }

    /// Resume serving envelopes of `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service has shut down.
    pub async fn resume(&self, kind: DeliveryKind) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::Resume { kind, reply }).await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)
    }

    /// Snapshot queue statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the service has shut down.
    pub async fn stats(&self) -> Result<QueueStats> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::Stats { reply }).await?;
        rx.await.map_err(|_| QueueError::ServiceClosed)
    }
}

/// Server side of the queue service: owns the facade and is the only code
/// that mutates it.
#[derive(Debug)]
pub struct QueueService {
    facade: QueueFacade,
    commands: mpsc::Receiver<QueueCommand>,
}

impl QueueService {
    /// Replay the durable queue, then service commands until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if replay hits an I/O failure. Errors inside
    /// individual commands are replied to their requesters, never fatal.
    pub async fn serve(mut self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        let report = self.facade.replay(now_secs())?;
        internal!(
            level = INFO,
            "Replay complete: {} envelope(s) loaded, {} expired, {} message(s) quarantined",
            report.loaded,
            report.expired,
            report.quarantined
        );

        loop {
            let wake = self.next_wake();

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            internal!("All queue handles dropped, shutting down");
                            break;
                        }
                    }
                }

                () = tokio::time::sleep(wake) => {
                    let now = now_secs();
                    if let Some(id) = self.facade.next_due(now) {
                        internal!(level = DEBUG, "Envelope {id} is due");
                    }
                }

                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Queue service received shutdown signal");
                            break;
                        }
                        Err(e) => {
                            postrider_common::tracing::error!(
                                "Queue service shutdown channel error: {e}"
                            );
                            break;
                        }
                    }
                }
            }
        }

        internal!("Queue service shutdown complete");

        Ok(())
    }

    /// Time until the scheduler head comes due, floored at one second so a
    /// due-but-undrained head cannot spin the loop.
    fn next_wake(&self) -> Duration {
        self.facade.head_due_time().map_or(
            Duration::from_secs(IDLE_WAKE_SECS),
            |due| Duration::from_secs(due.saturating_sub(now_secs()).max(1)),
        )
    }

    fn handle_command(&mut self, command: QueueCommand) {
        let now = now_secs();

        match command {
            QueueCommand::CreateMessage { reply } => {
                let _ = reply.send(self.facade.create_message());
            }
            QueueCommand::CreateEnvelope {
                message,
                envelope,
                reply,
            } => {
                let _ = reply.send(self.facade.create_envelope(message, &envelope, now));
            }
            QueueCommand::CommitMessage { message, reply } => {
                let _ = reply.send(self.facade.commit_message(message, now));
            }
            QueueCommand::DeleteMessage { message, reply } => {
                let _ = reply.send(self.facade.delete_message(message));
            }
            QueueCommand::LoadEnvelope { id, reply } => {
                let _ = reply.send(self.facade.load_envelope(id));
            }
            QueueCommand::UpdateEnvelope {
                id,
                envelope,
                reply,
            } => {
                let _ = reply.send(self.facade.update_envelope(id, &envelope, now));
            }
            QueueCommand::DeleteEnvelope { id, reply } => {
                let _ = reply.send(self.facade.delete_envelope(id));
            }
            QueueCommand::NextDue { reply } => {
                let _ = reply.send(self.facade.next_due(now));
            }
            QueueCommand::Reschedule { selector, reply } => {
                let _ = reply.send(self.facade.reschedule(selector, now));
            }
            QueueCommand::PendingEnvelope { id, reply } => {
                let _ = reply.send(self.facade.pending_envelope(id));
            }
            QueueCommand::HostEnvelopes { host, reply } => {
                let _ = reply.send(self.facade.host_envelopes(&host));
            }
            QueueCommand::MessageEnvelopes { message, reply } => {
                let _ = reply.send(self.facade.message_envelopes(message));
            }
            QueueCommand::AllEnvelopes { reply } => {
                let _ = reply.send(self.facade.all_envelopes());
            }
            QueueCommand::Pause { kind, reply } => {
                self.facade.pause(kind);
                let _ = reply.send(());
            }
            QueueCommand::Resume { kind, reply } => {
                self.facade.resume(kind);
                let _ = reply.send(());
            }
            QueueCommand::Stats { reply } => {
                let _ = reply.send(self.facade.stats(now));
            }
        }
    }
}
