//! Control handler implementation for the postrider queue
//!
//! This module implements the `CommandHandler` trait to process control
//! requests against the running queue service.

use std::time::Instant;

use async_trait::async_trait;
use postrider_common::now_secs;
use postrider_control::{
    ControlError, ListScope, QueueCommand, Request, RequestCommand, RescheduleTarget, Response,
    SystemCommand,
    protocol::{QueueEnvelope, ResponseData},
    server::CommandHandler,
};
use postrider_scheduler::RescheduleSelector;

use crate::{
    facade::{PendingEnvelope, QueueError},
    service::QueueHandle,
};

/// Handler for control commands
pub struct PostriderControlHandler {
    /// Handle into the queue service
    queue: QueueHandle,
    /// Server start time for uptime calculation
    start_time: Instant,
}

impl PostriderControlHandler {
    /// Create a new control handler
    #[must_use]
    pub fn new(queue: QueueHandle) -> Self {
        Self {
            queue,
            start_time: Instant::now(),
        }
    }
}

#[async_trait]
impl CommandHandler for PostriderControlHandler {
    async fn handle_request(&self, request: Request) -> postrider_control::Result<Response> {
        match request.command {
            RequestCommand::System(command) => self.handle_system_command(command).await,
            RequestCommand::Queue(command) => self.handle_queue_command(command).await,
        }
    }
}

impl PostriderControlHandler {
    /// Handle system management commands
    async fn handle_system_command(
        &self,
        command: SystemCommand,
    ) -> postrider_control::Result<Response> {
        match command {
            SystemCommand::Ping => Ok(Response::ok()),

            SystemCommand::Status => {
                let stats = self.queue.stats().await.map_err(server_error)?;

                let status = postrider_control::protocol::SystemStatus {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    uptime_secs: self.start_time.elapsed().as_secs(),
                    pending_envelopes: stats.pending,
                    paused_kinds: stats
                        .paused_kinds
                        .into_iter()
                        .map(|kind| kind.to_string())
                        .collect(),
                };

                Ok(Response::data(ResponseData::SystemStatus(status)))
            }
        }
    }

    /// Handle queue management commands
    async fn handle_queue_command(
        &self,
        command: QueueCommand,
    ) -> postrider_control::Result<Response> {
        match command {
            QueueCommand::Stats => {
                let stats = self.queue.stats().await.map_err(server_error)?;
                let now = now_secs();

                let stats = postrider_control::protocol::QueueStats {
                    pending: stats.pending,
                    hosts: stats.hosts,
                    batches: stats.batches,
                    messages: stats.messages,
                    due_now: stats.due_now,
                    by_kind: stats
                        .by_kind
                        .into_iter()
                        .map(|(kind, count)| (kind.to_string(), count))
                        .collect(),
                    top_destinations: stats.top_destinations,
                    oldest_age_secs: stats
                        .oldest_creation_time
                        .map(|created| now.saturating_sub(created)),
                    paused_kinds: stats
                        .paused_kinds
                        .into_iter()
                        .map(|kind| kind.to_string())
                        .collect(),
                };

                Ok(Response::data(ResponseData::QueueStats(stats)))
            }

            QueueCommand::List { scope } => {
                let pending = match scope {
                    ListScope::All => self.queue.all_envelopes().await,
                    ListScope::Host(host) => self.queue.host_envelopes(host).await,
                    ListScope::Message(message) => self.queue.message_envelopes(message).await,
                }
                .map_err(server_error)?;

                let envelopes = pending.into_iter().map(queue_envelope).collect();

                Ok(Response::data(ResponseData::Envelopes(envelopes)))
            }

            QueueCommand::Reschedule { target } => {
                let selector = match target {
                    RescheduleTarget::All => RescheduleSelector::All,
                    RescheduleTarget::Envelope(id) => RescheduleSelector::Envelope(id),
                    RescheduleTarget::Message(id) => RescheduleSelector::Message(id),
                };

                let count = self.queue.reschedule(selector).await.map_err(server_error)?;

                Ok(Response::data(ResponseData::Count(count)))
            }

            QueueCommand::Remove { envelope } => {
                if self
                    .queue
                    .pending_envelope(envelope)
                    .await
                    .map_err(server_error)?
                    .is_none()
                {
                    return Ok(Response::error(format!("Envelope not found: {envelope}")));
                }

                self.queue
                    .delete_envelope(envelope)
                    .await
                    .map_err(server_error)?;

                Ok(Response::data(ResponseData::Message(format!(
                    "Removed envelope {envelope}"
                ))))
            }

            QueueCommand::Pause { kind } => {
                self.queue.pause(kind).await.map_err(server_error)?;

                Ok(Response::data(ResponseData::Message(format!(
                    "Paused {kind} deliveries"
                ))))
            }

            QueueCommand::Resume { kind } => {
                self.queue.resume(kind).await.map_err(server_error)?;

                Ok(Response::data(ResponseData::Message(format!(
                    "Resumed {kind} deliveries"
                ))))
            }
        }
    }
}

/// Convert a tracked pending envelope into its wire form
fn queue_envelope(pending: PendingEnvelope) -> QueueEnvelope {
    QueueEnvelope {
        id: pending.summary.id.to_string(),
        kind: pending.summary.kind.to_string(),
        destination: pending.summary.destination.to_string(),
        attempts: pending.summary.attempt_count,
        created_at: pending.summary.creation_time,
        due_at: pending.due_time,
    }
}

fn server_error(error: QueueError) -> ControlError {
    ControlError::ServerError(error.to_string())
}
