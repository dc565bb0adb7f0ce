use std::sync::{Arc, LazyLock};

use postrider_common::{Signal, internal, logging, tracing};
use postrider_control::{ControlServer, DEFAULT_CONTROL_SOCKET};
use postrider_scheduler::RetryPolicy;
use postrider_store::EnvelopeStore;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::{control_handler::PostriderControlHandler, facade::QueueFacade, service};

fn default_control_socket() -> String {
    DEFAULT_CONTROL_SOCKET.to_string()
}

#[derive(Deserialize)]
pub struct Postrider {
    #[serde(alias = "spool")]
    store: EnvelopeStore,
    #[serde(alias = "retry", default)]
    policy: RetryPolicy,
    #[serde(alias = "control", default = "default_control_socket")]
    control_socket: String,
}

impl Default for Postrider {
    fn default() -> Self {
        Self {
            store: EnvelopeStore::default(),
            policy: RetryPolicy::default(),
            control_socket: default_control_socket(),
        }
    }
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Postrider {
    /// Run this controller, and everything it controls
    ///
    /// # Errors
    ///
    /// This function will return an error if the store root cannot be
    /// initialised, or if replay or the control socket hit a fatal error.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        self.store.init()?;

        internal!("Controller running");

        let Self {
            store,
            policy,
            control_socket,
        } = self;

        let (queue, service) = service::channel(QueueFacade::new(store, policy));

        let handler = Arc::new(PostriderControlHandler::new(queue));
        let control = ControlServer::new(control_socket, handler)?;

        let ret: anyhow::Result<()> = tokio::select! {
            r = service.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(Into::into)
            }
            r = control.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(Into::into)
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        ret
    }
}
