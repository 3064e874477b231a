//! Runs a `CallCoordinator` on its own task and hands out a `CallHandle`
//! for the presentation layer.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{debug, info, warn};

use crate::coordinator::CallCoordinator;
use crate::error::CallError;
use crate::peer::PeerEventReceiver;
use crate::signaling::RegistryEventReceiver;
use crate::types::{CallPhase, CallSnapshot};

const COMMAND_QUEUE: usize = 32;
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    PlaceCall { target: String, reply: Reply<()> },
    AcceptCall { reply: Reply<()> },
    DismissCall { reply: Reply<()> },
    EndCall { reply: Reply<bool> },
    Reset { reply: Reply<()> },
    SetName { name: String },
}

/// Cloneable front door to a running coordinator.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| CallError::CoordinatorClosed)?;
        rx.await.map_err(|_| CallError::CoordinatorClosed)?
    }

    pub async fn place_call(&self, target: impl Into<String>) -> Result<(), CallError> {
        let target = target.into();
        self.request(|reply| Command::PlaceCall { target, reply })
            .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::AcceptCall { reply }).await
    }

    pub async fn dismiss_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::DismissCall { reply }).await
    }

    /// Returns `false` if there was no call to end.
    pub async fn end_call(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub async fn reset(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    pub async fn set_name(&self, name: impl Into<String>) -> Result<(), CallError> {
        self.commands
            .send(Command::SetName { name: name.into() })
            .await
            .map_err(|_| CallError::CoordinatorClosed)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.state.clone()
    }

    /// Waits until the published state satisfies `pred`.
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(&CallSnapshot) -> bool,
    ) -> Result<CallSnapshot, CallError> {
        let mut rx = self.state.clone();
        let snapshot = rx
            .wait_for(|s| pred(s))
            .await
            .map_err(|_| CallError::CoordinatorClosed)?;
        Ok(snapshot.clone())
    }

    pub async fn wait_for_phase(&self, phase: CallPhase) -> Result<CallSnapshot, CallError> {
        self.wait_for(|s| s.phase == phase).await
    }

    /// Waits for a session id, and returns it.
    pub async fn wait_registered(&self) -> Result<String, CallError> {
        let snapshot = self
            .wait_for(|s| s.me.is_some() && s.phase != CallPhase::Ended)
            .await?;
        snapshot.me.ok_or(CallError::NotRegistered)
    }
}

/// Starts the coordinator and its event loop.
///
/// The loop stops when every `CallHandle` is dropped or the registry event
/// stream ends; the live channel is destroyed on the way out.
pub fn spawn_coordinator(
    mut coordinator: CallCoordinator,
    peer_events: PeerEventReceiver,
    registry_events: RegistryEventReceiver,
) -> (CallHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    if let Err(e) = coordinator.start() {
        warn!("initial registration failed: {}", e);
    }
    let (state_tx, state_rx) = watch::channel(coordinator.snapshot());
    let task = tokio::spawn(run(
        coordinator,
        cmd_rx,
        peer_events,
        registry_events,
        state_tx,
    ));
    (
        CallHandle {
            commands: cmd_tx,
            state: state_rx,
        },
        task,
    )
}

async fn run(
    mut coordinator: CallCoordinator,
    mut commands: mpsc::Receiver<Command>,
    mut peer_events: PeerEventReceiver,
    mut registry_events: RegistryEventReceiver,
    state: watch::Sender<CallSnapshot>,
) {
    loop {
        let deadline = coordinator.dial_deadline();
        let wake_at = deadline
            .map(TokioInstant::from_std)
            .unwrap_or_else(|| TokioInstant::now() + IDLE_WAKEUP);

        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    debug!("all call handles dropped");
                    break;
                };
                handle_command(&mut coordinator, cmd, &state);
            }
            event = registry_events.recv() => {
                let Some(event) = event else {
                    warn!("registry event stream ended");
                    break;
                };
                coordinator.handle_registry_event(event);
            }
            Some(event) = peer_events.recv() => {
                coordinator.handle_peer_event(event);
            }
            _ = sleep_until(wake_at), if deadline.is_some() => {
                let now = std::time::Instant::now();
                coordinator.check_dial_timeout(deadline.map_or(now, |d| now.max(d)));
            }
        }

        publish(&state, &coordinator);
    }

    coordinator.shutdown();
    state.send_replace(coordinator.snapshot());
    info!("call coordinator stopped");
}

fn publish(state: &watch::Sender<CallSnapshot>, coordinator: &CallCoordinator) {
    state.send_if_modified(|current| {
        let next = coordinator.snapshot();
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

/// Runs one command. State is published before the reply goes out so a
/// caller that awaited the operation sees its effect in `snapshot()`.
fn handle_command(
    coordinator: &mut CallCoordinator,
    cmd: Command,
    state: &watch::Sender<CallSnapshot>,
) {
    fn finish<T>(
        state: &watch::Sender<CallSnapshot>,
        coordinator: &CallCoordinator,
        reply: Reply<T>,
        result: Result<T, CallError>,
    ) {
        publish(state, coordinator);
        let _ = reply.send(result);
    }

    match cmd {
        Command::PlaceCall { target, reply } => {
            let result = coordinator.place_call(&target);
            finish(state, coordinator, reply, result);
        }
        Command::AcceptCall { reply } => {
            let result = coordinator.accept_call();
            finish(state, coordinator, reply, result);
        }
        Command::DismissCall { reply } => {
            let result = coordinator.dismiss_call();
            finish(state, coordinator, reply, result);
        }
        Command::EndCall { reply } => {
            let result = Ok(coordinator.end_call());
            finish(state, coordinator, reply, result);
        }
        Command::Reset { reply } => {
            coordinator.reset();
            finish(state, coordinator, reply, Ok(()));
        }
        Command::SetName { name } => coordinator.set_name(name),
    }
}
