// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The per-sector actor. Exactly one state machine owns each sector
//! record. Events are delivered through a mailbox in arrival order; a
//! batch is planned only while no handler stage is in flight, the planned
//! record is persisted before the next stage is dispatched.

use crate::db::Store;
use crate::errors::Error;
use crate::events::SealingEvent;
use crate::sector_state::SectorState;
use crate::store::SectorStore;
use crate::types::SectorInfo;
use async_trait::async_trait;
use fvm_shared::sector::SectorNumber;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::error;

/// Decides state transitions and runs the handler for the state an event
/// batch arrived at.
#[async_trait]
pub trait Planner: Send + Sync + 'static {
    /// Apply a batch of events to the sector record, in place.
    fn plan(&self, events: &[SealingEvent], state: &mut SectorInfo) -> Result<(), Error>;

    /// Run whatever work the (already persisted) state calls for. Every
    /// outcome is reported back through the context's event sink; dispatch
    /// itself never fails.
    async fn dispatch(&self, ctx: Context, state: SectorInfo);
}

/// Handler-side view of the owning state machine.
#[derive(Clone)]
pub struct Context {
    sector: SectorNumber,
    events: flume::Sender<SealingEvent>,
}

impl Context {
    pub fn sector(&self) -> SectorNumber {
        self.sector
    }

    /// Queue a follow-up event onto this sector's own mailbox.
    pub fn send(&self, event: SealingEvent) -> Result<(), Error> {
        self.events.send(event).map_err(|_| Error::NotAccepted)
    }
}

pub(crate) struct StateMachine {
    sender: flume::Sender<SealingEvent>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl StateMachine {
    pub(crate) fn begin<DB, P>(
        id: SectorNumber,
        initial: SectorInfo,
        store: SectorStore<DB>,
        planner: Weak<P>,
    ) -> Self
    where
        DB: Store + Send + Sync + 'static,
        P: Planner,
    {
        let (sender, receiver) = flume::unbounded();
        let (stop_tx, stop_rx) = oneshot::channel();
        let events = sender.clone();
        let handle = tokio::spawn(run(id, initial, store, planner, events, receiver, stop_rx));
        StateMachine {
            sender,
            stop: Some(stop_tx),
            handle,
        }
    }

    pub(crate) fn send(&self, event: SealingEvent) -> Result<(), Error> {
        self.sender.send(event).map_err(|_| Error::NotAccepted)
    }

    pub(crate) async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.handle.await;
    }
}

async fn run<DB, P>(
    id: SectorNumber,
    mut state: SectorInfo,
    store: SectorStore<DB>,
    planner: Weak<P>,
    events: flume::Sender<SealingEvent>,
    mailbox: flume::Receiver<SealingEvent>,
    mut stop: oneshot::Receiver<()>,
) where
    DB: Store + Send + Sync + 'static,
    P: Planner,
{
    let mut pending: VecDeque<SealingEvent> = VecDeque::new();
    let mut stage: Option<JoinHandle<()>> = None;

    loop {
        let mut stage_done = false;
        match stage.as_mut() {
            Some(running) => {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = running => stage_done = true,
                    event = mailbox.recv_async() => match event {
                        Ok(event) => pending.push_back(event),
                        Err(_) => break,
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = &mut stop => break,
                    event = mailbox.recv_async() => match event {
                        Ok(event) => pending.push_back(event),
                        Err(_) => break,
                    },
                }
            }
        }
        if stage_done {
            stage = None;
        }
        while let Ok(event) = mailbox.try_recv() {
            pending.push_back(event);
        }

        if stage.is_some() || pending.is_empty() {
            continue;
        }
        let Some(planner) = planner.upgrade() else {
            break;
        };

        // `Committing` is the one state whose planner consumes whole
        // batches (commit completion can race chain notifications); every
        // other state takes exactly one event per planning round
        let batch: Vec<SealingEvent> = if state.state == SectorState::Committing {
            pending.drain(..).collect()
        } else {
            match pending.pop_front() {
                Some(event) => vec![event],
                None => continue,
            }
        };
        let mut next = state.clone();
        match planner.plan(&batch, &mut next) {
            Ok(()) => {
                if let Err(e) = store.put(id, &next) {
                    error!(sector = id, "persisting sector state: {}", e);
                }
                state = next;
                stage = Some(spawn_stage(id, planner, &events, state.clone()));
            }
            Err(e) => {
                error!(sector = id, "running planner failed: {}", e);
                // the audit log still records the rejected events
                state.log = next.log;
                if let Err(e) = store.put(id, &state) {
                    error!(sector = id, "persisting sector log: {}", e);
                }
            }
        }
    }

    if let Some(stage) = stage {
        stage.abort();
    }
}

fn spawn_stage<P: Planner>(
    id: SectorNumber,
    planner: Arc<P>,
    events: &flume::Sender<SealingEvent>,
    state: SectorInfo,
) -> JoinHandle<()> {
    let ctx = Context {
        sector: id,
        events: events.clone(),
    };
    tokio::spawn(async move { planner.dispatch(ctx, state).await })
}
