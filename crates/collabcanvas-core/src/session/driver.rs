//! The task that owns a [`CanvasSession`] against a remote room.

use super::{CanvasSession, RemoteOp};
use crate::canvas::CanvasDocument;
use crate::config::RetryPolicy;
use crate::error::{LockError, RemoteError, RemoteResult};
use crate::layering::ReorderDirection;
use crate::presence::AvatarState;
use crate::remote::RemoteRoom;
use crate::shapes::{ShapeId, ShapeKind, ShapePatch};
use kurbo::Point;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Something the local user asked for.
#[derive(Debug)]
pub enum Intent {
    CreateShape { kind: ShapeKind, attrs: ShapePatch },
    UpdateShape { id: ShapeId, patch: ShapePatch },
    RemoveShape(ShapeId),
    Reorder { ids: Vec<ShapeId>, direction: ReorderDirection },
    SelectShapes(Vec<ShapeId>),
    DeselectAll,
    BeginEdit(ShapeId),
    EndEdit(ShapeId),
    Duplicate(Vec<ShapeId>),
    AutoLayout(Vec<ShapeId>),
    MoveCursor(Point),
    PublishAvatar(AvatarState),
    Hidden,
    /// Leave the room and stop the driver.
    Leave,
    /// Reply with a copy of the local document.
    ReadDocument(oneshot::Sender<CanvasDocument>),
}

/// Notifications from the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The initial shape batch has been applied.
    Ready,
    Created(ShapeId),
    Duplicated(Vec<ShapeId>),
    /// An intent was refused because of a lock.
    Refused(LockError),
    /// Another client took over shapes the local client held.
    TakenOver(Vec<ShapeId>),
    /// Locks left by departed clients were cleared.
    LocksCleared(Vec<ShapeId>),
    /// A remote operation kept failing. Local state is kept as is.
    WriteFailed { op: String, error: RemoteError },
    Closed,
}

/// Sends intents to a running driver.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    intents: mpsc::UnboundedSender<Intent>,
}

impl SessionHandle {
    pub fn send(&self, intent: Intent) -> RemoteResult<()> {
        self.intents.send(intent).map_err(|_| RemoteError::Disconnected)
    }

    pub async fn document(&self) -> RemoteResult<CanvasDocument> {
        let (tx, rx) = oneshot::channel();
        self.send(Intent::ReadDocument(tx))?;
        rx.await.map_err(|_| RemoteError::Disconnected)
    }
}

fn every(period_ms: u64) -> Interval {
    let period = Duration::from_millis(period_ms.max(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Drives a session: intents, remote feeds, timers, and the writer task.
pub struct SessionDriver<R: RemoteRoom + 'static> {
    session: CanvasSession,
    room: Arc<R>,
    intents: mpsc::UnboundedReceiver<Intent>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<R: RemoteRoom + 'static> SessionDriver<R> {
    pub fn new(session: CanvasSession, room: Arc<R>) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (intent_tx, intents) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let driver = Self {
            session,
            room,
            intents,
            events,
        };
        (driver, SessionHandle { intents: intent_tx }, event_rx)
    }

    pub fn spawn(self) -> JoinHandle<RemoteResult<()>> {
        tokio::spawn(self.run())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Run until [`Intent::Leave`], until every handle is dropped, or until a
    /// remote feed ends. Queued writes are delivered before returning.
    pub async fn run(mut self) -> RemoteResult<()> {
        let (writer, jobs) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(run_writer(
            self.room.clone(),
            jobs,
            self.session.config().retry,
            self.events.clone(),
        ));

        let mut shapes = self.room.subscribe_shapes().await?;
        let mut presence = self.room.subscribe_presence().await?;
        let mut cold_snapshot = match self.room.read_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Could not read snapshot: {}", e);
                None
            }
        };
        log::info!("Session {} started", self.session.local_client());

        let config = self.session.config().clone();
        let mut heartbeat = every(config.presence.heartbeat_interval_ms);
        let mut sweep = every(config.lock_sweep_interval_ms);
        let mut snapshots = every(config.snapshot_interval_ms);
        let mut publish = every(config.presence.publish_interval_ms);
        self.session.heartbeat();
        self.flush(&writer);

        let result = loop {
            let wait = self
                .session
                .next_deadline()
                .map(|due| Duration::from_millis(due.saturating_sub(self.session.now_millis())));

            tokio::select! {
                intent = self.intents.recv() => match intent {
                    Some(Intent::Leave) | None => {
                        self.session.leave();
                        self.flush(&writer);
                        break Ok(());
                    }
                    Some(intent) => self.handle(intent),
                },
                batch = shapes.recv() => match batch {
                    Some(batch) => {
                        let was_ready = self.session.is_ready();
                        let report = self.session.apply_feed(batch);
                        if !report.taken_over.is_empty() {
                            self.emit(SessionEvent::TakenOver(report.taken_over));
                        }
                        if !was_ready && self.session.is_ready() {
                            if let Some(snapshot) = cold_snapshot.take() {
                                self.session.hydrate_from_snapshot(&snapshot);
                            }
                            self.emit(SessionEvent::Ready);
                        }
                    }
                    None => break Err(RemoteError::Disconnected),
                },
                records = presence.recv() => match records {
                    Some(records) => self.session.apply_presence(records),
                    None => break Err(RemoteError::Disconnected),
                },
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {
                    self.session.tick();
                }
                _ = heartbeat.tick() => self.session.heartbeat(),
                _ = sweep.tick() => {
                    let cleared = self.session.reconcile_locks();
                    if !cleared.is_empty() {
                        self.emit(SessionEvent::LocksCleared(cleared));
                    }
                }
                _ = snapshots.tick() => {
                    if self.session.is_ready() {
                        self.session.queue_snapshot();
                    }
                }
                _ = publish.tick() => self.session.flush_presence(),
            }
            self.flush(&writer);
        };

        if let Err(e) = &result {
            log::warn!("Session {} stopped: {}", self.session.local_client(), e);
        }
        drop(writer);
        if let Err(e) = writer_task.await {
            log::warn!("Writer task failed: {}", e);
        }
        self.emit(SessionEvent::Closed);
        result
    }

    fn flush(&mut self, writer: &mpsc::UnboundedSender<RemoteOp>) {
        for op in self.session.take_outgoing() {
            if writer.send(op).is_err() {
                log::warn!("Writer task is gone, dropping remote operation");
            }
        }
    }

    fn handle(&mut self, intent: Intent) {
        let refused = match intent {
            Intent::CreateShape { kind, attrs } => {
                let id = self.session.create_shape(kind, attrs);
                self.emit(SessionEvent::Created(id));
                Vec::new()
            }
            Intent::UpdateShape { id, patch } => self.session.update_shape(&id, patch).err().into_iter().collect(),
            Intent::RemoveShape(id) => self.session.remove_shape(&id).err().into_iter().collect(),
            Intent::Reorder { ids, direction } => {
                self.session.reorder(&ids, direction);
                Vec::new()
            }
            Intent::SelectShapes(ids) => self.session.select_shapes(&ids),
            Intent::DeselectAll => {
                self.session.deselect_all();
                Vec::new()
            }
            Intent::BeginEdit(id) => self.session.begin_edit(&id).err().into_iter().collect(),
            Intent::EndEdit(id) => {
                if !self.session.end_edit(&id) {
                    log::debug!("Edit of {} ended without commit", id);
                }
                Vec::new()
            }
            Intent::Duplicate(ids) => {
                let created = self.session.duplicate(&ids);
                self.emit(SessionEvent::Duplicated(created));
                Vec::new()
            }
            Intent::AutoLayout(ids) => {
                self.session.auto_layout(&ids);
                Vec::new()
            }
            Intent::MoveCursor(point) => {
                self.session.move_cursor(point);
                Vec::new()
            }
            Intent::PublishAvatar(avatar) => {
                self.session.publish_avatar(avatar);
                Vec::new()
            }
            Intent::Hidden => {
                self.session.hidden();
                Vec::new()
            }
            Intent::ReadDocument(reply) => {
                let _ = reply.send(self.session.document().clone());
                Vec::new()
            }
            Intent::Leave => Vec::new(),
        };
        for e in refused {
            self.emit(SessionEvent::Refused(e));
        }
    }
}

/// Deliver remote operations in order, retrying each with backoff.
async fn run_writer<R: RemoteRoom + ?Sized>(
    room: Arc<R>,
    mut jobs: mpsc::UnboundedReceiver<RemoteOp>,
    retry: RetryPolicy,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(op) = jobs.recv().await {
        let mut attempt = 1;
        loop {
            match op.perform(room.as_ref()).await {
                Ok(()) => break,
                Err(e) if attempt < retry.max_attempts => {
                    let backoff = retry.backoff_ms(attempt);
                    log::warn!(
                        "{} failed (attempt {}): {}, retrying in {}ms",
                        op.describe(),
                        attempt,
                        e,
                        backoff
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::warn!("{} failed after {} attempts: {}", op.describe(), attempt, e);
                    let _ = events.send(SessionEvent::WriteFailed {
                        op: op.describe(),
                        error: e,
                    });
                    break;
                }
            }
        }
    }
}
