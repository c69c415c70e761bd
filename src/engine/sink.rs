use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::EngineEvent;
use crate::controller::Message;
use crate::frame::{Frame, FrameChannel, PushOutcome};

/// Producer-side handle given to the engine for one stream.
///
/// Frames go straight into the session's `FrameChannel` (a slot swap, never a
/// queue); everything else becomes a message for the display thread. A sink is
/// bound to the session epoch current when it was created: once the session
/// moves on, frames from this sink are disposed on arrival and its events are
/// ignored by the controller.
#[derive(Clone)]
pub struct EngineSink {
    epoch: u64,
    live_epoch: Arc<AtomicU64>,
    channel: Arc<FrameChannel>,
    tx: Sender<Message>,
}

impl EngineSink {
    pub(crate) fn new(
        epoch: u64,
        live_epoch: Arc<AtomicU64>,
        channel: Arc<FrameChannel>,
        tx: Sender<Message>,
    ) -> Self {
        Self {
            epoch,
            live_epoch,
            channel,
            tx,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// False once the session has torn down or restarted the mode this sink served.
    pub fn is_current(&self) -> bool {
        self.live_epoch.load(Ordering::Acquire) == self.epoch
    }

    /// Hand a frame to the display. The epoch check and the slot swap happen
    /// under one lock, so a frame racing a mode change is disposed.
    pub fn on_frame(&self, frame: Frame) {
        if self.channel.push_from(self.epoch, frame) == PushOutcome::RenderRequested {
            self.send(Message::Render);
        }
    }

    pub fn on_finish(&self) {
        self.event(EngineEvent::Finished);
    }

    pub fn on_stream_stopped(&self) {
        self.event(EngineEvent::StreamStopped);
    }

    pub fn on_error(&self, message: impl Into<String>) {
        self.event(EngineEvent::Error(message.into()));
    }

    pub fn on_connection_changed(&self, connected: bool) {
        self.event(EngineEvent::ConnectionChanged(connected));
    }

    fn event(&self, event: EngineEvent) {
        self.send(Message::Engine {
            epoch: self.epoch,
            event,
        });
    }

    fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            log::debug!("EngineSink: controller gone, dropping message");
        }
    }
}
