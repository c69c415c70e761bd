//! Frame ownership and the latest-wins handoff.
//!
//! - `Frame`: decoded image buffer plus detection boxes. Not `Clone`; one owner at a time.
//! - `FrameChannel`: single-slot conduit from engine threads to the display thread.
//!
//! A frame that enters the channel leaves it in exactly one way: taken by the
//! consumer, superseded by a newer push, or discarded when the channel closes.
//! Each path ends in `Drop`, which zeroizes the pixels and runs the release
//! hook exactly once. Memory held by the channel is therefore 0 or 1 frames.

use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use zeroize::Zeroize;

pub use crate::detect::DetectionBox;

type ReleaseHook = Box<dyn FnOnce() + Send + 'static>;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Decoded image plus the ordered detection boxes produced for it.
///
/// There is no `Clone`: a frame moves producer → channel → consumer and is
/// dropped by whoever holds it last.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub boxes: Vec<DetectionBox>,
    produced_at: Instant,
    release: Option<ReleaseHook>,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            boxes: Vec::new(),
            produced_at: Instant::now(),
            release: None,
        }
    }

    /// Allocate a zeroed buffer of `width * height * channels` bytes.
    ///
    /// Allocation failure is reported instead of aborting so producers can
    /// treat it as a dropped frame.
    pub fn try_alloc(width: u32, height: u32, channels: u32) -> Result<Self> {
        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(channels as usize))
            .ok_or_else(|| anyhow!("frame size {}x{}x{} overflows", width, height, channels))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| anyhow!("frame allocation of {} bytes failed: {}", len, e))?;
        data.resize(len, 0);
        Ok(Self::new(data, width, height))
    }

    pub fn with_boxes(mut self, boxes: Vec<DetectionBox>) -> Self {
        self.boxes = boxes;
        self
    }

    /// Attach a hook that returns the underlying buffer to its owner.
    ///
    /// Runs once, when the frame is dropped.
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn age(&self) -> Duration {
        self.produced_at.elapsed()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .field("boxes", &self.boxes.len())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.data.zeroize();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

// ----------------------------------------------------------------------------
// FrameChannel
// ----------------------------------------------------------------------------

/// What a producer must do after a push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// No render was outstanding; the producer must schedule one on the consumer.
    RenderRequested,
    /// A render is already outstanding and will pick this frame up.
    Coalesced,
    /// The channel is closed or the frame's epoch was fenced off; the frame was disposed.
    Rejected,
}

/// Frame channel counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Frames accepted into the slot.
    pub pushed: u64,
    /// Frames disposed because a newer frame replaced them before consumption.
    pub superseded: u64,
    /// Frames handed to the consumer.
    pub presented: u64,
    /// Frames disposed by close/clear or rejected while closed.
    pub discarded: u64,
}

struct Slot {
    pending: Option<Frame>,
    open: bool,
    /// Producer epoch accepted by `push_from`.
    epoch: u64,
}

/// Single-slot, latest-wins handoff from producer threads to one consumer.
///
/// `push` and `take_latest` never block on each other beyond the slot swap.
/// The `presenting` flag coalesces bursts of pushes into one render request.
/// The slot also carries an epoch: `fence` retires every producer tagged with
/// an older one, and the check happens under the same lock as the swap.
pub struct FrameChannel {
    slot: Mutex<Slot>,
    presenting: AtomicBool,
    pushed: AtomicU64,
    superseded: AtomicU64,
    presented: AtomicU64,
    discarded: AtomicU64,
}

impl FrameChannel {
    /// New channel, closed until a session mode opens it.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                pending: None,
                open: false,
                epoch: 0,
            }),
            presenting: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
            presented: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Install `frame` as the pending frame, disposing any unconsumed one.
    pub fn push(&self, frame: Frame) -> PushOutcome {
        self.offer(None, frame)
    }

    /// `push` for a producer bound to `epoch`; frames from a fenced-off epoch
    /// are disposed on arrival.
    pub fn push_from(&self, epoch: u64, frame: Frame) -> PushOutcome {
        self.offer(Some(epoch), frame)
    }

    fn offer(&self, epoch: Option<u64>, frame: Frame) -> PushOutcome {
        let previous = {
            let mut slot = self.lock_slot();
            if !slot.open {
                drop(slot);
                self.discarded.fetch_add(1, Ordering::Relaxed);
                log::debug!("FrameChannel: closed, dropping {:?}", frame);
                return PushOutcome::Rejected;
            }
            if let Some(epoch) = epoch.filter(|e| *e != slot.epoch) {
                let current = slot.epoch;
                drop(slot);
                self.discarded.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "FrameChannel: epoch {} retired (now {}), dropping {:?}",
                    epoch,
                    current,
                    frame
                );
                return PushOutcome::Rejected;
            }
            slot.pending.replace(frame)
        };
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if let Some(stale) = previous {
            self.superseded.fetch_add(1, Ordering::Relaxed);
            drop(stale);
        }

        if self.presenting.swap(true, Ordering::AcqRel) {
            PushOutcome::Coalesced
        } else {
            PushOutcome::RenderRequested
        }
    }

    /// Remove and return the pending frame, if any.
    pub fn take_latest(&self) -> Option<Frame> {
        let frame = self.lock_slot().pending.take();
        if frame.is_some() {
            self.presented.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Consumer side of a render request: re-arm the flag, then take.
    ///
    /// The flag is cleared before the take so a push racing with this call
    /// schedules a fresh render instead of being stranded in the slot.
    pub fn begin_render(&self) -> Option<Frame> {
        self.presenting.store(false, Ordering::Release);
        self.take_latest()
    }

    /// Dispose the pending frame without presenting it.
    pub fn clear(&self) -> bool {
        let stale = self.lock_slot().pending.take();
        match stale {
            Some(frame) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                drop(frame);
                true
            }
            None => false,
        }
    }

    /// Accept only producers tagged `epoch` from now on, disposing whatever an
    /// older producer left pending.
    pub fn fence(&self, epoch: u64) -> bool {
        let stale = {
            let mut slot = self.lock_slot();
            slot.epoch = epoch;
            slot.pending.take()
        };
        match stale {
            Some(frame) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                drop(frame);
                true
            }
            None => false,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.lock_slot().epoch
    }

    pub fn open(&self) {
        self.lock_slot().open = true;
    }

    /// Stop accepting frames and dispose the pending one.
    pub fn close(&self) {
        let stale = {
            let mut slot = self.lock_slot();
            slot.open = false;
            slot.pending.take()
        };
        self.presenting.store(false, Ordering::Release);
        if let Some(frame) = stale {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            drop(frame);
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock_slot().open
    }

    pub fn has_pending(&self) -> bool {
        self.lock_slot().pending.is_some()
    }

    pub fn render_outstanding(&self) -> bool {
        self.presenting.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            presented: self.presented.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    // Poisoning is recovered; the pending frame must still be disposed.
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FrameChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
