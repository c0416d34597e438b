//! Frame acquisition backends.
//!
//! Decoding devices and network streams is left to implementors of [`FrameSource`];
//! the crate only ships [`SubmittedSource`] for frames pushed in from outside
//! (e.g. uploaded by a browser).

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::RgbImage;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame::Frame;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "target", rename_all = "snake_case")]
pub enum SourceKind {
    Device(u32),
    Stream(String),
    Submitted,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
        }
    }
}

/// One logical camera as seen by the acquisition loop.
///
/// `read` may block for a short while waiting on the device; errors are treated
/// as transient and retried after a backoff.
pub trait FrameSource: Send + 'static {
    fn open(&mut self) -> Result<()>;

    fn read(&mut self) -> Result<Frame>;

    fn close(&mut self) {}

    /// `false` once the device is gone; the loop then backs off longer between reads.
    fn is_connected(&self) -> bool {
        true
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        None
    }
}

impl FrameSource for Box<dyn FrameSource> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn read(&mut self) -> Result<Frame> {
        (**self).read()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        (**self).resolution()
    }
}

/// Producer side of a [`SubmittedSource`].
#[derive(Clone)]
pub struct FrameSubmitter {
    tx: Sender<Frame>,
}

impl FrameSubmitter {
    /// Never blocks; a frame arriving while the queue is full is discarded.
    pub fn submit(&self, image: RgbImage) -> bool {
        match self.tx.try_send(Frame::new(image, Utc::now())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn submit_frame(&self, frame: Frame) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

/// Frames pushed in through a [`FrameSubmitter`].
pub struct SubmittedSource {
    id: String,
    rx: Receiver<Frame>,
    poll: Duration,
    resolution: Option<(u32, u32)>,
    connected: bool,
}

impl SubmittedSource {
    pub fn new(id: impl Into<String>, capacity: usize) -> (Self, FrameSubmitter) {
        let (tx, rx) = bounded(capacity.max(1));

        (
            Self {
                id: id.into(),
                rx,
                poll: Duration::from_millis(200),
                resolution: None,
                connected: true,
            },
            FrameSubmitter { tx },
        )
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }
}

impl FrameSource for SubmittedSource {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        match self.rx.recv_timeout(self.poll) {
            Ok(frame) => {
                self.resolution = Some(frame.dims());
                Ok(frame)
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::source_unavailable(&self.id, "no frame submitted"))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.connected = false;
                Err(Error::source_unavailable(&self.id, "all submitters dropped"))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        self.resolution
    }
}
