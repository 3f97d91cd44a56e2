//! Decoded video frames and the single-slot handoff from the pipe reader.
//!
//! The reader task stores each complete frame in a watch slot tagged with a
//! [`FrameId`]. Consumers go through a [`FrameReader`], which hands out a
//! frame only if it is newer than the last one that reader returned, so a
//! dead stream can never look like a frozen but playing one.

use crate::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// Byte order of the three color channels handed to consumers.
///
/// The receiver always decodes to BGR; any other order is a per-camera fixup
/// applied when a frame is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChannelOrder {
    #[default]
    Bgr,
    Rgb,
    Brg,
    Rbg,
    Gbr,
    Grb,
}

impl ChannelOrder {
    pub const ALL: [ChannelOrder; 6] = [
        ChannelOrder::Bgr,
        ChannelOrder::Rgb,
        ChannelOrder::Brg,
        ChannelOrder::Rbg,
        ChannelOrder::Gbr,
        ChannelOrder::Grb,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelOrder::Bgr => "BGR",
            ChannelOrder::Rgb => "RGB",
            ChannelOrder::Brg => "BRG",
            ChannelOrder::Rbg => "RBG",
            ChannelOrder::Gbr => "GBR",
            ChannelOrder::Grb => "GRB",
        }
    }

    /// Output channel `k` takes source (BGR) channel `perm[k]`.
    fn permutation(self) -> Option<[usize; 3]> {
        match self {
            ChannelOrder::Bgr => None,
            ChannelOrder::Rgb => Some([2, 1, 0]),
            ChannelOrder::Brg => Some([0, 2, 1]),
            ChannelOrder::Rbg => Some([2, 0, 1]),
            ChannelOrder::Gbr => Some([1, 0, 2]),
            ChannelOrder::Grb => Some([1, 2, 0]),
        }
    }

    /// Reorder packed BGR pixels. BGR input is returned without copying.
    pub fn apply(self, bgr: &Arc<[u8]>) -> Arc<[u8]> {
        let Some(perm) = self.permutation() else {
            return Arc::clone(bgr);
        };
        let mut out = Vec::with_capacity(bgr.len());
        for pixel in bgr.chunks_exact(3) {
            out.extend_from_slice(&[pixel[perm[0]], pixel[perm[1]], pixel[perm[2]]]);
        }
        Arc::from(out)
    }
}

impl fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelOrder {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        ChannelOrder::ALL
            .into_iter()
            .find(|order| order.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LinkError::config(format!("unknown channel order '{s}', expected one of BGR RGB BRG RBG GBR GRB")))
    }
}

impl TryFrom<String> for ChannelOrder {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ChannelOrder> for String {
    fn from(order: ChannelOrder) -> Self {
        order.as_str().to_string()
    }
}

/// Size of the decoded image; every frame on the pipe is exactly `byte_len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Position of a frame in a session: receiver restarts bump `epoch` and restart `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId {
    pub epoch: u64,
    pub seq: u64,
}

/// One decoded image.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub id: FrameId,
    pub received_at: Instant,
    pub geometry: FrameGeometry,
    pub data: Arc<[u8]>,
}

/// Writer side of the latest-frame slot for one receiver run.
#[derive(Debug)]
pub struct FrameSink {
    slot: watch::Sender<Option<VideoFrame>>,
    geometry: FrameGeometry,
    epoch: u64,
    next_seq: u64,
}

impl FrameSink {
    pub fn new(slot: watch::Sender<Option<VideoFrame>>, geometry: FrameGeometry, epoch: u64) -> Self {
        Self { slot, geometry, epoch, next_seq: 1 }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Replace the slot contents with a new frame.
    pub fn push(&mut self, data: Vec<u8>) -> FrameId {
        let id = FrameId { epoch: self.epoch, seq: self.next_seq };
        self.next_seq += 1;
        let frame = VideoFrame { id, received_at: Instant::now(), geometry: self.geometry, data: Arc::from(data) };
        self.slot.send_replace(Some(frame));
        id
    }
}

/// Consumer handle with its own freshness cursor.
#[derive(Debug, Clone)]
pub struct FrameReader {
    slot: watch::Receiver<Option<VideoFrame>>,
    last: Option<FrameId>,
    order: ChannelOrder,
}

impl FrameReader {
    pub fn new(slot: watch::Receiver<Option<VideoFrame>>, order: ChannelOrder) -> Self {
        Self { slot, last: None, order }
    }

    /// The newest frame if this reader has not returned it yet.
    pub fn read_frame(&mut self) -> Option<VideoFrame> {
        let frame = self.slot.borrow_and_update().clone()?;
        if self.last.is_some_and(|last| frame.id <= last) {
            return None;
        }
        self.last = Some(frame.id);
        let data = self.order.apply(&frame.data);
        Some(VideoFrame { data, ..frame })
    }

    /// Wait until a frame this reader has not seen is stored.
    pub async fn changed(&mut self) -> Result<()> {
        self.slot
            .changed()
            .await
            .map_err(|_| LinkError::Shutdown { component: "video session" })
    }

    /// Arrival time of the newest stored frame, read or not.
    pub fn last_arrival(&self) -> Option<Instant> {
        self.slot.borrow().as_ref().map(|frame| frame.received_at)
    }

    pub fn channel_order(&self) -> ChannelOrder {
        self.order
    }

    /// Change the channel order without restarting the receiver.
    pub fn set_channel_order(&mut self, order: ChannelOrder) {
        self.order = order;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> (FrameSink, FrameReader) {
        let (tx, rx) = watch::channel(None);
        (FrameSink::new(tx, FrameGeometry::new(1, 1), 1), FrameReader::new(rx, ChannelOrder::Bgr))
    }

    #[tokio::test(start_paused = true)]
    async fn read_frame_returns_each_frame_once() {
        let (mut sink, mut reader) = slot();
        assert!(reader.read_frame().is_none());

        sink.push(vec![1, 2, 3]);
        assert_eq!(&*reader.read_frame().unwrap().data, &[1, 2, 3]);
        assert!(reader.read_frame().is_none());
        assert!(reader.read_frame().is_none());

        sink.push(vec![4, 5, 6]);
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.id, FrameId { epoch: 1, seq: 2 });
        assert!(reader.read_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn readers_have_independent_cursors() {
        let (mut sink, mut first) = slot();
        let mut second = first.clone();
        sink.push(vec![0; 3]);
        assert!(first.read_frame().is_some());
        assert!(second.read_frame().is_some());
        assert!(first.read_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn new_epoch_is_fresh_even_with_lower_seq() {
        let (tx, rx) = watch::channel(None);
        let mut reader = FrameReader::new(rx, ChannelOrder::Bgr);
        let mut old = FrameSink::new(tx.clone(), FrameGeometry::new(1, 1), 1);
        for _ in 0..5 {
            old.push(vec![0; 3]);
        }
        assert!(reader.read_frame().is_some());

        let mut restarted = FrameSink::new(tx, FrameGeometry::new(1, 1), 2);
        restarted.push(vec![9; 3]);
        assert_eq!(reader.read_frame().unwrap().id, FrameId { epoch: 2, seq: 1 });
    }

    #[test]
    fn channel_orders_permute_bgr_pixels() {
        let bgr: Arc<[u8]> = Arc::from(vec![b'B', b'G', b'R', b'b', b'g', b'r']);
        let expect = [
            (ChannelOrder::Bgr, b"BGRbgr"),
            (ChannelOrder::Rgb, b"RGBrgb"),
            (ChannelOrder::Brg, b"BRGbrg"),
            (ChannelOrder::Rbg, b"RBGrbg"),
            (ChannelOrder::Gbr, b"GBRgbr"),
            (ChannelOrder::Grb, b"GRBgrb"),
        ];
        for (order, want) in expect {
            assert_eq!(&*order.apply(&bgr), want, "{order}");
        }
        assert!(Arc::ptr_eq(&ChannelOrder::Bgr.apply(&bgr), &bgr));
    }

    #[test]
    fn channel_order_parses_case_insensitively() {
        assert_eq!("grb".parse::<ChannelOrder>().unwrap(), ChannelOrder::Grb);
        assert!(matches!("XYZ".parse::<ChannelOrder>(), Err(LinkError::Config { .. })));
        assert_eq!(FrameGeometry::new(1280, 720).byte_len(), 1280 * 720 * 3);
    }
}
