use crate::frame::Frame;
use std::collections::{HashMap, VecDeque};

/// Orders outbound frames for the writer.
///
/// Control frames (SYN, NOP, UPD) are served first. PSH and FIN frames sit in
/// one FIFO per stream, and the streams with pending frames take turns one
/// frame at a time, so a FIN never overtakes data of its own stream and one
/// busy stream cannot starve the others.
#[derive(Debug, Default)]
pub(crate) struct Shaper {
    control: VecDeque<Frame>,
    streams: HashMap<u32, VecDeque<Frame>>,
    /// Round-robin order of stream IDs that have queued frames.
    ready: VecDeque<u32>,
    len: usize,
}

impl Shaper {
    pub(crate) fn push(&mut self, frame: Frame) {
        self.len += 1;
        if frame.cmd.is_control() {
            self.control.push_back(frame);
            return;
        }

        let stream_id = frame.stream_id;
        let queue = self.streams.entry(stream_id).or_default();
        if queue.is_empty() {
            self.ready.push_back(stream_id);
        }
        queue.push_back(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        if let Some(frame) = self.control.pop_front() {
            self.len -= 1;
            return Some(frame);
        }

        let stream_id = self.ready.pop_front()?;
        let queue = self.streams.get_mut(&stream_id)?;
        let frame = queue.pop_front();
        if queue.is_empty() {
            self.streams.remove(&stream_id);
        } else {
            self.ready.push_back(stream_id);
        }

        if frame.is_some() {
            self.len -= 1;
        }
        frame
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}
