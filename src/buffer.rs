/// Staging area for one notification's worth of interleaved samples of a
/// single task.
///
/// The storage is allocated once and refilled in place. Slots beyond the
/// frames returned by the latest read still hold the values of earlier
/// reads (zero before the first one).
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    data: Vec<f64>,
    channels: usize,
    frames: usize,
}

impl SampleBuffer {
    pub fn new(frames_per_channel: usize, channels: usize) -> Self {
        SampleBuffer {
            data: vec![0.0; frames_per_channel * channels],
            channels,
            frames: 0,
        }
    }

    /// Capacity in frames.
    pub fn capacity(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames delivered by the latest read.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Channel values of frame slot `index`, or `None` past the capacity.
    pub fn frame(&self, index: usize) -> Option<&[f64]> {
        let start = index.checked_mul(self.channels)?;
        self.data.get(start..start + self.channels)
    }

    /// Raw storage handed to the driver for a read.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub(crate) fn set_frames(&mut self, frames: usize) {
        self.frames = frames.min(self.capacity());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_channel_wide() {
        let mut buf = SampleBuffer::new(3, 2);
        assert_eq!(buf.capacity(), 3);
        buf.as_mut_slice().copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        buf.set_frames(3);

        assert_eq!(buf.frame(0), Some(&[1.0, 2.0][..]));
        assert_eq!(buf.frame(2), Some(&[5.0, 6.0][..]));
        assert_eq!(buf.frame(3), None);
    }

    #[test]
    fn short_read_keeps_stale_slots() {
        let mut buf = SampleBuffer::new(2, 1);
        buf.as_mut_slice().copy_from_slice(&[7.0, 8.0]);
        buf.set_frames(2);

        buf.as_mut_slice()[0] = 9.0;
        buf.set_frames(1);

        assert_eq!(buf.frames(), 1);
        assert_eq!(buf.frame(1), Some(&[8.0][..]));
    }

    #[test]
    fn frame_count_is_capped() {
        let mut buf = SampleBuffer::new(4, 8);
        buf.set_frames(10);
        assert_eq!(buf.frames(), 4);
    }
}
