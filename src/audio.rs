//! Microphone level estimation and the capture handoff slot.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// Capacity of one capture block, in samples.
pub const SAMPLE_CAPACITY: usize = 256;
pub const BYTES_PER_SAMPLE: usize = 2;
pub const MAX_DECIBELS: f32 = 120.0;

/// Root-mean-square of a block, accumulated in 64 bits.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: i64 = samples
        .iter()
        .map(|&sample| i64::from(sample) * i64::from(sample))
        .sum();

    (sum as f64 / samples.len() as f64).sqrt() as f32
}

/// Maps an RMS amplitude to decibels in `[0, MAX_DECIBELS]`.
pub fn decibels(rms: f32) -> f32 {
    let level = if rms.is_nan() { 1.0 } else { rms.max(1.0) };
    (20.0 * level.log10()).clamp(0.0, MAX_DECIBELS)
}

pub fn sound_level(samples: &[i16]) -> f32 {
    decibels(rms(samples))
}

#[derive(Debug)]
struct AudioSampleBlock {
    samples: [i16; SAMPLE_CAPACITY],
    len: usize,
}

/// Single-slot handoff between the capture thread and the control loop.
///
/// The producer only writes while the slot is empty; blocks arriving while
/// the previous one is still unread are dropped. The consumer clears the
/// slot once it has finished with the block.
#[derive(Debug)]
pub struct SampleSlot {
    full: AtomicBool,
    block: Mutex<AudioSampleBlock>,
    dropped: AtomicU64,
}

impl SampleSlot {
    pub fn new() -> SampleSlot {
        SampleSlot {
            full: AtomicBool::new(false),
            block: Mutex::new(AudioSampleBlock {
                samples: [0; SAMPLE_CAPACITY],
                len: 0,
            }),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publishes up to `SAMPLE_CAPACITY` samples. Returns false when the
    /// block was dropped because the slot was still occupied.
    pub fn publish(&self, samples: &[i16]) -> bool {
        if samples.is_empty() {
            return false;
        }
        if self.full.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let len = samples.len().min(SAMPLE_CAPACITY);
        {
            let mut block = self.block.lock().unwrap_or_else(PoisonError::into_inner);
            block.samples[..len].copy_from_slice(&samples[..len]);
            block.len = len;
        }
        self.full.store(true, Ordering::Release);
        true
    }

    /// Runs `f` over the pending block, then frees the slot.
    pub fn consume<R>(&self, f: impl FnOnce(&[i16]) -> R) -> Option<R> {
        if !self.full.load(Ordering::Acquire) {
            return None;
        }

        let result = {
            let block = self.block.lock().unwrap_or_else(PoisonError::into_inner);
            f(&block.samples[..block.len])
        };
        self.full.store(false, Ordering::Release);
        Some(result)
    }

    #[cfg(test)]
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for SampleSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads signed 16-bit little-endian PCM in `SAMPLE_CAPACITY` blocks and
/// publishes each block into `slot` until the source ends.
pub fn spawn_capture<R>(mut source: R, slot: Arc<SampleSlot>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut bytes = [0u8; SAMPLE_CAPACITY * BYTES_PER_SAMPLE];
        let mut samples = [0i16; SAMPLE_CAPACITY];

        loop {
            match source.read_exact(&mut bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    log::info!(
                        "Audio capture source ended, {} blocks dropped",
                        slot.dropped()
                    );
                    return;
                }
                Err(e) => {
                    log::error!("Failed to read audio samples: {e}");
                    return;
                }
            }

            for (sample, chunk) in samples
                .iter_mut()
                .zip(bytes.chunks_exact(BYTES_PER_SAMPLE))
            {
                *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            }

            slot.publish(&samples);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn alternating(amplitude: i16, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn test_alternating_block_is_sixty_decibels() {
        let block = alternating(1000, SAMPLE_CAPACITY);
        assert!((rms(&block) - 1000.0).abs() < 1e-3);
        assert!((sound_level(&block) - 60.0).abs() < 1e-3);
    }

    #[test]
    fn test_silence_floors_to_zero() {
        assert_eq!(sound_level(&[0; 16]), 0.0);
        assert_eq!(decibels(0.0), 0.0);
        assert_eq!(decibels(-5.0), 0.0);
    }

    #[test]
    fn test_full_scale_does_not_overflow() {
        let block = [i16::MIN; SAMPLE_CAPACITY];
        let db = sound_level(&block);
        assert!(db > 90.0 && db <= MAX_DECIBELS);
    }

    #[test]
    fn test_level_is_bounded_and_monotonic() {
        let mut previous = 0.0;
        for amplitude in (0..=i16::MAX).step_by(97) {
            let db = sound_level(&alternating(amplitude, 64));
            assert!((0.0..=MAX_DECIBELS).contains(&db));
            assert!(db >= previous);
            previous = db;
        }
        assert_eq!(decibels(1.0e9), MAX_DECIBELS);
    }

    #[test]
    fn test_slot_drops_while_full() {
        let slot = SampleSlot::new();
        assert!(slot.publish(&[1, 2, 3]));
        assert!(!slot.publish(&[4, 5, 6]));
        assert_eq!(slot.dropped(), 1);

        let seen = slot.consume(|samples| samples.to_vec());
        assert_eq!(seen, Some(vec![1, 2, 3]));
        assert!(!slot.is_full());
        assert_eq!(slot.consume(|samples| samples.len()), None);

        assert!(slot.publish(&[7]));
        assert_eq!(slot.consume(|samples| samples.to_vec()), Some(vec![7]));
    }

    #[test]
    fn test_slot_truncates_to_capacity() {
        let slot = SampleSlot::new();
        assert!(slot.publish(&[1; SAMPLE_CAPACITY + 10]));
        assert_eq!(slot.consume(|samples| samples.len()), Some(SAMPLE_CAPACITY));
    }

    #[test]
    fn test_capture_publishes_first_block() {
        let mut pcm = Vec::new();
        for sample in alternating(1000, SAMPLE_CAPACITY * 3) {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }

        let slot = Arc::new(SampleSlot::new());
        spawn_capture(Cursor::new(pcm), slot.clone())
            .join()
            .unwrap();

        assert_eq!(slot.dropped(), 2);
        let db = slot.consume(sound_level).unwrap();
        assert!((db - 60.0).abs() < 1e-3);
    }
}
