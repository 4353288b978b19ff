//! Reassembly of notification chunks into frames.

use tracing::debug;

use super::profile::FamilyProfile;

/// Result of feeding one notification to a [`FrameAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// More chunks are needed. `first` is set when this chunk started a frame.
    Pending {
        /// Whether this chunk started a new frame.
        first: bool,
    },
    /// A whole frame, headers stripped.
    Complete(Vec<u8>),
    /// The chunk did not fit the expected sequence and was dropped.
    Ignored,
}

/// Collects the chunks of one frame in the order the profile prescribes.
///
/// A chunk with the size of a first chunk always starts a new frame, so a
/// lost notification costs at most one frame.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    sizes: &'static [usize],
    header_len: usize,
    marker: Option<u8>,
    buffer: Vec<u8>,
    next: usize,
    generation: u64,
}

impl FrameAssembler {
    /// Create an assembler for a profile's chunking.
    pub fn new(profile: &FamilyProfile) -> Self {
        Self {
            sizes: profile.chunk_sizes,
            header_len: profile.chunk_header_len,
            marker: profile.chunk_marker,
            buffer: Vec::with_capacity(profile.frame_len()),
            next: 0,
            generation: 0,
        }
    }

    /// Incremented every time a frame is started.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a partial frame is buffered.
    pub fn is_pending(&self) -> bool {
        self.next > 0
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next = 0;
    }

    /// Drop the partial frame if it is still the one started at `generation`.
    ///
    /// Returns `true` when something was dropped.
    pub fn expire(&mut self, generation: u64) -> bool {
        if self.generation == generation && self.is_pending() {
            debug!("Dropping stale partial frame ({} bytes)", self.buffer.len());
            self.reset();
            return true;
        }
        false
    }

    /// Feed one notification.
    pub fn push(&mut self, chunk: &[u8]) -> Assembly {
        let Some(&first_size) = self.sizes.first() else {
            return Assembly::Ignored;
        };

        let expected = self.sizes.get(self.next).copied();
        if expected != Some(chunk.len()) {
            if chunk.len() != first_size {
                debug!(
                    "Unexpected chunk of {} bytes (wanted {:?}), dropping frame",
                    chunk.len(),
                    expected
                );
                self.reset();
                return Assembly::Ignored;
            }
            // A first-sized chunk out of sequence starts over.
            self.reset();
        }

        if let Some(marker) = self.marker
            && chunk.first() != Some(&marker)
        {
            debug!("Chunk without data marker, dropping frame");
            self.reset();
            return Assembly::Ignored;
        }

        let first = self.next == 0;
        if first {
            self.generation = self.generation.wrapping_add(1);
        }
        self.buffer
            .extend_from_slice(chunk.get(self.header_len..).unwrap_or_default());
        self.next += 1;

        if self.next == self.sizes.len() {
            let frame = std::mem::take(&mut self.buffer);
            self.next = 0;
            return Assembly::Complete(frame);
        }
        Assembly::Pending { first }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(sizes: &[usize], fill: u8) -> Vec<Vec<u8>> {
        sizes.iter().map(|&n| vec![fill; n]).collect()
    }

    #[test]
    fn test_libre2_frame() {
        let mut assembler = FrameAssembler::new(&FamilyProfile::libre2_direct());
        let parts = chunks(&[20, 18, 8], 0xAB);

        assert_eq!(assembler.push(&parts[0]), Assembly::Pending { first: true });
        assert_eq!(assembler.generation(), 1);
        assert_eq!(assembler.push(&parts[1]), Assembly::Pending { first: false });
        match assembler.push(&parts[2]) {
            Assembly::Complete(frame) => assert_eq!(frame, vec![0xAB; 46]),
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(!assembler.is_pending());
    }

    #[test]
    fn test_first_sized_chunk_restarts() {
        let mut assembler = FrameAssembler::new(&FamilyProfile::libre2_direct());
        assembler.push(&[1u8; 20]);
        assert_eq!(assembler.push(&[2u8; 20]), Assembly::Pending { first: true });
        assert_eq!(assembler.generation(), 2);
        assembler.push(&[2u8; 18]);
        match assembler.push(&[2u8; 8]) {
            Assembly::Complete(frame) => assert!(frame.iter().all(|&b| b == 2)),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_sequence_chunk_is_dropped() {
        let mut assembler = FrameAssembler::new(&FamilyProfile::libre2_direct());
        assert_eq!(assembler.push(&[0u8; 8]), Assembly::Ignored);
        assembler.push(&[0u8; 20]);
        assert_eq!(assembler.push(&[0u8; 8]), Assembly::Ignored);
        assert!(!assembler.is_pending());
        assert_eq!(assembler.push(&[0u8; 5]), Assembly::Ignored);
    }

    #[test]
    fn test_transmitter_frame_strips_headers() {
        let profile = FamilyProfile::transmitter();
        let mut assembler = FrameAssembler::new(&profile);
        let mut result = Assembly::Ignored;
        for (index, &size) in profile.chunk_sizes.iter().enumerate() {
            let mut chunk = vec![index as u8; size];
            chunk[..4].copy_from_slice(&[0x82, index as u8, 0, 0]);
            result = assembler.push(&chunk);
        }
        match result {
            Assembly::Complete(frame) => {
                assert_eq!(frame.len(), 344);
                assert_eq!(frame[0], 0);
                assert_eq!(frame[16], 1);
                assert_eq!(frame[343], 21);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_transmitter_rejects_missing_marker() {
        let mut assembler = FrameAssembler::new(&FamilyProfile::transmitter());
        assert_eq!(assembler.push(&[0x00; 20]), Assembly::Ignored);
    }

    #[test]
    fn test_expire_only_current_generation() {
        let mut assembler = FrameAssembler::new(&FamilyProfile::libre2_direct());
        assembler.push(&[0u8; 20]);
        let stale = assembler.generation();
        assembler.push(&[0u8; 20]);
        assert!(!assembler.expire(stale));
        assert!(assembler.is_pending());
        assert!(assembler.expire(assembler.generation()));
        assert!(!assembler.is_pending());
    }
}
