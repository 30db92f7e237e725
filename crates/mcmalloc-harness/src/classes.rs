//! Size-class table dumps.

use serde::{Deserialize, Serialize};

use mcmalloc_core::classifier::{LEARN_THRESHOLD, LEARNABLE_LIMIT, SAMPLE_STRIDE};
use mcmalloc_core::size_class::{self, MAX_REQUEST_SIZE, MIN_SIZE, NUM_BASE_CLASSES};
use mcmalloc_core::SizeClassifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRow {
    pub index: usize,
    pub size: usize,
    pub learned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTable {
    pub base: Vec<ClassRow>,
    pub learned: Vec<ClassRow>,
    /// Requested size and the class it lands in after learning.
    pub probes: Vec<(usize, usize)>,
}

impl ClassTable {
    /// Base classes up to the largest accepted request.
    pub fn base_only() -> Self {
        Self::learning(&[])
    }

    /// Teach a fresh classifier each of `sizes` often enough to learn it,
    /// in the given order, and dump the result.
    pub fn learning(sizes: &[usize]) -> Self {
        let classifier = SizeClassifier::boxed();
        for &size in sizes {
            for _ in 0..LEARN_THRESHOLD {
                classifier.observe(size);
            }
        }
        let base = (0..NUM_BASE_CLASSES)
            .map(|index| ClassRow {
                index,
                size: size_class::class_size(index),
                learned: false,
            })
            .filter(|row| row.size != 0 && row.size <= MAX_REQUEST_SIZE)
            .filter(|row| row.index >= size_class::class_of(1))
            .collect();
        let learned = classifier
            .learned_boundaries()
            .enumerate()
            .map(|(slot, size)| ClassRow {
                index: NUM_BASE_CLASSES + slot,
                size,
                learned: true,
            })
            .collect();
        let probes = sizes
            .iter()
            .map(|&size| (size, classifier.classify(size)))
            .collect();
        Self {
            base,
            learned,
            probes,
        }
    }

    /// Whether the classifier counts `size` at all.
    pub fn learnable(size: usize) -> bool {
        if size <= MIN_SIZE || size >= LEARNABLE_LIMIT || size.is_power_of_two() {
            return false;
        }
        let rounded = size.next_multiple_of(SAMPLE_STRIDE);
        rounded < LEARNABLE_LIMIT && !rounded.is_power_of_two()
    }
}
