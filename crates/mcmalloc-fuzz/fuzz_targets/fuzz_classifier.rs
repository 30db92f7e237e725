#![no_main]
use libfuzzer_sys::fuzz_target;

use mcmalloc_core::SizeClassifier;
use mcmalloc_core::size_class::{MAX_REQUEST_SIZE, NUM_SIZE_CLASSES};

fuzz_target!(|data: &[u8]| {
    let classifier = SizeClassifier::boxed();

    for chunk in data.chunks_exact(4) {
        let size = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
        let size = size.min(MAX_REQUEST_SIZE);

        // A request never lands in a class smaller than itself.
        let class = classifier.observe(size).class;
        assert!(class < NUM_SIZE_CLASSES);
        assert!(classifier.class_size(class) >= size.max(1));
        assert_eq!(classifier.classify(size), class);
    }

    let boundaries: Vec<_> = classifier.learned_boundaries().collect();
    assert_eq!(boundaries.len(), classifier.learned_count());
});
