//! Allocation tracing through the global verbosity level.

use log::{Level, LevelFilter, Log, Metadata, Record};
use mmap_alloc::{set_verbosity, verbosity, MappingAllocator};
use std::sync::Mutex;

struct Capture(Mutex<Vec<String>>);

impl Log for Capture {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            self.0.lock().expect("capture lock").push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture(Mutex::new(Vec::new()));

#[test]
fn trace_lines_follow_the_verbosity_level() {
    log::set_logger(&CAPTURE).expect("install logger");
    log::set_max_level(LevelFilter::Info);

    set_verbosity(0);
    let mut alloc = MappingAllocator::<u32>::heap();
    let ptr = alloc.allocate(4).expect("allocate");
    alloc.deallocate(ptr, 4).expect("deallocate");
    assert!(CAPTURE.0.lock().expect("capture lock").is_empty());

    set_verbosity(1);
    assert_eq!(verbosity(), 1);
    let ptr = alloc.allocate(4).expect("allocate");
    alloc.deallocate(ptr, 4).expect("deallocate");
    set_verbosity(0);

    let lines = CAPTURE.0.lock().expect("capture lock").clone();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "Alloc 16 bytes.");
    assert!(lines[1].starts_with("pointer = 0x"));
    assert!(lines[2].starts_with("Dealloc 16 bytes (0x"));
}
