//! Minimal embedded gateway: one known watch, a welcome command queued for
//! it, and a listener on an ephemeral port.
//!
//! Run with:
//!   cargo run --example gateway
//!
//! Then act as the watch from another terminal:
//!   cargo run --features cli -- send 127.0.0.1:<port> --device 8800000015 --wait

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use kidtracker::device::{
    Command, DeviceListener, MemoryStore, MessageHandler, Registry, RegistryConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    store.add_device("8800000015")?;

    let registry = Arc::new(Registry::new(
        store.clone(),
        store.clone(),
        RegistryConfig::default(),
    ));
    // Delivered as soon as the watch first connects.
    registry.send_or_apply("8800000015", &Command::new("UPLOAD", vec!["600".to_string()]))?;

    let listener = DeviceListener::bind(
        "127.0.0.1:0",
        Arc::new(MessageHandler::new(Arc::clone(&registry))),
    )?;
    eprintln!("Listening on {}", listener.local_addr());

    let running = AtomicBool::new(true);
    listener.run(&running);
    Ok(())
}
