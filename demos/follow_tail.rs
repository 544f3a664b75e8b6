//! Follow tail: replay a ledger's history, then keep receiving new records.
//!
//! A background writer adds a system event every 100ms. The main thread
//! tails the ledger with `follow = true` and stops after ten events.

use eventledger::{CancelToken, LedgerOptions, LedgerRegistry, StreamReader, Strategy};
use serde_json::{Value, json};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let registry = Arc::new(
        LedgerRegistry::builder(dir.path())
            .ledger::<Value>("system", LedgerOptions::new(Strategy::Memory))
            .open()?,
    );
    let system = registry.ledger::<Value>("system").ok_or("system ledger missing")?;

    system.write_now(json!({"event": "boot"}))?;
    system.write_now(json!({"event": "config_loaded"}))?;

    let writer = {
        let system = Arc::clone(&system);
        thread::spawn(move || {
            for i in 0..8 {
                thread::sleep(Duration::from_millis(100));
                if let Err(e) = system.write_now(json!({"event": "heartbeat", "n": i})) {
                    eprintln!("[writer] {e}");
                    return;
                }
            }
        })
    };

    let reader = StreamReader::new(Arc::clone(&registry));
    let cancel = CancelToken::new();
    let mut seen = 0;
    reader.tail::<Value>("system", true, &cancel, |record| {
        println!(
            "[tail] #{} {}",
            record.sequence_id().unwrap_or_default(),
            record.payload()
        );
        seen += 1;
        seen < 10
    })?;

    writer.join().map_err(|_| "writer thread panicked")?;
    println!("\nDone, {seen} events via follow tail.");
    registry.close()?;
    Ok(())
}
