//! Price ticks: record market data, restart, and pick up where we left off.
//!
//! Opens a registry with a write-behind price ledger (25 hour retention) and
//! a disk-only trade ledger, writes a burst of ticks, closes, reopens and
//! shows that the sequence continues and the history is still there.

use chrono::{Duration, Utc};
use eventledger::{LedgerConfig, LedgerOptions, LedgerRegistry, Strategy, retain_newer_than};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Trade {
    symbol: String,
    qty: i64,
    price: f64,
}

fn open(dir: &std::path::Path) -> eventledger::Result<LedgerRegistry> {
    LedgerRegistry::builder(dir)
        .config(LedgerConfig {
            auto_flush: false,
            flush_interval_writes: 100,
            ..LedgerConfig::default()
        })
        .ledger::<Value>(
            "price_update",
            LedgerOptions::new(Strategy::WriteBehind).retention(retain_newer_than(Duration::hours(25))),
        )
        .ledger::<Trade>("trade_placed", LedgerOptions::new(Strategy::Disk))
        .open()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    {
        let registry = open(dir.path())?;
        let prices = registry
            .ledger::<Value>("price_update")
            .ok_or("price ledger missing")?;
        let trades = registry
            .ledger::<Trade>("trade_placed")
            .ok_or("trade ledger missing")?;

        for i in 0..1_000 {
            let px = 100.0 + (i % 40) as f64 * 0.25;
            prices.write_now(json!({"symbol": "ABC", "price": px, "volume": i}))?;
            if i % 250 == 0 {
                let id = trades.write_now(Trade {
                    symbol: "ABC".into(),
                    qty: 10,
                    price: px,
                })?;
                println!("[trade] #{id} at {px}");
            }
        }

        // Old ticks are kept on disk but not loaded back into memory.
        prices.write(
            json!({"symbol": "ABC", "price": 90.0, "volume": 0}),
            Utc::now() - Duration::hours(48),
        )?;

        println!("{}", serde_json::to_string_pretty(&registry.health_check())?);
        registry.close()?;
    }

    let registry = open(dir.path())?;
    let prices = registry
        .ledger::<Value>("price_update")
        .ok_or("price ledger missing")?;
    println!(
        "\nreopened: sequence {} with {} ticks in memory",
        prices.sequence(),
        prices.size()?
    );
    for record in prices.latest_n(3)? {
        println!(
            "  #{:?} {} price={}",
            record.sequence_id(),
            record.timestamp(),
            record.payload()["price"]
        );
    }

    let next = prices.write_now(json!({"symbol": "ABC", "price": 101.0, "volume": 1}))?;
    println!("next tick gets id {next}");
    registry.close()?;
    Ok(())
}
