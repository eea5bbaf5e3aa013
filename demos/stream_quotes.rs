use std::time::Duration;

use ticker_feed_sdk::constants::DEFAULT_REFRESH_INTERVAL_MS;
use ticker_feed_sdk::BinanceFeed;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Binance Quote Stream Example");
    println!("============================");

    // Track a couple of USDT pairs at the default refresh cadence.
    let refresh = Duration::from_millis(DEFAULT_REFRESH_INTERVAL_MS);
    let feed = BinanceFeed::new(&["BTC", "ETH"], refresh)?;
    let mut updates = feed.subscribe();

    println!("Waiting for streaming updates...");

    // Watch loop
    for _ in 0..10 {
        let snapshot = updates.recv().await?;

        println!("\n{:-<40}", "");
        let mut symbols: Vec<_> = snapshot.keys().collect();
        symbols.sort();
        for symbol in symbols {
            match &snapshot[symbol] {
                Some(tick) => println!("{:<10} {}", symbol.to_uppercase(), tick.close),
                None => println!("{:<10} waiting...", symbol.to_uppercase()),
            }
        }
    }

    feed.destroy();
    Ok(())
}
