//! Hello client - blocking calls from two threads, then a callback.
//!
//! ```text
//! cargo run --example hello_client -- tcp://127.0.0.1:8022
//! ```

use std::sync::mpsc;
use std::thread;

use korv::transport::Endpoint;
use korv::{BlockingClient, Verb};
use serde_json::json;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let endpoint: Endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:8022".to_string())
        .parse()?;
    let client = BlockingClient::connect(&endpoint)?;

    thread::scope(|scope| {
        scope.spawn(|| match client.get("/hello") {
            Ok(response) => println!("GET /hello -> {} {:?}", response.code, response.body),
            Err(e) => eprintln!("GET /hello failed: {e}"),
        });
        scope.spawn(|| match client.store("/greeting", json!({"name": "korv"})) {
            Ok(response) => println!("STORE /greeting -> {} {:?}", response.code, response.body),
            Err(e) => eprintln!("STORE /greeting failed: {e}"),
        });
    });

    let (tx, rx) = mpsc::channel();
    let id = client.call_with(Verb::Delete, "/missing", None, move |outcome| {
        let _ = tx.send(outcome);
    })?;
    match rx.recv()? {
        Ok(response) => println!("DELETE /missing ({id}) -> {}", response.code),
        Err(reason) => println!("DELETE /missing ({id}) abandoned: {reason}"),
    }

    client.close();
    Ok(())
}
