//! Hello server - two handlers on a TCP endpoint.
//!
//! ```text
//! cargo run --example hello_server -- tcp://127.0.0.1:8022
//! ```
//!
//! Then run `hello_client` against the same endpoint.

use korv::transport::{Endpoint, Listener};
use korv::{Reply, Request, Server, Verb};
use serde::Deserialize;
use serde_json::json;

/// Body accepted by `STORE /greeting`.
#[derive(Deserialize, Debug)]
struct Greeting {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let endpoint: Endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:8022".to_string())
        .parse()?;

    let server = Server::builder()
        .route(Verb::Get, "/hello", |_| Ok(Reply::ok(json!({"msg": "Hello World!"}))))
        .route(Verb::Get, "/echo", |request: &Request| {
            Ok(Reply::ok(json!({"msg": format!("{request:?}")})))
        })
        .route_typed(Verb::Store, "/greeting", |greeting: Greeting, _| {
            Ok(Reply::ok(json!({"msg": format!("Hello, {}!", greeting.name)})))
        })
        .build();

    let listener = Listener::bind(&endpoint).await?;
    server
        .serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
