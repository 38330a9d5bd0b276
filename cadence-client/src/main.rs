//! CADENCE prefetch entry point.
//!
//! Prefetches a page's queries against the configured graph API and prints
//! the snapshot payload a server would embed in the rendered page.
//!
//! ```text
//! cadence-prefetch --config cadence.toml --role listener \
//!     --query 'track={"id":"42"}' --query catalog='{"page":1}'
//! ```

use cadence_client::config::ClientConfig;
use cadence_client::error::{ClientError, ClientResult};
use cadence_client::graph::HttpTransport;
use cadence_client::guard::{CatalogGuard, Role};
use cadence_client::render::prefetch_page;
use cadence_client::session::Session;
use cadence_client::telemetry::init_tracing;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug)]
struct PrefetchArgs {
    role: Role,
    queries: Vec<(String, Value)>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> ClientResult<PrefetchArgs> {
    let mut role = None;
    let mut queries = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            // Consumed by ClientConfig::load.
            "--config" => {
                args.next();
            }
            "--role" => {
                let value = args
                    .next()
                    .ok_or_else(|| ClientError::Usage("--role needs a value".to_string()))?;
                role = Some(value.parse::<Role>().map_err(ClientError::Usage)?);
            }
            "--query" => {
                let value = args
                    .next()
                    .ok_or_else(|| ClientError::Usage("--query needs a value".to_string()))?;
                queries.push(parse_query(&value)?);
            }
            other => return Err(ClientError::Usage(format!("unexpected argument '{other}'"))),
        }
    }
    let role = role.ok_or_else(|| ClientError::Usage("--role is required".to_string()))?;
    if queries.is_empty() {
        return Err(ClientError::Usage("at least one --query is required".to_string()));
    }
    Ok(PrefetchArgs { role, queries })
}

/// `name` or `name=<json variables>`.
fn parse_query(raw: &str) -> ClientResult<(String, Value)> {
    match raw.split_once('=') {
        None => Ok((raw.to_string(), Value::Null)),
        Some((name, variables)) => {
            let variables = serde_json::from_str(variables).map_err(|e| {
                ClientError::Usage(format!("variables for '{name}' are not JSON: {e}"))
            })?;
            Ok((name.to_string(), variables))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    let config = ClientConfig::load()?;
    init_tracing(&config.logging)?;
    let args = parse_args(std::env::args().skip(1))?;

    let transport = Arc::new(HttpTransport::new(&config)?);
    let session = Session::new(&config, transport)?;
    let guard = CatalogGuard::new(Arc::clone(session.catalog()));

    let queries = args
        .queries
        .into_iter()
        .map(|(name, variables)| session.page_query::<Value>(&name, variables))
        .collect::<ClientResult<Vec<_>>>()?;

    let page = prefetch_page(session.executor(), &guard, args.role, queries).await?;
    for (key, err) in &page.failed {
        eprintln!("failed: {key}: {err}");
    }
    println!("{}", page.payload);
    Ok(())
}
