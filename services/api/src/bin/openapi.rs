//! services/api/src/bin/openapi.rs
//!
//! Writes the story API's OpenAPI document to disk. The output path is the
//! first argument, `openapi.json` when omitted.

use api_lib::web::rest::ApiDoc;
use std::path::PathBuf;
use utoipa::OpenApi;

const DEFAULT_OUTPUT: &str = "openapi.json";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));

    let doc = ApiDoc::openapi();
    let routes: Vec<&String> = doc.paths.paths.keys().collect();
    std::fs::write(&output, doc.to_pretty_json()?)?;
    println!(
        "Wrote {} story API routes to {}",
        routes.len(),
        output.display()
    );
    for route in routes {
        println!("  {}", route);
    }
    Ok(())
}
