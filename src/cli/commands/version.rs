//! Version command implementation.

use crate::error::Result;
use crate::storage::Migrator;
use serde::Serialize;

#[derive(Serialize)]
struct VersionOutput<'a> {
    version: &'a str,
    build: &'a str,
    schema_version: u32,
}

/// Execute the version command.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(json: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let build = if cfg!(debug_assertions) {
        "dev"
    } else {
        "release"
    };
    let schema_version = Migrator::builtin().latest_version();

    if json {
        let output = VersionOutput {
            version,
            build,
            schema_version,
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("ctxhub version {version} ({build}), schema v{schema_version}");
    Ok(())
}
