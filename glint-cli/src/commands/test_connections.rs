//! `glint test-connections` - Check reachability of MongoDB and PostgreSQL.

use std::sync::Arc;
use std::time::Duration;

use glint_migrate::{ConnectionTestOptions, ConnectionTestService, StoreCheck};
use glint_postgres::PgTarget;

use crate::cli::{MongoArgs, TestConnectionsArgs};
use crate::commands::{self, Outcome};
use crate::error::{CliError, CliResult};
use crate::output::{self, success};

/// Run the test-connections command
pub async fn run(args: TestConnectionsArgs, verbose: bool) -> CliResult<Outcome> {
    output::header("Test Connections");

    let mut service = ConnectionTestService::new();
    let mut pool = None;

    match (args.mongo_connection, args.mongo_database) {
        (Some(mongo_connection), Some(mongo_database)) => {
            let mongo = MongoArgs {
                mongo_connection,
                mongo_database,
            };
            service = service.source(commands::connect_source(&mongo).await?);
        }
        (Some(_), None) => {
            return Err(CliError::Config(
                "--mongo-database is required with --mongo-connection".to_string(),
            ));
        }
        _ => {}
    }

    if let Some(url) = &args.postgres_connection {
        let created = commands::connect_pool(url, 1, 1)?;
        service = service.target(Arc::new(PgTarget::new(created.clone())));
        pool = Some(created);
    }

    let options = ConnectionTestOptions::new()
        .timeout(Duration::from_secs(args.timeout))
        .verbose(verbose);
    let result = service.test_connections(&options).await;
    if let Some(pool) = pool {
        pool.close();
    }

    if result.source.is_none() && result.target.is_none() {
        return Err(CliError::Config(
            "nothing to test: pass --mongo-connection/--mongo-database and/or --postgres-connection"
                .to_string(),
        ));
    }

    for check in result.source.iter().chain(result.target.iter()) {
        print_check(check, verbose);
    }

    output::newline();
    if result.is_success() {
        success("All connections succeeded");
        Ok(Outcome::Success)
    } else {
        output::error("One or more connections failed");
        Ok(Outcome::Failure)
    }
}

/// Print one store check.
pub fn print_check(check: &StoreCheck, verbose: bool) {
    let mut line = format!(
        "{} ({})",
        check.store,
        output::format_duration(check.latency)
    );
    if let Some(server) = &check.server {
        line.push_str(&format!(" - {} {}", server.product, server.version));
    }
    output::check_item(check.is_reachable, &line);

    if let Some(error) = &check.error_message {
        output::dim(&format!("      {}", error));
    }
    if verbose {
        if let Some(count) = check.object_count {
            output::kv("    objects", &count.to_string());
        }
    }
}
