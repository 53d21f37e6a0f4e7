//! sqlguard - run read-only SQL through the guardrail engine.

mod cli;

use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use cli::{Cli, OutputFormat};
use serde_json::json;
use sql_guardrail::config::Config;
use sql_guardrail::db::ExecutionResult;
use sql_guardrail::engine::{CallerContext, GuardedEngine};
use sql_guardrail::error::ClassifiedError;
use sql_guardrail::logging;
use sql_guardrail::safety::{Guardrail, GuardrailPolicy, ValidationVerdict};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exit status for a query the engine refused or could not run.
const EXIT_CLASSIFIED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if cli.log_file {
        let path = config
            .logging
            .file
            .clone()
            .unwrap_or_else(logging::get_log_path);
        logging::init_file_logging(&path);
    } else {
        logging::init_stderr_logging();
    }

    match run(&cli, &config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Builds the configuration: file, then environment, then flags.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let config_path = cli.config_path();
    let mut config = Config::load_from_file(&config_path)?;
    config.apply_env_overrides()?;
    cli.apply_to(&mut config);
    config.validate()?;
    Ok(config)
}

async fn run(cli: &Cli, config: &Config) -> anyhow::Result<ExitCode> {
    let format = cli.parse_output_format().map_err(anyhow::Error::msg)?;
    let sql = read_sql(cli)?;

    if cli.validate_only {
        let policy = Arc::new(GuardrailPolicy::from_config(&config.guardrails));
        return Ok(match Guardrail::new(policy).validate(&sql) {
            ValidationVerdict::Accepted(stmt) => {
                match format {
                    OutputFormat::Json => println!(
                        "{}",
                        serde_json::to_string_pretty(&json!({
                            "sql": stmt.sql(),
                            "applied_limit": stmt.applied_limit(),
                        }))?
                    ),
                    OutputFormat::Text => println!("{}", stmt.sql()),
                }
                ExitCode::SUCCESS
            }
            ValidationVerdict::Rejected(reason) => {
                info!(%reason, "Statement rejected");
                print_error(&ClassifiedError::from(reason), format)?;
                ExitCode::from(EXIT_CLASSIFIED)
            }
        });
    }

    info!("Database: {}", config.database.display_string());
    let engine = GuardedEngine::start(config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let ctx = CallerContext::new()
        .with_request_id("cli")
        .with_cancellation(cancel);
    let outcome = engine.execute_guarded_query(&sql, &ctx).await;
    engine.shutdown().await;

    match outcome {
        Ok(result) => {
            print_result(&result, format)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_error(&e, format)?;
            Ok(ExitCode::from(EXIT_CLASSIFIED))
        }
    }
}

/// Takes SQL from the positional argument, or all of stdin.
fn read_sql(cli: &Cli) -> anyhow::Result<String> {
    if let Some(sql) = &cli.sql {
        return Ok(sql.clone());
    }
    let mut sql = String::new();
    std::io::stdin()
        .read_to_string(&mut sql)
        .context("Failed to read SQL from stdin")?;
    Ok(sql)
}

fn print_result(result: &ExecutionResult, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => {
            println!("{}", result.columns().join(" | "));
            for row in result.rows() {
                let cells: Vec<String> = row.iter().map(|v| v.to_display_string()).collect();
                println!("{}", cells.join(" | "));
            }
            println!(
                "({} rows, {} ms)",
                result.row_count(),
                result.execution_time().as_millis()
            );
        }
    }
    Ok(())
}

fn print_error(err: &ClassifiedError, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(err)?),
        OutputFormat::Text => eprintln!("{}: {}", err.kind(), err.message()),
    }
    Ok(())
}
