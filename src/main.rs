//! Scenario Sandbox CLI
//!
//! Loads fixtures into a fresh sandbox, runs one command there and removes
//! the sandbox again.

use std::path::Path;

use scenario_sandbox::{
    require_distributable, Fixture, Sandbox, SandboxConfig, Validate, DEFAULT_DISTRIBUTABLE,
};

const ENV_DISTRIBUTABLE: &str = "SANDBOX_DISTRIBUTABLE";

/// `SANDBOX_DISTRIBUTABLE` value that skips the artifact check.
const SKIP_DISTRIBUTABLE: &str = "none";

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(separator) = args.iter().position(|a| a == "--") else {
        usage(&args[0]);
    };
    let fixture_paths = &args[1..separator];
    let command = shell_command(&args[separator + 1..]);
    if command.trim().is_empty() {
        usage(&args[0]);
    }

    let distributable =
        std::env::var(ENV_DISTRIBUTABLE).unwrap_or_else(|_| DEFAULT_DISTRIBUTABLE.to_string());
    if distributable != SKIP_DISTRIBUTABLE {
        let root = match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => fail(&format!("failed to get current directory: {}", e)),
        };
        if let Err(e) = require_distributable(&root, distributable) {
            fail(&e.to_string());
        }
    }

    let mut fixtures = Vec::with_capacity(fixture_paths.len());
    for path in fixture_paths {
        match Fixture::load(Path::new(path)) {
            Ok(fixture) => fixtures.push(fixture),
            Err(e) => fail(&e.to_string()),
        }
    }

    let config = match SandboxConfig::from_env() {
        Ok(config) => config,
        Err(e) => fail(&e.to_string()),
    };
    match config.validate().into_result() {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!("{}", warning);
            }
        }
        Err(e) => fail(&e.to_string()),
    }

    let mut sandbox = match Sandbox::with_config(config) {
        Ok(sandbox) => sandbox,
        Err(e) => fail(&e.to_string()),
    };

    tracing::info!(sandbox = %sandbox.id(), command = %command, "running scenario");
    let streamed = sandbox.config().stream_output;

    let outcome = match sandbox.load(&fixtures).await {
        Ok(()) => sandbox.exec(&command).await,
        Err(e) => Err(e),
    };

    if let Err(e) = sandbox.cleanup().await {
        tracing::error!(error = %e, "failed to clean up sandbox");
    }

    match outcome {
        Ok(output) if !streamed => print!("{}", output),
        Ok(_) => {}
        Err(e) => {
            if let Some(output) = e.command_output().filter(|_| !streamed) {
                eprint!("{}", output);
            }
            fail(&e.to_string());
        }
    }
}

fn usage(program: &str) -> ! {
    eprintln!("Usage: {} <fixture.yaml>... -- <command>", program);
    eprintln!("\nLoads fixtures into a fresh sandbox, runs the command there and removes the sandbox.");
    eprintln!("A single argument after -- is run as a shell script; several are run as one");
    eprintln!("command with each argument kept intact.");
    eprintln!("\nEnvironment variables:");
    eprintln!("  SANDBOX_INSTALLER=yarn|pnpm|none  Installer run after loading (default: yarn)");
    eprintln!("  SANDBOX_RETRY_ATTEMPTS=<n>        Attempts per filesystem operation (default: 3)");
    eprintln!("  SANDBOX_RETRY_DELAY_MS=<ms>       Pause between attempts (default: 250)");
    eprintln!("  SANDBOX_SETTLE_DELAY_MS=<ms>      Pause around writes and removals (default: 250)");
    eprintln!("  SANDBOX_TMPDIR=<dir>              Where sandboxes are created");
    eprintln!("  SANDBOX_QUIET=1                   Do not echo process output");
    eprintln!("  SANDBOX_DISTRIBUTABLE=<path>|none Packaged artifact that must exist first");
    eprintln!("                                    (default: {})", DEFAULT_DISTRIBUTABLE);
    std::process::exit(1);
}

/// Builds the `sh -c` script for the arguments after `--`.
fn shell_command(args: &[String]) -> String {
    match args {
        [script] => script.clone(),
        _ => args.iter().map(|arg| shell_quote(arg)).collect::<Vec<_>>().join(" "),
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}
