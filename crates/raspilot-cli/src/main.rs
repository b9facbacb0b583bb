//! `raspilot` – flight stack launcher
//!
//! 1. Resolves `~/.raspilot/config.toml` (defaults when absent, environment
//!    overrides on top).  `raspilot init` writes the resolved settings
//!    back to that file and exits.
//! 2. Installs the `tracing` subscriber.
//! 3. Assembles the kernel: ground link, optional simulated sensors and
//!    flight controller, telemetry / black-box / load-guard recorders.
//! 4. Runs until **Ctrl-C** or a `system.stop` command, then stops every
//!    module.

mod config;

use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use raspilot_kernel::Kernel;
use raspilot_runtime::sim::{FlightController, LoggingGroundLink, SimulatedImu, SimulatedReceiver};
use raspilot_runtime::{TracingOptions, init_tracing_with, launch, standard_recorders};
use tracing::{error, warn};

fn main() -> ExitCode {
    // ── Configuration ─────────────────────────────────────────────────────
    let path = config::config_path();
    let cfg = match config::resolve(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    if std::env::args().nth(1).as_deref() == Some("init") {
        return match config::save_to(&cfg, &path) {
            Ok(()) => {
                println!("  {} Config saved to {}", "✓".green().bold(), path.display().to_string().bold());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Error saving config".red(), e);
                ExitCode::FAILURE
            }
        };
    }

    // ── Structured logging ────────────────────────────────────────────────
    let _tracer = init_tracing_with(
        TracingOptions::from_env("raspilot").with_default_directive(cfg.log_level.clone()),
    );

    print_banner();
    if path.exists() {
        println!("  Config loaded from {}", path.display().to_string().bold());
    } else {
        println!(
            "  No config at {}; using defaults.",
            path.display().to_string().dimmed()
        );
    }

    // ── Kernel assembly ───────────────────────────────────────────────────
    let recorders = match standard_recorders(cfg.watchdog_config()) {
        Ok(recorders) => recorders,
        Err(e) => {
            eprintln!("{}: {}", "Watchdog error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let mut builder = Kernel::builder()
        .config(cfg.kernel_config())
        .module(LoggingGroundLink::new());
    if cfg.simulation.enabled {
        let sim = &cfg.simulation;
        builder = builder
            .module(SimulatedImu::new(Duration::from_millis(sim.imu_ms)))
            .module(SimulatedReceiver::new(Duration::from_millis(sim.rx_ms)))
            .module(FlightController::new(Duration::from_millis(sim.control_ms)));
    }
    let kernel = match builder.recorders(recorders).build() {
        Ok(kernel) => kernel,
        Err(e) => {
            eprintln!("{}: {}", "Kernel error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = kernel.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        shutdown.request();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; send system.stop to shut down");
    }

    // ── Run ───────────────────────────────────────────────────────────────
    match launch(&kernel) {
        Ok(report) => {
            println!("{}", "  ✓ All modules stopped.".green());
            for (module, reason) in &report.failed {
                println!("    {} {}: {}", "✗".red(), module.bold(), reason);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Raspilot exited with an error");
            println!("{}: {}", "Bootstrap failed".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"    ____                  _ __      __"#.bold().cyan());
    println!("{}", r#"   / __ \____ __________ (_) /___  / /_"#.bold().cyan());
    println!("{}", r#"  / /_/ / __ `/ ___/ __ \/ / / __ \/ __/"#.bold().cyan());
    println!("{}", r#" / _, _/ /_/ (__  ) /_/ / / / /_/ / /_"#.bold().cyan());
    println!("{}", r#"/_/ |_|\__,_/____/ .___/_/_/\____/\__/"#.bold().cyan());
    println!("{}", r#"                /_/"#.bold().cyan());
    println!();
    println!("  {} {}",
        "Raspilot".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Modular flight-control kernel");
    println!();
}
