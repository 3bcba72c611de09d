use std::process::ExitCode;

use clap::Parser;

use cacheguard::cancel::CancellationToken;
use cacheguard::config::{self, CliArgs};
use cacheguard::orchestrator::Orchestrator;
use cacheguard::pmu::PmuSession;

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let (config, warnings) = config::resolve(&cli);

    let level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    for warning in &warnings {
        log::warn!("config: {warning}");
    }

    if cli.self_test {
        return self_test(&config);
    }

    let cancel = CancellationToken::new();
    let handler_cancel = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_cancel.cancel()) {
        log::warn!("could not install SIGINT/SIGTERM handler: {e}");
    }

    match Orchestrator::new(config, cancel).run() {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

/// `--self-test`: open one PMU session, take a single read, and print
/// the raw counters plus preflight diagnostics, then exit. This is the
/// tool the `FATAL_RUNTIME` diagnostic in spec §7 points operators at
/// ("run the PMU self-test mode").
fn self_test(config: &cacheguard::config::Config) -> ExitCode {
    match PmuSession::open(config.target_pid, config.target_cpu) {
        Ok(mut session) => match session.read() {
            Ok(reading) => {
                println!("cycles:               {}", reading.cycles());
                println!("instructions:         {}", reading.instructions());
                println!("cache_references:     {}", reading.cache_references());
                println!("cache_misses:         {}", reading.cache_misses());
                println!("branch_instructions:  {}", reading.branch_instructions());
                println!("branch_misses:        {}", reading.branch_misses());
                println!("time_enabled:         {}", reading.time_enabled);
                println!("time_running:         {}", reading.time_running);
                ExitCode::from(0)
            }
            Err(e) => {
                eprintln!("self-test: PMU read failed: {e}");
                ExitCode::from(1)
            }
        },
        Err(e) => {
            eprintln!(
                "self-test: PMU open failed: {e}\n\
                 hint: check /proc/sys/kernel/perf_event_paranoid, CAP_PERFMON, \
                 and whether this host is a VM lacking PMU passthrough"
            );
            ExitCode::from(1)
        }
    }
}
