use replayer_rs::cli::{self, RunConfig};
use replayer_rs::supervisor::{master, worker};

fn main() {
    let code = match cli::parse_args() {
        RunConfig::Master(config) => match master::run_master(config) {
            Ok(report) => {
                eprintln!(
                    "replay complete: clean_exits={} respawns={} dropped_slots={} banned_modules={}",
                    report.clean_exits,
                    report.respawns,
                    report.dropped_slots,
                    report.banned_modules,
                );
                0
            }
            Err(err) => {
                eprintln!("replayer-rs: {err}");
                1
            }
        },
        RunConfig::Worker(config) => worker::run_worker(config),
    };
    std::process::exit(code);
}
