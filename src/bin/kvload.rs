use std::process::ExitCode;

use loadgen_rs::config;
use loadgen_rs::kv;
use loadgen_rs::measure::SUMMARY_FRACTIONS;

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let prog = args[0].clone();
    let cfg = match config::parse_kvload_args(&args[1..]) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err:#}");
            eprintln!("{}", config::kvload_usage(&prog));
            return ExitCode::FAILURE;
        }
    };

    match kv::run(&cfg) {
        Ok(report) => {
            println!(
                "{} requests, mean {:.1} req/s",
                report.total_requests,
                report.throughput.mean_per_second()
            );
            for fraction in SUMMARY_FRACTIONS {
                println!(
                    "p{:<6} {} us",
                    fraction * 100.0,
                    report.hist.percentile(fraction)
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
