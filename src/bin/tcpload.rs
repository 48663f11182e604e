use std::process::ExitCode;

use loadgen_rs::config;

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let prog = args[0].clone();
    let (cfg, iface) = match config::parse_tcpload_args(&args[1..]) {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("{err:#}");
            eprintln!("{}", config::tcpload_usage(&prog));
            return ExitCode::FAILURE;
        }
    };

    run(&cfg, &iface)
}

#[cfg(target_os = "linux")]
fn run(cfg: &loadgen_rs::run::RunConfig, iface: &str) -> ExitCode {
    use loadgen_rs::port::afpacket::AfPacketPort;

    let port = match AfPacketPort::open(iface) {
        Ok(port) => port,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    match loadgen_rs::run::run(cfg, Box::new(port)) {
        Ok(report) => {
            println!(
                "received {} responses, {} never sent, {} dropped",
                report.records, report.never_sent, report.rx_dropped
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_cfg: &loadgen_rs::run::RunConfig, _iface: &str) -> ExitCode {
    eprintln!("the raw-packet generator needs a Linux packet socket");
    ExitCode::FAILURE
}
