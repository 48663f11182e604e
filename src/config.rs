//! Configuration surfaces: the ini-style address file of the raw-packet
//! generator and the command lines of both binaries.
//!
//! All errors here are configuration errors; the binaries print the usage
//! block and exit non-zero before anything touches a port or socket.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use getopts::Options;

use crate::keygen::KeyDist;
use crate::kv::KvConfig;
use crate::run::{RunConfig, MIN_FRAME_SIZE};
use crate::schedule::{Interarrival, ServerWork};
use crate::wire::{EthernetAddress, Ipv4Address};

/// Link, network, and transport addresses of the raw-packet generator.
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    pub src_ether: EthernetAddress,
    pub dst_ether: EthernetAddress,
    pub src_ip: Ipv4Address,
    pub dst_ip: Ipv4Address,
    pub dst_port: u16,
}

/// Load the `[ethernet]`/`[ipv4]`/`[tcp]` address file.
pub fn load_net_config(path: &Path) -> Result<NetConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot load configuration profile {}", path.display()))?;
    let entries = parse_ini(&text)?;
    let get = |section: &str, key: &str| -> Result<&String> {
        entries
            .get(&(section.to_string(), key.to_string()))
            .ok_or_else(|| anyhow!("missing [{section}] {key} in {}", path.display()))
    };

    Ok(NetConfig {
        src_ether: get("ethernet", "src")?
            .parse()
            .map_err(|_| anyhow!("bad [ethernet] src"))?,
        dst_ether: get("ethernet", "dst")?
            .parse()
            .map_err(|_| anyhow!("bad [ethernet] dst"))?,
        src_ip: get("ipv4", "src")?
            .parse()
            .map_err(|_| anyhow!("bad [ipv4] src"))?,
        dst_ip: get("ipv4", "dst")?
            .parse()
            .map_err(|_| anyhow!("bad [ipv4] dst"))?,
        dst_port: get("tcp", "dst")?
            .parse()
            .map_err(|_| anyhow!("bad [tcp] dst"))?,
    })
}

/// Minimal ini reader: `[section]` headers, `key = value` entries, `#`/`;`
/// comments.
fn parse_ini(text: &str) -> Result<HashMap<(String, String), String>> {
    let mut entries = HashMap::new();
    let mut section = String::new();
    for (nr, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.trim().to_string();
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("malformed line {} in config", nr + 1))?;
        entries.insert(
            (section.clone(), key.trim().to_string()),
            value.trim().to_string(),
        );
    }
    Ok(entries)
}

fn tcpload_options() -> Options {
    let mut opts = Options::new();
    opts.optopt(
        "d",
        "",
        "interarrival distribution <uniform|exponential|lognormal|pareto>",
        "DIST",
    );
    opts.optopt("r", "", "rate in packets per second", "RATE");
    opts.optopt("f", "", "number of flows", "FLOWS");
    opts.optopt("s", "", "frame size in bytes", "SIZE");
    opts.optopt("t", "", "time in seconds to send packets", "TIME");
    opts.optopt("e", "", "seed", "SEED");
    opts.optopt(
        "D",
        "",
        "work distribution on the server <constant|exponential|bimodal>",
        "DIST",
    );
    opts.optopt("i", "", "iterations on the server", "N");
    opts.optopt("j", "", "iterations on the server (second mode)", "N");
    opts.optopt("m", "", "mode for the bimodal distribution", "PROB");
    opts.optopt("c", "", "name of the configuration file", "FILENAME");
    opts.optopt("o", "", "name of the output file", "FILENAME");
    opts.optopt("I", "", "network interface to transmit on", "IFNAME");
    opts
}

pub fn tcpload_usage(prog: &str) -> String {
    tcpload_options().usage(&format!("Usage: {prog} [options]"))
}

/// Parse the raw-packet generator command line. Returns the run
/// configuration and the interface to open the port on.
pub fn parse_tcpload_args(args: &[String]) -> Result<(RunConfig, String)> {
    let matches = tcpload_options()
        .parse(args)
        .map_err(|e| anyhow!("{e}"))?;

    let interarrival: Interarrival = matches
        .opt_str("d")
        .unwrap_or_else(|| "uniform".into())
        .parse()
        .map_err(|_| anyhow!("invalid interarrival distribution"))?;
    let server_work: ServerWork = matches
        .opt_str("D")
        .unwrap_or_else(|| "constant".into())
        .parse()
        .map_err(|_| anyhow!("invalid server work distribution"))?;

    let rate: u64 = opt_num(&matches, "r")?.ok_or_else(|| anyhow!("rate is required"))?;
    let duration: u64 = opt_num(&matches, "t")?.ok_or_else(|| anyhow!("duration is required"))?;
    if rate == 0 || duration == 0 {
        bail!("rate and duration must be positive");
    }
    let nr_flows: usize = opt_num(&matches, "f")?.unwrap_or(1) as usize;
    if nr_flows == 0 || nr_flows > u16::MAX as usize {
        bail!("flow count out of range");
    }
    let frame_size: usize = opt_num(&matches, "s")?.unwrap_or(MIN_FRAME_SIZE as u64) as usize;
    if frame_size < MIN_FRAME_SIZE {
        bail!("the minimum frame size is {MIN_FRAME_SIZE}");
    }

    let config_path: PathBuf = matches
        .opt_str("c")
        .ok_or_else(|| anyhow!("configuration file is required"))?
        .into();
    let output: PathBuf = matches
        .opt_str("o")
        .ok_or_else(|| anyhow!("output file is required"))?
        .into();

    let iface = matches
        .opt_str("I")
        .ok_or_else(|| anyhow!("network interface is required"))?;

    Ok((
        RunConfig {
            rate,
            duration,
            nr_flows,
            frame_size,
            seed: opt_num(&matches, "e")?.unwrap_or(0),
            interarrival,
            server_work,
            srv_iterations0: opt_num(&matches, "i")?.unwrap_or(0),
            srv_iterations1: opt_num(&matches, "j")?.unwrap_or(0),
            srv_mode: matches
                .opt_str("m")
                .map(|s| s.parse::<f64>())
                .transpose()
                .map_err(|_| anyhow!("invalid bimodal mode"))?
                .unwrap_or(0.0),
            net: load_net_config(&config_path)?,
            output,
        },
        iface,
    ))
}

fn kvload_options() -> Options {
    let mut opts = Options::new();
    opts.optopt("h", "", "server ip address", "ADDR");
    opts.optopt("p", "", "server listening port", "PORT");
    opts.optopt("t", "", "number of seconds to run", "TIME");
    opts.optopt("r", "", "per-connection rate limit, 0 = unlimited", "RATE");
    opts.optopt("n", "", "connections per worker", "CONNS");
    opts.optopt("w", "", "worker threads", "CORES");
    opts.optopt("q", "", "in-flight requests per connection", "PENDING");
    opts.optopt("v", "", "SET value length in bytes", "SIZE");
    opts.optopt("R", "", "ratio of SET and GET commands", "SET:GET");
    opts.optopt(
        "d",
        "",
        "distribution to generate keys <uniform|zipfian|sequential>",
        "DIST",
    );
    opts.optopt("e", "", "seed", "SEED");
    opts
}

pub fn kvload_usage(prog: &str) -> String {
    kvload_options().usage(&format!("Usage: {prog} [options]"))
}

/// Parse the key-value generator command line.
pub fn parse_kvload_args(args: &[String]) -> Result<KvConfig> {
    let matches = kvload_options().parse(args).map_err(|e| anyhow!("{e}"))?;

    let host: Ipv4Address = matches
        .opt_str("h")
        .ok_or_else(|| anyhow!("server address is required"))?
        .parse()
        .map_err(|_| anyhow!("invalid server address"))?;
    let port: u16 =
        opt_num(&matches, "p")?.ok_or_else(|| anyhow!("server port is required"))? as u16;
    let duration: u64 =
        opt_num(&matches, "t")?.ok_or_else(|| anyhow!("duration is required"))?;
    if duration == 0 {
        bail!("duration must be positive");
    }

    let (set_ratio, get_ratio) = match matches.opt_str("R") {
        None => (1, 9),
        Some(s) => {
            let (set, get) = s
                .split_once(':')
                .ok_or_else(|| anyhow!("ratio must be SET:GET"))?;
            (
                set.parse().map_err(|_| anyhow!("invalid SET ratio"))?,
                get.parse().map_err(|_| anyhow!("invalid GET ratio"))?,
            )
        }
    };
    if set_ratio + get_ratio == 0 {
        bail!("ratio must name at least one command");
    }

    let dist: KeyDist = matches
        .opt_str("d")
        .unwrap_or_else(|| "uniform".into())
        .parse()
        .map_err(|_| anyhow!("invalid key distribution"))?;

    let nconns = opt_num(&matches, "n")?.unwrap_or(1) as usize;
    let ncores = opt_num(&matches, "w")?.unwrap_or(1) as usize;
    let max_pending = opt_num(&matches, "q")?.unwrap_or(1) as usize;
    if nconns == 0 || ncores == 0 || max_pending == 0 {
        bail!("connections, workers, and pending depth must be positive");
    }

    Ok(KvConfig {
        host,
        port,
        duration,
        rate: opt_num(&matches, "r")?.unwrap_or(0),
        nconns,
        ncores,
        max_pending,
        vsize: opt_num(&matches, "v")?.unwrap_or(64) as usize,
        set_ratio,
        get_ratio,
        dist,
        seed: opt_num(&matches, "e")?.unwrap_or(0),
    })
}

fn opt_num(matches: &getopts::Matches, name: &str) -> Result<Option<u64>> {
    matches
        .opt_str(name)
        .map(|s| s.parse::<u64>().map_err(|_| anyhow!("invalid -{name} value")))
        .transpose()
}
