//! tunsession command-line helper
//!
//! Translates share links into engine documents and runs the network
//! diagnostics without a host application.

use log::{debug, error, info};
use std::env;
use std::process;
use tokio::signal;
use tunsession::{
    config::{init_logging, Settings},
    diagnostics,
    error::{IntoTunError, Result, TunError},
    format_rate,
    profiler::QualityProfiler,
    translate,
};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let (settings, args) = match load_settings(args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{e}");
            process::exit(2);
        }
    };
    init_logging(&settings.logging);
    debug!("tunsession-cli v{}", env!("CARGO_PKG_VERSION"));

    let result = match args.first().map(String::as_str) {
        Some("translate") => cmd_translate(&args[1..]),
        Some("profile") => cmd_profile(&settings, &args[1..]).await,
        Some("check") => cmd_check().await,
        Some("ip") => cmd_ip().await,
        Some("rate") => cmd_rate(&args[1..]),
        Some("settings") => settings.to_toml().map(|toml| print!("{toml}")),
        Some("help") | Some("--help") | Some("-h") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => Err(TunError::InvalidState(format!("unknown command '{other}'"))),
    };

    if let Err(e) = result {
        error!("{e}");
        eprintln!("error: {e}");
        process::exit(1);
    }
}

/// Strip `--config <file>` from the arguments and load it, or use defaults
fn load_settings(mut args: Vec<String>) -> Result<(Settings, Vec<String>)> {
    let Some(pos) = args.iter().position(|a| a == "--config") else {
        return Ok((Settings::default(), args));
    };
    if pos + 1 >= args.len() {
        return Err(TunError::Config("--config requires a file path".to_string()));
    }
    let path = args.remove(pos + 1);
    args.remove(pos);

    let settings = Settings::from_file(&path)?;
    settings.validate()?;
    Ok((settings, args))
}

fn cmd_translate(args: &[String]) -> Result<()> {
    let input = args
        .first()
        .ok_or_else(|| TunError::InvalidState("translate needs a link".to_string()))?;
    let config = translate(input)?;
    if let Some(endpoint) = config.endpoint() {
        info!(
            "{} endpoint {}:{} ({})",
            endpoint.protocol.as_str(),
            endpoint.host,
            endpoint.port,
            endpoint.remark.as_deref().unwrap_or("no remark")
        );
    }
    let pretty = serde_json::to_string_pretty(config.document())
        .into_tun_error("Failed to render document")?;
    println!("{pretty}");
    Ok(())
}

async fn cmd_profile(settings: &Settings, args: &[String]) -> Result<()> {
    let tcp = args.iter().any(|a| a == "--tcp");
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();

    let host = positional
        .first()
        .map(|s| s.to_string())
        .unwrap_or_else(|| settings.profiler.host.clone());
    let port = match positional.get(1) {
        Some(p) => p
            .parse()
            .map_err(|_| TunError::Config(format!("invalid port '{p}'")))?,
        None => settings.profiler.port,
    };
    let count = match positional.get(2) {
        Some(c) => c
            .parse()
            .map_err(|_| TunError::Config(format!("invalid probe count '{c}'")))?,
        None => settings.profiler.probe_count,
    };

    let profiler = if tcp {
        QualityProfiler::tcp(settings.profiler.clone())
    } else {
        QualityProfiler::udp(settings.profiler.clone())
    };

    info!("Profiling {host}:{port} with {count} probes");
    tokio::select! {
        profile = profiler.profile(&host, port, count) => {
            println!("latency   {:.1} ms", profile.average_latency_ms);
            println!("jitter    {:.1} ms", profile.jitter_ms);
            println!("loss      {:.0} %", profile.packet_loss_percent);
            println!("score     {}", profile.quality_score);
            Ok(())
        }
        _ = signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    }
}

async fn cmd_check() -> Result<()> {
    if diagnostics::check_connectivity().await {
        println!("online");
    } else {
        println!("offline");
    }
    Ok(())
}

async fn cmd_ip() -> Result<()> {
    let info = diagnostics::fetch_ip_info().await?;
    println!("ip        {}", info.ip);
    println!("location  {}, {} ({})", info.city, info.country, info.country_code);
    println!("isp       {}", info.isp);
    println!("timezone  {}", info.timezone);
    Ok(())
}

fn cmd_rate(args: &[String]) -> Result<()> {
    let value = args
        .first()
        .ok_or_else(|| TunError::InvalidState("rate needs a byte count".to_string()))?;
    let bytes: u64 = value
        .parse()
        .map_err(|_| TunError::Config(format!("invalid byte count '{value}'")))?;
    println!("{}", format_rate(bytes));
    Ok(())
}

fn print_usage() {
    println!("tunsession-cli v{}", env!("CARGO_PKG_VERSION"));
    println!("Link translation and network diagnostics");
    println!();
    println!("USAGE:");
    println!("    tunsession-cli [--config FILE] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    translate LINK             Print the engine document for a vless://, vmess:// or JSON input");
    println!("    profile [HOST [PORT [N]]]  Measure latency, jitter and loss (add --tcp for TCP connect probes)");
    println!("    check                      Captive-portal connectivity check");
    println!("    ip                         Exit address via the local SOCKS inbound (session must be up)");
    println!("    rate BYTES                 Format a byte rate");
    println!("    settings                   Print the effective settings as TOML");
}
