mod debug_report;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use watchline::config::EngineConfig;
use watchline::tail::{LogTailer, scan_backward};
use watchline::{CollectingSink, Engine};

const DEFAULT_POLL_MS: u64 = 250;
const DEFAULT_BACKFILL_CHUNK: u64 = 64 * 1024;
const MAX_FAILED_POLLS: u32 = 20;

fn main() {
    env_logger::init();

    let config = match parse_args() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

struct CliConfig {
    config_path: PathBuf,
    log_path: PathBuf,
    poll_ms: u64,
    from_start: bool,
    backfill_chunk: u64,
    color: bool,
}

fn run(cli: CliConfig) -> Result<(), String> {
    let raw = std::fs::read_to_string(&cli.config_path)
        .map_err(|err| format!("failed to read {}: {err}", cli.config_path.display()))?;
    let config: EngineConfig = serde_json::from_str(&raw)
        .map_err(|err| format!("failed to parse {}: {err}", cli.config_path.display()))?;

    let mut engine = Engine::new();
    engine.configure(config);

    if engine.loopback_pending() {
        scan_backward(&cli.log_path, cli.backfill_chunk, |line| !engine.backfill_line(line))
            .map_err(|err| format!("backfill scan of {} failed: {err}", cli.log_path.display()))?;
    }

    let mut tailer = if cli.from_start {
        LogTailer::from_start(&cli.log_path)
    } else {
        LogTailer::new(&cli.log_path)
            .map_err(|err| format!("failed to open {}: {err}", cli.log_path.display()))?
    };

    let mut failed_polls = 0u32;
    loop {
        let lines = match poll_step(tailer.poll(), &mut failed_polls, &cli.log_path) {
            PollStep::Lines(lines) => lines,
            PollStep::Retry => {
                std::thread::sleep(Duration::from_millis(cli.poll_ms));
                continue;
            }
            PollStep::GiveUp(message) => return Err(message),
        };
        let mut sink = CollectingSink::default();
        for line in &lines {
            engine.process_line(line, &mut sink);
        }
        engine.tick(&mut sink);
        debug_report::print_events(&sink.events, cli.color);
        std::thread::sleep(Duration::from_millis(cli.poll_ms));
    }
}

fn parse_args() -> Result<CliConfig, String> {
    let mut config_path: Option<PathBuf> = None;
    let mut log_path: Option<PathBuf> = None;
    let mut poll_ms = DEFAULT_POLL_MS;
    let mut from_start = false;
    let mut backfill_chunk = DEFAULT_BACKFILL_CHUNK;
    let mut color = std::io::stdout().is_terminal();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{}", help_text());
                std::process::exit(0);
            }
            "-V" | "--version" => {
                println!("watchline {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--color" => color = true,
            "--no-color" => color = false,
            "--from-start" => from_start = true,
            "--config" => {
                let value =
                    args.next().ok_or_else(|| "error: --config expects a path".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--log" => {
                let value =
                    args.next().ok_or_else(|| "error: --log expects a path".to_string())?;
                log_path = Some(PathBuf::from(value));
            }
            "--poll-ms" => {
                let value =
                    args.next().ok_or_else(|| "error: --poll-ms expects a value".to_string())?;
                poll_ms = parse_number(&value, "--poll-ms")?;
            }
            "--backfill-chunk" => {
                let value = args
                    .next()
                    .ok_or_else(|| "error: --backfill-chunk expects a value".to_string())?;
                backfill_chunk = parse_number(&value, "--backfill-chunk")?;
                if backfill_chunk == 0 {
                    return Err("error: --backfill-chunk must be positive".to_string());
                }
            }
            _ if arg.starts_with("--config=") => {
                config_path = Some(PathBuf::from(arg.trim_start_matches("--config=")));
            }
            _ if arg.starts_with("--log=") => {
                log_path = Some(PathBuf::from(arg.trim_start_matches("--log=")));
            }
            _ if arg.starts_with("--poll-ms=") => {
                poll_ms = parse_number(arg.trim_start_matches("--poll-ms="), "--poll-ms")?;
            }
            _ => return Err(format!("error: unknown option '{arg}'")),
        }
    }

    let config_path =
        config_path.ok_or_else(|| format!("error: --config is required\n\n{}", help_text()))?;
    let log_path =
        log_path.ok_or_else(|| format!("error: --log is required\n\n{}", help_text()))?;

    Ok(CliConfig { config_path, log_path, poll_ms, from_start, backfill_chunk, color })
}

fn parse_number(value: &str, flag: &str) -> Result<u64, String> {
    value.parse::<u64>().map_err(|_| format!("error: invalid {flag} '{value}'"))
}

enum PollStep {
    Lines(Vec<String>),
    Retry,
    GiveUp(String),
}

/// Transient read errors (rotation races, network shares) get a bounded
/// retry before the process gives up. A successful poll resets the count.
fn poll_step(
    result: std::io::Result<Vec<String>>,
    failed_polls: &mut u32,
    path: &std::path::Path,
) -> PollStep {
    match result {
        Ok(lines) => {
            *failed_polls = 0;
            PollStep::Lines(lines)
        }
        Err(err) => {
            *failed_polls += 1;
            if *failed_polls >= MAX_FAILED_POLLS {
                return PollStep::GiveUp(format!(
                    "polling {} failed {failed_polls} times in a row: {err}",
                    path.display()
                ));
            }
            log::warn!("polling {} failed (attempt {failed_polls}): {err}", path.display());
            PollStep::Retry
        }
    }
}

fn help_text() -> String {
    format!(
        "watchline {}
Tail a game log and run a trigger configuration against it.

USAGE:
    watchline --config <file.json> --log <file.txt> [OPTIONS]

OPTIONS:
    --config <file>          Trigger configuration (JSON)
    --log <file>             Log file to tail
    --poll-ms <n>            Poll interval in milliseconds [default: {DEFAULT_POLL_MS}]
    --from-start             Replay the log from the beginning instead of tailing
    --backfill-chunk <n>     Chunk size for the backward loopback scan [default: {DEFAULT_BACKFILL_CHUNK}]
    --color / --no-color     Force colored output on or off
    -h, --help               Print help
    -V, --version            Print version",
        env!("CARGO_PKG_VERSION")
    )
}
