use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use gabor_runner::ii::{bucket_label_counts, build_ii_sequence};
use gabor_runner::{
    build_block, load_config, write_default_config, Block, ControllerPoller, CsvExporter,
    ExperimentConfig, InputArbiter, Label, NoGamepads, Session, SessionController, Trial,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod terminal;

use terminal::{KeyboardReader, RuleObserver, TerminalDisplay};

#[derive(Parser)]
#[command(name = "gabor", version, about = "RB/II categorization experiment runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BlockArg {
    #[value(name = "rb")]
    Rb,
    #[value(name = "ii")]
    Ii,
}

impl From<BlockArg> for Block {
    fn from(value: BlockArg) -> Self {
        match value {
            BlockArg::Rb => Block::RuleBased,
            BlockArg::Ii => Block::InformationIntegration,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ResponderArg {
    #[value(name = "keyboard")]
    Keyboard,
    #[value(name = "auto")]
    Auto,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long = "set")]
    set_values: Vec<String>,
}

impl ConfigArgs {
    fn load(&self) -> Result<ExperimentConfig> {
        load_config(self.config.as_deref(), &self.set_values)
    }
}

#[derive(Subcommand)]
enum Commands {
    Sequence {
        #[arg(long)]
        participant: String,
        #[arg(long, value_enum)]
        block: BlockArg,
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[arg(long)]
        participant: String,
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        json: bool,
    },
    Run {
        #[arg(long)]
        participant: String,
        #[arg(long, default_value = ".")]
        out: PathBuf,
        #[arg(long, value_enum, default_value = "keyboard")]
        responder: ResponderArg,
        #[arg(long, default_value_t = 450)]
        auto_delay_ms: u64,
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        json: bool,
    },
    Config {
        #[arg(long)]
        init: bool,
        #[arg(long, default_value = "gabor.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.command);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(command: &Commands) {
    // Raw-mode terminals mangle interleaved log lines, so keep them quiet.
    let default = match command {
        Commands::Run {
            responder: ResponderArg::Keyboard,
            ..
        } => "gabor=warn,gabor_runner=warn",
        _ => "gabor=info,gabor_runner=info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Sequence {
            participant,
            block,
            config,
            json,
        } => {
            let config = config.load()?;
            let block: Block = block.into();
            let trials = build_block(&config, &participant, block);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sequence",
                    "participant": participant,
                    "block": block.as_str(),
                    "trials": trials,
                })));
            }
            println!("trialIndex,sf,ori,label");
            for (i, t) in trials.iter().enumerate() {
                println!("{},{},{:.3},{}", i + 1, t.stripes, t.orientation, t.label.as_str());
            }
        }
        Commands::Describe {
            participant,
            config,
            json,
        } => {
            let config = config.load()?;
            let summary = describe(&config, &participant);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary,
                })));
            }
            print_description(&summary);
        }
        Commands::Run {
            participant,
            out,
            responder,
            auto_delay_ms,
            config,
            json,
        } => {
            let config = config.load()?;
            let participant = participant.trim().to_string();
            if participant.is_empty() {
                return Err(anyhow::anyhow!("participant id must not be empty"));
            }
            let (session, csv_path) =
                run_session(&config, &participant, &out, responder, auto_delay_ms)?;
            let summary = session_summary(&session, csv_path.as_ref());
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "session": summary,
                })));
            }
            print_session_summary(&summary);
        }
        Commands::Config { init, path, force } => {
            if !init {
                let config = ExperimentConfig::default();
                print!("{}", serde_yaml::to_string(&config)?);
                return Ok(None);
            }
            write_default_config(&path, force)?;
            println!("wrote: {}", path.display());
            println!("next: gabor describe --participant <id> --config {}", path.display());
        }
    }
    Ok(None)
}

fn run_session(
    config: &ExperimentConfig,
    participant: &str,
    out: &std::path::Path,
    responder: ResponderArg,
    auto_delay_ms: u64,
) -> Result<(Session, Option<PathBuf>)> {
    let arbiter = Arc::new(InputArbiter::new(&config.input));
    let poller = ControllerPoller::spawn(
        Box::new(NoGamepads),
        config.input.gamepad.clone(),
        config.input.poll_interval(),
        arbiter.clone(),
    );
    let controller = SessionController::new(config, arbiter.clone());
    let mut exporter = CsvExporter::new(out);

    let session = match responder {
        ResponderArg::Keyboard => {
            let reader = KeyboardReader::start(arbiter.clone())?;
            let mut display = TerminalDisplay::new();
            let result = controller.run(participant, &mut display, &mut exporter);
            reader.stop();
            result?
        }
        ResponderArg::Auto => {
            let mut display = RuleObserver::new(
                arbiter.clone(),
                config.rb.threshold,
                Duration::from_millis(auto_delay_ms),
            );
            controller.run(participant, &mut display, &mut exporter)?
        }
    };
    poller.stop();
    Ok((session, exporter.written().map(|p| p.to_path_buf())))
}

fn count_labels(trials: &[Trial]) -> (usize, usize) {
    let a = trials.iter().filter(|t| t.label == Label::A).count();
    (a, trials.len() - a)
}

fn describe(config: &ExperimentConfig, participant: &str) -> Value {
    let rb = build_block(config, participant, Block::RuleBased);
    let (rb_a, rb_b) = count_labels(&rb);
    let ii = build_ii_sequence(participant, &config.stimulus, &config.ii);
    let (ii_a, ii_b) = count_labels(&ii.trials);
    let buckets = bucket_label_counts(&ii.trials, &config.ii.buckets, &config.stimulus);
    json!({
        "participant": participant,
        "rb": {
            "trials": rb.len(),
            "target": config.rb.trials,
            "label_a": rb_a,
            "label_b": rb_b,
        },
        "ii": {
            "trials": ii.trials.len(),
            "target": config.ii.trials,
            "label_a": ii_a,
            "label_b": ii_b,
            "generation_rounds": ii.rounds,
            "backfilled": ii.backfilled,
            "duplicated": ii.duplicated,
            "buckets": config.ii.buckets.iter().zip(&buckets).map(|(range, [a, b])| json!({
                "range": range,
                "label_a": a,
                "label_b": b,
            })).collect::<Vec<_>>(),
        }
    })
}

fn print_description(summary: &Value) {
    println!("participant: {}", summary["participant"].as_str().unwrap_or(""));
    for block in ["rb", "ii"] {
        let b = &summary[block];
        println!(
            "{}: trials={} target={} A={} B={}",
            block, b["trials"], b["target"], b["label_a"], b["label_b"]
        );
    }
    let ii = &summary["ii"];
    println!(
        "ii_generation_rounds: {}  backfilled: {}  duplicated: {}",
        ii["generation_rounds"], ii["backfilled"], ii["duplicated"]
    );
    if let Some(buckets) = ii["buckets"].as_array() {
        for bucket in buckets {
            println!(
                "  bucket {}: A={} B={}",
                bucket["range"], bucket["label_a"], bucket["label_b"]
            );
        }
    }
}

fn session_summary(session: &Session, csv_path: Option<&PathBuf>) -> Value {
    let per_block = |block: Block| {
        let results: Vec<_> = session.results_for(block).collect();
        let correct = results.iter().filter(|r| r.correct).count();
        let timeouts = results.iter().filter(|r| r.timeout_flag()).count();
        json!({
            "trials": results.len(),
            "correct": correct,
            "timeouts": timeouts,
        })
    };
    json!({
        "participant": session.participant(),
        "outcome": session.outcome(),
        "rb": per_block(Block::RuleBased),
        "ii": per_block(Block::InformationIntegration),
        "csv": csv_path.map(|p| p.display().to_string()),
    })
}

fn print_session_summary(summary: &Value) {
    println!("participant: {}", summary["participant"].as_str().unwrap_or(""));
    println!("outcome: {}", summary["outcome"].as_str().unwrap_or("unknown"));
    for block in ["rb", "ii"] {
        let b = &summary[block];
        println!(
            "{}: trials={} correct={} timeouts={}",
            block, b["trials"], b["correct"], b["timeouts"]
        );
    }
    if let Some(csv) = summary["csv"].as_str() {
        println!("csv: {}", csv);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Sequence { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Run { json, .. } => *json,
        Commands::Config { .. } => false,
    }
}
