//! genloop CLI
//!
//! Minimal chat front end: loads a GGUF model, then streams completions
//! for a one-shot prompt or an interactive stdin loop.

use std::io::{BufRead, Write};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use genloop::config::{load_config, RunConfig};
use genloop::inference::{LlamaEngine, StreamEvent};
use genloop::session::StopReason;

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("genloop=info".parse().unwrap()))
        .init();

    tracing::info!("Starting genloop v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let config = match args.next().as_deref() {
        Some("--config") => match args.next() {
            Some(path) => load_config(path),
            None => {
                eprintln!("Usage: genloop --config <config.json> [prompt]");
                std::process::exit(2);
            }
        },
        Some(model_path) => RunConfig {
            model_path: model_path.into(),
            ..Default::default()
        },
        None => {
            eprintln!("Usage: genloop <model.gguf> [prompt] | genloop --config <config.json> [prompt]");
            std::process::exit(2);
        }
    };
    let one_shot: Option<String> = {
        let rest: Vec<String> = args.collect();
        if rest.is_empty() {
            None
        } else {
            Some(rest.join(" "))
        }
    };

    if let Err(e) = run(config, one_shot) {
        tracing::error!("{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(config: RunConfig, one_shot: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = LlamaEngine::new();
    engine.init()?;

    let info = engine.load_model(&config.model_path, config.session())?;
    tracing::info!(
        "Loaded {} ({} params, session context {})",
        info.path,
        info.param_count,
        config.context_size
    );

    if let Some(prompt) = one_shot {
        return stream_once(&engine, &prompt, &config);
    }

    // Interactive loop; empty line or EOF exits
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let prompt = line.trim();
        if prompt.is_empty() {
            break;
        }
        stream_once(&engine, prompt, &config)?;
    }

    engine.unload_model();
    Ok(())
}

fn stream_once(
    engine: &LlamaEngine,
    prompt: &str,
    config: &RunConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (events, _stop) = engine.generate_stream(prompt, config.generation)?;

    let mut stdout = std::io::stdout();
    for event in events {
        match event {
            StreamEvent::Chunk(chunk) => {
                stdout.write_all(chunk.as_bytes())?;
                stdout.flush()?;
            }
            StreamEvent::Done(reason) => {
                stdout.write_all(b"\n")?;
                match reason {
                    StopReason::StopToken | StopReason::BudgetExhausted => {}
                    StopReason::Cancelled => tracing::info!("Generation cancelled"),
                    StopReason::DecodeFailed(e) => {
                        tracing::warn!("Generation ended early: {e}");
                    }
                }
                break;
            }
            StreamEvent::Error(e) => {
                stdout.write_all(b"\n")?;
                return Err(e.into());
            }
        }
    }
    Ok(())
}
