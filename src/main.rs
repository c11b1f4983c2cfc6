use blockforge::{CodegenError, CompileOptions, Compiler, Graph, TargetDescriptor};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(author, version, about = "Lower a method graph to laid-out LIR", long_about = None)]
struct Args {
    /// Method graph in JSON
    graph: PathBuf,

    /// Target preset: aarch64, arm32 or arm32-soft-float
    #[arg(short, long, default_value = "aarch64")]
    target: String,

    /// Compile options in JSON; missing fields take defaults
    #[arg(short, long)]
    options: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", value_parser = parse_level)]
    log_level: Level,
}

fn parse_level(s: &str) -> Result<Level, String> {
    Level::from_str(s).map_err(|_| format!("unknown log level {}", s))
}

fn run(args: &Args) -> Result<String, CodegenError> {
    let target = TargetDescriptor::by_name(&args.target)
        .ok_or_else(|| CodegenError::Config(format!("unknown target {}", args.target)))?;
    let options = match &args.options {
        Some(path) => CompileOptions::from_json_file(path)?,
        None => CompileOptions::default(),
    };
    let text = fs::read_to_string(&args.graph)?;
    let graph: Graph = serde_json::from_str(&text)?;
    info!(method = %graph.name, nodes = graph.len(), target = %target.summary(), "loaded");

    let compiler = Compiler::new(target, options)?;
    let method = compiler.compile_method(&graph)?;
    Ok(method.to_string())
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(listing) => {
            print!("{}", listing);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("blockforge: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        let args = Args::try_parse_from(["blockforge", "m.json", "-l", "debug"]).unwrap();
        assert_eq!(args.log_level, Level::DEBUG);
        let args = Args::try_parse_from(["blockforge", "m.json"]).unwrap();
        assert_eq!(args.log_level, Level::INFO);
        assert!(Args::try_parse_from(["blockforge", "m.json", "-l", "loud"]).is_err());
    }
}
