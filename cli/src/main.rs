//! cedra CLI - driving adapter for the cedra engine.
//!
//! Subcommands:
//! - `check <config.cdrl>` - digest a configuration and report its resources
//! - `plan <config.cdrl>` - digest and show how resources would be dispatched
//! - `info` - print the built-in visitor and evaluator names

use std::process;

use cedra::prelude::*;
use cedra::{FileResourceLocator, DEFAULT_EVALUATOR, WILDCARD_SELECTOR};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--verbose" || a == "-v") {
        tracing_subscriber::fmt()
            .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
            .init();
    }
    let args: Vec<String> = args
        .into_iter()
        .filter(|a| a != "--verbose" && a != "-v")
        .collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "check" => cmd_check(&args[2..]),
        "plan" => cmd_plan(&args[2..]),
        "info" => cmd_info(),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("error: unknown command \"{other}\"");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!("usage: cedra [--verbose] <command> [args]");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  check <config.cdrl>   digest a configuration and report its resources");
    eprintln!("  plan <config.cdrl>    digest and show dispatch keys per resource");
    eprintln!("  info                  print built-in visitor and evaluator names");
}

fn digest_file(path: &str) -> Result<ResourceConfigSeq, String> {
    let source = std::fs::read_to_string(path).map_err(|e| format!("cannot read {path}: {e}"))?;
    let base_uri = match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => ".",
    };

    let locator = FileResourceLocator;
    let visitors = VisitorRegistry::builder().build();
    let mut extensions = ExtensionDigesters::new();
    digest_config(&source, base_uri, &locator, &visitors, &mut extensions)
        .map_err(|e| e.to_string())
}

fn cmd_check(args: &[String]) -> Result<(), String> {
    let path = args.first().ok_or("check requires a config file path")?;
    let seq = digest_file(path)?;

    println!("{}: {} resource(s), {} profile set(s)", path, seq.len(), seq.profile_sets().count());
    for config in seq.resource_configs() {
        println!("  {config}");
    }
    Ok(())
}

fn cmd_plan(args: &[String]) -> Result<(), String> {
    let path = args.first().ok_or("plan requires a config file path")?;
    let seq = digest_file(path)?;

    println!("dispatch plan for {path}:");
    for config in seq.resource_configs() {
        let key = config
            .selector_path()
            .dispatch_key()
            .unwrap_or(WILDCARD_SELECTOR);
        let rooted = if config.selector_path().is_rooted() {
            "rooted"
        } else {
            "floating"
        };
        println!(
            "  key[{key}] {rooted} selector[{}] resource[{}] params[{}]",
            config.selector_path(),
            config.resource().unwrap_or("-"),
            config.params().len(),
        );
    }
    Ok(())
}

fn cmd_info() -> Result<(), String> {
    let visitors = VisitorRegistry::builder().build();
    let mut names: Vec<&str> = visitors.resource_names().collect();
    names.sort_unstable();

    println!("built-in visitors:");
    for name in names {
        println!("  {name}");
    }
    println!("default expression evaluator: {DEFAULT_EVALUATOR}");
    Ok(())
}
