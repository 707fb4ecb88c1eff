use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::error;
use retrolm_inference::{run_inference, EngineError, InferenceConfigBuilder};

/// Define the command line interface.
fn cli_command() -> Command {
    Command::new("retrolm")
        .about("RetroLM: a tiny transformer language model for vintage hardware")
        .arg(
            Arg::new("weights")
                .help("Directory containing the model weight files")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in (0, inf); values <= 0 fall back to 1.0")
                .default_value("1.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed (default: wall clock)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = max_seq_len")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("STRING")
                .help("Mode: generate|chat [default: chat]")
                .default_value("chat"),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("STRING")
                .help("Input prompt"),
        )
        .arg(
            Arg::new("max-tokens")
                .short('n')
                .long("max-tokens")
                .value_name("INT")
                .help("Maximum tokens generated per response")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("keep-unprintable")
                .short('k')
                .long("keep-unprintable")
                .help("Suppress unprintable tokens instead of stopping on them")
                .action(ArgAction::SetTrue),
        )
}

/// Retro-styled startup banner, sized for an 80x25 text mode with margins.
fn print_banner() {
    println!();
    println!("  ====================================================================");
    println!("  |                                                                  |");
    println!("  |       ##### ##### ##### ##### #####  #    #   #                  |");
    println!("  |       #   # #       #   #   # #   #  #    ## ##                  |");
    println!("  |       ##### ###     #   ##### #   #  #    # # #                  |");
    println!("  |       #  #  #       #   #  #  #   #  #    #   #                  |");
    println!("  |       #   # #####   #   #   # #####  #### #   #                  |");
    println!("  |                                                                  |");
    println!("  ====================================================================");
    println!();
    println!("             >> RETRO VIBES LOADED - ENTER THE MATRIX <<");
    println!();
}

fn run_inference_command(matches: &ArgMatches) -> Result<()> {
    let config = InferenceConfigBuilder::default()
        .weights_dir(matches.get_one::<String>("weights"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .mode(matches.get_one::<String>("mode"))
        .prompt(matches.get_one::<String>("input"))
        .max_tokens(matches.get_one::<usize>("max-tokens").copied())
        .halt_on_unprintable(Some(!matches.get_flag("keep-unprintable")))
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    run_inference(config)
}

fn execute_command() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = cli_command().get_matches();
    print_banner();
    run_inference_command(&matches)
}

fn main() {
    if let Err(e) = execute_command() {
        error!("Error: {e}");
        let code = e
            .downcast_ref::<EngineError>()
            .map(EngineError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
