use clap::{value_parser, Arg, Command, ValueHint};
use epifany_cli::input::Input;
use epifany_cli::runner::Runner;
use rayon::ThreadPoolBuilder;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Error)
        .parse_env(
            env_logger::Env::default()
                .filter_or("EPIFANY_LOG", "error,epifany_core=info,epifany=info"),
        )
        .init();

    let matches = Command::new("epifany")
        .version(clap::crate_version!())
        .about("Bayesian protein inference on peptide-spectrum matches")
        .arg(
            Arg::new("parameters")
                .required(true)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Path to configuration parameters (JSON file)")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("input_path")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path to identifications (JSON file). Overrides the input \
                     listed in the configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("output_directory")
                .short('o')
                .long("output_directory")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path where inference results will be written. \
                     Overrides the directory specified in the configuration file.",
                )
                .value_hint(ValueHint::DirPath),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .value_parser(value_parser!(u16).range(1..))
                .help("Number of threads used for connected components (default = # of CPUs)")
                .value_hint(ValueHint::Other),
        )
        .help_template(
            "{usage-heading} {usage}\n\n\
             {about-with-newline}\n\
             Version {version}\n\n\
             {all-args}{after-help}",
        )
        .get_matches();

    let threads = matches
        .get_one::<u16>("threads")
        .copied()
        .map(usize::from)
        .unwrap_or_else(num_cpus::get);
    ThreadPoolBuilder::new().num_threads(threads).build_global()?;

    let input = Input::from_arguments(matches)?;

    let runner = input.build().and_then(Runner::new)?;
    runner.run()?;

    Ok(())
}
