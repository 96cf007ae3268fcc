use clap::{Arg, ArgAction, Command, value_parser};

pub(super) fn root_cli() -> Command {
    Command::new("mappy")
        .about("Live route point ingestion")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_serve_subcommand())
        .subcommand(add_generate_subcommand())
}

fn add_serve_subcommand() -> Command {
    Command::new("serve")
        .about("Runs a route point source and prints every point as a JSON line on stdout")
        .arg(
            Arg::new("source")
                .long("source")
                .help("eventhub, random or tablestorage; defaults to MAPPY_ROUTE_POINT_SOURCE"),
        )
        .arg(
            Arg::new("log-points")
                .long("log-points")
                .help("Log route points instead of printing the live feed")
                .action(ArgAction::SetTrue),
        )
}

fn add_generate_subcommand() -> Command {
    Command::new("generate")
        .about("Writes random-walk route points to the event stream or the point store")
        .arg(
            Arg::new("target")
                .long("target")
                .value_parser(["stream", "store"])
                .default_value("stream"),
        )
        .arg(
            Arg::new("count")
                .long("count")
                .help("Stop after this many points")
                .value_parser(value_parser!(u64)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        root_cli().debug_assert();
    }

    #[test]
    fn parses_generate_arguments() {
        let matches = root_cli()
            .try_get_matches_from(["mappy", "generate", "--target", "store", "--count", "20"])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "generate");
        assert_eq!(args.get_one::<String>("target").unwrap(), "store");
        assert_eq!(args.get_one::<u64>("count"), Some(&20));

        assert!(root_cli()
            .try_get_matches_from(["mappy", "generate", "--target", "kafka"])
            .is_err());
    }
}
