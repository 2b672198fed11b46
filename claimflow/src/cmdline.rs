use clap::{Arg, ArgMatches, Command, value_parser};

use crate::generator::{GeneratorArgs, StoreKind};

const DEFAULT_COUNT: u64 = 1_000;
const DEFAULT_KEYS: u64 = 100;
const DEFAULT_VERSION: &str = "v1";

pub(super) fn root_cli() -> Command {
    Command::new("claimflow")
        .about("Claimflow writes ordered claim updates to a claims store")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_generate_subcommand())
}

fn add_generate_subcommand() -> Command {
    Command::new("generate")
        .about("Feeds synthetic claim updates through the sink")
        .arg(
            Arg::new("count")
                .long("count")
                .help("Number of updates to generate")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("1000"),
        )
        .arg(
            Arg::new("keys")
                .long("keys")
                .help("Number of distinct claim keys the updates cycle over")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("100"),
        )
        .arg(
            Arg::new("store")
                .long("store")
                .help("Claims store to write to")
                .value_parser(["memory", "log"])
                .default_value("memory"),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .help("Upstream format version attached to every update")
                .default_value(DEFAULT_VERSION),
        )
}

pub(super) fn generator_args(matches: &ArgMatches) -> GeneratorArgs {
    let store = match matches.get_one::<String>("store").map(String::as_str) {
        Some("log") => StoreKind::Log,
        _ => StoreKind::Memory,
    };
    GeneratorArgs {
        count: matches.get_one::<u64>("count").copied().unwrap_or(DEFAULT_COUNT),
        keys: matches.get_one::<u64>("keys").copied().unwrap_or(DEFAULT_KEYS),
        store,
        version: matches
            .get_one::<String>("version")
            .cloned()
            .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        root_cli().debug_assert();
    }

    #[test]
    fn test_generate_defaults() {
        let matches = root_cli().try_get_matches_from(["claimflow", "generate"]).unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "generate");

        let args = generator_args(args);
        assert_eq!(args.count, DEFAULT_COUNT);
        assert_eq!(args.keys, DEFAULT_KEYS);
        assert_eq!(args.store, StoreKind::Memory);
        assert_eq!(args.version, "v1");
    }

    #[test]
    fn test_generate_args() {
        let matches = root_cli()
            .try_get_matches_from([
                "claimflow",
                "generate",
                "--count",
                "50",
                "--keys",
                "5",
                "--store",
                "log",
                "--version",
                "v7",
            ])
            .unwrap();
        let args = generator_args(matches.subcommand_matches("generate").unwrap());
        assert_eq!(args.count, 50);
        assert_eq!(args.keys, 5);
        assert_eq!(args.store, StoreKind::Log);
        assert_eq!(args.version, "v7");
    }

    #[test]
    fn test_invalid_args() {
        assert!(root_cli().try_get_matches_from(["claimflow"]).is_err());
        assert!(
            root_cli()
                .try_get_matches_from(["claimflow", "generate", "--keys", "0"])
                .is_err()
        );
        assert!(
            root_cli()
                .try_get_matches_from(["claimflow", "generate", "--store", "postgres"])
                .is_err()
        );
    }
}
