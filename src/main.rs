use memflow_procwalk::enumerate::{ProbeResult, ThreadResult};
use memflow_procwalk::prelude::*;
use memflow_procwalk::profile::libvmi_config;

use memflow::prelude::v1::Address;

use clap::{command, value_parser, Arg, ArgAction, ArgMatches};
use log::*;

use std::process::ExitCode;

const RULE: &str = "============================================================";

fn parse_hex(s: &str) -> std::result::Result<u64, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("`{}` is not a hex address: {}", s, e))
}

fn cli() -> clap::Command {
    command!()
        .arg(
            Arg::new("target")
                .help("connector target, usually the VM name")
                .default_value("win7-vmi"),
        )
        .arg(
            Arg::new("connector")
                .long("connector")
                .short('c')
                .default_value("kvm"),
        )
        .arg(
            Arg::new("dtb")
                .long("dtb")
                .help("kernel directory table base (hex)")
                .value_parser(parse_hex)
                .required_unless_present("dump-offsets"),
        )
        .arg(
            Arg::new("list-head")
                .long("list-head")
                .help("address of the process list head (hex)")
                .value_parser(parse_hex)
                .required_unless_present_any(["kernel-base", "dump-offsets"]),
        )
        .arg(
            Arg::new("kernel-base")
                .long("kernel-base")
                .help("kernel base; the list head is taken from the symbol file (hex)")
                .value_parser(parse_hex)
                .conflicts_with("list-head")
                .requires("isf"),
        )
        .arg(
            Arg::new("profile")
                .long("profile")
                .short('p')
                .default_value("win7-sp1-x64"),
        )
        .arg(
            Arg::new("os-version")
                .long("os-version")
                .help("pick the built-in profile for this major.minor.build")
                .value_parser(value_parser!(OsVersion))
                .conflicts_with("isf"),
        )
        .arg(
            Arg::new("isf")
                .long("isf")
                .help("Volatility3 symbol file (.json or .json.xz)"),
        )
        .arg(
            Arg::new("platform")
                .long("platform")
                .value_parser(value_parser!(Platform)),
        )
        .arg(
            Arg::new("head")
                .long("head")
                .value_parser(["member", "sentinel"])
                .default_value("sentinel"),
        )
        .arg(
            Arg::new("max-iterations")
                .long("max-iterations")
                .value_parser(value_parser!(usize))
                .default_value("65536"),
        )
        .arg(
            Arg::new("name-len")
                .long("name-len")
                .value_parser(value_parser!(usize))
                .default_value("64"),
        )
        .arg(
            Arg::new("canonical-start")
                .long("canonical-start")
                .value_parser(parse_hex)
                .requires("canonical-end"),
        )
        .arg(
            Arg::new("canonical-end")
                .long("canonical-end")
                .value_parser(parse_hex)
                .requires("canonical-start"),
        )
        .arg(
            Arg::new("no-probe")
                .long("no-probe")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-threads")
                .long("no-threads")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dump-offsets")
                .long("dump-offsets")
                .help("print the resolved offsets as a libvmi config block and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count),
        )
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .unwrap();
}

fn load_profile(matches: &ArgMatches) -> Result<(Profile, Option<IsfSymbols>)> {
    let platform = matches.get_one::<Platform>("platform").copied();

    if let Some(path) = matches.get_one::<String>("isf") {
        let symbols = IsfSymbols::from_path(path)?;
        let profile =
            Profile::from_isf(path, &symbols, platform.unwrap_or(Platform::WinX64))?;
        return Ok((profile, Some(symbols)));
    }

    if let Some(&version) = matches.get_one::<OsVersion>("os-version") {
        let profile = Profile::by_version(version, platform.unwrap_or(Platform::WinX64))?;
        return Ok((profile, None));
    }

    let name = matches
        .get_one::<String>("profile")
        .map(String::as_str)
        .unwrap_or("win7-sp1-x64");
    let profile = Profile::by_name(name)?;

    // built-in offsets only hold for the platform they were taken from
    match platform {
        Some(platform) if platform != profile.platform => Err(Error::Config(format!(
            "profile {} is for {}, not {}",
            profile.name, profile.platform, platform
        ))),
        _ => Ok((profile, None)),
    }
}

fn list_head(matches: &ArgMatches, symbols: Option<&IsfSymbols>) -> Result<Address> {
    if let Some(&head) = matches.get_one::<u64>("list-head") {
        return Ok(Address::from(head));
    }

    match (matches.get_one::<u64>("kernel-base"), symbols) {
        (Some(&base), Some(symbols)) => {
            let rva = symbols.symbol("PsActiveProcessHead")?;
            Ok(Address::from(base.wrapping_add(rva)))
        }
        _ => Err(Error::Config(
            "either --list-head or --kernel-base with --isf is required".into(),
        )),
    }
}

fn print_banner(target: &str, profile: &Profile, canonical: &CanonicalRange) {
    println!("{}", RULE);
    println!("  Guest process list walk");
    println!("{}", RULE);
    println!("Target VM: {}", target);
    println!("Profile:   {} ({})", profile.name, profile.platform);
    println!("Kernel pointer range: {}", canonical);
}

fn print_section(title: &str) {
    println!("\n{}\n{}\n{}", RULE, title, RULE);
}

fn print_processes(outcome: &WalkOutcome<ProcessRecord>) {
    for record in &outcome.records {
        println!(
            "[{:5}] {:<20} (EPROCESS: 0x{:x})",
            record.pid, record.name, record.base
        );
    }

    println!("\nTotal processes found: {}", outcome.records.len());
    println!(
        "Walk ended: {} after {} steps, {} unreadable nodes skipped",
        outcome.termination, outcome.steps, outcome.skipped
    );
    if !outcome.termination.is_complete() {
        println!("WARNING: the process list above may be incomplete");
    }
}

fn print_probes(probes: &[ProbeResult], probe_offset: usize) {
    for probe in probes {
        println!(
            "Process [{}] {}: structure accessible for analysis",
            probe.record.pid, probe.record.name
        );
        match probe.word {
            Some(word) => println!("    EPROCESS+0x{:x}: 0x{:08x}", probe_offset, word),
            None => println!("    EPROCESS+0x{:x}: unreadable", probe_offset),
        }
        if let Some(peb) = probe.peb {
            println!("    PEB: 0x{:x}", peb);
        }
    }

    println!("\nProcesses probed: {}", probes.len());
}

fn print_threads(threads: &[ThreadResult]) {
    for result in threads {
        println!("Process [{}] {}:", result.record.pid, result.record.name);

        for candidate in &result.candidates.examples {
            println!(
                "    Thread-related pointer at +0x{:x}: 0x{:x}",
                candidate.offset, candidate.value
            );
        }

        if result.candidates.total > 0 {
            println!(
                "    Estimated thread-related structures: {}",
                result.candidates.total
            );
        } else {
            println!("    No kernel-range pointers in the scanned window");
        }

        if let Some(list) = result.thread_list {
            println!(
                "    ThreadListHead entries: {} ({})",
                list.entries, list.termination
            );
        }
    }

    println!("\nProcesses analyzed for thread structures: {}", threads.len());
    println!("Note: candidates are values in the kernel pointer range, not verified thread objects");
}

fn print_report(report: &Report, enumerator: &Enumerator) {
    print_section("PROCESS ENUMERATION");
    match &report.processes {
        Ok(outcome) => print_processes(outcome),
        Err(err) => println!("ERROR: {}", err),
    }

    if let Some(probes) = &report.probes {
        print_section("STRUCTURE PROBE");
        let offset = enumerator.probe.as_ref().map(|p| p.probe_offset).unwrap_or(0);
        match probes {
            Ok(probes) => print_probes(probes, offset),
            Err(err) => println!("ERROR: {}", err),
        }
    }

    if let Some(threads) = &report.threads {
        print_section("THREAD POINTER ANALYSIS (heuristic)");
        match threads {
            Ok(threads) => print_threads(threads),
            Err(err) => println!("ERROR: {}", err),
        }
    }
}

fn run(matches: &ArgMatches) -> Result<bool> {
    let target = matches
        .get_one::<String>("target")
        .cloned()
        .unwrap_or_else(|| "win7-vmi".into());

    let (profile, symbols) = load_profile(matches)?;

    if matches.get_flag("dump-offsets") {
        print!("{}", libvmi_config(&target, &profile.offsets));
        return Ok(true);
    }

    let canonical = match (
        matches.get_one::<u64>("canonical-start"),
        matches.get_one::<u64>("canonical-end"),
    ) {
        (Some(&start), Some(&end)) if start < end => CanonicalRange::new(start, end),
        (Some(_), Some(_)) => {
            return Err(Error::Config("canonical range start must be below its end".into()))
        }
        _ => profile.platform.canonical_range(),
    };

    let head = list_head(matches, symbols.as_ref())?;
    let dtb = matches
        .get_one::<u64>("dtb")
        .copied()
        .ok_or_else(|| Error::Config("--dtb is required".into()))?;

    print_banner(&target, &profile, &canonical);

    let mut session = attach(&SessionConfig {
        target: target.clone(),
        connector: matches
            .get_one::<String>("connector")
            .cloned()
            .unwrap_or_else(|| "kvm".into()),
        dtb: Address::from(dtb),
        platform: profile.platform,
    })?;

    let mut enumerator = Enumerator::new(head, profile.offsets.clone(), canonical);
    enumerator.walk = WalkConfig {
        max_iterations: matches
            .get_one::<usize>("max-iterations")
            .copied()
            .unwrap_or(0x10000),
        head: match matches.get_one::<String>("head").map(String::as_str) {
            Some("member") => HeadKind::Member,
            _ => HeadKind::Sentinel,
        },
    };
    enumerator.name_limit = NameLimit::new(
        matches.get_one::<usize>("name-len").copied().unwrap_or(64),
        Overflow::Truncate,
    );
    if !matches.get_flag("no-probe") {
        enumerator.probe = Some(ProbePhase::default());
    }
    if !matches.get_flag("no-threads") {
        enumerator.threads = Some(ThreadPhase::for_platform(profile.platform));
    }

    println!("\nStarting introspection...");
    let report = enumerator.run(session.kernel());
    print_report(&report, &enumerator);

    Ok(report.is_success())
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_logger(matches.get_count("verbose"));

    match run(&matches) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            error!("one or more enumeration phases failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            println!("ERROR: {}", err);
            if let Error::Init { target, .. } = &err {
                println!("Make sure the VM '{}' is running, the connector plugin is installed and you have sufficient privileges", target);
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn parses_hex_addresses() {
        assert_eq!(parse_hex("0xfffff80002a4e000"), Ok(0xfffff80002a4e000));
        assert_eq!(parse_hex("187000"), Ok(0x187000));
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn dump_offsets_needs_no_addresses() {
        let matches = cli()
            .try_get_matches_from(["procwalk", "win7-vmi", "--dump-offsets"])
            .unwrap();
        assert!(run(&matches).unwrap());
    }

    fn profile_for(args: &[&str]) -> Result<Profile> {
        let matches = cli()
            .try_get_matches_from(["procwalk", "--dump-offsets"].iter().chain(args))
            .unwrap();
        load_profile(&matches).map(|(profile, _)| profile)
    }

    #[test]
    fn platform_must_match_builtin_profile() {
        assert!(matches!(
            profile_for(&["--platform", "win-x86"]),
            Err(Error::Config(_))
        ));

        let profile = profile_for(&["--profile", "win7-sp1-x86", "--platform", "win-x86"]).unwrap();
        assert_eq!(profile.platform, Platform::WinX86);
    }

    #[test]
    fn selects_profile_by_os_version() {
        let profile = profile_for(&["--os-version", "10.0.19045"]).unwrap();
        assert_eq!(profile.name, "win10-2004-x64");

        let profile = profile_for(&["--os-version", "6.1.7601", "--platform", "x86"]).unwrap();
        assert_eq!(profile.name, "win7-sp1-x86");

        assert!(matches!(
            profile_for(&["--os-version", "6.3.9600"]),
            Err(Error::UnknownProfile(_))
        ));
    }

    #[test]
    fn walk_requires_list_head() {
        assert!(cli()
            .try_get_matches_from(["procwalk", "--dtb", "187000"])
            .is_err());
        assert!(cli()
            .try_get_matches_from(["procwalk", "--dtb", "187000", "--kernel-base", "0xfffff80002a4e000"])
            .is_err());
        assert!(cli()
            .try_get_matches_from(["procwalk", "--dtb", "187000", "--list-head", "0xfffff80002c7db30"])
            .is_ok());
    }
}
