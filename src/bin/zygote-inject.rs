use log::*;

use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches};
use nix::unistd::Pid;

use zygote_inject::inject::{InjectOptions, DEFAULT_LIBC_MODULE, DEFAULT_LOADER_MODULE};
use zygote_inject::zygote::{self, TraceOptions};

fn pid_arg(index: usize) -> Arg<'static> {
    Arg::new("pid")
        .help("Pid of the freshly forked process. It must still be stopped by SIGSTOP")
        .required(true)
        .index(index)
}

fn parse_pid_arg(args: &ArgMatches) -> Pid {
    Pid::from_raw(args.value_of_t_or_exit("pid"))
}

fn trace_options(args: &ArgMatches) -> TraceOptions {
    TraceOptions {
        pid: parse_pid_arg(args),
        inject: InjectOptions {
            library: args.value_of_t_or_exit("library"),
            loader_module: args.value_of_t_or_exit("loader-module"),
            libc_module: args.value_of_t_or_exit("libc-module"),
        },
    }
}

fn trace(args: &ArgMatches) {
    let opts = trace_options(args);

    if let Err(err) = zygote::trace_zygote(&opts) {
        error!("{}", err);
        std::process::exit(1);
    };
}

fn setup_logging(matches: &clap::ArgMatches) {
    if matches.is_present("verbose") {
        env_logger::Builder::new().parse_filters("debug").init();
        return;
    }

    let loglevel = matches.value_of("loglevel");
    if let Some(level) = loglevel {
        env_logger::Builder::new().parse_filters(level).init();
        return;
    }

    // default
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn main() {
    let trace_command = App::new("trace")
        .about("Load a library into a stopped process before it reaches its entry point.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(pid_arg(1))
        .arg(
            Arg::new("library")
                .help("Absolute path of the library in the target's mount namespace")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::new("loader-module")
                .long("loader-module")
                .takes_value(true)
                .default_value(DEFAULT_LOADER_MODULE)
                .help("Module that exports dlopen, dlsym and dlerror"),
        )
        .arg(
            Arg::new("libc-module")
                .long("libc-module")
                .takes_value(true)
                .default_value(DEFAULT_LIBC_MODULE)
                .help("Module that exports strlen. Remote calls return into it"),
        );

    let main_app = App::new("zygote-inject")
        .about("Inject a shared library into a freshly forked process.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::new("verbose")
             .short('v')
             .conflicts_with("loglevel")
             .help("shorthand for --loglevel debug)"))
        .arg(Arg::new("loglevel")
             .short('l')
             .takes_value(true)
             .help("Finegrained verbosity control. See docs.rs/env_logger. Examples: [error, warn, info, debug, trace]"))
        .subcommands([trace_command]);

    let matches = main_app.get_matches();
    setup_logging(&matches);
    match matches.subcommand() {
        Some(("trace", sub_matches)) => trace(sub_matches),
        Some((_, _)) => unreachable!(),
        None => unreachable!(),
    }
}
