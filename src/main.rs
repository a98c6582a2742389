use container_io::{original_stderr, parse_args, EX_USAGE};
use env_logger::{Env, Target};
use std::env;
use std::io::{self, Write};
use std::process::exit;

fn diagnostics() -> Box<dyn Write + Send> {
    match original_stderr() {
        Some(file) => Box::new(file),
        None => Box::new(io::sink()),
    }
}

fn main() {
    // stderr is about to point at container_io.txt; keep our own output on
    // the caller's stderr
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .format_module_path(false)
        .target(Target::Pipe(diagnostics()))
        .init();
    let mut diag = diagnostics();

    let invocation = match parse_args(env::args_os()) {
        Ok(invocation) => invocation,
        Err(e) => match e.kind {
            clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed => e.exit(),
            _ => {
                let _ = writeln!(diag, "{}", e.message);
                exit(EX_USAGE);
            }
        },
    };

    let err = match invocation.launcher.run(&invocation.user_args) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    let _ = writeln!(diag, "container-io: {}", err);
    exit(err.exit_code());
}
