use clap::{App, AppSettings, Arg};
use log::{debug, info};
use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, execvpe};
use std::convert::Infallible;
use std::env;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const REDIRECT_FILE: &str = "container_io.txt";

pub const EX_USAGE: i32 = 64;
pub const EX_OSERR: i32 = 71;
pub const EX_CANTCREAT: i32 = 73;
pub const EXIT_CANNOT_EXECUTE: i32 = 126;
pub const EXIT_NOT_FOUND: i32 = 127;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{0}")]
    Usage(String),
    #[error("failed to open {}: {source}", path.display())]
    Open { path: PathBuf, source: Errno },
    #[error("failed to attach redirect file to {stream}: {source}")]
    Redirect { stream: &'static str, source: Errno },
    #[error("failed to close redirect file handle: {0}")]
    Close(#[source] Errno),
    #[error("failed to execute {program}: {source}")]
    Exec { program: String, source: Errno },
}

impl LaunchError {
    /// Exit status reported when the launch fails with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Usage(_) => EX_USAGE,
            LaunchError::Open { .. } => EX_CANTCREAT,
            LaunchError::Redirect { .. } | LaunchError::Close(_) => EX_OSERR,
            LaunchError::Exec {
                source: Errno::ENOENT,
                ..
            } => EXIT_NOT_FOUND,
            LaunchError::Exec { .. } => EXIT_CANNOT_EXECUTE,
        }
    }
}

/// How the child's argument vector is derived from the user arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgvMode {
    /// The child sees `[program, args...]`.
    Conventional,
    /// The child sees `[args...]`: its argv[0] is the first argument after
    /// the program, not the program itself.
    Shifted,
}

impl Default for ArgvMode {
    fn default() -> Self {
        ArgvMode::Conventional
    }
}

/// Descriptor slots that receive the redirect file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdStreams {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

impl Default for StdStreams {
    fn default() -> Self {
        StdStreams {
            stdin: 0,
            stdout: 1,
            stderr: 2,
        }
    }
}

impl StdStreams {
    fn slots(&self) -> [(&'static str, RawFd); 3] {
        [
            ("stdin", self.stdin),
            ("stdout", self.stdout),
            ("stderr", self.stderr),
        ]
    }

    fn contains(&self, fd: RawFd) -> bool {
        self.slots().iter().any(|&(_, slot)| slot == fd)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Launcher {
    pub work_dir: PathBuf,
    pub streams: StdStreams,
    pub argv_mode: ArgvMode,
}

impl Launcher {
    pub fn new<P: Into<PathBuf>>(work_dir: P) -> Launcher {
        Launcher {
            work_dir: work_dir.into(),
            ..Launcher::default()
        }
    }

    /// Redirects the configured streams to the redirect file and execs
    /// `user_args[0]`. Only returns on failure.
    pub fn run(&self, user_args: &[OsString]) -> Result<Infallible, LaunchError> {
        let program = user_args
            .first()
            .ok_or_else(|| LaunchError::Usage("missing target program".to_string()))?;
        let program = to_cstring(program)?;
        let argv = child_argv(user_args, self.argv_mode)?;
        let envp = current_env()?;

        let fd = open_redirect_file(&self.work_dir)?;
        redirect_streams(fd, &self.streams)?;

        info!("exec {:?} argv={:?}", program, argv);
        let err = exec_target(&program, &argv, &envp);
        debug!("exec failed: {}", err);
        Err(err)
    }
}

fn to_cstring(s: &OsStr) -> Result<CString, LaunchError> {
    CString::new(s.as_bytes())
        .map_err(|_| LaunchError::Usage(format!("argument {:?} contains a NUL byte", s)))
}

/// Builds the argument vector handed to the target program.
pub fn child_argv(user_args: &[OsString], mode: ArgvMode) -> Result<Vec<CString>, LaunchError> {
    let skip = match mode {
        ArgvMode::Conventional => 0,
        ArgvMode::Shifted => 1,
    };
    user_args
        .iter()
        .skip(skip)
        .map(|s| to_cstring(s))
        .collect()
}

fn current_env() -> Result<Vec<CString>, LaunchError> {
    env::vars_os()
        .map(|(k, v)| {
            let mut entry = k;
            entry.push("=");
            entry.push(v);
            to_cstring(&entry)
        })
        .collect()
}

/// Opens (creating if needed) the redirect file inside `dir`.
///
/// The file is neither truncated nor opened for append, so output starts at
/// offset 0 over whatever an earlier run left behind.
pub fn open_redirect_file(dir: &Path) -> Result<RawFd, LaunchError> {
    let path = dir.join(REDIRECT_FILE);
    let mode = Mode::S_IRUSR
        | Mode::S_IWUSR
        | Mode::S_IRGRP
        | Mode::S_IWGRP
        | Mode::S_IROTH
        | Mode::S_IWOTH;
    let fd = open(&path, OFlag::O_RDWR | OFlag::O_CREAT, mode)
        .map_err(|source| LaunchError::Open { path: path.clone(), source })?;
    debug!("opened {} as fd {}", path.display(), fd);
    Ok(fd)
}

/// Duplicates `fd` onto every stream slot, then closes `fd` itself.
///
/// If `fd` already is one of the slots it stays open.
pub fn redirect_streams(fd: RawFd, streams: &StdStreams) -> Result<(), LaunchError> {
    for &(stream, slot) in streams.slots().iter() {
        dup2(fd, slot).map_err(|source| LaunchError::Redirect { stream, source })?;
        debug!("dup2({}, {}) for {}", fd, slot, stream);
    }
    if streams.contains(fd) {
        debug!("fd {} is a stream slot, keeping it open", fd);
        return Ok(());
    }
    close(fd).map_err(LaunchError::Close)
}

/// Replaces the process image, searching `PATH` when `program` has no slash.
pub fn exec_target(program: &CStr, argv: &[CString], envp: &[CString]) -> LaunchError {
    match execvpe(program, argv, envp) {
        Ok(never) => match never {},
        Err(source) => LaunchError::Exec {
            program: program.to_string_lossy().into_owned(),
            source,
        },
    }
}

/// A close-on-exec duplicate of stderr, numbered above the stdio slots so
/// redirection never replaces it.
pub fn original_stderr() -> Option<File> {
    let stderr = io::stderr();
    let fd = fcntl(stderr.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(3)).ok()?;
    // SAFETY: fd was just returned by F_DUPFD_CLOEXEC and nothing else owns it.
    Some(unsafe { File::from_raw_fd(fd) })
}

#[derive(Debug)]
pub struct Invocation {
    pub launcher: Launcher,
    pub user_args: Vec<OsString>,
}

pub fn parse_args<I, T>(args: I) -> Result<Invocation, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = App::new("container-io")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Redirects stdio to container_io.txt and execs a program")
        .setting(AppSettings::TrailingVarArg)
        .arg(
            Arg::with_name("shifted-argv")
                .long("shifted-argv")
                .help("Drop the program name from the child's argv")
                .required(false),
        )
        .arg(
            Arg::with_name("command")
                .help("Program to execute, followed by its arguments")
                .multiple(true)
                .required(true),
        )
        .get_matches_from_safe(args)?;

    let argv_mode = if matches.is_present("shifted-argv") {
        ArgvMode::Shifted
    } else {
        ArgvMode::Conventional
    };
    let user_args = matches
        .values_of_os("command")
        .map(|values| values.map(OsStr::to_os_string).collect())
        .unwrap_or_default();
    Ok(Invocation {
        launcher: Launcher {
            argv_mode,
            ..Launcher::new(".")
        },
        user_args,
    })
}
