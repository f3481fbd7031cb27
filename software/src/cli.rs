//! Pieces shared by the command line tools.

use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Parse a number the way C's `strtol(s, NULL, 0)` would: `0x` prefix for
/// hex, a leading zero for octal, decimal otherwise.
pub fn parse_number(s: &str) -> Option<u32> {
    let s = s.trim();
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    u32::from_str_radix(digits, radix).ok()
}

/// Install the tracing subscriber, writing to stderr so it never mixes with
/// tool output. `RUST_LOG` takes precedence over the verbose flag.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .try_init();
}

/// Status printing that honours the tools' quiet and verbose flags.
#[derive(Copy, Clone, Debug, Default)]
pub struct Console {
    pub quiet: bool,
    pub verbose: bool,
}

impl Console {
    /// Print unless quiet.
    pub fn say(&self, args: fmt::Arguments) {
        if !self.quiet {
            print!("{}", args);
            let _ = io::stdout().flush();
        }
    }

    /// Print only in verbose mode.
    pub fn detail(&self, args: fmt::Arguments) {
        if self.verbose {
            print!("{}", args);
            let _ = io::stdout().flush();
        }
    }
}

/// Ask a yes/no question on stdin. Anything but an answer starting with
/// 'y' or 'Y' is a no.
pub fn confirm<R: BufRead>(input: &mut R, prompt: &str) -> bool {
    print!("{}", prompt);
    let _ = io::stdout().flush();
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(_) => line.starts_with('y') || line.starts_with('Y'),
        Err(_) => false,
    }
}

/// Why an output file was not written.
#[derive(Debug)]
pub enum WriteError {
    /// The file exists and we were told not to ask.
    Exists,
    /// The user declined to overwrite the file.
    Declined,
    Open(io::Error),
    Write(io::Error),
}

/// Write `data` to `path`, prompting before replacing an existing file
/// unless `overwrite` is set. In quiet mode an existing file is an error.
pub fn write_output<R: BufRead>(path: &Path, data: &[u8], overwrite: bool,
                                console: &Console, input: &mut R)
    -> std::result::Result<(), WriteError>
{
    if !overwrite && path.exists() {
        console.detail(format_args!("Output file already exists.\n"));
        if console.quiet {
            return Err(WriteError::Exists);
        }
        let prompt = format!("File {} exists. Overwrite? (Y/N): ", path.display());
        if !confirm(input, &prompt) {
            console.detail(format_args!("User chose not to overwrite output.\n"));
            return Err(WriteError::Declined);
        }
        println!("Overwriting existing output file.");
    }
    let mut file = fs::File::create(path).map_err(WriteError::Open)?;
    console.detail(format_args!("Writing {} (0x{:x}) bytes to output file.\n",
                                data.len(), data.len()));
    file.write_all(data).map_err(WriteError::Write)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn numbers_follow_strtol_bases() {
        assert_eq!(parse_number("1024"), Some(1024));
        assert_eq!(parse_number("0x1800"), Some(0x1800));
        assert_eq!(parse_number("0X1cbe"), Some(0x1CBE));
        assert_eq!(parse_number("010"), Some(8));
        assert_eq!(parse_number("0"), Some(0));
        assert_eq!(parse_number("bogus"), None);
        assert_eq!(parse_number("0x"), None);
    }

    #[test]
    fn confirm_reads_first_character() {
        assert!(confirm(&mut Cursor::new("y\n"), ""));
        assert!(confirm(&mut Cursor::new("Yes\n"), ""));
        assert!(!confirm(&mut Cursor::new("n\n"), ""));
        assert!(!confirm(&mut Cursor::new(""), ""));
    }

    #[test]
    fn new_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let console = Console { quiet: true, verbose: false };
        write_output(&path, b"abc", false, &console, &mut Cursor::new("")).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn existing_file_in_quiet_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        fs::write(&path, b"old").unwrap();
        let console = Console { quiet: true, verbose: false };
        let r = write_output(&path, b"new", false, &console, &mut Cursor::new("y\n"));
        assert!(matches!(r, Err(WriteError::Exists)));
        write_output(&path, b"new", true, &console, &mut Cursor::new("")).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn prompt_answer_decides_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        fs::write(&path, b"old").unwrap();
        let console = Console::default();
        let r = write_output(&path, b"new", false, &console, &mut Cursor::new("n\n"));
        assert!(matches!(r, Err(WriteError::Declined)));
        assert_eq!(fs::read(&path).unwrap(), b"old");
        write_output(&path, b"new", false, &console, &mut Cursor::new("Y\n")).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn unwritable_path_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.bin");
        let console = Console { quiet: true, verbose: false };
        let r = write_output(&path, b"x", true, &console, &mut Cursor::new(""));
        assert!(matches!(r, Err(WriteError::Open(_))));
    }
}
