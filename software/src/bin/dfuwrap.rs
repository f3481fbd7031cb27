use std::fs;
use std::io::{self, BufRead};
use std::path::Path;
use std::process;
use clap::{App, AppSettings, Arg, ArgMatches};
use lmdfu::{DFUSuffix, StellarisPrefix, STELLARIS_VID, DFU_BOOTLOADER_PID,
            prefix_valid, suffix_valid, unwrap, wrap};
use lmdfu::cli::{self, Console, WriteError};

const HELP: &str = "\
This application may be used to wrap binary files which are
to be flashed to a Stellaris device using the USB boot loader.
Additionally, the application can check the validity of an
existing Device Firmware Upgrade (DFU) wrapper or remove the
wrapper to retrieve the original binary payload.

Example:

   dfuwrap -i program.bin -o program.dfu -a 0x1800

wraps program.bin in a DFU wrapper which will cause the image to
address 0x1800 in Stellaris flash.
";

fn app() -> App<'static, 'static> {
    App::new("dfuwrap")
        .about("Wrap a binary file for use in USB DFU download")
        .after_help(HELP)
        .setting(AppSettings::DisableHelpFlags)
        .setting(AppSettings::DisableVersion)
        .arg(Arg::with_name("input").short("i").takes_value(true).value_name("file")
             .help("The name of the input file"))
        .arg(Arg::with_name("output").short("o").takes_value(true).value_name("file")
             .default_value("image.dfu")
             .help("The name of the output file"))
        .arg(Arg::with_name("remove").short("r")
             .help("Remove an existing DFU wrapper from the input file"))
        .arg(Arg::with_name("check").short("c")
             .help("Check validity of the input file's existing DFU wrapper"))
        .arg(Arg::with_name("vendor").short("v").takes_value(true).value_name("num")
             .help("Set the DFU wrapper's USB vendor ID (default 0x1CBE)"))
        .arg(Arg::with_name("product").short("p").takes_value(true).value_name("num")
             .help("Set the DFU wrapper's USB product ID (default 0x00FF)"))
        .arg(Arg::with_name("device").short("d").takes_value(true).value_name("num")
             .help("Set the DFU wrapper's USB device ID (default 0x0000)"))
        .arg(Arg::with_name("address").short("a").takes_value(true).value_name("num")
             .help("Set the address the binary will be flashed to"))
        .arg(Arg::with_name("overwrite").short("x")
             .help("Overwrite existing output file without prompting"))
        .arg(Arg::with_name("force").short("f")
             .help("Force wrapper writing even if a wrapper already exists"))
        .arg(Arg::with_name("quiet").short("q")
             .help("Quiet mode, disable output to stdio"))
        .arg(Arg::with_name("verbose").short("e")
             .help("Enable verbose output"))
        .arg(Arg::with_name("help").short("h")
             .help("Show this help"))
        .arg(Arg::with_name("help2").short("?").hidden(true))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Operation {
    Add,
    Remove,
    Check,
}

struct Options {
    console: Console,
    operation: Operation,
    input: String,
    output: String,
    vendor: u16,
    product: u16,
    device: u16,
    address: u32,
    overwrite: bool,
    force: bool,
}

fn show_help(console: &Console) {
    if !console.quiet {
        let _ = app().print_help();
        println!();
    }
}

fn parse_options(matches: &ArgMatches, console: Console) -> Options {
    let number = |name: &str, default: u32| match matches.value_of(name) {
        Some(s) => cli::parse_number(s).unwrap_or_else(|| {
            console.say(format_args!("Invalid number for -{}: {}\n", &name[..1], s));
            process::exit(1);
        }),
        None => default,
    };
    let operation = if matches.is_present("check") {
        Operation::Check
    } else if matches.is_present("remove") {
        Operation::Remove
    } else {
        Operation::Add
    };
    let address = number("address", 0);
    let input = matches.value_of("input");
    let help = matches.is_present("help") || matches.is_present("help2");
    let bad_address = operation == Operation::Add && (address == 0 || address % 1024 != 0);

    let input = match input {
        Some(input) if !help && !bad_address => input.to_string(),
        _ => {
            show_help(&console);
            if input.is_none() {
                console.say(format_args!("ERROR: An input file must be specified using the -i \
                                          parameter.\n"));
            }
            if operation == Operation::Add {
                if address == 0 {
                    console.say(format_args!("ERROR: The flash address of the image must be \
                                              provided using the -a parameter.\n"));
                } else if address % 1024 != 0 {
                    console.say(format_args!("ERROR: The supplied flash address must be a \
                                              multiple of 1024.\n"));
                }
            }
            process::exit(1);
        },
    };

    Options {
        console,
        operation,
        input,
        output: matches.value_of("output").unwrap_or("image.dfu").to_string(),
        vendor: number("vendor", STELLARIS_VID as u32) as u16,
        product: number("product", DFU_BOOTLOADER_PID as u32) as u16,
        device: number("device", 0) as u16,
        address,
        overwrite: matches.is_present("overwrite"),
        force: matches.is_present("force"),
    }
}

fn dump_options(opts: &Options) {
    let c = &opts.console;
    if c.quiet {
        return;
    }
    c.detail(format_args!("Input file:        {}\n", opts.input));
    c.detail(format_args!("Output file:       {}\n", opts.output));
    c.detail(format_args!("Operation:         {:?}\n", opts.operation));
    c.detail(format_args!("Vendor ID:         0x{:04x}\n", opts.vendor));
    c.detail(format_args!("Product ID:        0x{:04x}\n", opts.product));
    c.detail(format_args!("Device ID:         0x{:04x}\n", opts.device));
    c.detail(format_args!("Flash Address:     0x{:08x}\n", opts.address));
    c.detail(format_args!("Overwrite output?: {}\n", if opts.overwrite { "Yes" } else { "No" }));
    c.detail(format_args!("Force wrapper?:    {}\n", if opts.force { "Yes" } else { "No" }));
}

fn dump_prefix(console: &Console, prefix: &StellarisPrefix) {
    console.say(format_args!("\nStellaris DFU Prefix\n"));
    console.say(format_args!("--------------------\n\n"));
    console.say(format_args!("Flash address:  0x{:08x}\n", prefix.address));
    console.say(format_args!("Payload length: {} (0x{:x}) bytes, {}KB\n",
                             prefix.length, prefix.length, prefix.length / 1024));
}

fn dump_suffix(console: &Console, suffix: &DFUSuffix) {
    console.say(format_args!("\nDFU File Suffix\n"));
    console.say(format_args!("---------------\n\n"));
    console.say(format_args!("Suffix Length:  {} bytes\n", suffix.length));
    console.say(format_args!("Suffix Version: 0x{:4x}\n", suffix.dfu_version));
    console.say(format_args!("Device ID:      0x{:04x}\n", suffix.device));
    console.say(format_args!("Product ID:     0x{:04x}\n", suffix.product));
    console.say(format_args!("Vendor ID:      0x{:04x}\n", suffix.vendor));
    console.say(format_args!("CRC:            0x{:08x}\n", suffix.crc));
}

fn write<R: BufRead>(opts: &Options, data: &[u8], input: &mut R) -> i32 {
    let console = &opts.console;
    match cli::write_output(Path::new(&opts.output), data, opts.overwrite, console, input) {
        Ok(()) => {
            console.say(format_args!("Output file written successfully.\n"));
            0
        },
        Err(WriteError::Declined) => 6,
        Err(WriteError::Exists) => 7,
        Err(WriteError::Open(e)) => {
            tracing::debug!("{}", e);
            console.say(format_args!("Error opening output file for writing\n"));
            8
        },
        Err(WriteError::Write(e)) => {
            console.say(format_args!("Error writing data to output file! {}\n", e));
            9
        },
    }
}

/// Read the input file and carry out the operation. Returns the exit code;
/// `input` answers any overwrite prompt.
fn execute<R: BufRead>(opts: &Options, input: &mut R) -> i32 {
    let console = &opts.console;
    console.say(format_args!("Reading input file {}\n", opts.input));
    match fs::read(&opts.input) {
        Ok(data) => run(opts, &data, input),
        Err(e) => {
            console.say(format_args!("Can't open file!\n"));
            console.detail(format_args!("Error reading input file: {}\n", e));
            1
        },
    }
}

fn run<R: BufRead>(opts: &Options, data: &[u8], input: &mut R) -> i32 {
    let console = &opts.console;
    let has_prefix = prefix_valid(data);
    let has_suffix = suffix_valid(data);
    console.detail(format_args!("Prefix {}valid, suffix {}valid.\n",
                                if has_prefix { "" } else { "in" },
                                if has_suffix { "" } else { "in" }));
    match opts.operation {
        Operation::Check => {
            match StellarisPrefix::parse(data) {
                Some(prefix) if has_prefix => dump_prefix(console, &prefix),
                _ => console.say(format_args!("File prefix appears to be invalid or absent.\n")),
            }
            match DFUSuffix::read(data) {
                Some(suffix) if has_suffix => dump_suffix(console, &suffix),
                _ => console.say(format_args!("DFU suffix appears to be invalid or absent.\n")),
            }
            if has_prefix && has_suffix { 0 } else { 2 }
        },
        Operation::Remove => match unwrap(data) {
            Some(payload) => write(opts, payload, input),
            None => {
                console.say(format_args!("This does not appear to be a valid DFU-formatted \
                                          file.\n"));
                3
            },
        },
        Operation::Add => {
            if has_prefix && has_suffix && !opts.force {
                console.say(format_args!("This file already contains a valid DFU wrapper.\n"));
                console.say(format_args!("Use -f if you want to force the writing of \
                                          another wrapper.\n"));
                return 5;
            }
            let image = wrap(data, opts.address, opts.vendor, opts.product, opts.device);
            write(opts, &image, input)
        },
    }
}

fn main() {
    let matches = match app().get_matches_safe() {
        Ok(matches) => matches,
        Err(e) => {
            println!("{}", e.message);
            process::exit(1);
        },
    };
    let console = Console {
        quiet: matches.is_present("quiet"),
        verbose: matches.is_present("verbose"),
    };
    cli::init_logging(console.verbose);
    console.say(format_args!("\ndfuwrap - Wrap a binary file for use in USB DFU download.\n\n"));

    let opts = parse_options(&matches, console);
    dump_options(&opts);

    let stdin = io::stdin();
    process::exit(execute(&opts, &mut stdin.lock()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn options(operation: Operation, input: &Path, output: &Path) -> Options {
        Options {
            console: Console { quiet: true, verbose: false },
            operation,
            input: input.display().to_string(),
            output: output.display().to_string(),
            vendor: STELLARIS_VID,
            product: DFU_BOOTLOADER_PID,
            device: 0,
            address: 0x1800,
            overwrite: true,
            force: false,
        }
    }

    struct Files {
        dir: tempfile::TempDir,
    }

    impl Files {
        fn new() -> Self {
            Files { dir: tempfile::tempdir().unwrap() }
        }

        fn put(&self, name: &str, data: &[u8]) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, data).unwrap();
            path
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    fn binary() -> Vec<u8> {
        (0..300u32).map(|x| (x * 13) as u8).collect()
    }

    fn no_answer() -> Cursor<&'static str> {
        Cursor::new("")
    }

    #[test]
    fn add_writes_wrapped_image() {
        let files = Files::new();
        let input = files.put("in.bin", &binary());
        let output = files.path("out.dfu");
        let opts = options(Operation::Add, &input, &output);
        assert_eq!(execute(&opts, &mut no_answer()), 0);
        let expected = wrap(&binary(), 0x1800, STELLARIS_VID, DFU_BOOTLOADER_PID, 0);
        assert_eq!(fs::read(&output).unwrap(), expected);
    }

    #[test]
    fn add_refuses_already_wrapped_unless_forced() {
        let files = Files::new();
        let image = wrap(&binary(), 0x1800, STELLARIS_VID, DFU_BOOTLOADER_PID, 0);
        let input = files.put("in.dfu", &image);
        let output = files.path("out.dfu");
        let mut opts = options(Operation::Add, &input, &output);
        assert_eq!(execute(&opts, &mut no_answer()), 5);
        assert!(!output.exists());

        opts.force = true;
        assert_eq!(execute(&opts, &mut no_answer()), 0);
        assert_eq!(fs::read(&output).unwrap().len(), image.len() + 24);
    }

    #[test]
    fn remove_recovers_binary() {
        let files = Files::new();
        let image = wrap(&binary(), 0x1800, STELLARIS_VID, DFU_BOOTLOADER_PID, 0);
        let input = files.put("in.dfu", &image);
        let output = files.path("out.bin");
        assert_eq!(execute(&options(Operation::Remove, &input, &output), &mut no_answer()), 0);
        assert_eq!(fs::read(&output).unwrap(), binary());
    }

    #[test]
    fn remove_rejects_unwrapped_file() {
        let files = Files::new();
        let input = files.put("in.bin", &binary());
        let output = files.path("out.bin");
        assert_eq!(execute(&options(Operation::Remove, &input, &output), &mut no_answer()), 3);
        assert!(!output.exists());
    }

    #[test]
    fn check_needs_prefix_and_suffix() {
        let files = Files::new();
        let output = files.path("unused");
        let image = wrap(&binary(), 0x1800, STELLARIS_VID, DFU_BOOTLOADER_PID, 0);
        let check = |name: &str, data: &[u8]| {
            let input = files.put(name, data);
            execute(&options(Operation::Check, &input, &output), &mut no_answer())
        };
        assert_eq!(check("good.dfu", &image[..]), 0);
        // Prefix only, the suffix has been stripped.
        assert_eq!(check("bare.dfu", &image[..image.len() - 16]), 2);
        let mut bad_crc = image.clone();
        let n = bad_crc.len();
        bad_crc[n - 1] ^= 0xFF;
        assert_eq!(check("crc.dfu", &bad_crc[..]), 2);
        assert!(!output.exists());
    }

    #[test]
    fn missing_input_fails() {
        let files = Files::new();
        let opts = options(Operation::Add, &files.path("absent.bin"), &files.path("out.dfu"));
        assert_eq!(execute(&opts, &mut no_answer()), 1);
    }

    #[test]
    fn output_errors_map_to_codes() {
        let files = Files::new();
        let input = files.put("in.bin", &binary());
        let existing = files.put("out.dfu", b"old");

        let mut opts = options(Operation::Add, &input, &existing);
        opts.overwrite = false;
        // Quiet mode never prompts.
        assert_eq!(execute(&opts, &mut no_answer()), 7);

        opts.console.quiet = false;
        assert_eq!(execute(&opts, &mut Cursor::new("n\n")), 6);
        assert_eq!(fs::read(&existing).unwrap(), b"old");

        let unreachable = files.path("missing").join("out.dfu");
        let opts = options(Operation::Add, &input, &unreachable);
        assert_eq!(execute(&opts, &mut no_answer()), 8);
    }
}
