use std::fs;
use std::io;
use std::path::Path;
use std::process;
use clap::{App, AppSettings, Arg, ArgMatches};
use lmdfu::{ControlTransport, DFUDevice, DFUMode, DeviceSummary, NoProgress,
            DFUError, dfu_error};
use lmdfu::cli::{self, Console, WriteError};

const HELP: &str = "\
This application may be used to download images to a Texas Instruments
Stellaris microcontroller running the USB Device Firmware Upgrade
boot loader.  Additionally, the application can read back the
existing application image or a subsection of flash and store it
either as raw data or wrapped as a DFU-downloadable image.

Examples:

   dfuprog -f program.bin -a 0x1800

Writes binary file program.bin to the device at address 0x1800

   dfuprog -i 1 -f program.dfu

Writes DFU-formatted file program.dfu to the second connected
device (index 1) at the address found in the DFU file prefix.

   dfuprog -u -f appimage.dfu

Reads the current board application image into DFU-formatted file
appimage.dfu
";

fn app() -> App<'static, 'static> {
    App::new("dfuprog")
        .about("USB Device Firmware Upgrade programmer for Stellaris devices")
        .after_help(HELP)
        .setting(AppSettings::DisableHelpFlags)
        .setting(AppSettings::DisableVersion)
        .arg(Arg::with_name("enumerate").short("e")
             .help("Enumerate connected devices, show info then exit"))
        .arg(Arg::with_name("mode").short("m")
             .help("Switch into DFU mode if device is currently in runtime mode"))
        .arg(Arg::with_name("upload").short("u")
             .help("Upload an image from the board into the target file"))
        .arg(Arg::with_name("clear").short("c")
             .help("Clear a block of flash given by -a and -l, or all writable flash"))
        .arg(Arg::with_name("file").short("f").takes_value(true).value_name("file")
             .help("The file name for upload or download use"))
        .arg(Arg::with_name("binary").short("b")
             .help("Upload binary rather than a DFU-formatted file"))
        .arg(Arg::with_name("disregard").short("d")
             .help("Disregard VID and PID in DFU image to be downloaded"))
        .arg(Arg::with_name("skip-verify").short("s")
             .help("Skip verification after a download operation"))
        .arg(Arg::with_name("address").short("a").takes_value(true).value_name("num")
             .help("Address the binary will be flashed to or read from"))
        .arg(Arg::with_name("length").short("l").takes_value(true).value_name("num")
             .help("Upload length; defaults to the whole writable flash area"))
        .arg(Arg::with_name("index").short("i").takes_value(true).value_name("num")
             .help("Index of the DFU device to access if more than one is found"))
        .arg(Arg::with_name("overwrite").short("x")
             .help("Overwrite existing file without prompting"))
        .arg(Arg::with_name("reset").short("r")
             .help("Reset the target on completion of operation"))
        .arg(Arg::with_name("quiet").short("q")
             .help("Quiet mode, disable output to stdio"))
        .arg(Arg::with_name("wait").short("w")
             .help("Wait for a key press before exiting"))
        .arg(Arg::with_name("verbose").short("v")
             .help("Enable verbose output"))
        .arg(Arg::with_name("help").short("h")
             .help("Show this help"))
        .arg(Arg::with_name("help2").short("?").hidden(true))
}

/// Settings gathered from the command line.
struct Options {
    console: Console,
    enumerate: bool,
    switch_mode: bool,
    upload: bool,
    clear: bool,
    binary: bool,
    disregard_ids: bool,
    skip_verify: bool,
    overwrite: bool,
    reset: bool,
    file: Option<String>,
    address: Option<u32>,
    length: u32,
    index: usize,
}

impl Options {
    fn from_matches(matches: &ArgMatches, console: Console) -> Option<Self> {
        let number = |name: &str| -> Option<Option<u32>> {
            match matches.value_of(name) {
                Some(s) => match cli::parse_number(s) {
                    Some(n) => Some(Some(n)),
                    None => {
                        console.say(format_args!("Invalid number for -{}: {}\n",
                                                 &name[..1], s));
                        None
                    },
                },
                None => Some(None),
            }
        };
        Some(Options {
            console,
            enumerate: matches.is_present("enumerate"),
            switch_mode: matches.is_present("mode"),
            upload: matches.is_present("upload"),
            clear: matches.is_present("clear"),
            binary: matches.is_present("binary"),
            disregard_ids: matches.is_present("disregard"),
            skip_verify: matches.is_present("skip-verify"),
            overwrite: matches.is_present("overwrite"),
            reset: matches.is_present("reset"),
            file: matches.value_of("file").map(String::from),
            address: number("address")?,
            length: number("length")?.unwrap_or(0),
            index: number("index")?.unwrap_or(0) as usize,
        })
    }
}

fn exit(wait: bool, code: i32) -> ! {
    if wait {
        println!("\nPress enter to exit...");
        let mut line = String::new();
        let _ = io::stdin().read_line(&mut line);
    }
    process::exit(code);
}

fn error_code(e: &failure::Error) -> i32 {
    dfu_error(e).map(DFUError::code).unwrap_or(-4)
}

fn print_device(console: &Console, summary: &DeviceSummary) {
    let text = |s: &Option<String>| s.clone().unwrap_or_else(|| "<<Unknown>>".to_string());
    let yes_no = |b: bool| if b { "Yes" } else { "No" };
    console.say(format_args!("VID: 0x{:04x}    PID: 0x{:04x}\n", summary.vid, summary.pid));
    console.say(format_args!("Device Name:   {}\n", text(&summary.product)));
    console.say(format_args!("Manufacturer:  {}\n", text(&summary.manufacturer)));
    console.say(format_args!("DFU Interface: {}\n", text(&summary.interface_name)));
    console.say(format_args!("Serial Num:    {}\n", text(&summary.serial)));
    console.say(format_args!("Max Transfer:  {} bytes\n", summary.interface.transfer_size));
    console.say(format_args!("Mode:          {}\n", summary.mode()));
    if summary.mode() == DFUMode::DFU {
        console.say(format_args!("TI Extensions: {}\n",
            if summary.stellaris.is_some() { "Supported" } else { "Not Supported" }));
        if let Some((part, revision)) = summary.target() {
            console.say(format_args!("Target:        {} revision {}\n", part, revision));
        }
    }
    let iface = &summary.interface;
    console.say(format_args!("Attributes:\n"));
    console.say(format_args!("   Will Detach:       {}\n", yes_no(iface.will_detach())));
    console.say(format_args!("   Manifest Tolerant: {}\n", yes_no(iface.manifest_tolerant())));
    console.say(format_args!("   Upload Capable:    {}\n", yes_no(iface.can_upload())));
    console.say(format_args!("   Download Capable:  {}\n", yes_no(iface.can_download())));
}

fn upload<T: ControlTransport>(device: &mut DFUDevice<T>, opts: &Options, file: &str) -> i32 {
    let console = &opts.console;
    console.say(format_args!("Uploading from device to {}...\n", file));
    let info = match device.stellaris_info() {
        Some(info) => *info,
        None => {
            console.say(format_args!("Target device does not support Stellaris protocol.\n"));
            return 40;
        },
    };
    let address = opts.address.unwrap_or(info.app_start_addr);
    let length = match opts.length {
        0 => info.flash_top.saturating_sub(address),
        n => n,
    };
    let total = length + if opts.binary { 0 } else { 24 };
    let data = match device.upload(address, total, opts.binary, &mut NoProgress) {
        Ok(data) => data,
        Err(e) => {
            tracing::debug!("Upload failed: {}", e);
            console.say(format_args!("Error uploading {} bytes from 0x{:08x}!\n",
                                     total, address));
            return 42;
        },
    };
    let stdin = io::stdin();
    match cli::write_output(Path::new(file), &data, opts.overwrite, console, &mut stdin.lock()) {
        Ok(()) => 0,
        Err(WriteError::Exists) => 43,
        Err(WriteError::Declined) => 44,
        Err(WriteError::Open(e)) => {
            tracing::debug!("{}", e);
            console.say(format_args!("Error opening output file for writing.\n"));
            45
        },
        Err(WriteError::Write(e)) => {
            console.say(format_args!("Error writing output: {}.\n", e));
            46
        },
    }
}

fn download<T: ControlTransport>(device: &mut DFUDevice<T>, opts: &Options, file: &str) -> i32 {
    let console = &opts.console;
    console.say(format_args!("Downloading {} to device...\n", file));
    let data = match fs::read(file) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            console.say(format_args!("Unable to open file {}. Does it exist?\n", file));
            return 10;
        },
        Err(e) => {
            tracing::debug!("{}", e);
            console.say(format_args!("Error reading input file!\n"));
            return 12;
        },
    };
    let verify = !opts.skip_verify;
    let result = match device.check_image(&data) {
        Ok((_, false)) if !opts.disregard_ids => {
            console.say(format_args!("This image does not appear to be valid for the target \
                                      device.\nUse -d to disregard embedded IDs\n"));
            return 14;
        },
        Ok((image, _)) if image.is_stellaris() => {
            console.detail(format_args!("Image contains valid DFU suffix and Stellaris prefix.\n"));
            console.detail(format_args!("Downloading image to flash.... "));
            device.download(&data, verify, opts.disregard_ids, &mut NoProgress)
        },
        Ok((image, _)) => download_binary(device, opts, image.without_suffix(), verify),
        Err(_) => download_binary(device, opts, &data, verify),
    };
    console.detail(format_args!("Completed.\n"));
    match result {
        Ok(()) => 0,
        Err(e) => {
            console.say(format_args!("Error {} ({}) reported during file download\n",
                                     e, error_code(&e)));
            13
        },
    }
}

fn download_binary<T: ControlTransport>(device: &mut DFUDevice<T>, opts: &Options, data: &[u8],
                   verify: bool) -> lmdfu::Result<()>
{
    opts.console.detail(format_args!("Image is not fully DFU-wrapped. Downloading as binary\n"));
    opts.console.detail(format_args!("Downloading image to flash.... "));
    let address = opts.address
                      .or_else(|| device.stellaris_info().map(|info| info.app_start_addr))
                      .unwrap_or(0);
    device.download_bin(data, address, verify, &mut NoProgress)
}

fn clear<T: ControlTransport>(device: &mut DFUDevice<T>, opts: &Options) -> i32 {
    let console = &opts.console;
    let address = opts.address.unwrap_or(0);
    if address != 0 {
        console.say(format_args!("Clearing {}KB flash block from address 0x{:08x}\n",
                                 opts.length / 1024, address));
    } else {
        console.say(format_args!("Clearing entire writable region of flash.\n"));
    }
    match device.erase(address, opts.length, true) {
        Ok(()) => {
            console.say(format_args!("Flash erased successfully.\n"));
            0
        },
        Err(e) => {
            console.say(format_args!("Error {} ({}) erasing flash!\n", e, error_code(&e)));
            20
        },
    }
}

/// Run the requested operation on the selected device. Returns the exit code.
fn operate<T: ControlTransport>(mut device: DFUDevice<T>, opts: &Options, index: usize) -> i32 {
    let console = &opts.console;
    if device.mode() == DFUMode::Runtime {
        if opts.switch_mode {
            console.say(format_args!("\n<<<< Device {} >>>>\n\n", index));
            print_device(console, &device.summary());
            console.say(format_args!("Switching device into DFU mode.\n"));
            device.mode_switch();
            return 100;
        }
        console.say(format_args!("Device is in runtime mode. Switch to DFU mode using \
                                  '-m' before\nattempting any other operation\n"));
        return 0;
    }
    if opts.switch_mode {
        console.say(format_args!("Device is already in DFU mode. No switch necessary.\n"));
    }
    let params = match device.stellaris_info() {
        Some(_) => device.params().map(|_| ()),
        None => Ok(()),
    };
    let code = if let Err(e) = params {
        console.say(format_args!("Error {} ({}) reading flash parameters.\n",
                                 e, error_code(&e)));
        0
    } else if opts.clear {
        clear(&mut device, opts)
    } else if let Some(file) = &opts.file {
        if opts.upload {
            upload(&mut device, opts, file)
        } else {
            download(&mut device, opts, file)
        }
    } else {
        0
    };
    if let Err(e) = device.close(opts.reset) {
        tracing::debug!("Error closing device: {}", e);
    }
    code
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
    let wait = matches.is_present("wait");

    console.say(format_args!("\nUSB Device Firmware Upgrade Example\n\n"));
    if matches.is_present("help") || matches.is_present("help2") {
        if !console.quiet {
            let _ = app().print_help();
            println!();
        }
        exit(wait, 0);
    }
    let opts = match Options::from_matches(&matches, console) {
        Some(opts) => opts,
        None => exit(wait, 1),
    };

    if opts.enumerate {
        if opts.index != 0 || opts.length != 0 || opts.address.is_some() || opts.binary ||
           opts.file.is_some() || opts.upload || opts.clear || opts.switch_mode
        {
            console.say(format_args!("Some options ignored - irrelevant when used with -e.\n"));
        }
    } else if !opts.clear && !opts.switch_mode && opts.file.is_none() {
        if !console.quiet {
            let _ = app().print_help();
            println!();
        }
        console.say(format_args!("ERROR: No file name was specified. Please use -f \
                                  to provide one.\n"));
        exit(wait, 1);
    }

    let context = match rusb::Context::new() {
        Ok(context) => context,
        Err(e) => {
            println!("Unable to initialise libusb: {}", e);
            exit(wait, 10);
        },
    };

    console.say(format_args!("Scanning USB buses for supported DFU devices...\n\n"));
    let devices = match DFUDevice::enumerate(&context) {
        Ok(devices) => devices,
        Err(e) => {
            println!("Error scanning USB devices: {}", e);
            exit(wait, 12);
        },
    };

    if opts.enumerate {
        let count = devices.len();
        for (index, device) in devices.into_iter().enumerate() {
            console.say(format_args!("\n<<<< Device {} >>>>\n\n", index));
            print_device(&console, &device.summary());
            if let Err(e) = device.close(opts.reset) {
                tracing::debug!("Error closing device {}: {}", index, e);
            }
        }
        console.say(format_args!("\nFound {} device{}.\n", count,
                                 if count == 1 { "" } else { "s" }));
        exit(wait, 0);
    }

    let index = opts.index;
    match devices.into_iter().nth(index) {
        Some(device) => {
            let code = operate(device, &opts, index);
            exit(wait, code);
        },
        None => {
            console.say(format_args!("The requested device was not found on the bus.\n"));
            exit(wait, 1);
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use lmdfu::{Result, STELLARIS_VID, DFU_BOOTLOADER_PID};

    /// A Stellaris DFU device that answers the protocol query but stalls
    /// every UPLOAD, so its flash parameters can never be read.
    struct NoInfoTransport {
        dnloads: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl ControlTransport for NoInfoTransport {
        fn control_in(&self, request_type: u8, request: u8, value: u16, _index: u16,
                      buf: &mut [u8]) -> Result<usize>
        {
            let vid = STELLARIS_VID.to_le_bytes();
            let pid = DFU_BOOTLOADER_PID.to_le_bytes();
            let reply: Vec<u8> = match (request_type, request, value >> 8) {
                (0x80, 6, 1) => vec![18, 1, 0x00, 0x02, 0, 0, 0, 64, vid[0], vid[1],
                                     pid[0], pid[1], 0x00, 0x02, 0, 0, 0, 1],
                (0x80, 6, 2) => vec![9, 2, 27, 0, 1, 1, 0, 0x80, 50,
                                     9, 4, 0, 0, 0, 0xFE, 0x01, 2, 0,
                                     9, 0x21, 0x0B, 0xFF, 0x00, 0x00, 0x04, 0x10, 0x01],
                (0xA1, 0x42, _) => vec![0x4D, 0x4C, 0x01, 0x00],
                // GETSTATUS, always OK and idle.
                (0xA1, 3, _) => vec![0, 0, 0, 0, 2, 0],
                _ => Err(DFUError::Stall)?,
            };
            let n = reply.len().min(buf.len());
            buf[..n].copy_from_slice(&reply[..n]);
            Ok(n)
        }

        fn control_out(&self, _request_type: u8, request: u8, _value: u16, _index: u16,
                       data: &[u8]) -> Result<usize>
        {
            if request == 1 {
                self.dnloads.borrow_mut().push(data.to_vec());
            }
            Ok(data.len())
        }
    }

    fn options(reset: bool) -> Options {
        Options {
            console: Console { quiet: true, verbose: false },
            enumerate: false,
            switch_mode: false,
            upload: false,
            clear: false,
            binary: false,
            disregard_ids: false,
            skip_verify: false,
            overwrite: false,
            reset,
            file: None,
            address: None,
            length: 0,
            index: 0,
        }
    }

    fn device() -> (DFUDevice<NoInfoTransport>, Rc<RefCell<Vec<Vec<u8>>>>) {
        let dnloads = Rc::new(RefCell::new(Vec::new()));
        let device = DFUDevice::from_transport(NoInfoTransport { dnloads: dnloads.clone() })
                        .unwrap();
        assert!(device.stellaris_info().is_some());
        dnloads.borrow_mut().clear();
        (device, dnloads)
    }

    #[test]
    fn failed_parameter_read_still_resets() {
        let (device, dnloads) = device();
        assert_eq!(operate(device, &options(true), 0), 0);
        let sent = dnloads.borrow();
        // The INFO request that failed, then the reset on close.
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0][0], 5);
        assert_eq!(sent[1], vec![7, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn failed_parameter_read_without_reset() {
        let (device, dnloads) = device();
        assert_eq!(operate(device, &options(false), 0), 0);
        assert_eq!(dnloads.borrow().len(), 1);
    }
}
