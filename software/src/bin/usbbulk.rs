use std::io::{self, BufRead, Write};
use std::process;
use clap::{App, AppSettings, Arg};
use lmdfu::BulkTransport;
use lmdfu::bulk::{self, Input};
use lmdfu::cli;

fn app() -> App<'static, 'static> {
    App::new("usbbulk")
        .about("Partner application for the Stellaris generic bulk USB device")
        .setting(AppSettings::DisableVersion)
        .arg(Arg::with_name("echo").short("e")
             .help("Echo all data received on the bulk IN endpoint back to the OUT endpoint"))
        .arg(Arg::with_name("verbose").short("v")
             .help("Enable verbose output"))
}

fn interactive<B: BulkTransport>(pipe: &B) {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    loop {
        print!("\nEnter a string (EXIT to exit): ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => (),
        }
        println!();
        let text = match Input::parse(&line) {
            Input::Empty => {
                println!("\nPlease enter some text.");
                continue;
            },
            Input::Exit => {
                println!("Exiting on user request.");
                break;
            },
            Input::Text(text) => text,
        };
        match bulk::exchange(pipe, text.as_bytes()) {
            Ok(result) => {
                println!("Wrote {} bytes to the device. Expected {}", result.written, text.len());
                println!("Read {} bytes from device. Expected {}", result.reply.len(), result.written);
                println!("\nReturned string: \"{}\"", String::from_utf8_lossy(&result.reply));
                if result.reply != bulk::invert_case(text.as_bytes()) {
                    tracing::debug!("Reply is not the case-inverted input");
                }
            },
            Err(e) => println!("{}", e),
        }
    }
}

fn echo<B: BulkTransport>(pipe: &B) {
    println!("Running in echo mode. Press Ctrl+C to exit.\n");
    let e = bulk::echo(pipe, |report| {
        print!("\r{:6}Kbps Packets: {:10} ", report.kbps, report.packets);
        let _ = io::stdout().flush();
    });
    println!("\n\n{}.", e);
}

fn main() {
    let matches = app().get_matches();
    let echo_mode = matches.is_present("echo");
    cli::init_logging(matches.is_present("verbose"));

    println!("\nStellaris Bulk USB Device Example");
    println!("---------------------------------\n");
    println!("Version {}\n", env!("CARGO_PKG_VERSION"));
    if !echo_mode {
        println!("This is a partner application to the usb_dev_bulk example");
        println!("shipped with StellarisWare software releases for USB-enabled");
        println!("boards. Strings entered here are sent to the board which");
        println!("inverts the case of the characters in the string and returns");
        println!("them to the host.\n");
    } else {
        println!("If run with the \"-e\" command line switch, this application");
        println!("echoes all data received on the bulk IN endpoint to the bulk");
        println!("OUT endpoint.  This feature may be helpful during development");
        println!("and debug of your own USB devices.  Note that this will not");
        println!("do anything exciting if run with the usb_dev_bulk example");
        println!("device attached since it expects the host to initiate transfers.\n");
    }

    let pipe = match rusb::Context::new().map_err(failure::Error::from)
                                         .and_then(|context| bulk::open_bulk(&context))
    {
        Ok(pipe) => pipe,
        Err(e) => {
            println!("\nUnable to initialize the Stellaris Bulk USB Device.");
            println!("Error: {}\n", e);
            println!("Please make sure you have a Stellaris USB-enabled evaluation");
            println!("or development kit running the usb_dev_bulk example");
            println!("application connected to this system via the \"USB OTG\" or");
            println!("\"USB DEVICE\" connectors. Once the device is connected, run");
            println!("this application again.\n");
            print!("\nPress \"Enter\" to exit: ");
            let _ = io::stdout().flush();
            let mut line = String::new();
            let _ = io::stdin().lock().read_line(&mut line);
            println!();
            process::exit(2);
        },
    };

    if echo_mode {
        echo(&pipe);
    } else {
        interactive(&pipe);
    }
}
