use std::io::{self, BufRead, Write};
use std::process;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use clap::{App, Arg};
use lmdfu::{Result, BulkTransport};
use lmdfu::cli;
use lmdfu::scope::{self, Capture, Channel, ScopeClient, ScopeEvent, ScopeSettings, TriggerType};

const COMMANDS: &str = "\
Commands:
   start | stop             Start or stop continuous capture
   capture                  Capture a single waveform
   ch2 on|off               Enable or disable channel 2
   timebase <us/div>        Set the timebase
   level <mV>               Set the trigger level
   trigpos <pixels>         Set the trigger position, -60 to 60
   trigger <1|2> <type>     Set trigger channel and type
                            (level, rising, falling, always)
   pos <1|2> <mV>           Set a channel's vertical position
   scale <1|2> <mV/div>     Set a channel's scale
   find <1|2>               Centre a channel's waveform
   auto on|off              Automatic data transmission
   retransmit               Ask for the last capture again
   ping                     Ping the device
   help                     Show this list
   quit                     Exit
";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Capture,
    Channel2(bool),
    Timebase(u32),
    Level(u32),
    TriggerPos(i32),
    Trigger(Channel, TriggerType),
    Position(Channel, i32),
    Scale(Channel, u32),
    Find(Channel),
    Auto(bool),
    Retransmit,
    Ping,
    Help,
    Quit,
}

fn parse_channel(s: &str) -> Option<Channel> {
    match s {
        "1" => Some(Channel::One),
        "2" => Some(Channel::Two),
        _ => None,
    }
}

fn parse_switch(s: &str) -> Option<bool> {
    match s {
        "on" | "1" => Some(true),
        "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_trigger(s: &str) -> Option<TriggerType> {
    match s {
        "level" => Some(TriggerType::Level),
        "rising" => Some(TriggerType::Rising),
        "falling" => Some(TriggerType::Falling),
        "always" => Some(TriggerType::Always),
        _ => None,
    }
}

fn parse_signed(s: &str) -> Option<i32> {
    match s.strip_prefix('-') {
        Some(rest) => cli::parse_number(rest).map(|n| -(n as i64) as i32),
        None => cli::parse_number(s).map(|n| n as i32),
    }
}

fn parse_command(line: &str) -> Option<Command> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let command = match words.as_slice() {
        ["start"] => Command::Start,
        ["stop"] => Command::Stop,
        ["capture"] => Command::Capture,
        ["ch2", on] => Command::Channel2(parse_switch(on)?),
        ["timebase", us] => Command::Timebase(cli::parse_number(us)?),
        ["level", mv] => Command::Level(cli::parse_number(mv)?),
        ["trigpos", pos] => Command::TriggerPos(parse_signed(pos)?),
        ["trigger", ch, kind] => Command::Trigger(parse_channel(ch)?, parse_trigger(kind)?),
        ["pos", ch, mv] => Command::Position(parse_channel(ch)?, parse_signed(mv)?),
        ["scale", ch, mv] => Command::Scale(parse_channel(ch)?, cli::parse_number(mv)?),
        ["find", ch] => Command::Find(parse_channel(ch)?),
        ["auto", on] => Command::Auto(parse_switch(on)?),
        ["retransmit"] => Command::Retransmit,
        ["ping"] => Command::Ping,
        ["help"] | ["?"] => Command::Help,
        ["quit"] | ["exit"] => Command::Quit,
        _ => return None,
    };
    Some(command)
}

fn run_command<B: BulkTransport>(client: &ScopeClient<B>, command: Command, ping: u8) -> Result<()> {
    match command {
        Command::Start => client.start_stop(true),
        Command::Stop => client.start_stop(false),
        Command::Capture => client.capture(),
        Command::Channel2(on) => client.enable_channel2(on),
        Command::Timebase(us) => client.set_timebase(us),
        Command::Level(mv) => client.set_trigger_level(mv),
        Command::TriggerPos(pos) => client.set_trigger_pos(pos),
        Command::Trigger(ch, kind) => client.set_trigger(ch, kind),
        Command::Position(ch, mv) => client.set_position(ch, mv),
        Command::Scale(ch, mv) => client.set_scale(ch, mv),
        Command::Find(ch) => client.find(ch),
        Command::Auto(on) => client.automatic_data(on),
        Command::Retransmit => client.request_data(),
        Command::Ping => client.ping(ping, ping as u32 * 0x0101_0101),
        Command::Help | Command::Quit => Ok(()),
    }
}

fn print_settings(settings: &ScopeSettings) {
    println!("  Timebase:        {} us/div", settings.timebase_us);
    println!("  Trigger:         {:?} on {:?}, {} mV, position {}",
             settings.trigger(), settings.trigger_channel(),
             settings.trigger_level_mv, settings.trigger_pos);
    println!("  Channel 1:       {} mV/div, offset {} mV",
             settings.ch1_scale_mv, settings.ch1_offset_mv);
    println!("  Channel 2:       {} mV/div, offset {} mV, {}",
             settings.ch2_scale_mv, settings.ch2_offset_mv,
             if settings.channel2_enabled { "enabled" } else { "disabled" });
    println!("  Capture:         {}", if settings.started { "running" } else { "stopped" });
}

fn print_capture(capture: &Capture, verbose: bool) {
    println!("Capture: {} elements ({}), {} us/sample, trigger at {}",
             capture.len(), if capture.start.dual_channel { "dual" } else { "single" },
             capture.start.sample_offset_us, capture.start.trigger_index);
    if !capture.is_complete() {
        println!("  incomplete, expected {} elements", capture.start.total_elements);
    }
    for channel in &[Channel::One, Channel::Two] {
        let samples = capture.channel(*channel);
        let min = samples.iter().map(|s| s.1).min();
        let max = samples.iter().map(|s| s.1).max();
        if let (Some(min), Some(max)) = (min, max) {
            println!("  {:?}: {} to {} mV", channel, min, max);
        }
        if verbose {
            for (time, mv) in &samples {
                println!("    {:8} us {:6} mV", time, mv);
            }
        }
    }
}

fn print_event(event: &ScopeEvent, verbose: bool) {
    match event {
        ScopeEvent::DeviceAvailable => println!("Oscilloscope found, connecting..."),
        ScopeEvent::Connected(settings) => {
            println!("Connected to oscilloscope.");
            print_settings(settings);
        },
        ScopeEvent::Disconnected => println!("Oscilloscope disconnected."),
        ScopeEvent::Data(capture) => print_capture(capture, verbose),
        ScopeEvent::PingResponse { echo1, echo2 } =>
            println!("Ping response {} 0x{:08x}", echo1, echo2),
        ScopeEvent::Started => println!("Capture started."),
        ScopeEvent::Stopped => println!("Capture stopped."),
        ScopeEvent::TimebaseChanged(us) => println!("Timebase {} us/div", us),
        ScopeEvent::TriggerTypeChanged { channel, trigger } =>
            println!("Trigger {:?} on {:?}", trigger, channel),
        ScopeEvent::TriggerLevelChanged(mv) => println!("Trigger level {} mV", mv),
        ScopeEvent::TriggerPosChanged(pos) => println!("Trigger position {}", pos),
        ScopeEvent::Channel2(on) => println!("Channel 2 {}", if *on { "enabled" } else { "disabled" }),
        ScopeEvent::ScaleChanged { channel, scale_mv } =>
            println!("{:?} scale {} mV/div", channel, scale_mv),
        ScopeEvent::PositionChanged { channel, position_mv } =>
            println!("{:?} position {} mV", channel, position_mv),
    }
}

/// Connect, take one capture, print it and leave.
fn single_capture(verbose: bool) -> Result<()> {
    let context = rusb::Context::new()?;
    let client = ScopeClient::new(scope::open_scope(&context)?);
    let settings = client.connect(Duration::from_millis(2000))?;
    print_settings(&settings);
    client.capture()?;
    let capture = client.read_capture(Duration::from_millis(5000))?;
    print_capture(&capture, verbose);
    client.goodbye()
}

fn interactive(verbose: bool) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let monitor = scope::monitor_usb(tx)?;
    let printer = thread::spawn(move || {
        for event in rx {
            print_event(&event, verbose);
        }
    });

    println!("Waiting for an oscilloscope. Type \"help\" for a list of commands.");
    let stdin = io::stdin();
    let mut ping = 0u8;
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Some(command) => command,
            None => {
                println!("Unrecognised command: {}", line.trim());
                continue;
            },
        };
        match command {
            Command::Quit => break,
            Command::Help => print!("{}", COMMANDS),
            _ => match monitor.client() {
                Some(client) => {
                    ping = ping.wrapping_add(1);
                    if let Err(e) = run_command(&client, command, ping) {
                        println!("Error: {}", e);
                    }
                },
                None => println!("No oscilloscope connected."),
            },
        }
        let _ = io::stdout().flush();
    }

    monitor.stop();
    if printer.join().is_err() {
        tracing::warn!("Event printer panicked");
    }
    Ok(())
}

fn main() {
    let matches = App::new("lmscope")
        .about("Console client for the Stellaris USB oscilloscope")
        .after_help(COMMANDS)
        .arg(Arg::with_name("single").short("s").long("single")
             .help("Take a single capture, print it and exit"))
        .arg(Arg::with_name("verbose").short("v")
             .help("Print every sample and enable debug logging"))
        .get_matches();
    let verbose = matches.is_present("verbose");
    cli::init_logging(verbose);

    let result = if matches.is_present("single") {
        single_capture(verbose)
    } else {
        interactive(verbose)
    };
    if let Err(e) = result {
        println!("Error: {}", e);
        for cause in e.iter_causes() {
            println!("  caused by: {}", cause);
        }
        process::exit(1);
    }
}
