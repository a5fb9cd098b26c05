//! Command-line client for the homelink controller's TCP command port.

mod link;
mod parse;

use std::time::Duration;

use anyhow::{anyhow, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use homelink_common::{
    engine::request as alarm, led::request as led, AlarmTime, Color, DayMask, Envelope,
    Operation,
};

use crate::link::Link;

#[derive(Debug, Parser)]
#[command(name = "homelink-client", about = "Talk to a homelink controller over TCP")]
struct Cli {
    /// Controller command listener.
    #[arg(long, default_value = "127.0.0.1:3333")]
    addr: String,

    #[arg(long, default_value_t = 3_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Alarm(AlarmCommand),
    #[command(subcommand)]
    Led(LedCommand),
    /// Send up to 128 hex bytes as-is and print the reply bytes.
    Raw { hex: String },
}

#[derive(Debug, Subcommand)]
enum AlarmCommand {
    /// Schedule a trigger command.
    Add(AlarmAdd),
    Remove { index: u8 },
    List,
    /// Show the trigger stored at an index.
    Inspect { index: u8 },
}

#[derive(Debug, Args)]
struct AlarmAdd {
    /// `HH:MM[:SS]`, `sunrise` or `sunset`.
    #[arg(long, value_parser = parse::alarm_time)]
    at: AlarmTime,

    /// `all`, `weekdays`, `weekend` or `mon,wed,...`.
    #[arg(long, default_value = "all", value_parser = parse::days)]
    days: DayMask,

    #[command(flatten)]
    trigger: TriggerArgs,

    /// Fade duration used with `--led-fade`.
    #[arg(long, default_value_t = 1_000)]
    fade_ms: u16,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct TriggerArgs {
    #[arg(long, value_parser = parse::color)]
    led_color: Option<Color>,
    #[arg(long)]
    led_off: bool,
    #[arg(long, value_parser = parse::color)]
    led_fade: Option<Color>,
}

#[derive(Debug, Subcommand)]
enum LedCommand {
    Color {
        #[arg(value_parser = parse::color)]
        rgb: Color,
    },
    Off,
    Fade {
        #[arg(value_parser = parse::color)]
        rgb: Color,
        #[arg(long, default_value_t = 1_000)]
        ms: u16,
    },
    Get,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let command = build(&cli.command)?;
    let mut link = Link::connect(&cli.addr, Duration::from_millis(cli.timeout_ms)).await?;
    let reply = link.exchange(&command).await?;
    println!("{}", render(&cli.command, &reply)?);
    Ok(())
}

fn build(command: &Command) -> anyhow::Result<Envelope> {
    let envelope = match command {
        Command::Alarm(AlarmCommand::Add(add)) => {
            let trigger = build_trigger(&add.trigger, add.fade_ms)?;
            alarm::insert(add.at, add.days, &trigger)?
        }
        Command::Alarm(AlarmCommand::Remove { index }) => alarm::remove(*index)?,
        Command::Alarm(AlarmCommand::List) => alarm::list()?,
        Command::Alarm(AlarmCommand::Inspect { index }) => alarm::inspect(*index)?,
        Command::Led(LedCommand::Color { rgb }) => led::set_color(*rgb)?,
        Command::Led(LedCommand::Off) => led::off()?,
        Command::Led(LedCommand::Fade { rgb, ms }) => led::fade(*rgb, *ms)?,
        Command::Led(LedCommand::Get) => led::get_color()?,
        Command::Raw { hex } => {
            Envelope::from_prefix(&parse::hex_bytes(hex).map_err(anyhow::Error::msg)?)?
        }
    };
    Ok(envelope)
}

fn build_trigger(args: &TriggerArgs, fade_ms: u16) -> anyhow::Result<Envelope> {
    let trigger = match (args.led_color, args.led_off, args.led_fade) {
        (Some(rgb), _, _) => led::set_color(rgb)?,
        (_, true, _) => led::off()?,
        (_, _, Some(rgb)) => led::fade(rgb, fade_ms)?,
        _ => bail!("an alarm needs a trigger"),
    };
    Ok(trigger)
}

/// Human-readable reply. ERROR replies become an `Err` so the exit code is non-zero.
fn render(command: &Command, reply: &Envelope) -> anyhow::Result<String> {
    if let Command::Raw { .. } = command {
        return Ok(parse::to_hex(&reply.to_bytes()));
    }
    if reply.op() == Operation::Error {
        return Err(anyhow!("controller error: {}", reply.body_str()));
    }

    let text = match command {
        Command::Alarm(AlarmCommand::Add(_)) => format!("alarm {} added", reply.body[0]),
        Command::Alarm(AlarmCommand::List) => {
            let entries = alarm::parse_list(reply)?;
            if entries.is_empty() {
                "no alarms".to_string()
            } else {
                entries
                    .iter()
                    .enumerate()
                    .map(|(index, (time, days))| {
                        format!("{index:>2}  {:<8}  {days}", time.to_string())
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        Command::Alarm(AlarmCommand::Inspect { .. }) => {
            let trigger = Envelope::from_prefix(&reply.body)?;
            format!(
                "dest={} {}/{} body={}",
                trigger.dest,
                trigger.op().as_str(),
                trigger.command_id(),
                parse::to_hex(&trigger.body[..8])
            )
        }
        Command::Led(LedCommand::Get) => {
            let state = if reply.body[3] != 0 { "on" } else { "off" };
            format!("{},{},{} {state}", reply.body[0], reply.body[1], reply.body[2])
        }
        _ => match reply.body_str() {
            text if text.is_empty() => "ok".to_string(),
            text => text,
        },
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use homelink_common::TaskId;

    use super::*;

    #[test]
    fn alarm_add_parses_into_an_insert_request() {
        let cli = Cli::try_parse_from([
            "homelink-client",
            "alarm",
            "add",
            "--at",
            "06:45",
            "--days",
            "weekdays",
            "--led-color",
            "255,128,0",
        ])
        .unwrap();

        let command = build(&cli.command).unwrap();
        assert_eq!(command.dest, TaskId::Alarm.raw());
        assert_eq!(command.op(), Operation::Set);
        assert_eq!(command.read_u32(0).unwrap(), 6 * 3600 + 45 * 60);
        assert_eq!(command.body[4], 0b011_1110);
        let trigger = Envelope::from_prefix(&command.body[5..]).unwrap();
        assert_eq!(trigger.dest, TaskId::Led.raw());
        assert_eq!(&trigger.body[..3], &[255, 128, 0]);
    }

    #[test]
    fn alarm_add_requires_exactly_one_trigger() {
        let base = ["homelink-client", "alarm", "add", "--at", "sunrise"];
        assert!(Cli::try_parse_from(base).is_err());
        assert!(Cli::try_parse_from(
            base.iter().copied().chain(["--led-off", "--led-color", "1,2,3"])
        )
        .is_err());
    }

    #[test]
    fn raw_hex_is_zero_padded_to_an_envelope() {
        let cli = Cli::try_parse_from(["homelink-client", "raw", "00 04 42 00 07"]).unwrap();
        let command = build(&cli.command).unwrap();
        assert_eq!(command.dest, TaskId::Led.raw());
        assert_eq!(command.op(), Operation::Get);
        assert_eq!(command.body[0], 7);
        assert!(build(&Command::Raw { hex: "zz".to_string() }).is_err());
    }

    #[test]
    fn error_replies_fail_rendering() {
        let command = Command::Led(LedCommand::Off);
        let reply = led::off().unwrap().error_reply("destination mailbox full");
        let err = render(&command, &reply).unwrap_err();
        assert!(err.to_string().contains("destination mailbox full"));
    }

    #[test]
    fn list_replies_render_one_line_per_alarm() {
        let mut reply = Envelope::default();
        reply.header = alarm::list().unwrap().header.with_op(Operation::Response);
        reply.body[0] = 1;
        reply.write_u32(1, AlarmTime::Sunset.raw()).unwrap();
        reply.body[5] = DayMask::ALL.bits();

        let text = render(&Command::Alarm(AlarmCommand::List), &reply).unwrap();
        assert_eq!(text, " 0  sunset    SMTWTFS");
    }

    #[test]
    fn led_state_is_shown_with_power() {
        let mut reply = Envelope::default();
        reply.header = led::get_color().unwrap().header.with_op(Operation::Response);
        reply.body[..4].copy_from_slice(&[10, 20, 30, 1]);

        let text = render(&Command::Led(LedCommand::Get), &reply).unwrap();
        assert_eq!(text, "10,20,30 on");
    }
}
