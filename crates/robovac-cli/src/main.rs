//! Command-line tool for robotic vacuums on the local network.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use robovac_sdk::config::env_vars;
use robovac_sdk::discovery::{self, RobotInfo};
use robovac_sdk::password::{fetch_password_v1, fetch_password_v2, V1Credentials};
use robovac_sdk::{
    local, CarpetBoost, CleaningPasses, Local, LocalConfig, Preference, ProtocolVersion,
    RobotCommand, SessionEvent,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

const PAIRING_INSTRUCTIONS: &str = "Make sure your robot is on the Home Base and powered on \
(green lights on). Then press and hold the HOME button on your robot until it plays a series \
of tones (about 2 seconds). Release the button and your robot will flash WIFI light.";

/// Find, pair and drive robotic vacuums on the local network.
#[derive(Parser, Debug)]
#[command(name = "robovac")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Connection settings for commands that talk to one robot.
#[derive(ClapArgs, Debug)]
struct RobotArgs {
    /// Robot address.
    #[arg(long, env = env_vars::ROBOT_IP)]
    ip: String,

    /// Robot blid (username).
    #[arg(long, env = env_vars::ROBOT_BLID)]
    blid: String,

    /// Robot password.
    #[arg(long, env = env_vars::ROBOT_PASSWORD, hide_env_values = true)]
    password: String,

    /// Local protocol version (1 or 2).
    #[arg(long, default_value = "2")]
    firmware: ProtocolVersion,

    /// Give up on reads after this many seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

impl RobotArgs {
    fn config(&self) -> LocalConfig {
        LocalConfig::from_env(&self.blid, &self.password, &self.ip)
            .with_read_timeout(Duration::from_secs(self.timeout))
    }

    async fn connect(&self) -> Result<Local> {
        local(self.config(), self.firmware)
            .await
            .with_context(|| format!("Failed to connect to robot at {}", self.ip))
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast a discovery probe and print the first robot that answers.
    Discover {
        /// Seconds to wait for an answer.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Print the public information of the robot at an address.
    Info {
        /// Robot address.
        ip: String,
        /// Seconds to wait for an answer.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Read the blid and password of a robot in pairing mode.
    GetPassword {
        /// Robot address.
        ip: String,
        /// Firmware generation (1 or 2).
        #[arg(long, default_value = "2")]
        firmware: ProtocolVersion,
        /// Do not wait for Enter before contacting the robot.
        #[arg(long)]
        no_wait: bool,
    },
    /// Print the robot state once the given properties are known.
    State {
        #[command(flatten)]
        robot: RobotArgs,
        /// Properties to wait for (v2 only).
        #[arg(default_values_t = vec!["batPct".to_string()])]
        fields: Vec<String>,
    },
    /// Print the current mission.
    Mission {
        #[command(flatten)]
        robot: RobotArgs,
    },
    /// Send an action (start, clean, pause, stop, resume, dock, evac, train).
    Command {
        #[command(flatten)]
        robot: RobotArgs,
        /// Action to send.
        action: RobotCommand,
    },
    /// Change a cleaning preference.
    Preference {
        #[command(flatten)]
        robot: RobotArgs,
        /// carpet-boost, edge-clean, cleaning-passes or always-finish.
        setting: String,
        /// auto/performance/eco, on/off or auto/1/2 depending on the setting.
        value: String,
    },
    /// Stream session events as JSON lines (v2 only).
    Watch {
        #[command(flatten)]
        robot: RobotArgs,
        /// Stop after this many events.
        #[arg(long)]
        count: Option<usize>,
        /// Include raw update messages.
        #[arg(long)]
        raw: bool,
    },
}

fn init_tracing(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let level = if verbose { "debug" } else { "warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("robovac={level},robovac_sdk={level}"))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Command::Discover { timeout } => run_discover(timeout).await,
        Command::Info { ip, timeout } => run_info(&ip, timeout).await,
        Command::GetPassword {
            ip,
            firmware,
            no_wait,
        } => run_get_password(&ip, firmware, no_wait).await,
        Command::State { robot, fields } => run_state(&robot, &fields).await,
        Command::Mission { robot } => run_mission(&robot).await,
        Command::Command { robot, action } => run_command(&robot, action).await,
        Command::Preference {
            robot,
            setting,
            value,
        } => run_preference(&robot, &setting, &value).await,
        Command::Watch { robot, count, raw } => run_watch(&robot, count, raw).await,
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_robot(robot: &RobotInfo) -> Result<()> {
    print_json(&robot.to_json())
}

async fn run_discover(timeout: u64) -> Result<()> {
    eprintln!("Looking for robots...");
    let robot = discovery::discover(Duration::from_secs(timeout))
        .await
        .context("No robot answered the discovery probe")?;
    eprintln!("Robot found! with blid/username: {}", robot.blid);
    print_robot(&robot)
}

async fn run_info(ip: &str, timeout: u64) -> Result<()> {
    let robot = discovery::robot_public_info(ip, Duration::from_secs(timeout))
        .await
        .with_context(|| format!("Robot at {} did not answer", ip))?;
    print_robot(&robot)
}

async fn wait_for_enter() -> Result<()> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read from stdin")?;
    Ok(())
}

async fn run_get_password(ip: &str, firmware: ProtocolVersion, no_wait: bool) -> Result<()> {
    println!("{}", PAIRING_INSTRUCTIONS);

    match firmware {
        ProtocolVersion::V1 => {
            println!("Then wait and look here...");
            let V1Credentials { blid, password } =
                fetch_password_v1(ip, Duration::from_secs(10))
                    .await
                    .context(
                        "Timeout getting password. Is the robot set up and is its IP correct?",
                    )?;
            println!("Password: {}", password);
            println!("Username/blid: {}", blid);
        }
        ProtocolVersion::V2 => {
            if !no_wait {
                println!("Then press Enter here...");
                wait_for_enter().await?;
            }

            let ciphers = LocalConfig::from_env("", "", ip).ciphers;
            let timeout = Duration::from_secs(10);
            let (info, password) = futures::future::join(
                discovery::robot_public_info(ip, timeout),
                fetch_password_v2(ip, &ciphers, timeout),
            )
            .await;

            match info {
                Ok(robot) => {
                    println!("Robot Data:");
                    print_robot(&robot)?;
                }
                Err(e) => debug!("No public info from {}: {}", ip, e),
            }

            let password = password.context("Error getting password")?;
            println!("Password=> {} <= Yes, all this string.", password);
        }
    }

    Ok(())
}

async fn run_state(robot: &RobotArgs, fields: &[String]) -> Result<()> {
    let state = match robot.connect().await? {
        Local::V1(client) => client.get_preferences(true).await?,
        Local::V2(client) => {
            let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
            let state = client.get_robot_state(&fields).await?.into_json();
            client.disconnect().await?;
            state
        }
    };
    print_json(&state)
}

async fn run_mission(robot: &RobotArgs) -> Result<()> {
    let mission = match robot.connect().await? {
        Local::V1(client) => client.get_mission(true).await?,
        Local::V2(client) => {
            let mission = client.get_mission().await?.into_json();
            client.disconnect().await?;
            mission
        }
    };
    print_json(&mission)
}

async fn run_command(robot: &RobotArgs, action: RobotCommand) -> Result<()> {
    let reply = match robot.connect().await? {
        Local::V1(client) => match action {
            RobotCommand::Start => client.start().await?,
            RobotCommand::Pause => client.pause().await?,
            RobotCommand::Stop => client.stop().await?,
            RobotCommand::Resume => client.resume().await?,
            RobotCommand::Dock => client.dock().await?,
            other => bail!("{} is not supported by v1 robots", other),
        },
        Local::V2(client) => {
            let ack = client.command(action).await?;
            client.disconnect().await?;
            serde_json::to_value(ack)?
        }
    };
    print_json(&reply)
}

fn parse_switch(value: &str) -> Result<bool> {
    match value {
        "on" | "true" => Ok(true),
        "off" | "false" => Ok(false),
        other => Err(anyhow!("Expected on or off, got {}", other)),
    }
}

fn parse_preference(setting: &str, value: &str) -> Result<Preference> {
    let preference = match setting {
        "carpet-boost" => Preference::CarpetBoost(match value {
            "auto" => CarpetBoost::Auto,
            "performance" => CarpetBoost::Performance,
            "eco" => CarpetBoost::Eco,
            other => bail!("Unknown carpet boost mode: {}", other),
        }),
        "edge-clean" => Preference::EdgeClean(parse_switch(value)?),
        "cleaning-passes" => Preference::CleaningPasses(match value {
            "auto" => CleaningPasses::Auto,
            "1" | "one" => CleaningPasses::One,
            "2" | "two" => CleaningPasses::Two,
            other => bail!("Unknown number of passes: {}", other),
        }),
        "always-finish" => Preference::AlwaysFinish(parse_switch(value)?),
        other => bail!("Unknown preference: {}", other),
    };
    Ok(preference)
}

async fn run_preference(robot: &RobotArgs, setting: &str, value: &str) -> Result<()> {
    let preference = parse_preference(setting, value)?;
    let reply = match robot.connect().await? {
        Local::V1(client) => client.set_preference(preference).await?,
        Local::V2(client) => {
            let ack = client.set_preference(preference).await?;
            client.disconnect().await?;
            serde_json::to_value(ack)?
        }
    };
    print_json(&reply)
}

fn event_json(event: &SessionEvent) -> Value {
    let data = match event {
        SessionEvent::Connected | SessionEvent::Closed => Value::Null,
        SessionEvent::Update(message) => message.clone(),
        SessionEvent::State(document) => Value::Object(document.clone()),
        SessionEvent::Mission(snapshot) => json!(snapshot),
        SessionEvent::Error(message) => json!(message),
    };
    json!({ "event": event.kind(), "data": data })
}

async fn run_watch(robot: &RobotArgs, count: Option<usize>, raw: bool) -> Result<()> {
    let Local::V2(client) = robot.connect().await? else {
        bail!("watch needs a v2 robot");
    };

    let mut events = client.subscribe();
    let mut seen = 0;
    loop {
        let event = tokio::select! {
            received = events.recv() => match received {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Skipped {} events", skipped);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        if matches!(event, SessionEvent::Update(_)) && !raw {
            continue;
        }
        println!("{}", event_json(&event));

        seen += 1;
        if matches!(event, SessionEvent::Closed) || count.is_some_and(|limit| seen >= limit) {
            break;
        }
    }

    client.disconnect().await?;
    Ok(())
}
