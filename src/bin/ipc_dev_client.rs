use ani_ipc::config::Config;
use ani_ipc::service::{MessageKind, StatusReport};
use ani_ipc::IpcClient;
use std::time::Duration;

struct Args {
    token: Option<String>,
    shutdown: bool,
    words: Vec<String>,
}

fn parse_args() -> Result<Args, Box<dyn std::error::Error>> {
    let mut args = Args {
        token: None,
        shutdown: false,
        words: Vec::new(),
    };
    let mut raw = std::env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--token" => {
                args.token = Some(raw.next().ok_or("--token needs a value")?);
            }
            "--shutdown" => args.shutdown = true,
            _ => args.words.push(arg),
        }
    }
    Ok(args)
}

fn connect(token: &str, config: &Config) -> Result<IpcClient, Box<dyn std::error::Error>> {
    let mut attempt = 1;
    loop {
        match IpcClient::connect(token) {
            Ok(client) => return Ok(client),
            Err(err) if attempt < config.client.connect_attempts => {
                tracing::debug!(attempt, error = %err, "daemon not reachable yet");
                std::thread::sleep(Duration::from_millis(config.client.retry_delay_ms));
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let args = parse_args()?;
    let token = args.token.unwrap_or_else(|| config.server.token.clone());

    println!("ipc-dev-client: connecting to {token}");
    let mut client = connect(&token, &config)?;
    println!("ipc-dev-client: connected");

    let pong = client.send(MessageKind::Ping.code(), b"")?;
    println!("-> ping  <- {}", String::from_utf8_lossy(&pong.content));

    for word in &args.words {
        let resp = client.send(MessageKind::Echo.code(), word.as_bytes())?;
        println!(
            "-> echo #{} {word}  <- {}",
            resp.request_id,
            String::from_utf8_lossy(&resp.content)
        );
    }

    let status = client.send(MessageKind::Status.code(), b"")?;
    let report = StatusReport::decode(&status.content)?;
    println!("<- status {}", serde_json::to_string(&report)?);

    if args.shutdown {
        let bye = client.send(MessageKind::Shutdown.code(), b"")?;
        println!("-> shutdown  <- {}", String::from_utf8_lossy(&bye.content));
    }
    client.close();
    Ok(())
}

fn main() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(false).init();

    if let Err(err) = run() {
        eprintln!("ipc-dev-client: {err}");
        std::process::exit(1);
    }
}
