use ani_ipc::config::Config;
use ani_ipc::service::EchoService;
use ani_ipc::{IpcServer, ThreadPool};
use std::sync::Arc;

fn main() {
    init_logging();
    if let Err(err) = run() {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            let path = Config::default_path();
            Config::write_default(&path)?;
            println!("wrote {}", path.display());
            return Ok(());
        }
    }

    let config = Config::load()?;
    let pool = Arc::new(ThreadPool::new("ipc-worker", config.server.workers)?);
    let service = Arc::new(EchoService::new(&config.server.token, pool.size()));

    let server = IpcServer::with_pool(&config.server.token, pool);
    server.set_io_timeout(config.server.io_timeout());
    let handler_service = service.clone();
    server.set_message_handler(move |ctx, msg| handler_service.handle(ctx, msg));

    let exit_on_disconnect = config.server.exit_on_disconnect;
    server.set_disconnect_handler(move |ctx, session| {
        tracing::info!(
            session = session.id,
            requests = session.requests_served,
            "client disconnected"
        );
        if exit_on_disconnect {
            ctx.shutdown();
        }
    });

    server.run()?;
    tracing::info!(requests = service.requests_served(), "service finished");
    Ok(())
}
