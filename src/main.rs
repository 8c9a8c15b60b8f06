//! Marine navigation data router and protocol gateway entry point: loads
//! configuration, wires up logging, builds the Main Server, and runs until
//! SIGINT (spec §4.J, §6).

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use nmea_router::config::Config;
use nmea_router::error::RouterError;
use nmea_router::server::{self, MainServer};

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if let Some(log_file) = &config.log_file {
        let path = std::path::Path::new(log_file);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("nmea_router.log"));
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        subscriber.with_writer(file_appender).init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error loading {config_path}: {e}");
            return ExitCode::from(1);
        }
    };

    init_logging(&config);

    if let Err(e) = server::validate_classes(&config) {
        tracing::error!(error = %e, "configuration error");
        return ExitCode::from(1);
    }

    let mut server = MainServer::new(config);
    if let Err(e) = run(&mut server).await {
        tracing::error!(error = %e, "fatal startup error");
        return ExitCode::from(1);
    }

    let exit_code = server.run_until_signal().await;
    ExitCode::from(exit_code as u8)
}

async fn run(server: &mut MainServer) -> Result<(), RouterError> {
    server.build().await?;
    server.start();
    Ok(())
}
