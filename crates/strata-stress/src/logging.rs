use std::env;
use std::net::{SocketAddr, UdpSocket};

use strata_cache::config::{Config, LogFormat};
use strata_cache::logging::init_json_logging;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::fmt;
use tracing_subscriber::fmt::time::UtcTime;

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => "INFO,strata_cache=DEBUG,strata_stress=DEBUG",
        LevelFilter::TRACE => "INFO,strata_cache=TRACE,strata_stress=TRACE",
    }
}

/// Initializes logging for the stresstest.
///
/// `RUST_LOG` takes precedence over the level in the configuration.
///
/// # Safety
/// This function uses [`std::env::set_var`] to enable backtraces, which is only safe to call
/// while no other threads are running.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log =
        env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.logging.level).to_string());

    let subscriber = fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(rust_log.as_str());

    match (config.logging.format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => subscriber.pretty().init(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            subscriber.compact().with_ansi(false).init()
        }
        (LogFormat::Json, _) => init_json_logging(&rust_log, std::io::stdout),
    }
}

/// Binds a local UDP socket that swallows everything sent to it.
///
/// Pointing statsd at it keeps the whole metrics machinery active without a real server.
pub fn spawn_metrics_sink() -> std::io::Result<SocketAddr> {
    let socket = UdpSocket::bind(("127.0.0.1", 0))?;
    let addr = socket.local_addr()?;

    std::thread::spawn(move || {
        let mut buf = [0; 1024];
        while socket.recv(&mut buf).is_ok() {}
    });

    Ok(addr)
}
