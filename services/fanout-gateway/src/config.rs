use fanout_hub::HubOptions;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Everything the gateway binary needs to boot, assembled once from the
/// environment at startup and passed by value/`Arc` into the lifecycle glue
/// — nothing downstream reaches back into `env::var` directly.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub hub: HubOptions,
    pub cron_default_execution_timeout: Duration,
    pub bind_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub shutdown_grace: Duration,
    pub log_level: String,
}

impl GatewayConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            hub: HubOptions {
                read_timeout: Duration::from_secs(env_u64("FANOUT_READ_TIMEOUT_SECS", 60)),
                write_timeout: Duration::from_secs(env_u64("FANOUT_WRITE_TIMEOUT_SECS", 10)),
                ping_interval: Duration::from_secs(env_u64("FANOUT_PING_INTERVAL_SECS", 30)),
                max_message_size: env_u64("FANOUT_MAX_MESSAGE_BYTES", 65536) as usize,
                send_buffer: env_u64("FANOUT_SEND_BUFFER", 256) as usize,
            },
            cron_default_execution_timeout: Duration::from_secs(env_u64(
                "FANOUT_CRON_DEFAULT_TIMEOUT_SECS",
                300,
            )),
            bind_addr: env::var("FANOUT_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_owned())
                .parse()
                .expect("FANOUT_BIND_ADDR must be a valid socket address"),
            redis_url: env::var("FANOUT_REDIS_URL").ok(),
            shutdown_grace: Duration::from_secs(env_u64("FANOUT_SHUTDOWN_GRACE_SECS", 10)),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
