//! NATS side of the table sink: the JetStream pull consumer feeding the message handler, and the
//! status publisher for the monitor subject.

use std::time::Duration;

use async_nats::{Client, ConnectOptions};
use tracing::info;

pub mod consumer;
pub mod publisher;

pub use consumer::{JetStreamMessage, JetStreamSubscriber};
pub use publisher::NatsStatusPublisher;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to NATS {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Jestream - {0}")]
    Jetstream(String),

    #[error("NATS - {0}")]
    Nats(String),
}

impl From<Error> for tablesink_core::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Connection { .. } | Error::Jetstream(_) => {
                tablesink_core::Error::Transport(value.to_string())
            }
            Error::Nats(e) => tablesink_core::Error::Transport(e),
        }
    }
}

/// Authentication used to connect to NATS.
#[derive(Debug, Clone, PartialEq)]
pub enum NatsAuth {
    Basic { username: String, password: String },
    Token(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub url: String,
    pub auth: Option<NatsAuth>,
}

/// Connects to the NATS server. Reconnects are unlimited, the client keeps retrying in the
/// background when the server goes away.
pub async fn connect(config: &ClientConfig) -> Result<Client> {
    let mut conn_opts = ConnectOptions::new()
        .max_reconnects(None) // unlimited reconnects
        .reconnect_delay_callback(|attempts| {
            Duration::from_millis(std::cmp::min((attempts * 10) as u64, 1000))
        })
        .ping_interval(Duration::from_secs(3));
    if let Some(auth) = config.auth.clone() {
        conn_opts = match auth {
            NatsAuth::Basic { username, password } => {
                conn_opts.user_and_password(username, password)
            }
            NatsAuth::Token(token) => conn_opts.token(token),
        };
    }

    let client = async_nats::connect_with_options(&config.url, conn_opts)
        .await
        .map_err(|err| Error::Connection {
            server: config.url.to_string(),
            error: err.to_string(),
        })?;
    info!(url = %config.url, "Connected to NATS");
    Ok(client)
}
