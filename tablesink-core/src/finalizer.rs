//! Turns the result of processing one message (success, error, or panic) into exactly one ack or
//! nak-with-delay, reporting failures on the monitor route on the way.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::{error, warn};

use crate::Result;
use crate::error::{self, Error};
use crate::message::{Status, TransportMessage};
use crate::status::StatusNotifier;

/// Redelivery delay used when no delay function is configured.
pub const DEFAULT_NAK_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Acked.
    Success,
    /// Nak'd, redelivered after `delay`.
    TransientFailure { detail: String, delay: Duration },
    /// Acked despite the failure, never redelivered.
    TerminalFailure { detail: String },
}

type IsTerminalFn = dyn Fn(&Error) -> bool + Send + Sync;
type NakDelayFn = dyn Fn(&Error) -> Duration + Send + Sync;

#[derive(Clone)]
pub struct Finalizer {
    notifier: Option<StatusNotifier>,
    is_terminal: Arc<IsTerminalFn>,
    nak_delay: Option<Arc<NakDelayFn>>,
    panic_terminal: bool,
    notify_on_success: bool,
}

impl Default for Finalizer {
    fn default() -> Self {
        Self::new(error::default_is_terminal)
    }
}

impl Finalizer {
    pub fn new(is_terminal: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        Self {
            notifier: None,
            is_terminal: Arc::new(is_terminal),
            nak_delay: None,
            panic_terminal: true,
            notify_on_success: true,
        }
    }

    pub fn with_notifier(mut self, notifier: StatusNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Per-error redelivery delay, [DEFAULT_NAK_DELAY] otherwise.
    pub fn nak_delay(mut self, nak_delay: impl Fn(&Error) -> Duration + Send + Sync + 'static) -> Self {
        self.nak_delay = Some(Arc::new(nak_delay));
        self
    }

    pub fn panic_terminal(mut self, panic_terminal: bool) -> Self {
        self.panic_terminal = panic_terminal;
        self
    }

    pub fn notify_on_success(mut self, notify_on_success: bool) -> Self {
        self.notify_on_success = notify_on_success;
        self
    }

    fn delay_for(&self, err: &Error) -> Duration {
        self.nak_delay
            .as_ref()
            .map_or(DEFAULT_NAK_DELAY, |nak_delay| nak_delay(err))
    }

    /// Maps a processing result onto an [Outcome]. [Error::Panic] is decided by the panic flag,
    /// everything else by the terminal predicate.
    pub fn classify(&self, result: &Result<()>) -> Outcome {
        match result {
            Ok(()) => Outcome::Success,
            Err(err) => {
                let terminal = match err {
                    Error::Panic(_) => self.panic_terminal,
                    other => (self.is_terminal)(other),
                };
                if terminal {
                    Outcome::TerminalFailure {
                        detail: err.to_string(),
                    }
                } else {
                    Outcome::TransientFailure {
                        detail: err.to_string(),
                        delay: self.delay_for(err),
                    }
                }
            }
        }
    }

    /// Runs `work` for `message`, recovering any panic, then settles the message. `route_id` and
    /// `data` are only used for status reporting.
    pub async fn run<F>(
        &self,
        message: &dyn TransportMessage,
        route_id: &str,
        data: Option<Value>,
        work: F,
    ) -> Outcome
    where
        F: Future<Output = Result<()>> + Send,
    {
        let result = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let backtrace = Backtrace::force_capture();
                let reason = panic_message(payload.as_ref());
                error!(route_id, reason, "Recovered panic while handling message");
                Err(Error::Panic(format!("panic: {reason}\n{backtrace}")))
            }
        };

        if let Err(e) = &result {
            warn!(route_id, ?e, "Message handling failed");
        }
        let outcome = self.classify(&result);
        self.settle(message, route_id, data, &outcome).await;
        outcome
    }

    /// Publishes the status for `outcome` (best effort) then acks or naks `message`.
    pub async fn settle(
        &self,
        message: &dyn TransportMessage,
        route_id: &str,
        data: Option<Value>,
        outcome: &Outcome,
    ) {
        if let Some(notifier) = &self.notifier {
            match outcome {
                Outcome::Success if self.notify_on_success => {
                    notifier.notify(route_id, Status::Completed, None, data).await
                }
                Outcome::Success => {}
                Outcome::TransientFailure { detail, .. } | Outcome::TerminalFailure { detail } => {
                    notifier
                        .notify(route_id, Status::Failed, Some(detail.clone()), data)
                        .await
                }
            }
        }

        let settled = match outcome {
            Outcome::Success | Outcome::TerminalFailure { .. } => message.ack().await,
            Outcome::TransientFailure { delay, .. } => message.nak_with_delay(*delay).await,
        };
        if let Err(e) = settled {
            error!(route_id, ?outcome, ?e, "Failed to settle message");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else {
        payload
            .downcast_ref::<String>()
            .map_or("unknown panic payload", |s| s.as_str())
    }
}
