//! The events the orchestrator emits to its single observer, covering
//! exactly the Uptane cycle's own cases: metadata checks, downloads,
//! installs, and manifest submission.

use std::fmt::{self, Display, Formatter};

use crate::metadata::{EcuSerial, Target};

/// A typed notification of orchestrator progress. Owned
/// payloads only, so a sink can hold onto an event past the call that
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    UpdateCheckComplete,
    UpdateAvailable(Vec<Target>),
    /// Percentage complete for one target's download, monotone per
    /// target.
    DownloadProgressReport { target: String, percent: u8 },
    DownloadComplete,
    InstallStarted(EcuSerial),
    InstallComplete,
    AllInstallsComplete,
    ManifestSent(bool),
    Error(ErrorKind, String),
}

/// The stable error-kind taxonomy events carry, kept separate
/// from `crate::error::Error` so observers match on a small closed set
/// instead of the crate's full internal error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidMetadata,
    SecurityException,
    Network,
    Storage,
    Secondary,
    Pacman,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ErrorKind::InvalidMetadata => write!(f, "invalid-metadata"),
            ErrorKind::SecurityException => write!(f, "security-exception"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Storage => write!(f, "storage"),
            ErrorKind::Secondary => write!(f, "secondary"),
            ErrorKind::Pacman => write!(f, "pacman"),
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The single observer slot the public API's `setEventHandler` installs:
/// one trait object, not a multi-subscriber broadcast.
pub trait EventSink: Send {
    fn handle(&mut self, event: Event);
}

/// An `EventSink` built from a plain closure, so `set_event_handler` can
/// accept `|event| ...` directly instead of requiring a named type.
pub struct FnSink<F: FnMut(Event) + Send>(pub F);

impl<F: FnMut(Event) + Send> EventSink for FnSink<F> {
    fn handle(&mut self, event: Event) {
        (self.0)(event)
    }
}

/// An `EventSink` that drops every event, used when no observer has been
/// installed yet.
#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn handle(&mut self, _event: Event) {}
}

impl From<&crate::error::Error> for ErrorKind {
    fn from(err: &crate::error::Error) -> ErrorKind {
        use crate::error::Error;
        match err {
            Error::InvalidMetadata(_) => ErrorKind::InvalidMetadata,
            Error::SecurityException(_)
            | Error::BadKeyId
            | Error::NonUniqueSignatures
            | Error::UnmetThreshold(_)
            | Error::IllegalThreshold(_)
            | Error::ExpiredMetadata
            | Error::TargetHashMismatch(_)
            | Error::OversizedTarget(_)
            | Error::MissMatchTarget(_) => ErrorKind::SecurityException,
            Error::Network(_) | Error::UrlParse(_) => ErrorKind::Network,
            Error::Storage(_) | Error::Io(_) | Error::Poison(_) => ErrorKind::Storage,
            Error::Secondary(_) => ErrorKind::Secondary,
            Error::Pacman(_) => ErrorKind::Pacman,
            _ => ErrorKind::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fn_sink_forwards_events_to_closure() {
        let mut seen = Vec::new();
        {
            let mut sink = FnSink(|event| seen.push(event));
            sink.handle(Event::UpdateCheckComplete);
            sink.handle(Event::ManifestSent(true));
        }
        assert_eq!(seen, vec![Event::UpdateCheckComplete, Event::ManifestSent(true)]);
    }

    #[test]
    fn null_sink_discards_everything() {
        let mut sink = NullSink;
        sink.handle(Event::DownloadComplete);
    }
}
