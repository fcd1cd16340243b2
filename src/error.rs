use std::convert::From;
use std::fmt::{self, Display, Formatter};
use std::io::Error as IoError;
use std::sync::PoisonError;
use std::sync::mpsc::{RecvError, SendError};

use base64::DecodeError as Base64Error;
use chrono::ParseError as ChronoParseError;
use hex::FromHexError;
use pem::PemError;
use ring::error::{KeyRejected, Unspecified as RingUnspecified};
use serde_json::Error as SerdeJsonError;
use toml::de::Error as TomlError;
use url::ParseError as UrlParseError;

use crate::command_queue::Completion;
use crate::metadata::Role;

/// System-wide errors returned from `Result` type failures.
///
/// This is a flat sum type rather than a tree of per-module errors so that
/// callers across the command queue / orchestrator boundary can match on a
/// single stable taxonomy.
#[derive(Debug)]
pub enum Error {
    Base64(Base64Error),
    /// A queued command (`command_queue::CommandKind`) failed or was
    /// cancelled; carries the originating error's rendered message since
    /// the command queue boundary only hands a `Completion` back to the
    /// caller, not the original typed `Error`.
    Command(String),
    Config(String),
    DateTime(ChronoParseError),
    Hex(FromHexError),
    Io(IoError),
    Json(SerdeJsonError),
    KeyRejected(String),
    Network(String),
    Pacman(String),
    Parse(String),
    Pem(PemError),
    Poison(String),
    Recv(RecvError),
    Ring(String),
    SendCompletion(SendError<Completion>),
    Secondary(String),
    Storage(String),
    Toml(TomlError),
    UrlParse(UrlParseError),

    /// Metadata was structurally malformed (bad JSON, missing required field,
    /// `signed._type` absent).
    InvalidMetadata(String),
    /// A signature, rollback, type-mismatch or hash-mismatch attack was
    /// detected. Never downgraded or retried automatically.
    SecurityException(String),
    /// Exactly one signature was present on the document and it did not
    /// validate.
    BadKeyId,
    /// The same `keyid` appeared more than once among a document's
    /// signatures.
    NonUniqueSignatures,
    /// Fewer than `threshold[role]` valid signatures were found.
    UnmetThreshold(Role),
    /// `threshold[role]` itself fell outside `[MIN_THRESHOLD, MAX_THRESHOLD]`.
    IllegalThreshold(Role),
    /// `signed.expires <= now`.
    ExpiredMetadata,
    /// Downloaded target bytes did not hash to the value promised by
    /// metadata.
    TargetHashMismatch(String),
    /// Downloaded target bytes exceeded the length promised by metadata.
    OversizedTarget(String),
    /// Director and Image repositories disagree about a target's hashes,
    /// length, or hardware id.
    MissMatchTarget(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let inner: String = match *self {
            Error::Base64(ref err) => format!("base64 decode error: {}", err),
            Error::Command(ref err) => format!("command failed: {}", err),
            Error::Config(ref err) => format!("bad config: {}", err),
            Error::DateTime(ref err) => format!("datetime parse error: {}", err),
            Error::Hex(ref err) => format!("not valid hex data: {}", err),
            Error::Io(ref err) => format!("IO error: {}", err),
            Error::Json(ref err) => format!("JSON parse error: {}", err),
            Error::KeyRejected(ref err) => format!("key rejected: {}", err),
            Error::Network(ref err) => format!("network error: {}", err),
            Error::Pacman(ref err) => format!("package manager error: {}", err),
            Error::Parse(ref err) => format!("parse error: {}", err),
            Error::Pem(ref err) => format!("PEM parse error: {}", err),
            Error::Poison(ref err) => format!("poison error: {}", err),
            Error::Recv(ref err) => format!("recv error: {}", err),
            Error::Ring(ref err) => format!("crypto error: {}", err),
            Error::SendCompletion(ref err) => format!("completion send error: {}", err),
            Error::Secondary(ref err) => format!("secondary error: {}", err),
            Error::Storage(ref err) => format!("storage error: {}", err),
            Error::Toml(ref err) => format!("TOML error: {}", err),
            Error::UrlParse(ref err) => format!("url parse error: {}", err),
            Error::InvalidMetadata(ref err) => format!("invalid metadata: {}", err),
            Error::SecurityException(ref err) => format!("security exception: {}", err),
            Error::BadKeyId => "single signature present and invalid".into(),
            Error::NonUniqueSignatures => "duplicate keyid in signature set".into(),
            Error::UnmetThreshold(ref role) => format!("unmet signature threshold for {}", role),
            Error::IllegalThreshold(ref role) => format!("illegal threshold configured for {}", role),
            Error::ExpiredMetadata => "metadata has expired".into(),
            Error::TargetHashMismatch(ref name) => format!("target hash mismatch: {}", name),
            Error::OversizedTarget(ref name) => format!("oversized target: {}", name),
            Error::MissMatchTarget(ref name) => format!("director/image target mismatch: {}", name),
        };
        write!(f, "{}", inner)
    }
}

impl std::error::Error for Error {}

impl<E> From<PoisonError<E>> for Error {
    fn from(err: PoisonError<E>) -> Error {
        Error::Poison(err.to_string())
    }
}

impl From<KeyRejected> for Error {
    fn from(err: KeyRejected) -> Error {
        Error::KeyRejected(err.to_string())
    }
}

impl From<RingUnspecified> for Error {
    fn from(_: RingUnspecified) -> Error {
        Error::Ring("signature operation failed".into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Error {
        Error::Network(err.to_string())
    }
}

/// Expands into a set of `From` impls that box an upstream error type
/// directly into an `Error` variant, so `?` works across crate
/// boundaries without writing each conversion out by hand.
macro_rules! derive_from {
    ([ $( $from:ident => $to:ident ),* $(,)? ]) => {
        $(impl From<$from> for Error {
            fn from(err: $from) -> Error {
                Error::$to(err)
            }
        })*
    };
}

derive_from!([
    Base64Error      => Base64,
    ChronoParseError => DateTime,
    FromHexError     => Hex,
    IoError          => Io,
    PemError         => Pem,
    RecvError        => Recv,
    SerdeJsonError   => Json,
    TomlError        => Toml,
    UrlParseError    => UrlParse,
    SendError<Completion> => SendCompletion,
]);
