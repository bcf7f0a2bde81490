//! Error taxonomy for syncd
//!
//! The taxonomy is closed and flat by design: every error that crosses a
//! component boundary is wrapped into one of the variants below, carrying
//! enough context (`task_id`, `node_id`, `project_name`, phase) for the
//! controller to make a single terminal-vs-retry decision. Components never
//! invent ad-hoc string errors that bypass this tree.

use std::error::Error;
use std::fmt;
use std::io;

/// Helper to reduce `Box::new()` boilerplate when wrapping nested errors.
#[inline]
pub fn boxed_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
	Box::new(e)
}

/// Unified error type for syncd operations.
#[derive(Debug)]
pub enum SyncdError {
	/// Invalid token or fingerprint mismatch during handshake. Never retried.
	Authentication { reason: String },

	/// TLS/TCP transport failure: broken pipe, idle timeout, reset.
	Transport(TransportError),

	/// Malformed frame, oversized length, out-of-order binary pairing.
	Protocol(ProtocolError),

	/// Block hash or size mismatch.
	Integrity(IntegrityError),

	/// Local filesystem failure (ENOENT, EACCES, ENOSPC, ...).
	Filesystem(FilesystemError),

	/// Unknown project, invalid target path, malformed sync config.
	Configuration(ConfigError),

	/// Operator cancel or controller shutdown; cooperative, not an error.
	Cancelled,

	/// I/O error with no more specific classification available yet.
	Io(io::Error),

	/// Generic message, used sparingly at CLI boundaries.
	Other { message: String },
}

impl fmt::Display for SyncdError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncdError::Authentication { reason } => write!(f, "authentication failed: {}", reason),
			SyncdError::Transport(e) => write!(f, "transport error: {}", e),
			SyncdError::Protocol(e) => write!(f, "protocol error: {}", e),
			SyncdError::Integrity(e) => write!(f, "integrity error: {}", e),
			SyncdError::Filesystem(e) => write!(f, "filesystem error: {}", e),
			SyncdError::Configuration(e) => write!(f, "configuration error: {}", e),
			SyncdError::Cancelled => write!(f, "operation cancelled"),
			SyncdError::Io(e) => write!(f, "I/O error: {}", e),
			SyncdError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncdError {}

impl From<io::Error> for SyncdError {
	fn from(e: io::Error) -> Self {
		SyncdError::Io(e)
	}
}

impl From<TransportError> for SyncdError {
	fn from(e: TransportError) -> Self {
		SyncdError::Transport(e)
	}
}

impl From<ProtocolError> for SyncdError {
	fn from(e: ProtocolError) -> Self {
		SyncdError::Protocol(e)
	}
}

impl From<IntegrityError> for SyncdError {
	fn from(e: IntegrityError) -> Self {
		SyncdError::Integrity(e)
	}
}

impl From<FilesystemError> for SyncdError {
	fn from(e: FilesystemError) -> Self {
		SyncdError::Filesystem(e)
	}
}

impl From<ConfigError> for SyncdError {
	fn from(e: ConfigError) -> Self {
		SyncdError::Configuration(e)
	}
}

impl SyncdError {
	/// Whether the controller's retry policy (spec.md §4.10) should retry
	/// this failure or surface it as terminal immediately.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			SyncdError::Transport(_)
				| SyncdError::Io(_)
				| SyncdError::Integrity(_)
				| SyncdError::Filesystem(FilesystemError::WriteDenied { .. })
				| SyncdError::Filesystem(FilesystemError::NoSpace { .. })
		)
	}
}

/// Transport-layer errors (TLS, TCP, keepalive).
#[derive(Debug)]
pub enum TransportError {
	/// The peer closed the TLS/TCP stream.
	Closed,
	/// Broken pipe or reset while writing.
	BrokenPipe { source: io::Error },
	/// No frame activity within the configured idle window.
	IdleTimeout { secs: u64 },
	/// Three missed keepalive pongs.
	KeepaliveExhausted,
	/// Handshake did not complete within the 10s budget.
	HandshakeTimeout,
}

impl fmt::Display for TransportError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransportError::Closed => write!(f, "connection closed"),
			TransportError::BrokenPipe { source } => write!(f, "broken pipe: {}", source),
			TransportError::IdleTimeout { secs } => write!(f, "idle timeout after {}s", secs),
			TransportError::KeepaliveExhausted => write!(f, "keepalive exhausted (3 missed pings)"),
			TransportError::HandshakeTimeout => write!(f, "handshake timed out"),
		}
	}
}

impl Error for TransportError {}

impl From<io::Error> for TransportError {
	fn from(e: io::Error) -> Self {
		TransportError::BrokenPipe { source: e }
	}
}

/// Wire-protocol framing errors.
#[derive(Debug)]
pub enum ProtocolError {
	/// JSON frame exceeded the 1 MiB cap.
	FrameTooLarge { len: u32, max: u32 },
	/// Binary frame arrived without a preceding `block_response_bin`.
	UnpairedBinaryFrame,
	/// A `block_response_bin` was not immediately followed by its binary frame.
	MissingBinaryPayload,
	/// JSON frame failed to parse.
	Malformed { message: String },
	/// `type` field missing or unrecognised.
	UnknownMessageType { type_field: String },
}

impl fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProtocolError::FrameTooLarge { len, max } => {
				write!(f, "frame length {} exceeds maximum {}", len, max)
			}
			ProtocolError::UnpairedBinaryFrame => write!(f, "binary frame with no pending block_response_bin"),
			ProtocolError::MissingBinaryPayload => {
				write!(f, "block_response_bin not immediately followed by its binary frame")
			}
			ProtocolError::Malformed { message } => write!(f, "malformed frame: {}", message),
			ProtocolError::UnknownMessageType { type_field } => {
				write!(f, "unknown message type: {}", type_field)
			}
		}
	}
}

impl Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
	fn from(e: serde_json::Error) -> Self {
		ProtocolError::Malformed { message: e.to_string() }
	}
}

/// Block/content integrity errors. Raised by the agent the first time a
/// received block fails verification (spec.md §4.10 "abort task with
/// `HASH_MISMATCH`"); whether a repeat on retry escalates to `CORRUPT_SOURCE`
/// is the controller's call, not the agent's (see `Controller::fail_integrity`).
#[derive(Debug)]
pub enum IntegrityError {
	/// `sha256(bytes) != hash` on a received block.
	HashMismatch { path: String, block: u64, expected: String, actual: String },
	/// Received byte count did not match the announced `size`.
	SizeMismatch { path: String, block: u64, expected: u32, actual: usize },
}

impl fmt::Display for IntegrityError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			IntegrityError::HashMismatch { path, block, expected, actual } => write!(
				f,
				"hash mismatch for {} block {}: expected {}, got {}",
				path, block, expected, actual
			),
			IntegrityError::SizeMismatch { path, block, expected, actual } => write!(
				f,
				"size mismatch for {} block {}: expected {}, got {}",
				path, block, expected, actual
			),
		}
	}
}

impl Error for IntegrityError {}

/// Local filesystem errors on either the primary or the agent.
#[derive(Debug)]
pub enum FilesystemError {
	NotFound { path: String },
	WriteDenied { path: String },
	NoSpace { path: String },
	OutOfRange { path: String, block: u64 },
	Io { path: String, source: io::Error },
}

impl fmt::Display for FilesystemError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FilesystemError::NotFound { path } => write!(f, "not found: {}", path),
			FilesystemError::WriteDenied { path } => write!(f, "write denied: {}", path),
			FilesystemError::NoSpace { path } => write!(f, "no space left writing {}", path),
			FilesystemError::OutOfRange { path, block } => {
				write!(f, "block {} out of range for {}", block, path)
			}
			FilesystemError::Io { path, source } => write!(f, "I/O error on {}: {}", path, source),
		}
	}
}

impl Error for FilesystemError {}

/// Configuration/discovery errors: unknown project, invalid target path.
#[derive(Debug)]
pub enum ConfigError {
	UnknownProject { name: String },
	InvalidTargetPath { path: String },
	InvalidPattern { pattern: String, message: String },
	ParseError { message: String },
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::UnknownProject { name } => write!(f, "unknown project: {}", name),
			ConfigError::InvalidTargetPath { path } => write!(f, "invalid target path: {}", path),
			ConfigError::InvalidPattern { pattern, message } => {
				write!(f, "invalid ignore pattern {:?}: {}", pattern, message)
			}
			ConfigError::ParseError { message } => write!(f, "configuration parse error: {}", message),
		}
	}
}

impl Error for ConfigError {}

// vim: ts=4
