//! Mutual TLS transport with trust-on-first-use fingerprint pinning
//! (spec.md §4.5, §6 "TLS").
//!
//! rustls itself is configured to skip certificate-chain validation in
//! both directions — there is no CA, every identity is self-signed.
//! Peer authentication happens one layer up, at the application level:
//! the primary checks the presented client certificate's SHA-256
//! fingerprint against [`crate::registry`] (TOFU on first session, then
//! byte-equality), and the agent checks the server's fingerprint against
//! a locally pinned value. This module only gets the handshake to
//! complete and hands back the fingerprint for that layer to judge.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use rcgen::generate_simple_self_signed;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::server::{AllowAnyAnonymousOrAuthenticatedClient, ClientCertVerified, ClientCertVerifier};
use rustls::{Certificate, PrivateKey};
use sha2::{Digest, Sha256};

use crate::error::TransportError;

/// A loaded (or freshly generated) self-signed TLS identity.
pub struct Identity {
	pub cert: Certificate,
	pub key: PrivateKey,
	pub cert_der: Vec<u8>,
}

impl Identity {
	/// SHA-256 fingerprint of this identity's leaf certificate, hex-encoded.
	pub fn fingerprint(&self) -> String {
		fingerprint_hex(&self.cert_der)
	}
}

/// SHA-256 fingerprint of a DER-encoded certificate, lowercase hex
/// (spec.md §9 Glossary "Fingerprint").
pub fn fingerprint_hex(der: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(der);
	hex::encode(hasher.finalize())
}

/// Load a persisted identity from `dir`, generating and persisting a new
/// self-signed one if absent (spec.md §6 "self-signed certificates
/// generated on first start of each side if none are present").
pub fn load_or_generate_identity(dir: &Path) -> io::Result<Identity> {
	std::fs::create_dir_all(dir)?;
	let cert_path = dir.join("identity_cert.der");
	let key_path = dir.join("identity_key.der");

	if cert_path.exists() && key_path.exists() {
		let cert_der = std::fs::read(&cert_path)?;
		let key_der = std::fs::read(&key_path)?;
		return Ok(Identity { cert: Certificate(cert_der.clone()), key: PrivateKey(key_der), cert_der });
	}

	let generated = generate_simple_self_signed(["syncd".to_string()])
		.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
	let cert_der = generated.serialize_der().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
	let key_der = generated.serialize_private_key_der();

	std::fs::write(&cert_path, &cert_der)?;
	std::fs::write(&key_path, &key_der)?;

	Ok(Identity { cert: Certificate(cert_der.clone()), key: PrivateKey(key_der), cert_der })
}

/// Builds the primary's TLS server config: requires the agent to present
/// a client certificate (mutual TLS) but does not validate its chain —
/// any self-signed cert is accepted at this layer.
pub fn server_config(identity: &Identity) -> Result<rustls::ServerConfig, TransportError> {
	let client_verifier = AllowAnyClientCert::new();
	let config = rustls::ServerConfig::builder()
		.with_safe_defaults()
		.with_client_cert_verifier(Arc::new(client_verifier))
		.with_single_cert(vec![identity.cert.clone()], identity.key.clone())
		.map_err(|e| TransportError::BrokenPipe { source: io::Error::new(io::ErrorKind::Other, e) })?;
	Ok(config)
}

/// Builds the agent's TLS client config: presents its own self-signed
/// certificate (mutual TLS) and accepts any server certificate — the
/// fingerprint is checked against the pinned value after the handshake.
pub fn client_config(identity: &Identity) -> Result<rustls::ClientConfig, TransportError> {
	let config = rustls::ClientConfig::builder()
		.with_safe_defaults()
		.with_custom_certificate_verifier(Arc::new(AllowAnyServerCert))
		.with_single_cert(vec![identity.cert.clone()], identity.key.clone())
		.map_err(|e| TransportError::BrokenPipe { source: io::Error::new(io::ErrorKind::Other, e) })?;
	Ok(config)
}

/// Accepts any client certificate chain, as long as one is presented.
/// Mutual TLS is enforced at the handshake (a cert must be sent); its
/// *content* is judged afterwards by the node registry, not here.
struct AllowAnyClientCert {
	inner: AllowAnyAnonymousOrAuthenticatedClient,
}

impl AllowAnyClientCert {
	fn new() -> Self {
		let roots = rustls::RootCertStore::empty();
		AllowAnyClientCert { inner: AllowAnyAnonymousOrAuthenticatedClient::new(roots) }
	}
}

impl ClientCertVerifier for AllowAnyClientCert {
	fn client_auth_root_subjects(&self) -> &[rustls::DistinguishedName] {
		self.inner.client_auth_root_subjects()
	}

	fn verify_client_cert(
		&self,
		_end_entity: &Certificate,
		_intermediates: &[Certificate],
		_now: SystemTime,
	) -> Result<ClientCertVerified, rustls::Error> {
		Ok(ClientCertVerified::assertion())
	}
}

/// Accepts any server certificate without chain validation — `InsecureSkipVerify`
/// at the TLS layer, per spec.md §6.
struct AllowAnyServerCert;

impl ServerCertVerifier for AllowAnyServerCert {
	fn verify_server_cert(
		&self,
		_end_entity: &Certificate,
		_intermediates: &[Certificate],
		_server_name: &rustls::ServerName,
		_scts: &mut dyn Iterator<Item = &[u8]>,
		_ocsp_response: &[u8],
		_now: SystemTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}
}

/// A single locally-pinned server fingerprint, persisted by the agent
/// (spec.md §4.5 step 4: "otherwise persists under TOFU").
///
/// `AgentConfig.pinned_server_fingerprint` takes priority when set; this
/// store is only consulted/updated when that field is absent, mirroring
/// the node registry's `agentCertFingerprint` TOFU slot on the other side.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct PinStore {
	server_fingerprint: Option<String>,
}

pub struct ServerPin {
	path: PathBuf,
}

impl ServerPin {
	pub fn new(tls_dir: &Path) -> Self {
		ServerPin { path: tls_dir.join("server_pin.json") }
	}

	fn load(&self) -> PinStore {
		std::fs::read(&self.path)
			.ok()
			.and_then(|bytes| serde_json::from_slice(&bytes).ok())
			.unwrap_or_default()
	}

	fn save(&self, store: &PinStore) -> io::Result<()> {
		let bytes = serde_json::to_vec_pretty(store)?;
		std::fs::write(&self.path, bytes)
	}

	pub fn get(&self) -> Option<String> {
		self.load().server_fingerprint
	}

	pub fn set(&self, fingerprint: &str) -> io::Result<()> {
		let mut store = self.load();
		store.server_fingerprint = Some(fingerprint.to_string());
		self.save(&store)
	}

	/// Verify `observed` against the pin, TOFU-persisting it if nothing is
	/// pinned yet. Returns an error mirroring spec.md §4.5 step 4's
	/// "Any mismatch ⇒ the agent closes and backs off".
	pub fn verify_or_pin(&self, observed: &str) -> Result<(), TransportError> {
		match self.get() {
			Some(pinned) if pinned == observed => Ok(()),
			Some(_) => Err(TransportError::Closed),
			None => {
				self.set(observed).map_err(|e| TransportError::BrokenPipe { source: e })?;
				Ok(())
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fingerprint_is_stable_for_same_bytes() {
		let der = vec![1u8, 2, 3, 4];
		assert_eq!(fingerprint_hex(&der), fingerprint_hex(&der));
	}

	#[test]
	fn identity_round_trips_through_disk() {
		let dir = tempfile::tempdir().unwrap();
		let first = load_or_generate_identity(dir.path()).unwrap();
		let second = load_or_generate_identity(dir.path()).unwrap();
		assert_eq!(first.cert_der, second.cert_der);
	}

	#[test]
	fn server_pin_accepts_first_observed_fingerprint() {
		let dir = tempfile::tempdir().unwrap();
		let pin = ServerPin::new(dir.path());
		assert!(pin.get().is_none());
		pin.verify_or_pin("aabbcc").unwrap();
		assert_eq!(pin.get().as_deref(), Some("aabbcc"));
	}

	#[test]
	fn server_pin_rejects_a_changed_fingerprint() {
		let dir = tempfile::tempdir().unwrap();
		let pin = ServerPin::new(dir.path());
		pin.verify_or_pin("aabbcc").unwrap();
		let err = pin.verify_or_pin("ddeeff").unwrap_err();
		assert!(matches!(err, TransportError::Closed));
	}
}

// vim: ts=4
