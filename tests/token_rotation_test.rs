//! `RotateToken` (spec.md §4.7): an in-flight session survives rotation
//! unharmed, but any *new* handshake attempt using the old token is
//! rejected from that point on.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ServerName;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use syncd::error::SyncdError;
use syncd::registry::{Node, NodeHealth, NodeStatus, Registry};
use syncd::session::Session;
use syncd::tls;
use syncd::wire::frame;
use syncd::wire::messages::ControlMessage;

const NODE_ID: u64 = 3;

async fn handshake_with_token(
	listener: &TcpListener,
	acceptor: &TlsAcceptor,
	registry: &Registry,
	server_fingerprint: &str,
	connector: &TlsConnector,
	addr: SocketAddr,
	token: &str,
) -> Result<Session, SyncdError> {
	let server_fut = async {
		let (tcp, _) = listener.accept().await.map_err(SyncdError::from)?;
		let tls_stream = acceptor.accept(tcp).await.map_err(SyncdError::from)?;
		Session::handshake(tls_stream, registry, server_fingerprint).await
	};
	let client_fut = async {
		let tcp = TcpStream::connect(addr).await.map_err(SyncdError::from)?;
		let server_name = ServerName::try_from("syncd").expect("valid DNS name");
		let tls_stream = connector.connect(server_name, tcp).await.map_err(SyncdError::from)?;
		let (mut reader, mut writer) = tokio::io::split(tls_stream);
		let hello = ControlMessage::Hello {
			node_id: NODE_ID,
			token: token.to_string(),
			agent_version: "0.0.0-test".to_string(),
			hostname: "test-agent".to_string(),
		};
		frame::write_message(&mut writer, &hello, None).await.map_err(SyncdError::from)?;
		let _ = frame::read_message(&mut reader).await.map_err(SyncdError::from)?;
		Ok::<(), SyncdError>(())
	};
	let (server_result, _client_result) = tokio::join!(server_fut, client_fut);
	server_result
}

#[tokio::test]
async fn rotated_token_rejects_new_handshakes_but_not_the_live_session() {
	let primary_dir = TempDir::new().unwrap();
	let registry = Registry::open(&primary_dir.path().join("registry.redb")).unwrap();
	registry
		.put(&Node {
			id: NODE_ID,
			name: "rotating-node".to_string(),
			address: String::new(),
			token: "old-token".to_string(),
			agent_cert_fingerprint: None,
			status: NodeStatus::Offline,
			health: NodeHealth::Unknown,
			last_seen: None,
			agent_version: String::new(),
		})
		.unwrap();

	let server_identity = tls::load_or_generate_identity(&primary_dir.path().join("tls")).unwrap();
	let server_fingerprint = server_identity.fingerprint();
	let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&server_identity).unwrap()));
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();

	let identity_dir = TempDir::new().unwrap();
	let identity = tls::load_or_generate_identity(&identity_dir.path().join("tls")).unwrap();
	let connector = TlsConnector::from(Arc::new(tls::client_config(&identity).unwrap()));

	// A session established under the old token stays valid; `Session`
	// itself never re-checks the token after the handshake completes.
	let live_session =
		handshake_with_token(&listener, &acceptor, &registry, &server_fingerprint, &connector, addr, "old-token")
			.await
			.expect("handshake under the pre-rotation token should succeed");
	drop(live_session);

	registry.rotate_token(NODE_ID, "new-token".to_string()).unwrap();

	let rejected =
		handshake_with_token(&listener, &acceptor, &registry, &server_fingerprint, &connector, addr, "old-token").await;
	assert!(matches!(rejected, Err(SyncdError::Authentication { .. })), "stale token must be rejected after rotation");

	let accepted =
		handshake_with_token(&listener, &acceptor, &registry, &server_fingerprint, &connector, addr, "new-token")
			.await;
	assert!(accepted.is_ok(), "the freshly rotated token should authenticate");
}

// vim: ts=4
