//! Opaque TLS transport layer contract.
//!
//! The managed session never runs a handshake itself. It asks a
//! [`TlsContext`] for a [`TlsLayer`] bound to the raw transport and then
//! drives that layer from the reactor's event dispatch.

use crate::error::SessionError;
use crate::io_session::IoSession;
use crate::types::NamedEndpoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;

/// Handshake role
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsRole {
    /// Connection was initiated locally towards a named endpoint
    Client,
    /// Connection was accepted
    Server,
}

/// Allocation policy for the layer's scratch buffers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsBufferStrategy {
    /// Buffers are allocated once with the layer
    #[default]
    Static,
    /// Buffers are allocated per transport operation and released afterwards
    Dynamic,
}

/// Negotiated parameters of an established TLS session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsDetails {
    /// Protocol version, e.g. `TLSv1_3`
    pub protocol: Option<String>,
    /// Cipher suite name
    pub cipher_suite: Option<String>,
    /// Negotiated ALPN protocol
    pub alpn_protocol: Option<Vec<u8>>,
    /// SNI server name
    pub server_name: Option<String>,
    /// Number of certificates presented by the peer
    pub peer_certificates: usize,
}

/// Hook run when the layer starts its handshake
pub trait TlsSessionInitializer: Send + Sync {
    /// Prepare the handshake for `endpoint`
    fn initialize(&self, endpoint: Option<&NamedEndpoint>, role: TlsRole) -> io::Result<()>;
}

/// Hook run once the handshake completes
pub trait TlsSessionVerifier: Send + Sync {
    /// Accept or reject the negotiated session
    fn verify(&self, endpoint: Option<&NamedEndpoint>, details: &TlsDetails) -> io::Result<()>;
}

/// Everything a [`TlsContext`] needs to build a layer
pub struct TlsLayerParams {
    /// Endpoint of client-initiated sessions
    pub endpoint: Option<NamedEndpoint>,
    /// Handshake role
    pub role: TlsRole,
    /// Raw transport the layer encrypts
    pub transport: Arc<dyn IoSession>,
    /// Scratch buffer policy
    pub buffer_strategy: TlsBufferStrategy,
    /// Optional handshake hook
    pub initializer: Option<Arc<dyn TlsSessionInitializer>>,
    /// Optional verification hook
    pub verifier: Option<Arc<dyn TlsSessionVerifier>>,
}

impl fmt::Debug for TlsLayerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsLayerParams")
            .field("endpoint", &self.endpoint)
            .field("role", &self.role)
            .field("transport", &self.transport.id())
            .field("buffer_strategy", &self.buffer_strategy)
            .field("initializer", &self.initializer.is_some())
            .field("verifier", &self.verifier.is_some())
            .finish()
    }
}

/// Factory for TLS layers, typically wrapping a TLS library configuration
pub trait TlsContext: Send + Sync {
    /// Build a layer over `params.transport`
    fn create_layer(&self, params: TlsLayerParams) -> Result<Arc<dyn TlsLayer>, SessionError>;
}

/// A TLS transport layered over a raw session.
///
/// Session accessors inherited from [`IoSession`] operate on the plaintext
/// side: the event mask is the application's interest, `channel` reads and
/// writes application data, `close` sends a close notification.
pub trait TlsLayer: IoSession + fmt::Debug {
    /// This layer as a plain session handle
    fn as_io_session(&self) -> &dyn IoSession;

    /// Start the handshake. Idempotent.
    fn initialize(&self) -> io::Result<()>;
    /// Whether [`initialize`](Self::initialize) has run
    fn is_initialized(&self) -> bool;

    /// Whether decrypted application data (or end of stream) is ready
    fn is_app_input_ready(&self) -> io::Result<bool>;
    /// Whether decrypted bytes remain without another network read
    fn has_input_data(&self) -> bool;
    /// Whether the application may write now
    fn is_app_output_ready(&self) -> io::Result<bool>;

    /// Read ciphertext from the transport and advance the handshake
    fn inbound_transport(&self) -> io::Result<()>;
    /// Write pending ciphertext to the transport
    fn outbound_transport(&self) -> io::Result<()>;

    /// Peer finished its half of the session
    fn is_inbound_done(&self) -> bool;
    /// Local half finished
    fn is_outbound_done(&self) -> bool;

    /// Negotiated parameters once the handshake has completed
    fn tls_details(&self) -> Option<TlsDetails>;
}
