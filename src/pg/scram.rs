//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677), without channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name announced in the SASL initial response.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header for "no channel binding, no authzid", base64 of `n,,`.
const CHANNEL_BINDING: &str = "biws";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScramError {
    #[error("server message is not valid UTF-8")]
    InvalidEncoding,
    #[error("server-first-message is missing the {0} attribute")]
    MissingAttribute(&'static str),
    #[error("server salt is not valid base64")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server reported: {0}")]
    ServerRejected(String),
    #[error("server signature does not match")]
    SignatureMismatch,
    #[error("message received out of order")]
    OutOfOrder,
}

enum Phase {
    /// client-first sent, waiting for server-first
    First { nonce: String },
    /// client-final sent, waiting for the server signature
    Final { expected_signature: [u8; 32] },
    Done,
}

/// One SCRAM-SHA-256 exchange.
pub struct ScramSha256 {
    user: String,
    password: String,
    phase: Phase,
}

impl ScramSha256 {
    pub fn new(user: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(user, password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(user: &str, password: &str, nonce: String) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            phase: Phase::First { nonce },
        }
    }

    fn client_first_bare(&self, nonce: &str) -> String {
        // PostgreSQL ignores the SCRAM user name in favour of the startup user.
        format!("n={},r={}", self.user.replace('=', "=3D").replace(',', "=2C"), nonce)
    }

    /// `n,,n=<user>,r=<nonce>`
    pub fn client_first(&self) -> Vec<u8> {
        match &self.phase {
            Phase::First { nonce } => format!("n,,{}", self.client_first_bare(nonce)).into_bytes(),
            _ => Vec::new(),
        }
    }

    /// Consume server-first (`r=..,s=..,i=..`) and produce client-final.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, ScramError> {
        let Phase::First { nonce } = &self.phase else {
            return Err(ScramError::OutOfOrder);
        };
        let server_first =
            std::str::from_utf8(server_first).map_err(|_| ScramError::InvalidEncoding)?;

        let attr = |key: &'static str| {
            server_first
                .split(',')
                .find_map(|part| part.strip_prefix(key).and_then(|v| v.strip_prefix('=')))
                .ok_or(ScramError::MissingAttribute(key))
        };
        let server_nonce = attr("r")?;
        let salt = BASE64
            .decode(attr("s")?)
            .map_err(|_| ScramError::InvalidSalt)?;
        let iterations: u32 = attr("i")?
            .parse()
            .map_err(|_| ScramError::InvalidIterations)?;
        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }
        if !server_nonce.starts_with(nonce.as_str()) {
            return Err(ScramError::NonceMismatch);
        }

        let salted = salted_password(&self.password, &salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={},r={}", CHANNEL_BINDING, server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(nonce),
            server_first,
            without_proof
        );

        let signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(signature.iter()) {
            *p ^= s;
        }

        let server_key = hmac(&salted, b"Server Key");
        self.phase = Phase::Final {
            expected_signature: hmac(&server_key, auth_message.as_bytes()),
        };

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check server-final (`v=<signature>` or `e=<error>`).
    pub fn verify(&mut self, server_final: &[u8]) -> Result<(), ScramError> {
        let Phase::Final { expected_signature } = &self.phase else {
            return Err(ScramError::OutOfOrder);
        };
        let server_final =
            std::str::from_utf8(server_final).map_err(|_| ScramError::InvalidEncoding)?;
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerRejected(err.to_string()));
        }
        let verifier = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or(ScramError::MissingAttribute("v"))?;
        let signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::SignatureMismatch)?;
        if signature.as_slice() != expected_signature.as_slice() {
            return Err(ScramError::SignatureMismatch);
        }
        self.phase = Phase::Done;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }
}

/// Hi(password, salt, i): PBKDF2-HMAC-SHA-256 with a 32-byte output.
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    // HMAC accepts any key length and 32 bytes is a valid output size, so
    // this cannot fail.
    let _ = pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC takes keys of any length"));
    mac.update(data);
    mac.finalize().into_bytes().into()
}
