//! ML-KEM-768 key encapsulation for the transport handshake.
//!
//! A client encapsulates against the server's public key and sends the raw
//! ciphertext as its first datagram. The server decapsulates it to obtain
//! the 32-byte shared secret, which becomes the connection's
//! [`AeadKey`](crate::aead::AeadKey).
//!
//! ML-KEM uses implicit rejection: a well-sized but forged ciphertext
//! decapsulates to an unrelated pseudo-random key rather than failing. Only a
//! malformed length is reported as an error here; a forged ciphertext simply
//! never completes the handshake.

use crate::{CryptoError, aead::AeadKey};
use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use std::path::Path;
use zeroize::Zeroizing;

/// Encapsulated key size on the wire.
pub const CIPHERTEXT_SIZE: usize = 1088;

/// Public key size.
pub const PUBLIC_KEY_SIZE: usize = 1184;

/// Secret key size.
pub const SECRET_KEY_SIZE: usize = 2400;

/// Server-side KEM keypair.
pub struct KemPrivateKey {
    sk: mlkem768::SecretKey,
    pk: mlkem768::PublicKey,
}

impl KemPrivateKey {
    /// Generate a fresh keypair.
    #[must_use]
    pub fn generate() -> Self {
        let (pk, sk) = mlkem768::keypair();
        Self { sk, pk }
    }

    /// Public half of this keypair.
    #[must_use]
    pub fn public_key(&self) -> KemPublicKey {
        KemPublicKey(self.pk)
    }

    /// Recover the shared transport key from a client ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidCiphertext` if `ciphertext` is not exactly
    /// [`CIPHERTEXT_SIZE`] bytes.
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<AeadKey, CryptoError> {
        let ct = mlkem768::Ciphertext::from_bytes(ciphertext)
            .map_err(|_| CryptoError::InvalidCiphertext(ciphertext.len()))?;
        let shared = mlkem768::decapsulate(&ct, &self.sk);
        AeadKey::from_slice(shared.as_bytes())
    }

    /// Serialize as `secret_key || public_key`.
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(SECRET_KEY_SIZE + PUBLIC_KEY_SIZE));
        out.extend_from_slice(self.sk.as_bytes());
        out.extend_from_slice(self.pk.as_bytes());
        out
    }

    /// Parse `secret_key || public_key`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` on a wrong total size, or
    /// `CryptoError::InvalidKeyMaterial` if either half is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SECRET_KEY_SIZE + PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SECRET_KEY_SIZE + PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }

        let (sk_bytes, pk_bytes) = bytes.split_at(SECRET_KEY_SIZE);
        let sk = mlkem768::SecretKey::from_bytes(sk_bytes)
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        let pk = mlkem768::PublicKey::from_bytes(pk_bytes)
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        Ok(Self { sk, pk })
    }

    /// Load a hex-encoded key file.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyFile` if the file cannot be read, or a parse
    /// error as in [`KemPrivateKey::from_bytes`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let contents = Zeroizing::new(std::fs::read_to_string(path)?);
        let raw = Zeroizing::new(
            hex::decode(contents.trim()).map_err(|_| CryptoError::InvalidKeyMaterial)?,
        );
        Self::from_bytes(&raw)
    }

    /// Write the keypair as hex to `path`, readable only by the owner on unix.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyFile` if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CryptoError> {
        let path = path.as_ref();
        let encoded = Zeroizing::new(hex::encode(self.to_bytes().as_slice()));
        std::fs::write(path, encoded.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for KemPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KemPrivateKey")
            .field("public_key", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

/// Public KEM key handed to clients out of band.
#[derive(Clone, Copy)]
pub struct KemPublicKey(mlkem768::PublicKey);

impl KemPublicKey {
    /// Parse a raw public key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyMaterial` if the bytes are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        mlkem768::PublicKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidKeyMaterial)
    }

    /// Raw public key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Hex encoding of the public key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Client side of the handshake: returns the transport key and the
    /// ciphertext to send to the server.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the shared secret has an
    /// unexpected size.
    pub fn encapsulate(&self) -> Result<(AeadKey, Vec<u8>), CryptoError> {
        let (shared, ct) = mlkem768::encapsulate(&self.0);
        let key = AeadKey::from_slice(shared.as_bytes())?;
        Ok((key, ct.as_bytes().to_vec()))
    }
}
