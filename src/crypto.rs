//! Cryptographic primitives for the Concordat protocol.
//!
//! Provides signing and verification polymorphic over a closed family of
//! algorithms: Ed25519 via `ed25519-dalek`, RSA-PSS over SHA-256 via `rsa`,
//! and ML-DSA-44 (FIPS 204) via `fips204`. Also provides SHA-256 hashing,
//! key fingerprints, timestamps, and constant-time comparison.
//!
//! All algorithms share one record shape at the protocol level; only the
//! signing/verification primitives differ. Signatures are always made over
//! a 32-byte SHA-256 digest of canonical content, never the content itself.

use crate::ConcordatError;
use ed25519_dalek::{Signer as _, Verifier as _};
use fips204::traits::{SerDes as _, Signer as _, Verifier as _};
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::signature::{RandomizedSigner as _, SignatureEncoding as _, Verifier as _};
use sha2::{Digest, Sha256};

/// RSA modulus size used for generated RSA-PSS keys.
const RSA_BITS: usize = 2048;

// ---------------------------------------------------------------------------
// Algorithm
// ---------------------------------------------------------------------------

/// The closed set of supported signing algorithms.
///
/// New variants are added here; call sites dispatch through [`KeyPair`] and
/// [`PublicKey`] and never inspect the variant directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Algorithm {
    /// Ed25519 elliptic-curve signatures.
    #[serde(rename = "ed25519")]
    Ed25519,
    /// RSA-PSS probabilistic signatures over SHA-256, 2048-bit modulus.
    #[serde(rename = "rsa-pss")]
    RsaPss,
    /// ML-DSA-44 lattice-based post-quantum signatures (FIPS 204).
    #[serde(rename = "ml-dsa-44")]
    MlDsa44,
}

impl Algorithm {
    /// All supported algorithms, in no particular order.
    pub const ALL: [Algorithm; 3] = [Algorithm::Ed25519, Algorithm::RsaPss, Algorithm::MlDsa44];

    /// Wire name of the algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Ed25519 => "ed25519",
            Algorithm::RsaPss => "rsa-pss",
            Algorithm::MlDsa44 => "ml-dsa-44",
        }
    }

    /// Approximate classical security strength in bits, used by agreement
    /// minimum-strength constraints.
    pub fn strength_bits(&self) -> u32 {
        match self {
            Algorithm::Ed25519 => 128,
            Algorithm::RsaPss => 112,
            Algorithm::MlDsa44 => 128,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = ConcordatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ed25519" => Ok(Algorithm::Ed25519),
            "rsa-pss" => Ok(Algorithm::RsaPss),
            "ml-dsa-44" => Ok(Algorithm::MlDsa44),
            other => Err(ConcordatError::UnknownAlgorithm(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Public keys
// ---------------------------------------------------------------------------

/// Public key material for any supported algorithm.
///
/// ML-DSA keys are held as their validated byte encoding and reconstructed
/// on use; Ed25519 and RSA keys are held in parsed form.
#[derive(Debug, Clone, PartialEq)]
pub enum PublicKey {
    Ed25519(ed25519_dalek::VerifyingKey),
    RsaPss(rsa::RsaPublicKey),
    MlDsa44(Vec<u8>),
}

impl PublicKey {
    /// The algorithm this key belongs to.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            PublicKey::Ed25519(_) => Algorithm::Ed25519,
            PublicKey::RsaPss(_) => Algorithm::RsaPss,
            PublicKey::MlDsa44(_) => Algorithm::MlDsa44,
        }
    }

    /// Canonical byte encoding: raw 32 bytes for Ed25519, PKCS#1 DER for
    /// RSA, FIPS 204 encoding for ML-DSA.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConcordatError> {
        match self {
            PublicKey::Ed25519(vk) => Ok(vk.as_bytes().to_vec()),
            PublicKey::RsaPss(pk) => Ok(pk
                .to_pkcs1_der()
                .map_err(|e| ConcordatError::CryptoError(format!("RSA key encoding: {}", e)))?
                .as_bytes()
                .to_vec()),
            PublicKey::MlDsa44(bytes) => Ok(bytes.clone()),
        }
    }

    /// Parse a public key from its canonical byte encoding.
    pub fn from_bytes(algorithm: Algorithm, bytes: &[u8]) -> Result<Self, ConcordatError> {
        match algorithm {
            Algorithm::Ed25519 => {
                let arr: [u8; 32] = bytes.try_into().map_err(|_| {
                    ConcordatError::CryptoError(format!(
                        "Ed25519 public key must be 32 bytes, got {}",
                        bytes.len()
                    ))
                })?;
                let vk = ed25519_dalek::VerifyingKey::from_bytes(&arr)
                    .map_err(|e| ConcordatError::CryptoError(format!("Ed25519 key: {}", e)))?;
                Ok(PublicKey::Ed25519(vk))
            }
            Algorithm::RsaPss => {
                let pk = rsa::RsaPublicKey::from_pkcs1_der(bytes)
                    .map_err(|e| ConcordatError::CryptoError(format!("RSA key: {}", e)))?;
                Ok(PublicKey::RsaPss(pk))
            }
            Algorithm::MlDsa44 => {
                let arr: [u8; fips204::ml_dsa_44::PK_LEN] = bytes.try_into().map_err(|_| {
                    ConcordatError::CryptoError(format!(
                        "ML-DSA-44 public key must be {} bytes, got {}",
                        fips204::ml_dsa_44::PK_LEN,
                        bytes.len()
                    ))
                })?;
                // Validate the encoding up front so later use cannot fail.
                fips204::ml_dsa_44::PublicKey::try_from_bytes(arr)
                    .map_err(|e| ConcordatError::CryptoError(format!("ML-DSA-44 key: {}", e)))?;
                Ok(PublicKey::MlDsa44(bytes.to_vec()))
            }
        }
    }

    /// Parse a public key from its hex encoding.
    pub fn from_hex(algorithm: Algorithm, hex_str: &str) -> Result<Self, ConcordatError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| ConcordatError::CryptoError(format!("Invalid key hex: {}", e)))?;
        Self::from_bytes(algorithm, &bytes)
    }

    /// Hex encoding of the canonical key bytes.
    pub fn to_hex(&self) -> Result<String, ConcordatError> {
        Ok(hex::encode(self.to_bytes()?))
    }

    /// SHA-256 fingerprint of the canonical key bytes, lowercase hex.
    pub fn fingerprint(&self) -> Result<String, ConcordatError> {
        Ok(sha256_hex(&self.to_bytes()?))
    }

    /// Verify a signature over a content digest.
    ///
    /// Returns `true` if the signature is valid, `false` otherwise. Never
    /// panics on malformed inputs -- any error is treated as an invalid
    /// signature.
    pub fn verify_digest(&self, digest: &[u8], signature: &[u8]) -> bool {
        match self {
            PublicKey::Ed25519(vk) => {
                let sig_bytes: [u8; 64] = match signature.try_into() {
                    Ok(b) => b,
                    Err(_) => return false,
                };
                let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
                vk.verify(digest, &sig).is_ok()
            }
            PublicKey::RsaPss(pk) => {
                let vk = rsa::pss::VerifyingKey::<Sha256>::new(pk.clone());
                match rsa::pss::Signature::try_from(signature) {
                    Ok(sig) => vk.verify(digest, &sig).is_ok(),
                    Err(_) => false,
                }
            }
            PublicKey::MlDsa44(bytes) => {
                let pk_arr: [u8; fips204::ml_dsa_44::PK_LEN] = match bytes.as_slice().try_into() {
                    Ok(a) => a,
                    Err(_) => return false,
                };
                let pk = match fips204::ml_dsa_44::PublicKey::try_from_bytes(pk_arr) {
                    Ok(pk) => pk,
                    Err(_) => return false,
                };
                let sig_arr: [u8; fips204::ml_dsa_44::SIG_LEN] = match signature.try_into() {
                    Ok(a) => a,
                    Err(_) => return false,
                };
                pk.verify(digest, &sig_arr, &[])
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Key pairs
// ---------------------------------------------------------------------------

enum SecretKey {
    Ed25519(ed25519_dalek::SigningKey),
    RsaPss(rsa::RsaPrivateKey),
    MlDsa44(Vec<u8>),
}

/// A signing key pair for one of the supported algorithms.
pub struct KeyPair {
    algorithm: Algorithm,
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair from cryptographically secure randomness.
    ///
    /// # Errors
    /// Returns `ConcordatError::CryptoError` if key generation fails.
    pub fn generate(algorithm: Algorithm) -> Result<KeyPair, ConcordatError> {
        match algorithm {
            Algorithm::Ed25519 => {
                let mut rng = rand::thread_rng();
                let mut secret = [0u8; 32];
                rng.fill_bytes(&mut secret);
                let signing_key = ed25519_dalek::SigningKey::from_bytes(&secret);
                let public = PublicKey::Ed25519(signing_key.verifying_key());
                Ok(KeyPair {
                    algorithm,
                    secret: SecretKey::Ed25519(signing_key),
                    public,
                })
            }
            Algorithm::RsaPss => {
                let mut rng = rand::thread_rng();
                let private = rsa::RsaPrivateKey::new(&mut rng, RSA_BITS)
                    .map_err(|e| ConcordatError::CryptoError(format!("RSA keygen: {}", e)))?;
                let public = PublicKey::RsaPss(private.to_public_key());
                Ok(KeyPair {
                    algorithm,
                    secret: SecretKey::RsaPss(private),
                    public,
                })
            }
            Algorithm::MlDsa44 => {
                let (pk, sk) = fips204::ml_dsa_44::try_keygen()
                    .map_err(|e| ConcordatError::CryptoError(format!("ML-DSA keygen: {}", e)))?;
                let public = PublicKey::MlDsa44(pk.into_bytes().to_vec());
                Ok(KeyPair {
                    algorithm,
                    secret: SecretKey::MlDsa44(sk.into_bytes().to_vec()),
                    public,
                })
            }
        }
    }

    /// The algorithm this key pair belongs to.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The public half of the pair.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Hex encoding of the public key bytes.
    pub fn public_key_hex(&self) -> Result<String, ConcordatError> {
        self.public.to_hex()
    }

    /// SHA-256 fingerprint of the public key bytes, lowercase hex.
    pub fn fingerprint(&self) -> Result<String, ConcordatError> {
        self.public.fingerprint()
    }

    /// Sign a content digest, returning the detached signature bytes.
    ///
    /// # Errors
    /// Returns `ConcordatError::CryptoError` if the underlying primitive
    /// fails (e.g. RSA blinding randomness).
    pub fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, ConcordatError> {
        match &self.secret {
            SecretKey::Ed25519(signing_key) => Ok(signing_key.sign(digest).to_bytes().to_vec()),
            SecretKey::RsaPss(private) => {
                let signing_key = rsa::pss::BlindedSigningKey::<Sha256>::new(private.clone());
                let mut rng = rand::thread_rng();
                let sig = signing_key
                    .try_sign_with_rng(&mut rng, digest)
                    .map_err(|e| ConcordatError::CryptoError(format!("RSA-PSS sign: {}", e)))?;
                Ok(sig.to_vec())
            }
            SecretKey::MlDsa44(sk_bytes) => {
                let sk_arr: [u8; fips204::ml_dsa_44::SK_LEN] =
                    sk_bytes.as_slice().try_into().map_err(|_| {
                        ConcordatError::CryptoError("ML-DSA-44 secret key corrupted".to_string())
                    })?;
                let sk = fips204::ml_dsa_44::PrivateKey::try_from_bytes(sk_arr)
                    .map_err(|e| ConcordatError::CryptoError(format!("ML-DSA-44 key: {}", e)))?;
                let sig = sk
                    .try_sign(digest, &[])
                    .map_err(|e| ConcordatError::CryptoError(format!("ML-DSA-44 sign: {}", e)))?;
                Ok(sig.to_vec())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Hashing and utilities
// ---------------------------------------------------------------------------

/// Compute the SHA-256 hash of raw bytes and return it as a lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Compute the SHA-256 hash of a UTF-8 string and return it as a lowercase hex string.
pub fn sha256_string(data: &str) -> String {
    sha256_hex(data.as_bytes())
}

/// Constant-time comparison of two byte slices.
///
/// Returns `true` only if both slices have the same length and identical
/// contents. The comparison time is proportional to the length of the
/// slices, preventing timing side-channel attacks.
pub fn constant_time_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Return the current UTC time as an ISO 8601 string.
///
/// Format: `YYYY-MM-DDTHH:MM:SS.sssZ`
pub fn timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse an ISO 8601 timestamp string into a chrono DateTime.
/// Handles both RFC 3339 and the millisecond format produced by
/// [`timestamp`].
pub fn parse_timestamp(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&chrono::Utc));
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.3fZ") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ") {
        return Some(dt.and_utc());
    }
    None
}
