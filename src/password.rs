//! Credential hashing and verification
//!
//! Every hash produced here is self-describing: the encoded string carries the
//! scheme tag, its cost parameters, the salt and the digest, so verification
//! never needs to know out of band how a credential was produced.
//!
//! Supported schemes:
//! - `$argon2id$...` PHC strings (recommended default, memory-hard)
//! - `$pbkdf2-sha256$i=<iterations>$<salt>$<digest>` (high iteration count)
//! - `{SSHA256}` salted SHA-256 (legacy directory exports)
//! - `{SSHA}` salted SHA-1 (legacy LDAP directories)
//!
//! Salts and digests are fixed-length per scheme and compared in constant time.

use std::fmt;

use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::SaltString,
};
use base64::{
    Engine,
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
};
use rand::{RngCore, rngs::OsRng};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::HashError;

const ARGON2_SALT_B64_LEN: usize = 22;
const ARGON2_OUTPUT_LEN: usize = 32;
const PBKDF2_SALT_LEN: usize = 16;
const PBKDF2_OUTPUT_LEN: usize = 32;
const PBKDF2_MAX_ITERATIONS: u32 = 10_000_000;
const SSHA_SALT_LEN: usize = 8;
const SHA1_LEN: usize = 20;
const SHA256_LEN: usize = 32;

/// Hash schemes understood by the verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashScheme {
    Argon2id,
    Pbkdf2Sha256,
    SaltedSha256,
    Ssha,
}

impl HashScheme {
    /// Prefix identifying the scheme in an encoded hash
    pub fn tag(&self) -> &'static str {
        match self {
            HashScheme::Argon2id => "$argon2id$",
            HashScheme::Pbkdf2Sha256 => "$pbkdf2-sha256$",
            HashScheme::SaltedSha256 => "{SSHA256}",
            HashScheme::Ssha => "{SSHA}",
        }
    }

    /// Detect the scheme of an encoded hash from its tag
    pub fn detect(encoded: &str) -> Result<Self, HashError> {
        if encoded.starts_with(HashScheme::Argon2id.tag()) {
            return Ok(HashScheme::Argon2id);
        }
        if encoded.starts_with(HashScheme::Pbkdf2Sha256.tag()) {
            return Ok(HashScheme::Pbkdf2Sha256);
        }
        // {SSHA256} must be checked before {SSHA}
        if has_prefix_ignore_case(encoded, HashScheme::SaltedSha256.tag()) {
            return Ok(HashScheme::SaltedSha256);
        }
        if has_prefix_ignore_case(encoded, HashScheme::Ssha.tag()) {
            return Ok(HashScheme::Ssha);
        }

        if let Some(rest) = encoded.strip_prefix('$') {
            let tag = rest.split('$').next().unwrap_or_default();
            return Err(HashError::UnsupportedScheme(tag.to_owned()));
        }
        if let Some(rest) = encoded.strip_prefix('{')
            && let Some((tag, _)) = rest.split_once('}')
        {
            return Err(HashError::UnsupportedScheme(tag.to_owned()));
        }
        Err(HashError::MalformedHash("missing scheme tag".to_owned()))
    }
}

impl fmt::Display for HashScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashScheme::Argon2id => "argon2id",
            HashScheme::Pbkdf2Sha256 => "pbkdf2-sha256",
            HashScheme::SaltedSha256 => "ssha256",
            HashScheme::Ssha => "ssha",
        };
        f.write_str(name)
    }
}

fn has_prefix_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Cost parameters for the schemes that have them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashParams {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,
    /// Argon2 time cost
    pub argon2_iterations: u32,
    /// Argon2 parallelism
    pub argon2_lanes: u32,
    /// PBKDF2-HMAC-SHA256 iteration count
    pub pbkdf2_iterations: u32,
}

impl Default for HashParams {
    /// OWASP recommendations: Argon2id m=19456, t=2, p=1; PBKDF2-SHA256 600k rounds
    fn default() -> Self {
        Self {
            argon2_memory_kib: 19_456,
            argon2_iterations: 2,
            argon2_lanes: 1,
            pbkdf2_iterations: 600_000,
        }
    }
}

#[cfg(test)]
impl HashParams {
    /// Cheap parameters so unit tests stay fast
    pub(crate) fn fast() -> Self {
        Self {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_lanes: 1,
            pbkdf2_iterations: 1_000,
        }
    }
}

/// Clear text password with automatic memory zeroization
///
/// Does not implement `Clone`, and `Debug` output is redacted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ClearTextPassword(String);

impl ClearTextPassword {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for ClearTextPassword {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl fmt::Debug for ClearTextPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClearTextPassword")
            .field(&"[REDACTED]")
            .finish()
    }
}

/// Hashes and verifies passwords under every supported scheme
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    params: HashParams,
    default_scheme: HashScheme,
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self::new(HashParams::default())
    }
}

impl CredentialHasher {
    pub fn new(params: HashParams) -> Self {
        Self {
            params,
            default_scheme: HashScheme::Argon2id,
        }
    }

    pub fn params(&self) -> &HashParams {
        &self.params
    }

    pub fn default_scheme(&self) -> HashScheme {
        self.default_scheme
    }

    /// Hash with the recommended default scheme
    pub fn hash_default(&self, password: &ClearTextPassword) -> Result<String, HashError> {
        self.hash(password, self.default_scheme)
    }

    /// Hash a password, returning a self-describing encoded string
    pub fn hash(
        &self,
        password: &ClearTextPassword,
        scheme: HashScheme,
    ) -> Result<String, HashError> {
        match scheme {
            HashScheme::Argon2id => {
                let salt = SaltString::generate(&mut OsRng);
                self.argon2()?
                    .hash_password(password.as_bytes(), &salt)
                    .map(|hash| hash.to_string())
                    .map_err(|e| HashError::HashingFailed(e.to_string()))
            }
            HashScheme::Pbkdf2Sha256 => {
                let mut salt = [0u8; PBKDF2_SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                let iterations = self.params.pbkdf2_iterations;
                let digest = pbkdf2_sha256(password.as_bytes(), &salt, iterations);
                Ok(format!(
                    "{}i={}${}${}",
                    scheme.tag(),
                    iterations,
                    STANDARD_NO_PAD.encode(salt),
                    STANDARD_NO_PAD.encode(digest.as_slice())
                ))
            }
            HashScheme::SaltedSha256 => {
                let mut salt = [0u8; SSHA_SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                Ok(encode_salted::<Sha256>(scheme, password.as_bytes(), &salt))
            }
            HashScheme::Ssha => {
                let mut salt = [0u8; SSHA_SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                Ok(encode_salted::<Sha1>(scheme, password.as_bytes(), &salt))
            }
        }
    }

    /// Verify a password against an encoded hash
    ///
    /// Returns `Ok(false)` for a wrong password and `Err` when the stored hash
    /// cannot be parsed or names a scheme this verifier does not know.
    pub fn verify(&self, password: &ClearTextPassword, encoded: &str) -> Result<bool, HashError> {
        match HashScheme::detect(encoded)? {
            HashScheme::Argon2id => verify_argon2(password, encoded),
            HashScheme::Pbkdf2Sha256 => verify_pbkdf2(password, encoded),
            HashScheme::SaltedSha256 => {
                verify_salted::<Sha256>(HashScheme::SaltedSha256, SHA256_LEN, password, encoded)
            }
            HashScheme::Ssha => verify_salted::<Sha1>(HashScheme::Ssha, SHA1_LEN, password, encoded),
        }
    }

    /// Whether a stored hash should be replaced with one under the default scheme
    /// and current parameters
    pub fn needs_rehash(&self, encoded: &str) -> bool {
        match HashScheme::detect(encoded) {
            Ok(HashScheme::Argon2id) if self.default_scheme == HashScheme::Argon2id => {
                let Ok(parsed) = PasswordHash::new(encoded) else {
                    return true;
                };
                let Ok(params) = Params::try_from(&parsed) else {
                    return true;
                };
                params.m_cost() < self.params.argon2_memory_kib
                    || params.t_cost() < self.params.argon2_iterations
            }
            Ok(HashScheme::Pbkdf2Sha256) if self.default_scheme == HashScheme::Pbkdf2Sha256 => {
                parse_pbkdf2(encoded)
                    .map(|parts| parts.iterations < self.params.pbkdf2_iterations)
                    .unwrap_or(true)
            }
            _ => true,
        }
    }

    fn argon2(&self) -> Result<Argon2<'static>, HashError> {
        let params = Params::new(
            self.params.argon2_memory_kib,
            self.params.argon2_iterations,
            self.params.argon2_lanes,
            Some(ARGON2_OUTPUT_LEN),
        )
        .map_err(|e| HashError::HashingFailed(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

fn verify_argon2(password: &ClearTextPassword, encoded: &str) -> Result<bool, HashError> {
    let parsed =
        PasswordHash::new(encoded).map_err(|e| HashError::MalformedHash(e.to_string()))?;

    let salt_ok = parsed
        .salt
        .is_some_and(|salt| salt.as_str().len() == ARGON2_SALT_B64_LEN);
    let output_ok = parsed
        .hash
        .is_some_and(|output| output.len() == ARGON2_OUTPUT_LEN);
    if !salt_ok || !output_ok {
        return Err(HashError::MalformedHash(
            "argon2id salt or digest has unexpected length".to_owned(),
        ));
    }

    // Parameters come from the hash itself; the output comparison is constant-time
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(HashError::MalformedHash(e.to_string())),
    }
}

struct Pbkdf2Parts {
    iterations: u32,
    salt: Vec<u8>,
    digest: Vec<u8>,
}

fn parse_pbkdf2(encoded: &str) -> Result<Pbkdf2Parts, HashError> {
    let malformed = |reason: &str| HashError::MalformedHash(format!("pbkdf2-sha256: {reason}"));

    let body = encoded
        .strip_prefix(HashScheme::Pbkdf2Sha256.tag())
        .ok_or_else(|| malformed("missing tag"))?;
    let mut fields = body.split('$');
    let (Some(params), Some(salt), Some(digest), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(malformed("expected i=<n>$<salt>$<digest>"));
    };

    let iterations = params
        .strip_prefix("i=")
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|n| (1..=PBKDF2_MAX_ITERATIONS).contains(n))
        .ok_or_else(|| malformed("bad iteration count"))?;

    let salt = STANDARD_NO_PAD
        .decode(salt)
        .map_err(|_| malformed("salt is not base64"))?;
    let digest = STANDARD_NO_PAD
        .decode(digest)
        .map_err(|_| malformed("digest is not base64"))?;
    if salt.len() != PBKDF2_SALT_LEN || digest.len() != PBKDF2_OUTPUT_LEN {
        return Err(malformed("salt or digest has unexpected length"));
    }

    Ok(Pbkdf2Parts {
        iterations,
        salt,
        digest,
    })
}

fn verify_pbkdf2(password: &ClearTextPassword, encoded: &str) -> Result<bool, HashError> {
    let parts = parse_pbkdf2(encoded)?;
    let computed = pbkdf2_sha256(password.as_bytes(), &parts.salt, parts.iterations);
    Ok(constant_time_eq(computed.as_slice(), &parts.digest))
}

/// PBKDF2-HMAC-SHA256 with a single 32-byte output block
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; PBKDF2_OUTPUT_LEN]> {
    let mut output = Zeroizing::new([0u8; PBKDF2_OUTPUT_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, output.as_mut_slice());
    output
}

fn salted_digest<D: Digest>(password: &[u8], salt: &[u8]) -> Vec<u8> {
    let mut hasher = D::new();
    hasher.update(password);
    hasher.update(salt);
    hasher.finalize().to_vec()
}

fn encode_salted<D: Digest>(scheme: HashScheme, password: &[u8], salt: &[u8]) -> String {
    let mut payload = salted_digest::<D>(password, salt);
    payload.extend_from_slice(salt);
    format!("{}{}", scheme.tag(), STANDARD.encode(&payload))
}

fn verify_salted<D: Digest>(
    scheme: HashScheme,
    digest_len: usize,
    password: &ClearTextPassword,
    encoded: &str,
) -> Result<bool, HashError> {
    let body = &encoded[scheme.tag().len()..];
    let payload = STANDARD
        .decode(body.trim())
        .map_err(|_| HashError::MalformedHash(format!("{scheme}: payload is not base64")))?;
    if payload.len() != digest_len + SSHA_SALT_LEN {
        return Err(HashError::MalformedHash(format!(
            "{scheme}: expected {} bytes, got {}",
            digest_len + SSHA_SALT_LEN,
            payload.len()
        )));
    }

    let (digest, salt) = payload.split_at(digest_len);
    let computed = salted_digest::<D>(password.as_bytes(), salt);
    Ok(constant_time_eq(&computed, digest))
}

/// Constant-time comparison to prevent timing attacks
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
