//! Authentication methods of the `pg` protocol: `md5`, `password` and
//! `trust`. The method names come from the meta database; the hashing
//! primitive behind them is a server implementation detail.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::core::ServerError;
use crate::parser::DEFAULT_PROTOCOL;

/// Challenge seed length in the handshake init packet.
pub const SEED_LEN: usize = 20;
/// Login signature length in the login request packet.
pub const SIGN_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Md5,
    Password,
    Trust,
}

impl AuthMethod {
    pub fn parse(protocol: &str, name: &str) -> Result<AuthMethod, ServerError> {
        if !protocol.eq_ignore_ascii_case(DEFAULT_PROTOCOL) {
            return Err(ServerError::Protocol(format!(
                "unknown auth protocol '{protocol}'"
            )));
        }
        match name.to_ascii_lowercase().as_str() {
            "md5" => Ok(AuthMethod::Md5),
            "password" => Ok(AuthMethod::Password),
            "trust" => Ok(AuthMethod::Trust),
            _ => Err(ServerError::Protocol(format!(
                "unknown auth method '{name}' in {protocol} protocol"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Md5 => "md5",
            AuthMethod::Password => "password",
            AuthMethod::Trust => "trust",
        }
    }

    /// Derives the stored form of a password for the meta `user` table.
    /// `trust` stores nothing.
    pub fn gen_store_password(&self, user: &str, password: &str) -> Option<String> {
        match self {
            AuthMethod::Md5 => {
                let mut hasher = Sha256::new();
                hasher.update(user.as_bytes());
                hasher.update(b":");
                hasher.update(password.as_bytes());
                Some(hex(&hasher.finalize()))
            }
            AuthMethod::Password => Some(password.to_string()),
            AuthMethod::Trust => None,
        }
    }

    /// The login signature over the stored password and the connection's
    /// challenge seed.
    pub fn sign(&self, stored: &str, seed: &[u8]) -> [u8; SIGN_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(stored.as_bytes());
        hasher.update(seed);
        let digest = hasher.finalize();
        let mut sign = [0u8; SIGN_LEN];
        sign.copy_from_slice(&digest[..SIGN_LEN]);
        sign
    }

    /// Validates a client signature. `trust` accepts anything; the other
    /// methods require a stored password row.
    pub fn verify(&self, stored: Option<&str>, seed: &[u8], sign: &[u8]) -> bool {
        match self {
            AuthMethod::Trust => true,
            _ => match stored {
                Some(stored) => self.sign(stored, seed)[..] == sign[..],
                None => false,
            },
        }
    }
}

/// A fresh random challenge seed for one connection.
pub fn new_seed() -> [u8; SEED_LEN] {
    let mut seed = [0u8; SEED_LEN];
    rand::thread_rng().fill_bytes(&mut seed);
    seed
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_round_trip() {
        let method = AuthMethod::Md5;
        let stored = method.gen_store_password("test", "123").unwrap();
        let seed = new_seed();
        let sign = method.sign(&stored, &seed);
        assert!(method.verify(Some(&stored), &seed, &sign));
        assert!(!method.verify(Some(&stored), &seed, &[0u8; SIGN_LEN]));
        assert!(!method.verify(None, &seed, &sign));
    }

    #[test]
    fn test_trust_accepts_anything() {
        let seed = new_seed();
        assert!(AuthMethod::Trust.verify(None, &seed, &[0u8; SIGN_LEN]));
    }

    #[test]
    fn test_unknown_method_rejected() {
        assert!(AuthMethod::parse("pg", "passwd").is_err());
        assert!(AuthMethod::parse("mysql", "md5").is_err());
        assert_eq!(AuthMethod::parse("pg", "MD5").unwrap(), AuthMethod::Md5);
    }
}
