/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};

/// A user's RSA keypair. The public half is published on the actor document
/// at `{url}#key`, the private half signs every outbound request.
#[derive(Clone)]
pub struct Identity {
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

pub fn generate_identity() -> Result<Identity> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048).context("generate rsa key")?;
    let public_key = RsaPublicKey::from(&private_key);
    let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?.to_string();
    Ok(Identity {
        private_key,
        public_key,
        public_key_pem,
        private_key_pem,
    })
}

pub fn decode_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem).context("parse private key pem")
}

pub fn decode_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem).context("parse public key pem")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_round_trips_through_pem() {
        let id = generate_identity().unwrap();
        let private = decode_private_key(&id.private_key_pem).unwrap();
        assert_eq!(private, id.private_key);
        let public = decode_public_key(&id.public_key_pem).unwrap();
        assert_eq!(public, id.public_key);
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(decode_public_key("not a key").is_err());
        assert!(decode_private_key("failed").is_err());
    }
}
