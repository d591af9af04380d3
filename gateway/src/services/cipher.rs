//! Development credential cipher

use crate::error::GatewayResult;
use crate::traits::CredentialCipher;

/// Stores secrets as-is. Only for local runs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCipher;

impl CredentialCipher for PassthroughCipher {
    fn encrypt(&self, plaintext: &str) -> GatewayResult<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> GatewayResult<String> {
        Ok(ciphertext.to_string())
    }
}
