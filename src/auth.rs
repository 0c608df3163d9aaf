use base64::{Engine as _, engine::general_purpose};
use rand::Rng;

const GENERATED_PART_LEN: usize = 16;
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// The proxy's expected Basic credential, stored already base64-encoded.
///
/// An empty credential means no authentication is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    encoded: String,
}

impl Credential {
    /// No authentication.
    pub fn none() -> Self {
        Self::default()
    }

    /// Encodes a `username:password` pair. An empty pair yields no credential.
    pub fn from_user_pass(user_pass: &str) -> Self {
        Self {
            encoded: general_purpose::STANDARD.encode(user_pass.as_bytes()),
        }
    }

    /// Random `letters:letters` pair, returned alongside its credential so the
    /// caller can announce it.
    pub fn generate() -> (String, Self) {
        let user_pass = format!("{}:{}", random_letters(GENERATED_PART_LEN), random_letters(GENERATED_PART_LEN));
        let credential = Self::from_user_pass(&user_pass);
        (user_pass, credential)
    }

    pub fn is_required(&self) -> bool {
        !self.encoded.is_empty()
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Checks a raw `Proxy-Authorization` value.
    ///
    /// Anything passes when no credential is configured. Otherwise the value
    /// must be exactly `<scheme> <token>` with `scheme` equal to `Basic` in any
    /// case and `token` byte-for-byte equal to the stored credential.
    pub fn validate(&self, presented: &str) -> bool {
        if !self.is_required() {
            return true;
        }
        let mut parts = presented.split(' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(scheme), Some(token), None) => {
                scheme.eq_ignore_ascii_case("Basic") && token == self.encoded
            }
            _ => false,
        }
    }
}

fn random_letters(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}
