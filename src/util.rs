//! Small helpers shared across the HTTP control API and its outbound
//! snapshot pusher.

use base64::Engine;

pub fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_matches_known_vectors() {
        assert_eq!(base64_encode(b"admin:secret"), "YWRtaW46c2VjcmV0");
        assert_eq!(base64_encode(b"user:pass"), "dXNlcjpwYXNz");
    }
}
