use base64::Engine as _;
use serde_json::Value;

/// Decode the payload JSON ("claims") from a JWT.
///
/// Intentionally signature-agnostic: the upstream session already vouches
/// for the token, we only read claims (plan type) out of it. Handles both
/// padded and unpadded base64url payloads.
pub(crate) fn decode_jwt_claims(jwt: &str) -> Option<Value> {
    let payload_b64 = jwt.split('.').nth(1)?;

    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(payload_b64))
        .ok()?;

    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_unpadded_payloads_and_rejects_garbage() {
        let claims = json!({"sub": "user-1", "chatgpt_plan_type": "plus"});
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).unwrap());
        let token = format!("eyJhbGciOiJIUzI1NiJ9.{payload}.c2ln");

        let decoded = decode_jwt_claims(&token).unwrap();
        assert_eq!(decoded["sub"], "user-1");

        assert!(decode_jwt_claims("not-a-jwt").is_none());
        assert!(decode_jwt_claims("a.%%%.c").is_none());
    }
}
