use super::*;

use axum::http::HeaderValue;

fn config() -> SessionConfig {
    SessionConfig {
        secret: "s3cret".into(),
        issuer: "job-tracker".into(),
        ttl_seconds: 3600,
    }
}

#[test]
fn minted_token_verifies_to_same_user() {
    let cfg = config();
    let user = UserId::from("user-1");
    let session = mint_token(&cfg, &user).expect("mint");

    assert!(session.expires_at > Utc::now().timestamp());
    assert_eq!(verify_token(&cfg, &session.token).expect("verify"), user);
}

#[test]
fn token_signed_with_other_secret_is_rejected() {
    let session = mint_token(&config(), &UserId::from("user-1")).expect("mint");
    let other = SessionConfig {
        secret: "different".into(),
        ..config()
    };
    assert!(matches!(
        verify_token(&other, &session.token),
        Err(TokenError::Invalid(_))
    ));
}

#[test]
fn token_from_other_issuer_is_rejected() {
    let session = mint_token(&config(), &UserId::from("user-1")).expect("mint");
    let other = SessionConfig {
        issuer: "someone-else".into(),
        ..config()
    };
    assert!(verify_token(&other, &session.token).is_err());
}

#[test]
fn expired_token_is_rejected() {
    let expired = SessionConfig {
        ttl_seconds: -3600,
        ..config()
    };
    let session = mint_token(&expired, &UserId::from("user-1")).expect("mint");
    assert!(verify_token(&config(), &session.token).is_err());
}

#[test]
fn bearer_token_requires_scheme_and_value() {
    let mut headers = HeaderMap::new();
    assert_eq!(bearer_token(&headers), None);

    headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
    assert_eq!(bearer_token(&headers), None);

    headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
    assert_eq!(bearer_token(&headers), None);

    headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
    assert_eq!(bearer_token(&headers), Some("abc.def"));
}
