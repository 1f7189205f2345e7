// SPDX-License-Identifier: MIT
//! Bearer-token / password authentication middleware and per-IP rate
//! limiting, generalized from the teacher's `bearer_auth_mw` to the three
//! configured auth modes (`none`, `token`, `password`).
//!
//! Rate limiting is applied **only to failed auth attempts** via the
//! `governor` GCRA keyed limiter, so legitimate clients are never
//! throttled by their own traffic. Loopback addresses are exempt because a
//! local process that can reach loopback already has local access to the
//! machine.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use tracing::warn;

use crate::token::StoredSecret;
use crate::AppState;

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Token,
    Password,
}

impl AuthMode {
    pub fn parse(mode: &str) -> Self {
        match mode {
            "none" => AuthMode::None,
            "password" => AuthMode::Password,
            _ => AuthMode::Token,
        }
    }
}

#[derive(Clone)]
pub struct AuthState {
    mode: AuthMode,
    secret: Option<Arc<StoredSecret>>,
    limiter: Arc<IpLimiter>,
}

impl AuthState {
    pub fn new(mode: AuthMode, secret: Option<StoredSecret>) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(5).unwrap()).allow_burst(NonZeroU32::new(2).unwrap());
        Self {
            mode,
            secret: secret.map(Arc::new),
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }
}

/// Refuses to bind a non-loopback address while `auth.mode = "none"` —
/// the spec's mandated fatal-at-startup guard rather than a silent
/// open gateway.
pub fn validate_none_mode_bind_addr(mode: AuthMode, host: &str) -> anyhow::Result<()> {
    if mode != AuthMode::None {
        return Ok(());
    }
    let is_loopback = host == "127.0.0.1" || host == "::1" || host == "localhost";
    if !is_loopback {
        anyhow::bail!("gateway.auth.mode = \"none\" requires binding a loopback host, got {host:?}");
    }
    Ok(())
}

pub async fn auth_mw(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    verify(&state.auth, addr.ip(), req, next).await
}

async fn verify(auth: &AuthState, ip: IpAddr, req: Request, next: Next) -> Response {
    if auth.mode == AuthMode::None {
        return next.run(req).await;
    }

    let provided = extract_bearer(req.headers());
    let ok = match (&auth.secret, provided) {
        (Some(secret), Some(candidate)) => secret.verify(candidate),
        _ => false,
    };

    if ok {
        return next.run(req).await;
    }

    if !is_loopback(ip) && auth.limiter.check_key(&ip).is_err() {
        warn!(%ip, "rate limit exceeded after repeated auth failures");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(axum::http::header::RETRY_AFTER, "60")],
            "Too Many Requests",
        )
            .into_response();
    }
    warn!(%ip, "authentication failed");
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let auth = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    auth.strip_prefix("Bearer ")
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_from_valid_header() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer my-token-123".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Some("my-token-123"));
    }

    #[test]
    fn extract_bearer_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Basic dXNlcjpwYXNz".parse().unwrap());
        assert!(extract_bearer(&headers).is_none());
    }

    #[test]
    fn loopback_v4_is_loopback() {
        assert!(is_loopback(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn non_loopback_is_not_loopback() {
        assert!(!is_loopback("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn none_mode_requires_loopback_bind() {
        assert!(validate_none_mode_bind_addr(AuthMode::None, "127.0.0.1").is_ok());
        assert!(validate_none_mode_bind_addr(AuthMode::None, "0.0.0.0").is_err());
    }

    #[test]
    fn token_mode_allows_any_bind_addr() {
        assert!(validate_none_mode_bind_addr(AuthMode::Token, "0.0.0.0").is_ok());
    }

    #[test]
    fn auth_mode_parse_defaults_to_token() {
        assert_eq!(AuthMode::parse("bogus"), AuthMode::Token);
        assert_eq!(AuthMode::parse("none"), AuthMode::None);
        assert_eq!(AuthMode::parse("password"), AuthMode::Password);
    }
}
