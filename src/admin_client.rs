// SPDX-License-Identifier: MIT
//! HTTP client for the admin CLI subcommands (health/status/reset-session/
//! reload-config/shutdown). Each issues one request against a running
//! gateway's `/api/*` surface and maps the outcome onto the exit codes
//! named in the external interface: 0 success, 2 not-running, 3 auth
//! rejected, 1 any other failure.

use reqwest::StatusCode;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_NOT_RUNNING: i32 = 2;
pub const EXIT_AUTH_REJECTED: i32 = 3;

fn client(token: Option<&str>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(token) = token {
        let mut headers = reqwest::header::HeaderMap::new();
        let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
        builder = builder.default_headers(headers);
    }
    Ok(builder.build()?)
}

async fn run_get(base_url: &str, path: &str, token: Option<&str>) -> i32 {
    dispatch(|c| c.get(format!("{base_url}{path}")), token).await
}

async fn run_post(base_url: &str, path: &str, token: Option<&str>, body: Option<serde_json::Value>) -> i32 {
    dispatch(
        move |c| {
            let req = c.post(format!("{base_url}{path}"));
            match &body {
                Some(b) => req.json(b),
                None => req,
            }
        },
        token,
    )
    .await
}

async fn dispatch<F>(build: F, token: Option<&str>) -> i32
where
    F: FnOnce(&reqwest::Client) -> reqwest::RequestBuilder,
{
    let client = match client(token) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_FAILURE;
        }
    };
    let request = build(&client);
    match request.send().await {
        Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN => {
            eprintln!("error: rejected by gateway auth ({})", resp.status());
            EXIT_AUTH_REJECTED
        }
        Ok(resp) if resp.status().is_success() => {
            if let Ok(text) = resp.text().await {
                if !text.is_empty() {
                    println!("{text}");
                }
            }
            EXIT_SUCCESS
        }
        Ok(resp) => {
            eprintln!("error: gateway returned {}", resp.status());
            EXIT_FAILURE
        }
        Err(e) if e.is_connect() => {
            eprintln!("error: no gateway listening at the configured admin URL");
            EXIT_NOT_RUNNING
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_FAILURE
        }
    }
}

pub async fn health(base_url: &str, token: Option<&str>) -> i32 {
    run_get(base_url, "/api/health", token).await
}

pub async fn status(base_url: &str, token: Option<&str>) -> i32 {
    run_get(base_url, "/api/sessions", token).await
}

pub async fn reset_session(base_url: &str, token: Option<&str>, session_key: &str) -> i32 {
    run_post(
        base_url,
        "/api/admin/reset-session",
        token,
        Some(serde_json::json!({ "sessionKey": session_key })),
    )
    .await
}

pub async fn reload_config(base_url: &str, token: Option<&str>) -> i32 {
    run_post(base_url, "/api/admin/reload-config", token, None).await
}

pub async fn shutdown(base_url: &str, token: Option<&str>) -> i32 {
    run_post(base_url, "/api/admin/shutdown", token, None).await
}
