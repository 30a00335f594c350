//! Styled HTML responses for the public surface.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

const PAGE_STYLE: &str = r#"
* { margin: 0; padding: 0; box-sizing: border-box; }
body {
    font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, 'Helvetica Neue', Arial, sans-serif;
    background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
    display: flex;
    justify-content: center;
    align-items: center;
    min-height: 100vh;
    padding: 20px;
}
.card {
    background: white;
    border-radius: 16px;
    box-shadow: 0 20px 60px rgba(0, 0, 0, 0.3);
    padding: 48px 40px;
    max-width: 600px;
    text-align: center;
}
h1 { color: #333; font-size: 28px; margin-bottom: 16px; font-weight: 700; }
p { color: #666; font-size: 16px; line-height: 1.6; margin-bottom: 24px; }
.status-code {
    display: inline-block;
    background: #f0f0f0;
    color: #888;
    padding: 8px 16px;
    border-radius: 20px;
    font-size: 14px;
    font-weight: 600;
}
.hint {
    margin-top: 24px;
    padding: 14px;
    background: #f0f4ff;
    border-radius: 10px;
    border-left: 4px solid #667eea;
    color: #5a67d8;
    font-size: 13px;
    font-family: 'Courier New', monospace;
    text-align: left;
}
input[type="password"] {
    width: 100%;
    padding: 13px 16px;
    border: 2px solid #e2e8f0;
    border-radius: 10px;
    font-size: 15px;
    background: #f7fafc;
    margin-bottom: 20px;
}
button {
    width: 100%;
    padding: 13px 24px;
    background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
    color: white;
    border: none;
    border-radius: 10px;
    font-size: 16px;
    font-weight: 600;
    cursor: pointer;
}
"#;

/// Render a styled error page with the given status, title, and message.
pub fn error_page(status: StatusCode, title: &str, message: &str) -> Response {
    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{title}</title>
<style>{style}</style>
</head>
<body>
<div class="card">
    <h1>{title}</h1>
    <p>{message}</p>
    <div class="status-code">Status Code: {code}</div>
</div>
</body>
</html>"#,
        title = title,
        message = message,
        code = status.as_u16(),
        style = PAGE_STYLE,
    );

    (
        status,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

/// 404: the Host header did not match any tunnel hostname.
pub fn tunnel_not_found() -> Response {
    error_page(
        StatusCode::NOT_FOUND,
        "Tunnel Not Found",
        "No tunnel is configured for this subdomain. Check your tunnel URL and ensure your client is connected.",
    )
}

/// 503: the subdomain is known but no client is connected right now.
pub fn tunnel_not_active() -> Response {
    error_page(
        StatusCode::SERVICE_UNAVAILABLE,
        "Tunnel Not Active",
        "This tunnel is currently not connected. Start your tunnel client and try again.",
    )
}

/// 502: the tunnel or a peer server failed to produce a response.
pub fn bad_gateway(message: &str) -> Response {
    error_page(StatusCode::BAD_GATEWAY, "Proxy Error", message)
}

/// 504: the tunneled request exceeded its hard deadline.
pub fn gateway_timeout() -> Response {
    error_page(
        StatusCode::GATEWAY_TIMEOUT,
        "Request Timeout",
        "The tunnel client did not produce a response in time.",
    )
}

/// 401: password prompt for browsers. The form re-submits the request with
/// the password header; success sets the auth cookie and reloads.
pub fn password_prompt() -> Response {
    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Authentication Required</title>
<style>{style}</style>
</head>
<body>
<div class="card">
    <h1>Authentication Required</h1>
    <p>This tunnel is password protected. Enter the password to continue.</p>
    <form id="auth" onsubmit="return submitPassword(event)">
        <input type="password" id="password" placeholder="Tunnel password" required autofocus autocomplete="current-password" />
        <button type="submit">Access Tunnel</button>
    </form>
    <div class="hint">API access: x-tungo-password: your_password</div>
</div>
<script>
function submitPassword(event) {{
    event.preventDefault();
    fetch(window.location.href, {{
        method: 'GET',
        headers: {{ 'x-tungo-password': document.getElementById('password').value }}
    }}).then(function(response) {{
        if (response.ok) {{ window.location.reload(); }}
        else {{ document.getElementById('password').value = ''; }}
    }});
    return false;
}}
</script>
</body>
</html>"#,
        style = PAGE_STYLE,
    );

    (
        StatusCode::UNAUTHORIZED,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}
