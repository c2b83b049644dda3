//! HTML responses sent to the user agent.

use askama::Template;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

pub const COOKIES_REQUIRED_BODY: &str = "Please enable cookies";

#[derive(Template)]
#[template(path = "saml_post_binding.html")]
struct SamlPostBindingTemplate {
    acs_url: String,
    saml_response_b64: String,
    relay_state: Option<String>,
}

#[derive(Template)]
#[template(path = "login_form.html")]
struct LoginFormTemplate<'a> {
    instance_name: &'a str,
    action: &'a str,
    error: Option<&'a str>,
    groups: &'a [FormGroup],
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate<'a> {
    title: &'a str,
    message: &'a str,
}

/// One credential group shown on the universal login form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormGroup {
    pub label: String,
    pub username_field: String,
    pub password_field: String,
    /// Username to prefill.
    pub username: String,
}

impl FormGroup {
    pub fn username_field_for(group: &str) -> String {
        format!("{group}_username")
    }

    pub fn password_field_for(group: &str) -> String {
        format!("{group}_password")
    }
}

/// Auto-submitting HTTP-POST binding page delivering `saml_response` to the
/// service provider.
pub fn post_binding_page(
    acs_url: &str,
    saml_response: &str,
    relay_state: Option<&str>,
) -> Response {
    let template = SamlPostBindingTemplate {
        acs_url: acs_url.to_string(),
        saml_response_b64: BASE64.encode(saml_response),
        relay_state: relay_state.map(str::to_string),
    };
    no_store(Html(template.render().unwrap_or_default()).into_response())
}

pub fn login_form_page(
    instance_name: &str,
    action: &str,
    groups: &[FormGroup],
    error: Option<&str>,
) -> Response {
    let template = LoginFormTemplate {
        instance_name,
        action,
        error,
        groups,
    };
    no_store(Html(template.render().unwrap_or_default()).into_response())
}

pub fn error_page(status: StatusCode, title: &str, message: &str) -> Response {
    let template = ErrorTemplate { title, message };
    (status, Html(template.render().unwrap_or_default())).into_response()
}

/// The distinguished response for a user agent that refuses cookies.
pub fn cookies_required() -> Response {
    (StatusCode::EXPECTATION_FAILED, COOKIES_REQUIRED_BODY).into_response()
}

fn no_store(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}
