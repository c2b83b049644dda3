//! Credential gathering: deciding how to challenge the user and when the
//! exchange is complete.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use chrono::Duration;
use secmgr_core::config::{CredentialGroup, MechanismConfig, SecmgrConfig, DEFAULT_GROUP_NAME};
use secmgr_core::session::{AuthnOutcome, AuthnSession, Principal, SessionState};
use tracing::{debug, info, warn};

use crate::auth::authenticate_form;
use crate::error::IdpError;
use crate::pages::{self, FormGroup};
use crate::request::InboundRequest;
use crate::routes::SSO_PATH;
use crate::saml::{build_saml_failure_response, build_saml_response};

const BAD_CREDENTIALS_MESSAGE: &str = "The username or password you entered is incorrect.";
const GENERIC_FAILURE_MESSAGE: &str = "Authentication failed.";

/// Decides how to gather credentials for a session and produces the response
/// for each step.
#[async_trait]
pub trait CredentialPipeline: Send + Sync {
    async fn handle(
        &self,
        session: &mut AuthnSession,
        request: &InboundRequest,
    ) -> Result<Response, IdpError>;
}

/// Pipeline driven by the configured credential groups.
///
/// Header mechanisms are tried silently on every pass. Groups still
/// unverified afterwards are put on the universal login form if they have a
/// form mechanism.
#[derive(Debug, Clone)]
pub struct GroupPipeline {
    config: Arc<SecmgrConfig>,
}

#[async_trait]
impl CredentialPipeline for GroupPipeline {
    async fn handle(
        &self,
        session: &mut AuthnSession,
        request: &InboundRequest,
    ) -> Result<Response, IdpError> {
        let state = session.assert_state(&[
            SessionState::Authenticating,
            SessionState::InCredentialsGatherer,
            SessionState::InUlForm,
        ])?;
        match state {
            SessionState::InUlForm if request.method == Method::POST => {
                self.process_form(session, request)
            }
            _ => self.gather(session, request, None),
        }
    }
}

impl GroupPipeline {
    pub fn new(config: Arc<SecmgrConfig>) -> Self {
        Self { config }
    }

    fn gather(
        &self,
        session: &mut AuthnSession,
        request: &InboundRequest,
        error: Option<&str>,
    ) -> Result<Response, IdpError> {
        session.advance_to_credentials_gatherer()?;
        self.run_header_mechanisms(session, request);

        if self.all_required_verified(session) {
            return self.complete(session);
        }
        let stuck = self
            .config
            .credential_groups
            .iter()
            .find(|g| !g.optional && !is_verified(session, g) && !has_form(g));
        if let Some(group) = stuck {
            let reason = format!(
                "credential group {} has no way to gather credentials",
                group.name
            );
            return self.fail(session, reason);
        }

        session.advance_to_form()?;
        debug!(session_id = %session.id(), "presenting universal login form");
        Ok(self.render_form(session, error))
    }

    fn run_header_mechanisms(&self, session: &mut AuthnSession, request: &InboundRequest) {
        for group in &self.config.credential_groups {
            if is_verified(session, group) {
                continue;
            }
            for mechanism in &group.mechanisms {
                let MechanismConfig::Header { name, header } = mechanism else {
                    continue;
                };
                let Some(username) = request.header(header).map(str::trim).filter(|u| !u.is_empty())
                else {
                    continue;
                };
                if self.record_verification(session, group, username) {
                    debug!(
                        session_id = %session.id(),
                        group = %group.name,
                        mechanism = %name,
                        "credential group verified by header"
                    );
                    break;
                }
            }
        }
    }

    fn process_form(
        &self,
        session: &mut AuthnSession,
        request: &InboundRequest,
    ) -> Result<Response, IdpError> {
        let form = request.form();
        for group in self.form_groups(session) {
            let username = form
                .get(&FormGroup::username_field_for(&group.name))
                .map(|u| u.trim())
                .unwrap_or_default();
            let password = form
                .get(&FormGroup::password_field_for(&group.name))
                .map(String::as_str)
                .unwrap_or_default();
            if username.is_empty() {
                continue;
            }
            session.principal_hints_mut().username = Some(username.to_string());

            let verified = group
                .mechanisms
                .iter()
                .filter(|m| matches!(m, MechanismConfig::Form { .. }))
                .find_map(|m| authenticate_form(m, username, password).ok());
            match verified {
                Some(account) => {
                    self.record_verification(session, group, &account.username);
                }
                None => warn!(
                    session_id = %session.id(),
                    group = %group.name,
                    "form credentials rejected"
                ),
            }
        }

        if self.all_required_verified(session) {
            return self.complete(session);
        }

        let hints = session.principal_hints_mut();
        hints.failed_form_attempts += 1;
        let attempts = hints.failed_form_attempts;
        if attempts >= self.config.idp.max_form_attempts {
            return self.fail(session, format!("{attempts} failed login attempts"));
        }
        self.gather(session, request, Some(BAD_CREDENTIALS_MESSAGE))
    }

    /// Record `username` as verified for `group` unless it conflicts with a
    /// username another group already verified.
    fn record_verification(
        &self,
        session: &mut AuthnSession,
        group: &CredentialGroup,
        username: &str,
    ) -> bool {
        let hints = session.principal_hints_mut();
        if let Some(existing) = hints.verified_groups.values().next() {
            if !existing.eq_ignore_ascii_case(username) {
                warn!(group = %group.name, "username differs from one already verified");
                return false;
            }
        }
        hints
            .verified_groups
            .insert(group.name.clone(), username.to_string());
        hints.username.get_or_insert_with(|| username.to_string());
        true
    }

    fn all_required_verified(&self, session: &AuthnSession) -> bool {
        self.config
            .credential_groups
            .iter()
            .filter(|g| !g.optional)
            .all(|g| is_verified(session, g))
    }

    /// Unverified groups that can be satisfied on the form, required first.
    fn form_groups<'a>(&'a self, session: &AuthnSession) -> Vec<&'a CredentialGroup> {
        let mut groups: Vec<&CredentialGroup> = self
            .config
            .credential_groups
            .iter()
            .filter(|g| !is_verified(session, g) && has_form(g))
            .collect();
        groups.sort_by_key(|g| g.optional);
        groups
    }

    fn render_form(&self, session: &AuthnSession, error: Option<&str>) -> Response {
        let prefill = session.principal_hints().username.clone().unwrap_or_default();
        let groups: Vec<FormGroup> = self
            .form_groups(session)
            .into_iter()
            .map(|g| FormGroup {
                label: g.label().to_string(),
                username_field: FormGroup::username_field_for(&g.name),
                password_field: FormGroup::password_field_for(&g.name),
                username: prefill.clone(),
            })
            .collect();
        pages::login_form_page(&self.config.secmgr.instance_name, SSO_PATH, &groups, error)
    }

    fn complete(&self, session: &mut AuthnSession) -> Result<Response, IdpError> {
        let hints = session.principal_hints();
        let username = hints
            .verified_groups
            .get(DEFAULT_GROUP_NAME)
            .or_else(|| hints.verified_groups.values().next())
            .cloned();
        let Some(username) = username else {
            return self.fail(session, "no credential group verified a username");
        };
        let principal = Principal {
            username,
            groups: hints.verified_groups.keys().cloned().collect(),
        };
        info!(
            session_id = %session.id(),
            username = %principal.username,
            "authentication succeeded"
        );
        session.finish(AuthnOutcome::success(principal))?;
        outcome_response(&self.config, session)
    }

    fn fail(
        &self,
        session: &mut AuthnSession,
        reason: impl Into<String>,
    ) -> Result<Response, IdpError> {
        let reason = reason.into();
        warn!(session_id = %session.id(), %reason, "authentication failed");
        session.finish(AuthnOutcome::failure(reason))?;
        outcome_response(&self.config, session)
    }
}

fn is_verified(session: &AuthnSession, group: &CredentialGroup) -> bool {
    session
        .principal_hints()
        .verified_groups
        .contains_key(&group.name)
}

fn has_form(group: &CredentialGroup) -> bool {
    group
        .mechanisms
        .iter()
        .any(|m| matches!(m, MechanismConfig::Form { .. }))
}

/// Response delivering a finished session's outcome.
///
/// With a pending protocol context the outcome goes back to the service
/// provider as a SAML Response; without one the user agent gets a generic
/// failure page. Failure reasons stay in the log.
pub fn outcome_response(
    config: &SecmgrConfig,
    session: &AuthnSession,
) -> Result<Response, IdpError> {
    let outcome = session
        .outcome()
        .ok_or_else(|| IdpError::Pipeline(format!("session {} has no outcome", session.id())))?;
    let Some(context) = session.pending_context() else {
        return match outcome {
            AuthnOutcome::Failure { .. } => Ok(pages::error_page(
                StatusCode::FORBIDDEN,
                "Sign-in failed",
                GENERIC_FAILURE_MESSAGE,
            )),
            AuthnOutcome::Success { .. } => Err(IdpError::Pipeline(format!(
                "session {} succeeded without a pending request",
                session.id()
            ))),
        };
    };

    let xml = match outcome {
        AuthnOutcome::Success { principal } => build_saml_response(
            principal,
            config.entity_id(),
            &context.acs_url,
            &context.issuer,
            Some(&context.request_id),
            Duration::minutes(i64::from(config.idp.assertion_lifetime_minutes)),
        ),
        AuthnOutcome::Failure { .. } => build_saml_failure_response(
            config.entity_id(),
            &context.acs_url,
            Some(&context.request_id),
            GENERIC_FAILURE_MESSAGE,
        ),
    };
    Ok(pages::post_binding_page(
        &context.acs_url,
        &xml,
        context.relay_state.as_deref(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_password;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use chrono::Utc;
    use secmgr_core::config::LocalAccount;
    use secmgr_core::session::ProtocolContext;

    fn config(groups: Vec<CredentialGroup>) -> Arc<SecmgrConfig> {
        let mut cfg = SecmgrConfig::generate_default();
        cfg.credential_groups = groups;
        Arc::new(cfg)
    }

    fn form_group(name: &str, optional: bool, accounts: &[(&str, &str)]) -> CredentialGroup {
        CredentialGroup {
            name: name.into(),
            display_name: None,
            optional,
            requires_username: true,
            requires_password: true,
            mechanisms: vec![MechanismConfig::Form {
                name: format!("{name}-form"),
                accounts: accounts
                    .iter()
                    .map(|(u, p)| LocalAccount {
                        username: u.to_string(),
                        password_hash: hash_password(p).unwrap(),
                    })
                    .collect(),
            }],
        }
    }

    fn header_group(name: &str, header: &str) -> CredentialGroup {
        CredentialGroup {
            name: name.into(),
            display_name: None,
            optional: false,
            requires_username: true,
            requires_password: false,
            mechanisms: vec![MechanismConfig::Header {
                name: "proxy".into(),
                header: header.into(),
            }],
        }
    }

    fn authenticating_session() -> AuthnSession {
        let mut session = AuthnSession::new("s1");
        session
            .set_state_authenticating(
                "https://gsa.example.com/acs",
                ProtocolContext {
                    request_id: "_req1".into(),
                    issuer: "https://gsa.example.com".into(),
                    acs_url: "https://gsa.example.com/acs".into(),
                    relay_state: Some("rs".into()),
                    received_at: Utc::now(),
                },
            )
            .unwrap();
        session
    }

    fn get() -> InboundRequest {
        InboundRequest::new(Method::GET, SSO_PATH)
    }

    fn post(body: &str) -> InboundRequest {
        InboundRequest::new(Method::POST, SSO_PATH).with_body(body.to_string())
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn saml_response_in(html: &str) -> String {
        let start = html.find(r#"name="SAMLResponse" value=""#).unwrap() + 27;
        let end = start + html[start..].find('"').unwrap();
        let encoded = html[start..end].replace("&#x2f;", "/");
        String::from_utf8(BASE64.decode(encoded).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn first_pass_shows_form() {
        let pipeline = GroupPipeline::new(config(vec![form_group(
            "default",
            false,
            &[("alice", "secret")],
        )]));
        let mut session = authenticating_session();
        let response = pipeline.handle(&mut session, &get()).await.unwrap();
        assert_eq!(session.state(), SessionState::InUlForm);
        let html = body_text(response).await;
        assert!(html.contains(r#"name="default_username""#));
        assert!(!html.contains("incorrect"));
    }

    #[tokio::test]
    async fn correct_password_succeeds() {
        let pipeline = GroupPipeline::new(config(vec![form_group(
            "default",
            false,
            &[("alice", "secret")],
        )]));
        let mut session = authenticating_session();
        pipeline.handle(&mut session, &get()).await.unwrap();

        let response = pipeline
            .handle(&mut session, &post("default_username=alice&default_password=secret"))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Succeeded);
        match session.outcome() {
            Some(AuthnOutcome::Success { principal }) => {
                assert_eq!(principal.username, "alice");
                assert_eq!(principal.groups, vec!["default".to_string()]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let xml = saml_response_in(&body_text(response).await);
        assert!(xml.contains(r#"InResponseTo="_req1""#));
        assert!(xml.contains(">alice</saml:NameID>"));
        assert!(xml.contains("urn:oasis:names:tc:SAML:2.0:status:Success"));
    }

    #[tokio::test]
    async fn wrong_password_cycles_back_to_form() {
        let pipeline = GroupPipeline::new(config(vec![form_group(
            "default",
            false,
            &[("alice", "secret")],
        )]));
        let mut session = authenticating_session();
        pipeline.handle(&mut session, &get()).await.unwrap();

        let response = pipeline
            .handle(&mut session, &post("default_username=alice&default_password=wrong"))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::InUlForm);
        assert_eq!(session.principal_hints().failed_form_attempts, 1);
        assert_eq!(session.principal_hints().username.as_deref(), Some("alice"));
        let html = body_text(response).await;
        assert!(html.contains("incorrect"));
        assert!(html.contains(r#"value="alice""#));
    }

    #[tokio::test]
    async fn get_while_on_form_redisplays_without_counting() {
        let pipeline = GroupPipeline::new(config(vec![form_group(
            "default",
            false,
            &[("alice", "secret")],
        )]));
        let mut session = authenticating_session();
        pipeline.handle(&mut session, &get()).await.unwrap();
        let html = body_text(pipeline.handle(&mut session, &get()).await.unwrap()).await;
        assert_eq!(session.state(), SessionState::InUlForm);
        assert_eq!(session.principal_hints().failed_form_attempts, 0);
        assert!(html.contains(r#"name="default_password""#));
    }

    #[tokio::test]
    async fn too_many_failures_finish_with_failure() {
        let pipeline = GroupPipeline::new(config(vec![form_group(
            "default",
            false,
            &[("alice", "secret")],
        )]));
        let mut session = authenticating_session();
        pipeline.handle(&mut session, &get()).await.unwrap();

        let mut last = None;
        for _ in 0..3 {
            last = Some(
                pipeline
                    .handle(&mut session, &post("default_username=alice&default_password=nope"))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(session.state(), SessionState::Failed);
        let xml = saml_response_in(&body_text(last.unwrap()).await);
        assert!(xml.contains("urn:oasis:names:tc:SAML:2.0:status:Responder"));
        assert!(!xml.contains("failed login attempts"));
    }

    #[tokio::test]
    async fn header_mechanism_skips_form() {
        let pipeline = GroupPipeline::new(config(vec![header_group("default", "X-Remote-User")]));
        let mut session = authenticating_session();
        let request = get().with_header("X-Remote-User", "bob");
        pipeline.handle(&mut session, &request).await.unwrap();
        assert_eq!(session.state(), SessionState::Succeeded);
        assert_eq!(
            session.principal_hints().verified_groups.get("default").map(String::as_str),
            Some("bob")
        );
    }

    #[tokio::test]
    async fn required_group_without_form_fails() {
        let pipeline = GroupPipeline::new(config(vec![header_group("default", "X-Remote-User")]));
        let mut session = authenticating_session();
        pipeline.handle(&mut session, &get()).await.unwrap();
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn optional_group_does_not_block_success() {
        let pipeline = GroupPipeline::new(config(vec![
            form_group("default", false, &[("alice", "secret")]),
            form_group("intranet", true, &[("alice", "other")]),
        ]));
        let mut session = authenticating_session();
        let html = body_text(pipeline.handle(&mut session, &get()).await.unwrap()).await;
        let default_at = html.find("default_username").unwrap();
        let intranet_at = html.find("intranet_username").unwrap();
        assert!(default_at < intranet_at);

        pipeline
            .handle(&mut session, &post("default_username=alice&default_password=secret"))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Succeeded);
    }

    #[tokio::test]
    async fn conflicting_usernames_are_not_both_verified() {
        let pipeline = GroupPipeline::new(config(vec![
            header_group("default", "X-Remote-User"),
            form_group("second", false, &[("carol", "pw")]),
        ]));
        let mut session = authenticating_session();
        pipeline
            .handle(&mut session, &get().with_header("X-Remote-User", "bob"))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::InUlForm);

        pipeline
            .handle(&mut session, &post("second_username=carol&second_password=pw"))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::InUlForm);
        assert!(!session.principal_hints().verified_groups.contains_key("second"));
    }

    #[tokio::test]
    async fn idle_session_is_rejected() {
        let pipeline = GroupPipeline::new(config(vec![form_group("default", false, &[])]));
        let mut session = AuthnSession::new("s-idle");
        let err = pipeline.handle(&mut session, &get()).await.unwrap_err();
        assert!(err.is_state_violation());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn outcome_without_context_is_generic_page() {
        let cfg = config(vec![form_group("default", false, &[])]);
        let mut session = AuthnSession::new("s2");
        session.finish(AuthnOutcome::failure("internal detail")).unwrap();
        let response = outcome_response(&cfg, &session).unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let html = body_text(response).await;
        assert!(!html.contains("internal detail"));
        assert!(!html.contains("FAILED"));
    }
}
