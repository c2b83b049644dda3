//! The IdP's HTTP entry actions.
//!
//! Each action obtains the session first, holds its lock for the rest of the
//! request, checks the session state it is prepared to handle and only then
//! decodes input or calls the credential pipeline. Any failure after the
//! session is known ends the exchange: the session is finished with a failure
//! outcome and the user agent gets a failure response, never a raw fault.

use std::sync::Arc;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use secmgr_core::config::SecmgrConfig;
use secmgr_core::session::{
    AuthnOutcome, AuthnSession, ProtocolContext, SessionHandle, SessionManager, SessionState,
};
use tracing::{debug, error, info, warn};

use crate::cursor::{MessageCursor, MessageSource, Next};
use crate::error::{DecodeError, IdpError};
use crate::pages;
use crate::pipeline::{outcome_response, CredentialPipeline};
use crate::redirect::RedirectSource;
use crate::request::InboundRequest;
use crate::routes::{SOAP_PATH, SSO_PATH};
use crate::saml::{generate_metadata, MessageKind, SamlMessage};
use crate::soap::{encode_envelope, encode_fault, EnvelopeDecoder, FaultCode, InvalidName};
use crate::soap_handler::{SoapMessageHandler, UnsupportedRequestResponder};

const SOAP_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// IdP endpoint wired to its collaborators.
pub struct IdpEndpoint {
    config: Arc<SecmgrConfig>,
    decoder: EnvelopeDecoder,
    sessions: Arc<dyn SessionManager>,
    pipeline: Arc<dyn CredentialPipeline>,
    soap_handler: Arc<dyn SoapMessageHandler>,
}

impl IdpEndpoint {
    pub fn new(
        config: Arc<SecmgrConfig>,
        sessions: Arc<dyn SessionManager>,
        pipeline: Arc<dyn CredentialPipeline>,
    ) -> Result<Self, InvalidName> {
        let decoder = EnvelopeDecoder::from_names(&config.idp.understood_soap_headers)?;
        let soap_handler = Arc::new(UnsupportedRequestResponder::new(config.entity_id()));
        Ok(Self {
            config,
            decoder,
            sessions,
            pipeline,
            soap_handler,
        })
    }

    /// GET on the SSO location: a service provider sent the user agent here.
    pub async fn initial_contact(&self, request: &InboundRequest) -> Response {
        let token = request.cookie(&self.config.idp.session_cookie_name);
        let Some(handle) = self.sessions.create_session(token).await else {
            warn!(path = %request.request_url(), "could not get or create a session");
            return pages::cookies_required();
        };
        let mut session = handle.lock().await;
        session.touch();
        log_incoming_request(request, &session);

        let response = match self.start_exchange(&mut session, request).await {
            Ok(response) => response,
            Err(e) => self.fail_from_error(&mut session, e),
        };
        self.with_session_cookie(&handle, response)
    }

    async fn start_exchange(
        &self,
        session: &mut AuthnSession,
        request: &InboundRequest,
    ) -> Result<Response, IdpError> {
        // A session showing the login form still owes its pending request an
        // answer, so a new AuthnRequest there is out of order.
        let state =
            session.assert_state(&[SessionState::Idle, SessionState::InCredentialsGatherer])?;
        if state == SessionState::InCredentialsGatherer {
            debug!(session_id = %session.id(), "resuming credential gathering");
            return self.pipeline.handle(session, request).await;
        }

        let mut source = RedirectSource::new(request);
        let message = match source.next_message()? {
            Next::Message(message) => message,
            Next::Exhausted => return Err(DecodeError::EmptyBody.into()),
        };
        let context = self.protocol_context(&message, source.relay_state())?;
        info!(
            session_id = %session.id(),
            request_id = %context.request_id,
            issuer = %context.issuer,
            "starting authentication"
        );
        session.set_state_authenticating(context.acs_url.clone(), context)?;
        self.pipeline.handle(session, request).await
    }

    /// Validate an incoming AuthnRequest and capture what is needed to answer it.
    fn protocol_context(
        &self,
        message: &SamlMessage,
        relay_state: Option<String>,
    ) -> Result<ProtocolContext, DecodeError> {
        if message.kind != MessageKind::AuthnRequest {
            return Err(DecodeError::UnexpectedContent(message.name.to_string()));
        }
        let header = message.header()?;
        let request_id = header
            .id
            .ok_or_else(|| DecodeError::MalformedEnvelope("AuthnRequest has no ID".into()))?;
        let issuer = header
            .issuer
            .ok_or_else(|| DecodeError::MalformedEnvelope("AuthnRequest has no Issuer".into()))?;
        let provider = self
            .config
            .service_provider(&issuer)
            .ok_or_else(|| DecodeError::UnknownServiceProvider(issuer.clone()))?;

        if let Some(requested) = header.assertion_consumer_service_url {
            if requested != provider.acs_url {
                return Err(DecodeError::MalformedEnvelope(format!(
                    "AssertionConsumerServiceURL {requested} is not registered for {issuer}"
                )));
            }
        }
        Ok(ProtocolContext {
            request_id,
            issuer,
            acs_url: provider.acs_url.clone(),
            relay_state,
            received_at: Utc::now(),
        })
    }

    /// POST on the SSO location: the user agent submits gathered credentials.
    pub async fn credential_postback(&self, request: &InboundRequest) -> Response {
        let token = request.cookie(&self.config.idp.session_cookie_name);
        let Some(handle) = self.sessions.find_session(token).await else {
            warn!(path = %request.request_url(), "credential postback without a session");
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Session not found",
                "Your sign-in session has expired or was never started. \
                 Return to the page you were visiting and try again.",
            );
        };
        let mut session = handle.lock().await;
        session.touch();
        log_incoming_request(request, &session);

        let result = match session.assert_state(&[
            SessionState::InCredentialsGatherer,
            SessionState::InUlForm,
        ]) {
            Ok(_) => self.pipeline.handle(&mut session, request).await,
            Err(e) => Err(e.into()),
        };
        result.unwrap_or_else(|e| self.fail_from_error(&mut session, e))
    }

    /// Convert a failure into the session's terminal state and a response.
    fn fail_from_error(&self, session: &mut AuthnSession, err: IdpError) -> Response {
        if err.is_state_violation() {
            error!(session_id = %session.id(), error = %err, "session state violation");
        } else {
            warn!(session_id = %session.id(), error = %err, "authentication request failed");
        }

        if !session.state().is_terminal() {
            if let Err(e) = session.finish(AuthnOutcome::failure(err.to_string())) {
                error!(session_id = %session.id(), error = %e, "could not record failure");
            }
        }

        let failed = matches!(session.outcome(), Some(AuthnOutcome::Failure { .. }));
        if failed && !err.is_state_violation() && session.pending_context().is_some() {
            match outcome_response(&self.config, session) {
                Ok(response) => return response,
                Err(e) => error!(
                    session_id = %session.id(),
                    error = %e,
                    "could not build failure response"
                ),
            }
        }
        pages::error_page(
            err.status(),
            "Sign-in failed",
            "The sign-in request could not be completed. \
             Return to the page you were visiting and try again.",
        )
    }

    /// SOAP envelope delivery: answer every message in the envelope.
    pub fn soap_batch(&self, request: &InboundRequest) -> Response {
        let mut cursor = MessageCursor::new(&self.decoder, request);
        let mut answers = Vec::new();
        loop {
            match cursor.next_message() {
                Ok(Next::Message(message)) => {
                    debug!(kind = %message.kind, position = cursor.position(), "SOAP message");
                    answers.push(self.soap_handler.respond(&message));
                }
                Ok(Next::Exhausted) => break,
                Err(e) => {
                    warn!(error = %e, position = cursor.position(), "rejecting SOAP envelope");
                    return soap_fault_response(&e);
                }
            }
        }
        debug!(messages = answers.len(), "answered SOAP envelope");
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, SOAP_CONTENT_TYPE)],
            encode_envelope(&answers),
        )
            .into_response()
    }

    /// IdP metadata document.
    pub fn metadata(&self) -> String {
        let base = self
            .config
            .secmgr
            .public_url
            .as_deref()
            .unwrap_or_default()
            .trim_end_matches('/');
        generate_metadata(
            self.config.entity_id(),
            &format!("{base}{SSO_PATH}"),
            &format!("{base}{SOAP_PATH}"),
        )
    }

    fn with_session_cookie(&self, handle: &SessionHandle, mut response: Response) -> Response {
        if !handle.created() {
            return response;
        }
        let secure = self
            .config
            .secmgr
            .public_url
            .as_deref()
            .is_some_and(|url| url.starts_with("https://"));
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax{}",
            self.config.idp.session_cookie_name,
            handle.id(),
            if secure { "; Secure" } else { "" }
        );
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => error!(error = %e, "session cookie is not a valid header value"),
        }
        response
    }
}

fn log_incoming_request(request: &InboundRequest, session: &AuthnSession) {
    info!(
        method = %request.method,
        path = %request.request_url(),
        session_id = %session.id(),
        state = %session.state(),
        "incoming request"
    );
}

fn soap_fault_response(err: &DecodeError) -> Response {
    let body = encode_fault(FaultCode::for_error(err), &err.to_string());
    match err {
        DecodeError::UnsupportedTransport(_) => (
            StatusCode::METHOD_NOT_ALLOWED,
            [
                (header::CONTENT_TYPE, SOAP_CONTENT_TYPE),
                (header::ALLOW, "POST"),
            ],
            body,
        )
            .into_response(),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, SOAP_CONTENT_TYPE)],
            body,
        )
            .into_response(),
    }
}
