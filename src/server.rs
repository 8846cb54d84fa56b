//! HTTP JSON service over the signing and verification workflows.
//!
//! Request framing (content length, chunked bodies, keep-alive) and the accept
//! loop are actix-web's.  Every error body is `{"error": "<message>"}`.

use crate::accounts::{AccountError, AccountService};
use crate::coordinator::{SignError, SigningCoordinator};
use crate::identity::IdentityResolver;
use crate::model::AnswerSubmission;
use crate::verifier::{Verifier, VerifyError};
use actix_web::dev::Server;
use actix_web::http::{header, Method, StatusCode};
use actix_web::middleware::DefaultHeaders;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Resource};
use serde::Deserialize;
use serde_json::json;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Everything a request handler needs, shared across workers.
#[derive(Clone)]
pub struct AppState {
    /// Signing workflow.
    pub coordinator: SigningCoordinator,
    /// Signature lookup.
    pub verifier: Verifier,
    /// Registration and login.
    pub accounts: AccountService,
    /// Bearer credential to identity.
    pub resolver: Arc<dyn IdentityResolver>,
    /// How long a client may take to deliver the request head.
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CredentialsRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct SignRequest {
    answers: Vec<AnswerSubmission>,
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    user_email: String,
    signature: String,
}

/// Binds `listen` and serves until the process receives SIGINT or SIGTERM.
pub async fn run_server(listen: SocketAddr, state: AppState) -> io::Result<()> {
    let listener = TcpListener::bind(listen)?;
    let addr = listener.local_addr()?;
    info!(module = "http", evt = "LISTEN", addr = %addr);
    serve(listener, state)?.await?;
    info!(module = "http", evt = "SHUTDOWN", addr = %addr);
    Ok(())
}

/// Starts the service on an already bound listener.
///
/// The returned [`Server`] must be awaited (or spawned) to make progress; its
/// handle stops it.
pub fn serve(listener: TcpListener, state: AppState) -> io::Result<Server> {
    let request_timeout = state.request_timeout;
    let state = web::Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(cors_headers())
            .configure(routes)
    })
    .client_request_timeout(request_timeout)
    .listen(listener)?
    .run();
    Ok(server)
}

/// Registers every route; handlers expect `web::Data<AppState>` in app data.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
        .service(resource("/healthz").route(web::get().to(healthz)))
        .service(resource("/register").route(web::post().to(register)))
        .service(resource("/login").route(web::post().to(login)))
        .service(resource("/sign_answers").route(web::post().to(sign_answers)))
        .service(
            resource("/verify_signature")
                .route(web::get().to(verify_signature))
                .route(web::post().to(verify_signature)),
        )
        .default_service(web::to(not_found));
}

fn resource(path: &str) -> Resource {
    web::resource(path)
        .route(web::method(Method::OPTIONS).to(preflight))
        .default_service(web::to(method_not_allowed))
}

fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS, GET"))
        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, "content-type, authorization"))
}

fn failure(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(json!({ "error": message.into() }))
}

async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

async fn preflight() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

async fn not_found() -> HttpResponse {
    failure(StatusCode::NOT_FOUND, "not found")
}

async fn method_not_allowed() -> HttpResponse {
    failure(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

async fn register(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let req: CredentialsRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(_) => return failure(StatusCode::BAD_REQUEST, "Error processing the data"),
    };
    match state.accounts.register(&req.email, &req.password).await {
        Ok(token) => HttpResponse::Ok().json(json!({
            "message": "User registered successfully",
            "token": token,
        })),
        Err(
            err @ (AccountError::InvalidEmail
            | AccountError::WeakPassword
            | AccountError::EmailTaken),
        ) => failure(StatusCode::BAD_REQUEST, err.to_string()),
        Err(err) => {
            error!(module = "http", evt = "REGISTER_FAILED", error = %err);
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Error creating the user")
        }
    }
}

async fn login(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let req: CredentialsRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(_) => return failure(StatusCode::BAD_REQUEST, "Error processing the data"),
    };
    match state.accounts.login(&req.email, &req.password).await {
        Ok(token) => HttpResponse::Ok().json(json!({ "token": token })),
        Err(err @ (AccountError::BadCredentials | AccountError::InvalidEmail)) => {
            failure(StatusCode::UNAUTHORIZED, err.to_string())
        }
        Err(err) => {
            error!(module = "http", evt = "LOGIN_FAILED", error = %err);
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Error during login")
        }
    }
}

async fn sign_answers(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    let payload: SignRequest = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => return failure(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let identity = match state.resolver.resolve(authorization) {
        Ok(identity) => identity,
        Err(err) => {
            debug!(module = "http", evt = "AUTH_REJECTED", error = %err);
            return failure(StatusCode::UNAUTHORIZED, "Invalid token");
        }
    };
    match state.coordinator.sign(&identity, &payload.answers).await {
        Ok(signed) => HttpResponse::Ok().json(json!({
            "signature": signed.signature,
            "timestamp": signed.timestamp,
        })),
        Err(SignError::Begin(_)) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error starting the transaction",
        ),
        Err(SignError::WriteFailed) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error processing the responses",
        ),
        Err(err @ SignError::Timeout(_)) => {
            failure(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        Err(SignError::Indeterminate(_)) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error finalizing the transaction; the answers may or may not have been saved",
        ),
    }
}

async fn verify_signature(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let req: VerifyRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => return failure(StatusCode::BAD_REQUEST, err.to_string()),
    };
    match state.verifier.verify_raw(&req.user_email, &req.signature).await {
        Ok(found) if found.valid => HttpResponse::Ok().json(json!({
            "status": "OK",
            "answers": found.answers,
            "timestamp": found.timestamp,
        })),
        Ok(_) => failure(
            StatusCode::UNAUTHORIZED,
            "Invalid signature or does not correspond to the user",
        ),
        Err(err @ VerifyError::Input(_)) => failure(StatusCode::BAD_REQUEST, err.to_string()),
        Err(err @ VerifyError::Timeout(_)) => {
            failure(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        Err(VerifyError::Store(_)) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error verifying the signature",
        ),
    }
}
