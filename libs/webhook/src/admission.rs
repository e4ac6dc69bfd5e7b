//! Admission server (`spec.md §4.7`, component C7).
//!
//! One `actix-web` route per configured resource per handler kind, grounded
//! on `kube-rs-kube/examples/admission_controller.rs`'s `AdmissionRequest`
//! decode / `AdmissionResponse` encode shape, rebuilt on `actix-web` (already
//! in the dependency graph via the teacher's metrics/health server) instead
//! of that example's `axum`.

use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{post, web, App, HttpResponse, HttpServer, Responder};
use json_patch::Patch;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use serde::Deserialize;
use serde_json::{json, Value};
use whitebox_runtime::config::{Gvk, HandlerConfig, TlsConfig, WebhookConfig};
use whitebox_runtime::transport::{self, HandlerTransport};

use crate::error::{Error, Result};
use crate::injector;

/// The handler's own response shape for validate/mutate/inject
/// (`spec.md §4.7`, step 3).
#[derive(Debug, Deserialize)]
struct HandlerResponse {
    allowed: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    patch: Option<Value>,
    #[serde(default)]
    signature: Option<String>,
}

struct ResourceRoutes {
    validator: Option<Arc<dyn HandlerTransport>>,
    mutator: Option<Arc<dyn HandlerTransport>>,
    injector: Option<(Arc<dyn HandlerTransport>, PathBuf)>,
}

pub struct AdmissionState {
    routes: HashMap<(String, String, String), ResourceRoutes>,
}

fn route_key(gvk: &Gvk) -> (String, String, String) {
    (gvk.group.clone(), gvk.version.clone(), gvk.plural.clone())
}

fn build_transport(handler: &HandlerConfig, context: &str) -> Result<Arc<dyn HandlerTransport>> {
    Ok(Arc::from(
        transport::from_config(handler, context).map_err(Error::Handler)?,
    ))
}

impl AdmissionState {
    pub fn build(config: &WebhookConfig) -> Result<Self> {
        let mut routes = HashMap::new();
        for handler in &config.handlers {
            let validator = handler
                .validator
                .as_ref()
                .map(|h| build_transport(h, &format!("webhook.{}.validator", handler.resource.kind)))
                .transpose()?;
            let mutator = handler
                .mutator
                .as_ref()
                .map(|h| build_transport(h, &format!("webhook.{}.mutator", handler.resource.kind)))
                .transpose()?;
            let injector = handler
                .injector
                .as_ref()
                .map(|i| -> Result<_> {
                    let transport = build_transport(
                        &i.handler,
                        &format!("webhook.{}.injector", handler.resource.kind),
                    )?;
                    Ok((transport, i.verification_key_file.clone()))
                })
                .transpose()?;
            routes.insert(
                route_key(&handler.resource),
                ResourceRoutes {
                    validator,
                    mutator,
                    injector,
                },
            );
        }
        Ok(Self { routes })
    }

    fn get(&self, group: &str, version: &str, plural: &str) -> Option<&ResourceRoutes> {
        self.routes
            .get(&(group.to_owned(), version.to_owned(), plural.to_owned()))
    }
}

fn deny_response(response: &AdmissionResponse, message: String) -> HttpResponse {
    HttpResponse::Ok().json(response.clone().deny(message).into_review())
}

/// `spec.md §4.7` steps 1-4: decode, call the handler with
/// `{request, object, oldObject}`, optionally verify+apply an injector
/// patch, encode the `AdmissionResponse`. Handler/transport failures never
/// surface as a non-2xx (step 5): the worst outcome is `allowed=false`.
async fn respond(
    transport: &dyn HandlerTransport,
    verification_key: Option<&PathBuf>,
    review: AdmissionReview<DynamicObject>,
) -> HttpResponse {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            return HttpResponse::Ok().json(AdmissionResponse::invalid(err.to_string()).into_review())
        }
    };
    let response = AdmissionResponse::from(&request);

    let payload = json!({
        "request": &request,
        "object": &request.object,
        "oldObject": &request.old_object,
    });
    let request_bytes = match serde_json::to_vec(&payload) {
        Ok(bytes) => bytes,
        Err(err) => return deny_response(&response, err.to_string()),
    };

    let handler = match transport
        .invoke(request_bytes)
        .await
        .map_err(Error::from)
        .and_then(|bytes| serde_json::from_slice::<HandlerResponse>(&bytes).map_err(Error::from))
    {
        Ok(handler) => handler,
        Err(err) => return deny_response(&response, err.to_string()),
    };

    if !handler.allowed {
        return deny_response(&response, handler.message);
    }

    let Some(patch_value) = handler.patch else {
        return HttpResponse::Ok().json(response.into_review());
    };

    if let Some(key_path) = verification_key {
        let Some(signature) = handler.signature.as_deref() else {
            return deny_response(&response, "injector patch missing signature".to_owned());
        };
        let patch_bytes = match serde_json::to_vec(&patch_value) {
            Ok(bytes) => bytes,
            Err(err) => return deny_response(&response, err.to_string()),
        };
        if let Err(err) = injector::verify_patch(key_path, &patch_bytes, signature) {
            return deny_response(&response, err.to_string());
        }
    }

    let patch: Patch = match serde_json::from_value(patch_value) {
        Ok(patch) => patch,
        Err(err) => return deny_response(&response, err.to_string()),
    };
    match response.clone().with_patch(patch) {
        Ok(patched) => HttpResponse::Ok().json(patched.into_review()),
        Err(err) => deny_response(&response, err.to_string()),
    }
}

#[post("/{group}/{version}/{plural}/validate")]
async fn validate_route(
    path: web::Path<(String, String, String)>,
    state: web::Data<AdmissionState>,
    body: web::Json<AdmissionReview<DynamicObject>>,
) -> impl Responder {
    let (group, version, plural) = path.into_inner();
    match state.get(&group, &version, &plural).and_then(|r| r.validator.as_deref()) {
        Some(transport) => respond(transport, None, body.into_inner()).await,
        None => HttpResponse::NotFound().finish(),
    }
}

#[post("/{group}/{version}/{plural}/mutate")]
async fn mutate_route(
    path: web::Path<(String, String, String)>,
    state: web::Data<AdmissionState>,
    body: web::Json<AdmissionReview<DynamicObject>>,
) -> impl Responder {
    let (group, version, plural) = path.into_inner();
    match state.get(&group, &version, &plural).and_then(|r| r.mutator.as_deref()) {
        Some(transport) => respond(transport, None, body.into_inner()).await,
        None => HttpResponse::NotFound().finish(),
    }
}

#[post("/{group}/{version}/{plural}/inject")]
async fn inject_route(
    path: web::Path<(String, String, String)>,
    state: web::Data<AdmissionState>,
    body: web::Json<AdmissionReview<DynamicObject>>,
) -> impl Responder {
    let (group, version, plural) = path.into_inner();
    match state.get(&group, &version, &plural).and_then(|r| r.injector.as_ref()) {
        Some((transport, key_path)) => respond(transport.as_ref(), Some(key_path), body.into_inner()).await,
        None => HttpResponse::NotFound().finish(),
    }
}

fn load_rustls_config(tls: &TlsConfig) -> Result<rustls::ServerConfig> {
    let mut cert_reader = BufReader::new(std::fs::File::open(&tls.cert_file)?);
    let mut key_reader = BufReader::new(std::fs::File::open(&tls.key_file)?);
    let cert_chain = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::Io)?;
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(Error::Io)?
        .ok_or_else(|| Error::InvalidKey("no private key in webhook tls.keyFile".into()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::InvalidKey(e.to_string()))
}

/// Runs the admission server until it is shut down, serving every handler
/// configured in `config.handlers`.
pub async fn serve(config: WebhookConfig) -> Result<()> {
    let state = web::Data::new(AdmissionState::build(&config)?);
    let tls_config = load_rustls_config(&config.tls)?;

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(validate_route)
            .service(mutate_route)
            .service(inject_route)
    })
    .bind_rustls_0_23((config.host.as_str(), config.port), tls_config)
    .map_err(Error::Io)?
    .run()
    .await
    .map_err(Error::Io)?;
    Ok(())
}
