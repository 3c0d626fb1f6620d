use actix_web::{get, post, web, HttpRequest, HttpResponse};
use paygate::payment::is_valid_payment_id;
use paygate::{Payment, PaywallError};
use subtle::ConstantTimeEq;

use crate::metrics;
use crate::state::AppState;

fn lookup_response(
    route: &'static str,
    result: Result<Option<Payment>, PaywallError>,
) -> HttpResponse {
    match result {
        Ok(Some(payment)) => {
            metrics::API_REQUESTS.with_label_values(&[route, "found"]).inc();
            HttpResponse::Ok().json(payment)
        }
        Ok(None) => {
            metrics::API_REQUESTS.with_label_values(&[route, "not_found"]).inc();
            HttpResponse::NotFound().json(serde_json::json!({
                "error": "payment not found"
            }))
        }
        Err(e) => {
            metrics::API_REQUESTS.with_label_values(&[route, "error"]).inc();
            tracing::error!(error = %e, route, "payment lookup failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "lookup failed"
            }))
        }
    }
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let currencies: Vec<&str> = state.paywall.currencies().map(|c| c.code()).collect();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "paygate",
        "currencies": currencies,
        "monitor": state.monitor.state(),
    }))
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(token) = &state.metrics_token {
        let presented = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let authorized = match presented {
            Some(t) => bool::from(t.as_bytes().ct_eq(token)),
            None => {
                metrics::METRICS_AUTH_FAILURES.with_label_values(&["missing"]).inc();
                false
            }
        };
        if !authorized {
            if presented.is_some() {
                metrics::METRICS_AUTH_FAILURES.with_label_values(&["invalid"]).inc();
            }
            return HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "unauthorized",
                "message": "Valid Bearer token required for /metrics"
            }));
        }
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}

#[post("/payments")]
pub async fn create_payment(state: web::Data<AppState>) -> HttpResponse {
    let start = std::time::Instant::now();
    let result = state.paywall.create_payment().await;
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(payment) => {
            metrics::API_REQUESTS.with_label_values(&["create", "ok"]).inc();
            metrics::CREATE_LATENCY.with_label_values(&["ok"]).observe(elapsed);
            HttpResponse::Created().json(payment)
        }
        Err(e) => {
            metrics::API_REQUESTS.with_label_values(&["create", "error"]).inc();
            metrics::CREATE_LATENCY.with_label_values(&["error"]).observe(elapsed);
            tracing::error!(error = %e, "payment creation failed");
            let mut response = match e {
                PaywallError::Config(_) => HttpResponse::ServiceUnavailable(),
                _ => HttpResponse::InternalServerError(),
            };
            response.json(serde_json::json!({
                "error": "payment creation failed"
            }))
        }
    }
}

#[get("/payments/{id}")]
pub async fn get_payment(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    if !is_valid_payment_id(&id) {
        metrics::API_REQUESTS.with_label_values(&["get", "invalid"]).inc();
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "invalid payment id"
        }));
    }
    lookup_response("get", state.paywall.get_payment(&id))
}

#[get("/payments/by-address/{address}")]
pub async fn get_payment_by_address(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let address = path.into_inner();
    lookup_response("by_address", state.paywall.get_payment_by_address(&address))
}
