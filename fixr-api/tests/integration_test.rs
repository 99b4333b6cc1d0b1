use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use fixr_api::middleware::auth::{issue_token, Role};
use fixr_api::{app, state::AuthConfig, AppState};
use fixr_core::repository::{CatalogRepository, TechnicianRepository};
use fixr_core::{Clock, ManualClock, OtpDelivery, OtpRecord, ServiceOffering, Technician};
use fixr_dispatch::{BookingEngine, EngineRules, SandboxGateway};
use fixr_store::{EventBus, InMemoryStore};

const SECRET: &str = "test-secret";

#[derive(Default)]
struct CapturingDelivery {
    sent: Mutex<Vec<OtpRecord>>,
}

#[async_trait]
impl OtpDelivery for CapturingDelivery {
    async fn deliver(&self, record: &OtpRecord) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.sent.lock().unwrap().push(record.clone());
        Ok(())
    }
}

struct TestApp {
    router: Router,
    store: InMemoryStore,
    gateway: Arc<SandboxGateway>,
    delivery: Arc<CapturingDelivery>,
    offering: ServiceOffering,
    customer: Uuid,
}

impl TestApp {
    async fn new(dev_tokens: bool) -> Self {
        let store = InMemoryStore::new();
        let events = EventBus::new();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).unwrap()));
        let gateway = Arc::new(SandboxGateway::new("rzp_test_key", "rzp_test_secret"));
        let delivery = Arc::new(CapturingDelivery::default());

        let offering = ServiceOffering {
            id: Uuid::new_v4(),
            name: "Deep cleaning".into(),
            price: 129_900,
            coin_cost: 20,
        };
        store.upsert_offering(&offering).await.unwrap();

        let engine = BookingEngine::new(
            Arc::new(store.clone()),
            Arc::new(events.clone()),
            clock as Arc<dyn Clock>,
            gateway.clone(),
            delivery.clone(),
            EngineRules::default(),
        );

        let state = AppState {
            engine,
            events,
            redis: None,
            requests_per_minute: 120,
            auth: AuthConfig { secret: SECRET.into(), expiration: 3600, dev_tokens },
            payment_key_id: "rzp_test_key".into(),
        };

        Self {
            router: app(state),
            store,
            gateway,
            delivery,
            offering,
            customer: Uuid::new_v4(),
        }
    }

    async fn technician(&self, coins: i64) -> Technician {
        let tech = Technician::new("tech", vec![self.offering.id], coins);
        self.store.upsert_technician(&tech).await.unwrap();
        tech
    }

    fn customer_token(&self) -> String {
        issue_token(SECRET, self.customer, Role::Customer, 3600).unwrap()
    }

    async fn send(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let req = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Order, pay and verify through HTTP. Returns the booking id.
    async fn paid_booking(&self) -> Uuid {
        let token = self.customer_token();
        let (status, order) = self
            .send(
                "POST",
                "/v1/payments/orders",
                Some(&token),
                Some(json!({
                    "sub_category_id": self.offering.id,
                    "date": "2030-01-02",
                    "time_slot": "10:00-12:00",
                    "location": null
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", order);
        assert_eq!(order["amount"], 129_900);
        assert_eq!(order["key_id"], "rzp_test_key");

        let gateway_order_id = order["gateway_order_id"].as_str().unwrap();
        let (status, verified) = self
            .send(
                "POST",
                "/v1/payments/verify",
                Some(&token),
                Some(json!({
                    "payment_id": order["payment_id"],
                    "gateway_order_id": gateway_order_id,
                    "gateway_payment_id": "pay_test",
                    "signature": self.gateway.sign(gateway_order_id, "pay_test"),
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", verified);
        assert_eq!(verified["authorized"], true);

        verified["booking_id"].as_str().unwrap().parse().unwrap()
    }
}

#[tokio::test]
async fn test_health_is_public() {
    let app = TestApp::new(false).await;
    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = TestApp::new(false).await;
    let (status, _) = app.send("GET", &format!("/v1/bookings/{}", Uuid::new_v4()), None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .send("GET", &format!("/v1/bookings/{}", Uuid::new_v4()), Some("not-a-jwt"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_precheck_without_technicians_is_unprocessable() {
    let app = TestApp::new(false).await;
    let token = app.customer_token();

    let (status, body) = app
        .send(
            "POST",
            "/v1/bookings/precheck",
            Some(&token),
            Some(json!({
                "sub_category_id": app.offering.id,
                "date": "2030-01-02",
                "time_slot": "10:00-12:00",
                "location": null
            })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "NO_TECHNICIANS_AVAILABLE");

    app.technician(50).await;
    let (status, body) = app
        .send(
            "POST",
            "/v1/bookings/precheck",
            Some(&token),
            Some(json!({
                "sub_category_id": app.offering.id,
                "date": "2030-01-02",
                "time_slot": "10:00-12:00",
                "location": null
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["candidates"], 1);
}

#[tokio::test]
async fn test_precheck_rejects_started_slot() {
    let app = TestApp::new(false).await;
    let token = app.customer_token();
    app.technician(50).await;

    // The test clock reads 2030-01-01 09:00
    for (date, slot) in [("2030-01-01", "08:00-10:00"), ("2029-12-31", "18:00-20:00")] {
        let (status, body) = app
            .send(
                "POST",
                "/v1/bookings/precheck",
                Some(&token),
                Some(json!({
                    "sub_category_id": app.offering.id,
                    "date": date,
                    "time_slot": slot,
                    "location": null
                })),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{}", body);
    }
}

#[tokio::test]
async fn test_checkout_and_accept_flow() {
    let app = TestApp::new(false).await;
    let tech = app.technician(50).await;
    let booking_id = app.paid_booking().await;

    let token = app.customer_token();
    let (status, booking) = app.send("GET", &format!("/v1/bookings/{}", booking_id), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(booking["status"], "PENDING");

    let tech_token = issue_token(SECRET, tech.id, Role::Technician, 3600).unwrap();
    let (status, accepted) = app
        .send("POST", &format!("/v1/bookings/{}/accept", booking_id), Some(&tech_token), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{}", accepted);
    assert_eq!(accepted["status"], "CONFIRMED");
    assert_eq!(accepted["balance"], 30);

    let (status, balance) = app.send("GET", "/v1/technicians/me/coins", Some(&tech_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(balance["balance"], 30);
}

#[tokio::test]
async fn test_insufficient_coins_points_to_top_up() {
    let app = TestApp::new(false).await;
    let tech = app.technician(5).await;
    let booking_id = app.paid_booking().await;

    let tech_token = issue_token(SECRET, tech.id, Role::Technician, 3600).unwrap();
    let (status, body) = app
        .send("POST", &format!("/v1/bookings/{}/accept", booking_id), Some(&tech_token), None)
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "INSUFFICIENT_COINS");
    assert_eq!(body["required"], 20);
    assert_eq!(body["available"], 5);
    assert_eq!(body["top_up_url"], "/v1/technicians/me/coins");

    let (status, topped) = app
        .send("POST", "/v1/technicians/me/coins", Some(&tech_token), Some(json!({ "amount": 40 })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(topped["balance"], 45);

    let (status, _) = app
        .send("POST", &format!("/v1/bookings/{}/accept", booking_id), Some(&tech_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_second_acceptance_conflicts() {
    let app = TestApp::new(false).await;
    let first = app.technician(50).await;
    let second = app.technician(50).await;
    let booking_id = app.paid_booking().await;

    let first_token = issue_token(SECRET, first.id, Role::Technician, 3600).unwrap();
    let second_token = issue_token(SECRET, second.id, Role::Technician, 3600).unwrap();

    let (status, _) = app
        .send("POST", &format!("/v1/bookings/{}/accept", booking_id), Some(&first_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .send("POST", &format!("/v1/bookings/{}/accept", booking_id), Some(&second_token), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "BOOKING_NOT_PENDING");

    let loser = app.store.get_technician(second.id).await.unwrap().unwrap();
    assert_eq!(loser.coins, 50);
}

#[tokio::test]
async fn test_otp_flow_over_http() {
    let app = TestApp::new(false).await;
    let tech = app.technician(50).await;
    let booking_id = app.paid_booking().await;
    let tech_token = issue_token(SECRET, tech.id, Role::Technician, 3600).unwrap();
    let customer_token = app.customer_token();

    app.send("POST", &format!("/v1/bookings/{}/accept", booking_id), Some(&tech_token), None)
        .await;

    // Customers cannot issue codes
    let (status, _) = app
        .send("POST", &format!("/v1/bookings/{}/otp/arrival", booking_id), Some(&customer_token), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, issued) = app
        .send("POST", &format!("/v1/bookings/{}/otp/arrival", booking_id), Some(&tech_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(issued["purpose"], "arrival");

    let (status, body) = app
        .send(
            "POST",
            &format!("/v1/bookings/{}/otp/arrival/verify", booking_id),
            Some(&customer_token),
            Some(json!({ "code": "12" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let code = app.delivery.sent.lock().unwrap().last().unwrap().code.clone();

    // The technician cannot confirm their own arrival
    let (status, _) = app
        .send(
            "POST",
            &format!("/v1/bookings/{}/otp/arrival/verify", booking_id),
            Some(&tech_token),
            Some(json!({ "code": code })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, started) = app
        .send(
            "POST",
            &format!("/v1/bookings/{}/otp/arrival/verify", booking_id),
            Some(&customer_token),
            Some(json!({ "code": code })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", started);
    assert_eq!(started["status"], "IN_PROGRESS");

    // The code is single use
    let (status, body) = app
        .send(
            "POST",
            &format!("/v1/bookings/{}/otp/arrival/verify", booking_id),
            Some(&customer_token),
            Some(json!({ "code": code })),
        )
        .await;
    assert!(status.is_client_error(), "{}", body);
}

#[tokio::test]
async fn test_auto_cancel_after_acceptance_is_benign() {
    let app = TestApp::new(false).await;
    let tech = app.technician(50).await;
    let booking_id = app.paid_booking().await;
    let tech_token = issue_token(SECRET, tech.id, Role::Technician, 3600).unwrap();
    let customer_token = app.customer_token();

    // Too early for a pending booking
    let (status, body) = app
        .send("POST", &format!("/v1/bookings/{}/auto-cancel", booking_id), Some(&customer_token), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CANCELLATION_WINDOW_NOT_ELAPSED");
    assert_eq!(body["remaining_seconds"], 600);

    app.send("POST", &format!("/v1/bookings/{}/accept", booking_id), Some(&tech_token), None)
        .await;

    let (status, body) = app
        .send("POST", &format!("/v1/bookings/{}/auto-cancel", booking_id), Some(&customer_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);
    assert_eq!(body["status"], "CONFIRMED");
    assert!(body["refund_id"].is_null());
}

#[tokio::test]
async fn test_roles_are_enforced() {
    let app = TestApp::new(false).await;
    let tech = app.technician(50).await;
    let tech_token = issue_token(SECRET, tech.id, Role::Technician, 3600).unwrap();
    let customer_token = app.customer_token();

    let (status, _) = app
        .send(
            "POST",
            "/v1/payments/orders",
            Some(&tech_token),
            Some(json!({
                "sub_category_id": app.offering.id,
                "date": "2030-01-02",
                "time_slot": "10:00-12:00"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .send(
            "PUT",
            &format!("/v1/admin/offerings/{}", Uuid::new_v4()),
            Some(&customer_token),
            Some(json!({ "name": "Plumbing", "price": 39_900, "coin_cost": 5 })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let booking_id = app.paid_booking().await;
    let (status, _) = app
        .send("POST", &format!("/v1/bookings/{}/reject", booking_id), Some(&customer_token), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Not a candidate or party
    let stranger = issue_token(SECRET, Uuid::new_v4(), Role::Customer, 3600).unwrap();
    let (status, _) = app.send("GET", &format!("/v1/bookings/{}", booking_id), Some(&stranger), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_dev_token_route_follows_config() {
    let disabled = TestApp::new(false).await;
    let (status, _) = disabled
        .send("POST", "/v1/auth/dev-token", None, Some(json!({ "role": "ADMIN" })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let enabled = TestApp::new(true).await;
    let (status, body) = enabled
        .send("POST", "/v1/auth/dev-token", None, Some(json!({ "role": "ADMIN" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap();

    let offering_id = Uuid::new_v4();
    let (status, _) = enabled
        .send(
            "PUT",
            &format!("/v1/admin/offerings/{}", offering_id),
            Some(token),
            Some(json!({ "name": "Plumbing", "price": 39_900, "coin_cost": 5 })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(enabled.store.get_offering(offering_id).await.unwrap().is_some());
}
