use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{body::Body, http::Request, response::Response};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{
    mock_db::{MockDb, MockSubscriptionHistory},
    mock_webhook_event_repository::MockWebhookEventRepository,
};
use crate::models::account::Account;
use crate::routes::auth::claims::Claims;
use crate::services::{smtp_mailer::MockMailer, stripe::MockStripeService};
use crate::state::AppState;
use crate::utils::jwt::{create_jwt, JwtKeyProvider, JwtKeys};

pub const WEBHOOK_SECRET: &str = "whsec_router";
const JWT_SECRET: &str = "0123456789abcdef0123456789abcdef";

pub struct TestApp {
    pub state: AppState,
    pub db: Arc<MockDb>,
    pub ledger: MockWebhookEventRepository,
    pub history: Arc<MockSubscriptionHistory>,
    pub stripe: MockStripeService,
    pub mailer: Arc<MockMailer>,
}

pub fn test_config(overrides: &[(&'static str, &'static str)]) -> Config {
    let mut vars: HashMap<&str, &str> = HashMap::from([
        ("DATABASE_URL", "postgres://localhost/billing_test"),
        ("FRONTEND_ORIGIN", "http://localhost:5173"),
        ("STRIPE_SECRET_KEY", "sk_test_router"),
        ("STRIPE_WEBHOOK_SECRET", WEBHOOK_SECRET),
        ("STRIPE_PRICE_ID", "price_router"),
        ("JWT_SECRET", JWT_SECRET),
    ]);
    vars.extend(overrides.iter().copied());
    Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
}

pub fn test_app_with(accounts: Vec<Account>, stripe: MockStripeService, config: Config) -> TestApp {
    let db = Arc::new(MockDb::with_accounts(accounts));
    let ledger = MockWebhookEventRepository::default();
    let history = Arc::new(MockSubscriptionHistory::default());
    let mailer = Arc::new(MockMailer::default());
    let state = AppState::assemble(
        config,
        JwtKeys::from_secret(JWT_SECRET).unwrap(),
        db.clone(),
        Arc::new(ledger.clone()),
        history.clone(),
        Arc::new(stripe.clone()),
        mailer.clone(),
    );
    TestApp {
        state,
        db,
        ledger,
        history,
        stripe,
        mailer,
    }
}

pub fn test_app(accounts: Vec<Account>) -> TestApp {
    test_app_with(accounts, MockStripeService::new(), test_config(&[]))
}

pub fn token_for(state: &AppState, account_id: Uuid) -> String {
    let claims = Claims {
        id: account_id.to_string(),
        email: "user@example.com".into(),
        exp: (SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600) as usize,
        iss: String::new(),
        aud: String::new(),
    };
    create_jwt(
        claims,
        state.jwt_keys(),
        state.jwt_issuer(),
        state.jwt_audience(),
    )
    .unwrap()
}

pub fn authed(method: &str, uri: &str, token: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(resp: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
