//! Payment gateway clients.
//!
//! The lifecycle worker only talks to the [`PaymentGateway`] trait.
//! [`HttpGateway`] calls a real gateway over HTTP; [`SimulatedGateway`]
//! resolves payments from a configurable probability policy and is meant for
//! local runs and demos.

use super::model::{Payment, PaymentStatus};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a gateway client.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request could not be sent or the response body not read.
    #[error("gateway request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The gateway answered with a non-success status code.
    #[error("gateway returned HTTP {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        message: String,
    },

    /// The gateway answered with something we do not understand.
    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

/// The external system that actually settles payments.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Asks the gateway for the current status of a pending payment.
    async fn check_status(&self, payment: &Payment) -> Result<PaymentStatus, GatewayError>;

    /// Asks the gateway to settle a payment. Returns whether it succeeded.
    async fn process(&self, payment: &Payment) -> Result<bool, GatewayError>;
}

/// Probabilities used by [`SimulatedGateway`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationPolicy {
    /// Payments younger than this always stay pending.
    pub age_threshold: Duration,
    /// Chance that an old enough payment completes on a status check.
    pub complete_probability: f64,
    /// Chance that an old enough payment fails on a status check.
    pub fail_probability: f64,
    /// Chance that processing a payment succeeds.
    pub process_success_probability: f64,
}

impl Default for SimulationPolicy {
    fn default() -> Self {
        Self {
            age_threshold: Duration::from_secs(120),
            complete_probability: 0.8,
            fail_probability: 0.1,
            process_success_probability: 0.9,
        }
    }
}

impl SimulationPolicy {
    /// Checks that all probabilities are within `[0, 1]` and that completing
    /// and failing together do not exceed certainty.
    pub fn validate(&self) -> Result<(), String> {
        let probabilities = [
            ("complete_probability", self.complete_probability),
            ("fail_probability", self.fail_probability),
            ("process_success_probability", self.process_success_probability),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{name} must be between 0 and 1, got {value}"));
            }
        }
        if self.complete_probability + self.fail_probability > 1.0 {
            return Err(format!(
                "complete_probability + fail_probability must not exceed 1, got {}",
                self.complete_probability + self.fail_probability
            ));
        }
        Ok(())
    }

    /// Resolves a status check for a payment of the given age.
    ///
    /// `roll` is a uniform sample from `[0, 1)`.
    pub fn resolve_status(&self, age: Duration, roll: f64) -> PaymentStatus {
        if age <= self.age_threshold {
            return PaymentStatus::Pending;
        }
        if roll < self.complete_probability {
            PaymentStatus::Completed
        } else if roll < self.complete_probability + self.fail_probability {
            PaymentStatus::Failed
        } else {
            PaymentStatus::Pending
        }
    }

    /// Resolves a processing attempt. `roll` is a uniform sample from `[0, 1)`.
    pub fn resolve_processing(&self, roll: f64) -> bool {
        roll < self.process_success_probability
    }
}

/// Gateway stand-in that settles payments at random.
#[derive(Debug, Clone, Default)]
pub struct SimulatedGateway {
    policy: SimulationPolicy,
}

impl SimulatedGateway {
    /// Creates a simulated gateway following `policy`.
    pub fn new(policy: SimulationPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn check_status(&self, payment: &Payment) -> Result<PaymentStatus, GatewayError> {
        // A creation time in the future counts as age zero
        let age = (Utc::now() - payment.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let roll = rand::thread_rng().gen_range(0.0..1.0);
        Ok(self.policy.resolve_status(age, roll))
    }

    async fn process(&self, _payment: &Payment) -> Result<bool, GatewayError> {
        let roll = rand::thread_rng().gen_range(0.0..1.0);
        Ok(self.policy.resolve_processing(roll))
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ProcessResponse {
    success: bool,
}

/// Gateway client speaking JSON over HTTP.
///
/// - `GET {base_url}/payments/{id}/status` → `{"status": "completed"}`
/// - `POST {base_url}/payments/{id}/process` → `{"success": true}`
#[derive(Debug, Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    /// Creates a client for the gateway at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Server {
                status: status.as_u16(),
                message,
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn check_status(&self, payment: &Payment) -> Result<PaymentStatus, GatewayError> {
        let url = format!("{}/payments/{}/status", self.base_url, payment.id);
        let response = self.http.get(&url).send().await?;
        let body: StatusResponse = Self::read_json(response).await?;
        body.status
            .parse()
            .map_err(|_| GatewayError::Decode(format!("unknown status {:?}", body.status)))
    }

    async fn process(&self, payment: &Payment) -> Result<bool, GatewayError> {
        let url = format!("{}/payments/{}/process", self.base_url, payment.id);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "amount": payment.amount,
                "currency": payment.currency,
            }))
            .send()
            .await?;
        let body: ProcessResponse = Self::read_json(response).await?;
        Ok(body.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: Duration = Duration::from_secs(180);
    const YOUNG: Duration = Duration::from_secs(30);

    #[test]
    fn young_payments_stay_pending() {
        let policy = SimulationPolicy::default();
        for roll in [0.0, 0.5, 0.85, 0.95, 0.999] {
            assert_eq!(policy.resolve_status(YOUNG, roll), PaymentStatus::Pending);
        }
        assert_eq!(
            policy.resolve_status(policy.age_threshold, 0.0),
            PaymentStatus::Pending
        );
    }

    #[test]
    fn old_payments_follow_the_split() {
        let policy = SimulationPolicy::default();
        assert_eq!(policy.resolve_status(OLD, 0.0), PaymentStatus::Completed);
        assert_eq!(policy.resolve_status(OLD, 0.79), PaymentStatus::Completed);
        assert_eq!(policy.resolve_status(OLD, 0.8), PaymentStatus::Failed);
        assert_eq!(policy.resolve_status(OLD, 0.89), PaymentStatus::Failed);
        assert_eq!(policy.resolve_status(OLD, 0.91), PaymentStatus::Pending);
        assert_eq!(policy.resolve_status(OLD, 0.99), PaymentStatus::Pending);
    }

    #[test]
    fn processing_success_rate() {
        let policy = SimulationPolicy::default();
        assert!(policy.resolve_processing(0.0));
        assert!(policy.resolve_processing(0.89));
        assert!(!policy.resolve_processing(0.9));
    }

    #[test]
    fn policy_validation() {
        assert!(SimulationPolicy::default().validate().is_ok());

        let too_likely = SimulationPolicy {
            complete_probability: 0.7,
            fail_probability: 0.4,
            ..SimulationPolicy::default()
        };
        assert!(too_likely.validate().is_err());

        let negative = SimulationPolicy {
            process_success_probability: -0.1,
            ..SimulationPolicy::default()
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn http_gateway_trims_trailing_slash() {
        let gateway = HttpGateway::new("http://gateway.local/", Duration::from_secs(5)).unwrap();
        assert_eq!(gateway.base_url, "http://gateway.local");
    }

    mod http {
        use super::*;
        use claims::{assert_matches, assert_ok_eq};
        use rust_decimal::Decimal;
        use std::sync::{Arc, Mutex};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        type Requests = Arc<Mutex<Vec<String>>>;

        /// Answers every request with `status` and `body`, and records each
        /// request as `<request line> <body>`.
        async fn canned_gateway(status: u16, body: &'static str) -> (HttpGateway, Requests) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}/", listener.local_addr().unwrap());
            let requests = Requests::default();

            let seen = requests.clone();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let request = read_request(&mut socket).await;
                    seen.lock().unwrap().push(request);

                    let response = format!(
                        "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            });

            let gateway = HttpGateway::new(base_url, Duration::from_secs(5)).unwrap();
            (gateway, requests)
        }

        async fn read_request(socket: &mut TcpStream) -> String {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];

            let head_end = loop {
                if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break end;
                }
                let n = socket.read(&mut chunk).await.unwrap();
                assert_ne!(n, 0, "connection closed before the request headers ended");
                buf.extend_from_slice(&chunk[..n]);
            };

            let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
            let content_length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);

            while buf.len() < head_end + 4 + content_length {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            let request_line = head.lines().next().unwrap_or_default();
            let body = String::from_utf8_lossy(&buf[head_end + 4..]);
            format!("{request_line} {body}").trim_end().to_string()
        }

        fn payment(id: u64) -> Payment {
            let now = Utc::now();
            Payment {
                id,
                amount: Decimal::new(12550, 2),
                currency: "EUR".into(),
                status: PaymentStatus::Pending,
                description: "invoice 2024-118".into(),
                user_id: 7,
                created_at: now,
                updated_at: now,
            }
        }

        #[tokio::test]
        async fn status_is_read_from_the_response() {
            let (gateway, requests) = canned_gateway(200, r#"{"status":"completed"}"#).await;

            assert_ok_eq!(gateway.check_status(&payment(42)).await, PaymentStatus::Completed);
            assert_eq!(
                *requests.lock().unwrap(),
                vec!["GET /payments/42/status HTTP/1.1".to_string()]
            );
        }

        #[tokio::test]
        async fn unknown_statuses_are_decode_errors() {
            let (gateway, _) = canned_gateway(200, r#"{"status":"settled"}"#).await;

            let error = gateway.check_status(&payment(42)).await.unwrap_err();
            assert_matches!(&error, GatewayError::Decode(_));
            assert_eq!(
                error.to_string(),
                r#"unexpected gateway response: unknown status "settled""#
            );
        }

        #[tokio::test]
        async fn undecodable_bodies_are_decode_errors() {
            let (gateway, _) = canned_gateway(200, "<html>ok</html>").await;
            assert_matches!(
                gateway.check_status(&payment(42)).await,
                Err(GatewayError::Decode(_))
            );

            let (gateway, _) = canned_gateway(200, r#"{"result":true}"#).await;
            assert_matches!(
                gateway.process(&payment(42)).await,
                Err(GatewayError::Decode(_))
            );
        }

        #[tokio::test]
        async fn error_statuses_are_server_errors() {
            let (gateway, _) = canned_gateway(503, "down").await;

            let error = gateway.check_status(&payment(42)).await.unwrap_err();
            assert_matches!(&error, GatewayError::Server { status: 503, .. });
            assert_eq!(error.to_string(), "gateway returned HTTP 503: down");

            let error = gateway.process(&payment(42)).await.unwrap_err();
            assert_matches!(&error, GatewayError::Server { status: 503, .. });
        }

        #[tokio::test]
        async fn declined_processing_is_not_an_error() {
            let (gateway, requests) = canned_gateway(200, r#"{"success":false}"#).await;

            assert_ok_eq!(gateway.process(&payment(9)).await, false);

            let requests = requests.lock().unwrap();
            assert_eq!(requests.len(), 1);
            assert!(requests[0].starts_with("POST /payments/9/process HTTP/1.1 "));
            assert!(requests[0].contains(r#""currency":"EUR""#));
        }

        #[tokio::test]
        async fn unreachable_gateways_are_network_errors() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            drop(listener);

            let gateway = HttpGateway::new(base_url, Duration::from_secs(5)).unwrap();
            assert_matches!(
                gateway.check_status(&payment(1)).await,
                Err(GatewayError::Network(_))
            );
        }
    }
}
