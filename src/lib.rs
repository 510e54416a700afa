pub mod api;
pub mod config;
pub mod crypto;
pub mod db;
pub mod ledger;
pub mod payments;
pub mod processor;
pub mod vision;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::api::rate_limit::RateLimiter;
use crate::crypto::SecretKey;
use crate::processor::Processor;
use crate::vision::DescriptionProvider;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub vision: Arc<dyn DescriptionProvider>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics_handle: Option<PrometheusHandle>,
    /// Key for API keys stored in settings, derived from `auth.encryption_key`
    pub encryption_key: Option<SecretKey>,
}

impl AppState {
    pub fn new(config: Config, db: DbPool, vision: Arc<dyn DescriptionProvider>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let encryption_key = crypto::optional_key(config.auth.encryption_key.as_deref());
        Self {
            config,
            db,
            vision,
            rate_limiter,
            metrics_handle: None,
            encryption_key,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn processor(&self) -> Processor {
        Processor::new(
            self.db.clone(),
            self.vision.clone(),
            self.config.uploads.clone(),
            self.config.credits.credits_per_image,
        )
    }
}

#[cfg(test)]
pub mod test_utils {
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::db::{insert_user, DbPool, NewUser, TransactionType, User, UserRole};
    use crate::ledger::Ledger;
    use crate::vision::{Description, DescriptionProvider, DescriptionSource, ImageInput, VisionError};

    /// Insert a user holding `credits`, granted as a bonus so the ledger agrees
    pub async fn create_test_user(pool: &DbPool, email: &str, credits: i64) -> User {
        create_user_with_role(pool, email, credits, UserRole::User).await
    }

    pub async fn create_user_with_role(pool: &DbPool, email: &str, credits: i64, role: UserRole) -> User {
        let mut tx = pool.begin().await.unwrap();
        let mut user = insert_user(
            &mut tx,
            &NewUser {
                email,
                password_hash: "not-a-real-hash",
                name: "Test User",
                role,
            },
        )
        .await
        .unwrap();
        if credits > 0 {
            let row = Ledger::new(&mut tx)
                .add(&user.id, credits, TransactionType::Bonus, Some("test grant"), None)
                .await
                .unwrap();
            user.credits = row.balance_after;
        }
        tx.commit().await.unwrap();
        user
    }

    /// Smallest byte string that passes as a 1x1 PNG: signature plus IHDR
    pub fn png_bytes() -> Vec<u8> {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(b"IHDR");
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&[8, 6, 0, 0, 0]);
        data.extend_from_slice(&[0x1f, 0x15, 0xc4, 0x89]);
        data
    }

    /// Provider double: succeeds unless the filename is scripted to fail,
    /// and tracks call count and peak concurrency.
    #[derive(Default)]
    pub struct ScriptedProvider {
        failing: HashSet<String>,
        delay: Option<Duration>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn always_ok() -> Self {
            Self::default()
        }

        pub fn failing_on(filenames: &[&str]) -> Self {
            Self {
                failing: filenames.iter().map(|f| f.to_string()).collect(),
                ..Self::default()
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DescriptionProvider for ScriptedProvider {
        async fn describe(&self, image: &ImageInput) -> Result<Description, VisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&image.filename) {
                return Err(VisionError::Api {
                    status: 500,
                    body: format!("scripted failure for {}", image.filename),
                });
            }
            Ok(Description {
                text: format!("Description of {}", image.filename),
                confidence: Some(0.9),
                source: DescriptionSource::Ideogram,
            })
        }
    }
}
