//! Status prober for PostgreSQL members using the tokio-postgres crate.
//!
//! Opens short-lived connections to a single member to check liveness and to
//! read its replication identity and position. Every probe is bounded by a
//! timeout and honors a cancellation token; connections are torn down on
//! every exit path.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_postgres::NoTls;
use tokio_postgres::types::PgLsn;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::types::{Lsn, ProbeError, ReplicationStatus};

/// Application name reported to the server for probe connections.
const APPLICATION_NAME: &str = "pgcluster-operator";

/// Configuration for connecting to members.
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Timeout for the queries issued once connected.
    pub query_timeout: Duration,
    /// Role used for the liveness ping.
    pub application_user: String,
    /// Database used for the liveness ping.
    pub application_database: String,
    /// Password of the application role.
    pub application_password: Option<String>,
    /// Privileged role used for status queries.
    pub superuser: String,
    /// Password of the privileged role.
    pub superuser_password: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
            application_user: "app".to_string(),
            application_database: "app".to_string(),
            application_password: None,
            superuser: "postgres".to_string(),
            superuser_password: None,
        }
    }
}

impl ProbeConfig {
    /// Build configuration from `PGCLUSTER_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        Self {
            connect_timeout: secs(
                "PGCLUSTER_PROBE_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
            query_timeout: secs("PGCLUSTER_PROBE_QUERY_TIMEOUT_SECS", defaults.query_timeout),
            application_user: std::env::var("PGCLUSTER_APP_USER")
                .unwrap_or(defaults.application_user),
            application_database: std::env::var("PGCLUSTER_APP_DATABASE")
                .unwrap_or(defaults.application_database),
            application_password: std::env::var("PGCLUSTER_APP_PASSWORD").ok(),
            superuser: std::env::var("PGCLUSTER_SUPERUSER").unwrap_or(defaults.superuser),
            superuser_password: std::env::var("PGCLUSTER_SUPERUSER_PASSWORD").ok(),
        }
    }

    /// Set connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set query timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Set the application role credentials.
    pub fn with_application(
        mut self,
        user: impl Into<String>,
        database: impl Into<String>,
        password: Option<String>,
    ) -> Self {
        self.application_user = user.into();
        self.application_database = database.into();
        self.application_password = password;
        self
    }

    /// Set the privileged role credentials.
    pub fn with_superuser(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.superuser = user.into();
        self.superuser_password = password;
        self
    }

    /// Upper bound for one whole probe.
    pub fn probe_deadline(&self) -> Duration {
        self.connect_timeout + self.query_timeout
    }
}

/// Network location of a member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Member (Pod) name.
    pub member_name: String,
    /// Host or IP, `None` while the member has no address.
    pub host: Option<String>,
    /// Engine port.
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(member_name: impl Into<String>, host: Option<String>, port: u16) -> Self {
        Self {
            member_name: member_name.into(),
            host,
            port,
        }
    }
}

/// Probing operations against a single member.
pub trait StatusProbe {
    /// Succeeds iff a trivial round trip over an application-role connection
    /// completes.
    fn check_reachable(
        &self,
        target: &ProbeTarget,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), ProbeError>> + Send;

    /// Read the member's system identifier, role, and (for followers) WAL
    /// positions over a privileged connection.
    fn read_status(
        &self,
        target: &ProbeTarget,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<ReplicationStatus, ProbeError>> + Send;
}

/// An open probe connection. The driver task is aborted when dropped so the
/// socket is released on every exit path.
struct ProbeConnection {
    client: tokio_postgres::Client,
    driver: JoinHandle<()>,
}

impl Drop for ProbeConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Prober backed by tokio-postgres.
#[derive(Clone, Debug, Default)]
pub struct InstanceProber {
    config: ProbeConfig,
}

impl InstanceProber {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    async fn connect(
        &self,
        target: &ProbeTarget,
        user: &str,
        database: &str,
        password: Option<&str>,
    ) -> Result<ProbeConnection, ProbeError> {
        let host = target
            .host
            .as_deref()
            .ok_or_else(|| ProbeError::MissingAddress(target.member_name.clone()))?;

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(host)
            .port(target.port)
            .user(user)
            .dbname(database)
            .application_name(APPLICATION_NAME)
            .connect_timeout(self.config.connect_timeout);
        if let Some(password) = password {
            pg_config.password(password);
        }

        let (client, connection) =
            pg_config
                .connect(NoTls)
                .await
                .map_err(|source| ProbeError::Connect {
                    member: target.member_name.clone(),
                    source,
                })?;

        let member = target.member_name.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(member = %member, error = %e, "Probe connection closed with error");
            }
        });

        Ok(ProbeConnection { client, driver })
    }

    /// Run a probe step under the probe deadline and the cancellation token.
    async fn bounded<T, F>(
        &self,
        target: &ProbeTarget,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<T, ProbeError>
    where
        F: Future<Output = Result<T, ProbeError>>,
    {
        let duration = self.config.probe_deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProbeError::Cancelled(target.member_name.clone())),
            result = tokio::time::timeout(duration, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(ProbeError::Timeout {
                    member: target.member_name.clone(),
                    duration,
                }),
            },
        }
    }

    async fn ping(&self, target: &ProbeTarget) -> Result<(), ProbeError> {
        let conn = self
            .connect(
                target,
                &self.config.application_user,
                &self.config.application_database,
                self.config.application_password.as_deref(),
            )
            .await?;

        conn.client
            .simple_query("SELECT 1")
            .await
            .map_err(|source| ProbeError::Query {
                member: target.member_name.clone(),
                source,
            })?;
        Ok(())
    }

    async fn query_status(&self, target: &ProbeTarget) -> Result<ReplicationStatus, ProbeError> {
        let conn = self
            .connect(
                target,
                &self.config.superuser,
                "postgres",
                self.config.superuser_password.as_deref(),
            )
            .await?;
        let query_err = |source| ProbeError::Query {
            member: target.member_name.clone(),
            source,
        };

        let row = conn
            .client
            .query_one("SELECT system_identifier FROM pg_control_system()", &[])
            .await
            .map_err(query_err)?;
        let system_id: i64 = row.try_get(0).map_err(query_err)?;

        let row = conn
            .client
            .query_one("SELECT NOT pg_is_in_recovery()", &[])
            .await
            .map_err(query_err)?;
        let is_primary: bool = row.try_get(0).map_err(query_err)?;

        if is_primary {
            return Ok(ReplicationStatus::primary(
                target.member_name.clone(),
                system_id.to_string(),
            ));
        }

        let row = conn
            .client
            .query_one(
                "SELECT pg_last_wal_receive_lsn(), pg_last_wal_replay_lsn()",
                &[],
            )
            .await
            .map_err(query_err)?;
        if row.len() != 2 {
            return Err(ProbeError::UnexpectedResult {
                member: target.member_name.clone(),
                message: format!("expected 2 WAL positions, got {} columns", row.len()),
            });
        }
        let received: Option<PgLsn> = row.try_get(0).map_err(query_err)?;
        let replayed: Option<PgLsn> = row.try_get(1).map_err(query_err)?;

        Ok(ReplicationStatus::follower(
            target.member_name.clone(),
            system_id.to_string(),
            received.map(Lsn::from),
            replayed.map(Lsn::from),
        ))
    }
}

impl StatusProbe for InstanceProber {
    #[instrument(skip(self, cancel), fields(member = %target.member_name))]
    async fn check_reachable(
        &self,
        target: &ProbeTarget,
        cancel: &CancellationToken,
    ) -> Result<(), ProbeError> {
        let result = self.bounded(target, cancel, self.ping(target)).await;
        if let Err(ref e) = result {
            debug!(error = %e, "Member not reachable");
        }
        result
    }

    #[instrument(skip(self, cancel), fields(member = %target.member_name))]
    async fn read_status(
        &self,
        target: &ProbeTarget,
        cancel: &CancellationToken,
    ) -> Result<ReplicationStatus, ProbeError> {
        let result = self.bounded(target, cancel, self.query_status(target)).await;
        match &result {
            Ok(status) => debug!(
                is_primary = status.is_primary,
                replay_lsn = ?status.replay_lsn.map(|l| l.to_string()),
                "Read member status"
            ),
            Err(e) => warn!(error = %e, "Failed to read member status"),
        }
        result
    }
}
