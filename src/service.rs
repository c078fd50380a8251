// ── LabService – the operation façade ────────────────────────────────────────
//
// Every remote operation runs as a blocking task on tokio's blocking pool,
// bounded by an explicit deadline.  A task that misses its deadline is
// abandoned; its session is cleaned up when the task eventually returns.

use crate::report::{OperationReport, ReportError};
use crate::transfer::{
    apply_sync, file_mode, plan_sync, Excludes, FilePair, SyncOptions, SyncSummary,
    TransferSummary, DEFAULT_FILE_MODE,
};
use futures::stream::{self, StreamExt};
use lablink_core::{ErrorKind, InventoryStore, LabConfig, LabError};
use lablink_credentials::{
    CredentialError, CredentialKind, CredentialLookup, CredentialStore, CredentialSummary,
    DeviceClassDefaults,
};
use lablink_identity::identity::{
    CacheEntry, CacheUpdate, CachedError, IdentityCache, IdentityProber, IdentityResolver,
    Identification, IpUpdate, Resolution, SshIdentityProbe, VerificationResult,
};
use lablink_ssh::ssh::{
    AccessError, AccessOutcome, AccessRequest, CommandOutput, Connector, DeviceAccess,
    FallbackChain, KeyAuthConfig, SessionTimeouts, Ssh2Connector, SshFailure,
};
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on sessions one operation may try to open (key, cached, default).
const CHAIN_ATTEMPTS: u32 = 3;
/// Commands one probe runs at most per attempt (hostname, four id reads, os-release).
const PROBE_COMMANDS: u32 = 6;

pub const DEFAULT_USERNAME: &str = "root";
pub const DEFAULT_PORT: u16 = 22;

type AccessResult<T> = Result<AccessOutcome<T>, AccessError>;

async fn run_blocking<T, F>(limit: Duration, task: F) -> Result<T, LabError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LabError> + Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(task)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(LabError::Internal(format!("worker task failed: {}", join))),
        Err(_) => Err(LabError::Timeout(format!(
            "operation did not finish within {}s",
            limit.as_secs()
        ))),
    }
}

fn access_request(target: &Resolution) -> AccessRequest {
    AccessRequest {
        device_id: Some(target.device_id.clone()),
        ip: target.ip.clone(),
        port: target.port,
        username: target.username.clone(),
        device_class: target.device_class.clone(),
    }
}

/// Remember that an address could not be reached.  Established identity
/// facts survive; only the error is recorded.
fn record_unreachable(cache: &IdentityCache, ip: &str, failure: &SshFailure) {
    let update = CacheUpdate::error(CachedError {
        kind: failure.kind,
        message: failure.message.clone(),
    });
    if let Err(e) = cache.merge(ip, update) {
        log::warn!("Could not record failure for {} in cache: {}", ip, e);
    }
}

fn local_mode(path: &std::path::Path) -> i32 {
    std::fs::metadata(path)
        .map(|m| file_mode(&m))
        .unwrap_or(DEFAULT_FILE_MODE)
}

fn verification_error(verification: &VerificationResult) -> Option<ReportError> {
    match &verification.error {
        Some(e) => Some(ReportError {
            kind: e.kind.into(),
            message: e.message.clone(),
        }),
        None if !verification.verified => Some(ReportError {
            kind: ErrorKind::VerificationFailed,
            message: format!(
                "{} at {} did not match (hostname {}, unique id {})",
                verification.device_id,
                verification.ip_checked,
                verification.actual_hostname.as_deref().unwrap_or("<unknown>"),
                verification.actual_unique_id.as_deref().unwrap_or("<unknown>")
            ),
        }),
        None => None,
    }
}

pub struct LabService {
    config: LabConfig,
    credentials: Arc<CredentialStore>,
    resolver: Arc<IdentityResolver>,
    access: Arc<DeviceAccess>,
}

impl LabService {
    /// Build the service over real SSH.
    pub fn new(config: LabConfig) -> Result<Self, LabError> {
        let connector = Arc::new(Ssh2Connector::new(KeyAuthConfig {
            use_agent: config.use_agent,
            key_files: config.key_files(),
        }));
        Self::with_connector(config, connector)
    }

    /// Build the service over any transport.
    pub fn with_connector(config: LabConfig, connector: Arc<dyn Connector>) -> Result<Self, LabError> {
        let inventory = Arc::new(InventoryStore::open(config.inventory_path.clone())?);
        let credentials = Arc::new(CredentialStore::open(config.credentials_path.clone()));
        let cache = Arc::new(IdentityCache::new(config.cache_file(), config.cache_ttl()));

        let lookup: Arc<dyn CredentialLookup> = credentials.clone();
        let chain = Arc::new(FallbackChain::new(
            Arc::clone(&lookup),
            DeviceClassDefaults::from_config(&config.default_credentials),
        ));
        let prober: Arc<dyn IdentityProber> = Arc::new(SshIdentityProbe::new(
            Arc::clone(&connector),
            Arc::clone(&chain),
            config.timeouts.probe_connect(),
            config.timeouts.probe_command(),
            config.probe_retries,
        ));
        let resolver = Arc::new(IdentityResolver::new(inventory, cache, prober, lookup));
        let access = Arc::new(DeviceAccess::new(
            connector,
            chain,
            SessionTimeouts::new(config.timeouts.connect()),
        ));

        log::info!(
            "LabLink ready (inventory {}, cache {})",
            config.inventory_path.display(),
            config.cache_file().display()
        );
        Ok(Self {
            config,
            credentials,
            resolver,
            access,
        })
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Deadline for an operation that first has to get a session.
    fn budget(&self, op: Duration) -> Duration {
        op + self.config.timeouts.connect() * CHAIN_ATTEMPTS
    }

    fn probe_budget(&self) -> Duration {
        let t = &self.config.timeouts;
        t.probe_connect() * CHAIN_ATTEMPTS
            + t.probe_command() * PROBE_COMMANDS * (self.config.probe_retries + 1)
    }

    pub async fn resolve(&self, reference: &str) -> Result<Resolution, LabError> {
        let resolver = Arc::clone(&self.resolver);
        let reference = reference.to_string();
        run_blocking(self.config.timeouts.exec(), move || resolver.resolve(&reference)).await
    }

    async fn on_device<T, F>(&self, target: &Resolution, limit: Duration, task: F) -> OperationReport<T>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceAccess, &AccessRequest) -> Result<AccessResult<T>, LabError> + Send + 'static,
    {
        let access = Arc::clone(&self.access);
        let resolver = Arc::clone(&self.resolver);
        let request = access_request(target);
        let report = OperationReport::for_target(target);

        let outcome = run_blocking(self.budget(limit), move || {
            let result = task(access.as_ref(), &request)?;
            if let Err(err) = &result {
                if err.mode.is_none() {
                    record_unreachable(resolver.cache(), &request.ip, &err.failure);
                }
            }
            Ok(result)
        })
        .await;

        match outcome {
            Ok(result) => report.from_access(result),
            Err(err) => report.fail(&err),
        }
    }

    // ── Remote operations ───────────────────────────────────────────────

    /// Run `command` on the device. `success` mirrors the exit status; the
    /// output is returned either way.
    pub async fn ssh_exec(
        &self,
        reference: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> OperationReport<CommandOutput> {
        let target = match self.resolve(reference).await {
            Ok(t) => t,
            Err(e) => return OperationReport::new(Some(reference.to_string()), None, None).fail(&e),
        };
        let limit = timeout.unwrap_or_else(|| self.config.timeouts.exec());
        let command = command.to_string();

        log::info!("exec on {} ({}): {}", target.device_id, target.ip, command);
        let mut report = self
            .on_device(&target, limit, move |access, request| {
                Ok(access.with_session(request, |session| session.exec(&command, limit)))
            })
            .await;
        if let Some(output) = &report.data {
            report.success = output.success();
        }
        report
    }

    async fn upload_file(
        &self,
        target: &Resolution,
        local: PathBuf,
        remote: String,
        mode: Option<i32>,
    ) -> OperationReport<TransferSummary> {
        if !local.is_file() {
            let err = LabError::InvalidRequest(format!("'{}' is not a file", local.display()));
            return OperationReport::for_target(target).fail(&err);
        }
        let limit = self.config.timeouts.transfer();
        let mode = mode.unwrap_or_else(|| local_mode(&local));
        let transfer_id = Uuid::new_v4().to_string();

        self.on_device(target, limit, move |access, request| {
            Ok(access.with_session(request, |session| {
                let bytes = session.upload(&local, &remote, mode, limit)?;
                log::info!("[{}] pushed {} -> {} ({} bytes)", transfer_id, local.display(), remote, bytes);
                Ok(TransferSummary {
                    transfer_id: transfer_id.clone(),
                    local: local.clone(),
                    remote: remote.clone(),
                    bytes,
                })
            }))
        })
        .await
    }

    pub async fn copy_to_device(
        &self,
        reference: &str,
        local: PathBuf,
        remote: &str,
        mode: Option<i32>,
    ) -> OperationReport<TransferSummary> {
        match self.resolve(reference).await {
            Ok(target) => self.upload_file(&target, local, remote.to_string(), mode).await,
            Err(e) => OperationReport::new(Some(reference.to_string()), None, None).fail(&e),
        }
    }

    pub async fn copy_from_device(
        &self,
        reference: &str,
        remote: &str,
        local: PathBuf,
    ) -> OperationReport<TransferSummary> {
        let target = match self.resolve(reference).await {
            Ok(t) => t,
            Err(e) => return OperationReport::new(Some(reference.to_string()), None, None).fail(&e),
        };
        let limit = self.config.timeouts.transfer();
        let remote = remote.to_string();
        let transfer_id = Uuid::new_v4().to_string();

        self.on_device(&target, limit, move |access, request| {
            if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Ok(access.with_session(request, |session| {
                let bytes = session.download(&remote, &local, limit)?;
                log::info!("[{}] pulled {} -> {} ({} bytes)", transfer_id, remote, local.display(), bytes);
                Ok(TransferSummary {
                    transfer_id: transfer_id.clone(),
                    local: local.clone(),
                    remote: remote.clone(),
                    bytes,
                })
            }))
        })
        .await
    }

    /// Push several files, at most `concurrency` at a time. Reports keep the
    /// order of `files`.
    pub async fn copy_files_parallel(
        &self,
        reference: &str,
        files: Vec<FilePair>,
        concurrency: Option<usize>,
    ) -> Vec<OperationReport<TransferSummary>> {
        let target = match self.resolve(reference).await {
            Ok(t) => t,
            Err(e) => {
                return files
                    .iter()
                    .map(|_| OperationReport::new(Some(reference.to_string()), None, None).fail(&e))
                    .collect()
            }
        };
        let width = self.config.concurrency(concurrency);
        let target = &target;

        stream::iter(files)
            .map(|pair| self.upload_file(target, pair.local, pair.remote, None))
            .buffered(width)
            .collect()
            .await
    }

    /// Mirror a local directory to the device over one session.
    pub async fn sync_directory(
        &self,
        reference: &str,
        local_dir: PathBuf,
        remote_dir: &str,
        options: SyncOptions,
    ) -> OperationReport<SyncSummary> {
        let target = match self.resolve(reference).await {
            Ok(t) => t,
            Err(e) => return OperationReport::new(Some(reference.to_string()), None, None).fail(&e),
        };
        let limit = self.config.timeouts.sync();
        let remote_dir = remote_dir.to_string();
        let transfer_id = Uuid::new_v4().to_string();

        self.on_device(&target, limit, move |access, request| {
            let excludes = Excludes::compile(&options.exclude)?;
            let plan = plan_sync(&local_dir, &excludes)?;
            log::info!(
                "[{}] syncing {} file(s), {} bytes: {} -> {}:{}",
                transfer_id,
                plan.files.len(),
                plan.total_bytes(),
                local_dir.display(),
                request.ip,
                remote_dir
            );
            Ok(access.with_session(request, |session| {
                let mut summary = apply_sync(session, &plan, &remote_dir, &options, &excludes, limit)?;
                summary.transfer_id = transfer_id.clone();
                Ok(summary)
            }))
        })
        .await
    }

    // ── Identity ────────────────────────────────────────────────────────

    /// Probe `ip` and match it against the inventory. With `use_cache` a
    /// fresh cache entry answers without touching the network.
    pub async fn identify(
        &self,
        ip: &str,
        username: Option<&str>,
        port: Option<u16>,
        use_cache: bool,
    ) -> OperationReport<Identification> {
        let resolver = Arc::clone(&self.resolver);
        let ip_owned = ip.to_string();
        let username = username.unwrap_or(DEFAULT_USERNAME).to_string();
        let user = username.clone();
        let port = port.unwrap_or(DEFAULT_PORT);

        let result = run_blocking(self.probe_budget(), move || {
            if use_cache {
                resolver.identify_cached(&ip_owned, &user, port)
            } else {
                resolver.identify(&ip_owned, &user, port)
            }
        })
        .await;

        let report = OperationReport::new(None, Some(ip.to_string()), Some(username));
        match result {
            Ok(identification) => {
                let mut report = OperationReport {
                    device_id: identification.resolved_device_id.clone(),
                    ..report
                };
                if let Some(error) = &identification.error {
                    report.error = Some(ReportError {
                        kind: error.kind.into(),
                        message: error.message.clone(),
                    });
                    report.data = Some(identification);
                    report
                } else {
                    report.succeed(identification)
                }
            }
            Err(e) => report.fail(&e),
        }
    }

    pub async fn identify_many(
        &self,
        ips: Vec<String>,
        username: Option<&str>,
        port: Option<u16>,
        use_cache: bool,
        concurrency: Option<usize>,
    ) -> Vec<OperationReport<Identification>> {
        let width = self.config.concurrency(concurrency);
        stream::iter(ips)
            .map(|ip| async move { self.identify(&ip, username, port, use_cache).await })
            .buffered(width)
            .collect()
            .await
    }

    pub async fn verify(&self, reference: &str, ip: Option<&str>) -> OperationReport<VerificationResult> {
        let resolver = Arc::clone(&self.resolver);
        let reference_owned = reference.to_string();
        let ip_owned = ip.map(str::to_string);

        let result = run_blocking(self.probe_budget(), move || {
            resolver.verify(&reference_owned, ip_owned.as_deref())
        })
        .await;

        match result {
            Ok(verification) => {
                let mut report = OperationReport::new(
                    Some(verification.device_id.clone()),
                    Some(verification.ip_checked.clone()),
                    Some(verification.username.clone()),
                );
                report.success = verification.verified;
                report.error = verification_error(&verification);
                report.data = Some(verification);
                report
            }
            Err(e) => OperationReport::new(Some(reference.to_string()), ip.map(str::to_string), None).fail(&e),
        }
    }

    /// Verify every inventory device at its current address.
    pub async fn verify_fleet(&self, concurrency: Option<usize>) -> Vec<OperationReport<VerificationResult>> {
        let width = self.config.concurrency(concurrency);
        let ids: Vec<String> = self
            .resolver
            .inventory()
            .snapshot()
            .devices()
            .map(|d| d.device_id.clone())
            .collect();
        log::info!("Verifying {} device(s), {} at a time", ids.len(), width);

        stream::iter(ids)
            .map(|id| async move { self.verify(&id, None).await })
            .buffered(width)
            .collect()
            .await
    }

    pub async fn update_ip_if_verified(&self, reference: &str, new_ip: &str) -> OperationReport<IpUpdate> {
        let resolver = Arc::clone(&self.resolver);
        let reference_owned = reference.to_string();
        let ip_owned = new_ip.to_string();

        let result = run_blocking(self.probe_budget(), move || {
            resolver.update_ip_if_verified(&reference_owned, &ip_owned)
        })
        .await;

        match result {
            Ok(update) => {
                let mut report = OperationReport::new(
                    Some(update.device_id.clone()),
                    Some(update.new_ip.clone()),
                    Some(update.verification.username.clone()),
                );
                report.success = update.success;
                if !update.success {
                    report.error = verification_error(&update.verification);
                }
                report.data = Some(update);
                report
            }
            Err(e) => OperationReport::new(Some(reference.to_string()), Some(new_ip.to_string()), None).fail(&e),
        }
    }

    // ── Cache administration ────────────────────────────────────────────

    pub fn cache_lookup(&self, ip: &str) -> Option<CacheEntry> {
        self.resolver.cache().get(ip)
    }

    pub fn cache_entries(&self) -> Vec<CacheEntry> {
        self.resolver.cache().entries()
    }

    pub fn cache_rename(&self, ip: &str, friendly_name: &str) -> Result<bool, LabError> {
        self.resolver.cache().update_friendly_name(ip, friendly_name)
    }

    pub fn cache_clear(&self) -> Result<usize, LabError> {
        self.resolver.cache().clear()
    }

    // ── Credentials ─────────────────────────────────────────────────────

    pub fn cache_credential(
        &self,
        reference: &str,
        username: &str,
        password: Option<String>,
        kind: CredentialKind,
    ) -> Result<(), CredentialError> {
        let secret = password.map(SecretString::new);
        self.credentials
            .cache_credential(reference, username, secret.as_ref(), kind)
    }

    pub fn remove_credential(&self, reference: &str, kind: CredentialKind) -> Result<bool, CredentialError> {
        self.credentials.remove_credential(reference, kind)
    }

    pub fn list_credentials(&self) -> Vec<CredentialSummary> {
        self.credentials.list()
    }

    // ── Pool ────────────────────────────────────────────────────────────

    pub fn open_sessions(&self) -> usize {
        self.access.pool().len()
    }

    /// Close every pooled session.
    pub fn shutdown(&self) -> usize {
        self.access.pool().shutdown()
    }
}
